//! Callchain aggregation into the per-thread store views.
//!
//! Every accepted sample is folded into two views under
//! `<dest>/<pid>/<tid>/`:
//!
//! * `untimed/`: a tree keyed purely by frame names, order-independent.
//! * `timed/`: a forest of id-chained arrays preserving the arrival
//!   order of distinct callchains. Each node is a u64 array of child
//!   node ids; the most recently appended child is the "current tip".
//!   A sample extends the tip spine while names match, and branches a
//!   fresh id at the first divergence.
//!
//! Node counters: `hot_value`/`cold_value` accumulate `period` split by
//! on-CPU vs off-CPU, and `hot_<offset>`/`cold_<offset>` break the same
//! totals down per DSO offset seen at that frame.

use std::collections::HashMap;

use crate::store::{Array, Entry, Group};

/// One callchain frame: (symbol name, dso-offset string).
pub type CallFrame = (String, String);

/// Frame substituted when a sample arrives with an empty callchain.
pub const SYNTHETIC_FRAME: &str = "(just thread/process)";

/// Event name marking off-CPU samples.
pub const OFFCPU_EVENT: &str = "offcpu-time";

/// Event name of the on-CPU wall-time channel.
pub const ONCPU_EVENT: &str = "task-clock";

/// Folds samples into the store. One aggregator per dispatcher: the
/// dataset-id counters are scoped to the connection that owns it.
#[derive(Default)]
pub struct SampleAggregator {
    next_dataset_id: HashMap<(String, String), u64>,
}

impl SampleAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one accepted sample under `dest/<pid>/<tid>`.
    ///
    /// `period` must already be boundary-clamped by the caller; `time` and
    /// `profile_start` are only used for off-CPU interval attribution.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &mut self,
        dest: &Group,
        pid: &str,
        tid: &str,
        offcpu: bool,
        time: u64,
        period: u64,
        callchain: &[CallFrame],
        profile_start: u64,
    ) {
        let thread_dir = dest.child(pid).child(tid);

        let synthetic = [(SYNTHETIC_FRAME.to_string(), String::new())];
        let chain: &[CallFrame] = if callchain.is_empty() {
            &synthetic
        } else {
            callchain
        };

        if offcpu {
            // Interval start is relative to the profile start; a sample
            // straddling the start boundary is clamped to begin at 0.
            let elapsed = time.saturating_sub(profile_start);
            let entry = if elapsed < period {
                (0, elapsed)
            } else {
                (elapsed - period, period)
            };
            thread_dir.pair_array("offcpu").push(entry);
        }

        let key = if offcpu { "cold_value" } else { "hot_value" };
        let prefix = if offcpu { "cold_" } else { "hot_" };

        self.save_untimed(&thread_dir, key, prefix, period, chain);
        self.save_timed(&thread_dir, pid, tid, key, prefix, period, chain);

        thread_dir.add_u64("sampled_period", period);
    }

    fn save_untimed(
        &self,
        thread_dir: &Group,
        key: &str,
        prefix: &str,
        period: u64,
        chain: &[CallFrame],
    ) {
        let mut cur = thread_dir.child("untimed").child("all");
        cur.set_str("name", "all");
        cur.add_u64(key, period);

        for (name, offset) in chain {
            cur = cur.child(name);
            cur.set_str("name", name);
            cur.add_u64(key, period);
            cur.add_u64(&format!("{}{}", prefix, offset), period);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn save_timed(
        &mut self,
        thread_dir: &Group,
        pid: &str,
        tid: &str,
        key: &str,
        prefix: &str,
        period: u64,
        chain: &[CallFrame],
    ) {
        let root = thread_dir.child("timed");
        let all = root.u64_array("all");
        all.set_str("name", "all");
        all.add_u64(key, period);

        let mut cur = all;
        for (index, (name, offset)) in chain.iter().enumerate() {
            let last_block = index + 1 == chain.len();

            // Reuse the current tip only when its name matches and its
            // shape does: a terminal frame must land on a leaf, an
            // interior frame on a node that already has children. This
            // keeps a recorded stack's depth exact instead of merging a
            // leaf with a same-named interior node.
            let mut chosen: Option<Array<u64>> = None;
            if let Some(tip) = cur.last() {
                let candidate = root.u64_array(&tip.to_string());
                let name_matches = candidate.get_str("name").as_deref() == Some(name.as_str());
                let shape_matches = if last_block {
                    candidate.is_empty()
                } else {
                    !candidate.is_empty()
                };
                if name_matches && shape_matches {
                    chosen = Some(candidate);
                }
            }

            let child = match chosen {
                Some(candidate) => candidate,
                None => {
                    let id = self.next_id(pid, tid);
                    let fresh = root.u64_array(&id.to_string());
                    fresh.set_str("name", name);
                    cur.push(id);
                    fresh
                }
            };

            child.add_u64(key, period);
            child.add_u64(&format!("{}{}", prefix, offset), period);
            cur = child;
        }
    }

    fn next_id(&mut self, pid: &str, tid: &str) -> u64 {
        let counter = self
            .next_dataset_id
            .entry((pid.to_string(), tid.to_string()))
            .or_insert(0);
        let id = *counter;
        *counter += 1;
        id
    }
}
