//! Thread/process lineage reconstruction.
//!
//! The lineage profiler traces `fork`/`execve`/`exit` and streams two
//! message kinds: `syscall` (the callchain that spawned a new tid) and
//! `syscall_meta` (the fork/exec/exit transitions). The accumulator is
//! shared by the dispatchers of the lineage driver and finalized once by
//! the controller, after all streams have ended, into the `threads.json`
//! artifact.

use std::collections::{HashMap, HashSet};

use log::warn;
use serde::Serialize;

use crate::aggregator::CallFrame;

/// A `syscall_meta` transition, as decoded off the wire. `pid` and
/// `ret_value` are absent on transitions that do not carry them.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SyscallMeta {
    pub subtype: String,
    pub comm: String,
    #[serde(default)]
    pub pid: String,
    pub tid: String,
    pub time: u64,
    #[serde(default)]
    pub ret_value: String,
}

/// One finalized lineage node. `tag` is
/// (dominant comm, "pid/tid" label, start ns, duration ns or -1).
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LineageNode {
    pub identifier: String,
    pub tag: (String, String, u64, i64),
    pub parent: Option<String>,
}

/// The `threads.json` artifact.
#[derive(Debug, Serialize)]
pub struct ThreadTree {
    pub spawning_callchains: HashMap<String, Vec<CallFrame>>,
    pub tree: Vec<LineageNode>,
}

/// Incremental lineage state built from the syscall streams.
#[derive(Default)]
pub struct LineageAccum {
    /// tid -> callchain of the fork that spawned it.
    tid_dict: HashMap<String, Vec<CallFrame>>,
    /// tid -> parent tid ("" marks a root).
    tree: HashMap<String, String>,
    /// tid -> "pid/tid" label ("?/tid" until the thread reports itself).
    combo_dict: HashMap<String, String>,
    /// tid -> (comm, time) in observation order.
    name_time_dict: HashMap<String, Vec<(String, u64)>>,
    /// tid -> exit timestamp.
    exit_time_dict: HashMap<String, u64>,
    /// (time, tid) in arrival order; drives emission order.
    added_list: Vec<(u64, String)>,
    touched: bool,
}

impl LineageAccum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any lineage traffic was seen at all.
    pub fn touched(&self) -> bool {
        self.touched
    }

    /// `syscall` message: remember the callchain that spawned `tid`.
    pub fn record_spawn_callchain(&mut self, tid: String, callchain: Vec<CallFrame>) {
        self.touched = true;
        self.tid_dict.insert(tid, callchain);
    }

    /// `syscall_meta` message: apply one fork/exec/exit transition.
    pub fn record_meta(&mut self, meta: &SyscallMeta) {
        self.touched = true;

        let mut just_added = false;
        if !self.tree.contains_key(&meta.tid) {
            self.tree.insert(meta.tid.clone(), String::new());
            self.added_list.push((meta.time, meta.tid.clone()));
            self.name_time_dict
                .entry(meta.tid.clone())
                .or_default()
                .push((meta.comm.clone(), meta.time));
            just_added = true;
        }

        // A thread's own events upgrade its "?/tid" placeholder, but only
        // once the reporting pid is actually known.
        if !meta.pid.is_empty() {
            self.combo_dict
                .insert(meta.tid.clone(), format!("{}/{}", meta.pid, meta.tid));
        }

        match meta.subtype.as_str() {
            "new_proc" => {
                if !self.tree.contains_key(&meta.ret_value) {
                    self.added_list.push((meta.time, meta.ret_value.clone()));
                }
                self.tree
                    .insert(meta.ret_value.clone(), meta.tid.clone());
                self.combo_dict
                    .insert(meta.ret_value.clone(), format!("?/{}", meta.ret_value));
                self.name_time_dict
                    .entry(meta.ret_value.clone())
                    .or_default()
                    .push((meta.comm.clone(), meta.time));
            }
            "execve" => {
                if !just_added {
                    self.name_time_dict
                        .entry(meta.tid.clone())
                        .or_default()
                        .push((meta.comm.clone(), meta.time));
                }
            }
            "exit" => {
                self.exit_time_dict.insert(meta.tid.clone(), meta.time);
            }
            other => {
                log::debug!("ignoring unknown syscall_meta subtype {:?}", other);
            }
        }
    }

    /// The comm name a thread spent the longest stretch of its life under.
    fn dominant_name(&self, tid: &str) -> String {
        let names = &self.name_time_dict[tid];

        let mut dominant_index = 0;
        let mut dominant_span = 0;
        for i in 1..names.len() {
            let span = names[i].1.saturating_sub(names[i - 1].1);
            if span > dominant_span {
                dominant_index = i - 1;
                dominant_span = span;
            }
        }

        // The last name wins its comparison against the exit interval, and
        // wins outright when no exit was observed.
        match self.exit_time_dict.get(tid) {
            None => dominant_index = names.len() - 1,
            Some(&exit) => {
                if exit.saturating_sub(names[names.len() - 1].1) > dominant_span {
                    dominant_index = names.len() - 1;
                }
            }
        }

        names[dominant_index].0.clone()
    }

    /// Emit the tree in arrival order (parents before children), rebased
    /// to the profile start.
    pub fn finalize(&self, profile_start: u64) -> ThreadTree {
        let mut emitted: Vec<LineageNode> = Vec::new();
        let mut emitted_ids: HashSet<&str> = HashSet::new();

        for (_, tid) in &self.added_list {
            let parent = &self.tree[tid];
            if !parent.is_empty() && !emitted_ids.contains(parent.as_str()) {
                // Orphan: its parent never made it into the tree (message
                // ordering across streams), skip rather than emit out of
                // topological order.
                continue;
            }
            if !self.name_time_dict.contains_key(tid) {
                continue;
            }
            emitted_ids.insert(tid);

            let start_time = self.name_time_dict[tid][0].1;
            let duration = match self.exit_time_dict.get(tid) {
                Some(&exit) => {
                    let d = exit as i64 - start_time as i64;
                    if d < 0 {
                        warn!(
                            "thread {} exited at {} before its recorded start {}; \
                             clamping duration to 0",
                            tid, exit, start_time
                        );
                        0
                    } else {
                        d
                    }
                }
                None => -1,
            };

            let (start_time, duration) = rebase(start_time, duration, profile_start);

            emitted.push(LineageNode {
                identifier: tid.clone(),
                tag: (
                    self.dominant_name(tid),
                    self.combo_dict.get(tid).cloned().unwrap_or_default(),
                    start_time,
                    duration,
                ),
                parent: if parent.is_empty() {
                    None
                } else {
                    Some(parent.clone())
                },
            });
        }

        ThreadTree {
            spawning_callchains: self.tid_dict.clone(),
            tree: emitted,
        }
    }
}

/// Shift a lifetime interval so that the profile start becomes time 0.
/// Threads born before the start get start 0 and the pre-start part of
/// their duration cut off; the -1 "still running" sentinel is preserved.
fn rebase(start_time: u64, duration: i64, profile_start: u64) -> (u64, i64) {
    if start_time <= profile_start {
        let cut = (profile_start - start_time) as i64;
        let duration = if duration >= 0 {
            if duration < cut {
                warn!(
                    "thread lifetime ({} ns) ends before the profile start; clamping to 0",
                    duration
                );
                0
            } else {
                duration - cut
            }
        } else {
            duration
        };
        (0, duration)
    } else {
        (start_time - profile_start, duration)
    }
}
