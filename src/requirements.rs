//! Environment requirements verified before any profiler starts.
//!
//! Each requirement kind is checked once per process; the result is
//! cached so composing many perf instances does not re-read procfs or
//! repeat the warnings.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use log::warn;

/// Smallest usable `kernel.perf_event_max_stack`; below this perf cannot
/// capture the stack depths the aggregator expects.
pub const MIN_PERF_EVENT_MAX_STACK: u64 = 1024;

static CHECK_CACHE: Mutex<Option<HashMap<&'static str, bool>>> = Mutex::new(None);

/// Value of `kernel.perf_event_max_stack` observed by the kernel-settings
/// check; drivers read it for `--max-stack`.
static PERF_EVENT_MAX_STACK: OnceLock<u64> = OnceLock::new();

pub fn perf_event_max_stack() -> u64 {
    PERF_EVENT_MAX_STACK
        .get()
        .copied()
        .unwrap_or(MIN_PERF_EVENT_MAX_STACK)
}

/// A precondition of running a profiler, identified by a stable kind tag.
pub trait Requirement {
    /// Stable tag identifying the requirement kind (memoization key).
    fn kind(&self) -> &'static str;

    /// Human-readable name for error reporting.
    fn name(&self) -> String;

    /// Perform the check unconditionally.
    fn check_uncached(&self) -> bool;

    /// Check with process-wide memoization: the first call per kind runs
    /// the check, later calls return the cached verdict.
    fn check(&self) -> bool {
        let mut cache = CHECK_CACHE.lock().unwrap();
        let map = cache.get_or_insert_with(HashMap::new);
        if let Some(&result) = map.get(self.kind()) {
            return result;
        }
        let result = self.check_uncached();
        map.insert(self.kind(), result);
        result
    }
}

#[cfg(test)]
pub fn reset_cache_for_tests() {
    *CHECK_CACHE.lock().unwrap() = None;
}

/// `kernel.perf_event_max_stack` must allow deep callchains.
pub struct PerfEventKernelSettings;

impl Requirement for PerfEventKernelSettings {
    fn kind(&self) -> &'static str {
        "perf_event_kernel_settings"
    }

    fn name(&self) -> String {
        "Adequate values of kernel.perf_event settings".to_string()
    }

    fn check_uncached(&self) -> bool {
        let raw = match std::fs::read_to_string("/proc/sys/kernel/perf_event_max_stack") {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Could not check the value of kernel.perf_event_max_stack: {}", e);
                return false;
            }
        };

        let value: u64 = match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("Unparseable kernel.perf_event_max_stack value {:?}", raw.trim());
                return false;
            }
        };

        if value < MIN_PERF_EVENT_MAX_STACK {
            warn!(
                "kernel.perf_event_max_stack is {} which is less than {}. Run \"sysctl \
                 kernel.perf_event_max_stack={}\" (or higher) before profiling.",
                value, MIN_PERF_EVENT_MAX_STACK, MIN_PERF_EVENT_MAX_STACK
            );
            return false;
        }

        let _ = PERF_EVENT_MAX_STACK.set(value);
        warn!(
            "Stacks with more than {} entries *will* be truncated in the results; raise \
             kernel.perf_event_max_stack to capture deeper stacks.",
            value
        );
        true
    }
}

/// NUMA balancing must not interfere with stack capture: with balancing
/// enabled, the process has to be memory-bound to a single NUMA node.
pub struct NumaMitigation;

impl NumaMitigation {
    fn membind_node_count() -> Option<usize> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let list = status
            .lines()
            .find_map(|line| line.strip_prefix("Mems_allowed_list:"))?
            .trim();
        Some(parse_node_list(list))
    }
}

/// Count nodes in a kernel cpulist-format string such as "0", "0-1", "0,2-3".
fn parse_node_list(list: &str) -> usize {
    let mut count = 0;
    for part in list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                count += hi.saturating_sub(lo) + 1;
            }
        } else if part.parse::<usize>().is_ok() {
            count += 1;
        }
    }
    count
}

impl Requirement for NumaMitigation {
    fn kind(&self) -> &'static str {
        "numa_mitigation"
    }

    fn name(&self) -> String {
        "NUMA balancing not interfering with profiling".to_string()
    }

    fn check_uncached(&self) -> bool {
        let balancing_path = Path::new("/proc/sys/kernel/numa_balancing");
        if !balancing_path.exists() {
            warn!(
                "kernel.numa_balancing does not exist, assuming no NUMA on this machine. \
                 If you actually have NUMA, you may get broken stacks!"
            );
            return true;
        }

        let balancing = match std::fs::read_to_string(balancing_path) {
            Ok(raw) => raw.trim().to_string(),
            Err(e) => {
                warn!("Could not check the value of kernel.numa_balancing: {}", e);
                return false;
            }
        };

        if balancing != "1" {
            return true;
        }

        match Self::membind_node_count() {
            Some(nodes) if nodes <= 1 => true,
            Some(_) => {
                warn!(
                    "NUMA balancing is enabled and this process is memory-bound to more than \
                     one NUMA node; this breaks captured stacks. Disable balancing with \
                     \"sysctl kernel.numa_balancing=0\" or bind memory to a single node \
                     (e.g. through numactl)."
                );
                false
            }
            None => {
                warn!(
                    "NUMA balancing is enabled and the NUMA membership of this process \
                     could not be determined; refusing to run with potentially broken \
                     stacks. Disable balancing with \"sysctl kernel.numa_balancing=0\"."
                );
                false
            }
        }
    }
}
