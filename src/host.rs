//! The seam between the profiling module and whatever hosts it.
//!
//! An embedding host (or the bundled CLI runner) supplies scratch
//! directories, the target process, and the synchronization points
//! around the profiling window. Option values travel as a plain
//! [`RawOptions`](crate::module::RawOptions) struct; diagnostics go
//! through the `log` facade, which a host can back with its own sink.

use std::path::PathBuf;

/// Tag this module declares to its host.
pub const MODULE_TAG: &str = "compute";

/// Log category this module declares for its non-general diagnostics.
pub const LOG_CATEGORY: &str = "Non-general";

/// Services the host provides to the module for one profiling run.
pub trait Host: Send + Sync {
    /// Identifier of the node being profiled; used in artifact names.
    fn node_id(&self) -> String;

    /// Scratch directory for transient files (sockets, CARM output).
    fn tmp_dir(&self) -> PathBuf;

    /// Directory receiving this node's profiling artifacts.
    fn node_dir(&self) -> PathBuf;

    /// Directory for host-local configuration that outlives one run.
    fn local_config_dir(&self) -> PathBuf;

    /// Directory receiving subprocess log files.
    fn log_dir(&self) -> PathBuf;

    /// PID of the process to attach to.
    fn target_pid(&self) -> u32;

    /// CPU pin mask (see [`crate::cpu::CpuConfig`]); `None` uses all CPUs.
    fn cpu_mask(&self) -> Option<String>;

    /// Profilers are attached and the warmup has elapsed; the profiled
    /// workload may start.
    fn notify_profiling_live(&self);

    /// Block until the profiled workload is done.
    fn wait_profiling_complete(&self);

    /// Hand the resolved source file paths back to the host.
    fn report_source_paths(&self, paths: &[PathBuf]);
}

/// Kinds the declared options can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    UnsignedInt,
    Int,
    Bool,
    Str,
    StrList,
}

/// One declared module option: name, help text, type, default.
#[derive(Debug, Clone, Copy)]
pub struct OptionDecl {
    pub name: &'static str,
    pub help: &'static str,
    pub kind: OptionKind,
    pub default: &'static str,
}

/// The option table this module declares to its host.
pub const DECLARED_OPTIONS: &[OptionDecl] = &[
    OptionDecl {
        name: "buffer_size",
        help: "Internal communication buffer size in bytes (default: 1024)",
        kind: OptionKind::UnsignedInt,
        default: "1024",
    },
    OptionDecl {
        name: "warmup",
        help: "Warmup time in seconds between all profilers signalling their readiness \
               and starting the profiled program. Increase this value if you see missing \
               information after profiling. (default: 1)",
        kind: OptionKind::UnsignedInt,
        default: "1",
    },
    OptionDecl {
        name: "freq",
        help: "Sampling frequency per second for on-CPU time profiling (default: 10)",
        kind: OptionKind::UnsignedInt,
        default: "10",
    },
    OptionDecl {
        name: "buffer",
        help: "Buffer up to this number of events before sending data for processing \
               (1 effectively disables buffering) (default: 1)",
        kind: OptionKind::UnsignedInt,
        default: "1",
    },
    OptionDecl {
        name: "off_cpu_freq",
        help: "Sampling frequency per second for off-CPU time profiling (0 disables \
               off-CPU profiling, -1 captures *all* off-CPU events) (default: 1000)",
        kind: OptionKind::Int,
        default: "1000",
    },
    OptionDecl {
        name: "off_cpu_buffer",
        help: "Buffer up to this number of off-CPU events before sending data for \
               processing (0 leaves the default adaptive buffering, 1 effectively \
               disables buffering) (default: 0)",
        kind: OptionKind::UnsignedInt,
        default: "0",
    },
    OptionDecl {
        name: "events",
        help: "Extra perf events to be used for sampling with a given period (i.e. do a \
               sample on every PERIOD occurrences of an event and display the results \
               under the title TITLE with a unit UNIT). This option accepts a list of \
               strings of form \"EVENT,PERIOD,TITLE,UNIT\". Run \"perf list\" for the \
               list of possible values for EVENT.",
        kind: OptionKind::StrList,
        default: "",
    },
    OptionDecl {
        name: "filter",
        help: "Set stack trace filtering options. deny:<FILE> cuts all stack elements \
               matching a set of conditions specified in a given text file. allow:<FILE> \
               accepts only stack elements matching a set of conditions specified in a \
               given text file. python:<FILE> sends all stack trace elements to a given \
               Python script for filtering. Unless filter_mark is used, all filtered out \
               elements are deleted completely.",
        kind: OptionKind::Str,
        default: "",
    },
    OptionDecl {
        name: "filter_mark",
        help: "When filter is used, mark filtered out stack trace elements as \"(cut)\" \
               and squash any consecutive \"(cut)\"'s into one rather than deleting them \
               completely",
        kind: OptionKind::Bool,
        default: "false",
    },
    OptionDecl {
        name: "capture_mode",
        help: "Capture only kernel (\"kernel\"), only user (i.e. non-kernel, \"user\"), \
               or both stack trace types (\"both\") (default: \"user\")",
        kind: OptionKind::Str,
        default: "user",
    },
    OptionDecl {
        name: "perf_path",
        help: "Root of the perf installation (with bin/perf and the Perf-Trace-Util \
               python library underneath)",
        kind: OptionKind::Str,
        default: "",
    },
    OptionDecl {
        name: "perf_script_path",
        help: "Directory holding the perf-script event handler",
        kind: OptionKind::Str,
        default: "",
    },
    OptionDecl {
        name: "roofline",
        help: "Run also cache-aware roofline profiling with the specified sampling \
               frequency per second",
        kind: OptionKind::UnsignedInt,
        default: "0",
    },
    OptionDecl {
        name: "roofline_benchmark_path",
        help: "Path to an existing roofline benchmark CSV",
        kind: OptionKind::Str,
        default: "",
    },
    OptionDecl {
        name: "carm_tool_path",
        help: "Path to the CARM tool checkout used to produce the roofline benchmark",
        kind: OptionKind::Str,
        default: "",
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_table_is_unique_and_complete() {
        let mut names: Vec<&str> = DECLARED_OPTIONS.iter().map(|o| o.name).collect();
        names.sort();
        let len = names.len();
        names.dedup();
        assert_eq!(names.len(), len);

        for required in ["buffer_size", "warmup", "freq", "capture_mode", "perf_path"] {
            assert!(names.contains(&required), "missing option {}", required);
        }
    }
}
