//! perfweave - perf-driven CPU profiling with callchain aggregation.
//!
//! This library drives the kernel `perf` tool to collect on-CPU, off-CPU,
//! hardware-event, and thread-lineage samples from a target process. Each
//! perf pipeline streams JSON messages over unix sockets; one dispatcher
//! thread per connection folds them into a hierarchical, callchain-indexed,
//! per-thread store, reconstructs the process/thread tree from traced
//! scheduler syscalls, and resolves DSO offsets to source locations.
//!
//! # Modules
//!
//! - [`module`] - option validation and the profiling-run controller
//! - [`host`] - the services an embedding host provides
//! - [`perf`] - the `perf record | perf script` driver
//! - [`dispatcher`] - per-connection message routing
//! - [`aggregator`] - timed/untimed callchain views
//! - [`lineage`] - fork/exec/exit tree reconstruction
//! - [`sources`] - addr2line fan-out
//! - [`store`] - the hierarchical profile store

pub mod aggregator;
pub mod connection;
pub mod cpu;
pub mod dispatcher;
pub mod host;
pub mod lineage;
pub mod module;
pub mod perf;
pub mod requirements;
pub mod sources;
pub mod store;
pub mod traced_command;

// Re-export the surface an embedding host needs.
pub use host::{Host, DECLARED_OPTIONS, LOG_CATEGORY, MODULE_TAG};
pub use module::{CpuProfilingModule, RawOptions};
