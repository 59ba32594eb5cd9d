//! The perf profiler driver.
//!
//! Each [`Perf`] instance runs one `perf record | perf script` pipeline
//! attached to the target PID. The recorder writes its binary stream to
//! stdout; the scripter consumes it and emits one JSON message per event
//! over unix sockets it dials from the `PERFWEAVE_CONNECT` environment
//! entry. The driver owns both children, the accept loop, and the filter
//! handshake on the first connection.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{bail, Context, Result};
use log::{error, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use regex::Regex;
use serde_json::json;

use crate::connection::{AcceptError, Acceptor, Connection, ACCEPT_TIMEOUT, STOP_SENTINEL};
use crate::cpu::{apply_affinity, CpuConfig};
use crate::requirements::{
    perf_event_max_stack, NumaMitigation, PerfEventKernelSettings, Requirement,
};

/// Tracepoints recorded for thread/process lineage reconstruction.
const LINEAGE_EVENTS: &str = "syscalls:sys_exit_execve,syscalls:sys_exit_execveat,\
sched:sched_process_fork,sched:sched_process_exit";

/// Environment entry telling the scripter how to reach our acceptors.
pub const CONNECT_ENV: &str = "PERFWEAVE_CONNECT";

/// One sampling channel description.
#[derive(Debug, Clone)]
pub enum PerfEvent {
    /// Scheduler/exec syscall tracing for the thread tree.
    Lineage,
    /// On-CPU (`task-clock`) plus optional off-CPU sampling.
    Main {
        freq: u32,
        /// 0 disables off-CPU profiling, -1 captures all off-CPU events.
        off_cpu_freq: i32,
        buffer_events: u32,
        buffer_off_cpu_events: u32,
    },
    /// A custom perf event sampled with a fixed period.
    Custom {
        name: String,
        period: u64,
        buffer_events: u32,
        title: String,
        unit: String,
    },
}

impl PerfEvent {
    /// Short tag used in log file and socket names.
    pub fn tag(&self) -> &str {
        match self {
            PerfEvent::Lineage => "syscall",
            PerfEvent::Main { .. } => "main",
            PerfEvent::Custom { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    Kernel,
    User,
    Both,
}

impl CaptureMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "kernel" => Ok(CaptureMode::Kernel),
            "user" => Ok(CaptureMode::User),
            "both" => Ok(CaptureMode::Both),
            _ => bail!("\"capture_mode\" can be either \"kernel\", \"user\", or \"both\"."),
        }
    }
}

/// Stack-trace filtering handed to the scripter during the handshake.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub mode: FilterMode,
    /// Mark filtered-out frames as "(cut)" instead of deleting them.
    pub mark: bool,
}

#[derive(Debug, Clone, Default)]
pub enum FilterMode {
    #[default]
    None,
    /// Keep only frames matching one of the condition groups.
    Allow(Vec<Vec<String>>),
    /// Drop frames matching one of the condition groups.
    Deny(Vec<Vec<String>>),
    /// Delegate the decision to a user-supplied Python script.
    Python(PathBuf),
}

/// Parse an allow/deny rule file: one `SYM`/`EXEC`/`ANY` rule per line,
/// groups separated by a literal `OR` line, `#` starts a comment.
pub fn parse_filter_rules(path: &Path) -> Result<Vec<Vec<String>>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read {}", path.display()))?;
    let rule_re = Regex::new(r"^(SYM|EXEC|ANY) .+$").unwrap();

    let mut groups = Vec::new();
    let mut current = Vec::new();

    for (lineno, line) in contents.lines().enumerate() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line == "OR" {
            groups.push(std::mem::take(&mut current));
        } else if rule_re.is_match(line) {
            current.push(line.to_string());
        } else {
            bail!("Line {} is non-empty and invalid!", lineno + 1);
        }
    }

    if !current.is_empty() {
        groups.push(current);
    }

    Ok(groups)
}

impl Filter {
    /// The `filter_settings` handshake message, or `None` for an unfiltered run.
    pub fn settings_message(&self) -> Option<String> {
        let data = match &self.mode {
            FilterMode::None => return None,
            FilterMode::Allow(groups) => json!({
                "type": "allow",
                "mark": self.mark,
                "conditions": groups,
            }),
            FilterMode::Deny(groups) => json!({
                "type": "deny",
                "mark": self.mark,
                "conditions": groups,
            }),
            FilterMode::Python(script) => json!({
                "type": "python",
                "mark": self.mark,
                "script": script.display().to_string(),
            }),
        };
        Some(json!({"type": "filter_settings", "data": data}).to_string())
    }
}

/// Filesystem locations of the perf installation.
#[derive(Debug, Clone)]
pub struct PerfPaths {
    /// The `perf` executable.
    pub bin: PathBuf,
    /// perf's Perf-Trace-Util python library dir (prepended to PYTHONPATH).
    pub python_dir: PathBuf,
    /// Directory holding `event-handler.py`.
    pub script_dir: PathBuf,
}

/// One `perf record | perf script` pipeline and its connections.
pub struct Perf {
    event: PerfEvent,
    capture_mode: CaptureMode,
    filter: Filter,
    cpu: CpuConfig,
    name: String,
    paths: PerfPaths,
    buf_size: usize,
    log_dir: PathBuf,
    socket_dir: PathBuf,
    node_id: String,
    connections: Vec<Connection>,
    monitor: Option<JoinHandle<i32>>,
    running: Arc<AtomicBool>,
}

impl Perf {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event: PerfEvent,
        capture_mode: CaptureMode,
        filter: Filter,
        cpu: CpuConfig,
        name: impl Into<String>,
        paths: PerfPaths,
        buf_size: usize,
        log_dir: PathBuf,
        socket_dir: PathBuf,
        node_id: impl Into<String>,
    ) -> Self {
        Perf {
            event,
            capture_mode,
            filter,
            cpu,
            name: name.into(),
            paths,
            buf_size,
            log_dir,
            socket_dir,
            node_id: node_id.into(),
            connections: Vec::new(),
            monitor: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn event(&self) -> &PerfEvent {
        &self.event
    }

    /// Number of connections the scripter will open back to us.
    pub fn thread_count(&self) -> usize {
        match self.event {
            PerfEvent::Lineage => 2,
            _ => self.cpu.profiler_thread_count() + 1,
        }
    }

    pub fn requirements(&self) -> Vec<Box<dyn Requirement>> {
        vec![Box::new(PerfEventKernelSettings), Box::new(NumaMitigation)]
    }

    /// `perf record` arguments for this event, excluding the binary itself.
    fn record_args(&self, pid: u32) -> Vec<String> {
        let mut args: Vec<String> = [
            "record", "-o", "-", "--call-graph", "fp", "-k", "CLOCK_MONOTONIC",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        match &self.event {
            PerfEvent::Lineage => {
                args.extend([
                    "--buffer-events".into(),
                    "1".into(),
                    "-e".into(),
                    LINEAGE_EVENTS.into(),
                    "--sorted-stream".into(),
                    format!("--pid={}", pid),
                ]);
            }
            PerfEvent::Main {
                freq,
                off_cpu_freq,
                buffer_events,
                buffer_off_cpu_events,
            } => {
                args.extend([
                    "--sorted-stream".into(),
                    "-e".into(),
                    "task-clock".into(),
                    "-F".into(),
                    freq.to_string(),
                    "--off-cpu".into(),
                    off_cpu_freq.to_string(),
                    "--buffer-events".into(),
                    buffer_events.to_string(),
                    "--buffer-off-cpu-events".into(),
                    buffer_off_cpu_events.to_string(),
                    format!("--pid={}", pid),
                ]);
            }
            PerfEvent::Custom {
                name,
                period,
                buffer_events,
                ..
            } => {
                args.extend([
                    "--sorted-stream".into(),
                    "-e".into(),
                    format!("{}/period={}/", name, period),
                    "--buffer-events".into(),
                    buffer_events.to_string(),
                    format!("--pid={}", pid),
                ]);
            }
        }

        match self.capture_mode {
            CaptureMode::Kernel => args.push("--kernel-callchains".into()),
            CaptureMode::User => args.push("--user-callchains".into()),
            CaptureMode::Both => {
                args.push("--kernel-callchains".into());
                args.push("--user-callchains".into());
            }
        }

        args
    }

    /// `perf script` arguments, excluding the binary itself.
    fn script_args(&self) -> Vec<String> {
        vec![
            "script".into(),
            "-i".into(),
            "-".into(),
            "-s".into(),
            self.paths
                .script_dir
                .join("event-handler.py")
                .display()
                .to_string(),
            "--demangle".into(),
            "--demangle-kernel".into(),
            format!("--max-stack={}", perf_event_max_stack()),
        ]
    }

    fn log_file(&self, piece: &str) -> Result<File> {
        let path = self.log_dir.join(format!(
            "{}_perf_{}_{}.log",
            self.node_id,
            piece,
            self.event.tag().replace('/', "_")
        ));
        File::create(&path).with_context(|| format!("creating log file {}", path.display()))
    }

    /// Spawn the pipeline, accept the scripter's connections, and run the
    /// filter handshake on connection 0.
    pub fn start(&mut self, pid: u32) -> Result<()> {
        use std::os::unix::process::CommandExt;

        let threads = self.thread_count();
        let mut acceptors = Vec::with_capacity(threads);
        let mut instructions = String::from("unix");

        for i in 0..threads {
            let tag = format!(
                "{}_{}_{}",
                self.node_id,
                self.event.tag().replace('/', "_"),
                i
            );
            let acceptor = Acceptor::bind(&self.socket_dir, &tag)?;
            instructions.push(' ');
            instructions.push_str(&acceptor.instructions());
            acceptors.push(acceptor);
        }

        let pre_exec_cpus = self.cpu.profiler_cpus().to_vec();

        let record_stderr = self
            .log_file("record_stderr")
            .context("creating stderr log file for perf-record")?;

        let mut record_cmd = Command::new(&self.paths.bin);
        record_cmd
            .args(self.record_args(pid))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(record_stderr));
        {
            let cpus = pre_exec_cpus.clone();
            unsafe {
                record_cmd.pre_exec(move || apply_affinity(&cpus));
            }
        }
        let mut record = record_cmd
            .spawn()
            .with_context(|| format!("spawning perf-record for \"{}\"", self.name))?;

        let record_stdout = record
            .stdout
            .take()
            .context("redirecting perf-record stdout to perf-script")?;

        let script_stdout = self
            .log_file("script_stdout")
            .context("creating stdout log file for perf-script")?;
        let script_stderr = self
            .log_file("script_stderr")
            .context("creating stderr log file for perf-script")?;

        let mut pythonpath = self.paths.python_dir.display().to_string();
        if let Ok(existing) = std::env::var("PYTHONPATH") {
            pythonpath = format!("{}:{}", pythonpath, existing);
        }

        let mut script_cmd = Command::new(&self.paths.bin);
        script_cmd
            .args(self.script_args())
            .stdin(Stdio::from(record_stdout))
            .stdout(Stdio::from(script_stdout))
            .stderr(Stdio::from(script_stderr))
            .env("PYTHONPATH", pythonpath)
            .env(CONNECT_ENV, &instructions);
        {
            let cpus = pre_exec_cpus;
            unsafe {
                script_cmd.pre_exec(move || apply_affinity(&cpus));
            }
        }
        let script = script_cmd
            .spawn()
            .with_context(|| format!("spawning perf-script for \"{}\"", self.name))?;

        self.running.store(true, Ordering::SeqCst);
        self.monitor = Some(self.spawn_monitor(record, script, pid));

        for acceptor in &acceptors {
            loop {
                match acceptor.accept(ACCEPT_TIMEOUT, self.buf_size) {
                    Ok(conn) => {
                        self.connections.push(conn);
                        break;
                    }
                    Err(AcceptError::Timeout) => {
                        if !self.running.load(Ordering::SeqCst) {
                            warn!(
                                "Profiler \"{}\" exited before establishing all of its \
                                 connections, abandoning accept.",
                                self.name
                            );
                            return Ok(());
                        }
                    }
                    Err(AcceptError::Io(e)) => {
                        return Err(e).context("accepting a profiler connection");
                    }
                }
            }
        }

        if let Some(conn) = self.connections.first_mut() {
            if let Some(msg) = self.filter.settings_message() {
                conn.write_message(&msg, false)
                    .context("writing filter settings")?;
            }
            conn.write_message(STOP_SENTINEL, true)
                .context("terminating the filter handshake")?;
        }

        Ok(())
    }

    fn spawn_monitor(&self, record: Child, script: Child, pid: u32) -> JoinHandle<i32> {
        let name = self.name.clone();
        let running = self.running.clone();

        std::thread::spawn(move || {
            let mut children = [("perf-record", record), ("perf-script", script)];
            let mut result = 0;

            for (piece, child) in children.iter_mut() {
                let code = wait_exit_code(child);
                if code != 0 {
                    report_subprocess_failure(&name, piece, code, pid);
                    result = code;
                    break;
                }
            }

            running.store(false, Ordering::SeqCst);
            result
        })
    }

    /// Hand the accepted connections to the dispatchers.
    pub fn take_connections(&mut self) -> Vec<Connection> {
        std::mem::take(&mut self.connections)
    }

    /// Wait for the pipeline; returns the first non-zero subprocess exit
    /// code, or zero.
    pub fn wait(&mut self) -> Result<i32> {
        match self.monitor.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow::anyhow!("profiler monitor thread panicked")),
            None => Ok(0),
        }
    }
}

fn wait_exit_code(child: &mut Child) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match child.wait() {
        Ok(status) => {
            if let Some(code) = status.code() {
                code
            } else {
                let sig = status.signal().unwrap_or(0);
                warn!("perf subprocess was terminated by signal {}", sig);
                128 + sig
            }
        }
        Err(e) => {
            error!("Failed to wait on a perf subprocess: {}", e);
            -1
        }
    }
}

fn target_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

fn report_subprocess_failure(profiler: &str, piece: &str, code: i32, pid: u32) {
    if target_alive(pid) {
        error!(
            "Profiler \"{}\" ({}) has returned non-zero exit code {}. Terminating the \
             profiled process.",
            profiler, piece, code
        );
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!("Could not SIGTERM the profiled process {}: {}", pid, e);
        }
    } else {
        error!(
            "Profiler \"{}\" ({}) has returned non-zero exit code {} and the profiled \
             process is no longer running.",
            profiler, piece, code
        );
    }
}
