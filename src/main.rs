use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info};

use perfweave::host::Host;
use perfweave::module::{CpuProfilingModule, RawOptions};
use perfweave::traced_command::{spawn_paused_child, PausedChild};

/// Profile a process with perf and aggregate its callchains.
///
/// Either attach to a running process with --pid, or put a command after
/// `--` to spawn it paused and profile it from its first instruction.
#[derive(Debug, Parser)]
#[command(name = "perfweave", version)]
struct Opts {
    /// PID of a running process to attach to (0 = spawn the command instead)
    #[arg(short, long, default_value = "0")]
    pid: u32,

    /// Directory receiving profiling artifacts and logs
    #[arg(short, long, default_value = "./profile")]
    output_dir: PathBuf,

    /// Internal communication buffer size in bytes
    #[arg(long, default_value = "1024")]
    buffer_size: u32,

    /// Warmup time in seconds before the profiled program starts
    #[arg(short, long, default_value = "1")]
    warmup: u32,

    /// On-CPU sampling frequency in Hz
    #[arg(short, long, default_value = "10")]
    freq: u32,

    /// Buffer up to this number of on-CPU events before sending
    #[arg(long, default_value = "1")]
    buffer: u32,

    /// Off-CPU sampling frequency in Hz (0 disables, -1 captures all)
    #[arg(long, default_value = "1000", allow_hyphen_values = true)]
    off_cpu_freq: i32,

    /// Buffer up to this number of off-CPU events before sending
    #[arg(long, default_value = "0")]
    off_cpu_buffer: u32,

    /// Extra perf event as "EVENT,PERIOD,TITLE,UNIT" (repeatable)
    #[arg(short, long = "event")]
    events: Vec<String>,

    /// Stack filtering: "deny:<FILE>", "allow:<FILE>", or "python:<FILE>"
    #[arg(long, default_value = "")]
    filter: String,

    /// Mark filtered-out stack elements as "(cut)" instead of deleting them
    #[arg(long)]
    filter_mark: bool,

    /// Capture "kernel", "user", or "both" stack trace types
    #[arg(short, long, default_value = "user")]
    capture_mode: String,

    /// Root of the perf installation (bin/perf underneath)
    #[arg(long)]
    perf_path: PathBuf,

    /// Directory holding the perf-script event handler
    #[arg(long)]
    perf_script_path: PathBuf,

    /// CPU pin mask, one char per CPU: p(rofiler), c(ommand), b(oth), .
    #[arg(long)]
    cpu_mask: Option<String>,

    /// Roofline profiling sampling frequency (0 disables)
    #[arg(long, default_value = "0")]
    roofline: u32,

    /// Path to an existing roofline benchmark CSV
    #[arg(long)]
    roofline_benchmark_path: Option<PathBuf>,

    /// Path to the CARM tool used to produce the benchmark CSV
    #[arg(long)]
    carm_tool_path: Option<PathBuf>,

    /// Source resolver worker count
    #[arg(long, default_value = "1")]
    resolver_jobs: usize,

    /// Command to spawn and profile (everything after --)
    #[arg(last = true)]
    command: Vec<String>,
}

/// Host services backed by the local filesystem and the spawned target.
struct CliHost {
    node_id: String,
    output_dir: PathBuf,
    pid: u32,
    cpu_mask: Option<String>,
    /// Present when we spawned the target ourselves; released when
    /// profiling goes live and reaped when it completes.
    child: Mutex<Option<PausedChild>>,
}

impl CliHost {
    fn new(opts: &Opts, pid: u32, child: Option<PausedChild>) -> Result<Self> {
        let host = CliHost {
            node_id: "node0".to_string(),
            output_dir: opts.output_dir.clone(),
            pid,
            cpu_mask: opts.cpu_mask.clone(),
            child: Mutex::new(child),
        };
        for dir in ["node", "tmp", "log", "config"] {
            std::fs::create_dir_all(host.output_dir.join(dir))
                .with_context(|| format!("creating {}/{}", host.output_dir.display(), dir))?;
        }
        Ok(host)
    }
}

impl Host for CliHost {
    fn node_id(&self) -> String {
        self.node_id.clone()
    }

    fn tmp_dir(&self) -> PathBuf {
        self.output_dir.join("tmp")
    }

    fn node_dir(&self) -> PathBuf {
        self.output_dir.join("node")
    }

    fn local_config_dir(&self) -> PathBuf {
        self.output_dir.join("config")
    }

    fn log_dir(&self) -> PathBuf {
        self.output_dir.join("log")
    }

    fn target_pid(&self) -> u32 {
        self.pid
    }

    fn cpu_mask(&self) -> Option<String> {
        self.cpu_mask.clone()
    }

    fn notify_profiling_live(&self) {
        let mut child = self.child.lock().unwrap();
        if let Some(child) = child.as_mut() {
            if let Err(e) = child.release() {
                error!("Could not start the profiled command: {}", e);
            }
        } else {
            info!("Profiling is live on pid {}.", self.pid);
        }
    }

    fn wait_profiling_complete(&self) {
        let mut child = self.child.lock().unwrap();
        match child.as_mut() {
            Some(child) => match child.wait() {
                Ok(code) => info!("Profiled command exited with code {}.", code),
                Err(e) => error!("Waiting for the profiled command failed: {}", e),
            },
            None => {
                // Attached to a foreign process: poll until it is gone.
                let proc_path = PathBuf::from(format!("/proc/{}", self.pid));
                while proc_path.exists() {
                    std::thread::sleep(Duration::from_millis(100));
                }
                info!("Profiled process {} has exited.", self.pid);
            }
        }
    }

    fn report_source_paths(&self, paths: &[PathBuf]) {
        for path in paths {
            println!("{}", path.display());
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts = Opts::parse();

    // Fork before the module spawns any threads.
    let (pid, child) = if !opts.command.is_empty() {
        let child = spawn_paused_child(&opts.command)?;
        (child.pid, Some(child))
    } else if opts.pid != 0 {
        (opts.pid, None)
    } else {
        bail!("Specify either --pid or a command after \"--\".");
    };

    let raw = RawOptions {
        buffer_size: opts.buffer_size,
        warmup: opts.warmup,
        freq: opts.freq,
        buffer: opts.buffer,
        off_cpu_freq: opts.off_cpu_freq,
        off_cpu_buffer: opts.off_cpu_buffer,
        events: opts.events.clone(),
        filter: opts.filter.clone(),
        filter_mark: opts.filter_mark,
        capture_mode: opts.capture_mode.clone(),
        perf_path: opts.perf_path.clone(),
        perf_script_path: opts.perf_script_path.clone(),
        roofline: opts.roofline,
        roofline_benchmark_path: opts.roofline_benchmark_path.clone(),
        carm_tool_path: opts.carm_tool_path.clone(),
        resolver_pool_size: opts.resolver_jobs,
    };

    let host = CliHost::new(&opts, pid, child)?;
    let mut module = CpuProfilingModule::init(raw, &host)?;
    module.process(&host)?;

    info!(
        "Profiling complete; results are in {}.",
        host.node_dir().display()
    );
    Ok(())
}
