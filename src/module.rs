//! Module controller: option validation, pipeline composition, and the
//! profiling run itself.
//!
//! A run goes through fixed phases: validate options, compose one perf
//! driver per sampling channel (lineage first, then walltime, then the
//! custom events), verify environment requirements, start everything
//! attached to the target, fan out one dispatcher thread per connection,
//! wait out the warmup, arm the profile-start clock, hand control to the
//! host for the profiling window, then drain dispatchers, finalize the
//! lineage tree, run the source resolver, and report back.

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{info, warn};
use regex::Regex;

use crate::cpu::CpuConfig;
use crate::dispatcher::{monotonic_ns, DispatchOutcome, Dispatcher, ProfileClock};
use crate::host::Host;
use crate::lineage::LineageAccum;
use crate::perf::{
    parse_filter_rules, CaptureMode, Filter, FilterMode, Perf, PerfEvent, PerfPaths,
};
use crate::sources::{write_sources_json, SourceResolver};
use crate::store::{Entry, Group, Store};

/// Option values as the host hands them over, before validation.
#[derive(Debug, Clone)]
pub struct RawOptions {
    pub buffer_size: u32,
    pub warmup: u32,
    pub freq: u32,
    pub buffer: u32,
    pub off_cpu_freq: i32,
    pub off_cpu_buffer: u32,
    pub events: Vec<String>,
    pub filter: String,
    pub filter_mark: bool,
    pub capture_mode: String,
    pub perf_path: PathBuf,
    pub perf_script_path: PathBuf,
    pub roofline: u32,
    pub roofline_benchmark_path: Option<PathBuf>,
    pub carm_tool_path: Option<PathBuf>,
    /// Source resolver workers; kept at 1 unless the host overrides it.
    pub resolver_pool_size: usize,
}

impl Default for RawOptions {
    fn default() -> Self {
        RawOptions {
            buffer_size: 1024,
            warmup: 1,
            freq: 10,
            buffer: 1,
            off_cpu_freq: 1000,
            off_cpu_buffer: 0,
            events: Vec::new(),
            filter: String::new(),
            filter_mark: false,
            capture_mode: "user".to_string(),
            perf_path: PathBuf::new(),
            perf_script_path: PathBuf::new(),
            roofline: 0,
            roofline_benchmark_path: None,
            carm_tool_path: None,
            resolver_pool_size: 1,
        }
    }
}

/// Validated module configuration.
#[derive(Debug)]
struct ModuleConfig {
    buf_size: u32,
    warmup: u32,
    freq: u32,
    buffer: u32,
    off_cpu_freq: i32,
    off_cpu_buffer: u32,
    events: Vec<PerfEvent>,
    filter: Filter,
    capture_mode: CaptureMode,
    perf_paths: PerfPaths,
    /// Present iff roofline profiling is enabled.
    roofline_benchmark: Option<PathBuf>,
    resolver_pool_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CpuVendor {
    Intel,
    Amd,
}

fn detect_cpu_vendor() -> Option<CpuVendor> {
    let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").ok()?;
    let vendor = cpuinfo
        .lines()
        .find(|line| line.starts_with("vendor_id"))?
        .split(':')
        .nth(1)?
        .trim()
        .to_string();
    match vendor.as_str() {
        "GenuineIntel" => Some(CpuVendor::Intel),
        "AuthenticAMD" => Some(CpuVendor::Amd),
        _ => None,
    }
}

/// The fixed per-vendor event family injected by roofline profiling.
/// Only these events may carry the reserved `CARM_` title prefix.
fn roofline_events(vendor: CpuVendor, freq: u32) -> Vec<PerfEvent> {
    let table: &[(&str, &str)] = match vendor {
        CpuVendor::Intel => &[
            ("fp_arith_inst_retired.scalar_single", "CARM_INTEL_SSP"),
            ("fp_arith_inst_retired.scalar_double", "CARM_INTEL_SDP"),
            ("fp_arith_inst_retired.128b_packed_single", "CARM_INTEL_SSESP"),
            ("fp_arith_inst_retired.128b_packed_double", "CARM_INTEL_SSEDP"),
            ("fp_arith_inst_retired.256b_packed_single", "CARM_INTEL_AVX2SP"),
            ("fp_arith_inst_retired.256b_packed_double", "CARM_INTEL_AVX2DP"),
            ("fp_arith_inst_retired.512b_packed_single", "CARM_INTEL_AVX512SP"),
            ("fp_arith_inst_retired.512b_packed_double", "CARM_INTEL_AVX512DP"),
            ("mem_inst_retired.any", "CARM_INTEL_MEM_LDST"),
        ],
        CpuVendor::Amd => &[
            ("retired_sse_avx_operations:sp_mult_add_flops", "CARM_AMD_SPFMA"),
            ("retired_sse_avx_operations:dp_mult_add_flops", "CARM_AMD_DPFMA"),
            ("retired_sse_avx_operations:sp_add_sub_flops", "CARM_AMD_SPADD"),
            ("retired_sse_avx_operations:dp_add_sub_flops", "CARM_AMD_DPADD"),
            ("retired_sse_avx_operations:sp_mult_flops", "CARM_AMD_SPMUL"),
            ("retired_sse_avx_operations:dp_mult_flops", "CARM_AMD_DPMUL"),
            ("retired_sse_avx_operations:sp_div_flops", "CARM_AMD_SPDIV"),
            ("retired_sse_avx_operations:dp_div_flops", "CARM_AMD_DPDIV"),
            ("ls_dispatch:ld_dispatch", "CARM_AMD_LD"),
            ("ls_dispatch:store_dispatch", "CARM_AMD_STORE"),
        ],
    };

    table
        .iter()
        .map(|(name, title)| PerfEvent::Custom {
            name: name.to_string(),
            period: freq as u64,
            buffer_events: 1,
            title: title.to_string(),
            unit: "ops".to_string(),
        })
        .collect()
}

/// Parse one user-supplied `EVENT,PERIOD,TITLE,UNIT` string.
fn parse_event_str(event_str: &str, buffer_events: u32) -> Result<PerfEvent> {
    let re = Regex::new(r"^(.+),([0-9\.]+),(.+),(.+)$").unwrap();
    let caps = match re.captures(event_str) {
        Some(caps) => caps,
        None => bail!(
            "events: The value \"{}\" must be in form of EVENT,PERIOD,TITLE,UNIT \
             (PERIOD must be a number)",
            event_str
        ),
    };

    let title = caps[3].to_string();
    if title.starts_with("CARM_") {
        bail!(
            "events: The title in \"{}\" starts with a reserved keyword CARM_, you \
             cannot use it",
            event_str
        );
    }

    let period: f64 = caps[2]
        .parse()
        .map_err(|_| anyhow::anyhow!("events: invalid period in \"{}\"", event_str))?;

    Ok(PerfEvent::Custom {
        name: caps[1].to_string(),
        period: period as u64,
        buffer_events,
        title,
        unit: caps[4].to_string(),
    })
}

fn check_perf_paths(perf_path: &Path, perf_script_path: &Path) -> Result<PerfPaths> {
    let bin = perf_path.join("bin").join("perf");
    if !bin.exists() {
        bail!("{} does not exist!", bin.display());
    }
    let canonical_bin = std::fs::canonicalize(&bin)?;
    if !canonical_bin.is_file() {
        bail!("{} does not point to a regular file!", bin.display());
    }

    let python_dir = perf_path
        .join("libexec")
        .join("perf-core")
        .join("scripts")
        .join("python")
        .join("Perf-Trace-Util")
        .join("lib")
        .join("Perf")
        .join("Trace");
    if !python_dir.exists() {
        bail!("{} does not exist!", python_dir.display());
    }
    if !std::fs::canonicalize(&python_dir)?.is_dir() {
        bail!("{} does not point to a directory!", python_dir.display());
    }

    if !perf_script_path.exists() {
        bail!("{} does not exist!", perf_script_path.display());
    }
    if !std::fs::canonicalize(perf_script_path)?.is_dir() {
        bail!("{} does not point to a directory!", perf_script_path.display());
    }

    Ok(PerfPaths {
        bin,
        python_dir,
        script_dir: perf_script_path.to_path_buf(),
    })
}

/// Produce the roofline benchmark CSV: an explicit option wins, then a
/// previously cached copy in the local config dir, then a fresh CARM run.
fn resolve_roofline_benchmark(
    benchmark_path: &Option<PathBuf>,
    carm_tool_path: &Option<PathBuf>,
    tmp_dir: &Path,
    local_config_dir: &Path,
) -> Result<PathBuf> {
    if let Some(path) = benchmark_path {
        if !path.exists() {
            bail!("{} does not exist!", path.display());
        }
        if !std::fs::canonicalize(path)?.is_file() {
            bail!("{} does not point to a regular file!", path.display());
        }
        return Ok(path.clone());
    }

    let cached = local_config_dir.join("roofline.csv");
    if cached.exists() {
        return Ok(cached);
    }

    let carm_tool_path = match carm_tool_path {
        Some(path) => path,
        None => bail!(
            "\"roofline_benchmark_path\" or \"carm_tool_path\" must be provided when \
             \"roofline\" is set."
        ),
    };

    let status = std::process::Command::new("python3")
        .arg(carm_tool_path.join("run.py"))
        .arg("-out")
        .arg(tmp_dir)
        .status()
        .context("running the CARM tool")?;
    if !status.success() {
        bail!(
            "The CARM tool has returned a non-zero exit code {}.",
            status.code().unwrap_or(-1)
        );
    }

    let produced = tmp_dir.join("roofline").join("unnamed_roofline.csv");
    match std::fs::copy(&produced, &cached) {
        Ok(_) => Ok(cached),
        Err(e) => {
            warn!(
                "Could not cache the roofline benchmark results in the local config \
                 directory ({}); roofline benchmarking will run again next time.",
                e
            );
            Ok(produced)
        }
    }
}

/// The profiling module: validated options plus everything `process`
/// needs to run one profiling session.
#[derive(Debug)]
pub struct CpuProfilingModule {
    config: ModuleConfig,
    cpu: CpuConfig,
}

impl CpuProfilingModule {
    /// Validate options and construct the module. Any violation surfaces
    /// as a single error, as does every later failure in `process`.
    pub fn init(raw: RawOptions, host: &dyn Host) -> Result<Self> {
        if raw.buffer_size < 1 {
            bail!("\"buffer_size\" must be greater than or equal to 1.");
        }
        if raw.warmup < 1 {
            bail!("\"warmup\" must be greater than or equal to 1.");
        }
        if raw.freq < 1 {
            bail!("\"freq\" must be greater than or equal to 1.");
        }
        if raw.buffer < 1 {
            bail!("\"buffer\" must be greater than or equal to 1.");
        }
        if raw.off_cpu_freq < -1 {
            bail!("\"off_cpu_freq\" must be greater than or equal to -1.");
        }

        let cpu = match host.cpu_mask() {
            Some(mask) => CpuConfig::new(&mask)?,
            None => CpuConfig::all(),
        };

        let mut events = Vec::new();
        for event_str in &raw.events {
            events.push(parse_event_str(event_str, raw.buffer)?);
        }

        let mut roofline_benchmark = None;
        if raw.roofline >= 1 {
            let vendor = match detect_cpu_vendor() {
                Some(vendor) => vendor,
                None => bail!(
                    "Neither an Intel nor an AMD CPU has been detected! Roofline \
                     profiling is currently supported only for these CPUs."
                ),
            };
            events.extend(roofline_events(vendor, raw.roofline));
            roofline_benchmark = Some(resolve_roofline_benchmark(
                &raw.roofline_benchmark_path,
                &raw.carm_tool_path,
                &host.tmp_dir(),
                &host.local_config_dir(),
            )?);
        }

        let mut filter = Filter {
            mode: FilterMode::None,
            mark: raw.filter_mark,
        };
        if !raw.filter.is_empty() {
            let re = Regex::new(r"^(deny|allow|python):(.+)$").unwrap();
            let caps = match re.captures(&raw.filter) {
                Some(caps) => caps,
                None => bail!("The value of \"filter\" is incorrect."),
            };
            let path = PathBuf::from(&caps[2]);
            filter.mode = match &caps[1] {
                "allow" => {
                    info!("Reading allowlist...");
                    FilterMode::Allow(parse_filter_rules(&path)?)
                }
                "deny" => {
                    info!("Reading denylist...");
                    FilterMode::Deny(parse_filter_rules(&path)?)
                }
                _ => FilterMode::Python(
                    std::fs::canonicalize(&path)
                        .with_context(|| format!("Cannot read {}", path.display()))?,
                ),
            };
        }

        let capture_mode = CaptureMode::parse(&raw.capture_mode)?;
        let perf_paths = check_perf_paths(&raw.perf_path, &raw.perf_script_path)?;

        Ok(CpuProfilingModule {
            config: ModuleConfig {
                buf_size: raw.buffer_size,
                warmup: raw.warmup,
                freq: raw.freq,
                buffer: raw.buffer,
                off_cpu_freq: raw.off_cpu_freq,
                off_cpu_buffer: raw.off_cpu_buffer,
                events,
                filter,
                capture_mode,
                perf_paths,
                roofline_benchmark,
                resolver_pool_size: raw.resolver_pool_size.max(1),
            },
            cpu,
        })
    }

    fn make_perf(&self, event: PerfEvent, name: &str, host: &dyn Host) -> Perf {
        Perf::new(
            event,
            self.config.capture_mode,
            self.config.filter.clone(),
            self.cpu.clone(),
            name,
            self.config.perf_paths.clone(),
            self.config.buf_size as usize,
            host.log_dir(),
            host.tmp_dir(),
            host.node_id(),
        )
    }

    /// Run one profiling session against the host's target process.
    pub fn process(&mut self, host: &dyn Host) -> Result<()> {
        info!("Preparing profilers and verifying their requirements...");

        let store = Store::new(host.node_dir());
        let root = store.root();

        let mut profilers: Vec<(Perf, Group)> = Vec::new();

        profilers.push((
            self.make_perf(PerfEvent::Lineage, "Thread tree profiler", host),
            root.clone(),
        ));

        let walltime = root.child("walltime");
        walltime.set_str("title", "Wall time");
        walltime.set_str("unit", "ns");
        profilers.push((
            self.make_perf(
                PerfEvent::Main {
                    freq: self.config.freq,
                    off_cpu_freq: self.config.off_cpu_freq,
                    buffer_events: self.config.buffer,
                    buffer_off_cpu_events: self.config.off_cpu_buffer,
                },
                "On-CPU/Off-CPU profiler",
                host,
            ),
            walltime,
        ));

        for event in self.config.events.clone() {
            if let PerfEvent::Custom {
                ref name,
                ref title,
                ref unit,
                ..
            } = event
            {
                let metric_dir = root.child(name);
                metric_dir.set_str("title", title);
                metric_dir.set_str("unit", unit);
                let profiler_name = name.clone();
                profilers.push((self.make_perf(event, &profiler_name, host), metric_dir));
            }
        }

        if let Some(benchmark) = &self.config.roofline_benchmark {
            std::fs::copy(benchmark, host.node_dir().join("roofline.csv"))
                .context("Could not copy the roofline benchmarking results")?;
        }

        for (perf, _) in &profilers {
            for requirement in perf.requirements() {
                if !requirement.check() {
                    bail!("Requirement \"{}\" is not met!", requirement.name());
                }
            }
        }

        info!("Starting profilers and waiting for them to signal their readiness...");

        let pid = host.target_pid();
        let clock = Arc::new(ProfileClock::new());
        let lineage = Arc::new(Mutex::new(LineageAccum::new()));
        let mut dispatchers = Vec::new();

        for (perf, dir) in &mut profilers {
            perf.start(pid)?;
            for conn in perf.take_connections() {
                let dispatcher = Dispatcher::new(
                    conn,
                    dir.clone(),
                    store.clone(),
                    clock.clone(),
                    lineage.clone(),
                    perf.name(),
                );
                dispatchers.push(std::thread::spawn(move || dispatcher.run()));
            }
        }

        info!(
            "All profilers have signalled their readiness, waiting {} second(s)...",
            self.config.warmup
        );
        std::thread::sleep(Duration::from_secs(self.config.warmup as u64));
        info!("The warmup has been completed.");

        let profile_start = monotonic_ns();
        if profile_start == 0 {
            bail!("Reading CLOCK_MONOTONIC for the profile start timestamp has failed!");
        }
        clock.arm(profile_start);

        host.notify_profiling_live();
        host.wait_profiling_complete();

        info!("Finishing processing results...");

        let mut dso_offsets: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut symbol_maps_missing = false;

        for handle in dispatchers {
            let outcome: DispatchOutcome = handle
                .join()
                .map_err(|_| anyhow::anyhow!("a dispatcher thread panicked"))?;
            symbol_maps_missing |= outcome.symbol_maps_missing;
            for (dso, offsets) in outcome.dso_offsets {
                dso_offsets.entry(dso).or_default().extend(offsets);
            }
        }

        let mut profiler_error = false;
        for (perf, _) in &mut profilers {
            if perf.wait()? != 0 {
                profiler_error = true;
            }
        }
        if profiler_error {
            bail!("One or more profilers have encountered an error!");
        }

        {
            let lineage = lineage.lock().unwrap();
            if lineage.touched() {
                let tree = lineage.finalize(profile_start);
                let mut file = store.create_file("threads.json")?;
                serde_json::to_writer(&mut file, &tree)?;
                file.write_all(b"\n")?;
            }
        }

        let resolver = SourceResolver::new(self.config.resolver_pool_size, self.cpu.clone());
        let resolved = resolver.resolve(dso_offsets);
        write_sources_json(&store, &resolved.json)?;

        if symbol_maps_missing {
            warn!(
                "One or more expected symbol maps haven't been found! This is not an \
                 error, but some symbol names will be unresolved and point to the name \
                 of an expected map file instead."
            );
            warn!(
                "If it's not desired, make sure that your profiled program is \
                 configured to emit \"perf\" symbol maps."
            );
        }

        host.report_source_paths(&resolved.existing_files());
        store.flush()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestHost {
        dir: PathBuf,
    }

    impl Host for TestHost {
        fn node_id(&self) -> String {
            "node0".to_string()
        }
        fn tmp_dir(&self) -> PathBuf {
            self.dir.join("tmp")
        }
        fn node_dir(&self) -> PathBuf {
            self.dir.join("node")
        }
        fn local_config_dir(&self) -> PathBuf {
            self.dir.join("config")
        }
        fn log_dir(&self) -> PathBuf {
            self.dir.join("log")
        }
        fn target_pid(&self) -> u32 {
            1
        }
        fn cpu_mask(&self) -> Option<String> {
            None
        }
        fn notify_profiling_live(&self) {}
        fn wait_profiling_complete(&self) {}
        fn report_source_paths(&self, _paths: &[PathBuf]) {}
    }

    /// Lay out a plausible perf installation under `dir`.
    fn fake_perf_tree(dir: &Path) -> (PathBuf, PathBuf) {
        let perf_path = dir.join("perf-install");
        std::fs::create_dir_all(perf_path.join("bin")).unwrap();
        std::fs::write(perf_path.join("bin").join("perf"), b"").unwrap();
        let python_dir = perf_path
            .join("libexec/perf-core/scripts/python/Perf-Trace-Util/lib/Perf/Trace");
        std::fs::create_dir_all(&python_dir).unwrap();

        let script_path = dir.join("scripts");
        std::fs::create_dir_all(&script_path).unwrap();
        std::fs::write(script_path.join("event-handler.py"), b"").unwrap();

        (perf_path, script_path)
    }

    fn valid_options(dir: &Path) -> RawOptions {
        let (perf_path, perf_script_path) = fake_perf_tree(dir);
        RawOptions {
            perf_path,
            perf_script_path,
            ..RawOptions::default()
        }
    }

    #[test]
    fn test_init_accepts_valid_options() {
        let dir = tempfile::tempdir().unwrap();
        let host = TestHost {
            dir: dir.path().to_path_buf(),
        };
        let module = CpuProfilingModule::init(valid_options(dir.path()), &host).unwrap();
        assert_eq!(module.config.freq, 10);
        assert!(matches!(module.config.filter.mode, FilterMode::None));
    }

    #[test]
    fn test_init_rejects_zero_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let host = TestHost {
            dir: dir.path().to_path_buf(),
        };

        for (field, expected) in [
            ("buffer_size", "\"buffer_size\""),
            ("warmup", "\"warmup\""),
            ("freq", "\"freq\""),
            ("buffer", "\"buffer\""),
        ] {
            let mut raw = valid_options(dir.path());
            match field {
                "buffer_size" => raw.buffer_size = 0,
                "warmup" => raw.warmup = 0,
                "freq" => raw.freq = 0,
                _ => raw.buffer = 0,
            }
            let err = CpuProfilingModule::init(raw, &host).unwrap_err();
            assert!(err.to_string().contains(expected), "field {}", field);
        }

        let mut raw = valid_options(dir.path());
        raw.off_cpu_freq = -2;
        let err = CpuProfilingModule::init(raw, &host).unwrap_err();
        assert!(err.to_string().contains("\"off_cpu_freq\""));
    }

    #[test]
    fn test_init_rejects_bad_capture_mode() {
        let dir = tempfile::tempdir().unwrap();
        let host = TestHost {
            dir: dir.path().to_path_buf(),
        };
        let mut raw = valid_options(dir.path());
        raw.capture_mode = "everything".to_string();
        assert!(CpuProfilingModule::init(raw, &host).is_err());
    }

    #[test]
    fn test_init_rejects_bad_filter() {
        let dir = tempfile::tempdir().unwrap();
        let host = TestHost {
            dir: dir.path().to_path_buf(),
        };
        let mut raw = valid_options(dir.path());
        raw.filter = "blocklist:/some/file".to_string();
        let err = CpuProfilingModule::init(raw, &host).unwrap_err();
        assert!(err.to_string().contains("\"filter\""));
    }

    #[test]
    fn test_init_parses_filter_rules() {
        let dir = tempfile::tempdir().unwrap();
        let host = TestHost {
            dir: dir.path().to_path_buf(),
        };
        let rules = dir.path().join("deny.txt");
        std::fs::write(&rules, "SYM ^boring_\nOR\nEXEC /usr/lib/.*\n").unwrap();

        let mut raw = valid_options(dir.path());
        raw.filter = format!("deny:{}", rules.display());
        raw.filter_mark = true;
        let module = CpuProfilingModule::init(raw, &host).unwrap();
        match &module.config.filter.mode {
            FilterMode::Deny(groups) => assert_eq!(groups.len(), 2),
            other => panic!("expected deny filter, got {:?}", other),
        }
        assert!(module.config.filter.mark);
    }

    #[test]
    fn test_init_rejects_missing_perf_tree() {
        let dir = tempfile::tempdir().unwrap();
        let host = TestHost {
            dir: dir.path().to_path_buf(),
        };
        let mut raw = valid_options(dir.path());
        raw.perf_path = dir.path().join("nowhere");
        let err = CpuProfilingModule::init(raw, &host).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_event_string_parsing() {
        let event = parse_event_str("cache-misses,1000,Cache misses,misses", 4).unwrap();
        match event {
            PerfEvent::Custom {
                name,
                period,
                buffer_events,
                title,
                unit,
            } => {
                assert_eq!(name, "cache-misses");
                assert_eq!(period, 1000);
                assert_eq!(buffer_events, 4);
                assert_eq!(title, "Cache misses");
                assert_eq!(unit, "misses");
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Fractional periods are truncated.
        match parse_event_str("ev,10.5,T,U", 1).unwrap() {
            PerfEvent::Custom { period, .. } => assert_eq!(period, 10),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_event_string_rejections() {
        assert!(parse_event_str("missing-fields,10", 1).is_err());
        let err = parse_event_str("ev,10,CARM_INTEL_SSP,ops", 1).unwrap_err();
        assert!(err.to_string().contains("CARM_"));
    }

    #[test]
    fn test_roofline_event_families() {
        let intel = roofline_events(CpuVendor::Intel, 100);
        assert_eq!(intel.len(), 9);
        let amd = roofline_events(CpuVendor::Amd, 100);
        assert_eq!(amd.len(), 10);

        for event in intel.iter().chain(amd.iter()) {
            match event {
                PerfEvent::Custom { period, title, unit, .. } => {
                    assert_eq!(*period, 100);
                    assert!(title.starts_with("CARM_"));
                    assert_eq!(unit, "ops");
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn test_roofline_benchmark_resolution_order() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("tmp");
        let config = dir.path().join("config");
        std::fs::create_dir_all(&tmp).unwrap();
        std::fs::create_dir_all(&config).unwrap();

        // Explicit option wins.
        let explicit = dir.path().join("bench.csv");
        std::fs::write(&explicit, b"csv").unwrap();
        let got =
            resolve_roofline_benchmark(&Some(explicit.clone()), &None, &tmp, &config).unwrap();
        assert_eq!(got, explicit);

        // Cached copy comes next.
        std::fs::write(config.join("roofline.csv"), b"csv").unwrap();
        let got = resolve_roofline_benchmark(&None, &None, &tmp, &config).unwrap();
        assert_eq!(got, config.join("roofline.csv"));

        // Nothing available and no CARM tool: error.
        std::fs::remove_file(config.join("roofline.csv")).unwrap();
        assert!(resolve_roofline_benchmark(&None, &None, &tmp, &config).is_err());
    }
}
