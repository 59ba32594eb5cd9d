//! CPU pinning configuration for profiler and command processes.
//!
//! A mask string has one character per CPU index:
//! `p` = profiler-only, `c` = command-only, `b` = both, `.` = unused.
//! Profiler subprocesses (perf, addr2line) are pinned to the profiler
//! CPUs; the number of profiler CPUs drives how many event connections
//! each perf instance opens.

use anyhow::{bail, Result};

#[derive(Debug, Clone, Default)]
pub struct CpuConfig {
    profiler_cpus: Vec<usize>,
    command_cpus: Vec<usize>,
}

/// Number of CPUs currently online.
pub fn online_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

impl CpuConfig {
    pub fn new(mask: &str) -> Result<Self> {
        let mut profiler_cpus = Vec::new();
        let mut command_cpus = Vec::new();

        for (cpu, ch) in mask.chars().enumerate() {
            match ch {
                'p' => profiler_cpus.push(cpu),
                'c' => command_cpus.push(cpu),
                'b' => {
                    profiler_cpus.push(cpu);
                    command_cpus.push(cpu);
                }
                '.' => {}
                _ => bail!(
                    "invalid CPU mask character '{}' at position {} (expected p, c, b, or .)",
                    ch,
                    cpu
                ),
            }
        }

        if profiler_cpus.is_empty() {
            bail!("CPU mask \"{}\" reserves no CPUs for profilers", mask);
        }

        Ok(CpuConfig {
            profiler_cpus,
            command_cpus,
        })
    }

    /// Mask that lets both profilers and the command use every online CPU.
    pub fn all() -> Self {
        let cpus: Vec<usize> = (0..online_cpus()).collect();
        CpuConfig {
            profiler_cpus: cpus.clone(),
            command_cpus: cpus,
        }
    }

    pub fn profiler_thread_count(&self) -> usize {
        self.profiler_cpus.len()
    }

    pub fn profiler_cpus(&self) -> &[usize] {
        &self.profiler_cpus
    }

    pub fn command_cpus(&self) -> &[usize] {
        &self.command_cpus
    }
}

/// Pin the calling process to the given CPUs. Runs inside `pre_exec`
/// hooks, so it must stay async-signal-safe (raw libc, no allocation).
pub fn apply_affinity(cpus: &[usize]) -> std::io::Result<()> {
    if cpus.is_empty() {
        return Ok(());
    }

    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &cpu in cpus {
            if cpu < libc::CPU_SETSIZE as usize {
                libc::CPU_SET(cpu, &mut set);
            }
        }
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_parsing() {
        let config = CpuConfig::new("bpc.").unwrap();
        assert_eq!(config.profiler_cpus(), &[0, 1]);
        assert_eq!(config.command_cpus(), &[0, 2]);
        assert_eq!(config.profiler_thread_count(), 2);
    }

    #[test]
    fn test_mask_rejects_unknown_chars() {
        assert!(CpuConfig::new("bx").is_err());
    }

    #[test]
    fn test_mask_requires_profiler_cpus() {
        assert!(CpuConfig::new("cc..").is_err());
    }

    #[test]
    fn test_all_covers_online_cpus() {
        let config = CpuConfig::all();
        assert_eq!(config.profiler_thread_count(), online_cpus());
        assert_eq!(config.profiler_cpus(), config.command_cpus());
    }
}
