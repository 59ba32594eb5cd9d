//! Fork-pause-exec support for profiling a command from its first
//! instruction.
//!
//! [`spawn_paused_child`] forks a child that blocks on a pipe before
//! calling exec. The runner attaches the perf pipelines to the child's
//! PID, sits out the warmup, and only then releases the child, so the
//! profile window covers the whole command.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

/// A forked child that is waiting on the ready pipe before exec.
///
/// On drop, an unreleased or unwaited child is killed with `SIGKILL`
/// and reaped.
pub struct PausedChild {
    pub pid: u32,
    /// Write end of the ready pipe; writing releases the child into exec.
    ready_write_fd: Option<i32>,
    waited: bool,
}

impl Drop for PausedChild {
    fn drop(&mut self) {
        if let Some(fd) = self.ready_write_fd.take() {
            unsafe { libc::close(fd) };
        }
        if !self.waited {
            unsafe {
                libc::kill(self.pid as i32, libc::SIGKILL);
                let mut status: i32 = 0;
                libc::waitpid(self.pid as i32, &mut status, 0);
            }
        }
    }
}

impl PausedChild {
    /// Release the child into exec: write one byte and close the pipe.
    pub fn release(&mut self) -> Result<()> {
        if let Some(fd) = self.ready_write_fd.take() {
            let buf: [u8; 1] = [1];
            let ret = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, 1) };
            let write_err = if ret < 0 {
                Some(std::io::Error::last_os_error())
            } else {
                None
            };
            unsafe { libc::close(fd) };
            if let Some(err) = write_err {
                bail!("Failed to release the child into exec: {}", err);
            }
        }
        Ok(())
    }

    /// Block until the child exits and return its exit code (128+signal
    /// for signal deaths).
    pub fn wait(&mut self) -> Result<i32> {
        let mut status: i32 = 0;
        let ret = unsafe { libc::waitpid(self.pid as i32, &mut status, 0) };
        if ret < 0 {
            bail!(
                "waitpid({}) failed: {}",
                self.pid,
                std::io::Error::last_os_error()
            );
        }
        self.waited = true;

        if libc::WIFEXITED(status) {
            Ok(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            Ok(128 + libc::WTERMSIG(status))
        } else {
            Ok(-1)
        }
    }
}

/// Resolve a command name to its full path by searching PATH.
fn resolve_executable(name: &str) -> Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let is_executable_file = |path: &Path| -> bool {
        std::fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    };

    if name.contains('/') {
        let path = Path::new(name);
        if !path.exists() {
            bail!("Command not found: {}", name);
        }
        if !is_executable_file(path) {
            bail!("'{}' is not an executable regular file", name);
        }
        return Ok(path.to_path_buf());
    }

    if let Ok(path_var) = std::env::var("PATH") {
        for dir in path_var.split(':') {
            let candidate = Path::new(dir).join(name);
            if candidate.exists() && is_executable_file(&candidate) {
                return Ok(candidate);
            }
        }
    }

    bail!(
        "Command '{}' not found in PATH. Specify the full path to the executable.",
        name
    );
}

/// Fork a child that blocks on a pipe until [`PausedChild::release`].
///
/// # Safety
///
/// Calls `libc::fork()`; must run before any threads are spawned. The
/// child path uses only async-signal-safe functions and never returns:
/// it either execs or calls `_exit()`.
pub fn spawn_paused_child(command: &[String]) -> Result<PausedChild> {
    if command.is_empty() {
        bail!("No command specified to run");
    }

    // Resolve and build argv before fork; no allocation is allowed in the
    // child afterwards.
    let resolved = resolve_executable(&command[0]).context("Failed to resolve command")?;
    let path_cstr = CString::new(resolved.as_os_str().as_bytes())
        .context("Command path contains null byte")?;
    let arg_cstrings: Vec<CString> = command
        .iter()
        .map(|arg| {
            CString::new(arg.as_bytes())
                .with_context(|| format!("Argument contains null byte: {}", arg))
        })
        .collect::<Result<Vec<_>>>()?;
    let mut argv: Vec<*const libc::c_char> = arg_cstrings.iter().map(|s| s.as_ptr()).collect();
    argv.push(std::ptr::null());

    let mut ready_fds = [0i32; 2];
    if unsafe { libc::pipe(ready_fds.as_mut_ptr()) } != 0 {
        bail!(
            "Failed to create ready pipe: {}",
            std::io::Error::last_os_error()
        );
    }
    let ready_read = ready_fds[0];
    let ready_write = ready_fds[1];

    let parent_pid = unsafe { libc::getpid() };

    match unsafe { libc::fork() } {
        -1 => {
            unsafe {
                libc::close(ready_read);
                libc::close(ready_write);
            }
            bail!("fork() failed: {}", std::io::Error::last_os_error());
        }
        0 => {
            // Child: async-signal-safe calls only, never return.
            unsafe {
                libc::close(ready_write);

                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
                // The parent may have died between fork() and prctl().
                if libc::getppid() != parent_pid {
                    libc::_exit(1);
                }

                let mut buf = [0u8; 1];
                let n = libc::read(ready_read, buf.as_mut_ptr() as *mut libc::c_void, 1);
                libc::close(ready_read);
                if n <= 0 {
                    libc::_exit(1);
                }

                libc::execv(path_cstr.as_ptr(), argv.as_ptr());
                libc::_exit(127)
            }
        }
        child_pid => {
            unsafe { libc::close(ready_read) };
            Ok(PausedChild {
                pid: child_pid as u32,
                ready_write_fd: Some(ready_write),
                waited: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_executable_path_search() {
        let resolved = resolve_executable("sh").unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("sh"));
    }

    #[test]
    fn test_resolve_executable_direct_path() {
        assert!(resolve_executable("/bin/sh").is_ok());
        assert!(resolve_executable("/definitely/not/a/command").is_err());
    }

    #[test]
    fn test_paused_child_runs_after_release() {
        let mut child =
            spawn_paused_child(&["sh".to_string(), "-c".to_string(), "exit 7".to_string()])
                .unwrap();
        child.release().unwrap();
        assert_eq!(child.wait().unwrap(), 7);
    }

    #[test]
    fn test_unreleased_child_is_reaped_on_drop() {
        let child =
            spawn_paused_child(&["sh".to_string(), "-c".to_string(), "exit 0".to_string()])
                .unwrap();
        let pid = child.pid;
        drop(child);
        // The child is gone: killing it again must fail with ESRCH.
        assert_eq!(unsafe { libc::kill(pid as i32, 0) }, -1);
    }
}
