//! Process management utilities.
//!
//! This module provides liveness checks and signal delivery for hypervisor
//! processes. The processes are usually not children of the calling
//! invocation, so exit is observed by polling rather than `waitpid`.

use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

/// Default timeout for graceful shutdown before SIGKILL.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for SIGKILL to take effect.
pub const SIGKILL_WAIT: Duration = Duration::from_secs(2);

/// Interval between liveness polls while waiting for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Check if a process exists.
///
/// Returns true if the process exists (including zombies), whoever owns
/// it. Use [`is_vm_alive`] to check a hypervisor process.
pub fn is_alive(pid: libc::pid_t) -> bool {
    // kill(0, ..) and kill(-1, ..) address process groups
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to another user
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Send SIGTERM to a process.
pub fn terminate(pid: libc::pid_t) -> io::Result<()> {
    signal(pid, libc::SIGTERM)
}

/// Send SIGKILL to a process.
pub fn kill(pid: libc::pid_t) -> io::Result<()> {
    signal(pid, libc::SIGKILL)
}

fn signal(pid: libc::pid_t, sig: libc::c_int) -> io::Result<()> {
    if pid <= 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {}", pid),
        ));
    }
    if unsafe { libc::kill(pid, sig) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Check if the hypervisor for a VM is alive.
///
/// True only when a process with `pid` exists, is not a zombie, and has the
/// scratch directory on its command line. Pids are recycled by the OS, so an
/// unrelated process that inherited the pid reports not-alive.
pub fn is_vm_alive(pid: libc::pid_t, tmpdir: &Path) -> bool {
    if !is_alive(pid) || tmpdir.as_os_str().is_empty() {
        return false;
    }
    process_matches(pid, tmpdir)
}

#[cfg(target_os = "linux")]
fn process_matches(pid: libc::pid_t, tmpdir: &Path) -> bool {
    use std::os::unix::ffi::OsStrExt;

    let proc_dir = Path::new("/proc").join(pid.to_string());

    // State is the first field after the command name, which may itself
    // contain spaces and parentheses.
    let stat = match std::fs::read_to_string(proc_dir.join("stat")) {
        Ok(stat) => stat,
        Err(_) => return false,
    };
    let state = stat
        .rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next());
    if matches!(state, None | Some("Z") | Some("X")) {
        return false;
    }

    let cmdline = match std::fs::read(proc_dir.join("cmdline")) {
        Ok(cmdline) => cmdline,
        Err(_) => return false,
    };
    let needle = tmpdir.as_os_str().as_bytes();
    cmdline
        .split(|b| *b == 0)
        .any(|arg| arg.windows(needle.len()).any(|w| w == needle))
}

#[cfg(not(target_os = "linux"))]
fn process_matches(pid: libc::pid_t, tmpdir: &Path) -> bool {
    let output = std::process::Command::new("ps")
        .args(["-o", "stat=", "-o", "command=", "-p", &pid.to_string()])
        .output();

    let output = match output {
        Ok(output) if output.status.success() => output,
        _ => return false,
    };

    let line = String::from_utf8_lossy(&output.stdout);
    let line = line.trim();
    if line.is_empty() || line.starts_with('Z') {
        return false;
    }
    line.contains(&*tmpdir.to_string_lossy())
}

/// How a hypervisor stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process was already gone.
    AlreadyExited,
    /// The process exited after SIGTERM.
    Terminated,
    /// The process exited after SIGKILL.
    Killed,
    /// The process is still alive.
    StillAlive,
}

/// Gracefully stop a hypervisor process.
///
/// 1. Sends SIGTERM
/// 2. Waits up to `timeout` for it to exit
/// 3. If still running and `force` is true, sends SIGKILL
///
/// Signal errors are returned only when the process is still alive
/// afterwards. A VM owned by another user fails here with `EPERM` and is
/// left running.
pub fn stop_vm(
    pid: libc::pid_t,
    tmpdir: &Path,
    timeout: Duration,
    force: bool,
) -> io::Result<StopOutcome> {
    if !is_vm_alive(pid, tmpdir) {
        return Ok(StopOutcome::AlreadyExited);
    }

    if let Err(e) = terminate(pid) {
        if !is_vm_alive(pid, tmpdir) {
            return Ok(StopOutcome::AlreadyExited);
        }
        return Err(e);
    }

    if wait_for_exit(pid, tmpdir, timeout) {
        return Ok(StopOutcome::Terminated);
    }

    if !force {
        return Ok(StopOutcome::StillAlive);
    }

    tracing::debug!(pid = pid, "SIGTERM timeout, sending SIGKILL");
    if let Err(e) = kill(pid) {
        if !is_vm_alive(pid, tmpdir) {
            return Ok(StopOutcome::Terminated);
        }
        return Err(e);
    }

    if wait_for_exit(pid, tmpdir, SIGKILL_WAIT) {
        Ok(StopOutcome::Killed)
    } else {
        Ok(StopOutcome::StillAlive)
    }
}

/// Poll until the process is gone or `timeout` elapses.
///
/// Returns true if the process exited.
fn wait_for_exit(pid: libc::pid_t, tmpdir: &Path, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        if !is_vm_alive(pid, tmpdir) {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::process::{Child, Command};

    /// Spawn a long-running shell whose command line carries `marker`.
    fn spawn_marked(marker: &Path) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg("sleep 30; true")
            .arg("vmpool-test")
            .arg(marker)
            .spawn()
            .unwrap()
    }

    #[test]
    fn test_is_alive_self() {
        // Current process should be alive
        let pid = unsafe { libc::getpid() };
        assert!(is_alive(pid));
    }

    #[test]
    fn test_is_alive_nonexistent() {
        // PID 99999999 is unlikely to exist
        assert!(!is_alive(99999999));
        assert!(!is_alive(0));
        assert!(!is_alive(-1));
    }

    #[test]
    fn test_is_alive_other_users_process() {
        // init is always present; unprivileged callers get EPERM from kill
        assert!(is_alive(1));
    }

    /// First argument of init's command line, usable as its signature.
    #[cfg(target_os = "linux")]
    pub(crate) fn init_signature() -> std::path::PathBuf {
        use std::os::unix::ffi::OsStrExt;

        let cmdline = std::fs::read("/proc/1/cmdline").unwrap();
        let argv0 = cmdline.split(|b| *b == 0).next().unwrap();
        Path::new(std::ffi::OsStr::from_bytes(argv0)).to_path_buf()
    }

    /// Whether init is owned by a user other than the one running tests.
    #[cfg(target_os = "linux")]
    pub(crate) fn init_is_foreign() -> bool {
        use std::os::unix::fs::MetadataExt;

        let owner = std::fs::metadata("/proc/1").unwrap().uid();
        owner != unsafe { libc::geteuid() }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_unsignalable_vm_is_alive_and_not_stopped() {
        let signature = init_signature();
        assert!(is_vm_alive(1, &signature));

        // Only meaningful, and only safe, when init belongs to someone else
        if !init_is_foreign() {
            return;
        }
        let err = stop_vm(1, &signature, Duration::from_millis(100), true).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EPERM));
        assert!(is_vm_alive(1, &signature));
    }

    #[test]
    fn test_signal_rejects_group_pids() {
        assert!(terminate(0).is_err());
        assert!(kill(-1).is_err());
    }

    #[test]
    fn test_vm_alive_requires_matching_tmpdir() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let mut child = spawn_marked(dir.path());
        let pid = child.id() as libc::pid_t;

        assert!(is_vm_alive(pid, dir.path()));
        // Same pid, different signature: a recycled pid
        assert!(!is_vm_alive(pid, other.path()));
        // Our own pid is alive but not a VM
        assert!(!is_vm_alive(unsafe { libc::getpid() }, dir.path()));
        assert!(!is_vm_alive(99999999, dir.path()));

        child.kill().unwrap();
        child.wait().unwrap();
        assert!(!is_vm_alive(pid, dir.path()));
    }

    #[test]
    fn test_stop_vm_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = spawn_marked(dir.path());
        let pid = child.id() as libc::pid_t;

        let outcome = stop_vm(pid, dir.path(), Duration::from_secs(5), true).unwrap();
        assert!(matches!(
            outcome,
            StopOutcome::Terminated | StopOutcome::Killed
        ));
        child.wait().unwrap();

        // Nothing left to stop
        let outcome = stop_vm(pid, dir.path(), Duration::from_secs(1), false).unwrap();
        assert_eq!(outcome, StopOutcome::AlreadyExited);
    }
}
