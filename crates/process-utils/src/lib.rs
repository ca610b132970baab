//! Small process-related helpers shared across the workspace.
//!
//! Liveness and termination of processes that are *not* our direct children
//! (for example a transcoder spawned by a previous run of the supervisor) go
//! through this crate so the callers stay platform-neutral.

use std::ffi::OsStr;

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use tracing::debug;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Outcome of a termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The signal was delivered.
    Signalled,
    /// No such process (already gone).
    NotFound,
    /// The process exists but the signal could not be delivered.
    Failed,
}

fn refreshed_system(pid: Pid) -> System {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
}

/// Check whether a process with the given pid currently exists.
///
/// This is an existence probe and never affects the target. Zombie processes
/// (exited but not yet reaped) count as dead.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    let pid = Pid::from_u32(pid);
    let system = refreshed_system(pid);
    match system.process(pid) {
        Some(process) => !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        None => false,
    }
}

/// Ask a process to exit gracefully.
///
/// Sends `SIGTERM` where signals exist. Platforms without a graceful signal
/// fall back to a hard kill.
pub fn terminate_process(pid: u32) -> TerminateOutcome {
    if pid == 0 {
        return TerminateOutcome::NotFound;
    }

    let sys_pid = Pid::from_u32(pid);
    let system = refreshed_system(sys_pid);
    let Some(process) = system.process(sys_pid) else {
        return TerminateOutcome::NotFound;
    };

    let delivered = match process.kill_with(Signal::Term) {
        Some(delivered) => delivered,
        None => {
            debug!(pid, "SIGTERM unsupported on this platform, killing");
            process.kill()
        }
    };

    if delivered {
        TerminateOutcome::Signalled
    } else {
        TerminateOutcome::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_zero_is_never_alive() {
        assert!(!is_process_alive(0));
        assert_eq!(terminate_process(0), TerminateOutcome::NotFound);
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_unused_pid_is_dead() {
        // Above the kernel's pid_max on every supported platform.
        let pid = 0x3FFF_FFF0;
        assert!(!is_process_alive(pid));
        assert_eq!(terminate_process(pid), TerminateOutcome::NotFound);
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_child() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id();
        assert!(is_process_alive(pid));

        assert_eq!(terminate_process(pid), TerminateOutcome::Signalled);
        let status = child.wait().unwrap();
        assert!(!status.success());
        assert!(!is_process_alive(pid));
    }

    #[cfg(unix)]
    #[test]
    fn test_unreaped_child_counts_as_dead() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();

        // Give the child time to exit without reaping it.
        std::thread::sleep(std::time::Duration::from_millis(300));
        assert!(!is_process_alive(pid));

        child.wait().unwrap();
    }
}
