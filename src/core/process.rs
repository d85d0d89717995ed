//! Stable process references and signal delivery.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr;

use libc::{self, c_int, pid_t};

/// A process pinned at the moment escalation began. When the kernel
/// supports pidfds the descriptor keeps signals from reaching a recycled
/// pid; otherwise only the raw pid is known.
#[derive(Debug)]
pub struct ProcessRef {
    pid: pid_t,
    pidfd: Option<OwnedFd>,
}

impl ProcessRef {
    pub fn from_pid(pid: pid_t) -> Self {
        Self { pid, pidfd: None }
    }

    pub fn pid(&self) -> pid_t {
        self.pid
    }

    pub fn is_pinned(&self) -> bool {
        self.pidfd.is_some()
    }

    /// Opens a pidfd for `pid`. `Ok(None)` means the process is already gone.
    pub fn open(pid: pid_t) -> io::Result<Option<Self>> {
        let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0 as libc::c_uint) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::ESRCH) => Ok(None),
                _ => Err(err),
            };
        }
        let pidfd = unsafe { OwnedFd::from_raw_fd(fd as c_int) };
        Ok(Some(Self {
            pid,
            pidfd: Some(pidfd),
        }))
    }

    /// Sends `signal` through the pidfd when held, by pid otherwise.
    pub fn send_signal(&self, signal: c_int) -> io::Result<()> {
        let res = match &self.pidfd {
            Some(pidfd) => unsafe {
                libc::syscall(
                    libc::SYS_pidfd_send_signal,
                    pidfd.as_raw_fd(),
                    signal,
                    ptr::null::<libc::siginfo_t>(),
                    0 as libc::c_uint,
                ) as c_int
            },
            None => unsafe { libc::kill(self.pid, signal) },
        };
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

/// `true` when a signal failed only because the target already exited.
pub fn is_gone(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ESRCH)
}

/// `true` when the running kernel lacks pidfd support.
pub fn is_unsupported(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOSYS)
}

pub fn signal_name(signal: c_int) -> &'static str {
    match signal {
        libc::SIGTERM => "SIGTERM",
        libc::SIGKILL => "SIGKILL",
        libc::SIGINT => "SIGINT",
        _ => "signal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn open_and_kill_child_process() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as pid_t;
        let process = match ProcessRef::open(pid) {
            Ok(Some(process)) => process,
            Ok(None) => panic!("child {pid} reported as gone"),
            Err(err) if is_unsupported(&err) => ProcessRef::from_pid(pid),
            Err(err) => panic!("pidfd_open failed: {err}"),
        };
        assert_eq!(process.pid(), pid);
        process.send_signal(libc::SIGKILL).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn reaped_process_is_reported_gone() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id() as pid_t;
        child.wait().unwrap();

        let err = ProcessRef::from_pid(pid).send_signal(0).unwrap_err();
        assert!(is_gone(&err));
        match ProcessRef::open(pid) {
            Ok(None) => {}
            Err(err) if is_unsupported(&err) => {}
            other => panic!("expected gone process, got {other:?}"),
        }
    }

    #[test]
    fn signal_names() {
        assert_eq!(signal_name(libc::SIGTERM), "SIGTERM");
        assert_eq!(signal_name(libc::SIGKILL), "SIGKILL");
    }
}
