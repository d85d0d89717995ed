//! Operating-system side effects the supervisor depends on.

use std::io;

use libc::{c_int, pid_t};
use log::warn;

use crate::config::CleanupCommand;

use super::cleanup::{CleanupRequest, launch_cleanup};
use super::identity::{self, IdentityError, VmId};
use super::process::{self, ProcessRef};

/// Everything the supervisor asks of the host. `SystemHost` talks to the
/// kernel; tests substitute a recording implementation.
pub trait Host {
    /// Finds the VM that `pid` belongs to.
    fn resolve_vm_id(&mut self, pid: pid_t) -> Result<VmId, IdentityError>;

    /// Pins `pid` for later signalling. `None` means it already exited.
    fn pin_process(&mut self, pid: pid_t) -> Option<ProcessRef>;

    fn send_signal(&mut self, target: &ProcessRef, signal: c_int) -> io::Result<()>;

    /// Starts the cleanup action without waiting for it.
    fn launch_cleanup(&mut self, request: &CleanupRequest) -> io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct SystemHost {
    cleanup: CleanupCommand,
}

impl SystemHost {
    pub fn new(cleanup: CleanupCommand) -> Self {
        Self { cleanup }
    }
}

impl Host for SystemHost {
    fn resolve_vm_id(&mut self, pid: pid_t) -> Result<VmId, IdentityError> {
        identity::resolve_vm_id(pid)
    }

    fn pin_process(&mut self, pid: pid_t) -> Option<ProcessRef> {
        match ProcessRef::open(pid) {
            Ok(pinned) => pinned,
            // older kernels: fall back to the bare pid without complaint
            Err(err) if process::is_unsupported(&err) => Some(ProcessRef::from_pid(pid)),
            Err(err) => {
                warn!("failed to open pidfd for pid {pid}: {err}");
                Some(ProcessRef::from_pid(pid))
            }
        }
    }

    fn send_signal(&mut self, target: &ProcessRef, signal: c_int) -> io::Result<()> {
        target.send_signal(signal)
    }

    fn launch_cleanup(&mut self, request: &CleanupRequest) -> io::Result<()> {
        launch_cleanup(&self.cleanup, request)
    }
}
