//! Per-connection state.

use std::fmt;
use std::io::{self, Write};
use std::os::unix::net::UnixStream;

use libc::pid_t;

use super::decoder::Decoder;
use super::identity::VmId;

/// Stable handle of an accepted connection. Never reused within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Waiting for the greeting or the answer to `qmp_capabilities`.
    Handshake,
    Idle,
    /// A `query-status` is in flight.
    ExpectStatusResponse,
    /// `quit` was sent; the VM is expected to go away.
    Terminating,
}

/// Bookkeeping for a connection classified as a VM process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSession {
    pub vmid: VmId,
    /// A shutdown event was seen at least once.
    pub graceful: bool,
    /// The last shutdown event came from inside the guest.
    pub guest: bool,
    /// A backup coordinator is holding this VM alive.
    pub backup: bool,
    /// A termination check arrived while another command was in flight.
    pub recheck_pending: bool,
}

impl VmSession {
    pub fn new(vmid: VmId) -> Self {
        Self {
            vmid,
            graceful: false,
            guest: false,
            backup: false,
            recheck_pending: false,
        }
    }
}

/// What a connection turned out to be. Fixed once it leaves `Unclassified`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Unclassified,
    Vm(VmSession),
    /// Backup coordinator holding the VM with this identity.
    BackupCoordinator { target: VmId },
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Unclassified => "unclassified",
            Role::Vm(_) => "vm",
            Role::BackupCoordinator { .. } => "backup",
        }
    }
}

#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub pid: pid_t,
    pub stream: UnixStream,
    pub decoder: Decoder,
    pub state: ProtocolState,
    pub role: Role,
}

impl Connection {
    pub fn new(id: ConnectionId, pid: pid_t, stream: UnixStream) -> Self {
        Self {
            id,
            pid,
            stream,
            decoder: Decoder::default(),
            state: ProtocolState::Handshake,
            role: Role::Unclassified,
        }
    }

    pub fn vm(&self) -> Option<&VmSession> {
        match &self.role {
            Role::Vm(session) => Some(session),
            _ => None,
        }
    }

    pub fn vm_mut(&mut self) -> Option<&mut VmSession> {
        match &mut self.role {
            Role::Vm(session) => Some(session),
            _ => None,
        }
    }

    /// Log prefix: the VM identity once known, the peer pid before that.
    pub fn label(&self) -> String {
        match &self.role {
            Role::Vm(session) => session.vmid.to_string(),
            _ => format!("pid{}", self.pid),
        }
    }

    /// Writes a complete command in one call. A short or failed write
    /// means the command was not delivered.
    pub fn send(&mut self, command: &[u8]) -> io::Result<()> {
        loop {
            match self.stream.write(command) {
                Ok(written) if written == command.len() => return Ok(()),
                Ok(written) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short write ({written} of {} bytes)", command.len()),
                    ));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }
}
