//! Protocol state machine for all control connections.
//!
//! A VM process connects, greets us, and is classified by its identity.
//! Shutdown events trigger a `query-status`; a VM that is neither running
//! nor paused (and not held by a backup) is asked to quit and, failing
//! that, killed once its deadline passes. Every VM connection that goes
//! away triggers the cleanup action.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use libc::pid_t;
use log::{debug, error, info, warn};
use serde_json::Value;

use super::cleanup::CleanupRequest;
use super::client::{Connection, ConnectionId, ProtocolState, Role, VmSession};
use super::decoder::Frame;
use super::escalator::{Escalator, ForcedKill};
use super::host::Host;
use super::identity::MAX_VMID_LEN;
use super::message::{
    self, CAPABILITIES_COMMAND, Message, QUERY_STATUS_COMMAND, QUIT_COMMAND, SHUTDOWN_EVENT,
};
use super::process;
use super::registry::VmRegistry;

/// Marks a connection whose peer can no longer be talked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Hangup;

type Flow = Result<(), Hangup>;

enum Reply {
    Success(Value),
    Failure(Option<String>),
}

pub struct Supervisor<H: Host> {
    host: H,
    connections: HashMap<ConnectionId, Connection>,
    registry: VmRegistry,
    escalator: Escalator,
    next_id: u64,
}

impl<H: Host> Supervisor<H> {
    pub fn new(host: H, kill_timeout: Duration) -> Self {
        Self {
            host,
            connections: HashMap::new(),
            registry: VmRegistry::new(),
            escalator: Escalator::new(kill_timeout),
            next_id: 1,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn registry(&self) -> &VmRegistry {
        &self.registry
    }

    pub fn escalator(&self) -> &Escalator {
        &self.escalator
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Descriptors to wait on for readability.
    pub fn poll_targets(&self) -> Vec<(ConnectionId, RawFd)> {
        self.connections
            .values()
            .map(|conn| (conn.id, conn.stream.as_raw_fd()))
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.escalator.next_deadline()
    }

    /// Takes ownership of a freshly accepted stream from process `pid`.
    pub fn accept(&mut self, stream: UnixStream, pid: pid_t) -> io::Result<ConnectionId> {
        stream.set_nonblocking(true)?;
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.connections.insert(id, Connection::new(id, pid, stream));
        debug!("added new client, pid: {pid}");
        Ok(id)
    }

    /// Reads whatever is available on `id` and dispatches every complete
    /// message. EOF and hard read errors tear the connection down.
    pub fn handle_readable(&mut self, id: ConnectionId, now: Instant) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let label = conn.label();
        debug!("{label}: entering handle");

        match conn.decoder.fill_from(&mut conn.stream) {
            Ok(0) => {
                debug!("{label}: got EOF");
                self.teardown(id);
                return;
            }
            Ok(read) => debug!("{label}: read {read} bytes"),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) => {
                warn!("{label}: read failed: {err}");
                self.teardown(id);
                return;
            }
        }

        loop {
            let Some(conn) = self.connections.get_mut(&id) else {
                break;
            };
            let label = conn.label();
            let Some(frame) = conn.decoder.next_frame() else {
                break;
            };
            match frame {
                Frame::Value(value) => {
                    let Some(message) = Message::classify(value) else {
                        continue;
                    };
                    if self.dispatch(id, message, now).is_err() {
                        self.teardown(id);
                        break;
                    }
                }
                Frame::Oversized { discarded } => {
                    debug!("{label}: msg too large, discarding buffer ({discarded} bytes)");
                }
                Frame::Malformed { discarded, reason } => {
                    debug!("{label}: parse error: {reason}, discarding buffer ({discarded} bytes)");
                }
            }
        }
    }

    /// Tears down `id` as if its peer had closed the socket.
    pub fn close(&mut self, id: ConnectionId) {
        self.teardown(id);
    }

    /// Enforces expired kill deadlines.
    pub fn sweep(&mut self, now: Instant) -> Vec<ForcedKill> {
        self.escalator.sweep(&mut self.host, now)
    }

    fn dispatch(&mut self, id: ConnectionId, message: Message, now: Instant) -> Flow {
        match message {
            Message::Greeting => self.handle_greeting(id),
            Message::Event { name, data } => self.handle_event(id, &name, data.as_ref()),
            Message::Return(value) => self.handle_reply(id, Reply::Success(value), now),
            Message::Error { desc } => self.handle_reply(id, Reply::Failure(desc), now),
            Message::BackupHandshake(data) => {
                self.handle_backup_handshake(id, &data);
                Ok(())
            }
        }
    }

    fn handle_greeting(&mut self, id: ConnectionId) -> Flow {
        let Some(conn) = self.connections.get_mut(&id) else {
            return Ok(());
        };
        if conn.role != Role::Unclassified {
            debug!(
                "{}: ignoring greeting on {} connection",
                conn.label(),
                conn.role.name()
            );
            return Ok(());
        }

        debug!("pid{}: got QMP handshake, assuming QEMU client", conn.pid);
        let vmid = match self.host.resolve_vm_id(conn.pid) {
            Ok(vmid) => vmid,
            Err(err) => {
                warn!("could not get vmid from pid {}: {err}", conn.pid);
                return Err(Hangup);
            }
        };

        debug!("pid{}: assigned VMID: {vmid}", conn.pid);
        conn.role = Role::Vm(VmSession::new(vmid.clone()));
        if let Err(occupied) = self.registry.insert(vmid.clone(), id) {
            // backup coordination won't reach this connection, nothing else breaks
            warn!(
                "{vmid}: could not insert client into VMID->client table (held by {})",
                occupied.existing
            );
        }

        conn.send(CAPABILITIES_COMMAND).map_err(|err| {
            warn!("{vmid}: cannot send QMP message: {err}");
            Hangup
        })
    }

    fn handle_event(&mut self, id: ConnectionId, name: &str, data: Option<&Value>) -> Flow {
        let Some(conn) = self.connections.get_mut(&id) else {
            return Ok(());
        };
        let label = conn.label();
        let state = conn.state;
        let Some(session) = conn.vm_mut() else {
            debug!("{label}: ignoring event {name} before handshake");
            return Ok(());
        };
        debug!("{label}: got QMP event: {name}");

        if state == ProtocolState::Terminating {
            // QEMU sometimes repeats SHUTDOWN after being told to quit
            debug!("{label}: event was after termination, ignoring");
            return Ok(());
        }

        if name != SHUTDOWN_EVENT {
            return Ok(());
        }

        session.graceful = true;
        if let Some(guest) = message::shutdown_guest_flag(data) {
            session.guest = guest;
        }
        self.terminate_check(id)
    }

    fn handle_reply(&mut self, id: ConnectionId, reply: Reply, now: Instant) -> Flow {
        let Some(conn) = self.connections.get_mut(&id) else {
            return Ok(());
        };
        let label = conn.label();
        let Some(session) = conn.vm() else {
            debug!("{label}: ignoring command return on {} connection", conn.role.name());
            return Ok(());
        };
        if conn.state == ProtocolState::Terminating {
            // includes the empty return acknowledging `quit`
            return Ok(());
        }
        let backup = session.backup;

        match reply {
            Reply::Failure(desc) => {
                warn!(
                    "{label}: received error from QMP: {}",
                    desc.as_deref().unwrap_or("n/a")
                );
                conn.state = ProtocolState::Idle;
            }
            Reply::Success(value) => match conn.state {
                ProtocolState::ExpectStatusResponse => {
                    conn.state = ProtocolState::Idle;
                    if message::status_is_active(&value) {
                        debug!("{label}: got status: VM is active");
                    } else if backup {
                        // the coordinator's disconnect re-runs the check
                        debug!("{label}: not active, but running backup - keep alive");
                    } else {
                        self.begin_termination(id, now);
                        return Ok(());
                    }
                }
                ProtocolState::Handshake => {
                    conn.state = ProtocolState::Idle;
                    debug!("{label}: QMP handshake complete");
                }
                ProtocolState::Idle => debug!("{label}: spurious return value received"),
                ProtocolState::Terminating => {}
            },
        }

        let recheck = self
            .connections
            .get(&id)
            .and_then(Connection::vm)
            .is_some_and(|session| session.recheck_pending);
        if recheck {
            self.terminate_check(id)?;
        }
        Ok(())
    }

    /// Asks the VM for its status unless a command is already in flight, in
    /// which case the check is remembered and re-run after the reply.
    fn terminate_check(&mut self, id: ConnectionId) -> Flow {
        let Some(conn) = self.connections.get_mut(&id) else {
            return Ok(());
        };
        let label = conn.label();
        let state = conn.state;
        let Some(session) = conn.vm_mut() else {
            return Ok(());
        };

        if state != ProtocolState::Idle {
            debug!("{label}: terminate_check queued");
            session.recheck_pending = true;
            return Ok(());
        }
        session.recheck_pending = false;

        debug!("{label}: query-status");
        conn.state = ProtocolState::ExpectStatusResponse;
        conn.send(QUERY_STATUS_COMMAND).map_err(|err| {
            warn!("{label}: cannot send QMP message: {err}");
            Hangup
        })
    }

    fn begin_termination(&mut self, id: ConnectionId, now: Instant) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let Some(vmid) = conn.vm().map(|session| session.vmid.clone()) else {
            return;
        };
        let pid = conn.pid;
        debug!("{vmid}: terminating client (pid {pid})");
        conn.state = ProtocolState::Terminating;

        let Some(process) = self.host.pin_process(pid) else {
            debug!("{vmid}: process already dead (pid {pid})");
            return;
        };

        debug!("{vmid}: sending 'quit' via QMP");
        if let Err(err) = conn.send(QUIT_COMMAND) {
            let signal = process::signal_name(libc::SIGTERM);
            debug!("{vmid}: quit not delivered ({err}), sending {signal} to pid {pid}");
            if let Err(err) = self.host.send_signal(&process, libc::SIGTERM) {
                if !process::is_gone(&err) {
                    warn!("{vmid}: failed to send {signal} to pid {pid}: {err}");
                }
            }
        }

        self.escalator.track(id, vmid, process, now);
    }

    fn handle_backup_handshake(&mut self, id: ConnectionId, data: &Value) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if conn.role != Role::Unclassified {
            debug!(
                "{}: ignoring vzdump handshake on {} connection",
                conn.label(),
                conn.role.name()
            );
            return;
        }
        conn.state = ProtocolState::Idle;
        let pid = conn.pid;

        let Some(target) = message::backup_target(data) else {
            debug!("pid{pid}: invalid vzdump handshake: vmid missing or not a string");
            return;
        };
        if target.is_empty() || target.len() > MAX_VMID_LEN {
            debug!("pid{pid}: invalid vzdump handshake: vmid too long or invalid");
            return;
        }

        let Some(vm_conn) = self.registry.lookup(target) else {
            info!("{target}: vzdump requested backup start for unregistered VM");
            return;
        };
        let Some(session) = self
            .connections
            .get_mut(&vm_conn)
            .and_then(Connection::vm_mut)
        else {
            return;
        };
        session.backup = true;
        let target = session.vmid.clone();

        if let Some(conn) = self.connections.get_mut(&id) {
            debug!("{target}: vzdump backup started");
            conn.role = Role::BackupCoordinator { target };
        }
    }

    /// Closes `id` and releases everything that refers to it. Releasing a
    /// backup coordinator may in turn hang up on its VM.
    fn teardown(&mut self, id: ConnectionId) {
        let mut queue = vec![id];
        while let Some(id) = queue.pop() {
            let Some(conn) = self.connections.remove(&id) else {
                continue;
            };
            if self.escalator.cancel(id) {
                debug!("{}: removed from forced cleanups", conn.label());
            }

            match conn.role {
                Role::Vm(session) => {
                    self.registry.remove_owned(&session.vmid, id);
                    let request = CleanupRequest {
                        vmid: session.vmid,
                        graceful: session.graceful,
                        guest: session.guest,
                    };
                    debug!(
                        "{}: executing cleanup (graceful: {}, guest: {})",
                        request.vmid, request.graceful as u8, request.guest as u8
                    );
                    if let Err(err) = self.host.launch_cleanup(&request) {
                        error!("{}: failed to launch cleanup: {err}", request.vmid);
                    }
                }
                Role::BackupCoordinator { target } => {
                    let Some(vm_conn) = self.registry.lookup(target.as_str()) else {
                        continue;
                    };
                    if let Some(session) = self
                        .connections
                        .get_mut(&vm_conn)
                        .and_then(Connection::vm_mut)
                    {
                        debug!("{target}: backup ended");
                        session.backup = false;
                    }
                    if self.terminate_check(vm_conn).is_err() {
                        queue.push(vm_conn);
                    }
                }
                Role::Unclassified => {}
            }
            // `conn.stream` drops here, closing the socket
        }
    }
}
