//! Deadlines for VMs that were asked to quit and must exit or be killed.

use std::time::{Duration, Instant};

use log::{debug, warn};

use super::client::ConnectionId;
use super::host::Host;
use super::identity::VmId;
use super::process::{self, ProcessRef};

#[derive(Debug)]
pub struct PendingKill {
    pub conn: ConnectionId,
    pub vmid: VmId,
    pub process: ProcessRef,
    pub deadline: Instant,
}

/// Outcome of a forced kill performed by [`Escalator::sweep`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillOutcome {
    Killed,
    AlreadyGone,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForcedKill {
    pub conn: ConnectionId,
    pub vmid: VmId,
    pub pid: libc::pid_t,
    pub outcome: KillOutcome,
}

/// Pending-kill set. Every entry carries its own deadline, so escalations
/// started at different times expire independently.
#[derive(Debug)]
pub struct Escalator {
    kill_timeout: Duration,
    pending: Vec<PendingKill>,
}

impl Escalator {
    pub fn new(kill_timeout: Duration) -> Self {
        Self {
            kill_timeout,
            pending: Vec::new(),
        }
    }

    /// Records a pending kill for `conn`, replacing any earlier entry.
    pub fn track(&mut self, conn: ConnectionId, vmid: VmId, process: ProcessRef, now: Instant) {
        self.cancel(conn);
        let deadline = now + self.kill_timeout;
        debug!(
            "{vmid}: forced kill of pid {} scheduled in {}s (pidfd: {})",
            process.pid(),
            self.kill_timeout.as_secs(),
            if process.is_pinned() { "yes" } else { "no" }
        );
        self.pending.push(PendingKill {
            conn,
            vmid,
            process,
            deadline,
        });
    }

    /// Drops the entry for `conn` without killing. Returns whether one existed.
    pub fn cancel(&mut self, conn: ConnectionId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|entry| entry.conn != conn);
        before != self.pending.len()
    }

    pub fn is_pending(&self, conn: ConnectionId) -> bool {
        self.pending.iter().any(|entry| entry.conn == conn)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|entry| entry.deadline).min()
    }

    /// Force-kills and removes every entry whose deadline has passed.
    pub fn sweep<H: Host>(&mut self, host: &mut H, now: Instant) -> Vec<ForcedKill> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        debug!("checking {} pending forced kill(s)", self.pending.len());

        let (expired, waiting): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|entry| entry.deadline <= now);
        self.pending = waiting;

        expired
            .into_iter()
            .map(|entry| {
                let pid = entry.process.pid();
                let outcome = match host.send_signal(&entry.process, libc::SIGKILL) {
                    Ok(()) => {
                        warn!(
                            "{}: cleanup failed, terminating pid {pid} with SIGKILL",
                            entry.vmid
                        );
                        KillOutcome::Killed
                    }
                    Err(err) if process::is_gone(&err) => {
                        debug!("{}: pid {pid} already exited", entry.vmid);
                        KillOutcome::AlreadyGone
                    }
                    Err(err) => {
                        warn!("{}: SIGKILL cleanup of pid {pid} failed - {err}", entry.vmid);
                        KillOutcome::Failed(err.to_string())
                    }
                };
                ForcedKill {
                    conn: entry.conn,
                    vmid: entry.vmid,
                    pid,
                    outcome,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cleanup::CleanupRequest;
    use crate::core::identity::IdentityError;
    use std::io;

    #[derive(Default)]
    struct SignalLog {
        sent: Vec<(libc::pid_t, libc::c_int)>,
        gone: Vec<libc::pid_t>,
        denied: Vec<libc::pid_t>,
    }

    impl Host for SignalLog {
        fn resolve_vm_id(&mut self, _pid: libc::pid_t) -> Result<VmId, IdentityError> {
            Err(IdentityError::NoCgroupEntry)
        }

        fn pin_process(&mut self, pid: libc::pid_t) -> Option<ProcessRef> {
            Some(ProcessRef::from_pid(pid))
        }

        fn send_signal(&mut self, target: &ProcessRef, signal: libc::c_int) -> io::Result<()> {
            if self.gone.contains(&target.pid()) {
                return Err(io::Error::from_raw_os_error(libc::ESRCH));
            }
            if self.denied.contains(&target.pid()) {
                return Err(io::Error::from_raw_os_error(libc::EPERM));
            }
            self.sent.push((target.pid(), signal));
            Ok(())
        }

        fn launch_cleanup(&mut self, _request: &CleanupRequest) -> io::Result<()> {
            Ok(())
        }
    }

    fn vmid(value: &str) -> VmId {
        VmId::parse(value).unwrap()
    }

    #[test]
    fn kill_happens_at_deadline_never_before() {
        let mut host = SignalLog::default();
        let mut escalator = Escalator::new(Duration::from_secs(60));
        let start = Instant::now();
        escalator.track(ConnectionId(1), vmid("100"), ProcessRef::from_pid(4242), start);

        assert!(escalator.sweep(&mut host, start).is_empty());
        assert!(
            escalator
                .sweep(&mut host, start + Duration::from_secs(59))
                .is_empty()
        );
        assert!(host.sent.is_empty());

        let killed = escalator.sweep(&mut host, start + Duration::from_secs(60));
        assert_eq!(killed.len(), 1);
        assert_eq!(killed[0].outcome, KillOutcome::Killed);
        assert_eq!(host.sent, vec![(4242, libc::SIGKILL)]);
        assert!(escalator.is_empty());

        assert!(
            escalator
                .sweep(&mut host, start + Duration::from_secs(120))
                .is_empty()
        );
        assert_eq!(host.sent.len(), 1);
    }

    #[test]
    fn later_escalation_does_not_postpone_earlier_one() {
        let mut host = SignalLog::default();
        let mut escalator = Escalator::new(Duration::from_secs(60));
        let start = Instant::now();
        escalator.track(ConnectionId(1), vmid("100"), ProcessRef::from_pid(1000), start);
        escalator.track(
            ConnectionId(2),
            vmid("101"),
            ProcessRef::from_pid(1001),
            start + Duration::from_secs(50),
        );
        assert_eq!(escalator.next_deadline(), Some(start + Duration::from_secs(60)));

        let killed = escalator.sweep(&mut host, start + Duration::from_secs(61));
        assert_eq!(killed.len(), 1);
        assert_eq!(killed[0].pid, 1000);
        assert!(escalator.is_pending(ConnectionId(2)));
        assert_eq!(escalator.next_deadline(), Some(start + Duration::from_secs(110)));

        let killed = escalator.sweep(&mut host, start + Duration::from_secs(110));
        assert_eq!(killed.len(), 1);
        assert_eq!(killed[0].pid, 1001);
    }

    #[test]
    fn cancel_removes_without_killing() {
        let mut host = SignalLog::default();
        let mut escalator = Escalator::new(Duration::from_secs(1));
        let start = Instant::now();
        escalator.track(ConnectionId(7), vmid("100"), ProcessRef::from_pid(77), start);
        assert!(escalator.cancel(ConnectionId(7)));
        assert!(!escalator.cancel(ConnectionId(7)));
        assert!(
            escalator
                .sweep(&mut host, start + Duration::from_secs(5))
                .is_empty()
        );
        assert!(host.sent.is_empty());
    }

    #[test]
    fn gone_and_failed_kills_are_removed() {
        let mut host = SignalLog {
            gone: vec![10],
            denied: vec![11],
            ..SignalLog::default()
        };
        let mut escalator = Escalator::new(Duration::from_secs(1));
        let start = Instant::now();
        escalator.track(ConnectionId(1), vmid("100"), ProcessRef::from_pid(10), start);
        escalator.track(ConnectionId(2), vmid("101"), ProcessRef::from_pid(11), start);

        let mut killed = escalator.sweep(&mut host, start + Duration::from_secs(1));
        killed.sort_by_key(|kill| kill.pid);
        assert_eq!(killed[0].outcome, KillOutcome::AlreadyGone);
        assert!(matches!(killed[1].outcome, KillOutcome::Failed(_)));
        assert!(escalator.is_empty());
    }
}
