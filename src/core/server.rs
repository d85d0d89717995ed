//! Listening socket and the readiness loop driving the supervisor.

use std::fs;
use std::io::{self, Read};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use libc::{self, c_int, pid_t};
use log::{debug, info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::low_level::pipe;

use crate::error::{Error, Result};

use super::host::Host;
use super::supervisor::Supervisor;

/// Listening control socket. The socket file is removed on drop.
#[derive(Debug)]
pub struct ControlSocket {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlSocket {
    /// Binds `path`, replacing any stale socket file, and starts listening.
    /// Relative paths are resolved against the current directory first, so
    /// the socket can still be removed after daemonizing changes it.
    pub fn bind(path: &Path, backlog: u32) -> Result<Self> {
        let path = &std::path::absolute(path).map_err(|source| Error::Bind {
            path: path.to_path_buf(),
            source,
        })?;
        if let Err(err) = fs::remove_file(path) {
            if err.kind() != io::ErrorKind::NotFound {
                debug!("could not unlink stale socket {}: {err}", path.display());
            }
        }

        let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let bytes = path.as_os_str().as_bytes();
        if bytes.len() >= addr.sun_path.len() {
            return Err(Error::Bind {
                path: path.to_path_buf(),
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("socket path exceeds {} bytes", addr.sun_path.len() - 1),
                ),
            });
        }
        for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }

        let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(Error::Socket {
                source: io::Error::last_os_error(),
            });
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let res = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
            )
        };
        if res < 0 {
            return Err(Error::Bind {
                path: path.to_path_buf(),
                source: io::Error::last_os_error(),
            });
        }

        let backlog = c_int::try_from(backlog).unwrap_or(c_int::MAX);
        if unsafe { libc::listen(fd.as_raw_fd(), backlog) } < 0 {
            return Err(Error::Listen {
                path: path.to_path_buf(),
                source: io::Error::last_os_error(),
            });
        }

        let listener = UnixListener::from(fd);
        listener
            .set_nonblocking(true)
            .map_err(|source| Error::Listen {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn listener(&self) -> &UnixListener {
        &self.listener
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Process id of the peer, from `SO_PEERCRED`.
pub fn peer_pid(stream: &UnixStream) -> io::Result<pid_t> {
    let mut cred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;
    let res = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(cred.pid)
}

/// Self-pipe written by the SIGTERM and SIGINT handlers. A signal that
/// arrives before the loop blocks still leaves a byte behind, so the next
/// `poll` returns at once.
#[derive(Debug)]
pub struct ShutdownSignals {
    reader: UnixStream,
}

impl ShutdownSignals {
    pub fn install() -> Result<Self> {
        let setup_error = |source| Error::SignalSetup {
            signal: "SIGTERM/SIGINT",
            source,
        };
        let (reader, writer) = UnixStream::pair().map_err(setup_error)?;
        reader.set_nonblocking(true).map_err(setup_error)?;
        writer.set_nonblocking(true).map_err(setup_error)?;

        for (signal, name) in [(SIGTERM, "SIGTERM"), (SIGINT, "SIGINT")] {
            let writer = writer.try_clone().map_err(setup_error)?;
            pipe::register(signal, writer).map_err(|source| Error::SignalSetup {
                signal: name,
                source,
            })?;
        }
        Ok(Self { reader })
    }

    pub fn as_raw_fd(&self) -> c_int {
        self.reader.as_raw_fd()
    }

    /// Consumes queued wake-ups. Returns whether any signal was seen.
    pub fn drain(&self) -> bool {
        let mut buf = [0u8; 16];
        let mut seen = false;
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => return seen,
                Ok(_) => seen = true,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return seen,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("reading shutdown pipe: {err}");
                    return seen;
                }
            }
        }
    }
}

/// Detaches from the terminal, keeping stdio open for logging.
pub fn daemonize() -> Result<()> {
    if unsafe { libc::daemon(0, 1) } < 0 {
        return Err(Error::Daemonize {
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Milliseconds to block in `poll`: forever without pending kills,
/// otherwise until the earliest deadline but never longer than `cap`.
/// Rounds up so a wake-up never lands before the deadline.
pub fn wait_timeout(next_deadline: Option<Instant>, now: Instant, cap: Duration) -> c_int {
    let Some(deadline) = next_deadline else {
        return -1;
    };
    let wait = deadline.saturating_duration_since(now).min(cap);
    let mut millis = wait.as_millis();
    if wait.as_nanos() % 1_000_000 != 0 {
        millis += 1;
    }
    c_int::try_from(millis).unwrap_or(c_int::MAX)
}

/// Runs until SIGTERM/SIGINT. Returns an error only if waiting itself fails.
pub fn run<H: Host>(
    socket: &ControlSocket,
    signals: &ShutdownSignals,
    supervisor: &mut Supervisor<H>,
    sweep_interval: Duration,
) -> Result<()> {
    info!("listening on {}", socket.path().display());

    loop {
        let targets = supervisor.poll_targets();
        let mut fds = Vec::with_capacity(targets.len() + 2);
        fds.push(libc::pollfd {
            fd: socket.listener().as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        fds.push(libc::pollfd {
            fd: signals.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        fds.extend(targets.iter().map(|(_, fd)| libc::pollfd {
            fd: *fd,
            events: libc::POLLIN,
            revents: 0,
        }));

        let timeout = wait_timeout(supervisor.next_deadline(), Instant::now(), sweep_interval);
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(Error::Poll { source: err });
            }
        } else if ready > 0 {
            if fds[1].revents & libc::POLLIN != 0 && signals.drain() {
                info!("termination requested, shutting down");
                return Ok(());
            }
            let now = Instant::now();
            let readable = libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
            for ((id, _), pollfd) in targets.iter().zip(&fds[2..]) {
                if pollfd.revents & readable != 0 {
                    supervisor.handle_readable(*id, now);
                }
            }
            if fds[0].revents & libc::POLLIN != 0 {
                accept_pending(socket, supervisor);
            }
        }

        supervisor.sweep(Instant::now());
    }
}

fn accept_pending<H: Host>(socket: &ControlSocket, supervisor: &mut Supervisor<H>) {
    loop {
        match socket.listener().accept() {
            Ok((stream, _)) => {
                let pid = match peer_pid(&stream) {
                    Ok(pid) if pid > 0 => pid,
                    Ok(_) => {
                        warn!("could not get pid from client");
                        continue;
                    }
                    Err(err) => {
                        warn!("could not get pid from client: {err}");
                        continue;
                    }
                };
                if let Err(err) = supervisor.accept(stream, pid) {
                    warn!("failed to register client pid {pid}: {err}");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!("accept: {err}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CleanupCommand;
    use crate::core::host::SystemHost;
    use tempfile::tempdir;

    #[test]
    fn wait_timeout_blocks_forever_without_deadlines() {
        assert_eq!(wait_timeout(None, Instant::now(), Duration::from_secs(10)), -1);
    }

    #[test]
    fn wait_timeout_is_capped_and_rounded_up() {
        let now = Instant::now();
        let cap = Duration::from_secs(10);
        assert_eq!(wait_timeout(Some(now + Duration::from_secs(60)), now, cap), 10_000);
        assert_eq!(
            wait_timeout(Some(now + Duration::from_micros(1500)), now, cap),
            2
        );
        assert_eq!(wait_timeout(Some(now), now, cap), 0);
        assert_eq!(
            wait_timeout(Some(now), now + Duration::from_secs(1), cap),
            0
        );
    }

    #[test]
    fn bind_replaces_stale_socket_and_reports_peer_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("qmeventd.sock");
        fs::write(&path, b"stale").unwrap();

        let socket = ControlSocket::bind(&path, 10).unwrap();
        let client = UnixStream::connect(&path).unwrap();
        let (server_side, _) = loop {
            match socket.listener().accept() {
                Ok(pair) => break pair,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(err) => panic!("accept failed: {err}"),
            }
        };
        assert_eq!(peer_pid(&server_side).unwrap(), std::process::id() as pid_t);
        drop(client);

        drop(socket);
        assert!(!path.exists());
    }

    #[test]
    fn signal_raised_before_waiting_stops_the_loop() {
        let dir = tempdir().unwrap();
        let socket = ControlSocket::bind(&dir.path().join("qmeventd.sock"), 10).unwrap();
        let signals = ShutdownSignals::install().unwrap();
        let mut supervisor = Supervisor::new(
            SystemHost::new(CleanupCommand::default()),
            Duration::from_secs(60),
        );

        // nothing else can wake the wait: no clients, no pending kills
        signal_hook::low_level::raise(SIGTERM).unwrap();
        run(&socket, &signals, &mut supervisor, Duration::from_secs(10)).unwrap();
        assert!(!signals.drain());
    }

    #[test]
    fn bind_rejects_overlong_paths() {
        let path = PathBuf::from(format!("/tmp/{}", "x".repeat(200)));
        let err = ControlSocket::bind(&path, 10).unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));
    }
}
