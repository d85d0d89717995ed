//! Detached cleanup launches for VM connections that went away.

use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use crate::config::CleanupCommand;

use super::identity::VmId;

/// Arguments handed to the cleanup action: `<vmid> <graceful> <guest>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupRequest {
    pub vmid: VmId,
    /// A shutdown event was observed before the connection closed.
    pub graceful: bool,
    /// The last shutdown event was requested from inside the guest.
    pub guest: bool,
}

impl CleanupRequest {
    pub fn args(&self) -> [String; 3] {
        [
            self.vmid.to_string(),
            flag(self.graceful).to_string(),
            flag(self.guest).to_string(),
        ]
    }
}

fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

pub fn build_command(command: &CleanupCommand, request: &CleanupRequest) -> Command {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .args(request.args())
        .stdin(Stdio::null());
    cmd
}

/// Spawns the cleanup command and forgets about it. Reaping relies on
/// `SIGCHLD` being ignored in the daemon (see [`ignore_child_exits`]).
pub fn launch_cleanup(command: &CleanupCommand, request: &CleanupRequest) -> io::Result<()> {
    let mut cmd = build_command(command, request);
    unsafe {
        cmd.pre_exec(|| {
            // the cleanup action may want to wait on its own children
            libc::signal(libc::SIGCHLD, libc::SIG_DFL);
            Ok(())
        });
    }
    let child = cmd.spawn()?;
    drop(child);
    Ok(())
}

/// Lets the kernel reap exited children on its own. Called once at startup.
pub fn ignore_child_exits() -> io::Result<()> {
    let previous = unsafe { libc::signal(libc::SIGCHLD, libc::SIG_IGN) };
    if previous == libc::SIG_ERR {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::fs;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn request(graceful: bool, guest: bool) -> CleanupRequest {
        CleanupRequest {
            vmid: VmId::parse("100").unwrap(),
            graceful,
            guest,
        }
    }

    #[test]
    fn arguments_follow_vmid_graceful_guest_order() {
        let command = CleanupCommand::default();
        let cmd = build_command(&command, &request(true, false));
        assert_eq!(cmd.get_program(), OsStr::new("/usr/sbin/qm"));
        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(args, vec!["cleanup", "100", "1", "0"]);
    }

    #[test]
    fn launch_runs_the_configured_program() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("args.txt");
        let command = CleanupCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec![
                "-c".to_string(),
                format!("echo \"$@\" > {}", output.display()),
                "cleanup".to_string(),
            ],
        };

        launch_cleanup(&command, &request(true, true)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(contents) = fs::read_to_string(&output) {
                if contents.ends_with('\n') {
                    assert_eq!(contents.trim(), "100 1 1");
                    break;
                }
            }
            assert!(Instant::now() < deadline, "cleanup command never ran");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn launch_reports_missing_program() {
        let command = CleanupCommand {
            program: PathBuf::from("/nonexistent/qm"),
            args: Vec::new(),
        };
        assert!(launch_cleanup(&command, &request(false, false)).is_err());
    }
}
