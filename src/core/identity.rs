//! VM identity and its resolution from a connecting process.

use std::borrow::Borrow;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

use libc::pid_t;
use log::warn;
use thiserror::Error;

/// Longest identity accepted, in bytes.
pub const MAX_VMID_LEN: usize = 15;

const CGROUP_SLICE_PREFIX: &str = "/qemu.slice/";
const CGROUP_SCOPE_SUFFIX: &str = ".scope";
const CMDLINE_ID_FLAG: &[u8] = b"-id";

/// Registry key of a supervised VM: a non-zero decimal id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmId(String);

impl VmId {
    pub fn parse(value: &str) -> Result<Self, IdentityError> {
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(IdentityError::Invalid {
                value: value.to_string(),
            });
        }
        let id: u64 = value.parse().map_err(|_| IdentityError::Invalid {
            value: value.to_string(),
        })?;
        if id == 0 {
            return Err(IdentityError::Invalid {
                value: value.to_string(),
            });
        }
        let canonical = id.to_string();
        if canonical.len() > MAX_VMID_LEN {
            return Err(IdentityError::Invalid {
                value: value.to_string(),
            });
        }
        Ok(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for VmId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid vmid `{value}`")]
    Invalid { value: String },
    #[error("no `/qemu.slice/<vmid>.scope` cgroup entry")]
    NoCgroupEntry,
    #[error("no `-id <vmid>` argument on the command line")]
    NoIdArgument,
    #[error("unable to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("pid {pid}: {cgroup}; {cmdline}")]
    Unresolved {
        pid: pid_t,
        cgroup: Box<IdentityError>,
        cmdline: Box<IdentityError>,
    },
}

/// Resolves the VM owning `pid`, preferring its cgroup membership and
/// falling back to its `-id` argument.
pub fn resolve_vm_id(pid: pid_t) -> Result<VmId, IdentityError> {
    let cgroup = read_proc(pid, "cgroup").and_then(|contents| {
        vm_id_from_cgroup(&String::from_utf8_lossy(&contents))
    });
    let cgroup_err = match cgroup {
        Ok(id) => return Ok(id),
        Err(err) => err,
    };

    let cmdline = read_proc(pid, "cmdline").and_then(|contents| vm_id_from_cmdline(&contents));
    match cmdline {
        Ok(id) => Ok(id),
        Err(cmdline_err) => Err(IdentityError::Unresolved {
            pid,
            cgroup: Box::new(cgroup_err),
            cmdline: Box::new(cmdline_err),
        }),
    }
}

fn read_proc(pid: pid_t, entry: &str) -> Result<Vec<u8>, IdentityError> {
    let path = PathBuf::from(format!("/proc/{pid}/{entry}"));
    fs::read(&path).map_err(|source| IdentityError::Read { path, source })
}

/// Parses `/proc/<pid>/cgroup` contents. Lines look like
/// `0::/qemu.slice/100.scope`; the first well-formed entry wins.
pub fn vm_id_from_cgroup(contents: &str) -> Result<VmId, IdentityError> {
    for line in contents.lines() {
        let Some((_, cgroup_path)) = line.rsplit_once(':') else {
            warn!("unexpected cgroup entry {line}");
            continue;
        };

        if !cgroup_path.starts_with(CGROUP_SLICE_PREFIX) {
            continue;
        }

        let Some((_, unit)) = cgroup_path.rsplit_once('/') else {
            warn!("unexpected cgroup entry {line}");
            continue;
        };

        let Some(digits) = unit.strip_suffix(CGROUP_SCOPE_SUFFIX) else {
            warn!("unexpected cgroup entry {line}");
            continue;
        };

        match VmId::parse(digits) {
            Ok(id) => return Ok(id),
            Err(err) => {
                warn!("{err} in cgroup entry {line}");
                continue;
            }
        }
    }

    Err(IdentityError::NoCgroupEntry)
}

/// Parses NUL-separated `/proc/<pid>/cmdline` contents and returns the
/// value following the first `-id` argument.
pub fn vm_id_from_cmdline(contents: &[u8]) -> Result<VmId, IdentityError> {
    let mut args = contents.split(|b| *b == 0);
    if !args.any(|arg| arg == CMDLINE_ID_FLAG) {
        return Err(IdentityError::NoIdArgument);
    }

    let value = args.next().ok_or(IdentityError::NoIdArgument)?;
    VmId::parse(&String::from_utf8_lossy(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_id_rejects_zero_signs_and_garbage() {
        assert_eq!(VmId::parse("100").unwrap().as_str(), "100");
        assert!(VmId::parse("0").is_err());
        assert!(VmId::parse("").is_err());
        assert!(VmId::parse("-1").is_err());
        assert!(VmId::parse("+5").is_err());
        assert!(VmId::parse("12a").is_err());
        assert!(VmId::parse("1234567890123456").is_err());
    }

    #[test]
    fn cgroup_v2_entry_resolves() {
        let id = vm_id_from_cgroup("0::/qemu.slice/105.scope\n").unwrap();
        assert_eq!(id.as_str(), "105");
    }

    #[test]
    fn cgroup_v1_picks_first_qemu_slice_entry() {
        let contents = "12:pids:/user.slice\n\
                        11:cpu,cpuacct:/qemu.slice/200.scope\n\
                        10:memory:/qemu.slice/300.scope\n";
        assert_eq!(vm_id_from_cgroup(contents).unwrap().as_str(), "200");
    }

    #[test]
    fn cgroup_skips_malformed_entries() {
        let contents = "0::/qemu.slice/-4.scope\n\
                        0::/qemu.slice/abc.scope\n\
                        0::/qemu.slice/77.service\n\
                        garbage\n\
                        0::/qemu.slice/78.scope\n";
        assert_eq!(vm_id_from_cgroup(contents).unwrap().as_str(), "78");
    }

    #[test]
    fn cgroup_without_qemu_slice_fails() {
        let err = vm_id_from_cgroup("0::/user.slice/user-1000.slice/session-2.scope\n").unwrap_err();
        assert!(matches!(err, IdentityError::NoCgroupEntry));
    }

    #[test]
    fn cmdline_reads_value_after_id_flag() {
        let contents = b"/usr/bin/kvm\0-id\0117\0-name\0web,debug-threads=on\0";
        assert_eq!(vm_id_from_cmdline(contents).unwrap().as_str(), "117");
    }

    #[test]
    fn cmdline_rejects_missing_or_malformed_values() {
        assert!(matches!(
            vm_id_from_cmdline(b"/usr/bin/kvm\0-name\0web\0"),
            Err(IdentityError::NoIdArgument)
        ));
        assert!(matches!(
            vm_id_from_cmdline(b"/usr/bin/kvm\0-id"),
            Err(IdentityError::NoIdArgument)
        ));
        assert!(vm_id_from_cmdline(b"/usr/bin/kvm\0-id\0-name\0").is_err());
        assert!(vm_id_from_cmdline(b"/usr/bin/kvm\0-id\0\0").is_err());
        assert!(vm_id_from_cmdline(b"/usr/bin/kvm\0-id\012x\0").is_err());
    }

    #[test]
    fn resolving_a_plain_process_fails_gracefully() {
        let pid = std::process::id() as pid_t;
        match resolve_vm_id(pid) {
            Err(IdentityError::Unresolved { pid: reported, .. }) => assert_eq!(reported, pid),
            Ok(id) => panic!("test process unexpectedly resolved to vmid {id}"),
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
}
