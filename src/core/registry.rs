use std::collections::HashMap;
use std::collections::hash_map::Entry;

use super::client::ConnectionId;
use super::identity::VmId;

/// Maps each registered VM to the connection that completed its handshake.
/// Entries hold connection ids, never the connections themselves, so a
/// lookup after teardown simply misses.
#[derive(Debug, Default)]
pub struct VmRegistry {
    entries: HashMap<VmId, ConnectionId>,
}

/// Returned when an identity is already claimed by another connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupied {
    pub existing: ConnectionId,
}

impl VmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `conn` under `vmid`. An existing entry is left untouched.
    pub fn insert(&mut self, vmid: VmId, conn: ConnectionId) -> Result<(), Occupied> {
        match self.entries.entry(vmid) {
            Entry::Occupied(entry) => Err(Occupied {
                existing: *entry.get(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(conn);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, vmid: &str) -> Option<ConnectionId> {
        self.entries.get(vmid).copied()
    }

    /// Removes the entry for `vmid`. Missing keys are fine.
    pub fn remove(&mut self, vmid: &VmId) -> Option<ConnectionId> {
        self.entries.remove(vmid)
    }

    /// Removes the entry only while it still belongs to `conn`.
    pub fn remove_owned(&mut self, vmid: &VmId, conn: ConnectionId) -> bool {
        if self.lookup(vmid.as_str()) == Some(conn) {
            self.entries.remove(vmid);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
