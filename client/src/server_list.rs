//! The list of discovered servers, keyed by address.

use log::debug;
use shared::{NetAddress, ServerInfo};

/// Collection of [`ServerInfo`] records. Addresses are unique; lookups
/// are linear, which is fine at server-browser scale.
#[derive(Debug, Default)]
pub struct ServerList {
    entries: Vec<ServerInfo>,
    /// Set whenever the list changes in a way a browser UI would care
    /// about; the host clears it after repainting.
    pub dirty: bool,
}

impl ServerList {
    pub fn new() -> ServerList {
        ServerList::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn as_slice(&self) -> &[ServerInfo] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&ServerInfo> {
        self.entries.get(index)
    }

    pub fn find(&self, addr: &NetAddress) -> Option<&ServerInfo> {
        self.entries.iter().find(|si| si.address == *addr)
    }

    pub fn find_mut(&mut self, addr: &NetAddress) -> Option<&mut ServerInfo> {
        self.entries.iter_mut().find(|si| si.address == *addr)
    }

    pub fn find_or_create(&mut self, addr: &NetAddress) -> &mut ServerInfo {
        if let Some(index) = self.entries.iter().position(|si| si.address == *addr) {
            return &mut self.entries[index];
        }
        self.entries.push(ServerInfo::new(*addr));
        self.entries.last_mut().unwrap()
    }

    pub fn remove(&mut self, addr: &NetAddress) {
        let before = self.entries.len();
        self.entries.retain(|si| si.address != *addr);
        if self.entries.len() != before {
            debug!("Removed server record for {}", addr);
            self.dirty = true;
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.dirty = true;
    }
}
