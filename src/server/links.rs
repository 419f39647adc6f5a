//! Link table: one slot per connected VXI client.
//!
//! The slot index is the `link_id` clients see on the wire. A slot is
//! taken the moment a connection is accepted and given back when the
//! session ends, so the table size is also the accept limit.

use std::net::SocketAddr;

use tokio::time::Instant;

/// One VXI-11 session
#[derive(Debug)]
pub struct Link {
    pub peer: SocketAddr,
    /// GPIB primary address, set once by a successful CREATE_LINK.
    /// None until then; 0 is the gateway's own address.
    pub gpib_address: Option<u8>,
    pub created_at: Instant,
}

pub struct LinkTable {
    slots: Vec<Option<Link>>,
}
impl LinkTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Claim the lowest free slot for a new connection
    pub fn allocate(&mut self, peer: SocketAddr) -> Option<usize> {
        let slot = self.slots.iter().position(|s| s.is_none())?;
        self.slots[slot] = Some(Link {
            peer,
            gpib_address: None,
            created_at: Instant::now(),
        });
        Some(slot)
    }

    pub fn free(&mut self, slot: usize) {
        if let Some(entry) = self.slots.get_mut(slot) {
            *entry = None;
        }
    }

    pub fn set_address(&mut self, slot: usize, address: u8) {
        if let Some(Some(link)) = self.slots.get_mut(slot) {
            link.gpib_address = Some(address);
        }
    }

    pub fn address(&self, slot: usize) -> Option<u8> {
        self.slots.get(slot)?.as_ref()?.gpib_address
    }

    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}
