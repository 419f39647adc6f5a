//! Serialises bus access across client links.
//!
//! There is one GPIB bus and any number of VXI links; every data transfer
//! goes through a [`BusGrant`] handed out in request-arrival order. A
//! grant may be kept across calls, which is how a multi-fragment write
//! keeps its listener addressed until the END fragment arrives.

use std::{sync::Arc, time::Duration};

use log::{debug, warn};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{BusDirection, GpibBus, ReadStop};

/// Outcome of a read through the arbiter
#[derive(Debug)]
pub enum BusReadOutcome {
    /// Message complete: EOI, end byte, or end-of-line
    End(Vec<u8>),
    /// Byte limit reached; the talker stays addressed and has more
    Limit(Vec<u8>),
    /// No byte within the allowed time
    Timeout,
    /// Handshake fault
    Error,
}

struct Shared {
    bus: Box<dyn GpibBus>,
    /// What the controller currently has addressed; None = idle bus
    addressed: Option<(u8, BusDirection)>,
}
impl Shared {
    /// Bring the bus to `(address, direction)`, cycling through unaddress
    /// when it is currently pointed elsewhere.
    async fn ensure_addressed(&mut self, address: u8, direction: BusDirection) -> bool {
        if self.addressed == Some((address, direction)) {
            return true;
        }
        if self.addressed.is_some() && self.bus.unaddress_device().await.is_err() {
            self.addressed = None;
            return false;
        }
        self.addressed = None;
        if self
            .bus
            .address_device(address, None, direction)
            .await
            .is_err()
        {
            return false;
        }
        self.addressed = Some((address, direction));
        true
    }

    async fn unaddress(&mut self) {
        if self.addressed.is_some() {
            if let Err(e) = self.bus.unaddress_device().await {
                warn!("Failed to unaddress the bus: {e}");
            }
            self.addressed = None;
        }
    }
}

/// Hands out exclusive bus access in FIFO order across links
#[derive(Clone)]
pub struct BusArbiter {
    shared: Arc<Mutex<Shared>>,
}
impl BusArbiter {
    pub fn new(bus: Box<dyn GpibBus>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                bus,
                addressed: None,
            })),
        }
    }

    /// Wait for the bus. Waiters are queued and served in arrival order.
    pub async fn acquire(&self) -> BusGrant {
        BusGrant {
            shared: self.shared.clone().lock_owned().await,
        }
    }
}

/// Exclusive hold on the bus
pub struct BusGrant {
    shared: OwnedMutexGuard<Shared>,
}
impl BusGrant {
    /// Transmit `data` to the listener at `address`, asserting EOI on the
    /// final byte iff `end`. On END the bus is returned to idle; without
    /// END the device stays addressed for the next fragment.
    ///
    /// Returns the byte count actually sent; `Err` means the transfer did
    /// not complete.
    pub async fn write(
        &mut self,
        address: u8,
        data: &[u8],
        end: bool,
        timeout: Duration,
    ) -> Result<usize, usize> {
        if !self
            .shared
            .ensure_addressed(address, BusDirection::Listen)
            .await
        {
            return Err(0);
        }

        let sent = match tokio::time::timeout(timeout, self.shared.bus.send_data(data, end)).await
        {
            Ok(Ok(sent)) => sent,
            Ok(Err(e)) => {
                debug!("Bus write to {address} failed after {} bytes", e.sent);
                self.shared.unaddress().await;
                return Err(e.sent);
            }
            Err(_) => {
                debug!("Bus write to {address} timed out");
                self.shared.unaddress().await;
                return Err(0);
            }
        };

        if end {
            self.shared.unaddress().await;
        }
        Ok(sent)
    }

    /// Accept up to `max_bytes` from the talker at `address`. Except for a
    /// limit stop the bus is returned to idle afterwards; a limit stop
    /// keeps the talker addressed so a follow-up read continues the
    /// message.
    pub async fn read(
        &mut self,
        address: u8,
        max_bytes: usize,
        end_byte: Option<u8>,
        timeout: Duration,
    ) -> BusReadOutcome {
        if !self
            .shared
            .ensure_addressed(address, BusDirection::Talk)
            .await
        {
            return BusReadOutcome::Error;
        }

        let mut sink = Vec::new();
        let stop = tokio::time::timeout(
            timeout,
            self.shared
                .bus
                .receive_data(&mut sink, true, end_byte, max_bytes),
        )
        .await;

        match stop {
            Ok(ReadStop::Limit) => BusReadOutcome::Limit(sink),
            Ok(ReadStop::Eoi | ReadStop::EndOfLine | ReadStop::EndChar) => {
                self.shared.unaddress().await;
                BusReadOutcome::End(sink)
            }
            Ok(ReadStop::Error) => {
                self.shared.unaddress().await;
                BusReadOutcome::Error
            }
            Err(_) => {
                debug!("Bus read from {address} timed out");
                self.shared.unaddress().await;
                BusReadOutcome::Timeout
            }
        }
    }

    /// Give the bus up, leaving it idle. Used when a link abandons a
    /// fragment sequence or goes away mid-hold.
    pub async fn release(mut self) {
        self.shared.unaddress().await;
    }
}
