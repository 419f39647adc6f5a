//! In-memory bus backend: scripted instruments instead of hardware.
//!
//! Serves two purposes: it drives the test suite, and it lets the gateway
//! binary come up without a controller attached.

use std::{
    collections::{HashMap, VecDeque},
    future::pending,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use super::{BusConfig, BusDirection, GpibBus, ReadStop, SendError};
use crate::error::{Error, Result};

/// Everything that happened on the simulated bus, in order
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusEvent {
    Address { primary: u8, direction: BusDirection },
    Unaddress,
    Send { data: Vec<u8>, eoi: bool },
    Receive { len: usize, stop: ReadStop },
}

/// Shared handle onto the recorded bus events
#[derive(Clone, Default)]
pub struct BusTrace(Arc<Mutex<Vec<BusEvent>>>);
impl BusTrace {
    fn record(&self, event: BusEvent) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }

    pub fn events(&self) -> Vec<BusEvent> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

#[derive(Default)]
struct LoopbackDevice {
    /// Queued outbound messages; the front one may be partially consumed
    output: VecDeque<Vec<u8>>,
    /// Bytes received since the last EOI
    partial: Vec<u8>,
    /// Invoked with each complete received message
    responder: Option<Responder>,
}

pub struct LoopbackBus {
    config: BusConfig,
    addressed: Option<(u8, BusDirection)>,
    devices: HashMap<u8, LoopbackDevice>,
    trace: BusTrace,
}
impl LoopbackBus {
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Self {
        Self {
            config,
            addressed: None,
            devices: HashMap::new(),
            trace: BusTrace::default(),
        }
    }

    /// Handle for inspecting bus activity after the bus has been handed to
    /// the gateway
    pub fn trace(&self) -> BusTrace {
        self.trace.clone()
    }

    /// Register an instrument at `address` that accepts data but says
    /// nothing on its own
    pub fn add_device(&mut self, address: u8) {
        self.devices.entry(address).or_default();
    }

    /// Queue one message the instrument at `address` will talk when read
    pub fn push_response(&mut self, address: u8, data: impl Into<Vec<u8>>) {
        self.devices
            .entry(address)
            .or_default()
            .output
            .push_back(data.into());
    }

    /// Install a handler invoked with every complete message the
    /// instrument at `address` receives; a returned reply is queued as its
    /// next response
    pub fn set_responder(
        &mut self,
        address: u8,
        responder: impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    ) {
        self.devices.entry(address).or_default().responder = Some(Box::new(responder));
    }
}
impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}
#[async_trait]
impl GpibBus for LoopbackBus {
    fn config(&self) -> &BusConfig {
        &self.config
    }

    async fn address_device(
        &mut self,
        primary: u8,
        _secondary: Option<u8>,
        direction: BusDirection,
    ) -> Result<()> {
        if self.addressed.is_some() {
            return Err(Error::Unspecified(
                "Bus is still addressed, unaddress first".into(),
            ));
        }
        self.addressed = Some((primary, direction));
        self.trace.record(BusEvent::Address { primary, direction });
        Ok(())
    }

    async fn unaddress_device(&mut self) -> Result<()> {
        self.addressed = None;
        self.trace.record(BusEvent::Unaddress);
        Ok(())
    }

    async fn send_data(&mut self, data: &[u8], assert_eoi: bool) -> Result<usize, SendError> {
        let Some((address, BusDirection::Listen)) = self.addressed else {
            return Err(SendError { sent: 0 });
        };
        // No device at the address: the handshake never completes
        let Some(device) = self.devices.get_mut(&address) else {
            return Err(SendError { sent: 0 });
        };

        device.partial.extend_from_slice(data);
        self.trace.record(BusEvent::Send {
            data: data.to_vec(),
            eoi: assert_eoi,
        });

        if assert_eoi {
            let message = std::mem::take(&mut device.partial);
            if !message.is_empty() {
                if let Some(responder) = &mut device.responder {
                    if let Some(reply) = responder(&message) {
                        device.output.push_back(reply);
                    }
                }
            }
        }

        Ok(data.len())
    }

    async fn receive_data(
        &mut self,
        sink: &mut Vec<u8>,
        honor_eoi: bool,
        end_byte: Option<u8>,
        max_bytes: usize,
    ) -> ReadStop {
        let Some((address, BusDirection::Talk)) = self.addressed else {
            return ReadStop::Error;
        };
        let end_byte = end_byte.or(self.config.eos);

        let stop = loop {
            let Some(device) = self.devices.get_mut(&address) else {
                // Nothing is talking; hang until the caller gives up
                pending::<()>().await;
                unreachable!()
            };
            let Some(message) = device.output.front_mut() else {
                pending::<()>().await;
                unreachable!()
            };

            if sink.len() >= max_bytes {
                break ReadStop::Limit;
            }

            let byte = message.remove(0);
            let exhausted = message.is_empty();
            if exhausted {
                device.output.pop_front();
            }
            sink.push(byte);

            if end_byte == Some(byte) {
                break ReadStop::EndChar;
            }
            if exhausted && honor_eoi {
                break ReadStop::Eoi;
            }
        };

        self.trace.record(BusEvent::Receive {
            len: sink.len(),
            stop,
        });
        stop
    }
}
