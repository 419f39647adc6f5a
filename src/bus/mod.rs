//! Interface to the GPIB controller driving the instrument side

use async_trait::async_trait;

use crate::error::Result;

pub mod arbiter;
pub mod loopback;

/// Direction the addressed device is set up for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusDirection {
    /// Device accepts bytes from the controller
    Listen,
    /// Device sources bytes to the controller
    Talk,
}

/// Why a bus read stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadStop {
    /// EOI was asserted on the last accepted byte
    Eoi,
    /// End-of-line sequence seen
    EndOfLine,
    /// Matched the configured end byte
    EndChar,
    /// max_bytes accepted, the talker may have more
    Limit,
    /// Bus fault, handshake broke down
    Error,
}

/// A send that did not complete; carries how many bytes made it onto the bus
#[derive(Debug)]
pub struct SendError {
    pub sent: usize,
}

/// Static controller settings
#[derive(Clone, Debug)]
pub struct BusConfig {
    /// The controller's own primary address
    pub controller_address: u8,
    /// Assert EOI on the final byte of outgoing data
    pub eoi: bool,
    /// Optional end-of-string byte checked during reads
    pub eos: Option<u8>,
}
impl Default for BusConfig {
    fn default() -> Self {
        Self {
            controller_address: 0,
            eoi: true,
            eos: None,
        }
    }
}

/// Capability the gateway needs from a GPIB controller.
///
/// One implementation talks to real hardware; [`loopback::LoopbackBus`] is
/// an in-memory stand-in. Implementations may block for as long as they
/// like inside a transfer; the caller imposes timeouts from outside.
#[async_trait]
pub trait GpibBus: Send {
    fn config(&self) -> &BusConfig;

    /// Put the device at `primary` into the given direction. The bus must
    /// be unaddressed first when switching devices.
    async fn address_device(
        &mut self,
        primary: u8,
        secondary: Option<u8>,
        direction: BusDirection,
    ) -> Result<()>;

    /// Send untalk/unlisten, returning the bus to the idle state.
    async fn unaddress_device(&mut self) -> Result<()>;

    /// Send bytes to the addressed listener, asserting EOI on the final
    /// byte when requested. Returns the number of bytes sent.
    async fn send_data(&mut self, data: &[u8], assert_eoi: bool) -> Result<usize, SendError>;

    /// Accept bytes from the addressed talker into `sink` until EOI (when
    /// honored), an end byte, `max_bytes`, or a fault.
    async fn receive_data(
        &mut self,
        sink: &mut Vec<u8>,
        honor_eoi: bool,
        end_byte: Option<u8>,
        max_bytes: usize,
    ) -> ReadStop;
}
