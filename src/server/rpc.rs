//! RPC methods defined by VXI-11

use crate::error::Result;

use super::xdr::{self, XdrPack};

/// ONC program number of the DEVICE_CORE channel
pub const DEVICE_CORE_PROG: u32 = 0x0607AF;
pub const DEVICE_CORE_VERSION: u32 = 1;

/// DEVICE_CORE procedures the gateway serves; everything else is answered
/// with PROC_UNAVAIL
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Procedure {
    Null,
    CreateLink,
    DeviceWrite,
    DeviceRead,
    DestroyLink,
}
impl Procedure {
    pub fn from_number(proc_number: u32) -> Option<Self> {
        match proc_number {
            0 => Some(Self::Null),
            10 => Some(Self::CreateLink),
            11 => Some(Self::DeviceWrite),
            12 => Some(Self::DeviceRead),
            23 => Some(Self::DestroyLink),
            _ => None,
        }
    }
}

/// Error field of every DEVICE_CORE reply
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceErrorCode {
    NoError = 0,
    InvalidLinkIdentifier = 4,
    ParameterError = 5,
    OutOfResources = 9,
    IoTimeout = 15,
    IoError = 17,
}
impl XdrPack for DeviceErrorCode {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        (self as u32).pack_xdr(out);
    }
}

/// Flags field of DEVICE_WRITE / DEVICE_READ requests
#[derive(Clone, Copy, Debug)]
pub struct OperationFlags {
    /// Wait for lock even if lock timeout elapses
    pub wait_lock: bool,
    /// On write, the final byte completes the message (send with END)
    pub end: bool,
    /// On read, use termchr as termination character
    pub termchr_set: bool,
}
impl OperationFlags {
    pub fn from_bits(bits: u32) -> Self {
        Self {
            wait_lock: (bits & (1 << 0)) != 0,
            end: (bits & (1 << 3)) != 0,
            termchr_set: (bits & (1 << 7)) != 0,
        }
    }
}

/// Reason field of a DEVICE_READ reply
#[derive(Clone, Copy, Debug, Default)]
pub struct ReadReason {
    /// request_size bytes have been transferred
    pub reqcnt: bool,
    /// Match on termchr
    pub chr: bool,
    /// END indicator was read
    pub end: bool,
}
impl XdrPack for ReadReason {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        let mut reason = 0u32;
        if self.reqcnt {
            reason |= 1 << 0;
        }
        if self.chr {
            reason |= 1 << 1;
        }
        if self.end {
            reason |= 1 << 2;
        }
        reason.pack_xdr(out);
    }
}
impl ReadReason {
    /// A message-complete reply (END bit only, matching the original
    /// firmware which never set REQCNT or CHR)
    pub fn end() -> Self {
        Self {
            end: true,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct CreateLinkRequest {
    /// ID representing the client, unused by the gateway
    pub client_id: i32,
    /// Whether to lock the device
    pub lock_device: bool,
    /// How long to wait for a lock to be released
    pub lock_timeout: u32,
    /// Name of the device, e.g. "inst5" or "gpib0,5"
    pub device: String,
}
impl CreateLinkRequest {
    pub fn unpack(src: &mut Vec<u8>) -> Result<Self> {
        Ok(Self {
            client_id: xdr::unpack_i32(src)?,
            lock_device: xdr::unpack_bool(src)?,
            lock_timeout: xdr::unpack_u32(src)?,
            device: xdr::unpack_string(src)?,
        })
    }
}

#[derive(Debug)]
pub struct CreateLinkResponse {
    pub error: DeviceErrorCode,
    /// Assigned link ID; the table slot number
    pub lid: i32,
    /// Abort channel port; 0, the gateway has no DEVICE_ASYNC channel
    pub abort_port: u16,
    /// Max data size the gateway accepts in a single write
    pub max_recv_size: u32,
}
impl XdrPack for CreateLinkResponse {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.error.pack_xdr(out);
        self.lid.pack_xdr(out);
        (self.abort_port as u32).pack_xdr(out);
        self.max_recv_size.pack_xdr(out);
    }
}
impl CreateLinkResponse {
    /// Refusal carrying only the error code
    pub fn refused(error: DeviceErrorCode) -> Self {
        Self {
            error,
            lid: 0,
            abort_port: 0,
            max_recv_size: 0,
        }
    }
}

#[derive(Debug)]
pub struct DeviceWriteRequest {
    pub lid: i32,
    /// Time to wait for I/O, milliseconds
    pub io_timeout: u32,
    /// Time to wait for lock, milliseconds
    pub lock_timeout: u32,
    pub flags: OperationFlags,
    pub data: Vec<u8>,
}
impl DeviceWriteRequest {
    pub fn unpack(src: &mut Vec<u8>) -> Result<Self> {
        Ok(Self {
            lid: xdr::unpack_i32(src)?,
            io_timeout: xdr::unpack_u32(src)?,
            lock_timeout: xdr::unpack_u32(src)?,
            flags: OperationFlags::from_bits(xdr::unpack_u32(src)?),
            data: xdr::unpack_opaque(src)?,
        })
    }
}

#[derive(Debug)]
pub struct DeviceWriteResponse {
    pub error: DeviceErrorCode,
    /// Number of bytes accepted from the request
    pub size: u32,
}
impl XdrPack for DeviceWriteResponse {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.error.pack_xdr(out);
        self.size.pack_xdr(out);
    }
}

#[derive(Debug)]
pub struct DeviceReadRequest {
    pub lid: i32,
    /// Bytes requested; 0 means as much as fits in one response
    pub request_size: u32,
    pub io_timeout: u32,
    pub lock_timeout: u32,
    pub flags: OperationFlags,
    /// Termination character, honored when flags.termchr_set
    pub termchr: u8,
}
impl DeviceReadRequest {
    pub fn unpack(src: &mut Vec<u8>) -> Result<Self> {
        Ok(Self {
            lid: xdr::unpack_i32(src)?,
            request_size: xdr::unpack_u32(src)?,
            io_timeout: xdr::unpack_u32(src)?,
            lock_timeout: xdr::unpack_u32(src)?,
            flags: OperationFlags::from_bits(xdr::unpack_u32(src)?),
            termchr: (xdr::unpack_u32(src)? & 0xFF) as u8,
        })
    }
}

#[derive(Debug)]
pub struct DeviceReadResponse {
    pub error: DeviceErrorCode,
    pub reason: ReadReason,
    pub data: Vec<u8>,
}
impl XdrPack for DeviceReadResponse {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.error.pack_xdr(out);
        self.reason.pack_xdr(out);
        self.data.pack_xdr(out);
    }
}

#[derive(Debug)]
pub struct DestroyLinkRequest {
    pub lid: i32,
}
impl DestroyLinkRequest {
    pub fn unpack(src: &mut Vec<u8>) -> Result<Self> {
        Ok(Self {
            lid: xdr::unpack_i32(src)?,
        })
    }
}

/// Reply body shared by DESTROY_LINK and other error-only procedures
#[derive(Debug)]
pub struct DeviceErrorResponse {
    pub error: DeviceErrorCode,
}
impl XdrPack for DeviceErrorResponse {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.error.pack_xdr(out);
    }
}
