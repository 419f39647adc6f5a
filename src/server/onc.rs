//! Open Network Computing (ONC) RPC protocol, as defined by RFC5531.
//!
//! Server direction: calls are decoded, replies are encoded. Reply
//! decoding is also provided for client-side use by the test suite.

use std::{future::Future, mem, time::Duration};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

use super::xdr::{self, XdrPack};

pub const RPC_VERSION: u32 = 2;

pub const LAST_FRAGMENT_MARKER: u32 = 0x80000000;

const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;

const REPLY_ACCEPTED: u32 = 0;
const REPLY_DENIED: u32 = 1;

/* accept_stat */
const ACCEPT_SUCCESS: u32 = 0;
const ACCEPT_PROG_UNAVAIL: u32 = 1;
const ACCEPT_PROG_MISMATCH: u32 = 2;
const ACCEPT_PROC_UNAVAIL: u32 = 3;
const ACCEPT_GARBAGE_ARGS: u32 = 4;
const ACCEPT_SYSTEM_ERR: u32 = 5;

/* reject_stat */
const REJECT_RPC_MISMATCH: u32 = 0;
const REJECT_AUTH_ERROR: u32 = 1;

#[repr(u32)]
#[derive(Clone, Copy, Debug)]
pub enum AuthFlavor {
    Null = 0,
    Sys = 1,
    Short = 2,
    Dh = 3,
    RpcSecGss = 4,
}

#[derive(Debug)]
pub struct OpaqueAuth {
    pub flavor: AuthFlavor,
    pub body: Vec<u8>,
}
impl OpaqueAuth {
    pub fn unpack(src: &mut Vec<u8>) -> Result<Self> {
        Ok(Self {
            flavor: match xdr::unpack_u32(src)? {
                0 => AuthFlavor::Null,
                1 => AuthFlavor::Sys,
                2 => AuthFlavor::Short,
                3 => AuthFlavor::Dh,
                4 => AuthFlavor::RpcSecGss,
                i => return Err(Error::BadPacket(format!("Unknown auth flavor {}", i))),
            },
            body: xdr::unpack_opaque(src)?,
        })
    }

    pub fn new_null() -> Self {
        Self {
            flavor: AuthFlavor::Null,
            body: vec![],
        }
    }
}
impl XdrPack for OpaqueAuth {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        (self.flavor as u32).pack_xdr(out);
        self.body.pack_xdr(out);
    }
}

/// A decoded CALL. The credentials are parsed only to find the start of
/// the arguments; their content is ignored.
#[derive(Debug)]
pub struct RpcCall {
    pub xid: u32,
    pub rpc_version: u32,
    pub prog: u32,
    pub vers: u32,
    pub proc: u32,
    pub cred: OpaqueAuth,
    pub verf: OpaqueAuth,
    pub args: Vec<u8>,
}
impl RpcCall {
    pub fn unpack(src: &mut Vec<u8>) -> Result<Self> {
        let xid = xdr::unpack_u32(src)?;
        let msg_type = xdr::unpack_u32(src)?;
        if msg_type != MSG_CALL {
            return Err(Error::BadPacket(format!(
                "Expected a CALL message, got type {}",
                msg_type
            )));
        }
        Ok(Self {
            xid,
            rpc_version: xdr::unpack_u32(src)?,
            prog: xdr::unpack_u32(src)?,
            vers: xdr::unpack_u32(src)?,
            proc: xdr::unpack_u32(src)?,
            cred: OpaqueAuth::unpack(src)?,
            verf: OpaqueAuth::unpack(src)?,
            args: mem::take(src),
        })
    }
}
impl XdrPack for RpcCall {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.xid.pack_xdr(out);
        MSG_CALL.pack_xdr(out);
        self.rpc_version.pack_xdr(out);
        self.prog.pack_xdr(out);
        self.vers.pack_xdr(out);
        self.proc.pack_xdr(out);
        self.cred.pack_xdr(out);
        self.verf.pack_xdr(out);
        out.extend(self.args);
    }
}

/// Reply the server sends for one call. `Success` carries results that are
/// already XDR-encoded.
#[derive(Debug)]
pub enum RpcReply {
    Success(Vec<u8>),
    ProgUnavail,
    ProgMismatch { low: u32, high: u32 },
    ProcUnavail,
    GarbageArgs,
    /// Rejected reply: rpc_version outside [low, high]
    RpcMismatch { low: u32, high: u32 },
}
impl RpcReply {
    /// Produce the reply message for transaction `xid`. Accepted replies
    /// carry an AUTH_NULL verifier.
    pub fn pack(self, xid: u32) -> Vec<u8> {
        let mut out = vec![];
        xid.pack_xdr(&mut out);
        MSG_REPLY.pack_xdr(&mut out);

        if let Self::RpcMismatch { low, high } = self {
            REPLY_DENIED.pack_xdr(&mut out);
            REJECT_RPC_MISMATCH.pack_xdr(&mut out);
            low.pack_xdr(&mut out);
            high.pack_xdr(&mut out);
            return out;
        }

        REPLY_ACCEPTED.pack_xdr(&mut out);
        OpaqueAuth::new_null().pack_xdr(&mut out);
        match self {
            Self::Success(results) => {
                ACCEPT_SUCCESS.pack_xdr(&mut out);
                out.extend(results);
            }
            Self::ProgUnavail => ACCEPT_PROG_UNAVAIL.pack_xdr(&mut out),
            Self::ProgMismatch { low, high } => {
                ACCEPT_PROG_MISMATCH.pack_xdr(&mut out);
                low.pack_xdr(&mut out);
                high.pack_xdr(&mut out);
            }
            Self::ProcUnavail => ACCEPT_PROC_UNAVAIL.pack_xdr(&mut out),
            Self::GarbageArgs => ACCEPT_GARBAGE_ARGS.pack_xdr(&mut out),
            Self::RpcMismatch { .. } => unreachable!(),
        }
        out
    }
}

/// A decoded reply, as seen from the client side
#[derive(Debug)]
pub enum ReplyBody {
    Success(Vec<u8>),
    ProgUnavail,
    ProgMismatch { low: u32, high: u32 },
    ProcUnavail,
    GarbageArgs,
    SystemErr,
    RpcMismatch { low: u32, high: u32 },
    AuthError(u32),
}

#[derive(Debug)]
pub struct DecodedReply {
    pub xid: u32,
    pub body: ReplyBody,
}
impl DecodedReply {
    pub fn unpack(src: &mut Vec<u8>) -> Result<Self> {
        let xid = xdr::unpack_u32(src)?;
        let msg_type = xdr::unpack_u32(src)?;
        if msg_type != MSG_REPLY {
            return Err(Error::BadPacket(format!(
                "Expected a REPLY message, got type {}",
                msg_type
            )));
        }

        let body = match xdr::unpack_u32(src)? {
            REPLY_ACCEPTED => {
                let _verf = OpaqueAuth::unpack(src)?;
                match xdr::unpack_u32(src)? {
                    ACCEPT_SUCCESS => ReplyBody::Success(mem::take(src)),
                    ACCEPT_PROG_UNAVAIL => ReplyBody::ProgUnavail,
                    ACCEPT_PROG_MISMATCH => ReplyBody::ProgMismatch {
                        low: xdr::unpack_u32(src)?,
                        high: xdr::unpack_u32(src)?,
                    },
                    ACCEPT_PROC_UNAVAIL => ReplyBody::ProcUnavail,
                    ACCEPT_GARBAGE_ARGS => ReplyBody::GarbageArgs,
                    ACCEPT_SYSTEM_ERR => ReplyBody::SystemErr,
                    i => {
                        return Err(Error::BadPacket(format!(
                            "Unknown accepted reply type {}",
                            i
                        )));
                    }
                }
            }
            REPLY_DENIED => match xdr::unpack_u32(src)? {
                REJECT_RPC_MISMATCH => ReplyBody::RpcMismatch {
                    low: xdr::unpack_u32(src)?,
                    high: xdr::unpack_u32(src)?,
                },
                REJECT_AUTH_ERROR => ReplyBody::AuthError(xdr::unpack_u32(src)?),
                i => {
                    return Err(Error::BadPacket(format!(
                        "Unknown rejected reply type {}",
                        i
                    )));
                }
            },
            i => return Err(Error::BadPacket(format!("Unknown reply status {}", i))),
        };

        Ok(Self { xid, body })
    }

    /// Results of a successful accepted reply, anything else is an error
    pub fn success(self) -> Result<Vec<u8>> {
        match self.body {
            ReplyBody::Success(results) => Ok(results),
            body => Err(Error::Unspecified(format!(
                "Reply is not a success: {:?}",
                body
            ))),
        }
    }
}

/// One inbound TCP record
#[derive(Debug)]
pub enum Record {
    Message(Vec<u8>),
    /// Record exceeded the configured cap and was drained; the xid is
    /// recovered from the head when possible so the peer can be told
    Oversized { xid: Option<u32> },
    /// Clean end of stream at a record boundary
    Closed,
}

async fn timed<T>(cap: Duration, fut: impl Future<Output = std::io::Result<T>>) -> Result<T> {
    match tokio::time::timeout(cap, fut).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(Error::Timeout("RPC stream stalled mid-record".into())),
    }
}

/// Read one record-marked message. Waiting for the first byte of a record
/// is unbounded (idle sessions stay up); once a record has started, every
/// read is bounded by `io_cap`. Multi-fragment records are accepted up to
/// `max_len` total; beyond that the record is drained and reported as
/// [`Record::Oversized`].
pub async fn read_record<S>(stream: &mut S, max_len: usize, io_cap: Duration) -> Result<Record>
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = vec![];
    let mut total = 0usize;
    let mut first_header = true;

    loop {
        let mut header = [0u8; 4];
        if first_header {
            match stream.read_exact(&mut header).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(Record::Closed);
                }
                Err(e) => return Err(e.into()),
            }
            first_header = false;
        } else {
            timed(io_cap, stream.read_exact(&mut header)).await?;
        }

        let header = u32::from_be_bytes(header);
        let last = (header & LAST_FRAGMENT_MARKER) != 0;
        let len = (header & !LAST_FRAGMENT_MARKER) as usize;
        total += len;

        let mut remaining = len;
        let mut chunk = [0u8; 1024];
        while remaining > 0 {
            let take = remaining.min(chunk.len());
            timed(io_cap, stream.read_exact(&mut chunk[..take])).await?;
            // Past the cap the bytes are drained but no longer kept
            let keep = take.min(max_len.saturating_sub(buf.len()));
            buf.extend_from_slice(&chunk[..keep]);
            remaining -= take;
        }

        if last {
            break;
        }
    }

    if total > max_len {
        let xid = (buf.len() >= 4).then(|| u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]));
        return Ok(Record::Oversized { xid });
    }
    Ok(Record::Message(buf))
}

/// Write one message as a single-fragment record
pub async fn write_record<S>(stream: &mut S, payload: &[u8], io_cap: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let header = payload.len() as u32 | LAST_FRAGMENT_MARKER;
    let mut packet = Vec::with_capacity(payload.len() + 4);
    packet.extend_from_slice(&header.to_be_bytes());
    packet.extend_from_slice(payload);

    timed(io_cap, stream.write_all(&packet)).await
}
