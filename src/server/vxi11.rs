//! VXI-11 core channel server, referencing VXI-11 1.0 specification.
//!
//! One task per accepted connection. A connection is bound to a link
//! table slot at accept time; the slot number becomes the link id handed
//! out by CREATE_LINK. All bus traffic goes through the arbiter, and a
//! write without END keeps its bus grant parked in the session so the
//! message cannot be interleaved with another link's traffic.

use std::{net::SocketAddr, sync::Arc};

use log::{debug, info, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::Mutex,
};

use crate::{
    bus::arbiter::{BusArbiter, BusGrant, BusReadOutcome},
    config::GatewayConfig,
    error::Result,
};

use super::{
    links::LinkTable,
    onc::{self, RPC_VERSION, Record, RpcCall, RpcReply},
    rpc::{self, DeviceErrorCode, Procedure, ReadReason},
    xdr::XdrPack,
};

/// Parse a VISA device name into a GPIB primary address: `inst<N>`, or
/// `gpib<K>,<N>` / `hpib<K>,<N>` where the interface number K is ignored.
/// Valid primary addresses are 0..=30; 0 is the gateway itself.
fn parse_device_name(name: &str) -> Option<u8> {
    let name = name.trim().to_ascii_lowercase();

    let address = if let Some(rest) = name.strip_prefix("inst") {
        rest
    } else {
        let rest = name
            .strip_prefix("gpib")
            .or_else(|| name.strip_prefix("hpib"))?;
        let (interface, address) = rest.split_once(',')?;
        if !interface.is_empty() && interface.parse::<u8>().is_err() {
            return None;
        }
        address
    };

    let address: u8 = address.parse().ok()?;
    (address <= 30).then_some(address)
}

/// TCP front-end for the DEVICE_CORE program
pub struct CoreServer {
    listener: TcpListener,
    links: Arc<Mutex<LinkTable>>,
    arbiter: BusArbiter,
    config: Arc<GatewayConfig>,
}
impl CoreServer {
    pub async fn bind(
        config: Arc<GatewayConfig>,
        links: Arc<Mutex<LinkTable>>,
        arbiter: BusArbiter,
    ) -> Result<Self> {
        let listener = TcpListener::bind((config.bind_addr, config.vxi_port)).await?;
        info!(
            "VXI-11 core server listening on port {}",
            listener.local_addr()?.port()
        );
        Ok(Self {
            listener,
            links,
            arbiter,
            config,
        })
    }

    /// The actually bound port (relevant when configured with port 0)
    pub fn port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let slot = self.links.lock().await.allocate(peer);
            let Some(slot) = slot else {
                // Hard ceiling: close without any RPC reply
                debug!("VXI connection limit reached, refusing {peer}");
                continue;
            };
            debug!("New VXI connection in slot {slot} from {peer}");

            let session = Session {
                slot,
                peer,
                links: self.links.clone(),
                arbiter: self.arbiter.clone(),
                config: self.config.clone(),
                address: None,
                held: None,
            };
            tokio::spawn(session.serve(stream));
        }
    }
}

enum Next {
    Continue,
    Close,
}

struct Session {
    slot: usize,
    peer: SocketAddr,
    links: Arc<Mutex<LinkTable>>,
    arbiter: BusArbiter,
    config: Arc<GatewayConfig>,
    /// Mirror of this slot's link address
    address: Option<u8>,
    /// Bus hold carried across write fragments until END arrives
    held: Option<BusGrant>,
}
impl Session {
    async fn serve(mut self, mut stream: TcpStream) {
        if let Err(e) = self.serve_stream(&mut stream).await {
            debug!("VXI session in slot {} ended: {e}", self.slot);
        }
        // Whatever ended the session, the bus and the slot come back
        if let Some(grant) = self.held.take() {
            grant.release().await;
        }
        self.links.lock().await.free(self.slot);
        debug!("Closed VXI connection in slot {} from {}", self.slot, self.peer);
    }

    async fn serve_stream(&mut self, stream: &mut TcpStream) -> Result<()> {
        let io_cap = self.config.io_timeout_cap;
        loop {
            let mut packet =
                match onc::read_record(stream, self.config.max_record_size(), io_cap).await? {
                    Record::Closed => return Ok(()),
                    Record::Oversized { xid } => {
                        warn!("Oversized RPC record in slot {}, dropping client", self.slot);
                        if let Some(xid) = xid {
                            onc::write_record(stream, &RpcReply::GarbageArgs.pack(xid), io_cap)
                                .await?;
                        }
                        return Ok(());
                    }
                    Record::Message(packet) => packet,
                };

            // An undecodable call header leaves no xid to reply to
            let call = RpcCall::unpack(&mut packet)?;
            let (reply, next) = self.dispatch(call).await;
            onc::write_record(stream, &reply, io_cap).await?;
            if matches!(next, Next::Close) {
                return Ok(());
            }
        }
    }

    async fn dispatch(&mut self, mut call: RpcCall) -> (Vec<u8>, Next) {
        let xid = call.xid;

        if call.rpc_version != RPC_VERSION {
            let reply = RpcReply::RpcMismatch {
                low: RPC_VERSION,
                high: RPC_VERSION,
            };
            return (reply.pack(xid), Next::Continue);
        }
        if call.prog != rpc::DEVICE_CORE_PROG {
            debug!(
                "Invalid program {:#x} in slot {} (expected DEVICE_CORE {:#x})",
                call.prog,
                self.slot,
                rpc::DEVICE_CORE_PROG
            );
            return (RpcReply::ProgUnavail.pack(xid), Next::Continue);
        }
        if call.vers != rpc::DEVICE_CORE_VERSION {
            let reply = RpcReply::ProgMismatch {
                low: rpc::DEVICE_CORE_VERSION,
                high: rpc::DEVICE_CORE_VERSION,
            };
            return (reply.pack(xid), Next::Continue);
        }

        let Some(procedure) = Procedure::from_number(call.proc) else {
            debug!("Invalid VXI-11 procedure {} in slot {}", call.proc, self.slot);
            return (RpcReply::ProcUnavail.pack(xid), Next::Continue);
        };

        match procedure {
            Procedure::Null => (RpcReply::Success(vec![]).pack(xid), Next::Continue),
            Procedure::CreateLink => match rpc::CreateLinkRequest::unpack(&mut call.args) {
                Ok(req) => {
                    let (resp, next) = self.create_link(req).await;
                    (Self::success(xid, resp), next)
                }
                Err(_) => (RpcReply::GarbageArgs.pack(xid), Next::Continue),
            },
            Procedure::DeviceWrite => match rpc::DeviceWriteRequest::unpack(&mut call.args) {
                Ok(req) => (Self::success(xid, self.device_write(req).await), Next::Continue),
                Err(_) => (RpcReply::GarbageArgs.pack(xid), Next::Continue),
            },
            Procedure::DeviceRead => match rpc::DeviceReadRequest::unpack(&mut call.args) {
                Ok(req) => (Self::success(xid, self.device_read(req).await), Next::Continue),
                Err(_) => (RpcReply::GarbageArgs.pack(xid), Next::Continue),
            },
            Procedure::DestroyLink => match rpc::DestroyLinkRequest::unpack(&mut call.args) {
                Ok(req) => {
                    let (resp, next) = self.destroy_link(req).await;
                    (Self::success(xid, resp), next)
                }
                Err(_) => (RpcReply::GarbageArgs.pack(xid), Next::Continue),
            },
        }
    }

    fn success(xid: u32, body: impl XdrPack) -> Vec<u8> {
        let mut results = vec![];
        body.pack_xdr(&mut results);
        RpcReply::Success(results).pack(xid)
    }

    async fn create_link(&mut self, req: rpc::CreateLinkRequest) -> (rpc::CreateLinkResponse, Next) {
        if req.lock_device {
            // Locks are not supported; refuse and drop the client
            debug!("CREATE LINK from {} requests a lock, refusing", self.peer);
            return (
                rpc::CreateLinkResponse::refused(DeviceErrorCode::OutOfResources),
                Next::Close,
            );
        }
        if self.address.is_some() {
            debug!("CREATE LINK on slot {} which already has a link", self.slot);
            return (
                rpc::CreateLinkResponse::refused(DeviceErrorCode::OutOfResources),
                Next::Continue,
            );
        }
        let Some(address) = parse_device_name(&req.device) else {
            debug!("CREATE LINK with unusable device name {:?}", req.device);
            return (
                rpc::CreateLinkResponse::refused(DeviceErrorCode::ParameterError),
                Next::Continue,
            );
        };

        debug!(
            "CREATE LINK {:?} from {} -> address {address}, LID={}",
            req.device, self.peer, self.slot
        );
        self.links.lock().await.set_address(self.slot, address);
        self.address = Some(address);

        (
            rpc::CreateLinkResponse {
                error: DeviceErrorCode::NoError,
                lid: self.slot as i32,
                abort_port: 0,
                max_recv_size: self.config.max_write_size as u32,
            },
            Next::Continue,
        )
    }

    /// Resolve a request's link id to the bus address its traffic targets.
    /// `Ok(None)` means the gateway itself answers (address 0 with no
    /// default-instrument redirect configured).
    fn target(&self, lid: i32) -> Result<Option<u8>, DeviceErrorCode> {
        let address = self
            .address
            .filter(|_| lid == self.slot as i32)
            .ok_or(DeviceErrorCode::InvalidLinkIdentifier)?;

        let address = if address == 0 {
            self.config.default_instrument
        } else {
            address
        };
        Ok((address != 0).then_some(address))
    }

    async fn device_write(&mut self, req: rpc::DeviceWriteRequest) -> rpc::DeviceWriteResponse {
        let target = match self.target(req.lid) {
            Ok(target) => target,
            Err(error) => return rpc::DeviceWriteResponse { error, size: 0 },
        };

        let mut data = req.data;
        data.truncate(self.config.max_write_size);
        // Reported back untrimmed, so fragment accounting adds up
        let accepted = data.len() as u32;

        let end = req.flags.end;
        if end {
            // Right-trim the completed message; some instruments reject
            // trailing CR/LF
            while data.last().is_some_and(|b| b.is_ascii_whitespace()) {
                data.pop();
            }
        }

        let Some(address) = target else {
            // Addressed to the gateway itself, nothing goes onto the bus
            return rpc::DeviceWriteResponse {
                error: DeviceErrorCode::NoError,
                size: accepted,
            };
        };

        debug!(
            "WRITE DATA LID={} address={address} end={end} len={}",
            req.lid,
            data.len()
        );

        let mut grant = match self.held.take() {
            Some(grant) => grant,
            None => self.arbiter.acquire().await,
        };
        let timeout = self.config.effective_timeout(req.io_timeout);
        match grant.write(address, &data, end, timeout).await {
            Ok(_) => {
                if !end {
                    self.held = Some(grant);
                }
                rpc::DeviceWriteResponse {
                    error: DeviceErrorCode::NoError,
                    size: accepted,
                }
            }
            Err(sent) => rpc::DeviceWriteResponse {
                error: DeviceErrorCode::IoError,
                size: sent as u32,
            },
        }
    }

    async fn device_read(&mut self, req: rpc::DeviceReadRequest) -> rpc::DeviceReadResponse {
        let target = match self.target(req.lid) {
            Ok(target) => target,
            Err(error) => {
                return rpc::DeviceReadResponse {
                    error,
                    reason: ReadReason::default(),
                    data: vec![],
                };
            }
        };

        let max_len = if req.request_size == 0 {
            self.config.max_read_size
        } else {
            self.config.max_read_size.min(req.request_size as usize)
        };

        let Some(address) = target else {
            let mut data = self.config.identification.clone().into_bytes();
            data.truncate(max_len);
            return rpc::DeviceReadResponse {
                error: DeviceErrorCode::NoError,
                reason: ReadReason::end(),
                data,
            };
        };

        let end_byte = req.flags.termchr_set.then_some(req.termchr);

        let mut grant = match self.held.take() {
            // A read abandons an unfinished write sequence
            Some(grant) => grant,
            None => self.arbiter.acquire().await,
        };
        let timeout = self.config.effective_timeout(req.io_timeout);
        let outcome = grant.read(address, max_len, end_byte, timeout).await;

        debug!(
            "READ DATA LID={} address={address} max={max_len} -> {:?}",
            req.lid,
            match &outcome {
                BusReadOutcome::End(data) => format!("end after {} bytes", data.len()),
                BusReadOutcome::Limit(data) => format!("limit at {} bytes", data.len()),
                BusReadOutcome::Timeout => "timeout".into(),
                BusReadOutcome::Error => "bus error".into(),
            }
        );

        match outcome {
            BusReadOutcome::End(data) => rpc::DeviceReadResponse {
                error: DeviceErrorCode::NoError,
                reason: ReadReason::end(),
                data,
            },
            // Tell the client to read again
            BusReadOutcome::Limit(data) => rpc::DeviceReadResponse {
                error: DeviceErrorCode::NoError,
                reason: ReadReason::default(),
                data,
            },
            BusReadOutcome::Timeout => rpc::DeviceReadResponse {
                error: DeviceErrorCode::IoTimeout,
                reason: ReadReason::end(),
                data: vec![],
            },
            BusReadOutcome::Error => rpc::DeviceReadResponse {
                error: DeviceErrorCode::IoError,
                reason: ReadReason::default(),
                data: vec![],
            },
        }
    }

    async fn destroy_link(&mut self, req: rpc::DestroyLinkRequest) -> (rpc::DeviceErrorResponse, Next) {
        if self.address.is_none() || req.lid != self.slot as i32 {
            return (
                rpc::DeviceErrorResponse {
                    error: DeviceErrorCode::InvalidLinkIdentifier,
                },
                Next::Continue,
            );
        }

        debug!("DESTROY LINK LID={} from {}", req.lid, self.peer);
        if let Some(grant) = self.held.take() {
            grant.release().await;
        }
        (
            rpc::DeviceErrorResponse {
                error: DeviceErrorCode::NoError,
            },
            Next::Close,
        )
    }
}
