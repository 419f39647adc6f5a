//! Portmap (RPCBIND) responder, RFC1833.
//!
//! Serves just enough of the protocol for a VISA client to discover the
//! VXI-11 core channel: GETPORT for the DEVICE_CORE program answers with
//! the core server's TCP port, every other mapping query answers 0.

use std::{net::IpAddr, time::Duration};

use log::{debug, info};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::error::Result;

use super::{
    onc::{self, RPC_VERSION, RpcCall, RpcReply},
    rpc,
    xdr::{self, XdrPack},
};

pub const PORTMAP_PROG: u32 = 100000;
pub const PORTMAP_VERS: u32 = 2;

pub const PORTMAP_PORT: u16 = 111;

const PROC_NULL: u32 = 0;
const PROC_GETPORT: u32 = 3;

/// Protocol numbers used in portmap mappings
#[allow(unused)]
#[derive(Clone, Copy, Debug)]
#[repr(u32)]
pub enum RpcIpProto {
    Tcp = 6,
    Udp = 17,
}

/// GETPORT request body
#[derive(Debug)]
struct Mapping {
    prog: u32,
    vers: u32,
    prot: u32,
    port: u32,
}
impl Mapping {
    fn unpack(src: &mut Vec<u8>) -> Result<Self> {
        Ok(Self {
            prog: xdr::unpack_u32(src)?,
            vers: xdr::unpack_u32(src)?,
            prot: xdr::unpack_u32(src)?,
            port: xdr::unpack_u32(src)?,
        })
    }
}

/// Produce the reply for one portmap call; None drops a packet that was
/// not a decodable CALL.
fn handle_call(packet: &mut Vec<u8>, vxi_port: u16) -> Option<Vec<u8>> {
    let mut call = match RpcCall::unpack(packet) {
        Ok(call) => call,
        Err(e) => {
            debug!("Undecodable portmap packet: {e}");
            return None;
        }
    };

    let reply = if call.rpc_version != RPC_VERSION {
        RpcReply::RpcMismatch {
            low: RPC_VERSION,
            high: RPC_VERSION,
        }
    } else if call.prog != PORTMAP_PROG {
        RpcReply::ProgUnavail
    } else if call.vers != PORTMAP_VERS {
        RpcReply::ProgMismatch {
            low: PORTMAP_VERS,
            high: PORTMAP_VERS,
        }
    } else {
        match call.proc {
            PROC_NULL => RpcReply::Success(vec![]),
            PROC_GETPORT => match Mapping::unpack(&mut call.args) {
                Ok(mapping) => {
                    let known = mapping.prog == rpc::DEVICE_CORE_PROG
                        && mapping.vers == rpc::DEVICE_CORE_VERSION
                        && (mapping.prot == RpcIpProto::Tcp as u32
                            || mapping.prot == RpcIpProto::Udp as u32);
                    let port = if known { vxi_port as u32 } else { 0 };
                    debug!(
                        "GETPORT prog={:#x} vers={} prot={} -> {port}",
                        mapping.prog, mapping.vers, mapping.prot
                    );

                    let mut results = vec![];
                    port.pack_xdr(&mut results);
                    RpcReply::Success(results)
                }
                Err(_) => RpcReply::GarbageArgs,
            },
            _ => RpcReply::ProcUnavail,
        }
    };

    Some(reply.pack(call.xid))
}

/// RPCBIND front-end on UDP and TCP
pub struct PortmapServer {
    udp: UdpSocket,
    tcp: TcpListener,
    vxi_port: u16,
    io_cap: Duration,
}
impl PortmapServer {
    /// Bind both transports. `vxi_port` is the port the core server
    /// actually listens on, which GETPORT advertises.
    pub async fn bind(addr: IpAddr, port: u16, vxi_port: u16, io_cap: Duration) -> Result<Self> {
        let udp = UdpSocket::bind((addr, port)).await?;
        let tcp = TcpListener::bind((addr, port)).await?;
        info!(
            "Portmapper on UDP {} / TCP {}, advertising VXI core port {vxi_port}",
            udp.local_addr()?.port(),
            tcp.local_addr()?.port(),
        );
        Ok(Self {
            udp,
            tcp,
            vxi_port,
            io_cap,
        })
    }

    pub fn udp_port(&self) -> Result<u16> {
        Ok(self.udp.local_addr()?.port())
    }

    pub fn tcp_port(&self) -> Result<u16> {
        Ok(self.tcp.local_addr()?.port())
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            udp,
            tcp,
            vxi_port,
            io_cap,
        } = self;
        futures::try_join!(
            Self::serve_udp(udp, vxi_port),
            Self::serve_tcp(tcp, vxi_port, io_cap),
        )?;
        Ok(())
    }

    async fn serve_udp(udp: UdpSocket, vxi_port: u16) -> Result<()> {
        let mut buf = vec![0u8; 1500];
        loop {
            let (len, peer) = udp.recv_from(&mut buf).await?;
            let mut packet = buf[..len].to_vec();
            if let Some(reply) = handle_call(&mut packet, vxi_port) {
                udp.send_to(&reply, peer).await?;
            }
        }
    }

    async fn serve_tcp(tcp: TcpListener, vxi_port: u16, io_cap: Duration) -> Result<()> {
        loop {
            let (mut stream, peer) = tcp.accept().await?;
            tokio::spawn(async move {
                // One query per connection, then close
                if let Err(e) = Self::serve_one(&mut stream, vxi_port, io_cap).await {
                    debug!("Portmap TCP query from {peer} failed: {e}");
                }
            });
        }
    }

    async fn serve_one(stream: &mut TcpStream, vxi_port: u16, io_cap: Duration) -> Result<()> {
        if let onc::Record::Message(mut packet) = onc::read_record(stream, 512, io_cap).await? {
            if let Some(reply) = handle_call(&mut packet, vxi_port) {
                onc::write_record(stream, &reply, io_cap).await?;
            }
        }
        Ok(())
    }
}
