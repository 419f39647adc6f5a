#![allow(dead_code)]

//! Minimal VXI-11 client for exercising the gateway over real sockets

use std::time::Duration;

use tokio::net::TcpStream;

use gpib_gateway::{
    bus::loopback::LoopbackBus,
    config::GatewayConfig,
    server::{
        Gateway,
        onc::{self, DecodedReply, OpaqueAuth, RPC_VERSION, Record, RpcCall},
        rpc,
        xdr::{self, XdrPack},
    },
};

pub const IO_CAP: Duration = Duration::from_secs(5);

pub const PROC_CREATE_LINK: u32 = 10;
pub const PROC_DEVICE_WRITE: u32 = 11;
pub const PROC_DEVICE_READ: u32 = 12;
pub const PROC_DESTROY_LINK: u32 = 23;

pub const FLAG_END: u32 = 1 << 3;
pub const FLAG_TERMCHR_SET: u32 = 1 << 7;

/// A gateway running on ephemeral localhost ports
pub struct TestGateway {
    pub vxi_port: u16,
    pub portmap_udp: u16,
    pub portmap_tcp: u16,
}

/// Configuration bound to localhost with ephemeral ports
pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        bind_addr: "127.0.0.1".parse().unwrap(),
        vxi_port: 0,
        portmap_port: 0,
        ..GatewayConfig::default()
    }
}

pub async fn spawn_gateway(config: GatewayConfig, bus: LoopbackBus) -> TestGateway {
    let gateway = Gateway::bind(config, Box::new(bus)).await.unwrap();
    let running = TestGateway {
        vxi_port: gateway.vxi_port().unwrap(),
        portmap_udp: gateway.portmap_udp_port().unwrap(),
        portmap_tcp: gateway.portmap_tcp_port().unwrap(),
    };
    tokio::spawn(gateway.run());
    running
}

pub struct CreateLinkReply {
    pub error: u32,
    pub lid: i32,
    pub abort_port: u16,
    pub max_recv_size: u32,
}

pub struct ReadReply {
    pub error: u32,
    pub reason: u32,
    pub data: Vec<u8>,
}

pub struct VxiClient {
    stream: TcpStream,
    next_xid: u32,
}
impl VxiClient {
    pub async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        Self {
            stream,
            next_xid: 0x1000,
        }
    }

    /// One raw RPC transaction; panics if the reply does not echo the xid
    pub async fn call(&mut self, prog: u32, vers: u32, proc: u32, args: Vec<u8>) -> DecodedReply {
        self.call_rpc_version(RPC_VERSION, prog, vers, proc, args)
            .await
    }

    pub async fn call_rpc_version(
        &mut self,
        rpc_version: u32,
        prog: u32,
        vers: u32,
        proc: u32,
        args: Vec<u8>,
    ) -> DecodedReply {
        let xid = self.next_xid;
        self.next_xid += 1;

        let mut packet = vec![];
        RpcCall {
            xid,
            rpc_version,
            prog,
            vers,
            proc,
            cred: OpaqueAuth::new_null(),
            verf: OpaqueAuth::new_null(),
            args,
        }
        .pack_xdr(&mut packet);

        onc::write_record(&mut self.stream, &packet, IO_CAP)
            .await
            .unwrap();
        let mut reply = match onc::read_record(&mut self.stream, 65536, IO_CAP).await.unwrap() {
            Record::Message(reply) => reply,
            r => panic!("Expected a reply record, got {:?}", r),
        };

        let reply = DecodedReply::unpack(&mut reply).unwrap();
        assert_eq!(reply.xid, xid);
        reply
    }

    async fn core_call(&mut self, proc: u32, args: Vec<u8>) -> Vec<u8> {
        self.call(rpc::DEVICE_CORE_PROG, rpc::DEVICE_CORE_VERSION, proc, args)
            .await
            .success()
            .unwrap()
    }

    pub async fn create_link(&mut self, device: &str) -> CreateLinkReply {
        self.create_link_opts(device, false).await
    }

    pub async fn create_link_opts(&mut self, device: &str, lock_device: bool) -> CreateLinkReply {
        let mut args = vec![];
        1i32.pack_xdr(&mut args);
        lock_device.pack_xdr(&mut args);
        10_000u32.pack_xdr(&mut args);
        device.to_string().pack_xdr(&mut args);

        let mut results = self.core_call(PROC_CREATE_LINK, args).await;
        CreateLinkReply {
            error: xdr::unpack_u32(&mut results).unwrap(),
            lid: xdr::unpack_i32(&mut results).unwrap(),
            abort_port: xdr::unpack_u16(&mut results).unwrap(),
            max_recv_size: xdr::unpack_u32(&mut results).unwrap(),
        }
    }

    /// Returns (error, size)
    pub async fn device_write(&mut self, lid: i32, flags: u32, data: &[u8]) -> (u32, u32) {
        self.device_write_timeout(lid, flags, data, 10_000).await
    }

    pub async fn device_write_timeout(
        &mut self,
        lid: i32,
        flags: u32,
        data: &[u8],
        io_timeout: u32,
    ) -> (u32, u32) {
        let mut args = vec![];
        lid.pack_xdr(&mut args);
        io_timeout.pack_xdr(&mut args);
        10_000u32.pack_xdr(&mut args);
        flags.pack_xdr(&mut args);
        data.to_vec().pack_xdr(&mut args);

        let mut results = self.core_call(PROC_DEVICE_WRITE, args).await;
        (
            xdr::unpack_u32(&mut results).unwrap(),
            xdr::unpack_u32(&mut results).unwrap(),
        )
    }

    pub async fn device_read(&mut self, lid: i32, request_size: u32) -> ReadReply {
        self.device_read_opts(lid, request_size, 0, 0, 10_000).await
    }

    pub async fn device_read_opts(
        &mut self,
        lid: i32,
        request_size: u32,
        flags: u32,
        termchr: u8,
        io_timeout: u32,
    ) -> ReadReply {
        let mut args = vec![];
        lid.pack_xdr(&mut args);
        request_size.pack_xdr(&mut args);
        io_timeout.pack_xdr(&mut args);
        10_000u32.pack_xdr(&mut args);
        flags.pack_xdr(&mut args);
        (termchr as u32).pack_xdr(&mut args);

        let mut results = self.core_call(PROC_DEVICE_READ, args).await;
        ReadReply {
            error: xdr::unpack_u32(&mut results).unwrap(),
            reason: xdr::unpack_u32(&mut results).unwrap(),
            data: xdr::unpack_opaque(&mut results).unwrap(),
        }
    }

    /// Returns the reply's error field
    pub async fn destroy_link(&mut self, lid: i32) -> u32 {
        let mut args = vec![];
        lid.pack_xdr(&mut args);

        let mut results = self.core_call(PROC_DESTROY_LINK, args).await;
        xdr::unpack_u32(&mut results).unwrap()
    }

    /// Assert the server has closed the connection
    pub async fn expect_closed(&mut self) {
        match onc::read_record(&mut self.stream, 65536, IO_CAP).await.unwrap() {
            Record::Closed => {}
            r => panic!("Expected the connection to be closed, got {:?}", r),
        }
    }
}
