//! Network front-ends of the gateway.
//!
//! Two servers run side by side: the portmapper that lets VISA clients
//! discover the core channel, and the DEVICE_CORE RPC server itself.

pub mod links;
pub mod onc;
pub mod portmap;
pub mod rpc;
pub mod vxi11;
pub mod xdr;

use std::sync::Arc;

use log::info;
use tokio::sync::Mutex;

use crate::{
    bus::{GpibBus, arbiter::BusArbiter},
    config::GatewayConfig,
    error::Result,
};

use self::{links::LinkTable, portmap::PortmapServer, vxi11::CoreServer};

/// The assembled gateway: portmapper + core server over one bus
pub struct Gateway {
    portmap: PortmapServer,
    core: CoreServer,
}
impl Gateway {
    /// Bind all listeners. The portmapper advertises whatever port the
    /// core server actually got, so ephemeral ports (0) work.
    pub async fn bind(config: GatewayConfig, bus: Box<dyn GpibBus>) -> Result<Self> {
        let config = Arc::new(config);
        let links = Arc::new(Mutex::new(LinkTable::new(config.max_clients)));
        let arbiter = BusArbiter::new(bus);

        let core = CoreServer::bind(config.clone(), links, arbiter).await?;
        let portmap = PortmapServer::bind(
            config.bind_addr,
            config.portmap_port,
            core.port()?,
            config.io_timeout_cap,
        )
        .await?;

        info!(
            "Gateway up, {} VXI client slots available",
            config.max_clients
        );
        Ok(Self { portmap, core })
    }

    pub fn vxi_port(&self) -> Result<u16> {
        self.core.port()
    }

    pub fn portmap_udp_port(&self) -> Result<u16> {
        self.portmap.udp_port()
    }

    pub fn portmap_tcp_port(&self) -> Result<u16> {
        self.portmap.tcp_port()
    }

    /// Serve until one of the front-ends fails
    pub async fn run(self) -> Result<()> {
        futures::try_join!(self.portmap.run(), self.core.run())?;
        Ok(())
    }
}
