use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

/// Default TCP port for the VXI-11 core channel
pub const VXI11_PORT: u16 = 9010;

/// Runtime configuration of the gateway.
///
/// Port fields set to 0 bind an ephemeral port; the portmapper always
/// advertises the port the core server actually bound.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Address the listeners bind to
    pub bind_addr: IpAddr,
    /// TCP port for the VXI-11 core channel
    pub vxi_port: u16,
    /// UDP+TCP port for the portmapper
    pub portmap_port: u16,
    /// Maximum number of concurrent VXI clients (= link table size)
    pub max_clients: usize,
    /// Cap on the data field of a single DEVICE_WRITE, advertised to
    /// clients as max_receive_size
    pub max_write_size: usize,
    /// Cap on the data field of a single DEVICE_READ response
    pub max_read_size: usize,
    /// Upper bound on any single bus transaction, regardless of the
    /// io_timeout a request asks for
    pub io_timeout_cap: Duration,
    /// Bus address that stands in for the gateway's own address 0.
    /// 0 disables the redirect: inst0 then answers locally.
    pub default_instrument: u8,
    /// Identification string returned when the gateway itself is read
    pub identification: String,
}
impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            vxi_port: VXI11_PORT,
            portmap_port: crate::server::portmap::PORTMAP_PORT,
            max_clients: 8,
            max_write_size: 4096,
            max_read_size: 4096,
            io_timeout_cap: Duration::from_secs(10),
            default_instrument: 0,
            identification: format!("Ethernet to GPIB gateway v{}\n", crate::version()),
        }
    }
}
impl GatewayConfig {
    /// Largest inbound RPC record the server accepts: a full-size write
    /// body plus the call header and write arguments around it.
    pub fn max_record_size(&self) -> usize {
        self.max_write_size + 128
    }

    /// Effective bound for one bus transaction. An io_timeout of 0 leaves
    /// only the configured cap.
    pub fn effective_timeout(&self, io_timeout_ms: u32) -> Duration {
        if io_timeout_ms == 0 {
            self.io_timeout_cap
        } else {
            self.io_timeout_cap
                .min(Duration::from_millis(io_timeout_ms as u64))
        }
    }
}
