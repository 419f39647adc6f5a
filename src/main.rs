use std::{env, process::exit};

use gpib_gateway::{
    bus::loopback::LoopbackBus,
    config::GatewayConfig,
    server::Gateway,
};

/// Run the gateway against the loopback bus: full VXI-11 on the network
/// side, simulated instruments on the bus side. Useful for exercising
/// VISA clients without controller hardware attached.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let mut config = GatewayConfig::default();

    match args.len() {
        1 => {}
        2 => config.vxi_port = args[1].parse()?,
        3 => {
            config.vxi_port = args[1].parse()?;
            config.portmap_port = args[2].parse()?;
        }
        _ => {
            println!("Usage: gpib-gateway [vxi_port] [portmap_port]");
            println!("  vxi_port:     TCP port of the VXI-11 core channel (default 9010)");
            println!("  portmap_port: UDP+TCP port of the portmapper (default 111)");
            exit(1);
        }
    }

    let mut bus = LoopbackBus::new();
    // A pretend instrument at primary address 7 that answers *IDN?
    bus.set_responder(7, |message| {
        message
            .eq_ignore_ascii_case(b"*idn?")
            .then(|| b"Loopback,Instrument07,0,1.0\n".to_vec())
    });

    let gateway = Gateway::bind(config, Box::new(bus)).await?;
    println!(
        "gpib-gateway v{}: VXI-11 core on port {}, portmapper on {}/{}",
        gpib_gateway::version(),
        gateway.vxi_port()?,
        gateway.portmap_udp_port()?,
        gateway.portmap_tcp_port()?,
    );
    println!("Simulated instrument at GPIB address 7 (TCPIP::<host>::inst7::INSTR)");

    gateway.run().await?;

    Ok(())
}
