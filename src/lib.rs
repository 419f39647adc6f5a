pub mod bus;
pub mod config;
pub mod error;
pub mod server;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
