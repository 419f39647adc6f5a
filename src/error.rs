use std::{fmt::Display, result};

pub type Result<T, E = Error> = result::Result<T, E>;

#[derive(Debug)]
pub enum Error {
    Unspecified(String),
    IoError(std::io::Error),
    /// Peer sent a packet that we could not properly decode
    BadPacket(String),
    /// Request or configuration the gateway does not support
    NotSupported(String),
    /// Timed out during an operation
    Timeout(String),
}
impl std::error::Error for Error {}
impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Unspecified(desc) => write!(f, "Unspecified error: {desc}"),
            Error::IoError(e) => write!(f, "IO error: {e}"),
            Error::BadPacket(e) => write!(f, "Bad packet: {e}"),
            Error::NotSupported(e) => write!(f, "Not supported: {e}"),
            Error::Timeout(e) => write!(f, "Timed out: {e}"),
        }
    }
}
impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(value)
    }
}
