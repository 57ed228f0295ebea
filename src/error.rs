// com2tcp - Error types

use std::io;
use thiserror::Error;

/// Errors surfaced by configuration and by the proxy's control paths.
///
/// Transport failures on an open serial device or client socket are not
/// represented here; they end the affected copy loop as plain `io::Error`s.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed binding: {0}")]
    InvalidBinding(String),

    #[error("invalid tcp port: {0}")]
    InvalidTcpPort(u32),

    #[error("invalid baud rate: {0}")]
    InvalidBaudRate(u32),

    #[error("tcp port {0} is already bound to a serial port")]
    DuplicateTcpPort(u16),

    #[error("unable to open and initialize serial port ({port}@{baud_rate}): {source}")]
    DeviceUnavailable {
        port: String,
        baud_rate: u32,
        #[source]
        source: io::Error,
    },

    #[error("listener on tcp port {port} failed: {source}")]
    Listener {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// One-line diagnostic printed when startup is aborted.
    pub fn startup_message(&self) -> String {
        match self {
            ProxyError::InvalidBinding(what) => format!("Invalid binding: {}", what),
            other => format!("Invalid configuration: {}", other),
        }
    }
}
