//! Protocol errors

use thiserror::Error;

/// Why a reply could not be decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeFailure {
    /// Nothing arrived from the supply within the read attempts
    NoReply,
    /// Data arrived but never matched the expected answer shape
    Malformed(String),
}

impl std::fmt::Display for DecodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeFailure::NoReply => write!(f, "no reply"),
            DecodeFailure::Malformed(buffer) => write!(f, "malformed reply {:?}", buffer),
        }
    }
}

/// Errors that can occur during communication with the supply
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The port misbehaved after opening
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// The port could not be opened or the worker not started
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// I/O on a closed link
    #[error("Not connected to power supply")]
    NotConnected,

    /// A connection is already running
    #[error("Already connected")]
    AlreadyConnected,

    /// The reply to a query never matched its answer pattern
    #[error("Can't decode answer for '{request}': {reason}")]
    Decode {
        /// Request that went unanswered
        request: String,
        /// What was wrong with the reply
        reason: DecodeFailure,
    },

    /// A command could not be encoded
    #[error("Can't form write command: {0}")]
    Encoding(String),

    /// No such serial device
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Settings rejected by validation or unreadable config file
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serialport::Error> for ProtocolError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::NoDevice => ProtocolError::PortNotFound(err.to_string()),
            _ => ProtocolError::SerialError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Config(err.to_string())
    }
}
