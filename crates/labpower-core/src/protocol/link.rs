//! Physical channel abstraction
//!
//! The worker talks to the supply only through [`Link`], so the serial port
//! can be swapped for the simulated supply or a scripted test double.

use serde::{Deserialize, Serialize};

use super::{ProtocolError, DEFAULT_BAUD_RATE};

/// Serial line parameters (always 8N1 without flow control on the wire)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Upper bound for a single blocking read in milliseconds
    pub read_timeout_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: 100,
        }
    }
}

/// Byte transport to the supply
///
/// Every method except [`Link::open_port`] failing is recoverable for the
/// worker: the current command is dropped and counted as an error.
pub trait Link: Send {
    /// Open and configure the named port; clears any stale input
    fn open_port(&mut self, name: &str, settings: &SerialSettings) -> Result<(), ProtocolError>;

    /// Close the port. Closing a closed link is a no-op.
    fn close_port(&mut self) -> Result<(), ProtocolError>;

    /// Write the whole string
    fn write_string(&mut self, data: &str) -> Result<(), ProtocolError>;

    /// Return whatever has arrived so far, possibly empty; must not block
    /// indefinitely
    fn read_available_string(&mut self) -> Result<String, ProtocolError>;

    /// Names of ports this link could open, in a stable order
    fn list_port_names(&self) -> Vec<String>;
}

impl<L: Link + ?Sized> Link for Box<L> {
    fn open_port(&mut self, name: &str, settings: &SerialSettings) -> Result<(), ProtocolError> {
        (**self).open_port(name, settings)
    }

    fn close_port(&mut self) -> Result<(), ProtocolError> {
        (**self).close_port()
    }

    fn write_string(&mut self, data: &str) -> Result<(), ProtocolError> {
        (**self).write_string(data)
    }

    fn read_available_string(&mut self) -> Result<String, ProtocolError> {
        (**self).read_available_string()
    }

    fn list_port_names(&self) -> Vec<String> {
        (**self).list_port_names()
    }
}
