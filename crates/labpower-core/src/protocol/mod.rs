//! Serial Protocol Communication
//!
//! Implements the ASCII protocol of KA3005-style bench power supplies.
//!
//! Requests are short strings without terminator (`VSET1:12.34`, `IOUT1?`).
//! Numeric replies are fixed-width decimals and may arrive in fragments.

mod command;
pub mod commands;
mod connection;
mod error;
mod link;
mod poll;
pub mod serial;

pub use command::Command;
pub use commands::{AnswerPattern, CommandKind, CURRENT_PATTERN, VOLTAGE_PATTERN};
pub use connection::{
    CommandSender, Communication, ConnectionConfig, ConnectionHandle, ConnectionState,
    DisconnectReason, ErrorCounter, WorkerEvent,
};
pub use error::{DecodeFailure, ProtocolError};
pub use link::{Link, SerialSettings};
pub use poll::PollSource;
pub use serial::{list_ports, PortInfo, SerialLink, UsbAdapter};

/// Default baud rate of the supply
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Minimum pause after every transmission in milliseconds
pub const DEFAULT_PACING_MS: u64 = 50;

/// Delay before the first telemetry poll in milliseconds
pub const DEFAULT_POLL_DELAY_MS: u64 = 500;

/// Telemetry poll period in milliseconds
pub const DEFAULT_POLL_PERIOD_MS: u64 = 1000;

/// Net failed replies that force a disconnect
pub const DEFAULT_ERROR_THRESHOLD: u32 = 5;

/// Reads per command before giving up on its reply
pub const DEFAULT_READ_ATTEMPTS: u32 = 3;
