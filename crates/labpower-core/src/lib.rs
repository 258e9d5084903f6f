//! # LabPower Core Library
//!
//! Communication core for KA3005-style bench power supplies.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - The supply's ASCII protocol (set/query commands, fixed-width replies)
//! - A serial worker that serialises commands, paces the device and matches replies
//! - Periodic polling of output voltage and current
//! - A state model for front ends and a simulated supply for demo mode
//!
//! ## Example
//!
//! ```rust,no_run
//! use labpower_core::prelude::*;
//!
//! let (comm, events) = Communication::new(ConnectionConfig::default());
//! let handle = comm.connect(SerialLink::new(), "/dev/ttyUSB0")?;
//! handle.add_command(Command::with_value(CommandKind::SetVoltage, 5.0)?);
//!
//! let mut state = SupplyState::new();
//! for event in events.iter().take(10) {
//!     state.apply(&event);
//!     println!("{:.2} V {:.3} A", state.measured_voltage, state.measured_current);
//! }
//! # Ok::<(), labpower_core::protocol::ProtocolError>(())
//! ```

pub mod demo;
pub mod protocol;
pub mod supply;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::demo::SimulatedSupply;
    pub use crate::protocol::{
        Command, CommandKind, Communication, ConnectionConfig, ConnectionHandle, ConnectionState,
        DisconnectReason, Link, ProtocolError, SerialLink, WorkerEvent,
    };
    pub use crate::supply::{SupplyLimits, SupplyState};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
