//! Supply state model
//!
//! What a front end shows for the supply: live readings, setpoints and the
//! output switch, kept current from [`WorkerEvent`]s.

use serde::{Deserialize, Serialize};

use crate::protocol::{Command, CommandKind, ProtocolError, WorkerEvent};

/// Setpoint bounds of the supply (30 V / 5 A class, with headroom)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupplyLimits {
    /// Highest voltage setpoint (V)
    pub max_voltage: f64,
    /// Highest current limit (A)
    pub max_current: f64,
}

impl Default for SupplyLimits {
    fn default() -> Self {
        Self {
            max_voltage: 31.0,
            max_current: 5.1,
        }
    }
}

impl SupplyLimits {
    /// Clamp into `[0, max_voltage]`; NaN becomes 0
    pub fn clamp_voltage(&self, volts: f64) -> f64 {
        clamp_setpoint(volts, self.max_voltage)
    }

    /// Clamp into `[0, max_current]`; NaN becomes 0
    pub fn clamp_current(&self, amps: f64) -> f64 {
        clamp_setpoint(amps, self.max_current)
    }

    /// Build a voltage set command, clamped into `[0, max_voltage]`
    pub fn voltage_command(&self, volts: f64) -> Result<Command, ProtocolError> {
        Command::with_value(CommandKind::SetVoltage, self.clamp_voltage(volts))
    }

    /// Build a current set command, clamped into `[0, max_current]`
    pub fn current_command(&self, amps: f64) -> Result<Command, ProtocolError> {
        Command::with_value(CommandKind::SetCurrent, self.clamp_current(amps))
    }
}

fn clamp_setpoint(value: f64, max: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    // `+ 0.0` turns a `-0.0` setpoint into `0.0`
    value.clamp(0.0, max.max(0.0)) + 0.0
}

/// Last known state of the supply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SupplyState {
    /// Last `VOUT1?` reading (V)
    pub measured_voltage: f64,
    /// Last `IOUT1?` reading (A)
    pub measured_current: f64,
    /// Voltage setpoint as read back from the supply (V)
    pub voltage_setpoint: f64,
    /// Current limit as read back from the supply (A)
    pub current_setpoint: f64,
    /// Output switch as last commanded
    pub output_enabled: bool,
}

impl SupplyState {
    /// All readings zero, output off
    pub fn new() -> Self {
        Self::default()
    }

    /// Update from a worker event; returns `true` if anything changed
    pub fn apply(&mut self, event: &WorkerEvent) -> bool {
        match event {
            WorkerEvent::Resolved(command) => {
                let Some(value) = command.decoded_value() else {
                    return false;
                };
                let slot = match command.kind() {
                    CommandKind::ReadVoltage => &mut self.measured_voltage,
                    CommandKind::ReadCurrent => &mut self.measured_current,
                    CommandKind::SetVoltage => &mut self.voltage_setpoint,
                    CommandKind::SetCurrent => &mut self.current_setpoint,
                    CommandKind::SetOutputEnabled => return false,
                };
                let changed = *slot != value;
                *slot = value;
                changed
            }
            WorkerEvent::Disconnected(_) => {
                let changed = *self != Self::default();
                *self = Self::default();
                changed
            }
            WorkerEvent::State(_) => false,
        }
    }

    /// Record the output switch and build the command that sets it
    ///
    /// The supply has no query for the output state, so this is the only
    /// source of truth for it.
    pub fn set_output(&mut self, enabled: bool) -> Result<Command, ProtocolError> {
        let command = Command::with_flag(CommandKind::SetOutputEnabled, enabled)?;
        self.output_enabled = enabled;
        Ok(command)
    }

    /// Output power from the live readings (W)
    pub fn power(&self) -> f64 {
        self.measured_voltage * self.measured_current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnectionState, DisconnectReason};
    use pretty_assertions::assert_eq;

    fn resolved(kind: CommandKind, reply: &str) -> WorkerEvent {
        let mut command = Command::query(kind);
        assert!(command.append_reply(reply));
        WorkerEvent::Resolved(command)
    }

    #[test]
    fn test_limits_clamp() {
        let limits = SupplyLimits::default();
        assert_eq!(limits.clamp_voltage(40.0), 31.0);
        assert_eq!(limits.clamp_voltage(-1.0), 0.0);
        assert_eq!(limits.clamp_current(2.5), 2.5);
        assert_eq!(limits.clamp_current(f64::NAN), 0.0);

        let cmd = limits.voltage_command(99.0).unwrap();
        assert_eq!(cmd.encoded_request(), Some("VSET1:31.00"));
        let cmd = limits.current_command(7.0).unwrap();
        assert_eq!(cmd.encoded_request(), Some("ISET1:5.100"));

        assert!(limits.clamp_voltage(-0.0).is_sign_positive());
        let cmd = limits.voltage_command(-0.0).unwrap();
        assert_eq!(cmd.encoded_request(), Some("VSET1:00.00"));
    }

    #[test]
    fn test_apply_maps_kinds() {
        let mut state = SupplyState::new();
        assert!(state.apply(&resolved(CommandKind::ReadVoltage, "12.01")));
        assert!(state.apply(&resolved(CommandKind::ReadCurrent, "0.601")));
        assert!(state.apply(&resolved(CommandKind::SetVoltage, "12.00")));
        assert!(state.apply(&resolved(CommandKind::SetCurrent, "1.000")));
        assert!(!state.apply(&resolved(CommandKind::SetCurrent, "1.000")));
        assert!(!state.apply(&WorkerEvent::State(ConnectionState::Running)));

        assert_eq!(
            state,
            SupplyState {
                measured_voltage: 12.01,
                measured_current: 0.601,
                voltage_setpoint: 12.0,
                current_setpoint: 1.0,
                output_enabled: false,
            }
        );
        assert!((state.power() - 12.01 * 0.601).abs() < 1e-9);
    }

    #[test]
    fn test_unresolved_command_is_ignored() {
        let mut state = SupplyState::new();
        let event = WorkerEvent::Resolved(Command::query(CommandKind::ReadVoltage));
        assert!(!state.apply(&event));
    }

    #[test]
    fn test_disconnect_resets() {
        let mut state = SupplyState::new();
        state.apply(&resolved(CommandKind::ReadVoltage, "05.00"));
        state.set_output(true).unwrap();

        assert!(state.apply(&WorkerEvent::Disconnected(DisconnectReason::ErrorThreshold)));
        assert_eq!(state, SupplyState::default());
    }

    #[test]
    fn test_set_output() {
        let mut state = SupplyState::new();
        let cmd = state.set_output(true).unwrap();
        assert_eq!(cmd.encoded_request(), Some("OUT1"));
        assert!(state.output_enabled);

        let cmd = state.set_output(false).unwrap();
        assert_eq!(cmd.encoded_request(), Some("OUT0"));
        assert!(!state.output_enabled);
    }
}
