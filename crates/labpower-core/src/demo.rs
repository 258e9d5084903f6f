//! Demo Mode - Simulated power supply for testing
//!
//! Answers the supply's ASCII protocol without hardware so the worker, the
//! CLI and tests can run against something that behaves like a real unit.
//! The output drives a resistive load; readings carry a little ripple.

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use std::collections::VecDeque;
use tracing::debug;

use crate::protocol::{
    CommandKind, Link, ProtocolError, SerialSettings, CURRENT_PATTERN, VOLTAGE_PATTERN,
};

/// Port name reported by the simulated supply
pub const DEMO_PORT: &str = "demo";

/// Simulated bench supply implementing [`Link`]
pub struct SimulatedSupply {
    /// Name of the "open" port
    port: Option<String>,
    /// Voltage setpoint (V)
    voltage_set: f64,
    /// Current limit (A)
    current_set: f64,
    output_enabled: bool,
    /// Load resistance on the output (ohm)
    load_ohms: f64,
    /// Peak measurement ripple (V)
    ripple: f64,
    /// Reply chunks waiting to be read
    outbox: VecDeque<String>,
    /// Hand replies out in two pieces, like a slow UART
    fragment: bool,
    rng: StdRng,
}

impl Default for SimulatedSupply {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSupply {
    /// Create a simulated supply at 12 V / 1 A into a 20 ohm load
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic ripple for tests
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            port: None,
            voltage_set: 12.0,
            current_set: 1.0,
            output_enabled: false,
            load_ohms: 20.0,
            ripple: 0.02,
            outbox: VecDeque::new(),
            fragment: false,
            rng,
        }
    }

    /// Change the load resistance
    pub fn with_load(mut self, ohms: f64) -> Self {
        self.load_ohms = ohms.max(0.001);
        self
    }

    /// Disable measurement ripple
    pub fn without_ripple(mut self) -> Self {
        self.ripple = 0.0;
        self
    }

    /// Split every reply across two reads
    pub fn with_fragmented_replies(mut self) -> Self {
        self.fragment = true;
        self
    }

    /// Whether the last `OUT` request switched the output on
    pub fn output_enabled(&self) -> bool {
        self.output_enabled
    }

    /// Voltage setpoint (V)
    pub fn voltage_setpoint(&self) -> f64 {
        self.voltage_set
    }

    /// Current limit (A)
    pub fn current_setpoint(&self) -> f64 {
        self.current_set
    }

    /// Output voltage and current after constant-voltage/constant-current limiting
    fn operating_point(&self) -> (f64, f64) {
        if !self.output_enabled {
            return (0.0, 0.0);
        }
        let cv_current = self.voltage_set / self.load_ohms;
        if cv_current <= self.current_set {
            (self.voltage_set, cv_current)
        } else {
            // Current limited
            (self.current_set * self.load_ohms, self.current_set)
        }
    }

    fn noisy(&mut self, value: f64, ripple: f64) -> f64 {
        if value <= 0.0 || ripple <= 0.0 {
            return value.max(0.0);
        }
        (value + self.rng.gen_range(-ripple..ripple)).max(0.0)
    }

    /// Apply one request and queue its reply, if any
    fn handle_request(&mut self, request: &str) {
        let set_voltage = CommandKind::SetVoltage.write_prefix().unwrap_or_default();
        let set_current = CommandKind::SetCurrent.write_prefix().unwrap_or_default();
        let set_output = CommandKind::SetOutputEnabled
            .write_prefix()
            .unwrap_or_default();

        let reply = if let Some(value) = request.strip_prefix(set_voltage) {
            if let Ok(v) = value.parse::<f64>() {
                self.voltage_set = v;
            }
            None
        } else if let Some(value) = request.strip_prefix(set_current) {
            if let Ok(i) = value.parse::<f64>() {
                self.current_set = i;
            }
            None
        } else if let Some(flag) = request.strip_prefix(set_output) {
            match flag {
                "1" => self.output_enabled = true,
                "0" => self.output_enabled = false,
                _ => {}
            }
            None
        } else {
            match CommandKind::ALL
                .into_iter()
                .find(|kind| kind.read_query() == Some(request))
            {
                Some(CommandKind::SetVoltage) => VOLTAGE_PATTERN.format(self.voltage_set),
                Some(CommandKind::SetCurrent) => CURRENT_PATTERN.format(self.current_set),
                Some(CommandKind::ReadVoltage) => {
                    let (v, _) = self.operating_point();
                    let ripple = self.ripple;
                    let v = self.noisy(v, ripple);
                    VOLTAGE_PATTERN.format(v.min(VOLTAGE_PATTERN.max_value()))
                }
                Some(CommandKind::ReadCurrent) => {
                    let (_, i) = self.operating_point();
                    let ripple = self.ripple / self.load_ohms;
                    let i = self.noisy(i, ripple);
                    CURRENT_PATTERN.format(i.min(CURRENT_PATTERN.max_value()))
                }
                _ => None,
            }
        };

        match reply {
            Some(text) => {
                debug!("Simulated supply: {} -> {}", request, text);
                if self.fragment && text.len() > 1 {
                    let (head, tail) = text.split_at(text.len() / 2);
                    self.outbox.push_back(head.to_string());
                    self.outbox.push_back(tail.to_string());
                } else {
                    self.outbox.push_back(text);
                }
            }
            None => debug!("Simulated supply: {}", request),
        }
    }

    fn ensure_open(&self) -> Result<(), ProtocolError> {
        if self.port.is_some() {
            Ok(())
        } else {
            Err(ProtocolError::NotConnected)
        }
    }
}

impl Link for SimulatedSupply {
    fn open_port(&mut self, name: &str, _settings: &SerialSettings) -> Result<(), ProtocolError> {
        if self.port.is_some() {
            return Err(ProtocolError::AlreadyConnected);
        }
        self.outbox.clear();
        self.port = Some(name.to_string());
        Ok(())
    }

    fn close_port(&mut self) -> Result<(), ProtocolError> {
        self.port = None;
        self.outbox.clear();
        Ok(())
    }

    fn write_string(&mut self, data: &str) -> Result<(), ProtocolError> {
        self.ensure_open()?;
        self.handle_request(data);
        Ok(())
    }

    fn read_available_string(&mut self) -> Result<String, ProtocolError> {
        self.ensure_open()?;
        Ok(self.outbox.pop_front().unwrap_or_default())
    }

    fn list_port_names(&self) -> Vec<String> {
        vec![DEMO_PORT.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;

    fn open_supply() -> SimulatedSupply {
        let mut sim = SimulatedSupply::with_seed(7).without_ripple();
        sim.open_port(DEMO_PORT, &SerialSettings::default()).unwrap();
        sim
    }

    fn ask(sim: &mut SimulatedSupply, kind: CommandKind) -> Option<f64> {
        let mut cmd = Command::query(kind);
        sim.write_string(cmd.encoded_request().unwrap()).unwrap();
        let chunk = sim.read_available_string().unwrap();
        cmd.append_reply(&chunk);
        cmd.decoded_value()
    }

    #[test]
    fn test_closed_supply_rejects_io() {
        let mut sim = SimulatedSupply::new();
        assert!(matches!(
            sim.write_string("VOUT1?"),
            Err(ProtocolError::NotConnected)
        ));
        assert_eq!(sim.list_port_names(), vec!["demo".to_string()]);
    }

    #[test]
    fn test_setpoints_read_back() {
        let mut sim = open_supply();
        sim.write_string("VSET1:05.50").unwrap();
        sim.write_string("ISET1:0.750").unwrap();
        assert_eq!(sim.read_available_string().unwrap(), "");
        assert_eq!(ask(&mut sim, CommandKind::SetVoltage), Some(5.5));
        assert_eq!(ask(&mut sim, CommandKind::SetCurrent), Some(0.75));
        assert_eq!(sim.voltage_setpoint(), 5.5);
        assert_eq!(sim.current_setpoint(), 0.75);
    }

    #[test]
    fn test_heavy_load_hits_current_limit() {
        let mut sim = SimulatedSupply::with_seed(9).without_ripple().with_load(5.0);
        sim.open_port(DEMO_PORT, &SerialSettings::default()).unwrap();
        sim.write_string("OUT1").unwrap();
        assert_eq!(ask(&mut sim, CommandKind::ReadCurrent), Some(1.0));
        assert_eq!(ask(&mut sim, CommandKind::ReadVoltage), Some(5.0));
    }

    #[test]
    fn test_output_off_reads_zero() {
        let mut sim = open_supply();
        assert_eq!(ask(&mut sim, CommandKind::ReadVoltage), Some(0.0));
        assert_eq!(ask(&mut sim, CommandKind::ReadCurrent), Some(0.0));
    }

    #[test]
    fn test_constant_voltage_and_current_limit() {
        let mut sim = open_supply();
        sim.write_string("OUT1").unwrap();
        assert!(sim.output_enabled());
        // 12 V into 20 ohm stays under the 1 A limit
        assert_eq!(ask(&mut sim, CommandKind::ReadVoltage), Some(12.0));
        assert_eq!(ask(&mut sim, CommandKind::ReadCurrent), Some(0.6));

        sim.write_string("ISET1:0.300").unwrap();
        assert_eq!(ask(&mut sim, CommandKind::ReadCurrent), Some(0.3));
        assert_eq!(ask(&mut sim, CommandKind::ReadVoltage), Some(6.0));
    }

    #[test]
    fn test_ripple_stays_small() {
        let mut sim = SimulatedSupply::with_seed(42);
        sim.open_port(DEMO_PORT, &SerialSettings::default()).unwrap();
        sim.write_string("OUT1").unwrap();
        for _ in 0..50 {
            let v = ask(&mut sim, CommandKind::ReadVoltage).unwrap();
            assert!((v - 12.0).abs() <= 0.03, "voltage {} out of range", v);
        }
    }

    #[test]
    fn test_fragmented_replies() {
        let mut sim = SimulatedSupply::with_seed(1)
            .without_ripple()
            .with_fragmented_replies();
        sim.open_port(DEMO_PORT, &SerialSettings::default()).unwrap();
        sim.write_string("VSET1?").unwrap();
        let first = sim.read_available_string().unwrap();
        let second = sim.read_available_string().unwrap();
        assert_eq!(first, "12");
        assert_eq!(second, ".00");
    }

    #[test]
    fn test_unknown_request_is_ignored() {
        let mut sim = open_supply();
        sim.write_string("*IDN?").unwrap();
        assert_eq!(sim.read_available_string().unwrap(), "");
    }
}
