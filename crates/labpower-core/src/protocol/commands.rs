//! Protocol commands
//!
//! Defines the request table of the KA3005-style ASCII protocol.

use serde::{Deserialize, Serialize};

/// Request kinds understood by the power supply (channel 1 only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    /// Voltage setpoint (`VSET1`)
    SetVoltage,

    /// Current limit setpoint (`ISET1`)
    SetCurrent,

    /// Measured output voltage (`VOUT1?`)
    ReadVoltage,

    /// Measured output current (`IOUT1?`)
    ReadCurrent,

    /// Output relay on/off (`OUT`)
    SetOutputEnabled,
}

/// Fixed-width decimal numbers as the supply formats them
///
/// `int_digits` digits, a `.`, then `frac_digits` digits. Voltages are
/// `dd.dd`, currents are `d.ddd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnswerPattern {
    /// Digits before the decimal point
    pub int_digits: usize,
    /// Digits after the decimal point
    pub frac_digits: usize,
}

/// Voltage field: `12.34`
pub const VOLTAGE_PATTERN: AnswerPattern = AnswerPattern {
    int_digits: 2,
    frac_digits: 2,
};

/// Current field: `1.234`
pub const CURRENT_PATTERN: AnswerPattern = AnswerPattern {
    int_digits: 1,
    frac_digits: 3,
};

impl AnswerPattern {
    /// Total characters of a matching field, decimal point included
    pub fn len(&self) -> usize {
        self.int_digits + 1 + self.frac_digits
    }

    /// Largest value representable in this field
    pub fn max_value(&self) -> f64 {
        let scale = 10f64.powi(self.frac_digits as i32);
        (10f64.powi(self.int_digits as i32) * scale - 1.0) / scale
    }

    /// Find the leftmost substring of `text` matching this pattern
    pub fn find<'a>(&self, text: &'a str) -> Option<&'a str> {
        let bytes = text.as_bytes();
        let len = self.len();
        if self.frac_digits == 0 || self.int_digits == 0 || bytes.len() < len {
            return None;
        }

        (0..=bytes.len() - len)
            .find(|&start| self.matches_at(&bytes[start..start + len]))
            // A match starts with an ASCII digit, so `start` is a char boundary
            .map(|start| &text[start..start + len])
    }

    fn matches_at(&self, window: &[u8]) -> bool {
        window.iter().enumerate().all(|(i, b)| {
            if i == self.int_digits {
                *b == b'.'
            } else {
                b.is_ascii_digit()
            }
        })
    }

    /// Format `value` to exactly this field shape, zero padded
    ///
    /// Returns `None` for values the field cannot carry (negative, non-finite
    /// or too large once rounded).
    pub fn format(&self, value: f64) -> Option<String> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        // `-0.0` passes the sign check but prints as "-0.00"
        let value = value + 0.0;
        let text = format!(
            "{:0width$.prec$}",
            value,
            width = self.len(),
            prec = self.frac_digits
        );
        (text.len() == self.len()).then_some(text)
    }
}

impl CommandKind {
    /// All kinds, in protocol table order
    pub const ALL: [CommandKind; 5] = [
        CommandKind::SetVoltage,
        CommandKind::SetCurrent,
        CommandKind::ReadVoltage,
        CommandKind::ReadCurrent,
        CommandKind::SetOutputEnabled,
    ];

    /// Prefix of the write request; the value is appended after it
    pub fn write_prefix(&self) -> Option<&'static str> {
        match self {
            CommandKind::SetVoltage => Some("VSET1:"),
            CommandKind::SetCurrent => Some("ISET1:"),
            CommandKind::SetOutputEnabled => Some("OUT"),
            CommandKind::ReadVoltage | CommandKind::ReadCurrent => None,
        }
    }

    /// Query string sent when no value is supplied
    pub fn read_query(&self) -> Option<&'static str> {
        match self {
            CommandKind::SetVoltage => Some("VSET1?"),
            CommandKind::SetCurrent => Some("ISET1?"),
            CommandKind::ReadVoltage => Some("VOUT1?"),
            CommandKind::ReadCurrent => Some("IOUT1?"),
            CommandKind::SetOutputEnabled => None,
        }
    }

    /// Shape of the numeric reply to the read query
    pub fn answer_pattern(&self) -> Option<AnswerPattern> {
        match self {
            CommandKind::SetVoltage | CommandKind::ReadVoltage => Some(VOLTAGE_PATTERN),
            CommandKind::SetCurrent | CommandKind::ReadCurrent => Some(CURRENT_PATTERN),
            CommandKind::SetOutputEnabled => None,
        }
    }

    /// Build the write request for a numeric value
    pub fn encode_value(&self, value: f64) -> Option<String> {
        let prefix = match self {
            CommandKind::SetVoltage | CommandKind::SetCurrent => self.write_prefix()?,
            _ => return None,
        };
        let field = self.answer_pattern()?.format(value)?;
        Some(format!("{}{}", prefix, field))
    }

    /// Build the write request for an on/off value
    pub fn encode_flag(&self, flag: bool) -> Option<String> {
        match self {
            CommandKind::SetOutputEnabled => {
                Some(format!("{}{}", self.write_prefix()?, u8::from(flag)))
            }
            _ => None,
        }
    }

    /// Human readable label for logs and the CLI
    pub fn label(&self) -> &'static str {
        match self {
            CommandKind::SetVoltage => "voltage setpoint",
            CommandKind::SetCurrent => "current setpoint",
            CommandKind::ReadVoltage => "output voltage",
            CommandKind::ReadCurrent => "output current",
            CommandKind::SetOutputEnabled => "output enable",
        }
    }
}
