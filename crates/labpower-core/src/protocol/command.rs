//! A single request/response unit
//!
//! A [`Command`] carries the request string for the supply and collects the
//! reply as it trickles in over one or more reads.

use tracing::debug;

use super::{CommandKind, ProtocolError};

/// One request sent to the supply, plus the reply collected for it
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    kind: CommandKind,
    /// Request built from a value; `None` means use the kind's read query
    request: Option<String>,
    /// Raw characters received so far
    reply: String,
    /// First substring of `reply` matching the answer pattern
    answer: Option<String>,
    answer_expected: bool,
}

impl Command {
    /// Create a read/query command for `kind`
    pub fn query(kind: CommandKind) -> Self {
        Self {
            kind,
            request: None,
            reply: String::with_capacity(10),
            answer: None,
            answer_expected: true,
        }
    }

    /// Create a set command carrying a numeric value
    ///
    /// The value is written with the field width of the kind
    /// (`dd.dd` for voltage, `d.ddd` for current). No reply is expected.
    pub fn with_value(kind: CommandKind, value: f64) -> Result<Self, ProtocolError> {
        let request = kind.encode_value(value).ok_or_else(|| {
            ProtocolError::Encoding(format!("{:?} can't carry value {}", kind, value))
        })?;
        Ok(Self::write_only(kind, request))
    }

    /// Create a set command carrying an on/off value (sent as `1`/`0`)
    pub fn with_flag(kind: CommandKind, flag: bool) -> Result<Self, ProtocolError> {
        let request = kind.encode_flag(flag).ok_or_else(|| {
            ProtocolError::Encoding(format!("{:?} can't carry an on/off value", kind))
        })?;
        Ok(Self::write_only(kind, request))
    }

    fn write_only(kind: CommandKind, request: String) -> Self {
        Self {
            kind,
            request: Some(request),
            reply: String::new(),
            answer: None,
            answer_expected: false,
        }
    }

    /// String to transmit: the encoded write request, else the read query
    ///
    /// `None` only for a query of a kind that has no read query.
    pub fn encoded_request(&self) -> Option<&str> {
        self.request.as_deref().or_else(|| self.kind.read_query())
    }

    /// Append a received chunk and try to extract the answer
    ///
    /// The whole accumulated buffer is searched, so replies split across
    /// several reads are found. Once an answer is set it never changes and
    /// further calls return `true`.
    pub fn append_reply(&mut self, chunk: &str) -> bool {
        self.reply.push_str(chunk);
        if self.answer.is_some() {
            return true;
        }

        let Some(pattern) = self.kind.answer_pattern() else {
            return false;
        };
        match pattern.find(&self.reply) {
            Some(found) => {
                debug!("Answer decoded: {} from {:?}", found, self.reply);
                self.answer = Some(found.to_string());
                true
            }
            None => false,
        }
    }

    /// Does the supply reply to this command?
    pub fn answer_expected(&self) -> bool {
        self.answer_expected
    }

    /// The decoded answer text, if a reply matched
    pub fn decoded_answer(&self) -> Option<&str> {
        self.answer.as_deref()
    }

    /// The decoded answer as a number
    pub fn decoded_value(&self) -> Option<f64> {
        self.answer.as_deref().and_then(|a| a.parse().ok())
    }

    /// Raw characters received so far
    pub fn reply(&self) -> &str {
        &self.reply
    }

    /// Which request this is
    pub fn kind(&self) -> CommandKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_set_voltage_request() {
        let cmd = Command::with_value(CommandKind::SetVoltage, 12.34).unwrap();
        assert_eq!(cmd.encoded_request(), Some("VSET1:12.34"));
        assert!(!cmd.answer_expected());
    }

    #[test]
    fn test_set_current_request() {
        let cmd = Command::with_value(CommandKind::SetCurrent, 1.5).unwrap();
        assert_eq!(cmd.encoded_request(), Some("ISET1:1.500"));
    }

    #[test]
    fn test_output_enable_request() {
        let on = Command::with_flag(CommandKind::SetOutputEnabled, true).unwrap();
        assert_eq!(on.encoded_request(), Some("OUT1"));
        assert!(!on.answer_expected());

        let off = Command::with_flag(CommandKind::SetOutputEnabled, false).unwrap();
        assert_eq!(off.encoded_request(), Some("OUT0"));
    }

    #[test]
    fn test_query_falls_back_to_read_query() {
        let cmd = Command::query(CommandKind::ReadCurrent);
        assert_eq!(cmd.encoded_request(), Some("IOUT1?"));
        assert!(cmd.answer_expected());
        assert_eq!(cmd.decoded_answer(), None);

        let setpoint = Command::query(CommandKind::SetVoltage);
        assert_eq!(setpoint.encoded_request(), Some("VSET1?"));
    }

    #[test]
    fn test_query_without_read_query() {
        let cmd = Command::query(CommandKind::SetOutputEnabled);
        assert_eq!(cmd.encoded_request(), None);
    }

    #[test]
    fn test_encoding_errors() {
        assert!(matches!(
            Command::with_value(CommandKind::ReadVoltage, 1.0),
            Err(ProtocolError::Encoding(_))
        ));
        assert!(matches!(
            Command::with_value(CommandKind::SetVoltage, 250.0),
            Err(ProtocolError::Encoding(_))
        ));
        assert!(matches!(
            Command::with_flag(CommandKind::SetCurrent, true),
            Err(ProtocolError::Encoding(_))
        ));
    }

    #[test]
    fn test_fragmented_reply() {
        let mut cmd = Command::query(CommandKind::ReadCurrent);
        assert!(!cmd.append_reply("1."));
        assert!(cmd.append_reply("234"));
        assert!(cmd.append_reply("\r\n"));
        assert_eq!(cmd.decoded_answer(), Some("1.234"));
        assert_eq!(cmd.reply(), "1.234\r\n");
    }

    #[test]
    fn test_every_split_point_decodes_the_same() {
        let whole = "\r12.34\n";
        for split in 0..=whole.len() {
            let mut cmd = Command::query(CommandKind::ReadVoltage);
            cmd.append_reply(&whole[..split]);
            cmd.append_reply(&whole[split..]);
            assert_eq!(cmd.decoded_answer(), Some("12.34"), "split at {}", split);
        }
    }

    #[test]
    fn test_answer_is_sticky() {
        let mut cmd = Command::query(CommandKind::ReadVoltage);
        assert!(cmd.append_reply("05.00"));
        assert!(cmd.append_reply("31.00"));
        assert!(cmd.append_reply(""));
        assert_eq!(cmd.decoded_answer(), Some("05.00"));
        assert_eq!(cmd.decoded_value(), Some(5.0));
    }

    #[test]
    fn test_malformed_reply() {
        let mut cmd = Command::query(CommandKind::ReadVoltage);
        assert!(!cmd.append_reply("ERR"));
        assert!(!cmd.append_reply("1.234"));
        assert_eq!(cmd.decoded_answer(), None);
    }

    #[test]
    fn test_no_pattern_never_matches() {
        let mut cmd = Command::with_flag(CommandKind::SetOutputEnabled, true).unwrap();
        assert!(!cmd.append_reply("12.34"));
        assert_eq!(cmd.decoded_answer(), None);
    }

    #[test]
    fn test_voltage_round_trip() {
        for centivolts in 0..=9999u32 {
            let v = centivolts as f64 / 100.0;
            let set = Command::with_value(CommandKind::SetVoltage, v).unwrap();
            let text = set.encoded_request().unwrap().trim_start_matches("VSET1:");
            let mut read = Command::query(CommandKind::ReadVoltage);
            assert!(read.append_reply(text));
            let decoded = read.decoded_value().unwrap();
            assert!((decoded - v).abs() < 0.005, "{} decoded as {}", v, decoded);
        }
    }

    #[test]
    fn test_current_round_trip() {
        for milliamps in 0..=9999u32 {
            let i = milliamps as f64 / 1000.0;
            let set = Command::with_value(CommandKind::SetCurrent, i).unwrap();
            let text = set.encoded_request().unwrap().trim_start_matches("ISET1:");
            let mut read = Command::query(CommandKind::ReadCurrent);
            assert!(read.append_reply(text));
            let decoded = read.decoded_value().unwrap();
            assert!((decoded - i).abs() < 0.0005, "{} decoded as {}", i, decoded);
        }
    }
}
