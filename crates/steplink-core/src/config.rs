//! Connection configuration
//!
//! Timing limits plus the control-code and opcode tables of the attached
//! firmware. Stored as pretty-printed JSON.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::protocol::{
    ControlCodes, OpcodeTable, TransportError, DEFAULT_ACK_TIMEOUT_MS, DEFAULT_BAUD_RATE,
    DEFAULT_BYTE_TIMEOUT_MS, DEFAULT_MAX_RETRIES,
};

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Serial port name
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// How long to wait for an ACK (or any inbound byte) per attempt
    pub ack_timeout_ms: u64,
    /// Inter-byte timeout inside a frame or debug line
    pub byte_timeout_ms: u64,
    /// Retransmissions before the link is declared dead
    pub max_retries: u32,
    /// ID probes before the handshake gives up
    pub max_probe_attempts: u32,
    /// Idle polls to wait for FlowContinue before the link is declared dead
    pub flow_resume_polls: u32,
    /// Consecutive unrecognized bytes tolerated before declaring desync
    pub garbage_limit: usize,
    /// Longest debug line read; reading stops there even without a NUL
    pub max_debug_line: usize,
    /// Pulse DTR on open to force a cold boot
    pub reset_on_open: bool,
    /// Control byte values
    pub codes: ControlCodes,
    /// Notification and reply opcodes
    pub opcodes: OpcodeTable,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            byte_timeout_ms: DEFAULT_BYTE_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            max_probe_attempts: 10,
            flow_resume_polls: 600,
            garbage_limit: 64,
            max_debug_line: 1024,
            reset_on_open: false,
            codes: ControlCodes::default(),
            opcodes: OpcodeTable::default(),
        }
    }
}

impl ConnectionConfig {
    /// Default configuration for a named port
    pub fn for_port(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Self::default()
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn byte_timeout(&self) -> Duration {
        Duration::from_millis(self.byte_timeout_ms)
    }

    /// Reject tables that would make the wire ambiguous
    pub fn validate(&self) -> Result<(), TransportError> {
        self.codes.validate()?;
        self.opcodes.validate()?;
        if self.max_retries == 0 {
            return Err(TransportError::Config("max_retries must be at least 1".into()));
        }
        if self.max_probe_attempts == 0 {
            return Err(TransportError::Config(
                "max_probe_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Load and validate a configuration file
    pub fn from_file(path: &Path) -> Result<Self, TransportError> {
        let content = fs::read_to_string(path)?;
        let config: ConnectionConfig = serde_json::from_str(&content)
            .map_err(|e| TransportError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON
    pub fn to_file(&self, path: &Path) -> Result<(), TransportError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| TransportError::Config(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_is_valid() {
        let config = ConnectionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ack_timeout(), Duration::from_millis(200));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("link.json");

        let mut config = ConnectionConfig::for_port("/dev/ttyACM0");
        config.max_retries = 3;
        config.opcodes = OpcodeTable::default().with_reply(0x10, 0x50);
        config.to_file(&path).unwrap();

        let loaded = ConnectionConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("link.json");
        fs::write(&path, r#"{ "port_name": "/dev/ttyUSB0", "codes": { "ack": 144 } }"#).unwrap();

        let loaded = ConnectionConfig::from_file(&path).unwrap();
        assert_eq!(loaded.port_name, "/dev/ttyUSB0");
        assert_eq!(loaded.codes.ack, 0x90);
        assert_eq!(loaded.codes.nack, ControlCodes::default().nack);
        assert_eq!(loaded.baud_rate, DEFAULT_BAUD_RATE);
    }

    #[test]
    fn test_invalid_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("link.json");
        fs::write(&path, r#"{ "codes": { "ack": 129 } }"#).unwrap();
        assert!(matches!(
            ConnectionConfig::from_file(&path),
            Err(TransportError::Config(_))
        ));

        fs::write(&path, "not json").unwrap();
        assert!(ConnectionConfig::from_file(&path).is_err());
    }
}
