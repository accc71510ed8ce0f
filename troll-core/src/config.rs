//! Configuration for probe connections.
//!
//! Every value has a sensible default; a JSON file only needs to name the
//! fields it overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Bounds for every blocking wait in the protocol clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub write_complete_ms: u64,
    pub poll_interval_ms: u64,
    /// Textual replies on control and register paths.
    pub short_reply_ms: u64,
    /// General purpose textual queries.
    pub interrogate_ms: u64,
    /// Completion of one binary packet once it has started.
    pub packet_ms: u64,
    /// Draining stale input after the wake sequence.
    pub wake_drain_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            write_complete_ms: 1000,
            poll_interval_ms: 10,
            short_reply_ms: 2000,
            interrogate_ms: 20_000,
            packet_ms: 5000,
            wake_drain_ms: 1000,
        }
    }
}

impl Timeouts {
    pub const fn write_complete(&self) -> Duration {
        Duration::from_millis(self.write_complete_ms)
    }

    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub const fn short_reply(&self) -> Duration {
        Duration::from_millis(self.short_reply_ms)
    }

    pub const fn interrogate(&self) -> Duration {
        Duration::from_millis(self.interrogate_ms)
    }

    pub const fn packet(&self) -> Duration {
        Duration::from_millis(self.packet_ms)
    }

    pub const fn wake_drain(&self) -> Duration {
        Duration::from_millis(self.wake_drain_ms)
    }
}

/// What to do with bytes other than `+` while waiting for an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckPolicy {
    /// Log and keep waiting.
    #[default]
    TolerateNoise,
    /// A `-` is a protocol violation, other bytes are logged and skipped.
    Strict,
}

/// Packet sizing for the binary protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketSettings {
    pub memory_read_chunk: usize,
    pub flash_write_chunk: usize,
    pub memory_map_chunk: usize,
    pub ack_policy: AckPolicy,
}

impl Default for PacketSettings {
    fn default() -> Self {
        Self {
            memory_read_chunk: 0x100,
            flash_write_chunk: 0x100,
            memory_map_chunk: 0x200,
            ack_policy: AckPolicy::default(),
        }
    }
}

/// Where the dump files of a corefile are based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorefileLayout {
    pub rom_base: u32,
    pub ram_base: u32,
}

impl Default for CorefileLayout {
    fn default() -> Self {
        Self { rom_base: 0x0800_0000, ram_base: 0x2000_0000 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub timeouts: Timeouts,
    pub packets: PacketSettings,
    pub corefile: CorefileLayout,
}

impl ProbeConfig {
    /// Load a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ProbeConfig =
            serde_json::from_str(r#"{ "timeouts": { "interrogate_ms": 500 } }"#).unwrap();
        assert_eq!(config.timeouts.interrogate(), Duration::from_millis(500));
        assert_eq!(config.timeouts.short_reply(), Duration::from_secs(2));
        assert_eq!(config.packets, PacketSettings::default());
        assert_eq!(config.corefile.rom_base, 0x0800_0000);
    }

    #[test]
    fn test_ack_policy_serialization() {
        let settings = PacketSettings { ack_policy: AckPolicy::Strict, ..Default::default() };
        let json = serde_json::to_string(&settings).unwrap();
        assert!(json.contains("\"strict\""));
        let decoded: PacketSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, settings);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ProbeConfig::load(Path::new("/nonexistent/troll.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
