//! Driver tunables.
//!
//! The defaults live in `config.toml` next to the crate manifest and are compiled in. A platform
//! layer can override any subset of them with [XhciConfig::from_toml].
use std::time::Duration;

use lazy_static::lazy_static;
use log::debug;
use serde::Deserialize;

use crate::error::{Result, XhciError};

lazy_static! {
    static ref DEFAULT_TOML: toml::Value =
        toml::from_str(include_str!("../config.toml")).expect("Failed to parse internally embedded config file");
    static ref DEFAULT_CONFIG: XhciConfig = DEFAULT_TOML
        .clone()
        .try_into()
        .expect("Internally embedded config file does not describe an XhciConfig");
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct XhciConfig {
    pub command_timeout_ms: u64,
    pub transfer_timeout_ms: u64,
    pub halt_timeout_us: u64,
    pub reset_timeout_us: u64,
    pub port_reset_timeout_ms: u64,
    pub poll_interval_us: u64,
    pub command_ring_segments: usize,
    pub transfer_ring_segments: usize,
    pub event_ring_segments: usize,
    pub interrupt_moderation: u32,
    pub fetch_max_packet_size: bool,
}

impl XhciConfig {
    /// Overlays the keys present in `overrides` on the defaults.
    pub fn from_toml(overrides: &str) -> Result<Self> {
        let overrides: toml::Value = toml::from_str(overrides)?;

        let mut merged = DEFAULT_TOML.clone();
        if let (toml::Value::Table(base), toml::Value::Table(overrides)) = (&mut merged, overrides)
        {
            for (key, value) in overrides {
                debug!("config override {} = {}", key, value);
                base.insert(key, value);
            }
        }

        let config: XhciConfig = merged.try_into()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.command_ring_segments == 0
            || self.transfer_ring_segments == 0
            || self.event_ring_segments == 0
        {
            return Err(XhciError::InvalidConfig("ring segment counts must be at least 1"));
        }
        // ERSTSZ is a 16-bit field.
        if self.event_ring_segments > usize::from(u16::MAX) {
            return Err(XhciError::InvalidConfig("too many event ring segments"));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
    pub fn halt_timeout(&self) -> Duration {
        Duration::from_micros(self.halt_timeout_us)
    }
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_micros(self.reset_timeout_us)
    }
    pub fn port_reset_timeout(&self) -> Duration {
        Duration::from_millis(self.port_reset_timeout_ms)
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }
}

impl Default for XhciConfig {
    fn default() -> Self {
        DEFAULT_CONFIG.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn embedded_defaults() {
        let config = XhciConfig::default();
        assert_eq!(config.command_timeout(), Duration::from_millis(5000));
        assert_eq!(config.halt_timeout(), Duration::from_millis(16));
        assert_eq!(config.reset_timeout(), Duration::from_millis(250));
        assert_eq!(config.interrupt_moderation, 0x3E8);
        assert_eq!(config.event_ring_segments, 1);
        assert!(config.fetch_max_packet_size);
    }

    #[test]
    fn overrides_keep_other_defaults() {
        let config = XhciConfig::from_toml("command_timeout_ms = 20\nevent_ring_segments = 2\n")
            .unwrap();
        assert_eq!(config.command_timeout_ms, 20);
        assert_eq!(config.event_ring_segments, 2);
        assert_eq!(config.reset_timeout_us, 250_000);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        match XhciConfig::from_toml("command_timeout = 20") {
            Err(XhciError::Config(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn empty_rings_are_rejected() {
        match XhciConfig::from_toml("transfer_ring_segments = 0") {
            Err(XhciError::InvalidConfig(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }
}
