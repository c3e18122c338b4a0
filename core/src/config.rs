//! Engine configuration.
//!
//! Follows the teacher's `ServerConfig::load()` convention: scan a fixed
//! list of candidate paths, fall back to `Default` with a warning when none
//! is found. A [`EngineConfig`] is read once at startup and handed to
//! [`crate::orchestrator::Engine::new`]; the operator surface (CLI flags)
//! overrides individual fields afterward rather than re-parsing the file.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use lanvoice_protocol::{control, discovery, rtp};

use crate::error::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_display_name")]
    pub display_name: String,

    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    #[serde(default = "default_udp_port")]
    pub udp_port: u16,

    /// Maximum number of joined participants a server will accept (§3).
    #[serde(default = "default_max_peers")]
    pub max_peers: u8,

    #[serde(default = "default_gain")]
    pub capture_volume: f32,

    #[serde(default = "default_gain")]
    pub playback_volume: f32,

    #[serde(default)]
    pub capture_muted: bool,
}

fn default_display_name() -> String {
    "lanvoice".to_string()
}
fn default_discovery_port() -> u16 {
    discovery::DEFAULT_DISCOVERY_PORT
}
fn default_tcp_port() -> u16 {
    control::DEFAULT_TCP_PORT
}
fn default_udp_port() -> u16 {
    rtp::DEFAULT_AUDIO_PORT
}
fn default_max_peers() -> u8 {
    16
}
fn default_gain() -> f32 {
    1.0
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            discovery_port: default_discovery_port(),
            tcp_port: default_tcp_port(),
            udp_port: default_udp_port(),
            max_peers: default_max_peers(),
            capture_volume: default_gain(),
            playback_volume: default_gain(),
            capture_muted: false,
        }
    }
}

impl EngineConfig {
    /// Scans the usual candidate paths, falling back to defaults. Mirrors
    /// the teacher's `ServerConfig::load`.
    pub fn load() -> Self {
        let candidates = ["config.toml", "~/.config/lanvoice/config.toml"];

        for path in candidates {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                match Self::load_from_file(expanded.as_ref()) {
                    Ok(cfg) => return cfg,
                    Err(e) => {
                        tracing::warn!("failed to load {}: {}", expanded, e);
                    }
                }
            }
        }

        tracing::warn!("no config.toml found, using defaults");
        Self::default()
    }

    pub fn load_from_file(path: &str) -> Result<Self, CoreError> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CoreError::UnresolvableAddress(format!("{path}: {e}")))?;
        tracing::info!("configuration loaded from {}", path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        for port in [self.discovery_port, self.tcp_port] {
            if port == 0 {
                return Err(CoreError::InvalidPort(port));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_ports() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.discovery_port, 37020);
        assert_eq!(cfg.tcp_port, 5000);
        assert_eq!(cfg.udp_port, 6000);
    }

    #[test]
    fn rejects_zero_port() {
        let mut cfg = EngineConfig::default();
        cfg.tcp_port = 0;
        assert!(cfg.validate().is_err());
    }
}
