//! Runtime configuration
//!
//! Settings load from a TOML file with serde defaults, so a partial file (or
//! none at all) yields a working configuration. Discovery order: a local
//! `intercom.toml` in the working directory, then the user config directory.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::constants;
use crate::error::{Error, LinkError};

/// A remote endpoint as host name (or IP literal) plus port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddress {
    pub host: String,
    pub port: u16,
}

impl EndpointAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve to a concrete socket address, taking the first result.
    ///
    /// An empty host, a port of zero, or a name that does not resolve all
    /// report [`LinkError::InvalidAddress`].
    pub fn resolve(&self) -> Result<SocketAddr, LinkError> {
        if self.host.trim().is_empty() || self.port == 0 {
            return Err(LinkError::InvalidAddress(self.to_string()));
        }
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| LinkError::InvalidAddress(self.to_string()))
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Where the two remote peers live.
///
/// The microphone peer serves the inbound audio stream; the speaker peer
/// accepts the outbound audio stream and the control channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RemoteConfig {
    /// Host serving remote microphone audio.
    pub mic_host: String,
    /// Host accepting local microphone audio and control commands.
    pub speaker_host: String,
    pub inbound_port: u16,
    pub outbound_port: u16,
    pub control_port: u16,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            mic_host: "127.0.0.1".to_string(),
            speaker_host: "127.0.0.1".to_string(),
            inbound_port: constants::DEFAULT_INBOUND_PORT,
            outbound_port: constants::DEFAULT_OUTBOUND_PORT,
            control_port: constants::DEFAULT_CONTROL_PORT,
        }
    }
}

/// Timeouts and pacing intervals, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub stop_grace_ms: u64,
    pub clip_yield_poll_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: constants::CONNECT_TIMEOUT_MS,
            io_timeout_ms: constants::IO_TIMEOUT_MS,
            stop_grace_ms: constants::STOP_GRACE_MS,
            clip_yield_poll_ms: constants::CLIP_YIELD_POLL_MS,
        }
    }
}

impl TimingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn clip_yield_poll(&self) -> Duration {
        Duration::from_millis(self.clip_yield_poll_ms)
    }
}

/// Transfer chunk sizes. Devices may suggest their own preferred sizes;
/// these are the fallbacks when they do not.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AudioConfig {
    pub relay_chunk_bytes: usize,
    pub clip_chunk_bytes: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            relay_chunk_bytes: constants::RELAY_CHUNK_BYTES,
            clip_chunk_bytes: constants::CLIP_CHUNK_BYTES,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub remote: RemoteConfig,
    pub timing: TimingConfig,
    pub audio: AudioConfig,
}

impl AppConfig {
    /// Load from the first config file found, or fall back to defaults.
    pub fn load() -> Result<Self, Error> {
        match discover_config_file() {
            Some(path) => {
                info!(path = %path.display(), "loading configuration");
                Self::load_from_file(&path)
            }
            None => Ok(Self::default()),
        }
    }

    /// Load and parse one specific TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse from a TOML string. Missing fields take their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn inbound_endpoint(&self) -> EndpointAddress {
        EndpointAddress::new(self.remote.mic_host.clone(), self.remote.inbound_port)
    }

    pub fn outbound_endpoint(&self) -> EndpointAddress {
        EndpointAddress::new(self.remote.speaker_host.clone(), self.remote.outbound_port)
    }

    pub fn control_endpoint(&self) -> EndpointAddress {
        EndpointAddress::new(self.remote.speaker_host.clone(), self.remote.control_port)
    }
}

/// Find the config file, if any: `./intercom.toml`, then the user config
/// directory.
fn discover_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("intercom.toml");
    if local.exists() {
        return Some(local);
    }

    if let Some(base) = directories::BaseDirs::new() {
        let user = base.config_dir().join("intercom/config.toml");
        if user.exists() {
            return Some(user);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_toml_empty() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.remote.inbound_port, 8080);
        assert_eq!(config.remote.outbound_port, 8081);
        assert_eq!(config.remote.control_port, 8082);
        assert_eq!(config.timing.connect_timeout_ms, 5000);
    }

    #[test]
    fn test_partial_toml_overrides_only_named_fields() {
        let config = AppConfig::from_toml_str(
            r#"
[remote]
mic_host = "10.0.0.20"
speaker_host = "10.0.0.21"

[timing]
connect_timeout_ms = 2500
"#,
        )
        .unwrap();

        assert_eq!(config.remote.mic_host, "10.0.0.20");
        assert_eq!(config.remote.speaker_host, "10.0.0.21");
        assert_eq!(config.remote.inbound_port, 8080);
        assert_eq!(config.timing.connect_timeout_ms, 2500);
        assert_eq!(config.timing.io_timeout_ms, 5000);
        assert_eq!(config.audio.relay_chunk_bytes, 8192);
    }

    #[test]
    fn test_endpoints_split_across_hosts() {
        let mut config = AppConfig::default();
        config.remote.mic_host = "mic.local".to_string();
        config.remote.speaker_host = "speaker.local".to_string();

        assert_eq!(config.inbound_endpoint().to_string(), "mic.local:8080");
        assert_eq!(config.outbound_endpoint().to_string(), "speaker.local:8081");
        assert_eq!(config.control_endpoint().to_string(), "speaker.local:8082");
    }

    #[test]
    fn test_resolve_loopback() {
        let endpoint = EndpointAddress::new("127.0.0.1", 8080);
        let addr = endpoint.resolve().unwrap();
        assert_eq!(addr.port(), 8080);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn test_resolve_rejects_empty_host() {
        let endpoint = EndpointAddress::new("", 8080);
        assert!(matches!(
            endpoint.resolve(),
            Err(LinkError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_resolve_rejects_zero_port() {
        let endpoint = EndpointAddress::new("127.0.0.1", 0);
        assert!(matches!(
            endpoint.resolve(),
            Err(LinkError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_invalid_toml_reports_config_error() {
        let result = AppConfig::from_toml_str("[remote\nmic_host = 3");
        assert!(result.is_err());
    }
}
