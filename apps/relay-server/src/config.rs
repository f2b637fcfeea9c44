//! Relay server configuration.
//!
//! Supports loading from a YAML file with environment variable overrides;
//! CLI flags (handled in `main.rs`) take precedence over both.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use anyhow::{Context, Result};
use relay_core::bootstrap::BootstrapConfig;
use serde::Deserialize;

/// Relay server configuration loaded from YAML with environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// RTMP URL to ingest from.
    /// Override: `RELAY_RTMP_URL`
    pub rtmp_url: String,

    /// WebSocket URL of the ASR uplink.
    /// Override: `RELAY_ASR_URL`
    pub asr_url: String,

    /// Path (or name on `PATH`) of the transcoder binary.
    /// Override: `RELAY_TRANSCODER_PATH`
    pub transcoder_path: String,

    /// IP address the downlink server binds to.
    /// Override: `RELAY_BIND_IP`
    pub bind_ip: IpAddr,

    /// Port the downlink server binds to.
    /// Override: `RELAY_BIND_PORT`
    pub bind_port: u16,

    /// PCM sample rate requested when the ASR wants raw audio.
    pub sample_rate: u32,

    /// Chunk duration in milliseconds, used to size PCM reads.
    pub chunk_ms: u64,

    /// Opus bitrate (bits/sec) requested when the ASR wants WebM.
    pub asr_audio_bitrate: u32,

    /// Cap on exponential reconnect backoff, in seconds.
    pub max_backoff_secs: u64,

    /// Idle threshold, in seconds, before the source is considered silent.
    pub stop_timeout_secs: u64,

    /// Granularity, in seconds, at which the ASR sender reconsiders its deadline.
    pub send_budget_secs: f64,

    /// CA trust material (PEM text or a file path) for `wss://` ASR uplinks.
    /// Override: `RELAY_TLS_TRUST`
    pub tls_trust: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            rtmp_url: "rtmp://localhost/live/stream".into(),
            asr_url: "ws://localhost:8765".into(),
            transcoder_path: "ffmpeg".into(),
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            bind_port: 8000,
            sample_rate: 16_000,
            chunk_ms: 100,
            asr_audio_bitrate: 32_000,
            max_backoff_secs: 30,
            stop_timeout_secs: 15,
            send_budget_secs: 0.1,
            tls_trust: None,
        }
    }
}

impl RelayConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("RELAY_RTMP_URL") {
            self.rtmp_url = val;
        }
        if let Ok(val) = std::env::var("RELAY_ASR_URL") {
            self.asr_url = val;
        }
        if let Ok(val) = std::env::var("RELAY_TRANSCODER_PATH") {
            self.transcoder_path = val;
        }
        if let Ok(val) = std::env::var("RELAY_BIND_IP") {
            if let Ok(ip) = val.parse() {
                self.bind_ip = ip;
            }
        }
        if let Ok(val) = std::env::var("RELAY_BIND_PORT") {
            if let Ok(port) = val.parse() {
                self.bind_port = port;
            }
        }
        if let Ok(val) = std::env::var("RELAY_TLS_TRUST") {
            self.tls_trust = Some(val);
        }
    }

    /// Converts to relay-core's bootstrap configuration.
    pub fn to_bootstrap_config(&self, debug: bool) -> BootstrapConfig {
        BootstrapConfig {
            rtmp_url: self.rtmp_url.clone(),
            transcoder_path: self.transcoder_path.clone(),
            sample_rate: self.sample_rate,
            chunk_ms: self.chunk_ms,
            asr_audio_bitrate: self.asr_audio_bitrate,
            max_backoff_secs: self.max_backoff_secs,
            stop_timeout_secs: self.stop_timeout_secs,
            asr_url: self.asr_url.clone(),
            send_budget_secs: self.send_budget_secs,
            trust: self.tls_trust.clone(),
            debug,
            bind_addr: SocketAddr::new(self.bind_ip, self.bind_port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_produce_a_valid_bootstrap_config() {
        let config = RelayConfig::default();
        let bootstrap = config.to_bootstrap_config(false);
        assert_eq!(bootstrap.bind_addr.port(), 8000);
    }
}
