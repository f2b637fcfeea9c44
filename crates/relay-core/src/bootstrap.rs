//! Application bootstrap and dependency wiring.
//!
//! This module is the composition root - the single place where the audio
//! buffer, format controller, event signals, subscriber registry, ingest
//! supervisor, ASR session and downlink server are instantiated and wired
//! together.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::api::{self, AppState};
use crate::asr_session::{self, AsrConfig};
use crate::buffer::AudioBuffer;
use crate::constants::DEFAULT_AUDIO_BUFFER_CAPACITY;
use crate::error::{RelayError, RelayResult};
use crate::format::{AudioFormat, FormatController};
use crate::ingest::{self, IngestConfig};
use crate::signals::EventSignals;
use crate::subscribers::SubscriberRegistry;
use crate::tls;

/// Everything [`bootstrap`] needs to wire up a running relay.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// RTMP URL to ingest from.
    pub rtmp_url: String,
    /// Path (or name on `PATH`) of the transcoder binary.
    pub transcoder_path: String,
    /// PCM sample rate when the ASR requests raw audio.
    pub sample_rate: u32,
    /// Chunk duration in milliseconds, used to size PCM reads.
    pub chunk_ms: u64,
    /// Opus bitrate (bits/sec) when the ASR requests WebM.
    pub asr_audio_bitrate: u32,
    /// Cap on exponential reconnect backoff, shared by ingest and the ASR session.
    pub max_backoff_secs: u64,
    /// Idle threshold before the source is considered silent.
    pub stop_timeout_secs: u64,
    /// WebSocket URL of the ASR uplink.
    pub asr_url: String,
    /// Granularity at which the ASR sender reconsiders its overall deadline.
    pub send_budget_secs: f64,
    /// CA trust material (PEM text or a file path) for `wss://` ASR uplinks.
    pub trust: Option<String>,
    /// When set, caption/translation edges are logged instead of broadcast.
    pub debug: bool,
    /// Address the downlink HTTP/WebSocket server binds to.
    pub bind_addr: SocketAddr,
}

/// Handle to a running relay; drives graceful shutdown and exposes live state.
pub struct RelayHandle {
    signals: Arc<EventSignals>,
    subscribers: Arc<SubscriberRegistry>,
    ingest_task: JoinHandle<()>,
    asr_task: JoinHandle<()>,
    server_task: JoinHandle<RelayResult<()>>,
}

impl RelayHandle {
    /// Number of currently connected downlink subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.connection_count()
    }

    /// Initiates graceful shutdown: raises STOP and waits for the ingest and
    /// ASR supervisors to unwind before tearing down the downlink server.
    pub async fn shutdown(self) {
        log::info!("relay shutdown requested");
        self.signals.stop.set();
        let _ = self.ingest_task.await;
        let _ = self.asr_task.await;
        self.server_task.abort();
        log::info!("relay shutdown complete");
    }
}

/// Bootstraps all relay components and spawns them as background tasks.
///
/// Wiring order:
/// 1. Shared primitives: audio buffer, format controller, event signals, subscriber registry.
/// 2. TLS client configuration for the ASR uplink.
/// 3. The downlink listener is bound synchronously, so a bind failure is
///    returned from here rather than discovered later inside a spawned task.
/// 4. Ingest supervisor (C4), spawned against the shared primitives.
/// 5. ASR session supervisor (C5), spawned against the same primitives.
/// 6. Downlink HTTP/WebSocket server, served against the already-bound listener.
///
/// # Errors
///
/// Returns an error if the configured TLS trust material cannot be parsed, or
/// if the downlink address cannot be bound.
pub fn bootstrap(cfg: BootstrapConfig) -> RelayResult<RelayHandle> {
    let buffer = Arc::new(AudioBuffer::new(DEFAULT_AUDIO_BUFFER_CAPACITY));
    let format = Arc::new(FormatController::new(AudioFormat::Webm));
    let signals = Arc::new(EventSignals::default());
    let subscribers = Arc::new(SubscriberRegistry::new());

    let tls_config = tls::build_client_config(cfg.trust.as_deref())?;

    let std_listener = std::net::TcpListener::bind(cfg.bind_addr)
        .map_err(|e| RelayError::Bind(e.to_string()))?;
    std_listener
        .set_nonblocking(true)
        .map_err(|e| RelayError::Bind(e.to_string()))?;
    let listener = tokio::net::TcpListener::from_std(std_listener)
        .map_err(|e| RelayError::Bind(e.to_string()))?;

    let ingest_cfg = IngestConfig {
        rtmp_url: cfg.rtmp_url,
        transcoder_path: cfg.transcoder_path,
        sample_rate: cfg.sample_rate,
        chunk_ms: cfg.chunk_ms,
        asr_audio_bitrate: cfg.asr_audio_bitrate,
        max_backoff_secs: cfg.max_backoff_secs,
        stop_timeout_secs: cfg.stop_timeout_secs,
    };
    let asr_cfg = AsrConfig {
        asr_url: cfg.asr_url,
        stop_timeout_secs: cfg.stop_timeout_secs,
        send_budget_secs: cfg.send_budget_secs,
        max_backoff_secs: cfg.max_backoff_secs,
        tls_config,
        debug: cfg.debug,
    };

    let ingest_task = tokio::spawn(ingest::run_ingest(
        ingest_cfg,
        Arc::clone(&buffer),
        Arc::clone(&format),
        Arc::clone(&signals),
        Arc::clone(&subscribers),
    ));
    let asr_task = tokio::spawn(asr_session::run_asr_session(
        asr_cfg,
        buffer,
        format,
        Arc::clone(&signals),
        Arc::clone(&subscribers),
    ));

    let app_state = AppState {
        subscribers: Arc::clone(&subscribers),
        signals: Arc::clone(&signals),
    };
    let server_task = tokio::spawn(async move { api::start_server(app_state, listener).await });

    Ok(RelayHandle {
        signals,
        subscribers,
        ingest_task,
        asr_task,
        server_task,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(bind_addr: SocketAddr) -> BootstrapConfig {
        BootstrapConfig {
            rtmp_url: "rtmp://example".into(),
            transcoder_path: "true".into(),
            sample_rate: 16_000,
            chunk_ms: 100,
            asr_audio_bitrate: 32_000,
            max_backoff_secs: 30,
            stop_timeout_secs: 10,
            asr_url: "ws://127.0.0.1:1".into(),
            send_budget_secs: 0.1,
            trust: None,
            debug: false,
            bind_addr,
        }
    }

    #[tokio::test]
    async fn bind_failure_is_returned_instead_of_swallowed() {
        // Occupy the port first so bootstrap()'s own bind fails.
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = occupied.local_addr().unwrap();

        let result = bootstrap(base_config(addr));

        assert!(matches!(result, Err(RelayError::Bind(_))));
    }
}
