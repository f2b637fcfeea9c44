//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by the external ASR and transcoder wire formats;
//! changing them breaks interoperability rather than tuning behavior.

// ─────────────────────────────────────────────────────────────────────────────
// Audio Framing
// ─────────────────────────────────────────────────────────────────────────────

/// Sample width of the raw PCM the transcoder emits (16-bit signed, little-endian).
pub const PCM_BYTES_PER_SAMPLE: usize = 2;

/// Read chunk size for the WEBM (Opus-in-WebM) transcoder path.
///
/// Container framing means reads don't need to align to sample boundaries;
/// 8192 bytes keeps read latency low without flooding the buffer with tiny chunks.
pub const WEBM_READ_CHUNK_BYTES: usize = 8192;

/// Sample rate used for the Opus-in-WebM transcoder path. Fixed by the codec's
/// common operating point, independent of the source PCM sample rate.
pub const WEBM_SAMPLE_RATE: u32 = 48_000;

// ─────────────────────────────────────────────────────────────────────────────
// Timing
// ─────────────────────────────────────────────────────────────────────────────

/// Deadline for the ASR's first (config) message after the uplink connects.
pub const ASR_HANDSHAKE_TIMEOUT_SECS: u64 = 5;

/// Wall-clock bound on the graceful-stop handshake (empty frame -> ready_to_stop).
pub const GRACEFUL_STOP_TIMEOUT_SECS: u64 = 5;

/// Poll window for a single bounded read from the transcoder's stdout.
///
/// Bounds how quickly the ingest loop notices STOP / RESTART_INGEST / a format
/// change even while the transcoder stays silent.
pub const INGEST_READ_POLL_SECS: u64 = 1;

/// Starting value for exponential reconnect backoff.
pub const INITIAL_BACKOFF_SECS: u64 = 1;

/// WebSocket application-level ping interval/timeout for the ASR uplink.
pub const ASR_PING_INTERVAL_SECS: u64 = 20;

// ─────────────────────────────────────────────────────────────────────────────
// Buffering
// ─────────────────────────────────────────────────────────────────────────────

/// Default capacity of the bounded audio buffer between ingest and the ASR session.
pub const DEFAULT_AUDIO_BUFFER_CAPACITY: usize = 100;

/// Log an overflow drop only every Nth occurrence, to avoid flooding logs when
/// the buffer is persistently full.
pub const BUFFER_DROP_LOG_INTERVAL: u64 = 50;

/// Default cooperative-yield interval for the ASR sender task (seconds).
pub const DEFAULT_SEND_BUDGET_SECS: f64 = 0.1;
