//! Ingest supervisor: spawns the transcoder, reads its stdout into the audio
//! buffer, and restarts it on format change, failure or prolonged silence.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::sleep;

use crate::buffer::AudioBuffer;
use crate::constants::{
    INGEST_READ_POLL_SECS, INITIAL_BACKOFF_SECS, PCM_BYTES_PER_SAMPLE, WEBM_READ_CHUNK_BYTES,
    WEBM_SAMPLE_RATE,
};
use crate::format::{AudioFormat, FormatController};
use crate::signals::EventSignals;
use crate::subscribers::SubscriberRegistry;

/// Settings the ingest supervisor needs to build and run the transcoder.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// RTMP URL to read from.
    pub rtmp_url: String,
    /// Path (or name on `PATH`) of the transcoder binary.
    pub transcoder_path: String,
    /// PCM sample rate when the ASR requests raw audio.
    pub sample_rate: u32,
    /// Chunk duration in milliseconds, used to size PCM reads.
    pub chunk_ms: u64,
    /// Opus bitrate (bits/sec) when the ASR requests WebM.
    pub asr_audio_bitrate: u32,
    /// Cap on exponential reconnect backoff.
    pub max_backoff_secs: u64,
    /// Idle threshold before STREAM_END is raised.
    pub stop_timeout_secs: u64,
}

fn build_command(format: AudioFormat, cfg: &IngestConfig) -> (Command, usize) {
    let mut cmd = Command::new(&cfg.transcoder_path);
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    match format {
        AudioFormat::Pcm => {
            cmd.args([
                "-i",
                &cfg.rtmp_url,
                "-vn",
                "-ac",
                "1",
                "-ar",
                &cfg.sample_rate.to_string(),
                "-f",
                "s16le",
                "-",
            ]);
            let read_size = cfg.sample_rate as usize * PCM_BYTES_PER_SAMPLE * cfg.chunk_ms as usize
                / 1000;
            (cmd, read_size.max(1))
        }
        AudioFormat::Webm => {
            cmd.args([
                "-i",
                &cfg.rtmp_url,
                "-vn",
                "-ac",
                "1",
                "-ar",
                &WEBM_SAMPLE_RATE.to_string(),
                "-c:a",
                "libopus",
                "-b:a",
                &cfg.asr_audio_bitrate.to_string(),
                "-f",
                "webm",
                "-",
            ]);
            (cmd, WEBM_READ_CHUNK_BYTES)
        }
    }
}

fn spawn_stderr_drain(mut child: Child) -> Child {
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::debug!("transcoder: {line}");
            }
        });
    }
    child
}

/// Outcome of one attempt at spawning and reading the transcoder.
enum IngestOutcome {
    /// STOP was observed; the outer loop should exit.
    Stopped,
    /// The format changed, or the uplink requested a fresh container header.
    Restart,
    /// The process exited, failed to spawn, or the read loop errored.
    Failed,
}

async fn run_one_attempt(
    cfg: &IngestConfig,
    buffer: &AudioBuffer,
    format: &FormatController,
    signals: &EventSignals,
    subscribers: &SubscriberRegistry,
    backoff: &mut Duration,
) -> IngestOutcome {
    let current_format = format.current();
    let (mut command, read_size) = build_command(current_format, cfg);
    let mut format_rx = format.subscribe();

    let mut child = match command.spawn() {
        Ok(child) => spawn_stderr_drain(child),
        Err(e) => {
            log::error!("failed to spawn transcoder: {e}");
            subscribers.broadcast_status("error", &format!("transcoder spawn failed: {e}"));
            return IngestOutcome::Failed;
        }
    };

    // Reset on successful spawn, not only on a format-driven restart, so a
    // transient failure's inflated backoff doesn't carry into a healthy run.
    *backoff = Duration::from_secs(INITIAL_BACKOFF_SECS);
    subscribers.broadcast_status("running", "ingest started");

    let mut stdout = match child.stdout.take() {
        Some(s) => s,
        None => return IngestOutcome::Failed,
    };

    let mut last_data = Instant::now();
    let mut read_buf = vec![0u8; read_size];
    let poll = Duration::from_secs(INGEST_READ_POLL_SECS);
    let idle_threshold = Duration::from_secs(cfg.stop_timeout_secs);

    let outcome = loop {
        if signals.stop.is_set() {
            break IngestOutcome::Stopped;
        }
        if signals.restart_ingest.is_set() {
            signals.restart_ingest.clear();
            break IngestOutcome::Restart;
        }
        if format_rx.has_changed().unwrap_or(false) {
            let _ = format_rx.borrow_and_update();
            break IngestOutcome::Restart;
        }

        match tokio::time::timeout(poll, stdout.read(&mut read_buf)).await {
            Ok(Ok(0)) => {
                signals.stream_end.set();
                break IngestOutcome::Failed;
            }
            Ok(Ok(n)) => {
                last_data = Instant::now();
                if signals.stream_end.is_set() {
                    signals.stream_end.clear();
                }
                buffer.put(Bytes::copy_from_slice(&read_buf[..n]));
            }
            Ok(Err(e)) => {
                log::warn!("transcoder stdout read error: {e}");
                break IngestOutcome::Failed;
            }
            Err(_timeout) => {
                if !signals.stream_end.is_set() && last_data.elapsed() >= idle_threshold {
                    signals.stream_end.set();
                    break IngestOutcome::Failed;
                }
            }
        }
    };

    let _ = child.kill().await;
    let _ = child.wait().await;
    outcome
}

/// Runs the ingest supervisor loop until STOP is set.
pub async fn run_ingest(
    cfg: IngestConfig,
    buffer: Arc<AudioBuffer>,
    format: Arc<FormatController>,
    signals: Arc<EventSignals>,
    subscribers: Arc<SubscriberRegistry>,
) {
    let mut backoff = Duration::from_secs(INITIAL_BACKOFF_SECS);
    let max_backoff = Duration::from_secs(cfg.max_backoff_secs);

    while !signals.stop.is_set() {
        let outcome = run_one_attempt(
            &cfg,
            &buffer,
            &format,
            &signals,
            &subscribers,
            &mut backoff,
        )
        .await;
        match outcome {
            IngestOutcome::Stopped => break,
            IngestOutcome::Restart => {
                backoff = Duration::from_secs(INITIAL_BACKOFF_SECS);
                continue;
            }
            IngestOutcome::Failed => {
                sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }
    log::info!("ingest supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_read_size_matches_chunk_duration() {
        let cfg = IngestConfig {
            rtmp_url: "rtmp://example".into(),
            transcoder_path: "ffmpeg".into(),
            sample_rate: 16_000,
            chunk_ms: 100,
            asr_audio_bitrate: 32_000,
            max_backoff_secs: 30,
            stop_timeout_secs: 10,
        };
        let (_, read_size) = build_command(AudioFormat::Pcm, &cfg);
        assert_eq!(read_size, 16_000 * 2 * 100 / 1000);
    }

    #[test]
    fn webm_read_size_is_fixed() {
        let cfg = IngestConfig {
            rtmp_url: "rtmp://example".into(),
            transcoder_path: "ffmpeg".into(),
            sample_rate: 16_000,
            chunk_ms: 100,
            asr_audio_bitrate: 32_000,
            max_backoff_secs: 30,
            stop_timeout_secs: 10,
        };
        let (_, read_size) = build_command(AudioFormat::Webm, &cfg);
        assert_eq!(read_size, WEBM_READ_CHUNK_BYTES);
    }

    #[tokio::test]
    async fn successful_spawn_resets_backoff_even_though_the_attempt_then_fails() {
        // "true" spawns successfully and exits immediately with no stdout,
        // so the attempt still ends in `Failed` - backoff must reset on the
        // spawn succeeding, not on the attempt's outcome.
        let cfg = IngestConfig {
            rtmp_url: "rtmp://example".into(),
            transcoder_path: "true".into(),
            sample_rate: 16_000,
            chunk_ms: 100,
            asr_audio_bitrate: 32_000,
            max_backoff_secs: 30,
            stop_timeout_secs: 10,
        };
        let buffer = AudioBuffer::new(8);
        let format = FormatController::new(AudioFormat::Pcm);
        let signals = EventSignals::new();
        let subscribers = SubscriberRegistry::new();
        let mut backoff = Duration::from_secs(16);

        let outcome =
            run_one_attempt(&cfg, &buffer, &format, &signals, &subscribers, &mut backoff).await;

        assert!(matches!(outcome, IngestOutcome::Failed));
        assert_eq!(backoff, Duration::from_secs(INITIAL_BACKOFF_SECS));
    }
}
