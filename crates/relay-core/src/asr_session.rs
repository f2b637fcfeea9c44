//! ASR session: owns the outbound uplink to the ASR, negotiates the audio
//! format, streams buffered chunks up, and turns the ASR's JSON downlink
//! into subscriber broadcasts.
//!
//! Sending and receiving are driven from a single task via `tokio::select!`
//! rather than two spawned halves of a split socket - both still make
//! progress independently every loop iteration, and it avoids the
//! sink/stream reunification that splitting `WebSocketStream` would require
//! once one side needs to be cancelled without the other.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rustls::ClientConfig;
use serde_json::Value;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::Connector;

use crate::buffer::AudioBuffer;
use crate::constants::{
    ASR_HANDSHAKE_TIMEOUT_SECS, ASR_PING_INTERVAL_SECS, GRACEFUL_STOP_TIMEOUT_SECS,
    INITIAL_BACKOFF_SECS,
};
use crate::downlink::{self, ensure_ts};
use crate::format::{AudioFormat, FormatController};
use crate::signals::EventSignals;
use crate::subscribers::SubscriberRegistry;

/// Settings the ASR session needs for connection, timing and backoff.
#[derive(Clone)]
pub struct AsrConfig {
    /// WebSocket URL of the ASR uplink.
    pub asr_url: String,
    /// Idle threshold: with no chunk to send for this long, end the session.
    pub stop_timeout_secs: u64,
    /// Granularity at which the sender reconsiders its overall deadline.
    pub send_budget_secs: f64,
    /// Cap on exponential reconnect backoff.
    pub max_backoff_secs: u64,
    /// TLS client configuration used for `wss://` uplinks.
    pub tls_config: Arc<ClientConfig>,
    /// When set, caption/translation edges are logged instead of broadcast.
    pub debug: bool,
}

/// How one ASR session ended.
enum SessionOutcome {
    /// STOP was observed.
    Stopped,
    /// The source went idle, or the sender's deadline elapsed with nothing to send.
    NoAudio,
    /// The ASR closed the connection (or never answered).
    Closed,
    /// Any other failure; carries a human-readable message for the status broadcast.
    Error(String),
}

/// Runs the ASR session supervisor loop until STOP is set.
pub async fn run_asr_session(
    cfg: AsrConfig,
    buffer: Arc<AudioBuffer>,
    format: Arc<FormatController>,
    signals: Arc<EventSignals>,
    subscribers: Arc<SubscriberRegistry>,
) {
    let mut backoff = Duration::from_secs(INITIAL_BACKOFF_SECS);
    let max_backoff = Duration::from_secs(cfg.max_backoff_secs);
    let mut pending_first_chunk: Option<Bytes> = None;

    while !signals.stop.is_set() {
        let first_chunk = match pending_first_chunk.take() {
            Some(chunk) => chunk,
            None => {
                tokio::select! {
                    _ = signals.stop.wait() => break,
                    chunk = buffer.get() => match chunk {
                        Some(chunk) => chunk,
                        None => break,
                    },
                }
            }
        };

        match run_one_session(&cfg, first_chunk, &buffer, &format, &signals, &subscribers).await {
            SessionOutcome::Stopped => break,
            SessionOutcome::NoAudio => {
                backoff = Duration::from_secs(INITIAL_BACKOFF_SECS);
                buffer.drain().await;
            }
            SessionOutcome::Closed => {
                subscribers.broadcast_status("waiting", "ASR connection closed");
                backoff = Duration::from_secs(INITIAL_BACKOFF_SECS);
                buffer.drain().await;
                signals.restart_ingest.set();
                sleep(Duration::from_secs(1)).await;
            }
            SessionOutcome::Error(message) => {
                subscribers.broadcast_status("error", &message);
                sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }
    log::info!("ASR session supervisor stopped");
}

/// Takes the retained pending chunk if any, otherwise races the buffer
/// against STREAM_END, rechecking `deadline` every `send_budget`. `deadline`
/// is the caller's NO_AUDIO deadline, carried across loop iterations rather
/// than rebuilt here - receiver traffic re-entering this call must not push
/// it back out, or a session with captions but no uplink audio would never
/// time out.
async fn next_outgoing_chunk(
    pending: &mut Option<Bytes>,
    buffer: &AudioBuffer,
    signals: &EventSignals,
    deadline: tokio::time::Instant,
    send_budget: Duration,
) -> Result<Bytes, ()> {
    if let Some(chunk) = pending.take() {
        return Ok(chunk);
    }
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(());
        }
        let slice = remaining.min(send_budget);
        tokio::select! {
            chunk = buffer.get() => return chunk.ok_or(()),
            () = signals.stream_end.wait() => return Err(()),
            () = sleep(slice) => continue,
        }
    }
}

async fn run_one_session(
    cfg: &AsrConfig,
    first_chunk: Bytes,
    buffer: &AudioBuffer,
    format: &FormatController,
    signals: &EventSignals,
    subscribers: &SubscriberRegistry,
) -> SessionOutcome {
    let connector = if cfg.asr_url.starts_with("wss") {
        Some(Connector::Rustls(cfg.tls_config.clone()))
    } else {
        None
    };

    let mut ws = match tokio_tungstenite::connect_async_tls_with_config(
        &cfg.asr_url,
        None,
        false,
        connector,
    )
    .await
    {
        Ok((stream, _response)) => stream,
        Err(e) => return SessionOutcome::Error(format!("ASR connect failed: {e}")),
    };

    let handshake = tokio::time::timeout(
        Duration::from_secs(ASR_HANDSHAKE_TIMEOUT_SECS),
        ws.next(),
    )
    .await;
    let handshake_text = match handshake {
        Ok(Some(Ok(WsMessage::Text(text)))) => text,
        Ok(Some(Ok(_))) => return SessionOutcome::Error("unexpected ASR handshake frame".into()),
        Ok(Some(Err(e))) => return SessionOutcome::Error(format!("ASR handshake error: {e}")),
        Ok(None) => return SessionOutcome::Closed,
        Err(_) => return SessionOutcome::Error("ASR handshake timed out".into()),
    };
    let handshake_value: Value = match serde_json::from_str(&handshake_text) {
        Ok(v) => v,
        Err(_) => return SessionOutcome::Error("ASR handshake payload was not JSON".into()),
    };
    let use_audio_worklet = handshake_value
        .get("useAudioWorklet")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    format.set(if use_audio_worklet {
        AudioFormat::Pcm
    } else {
        AudioFormat::Webm
    });

    subscribers.broadcast_status("running", "ASR connected");

    let mut pending_chunk = Some(first_chunk);
    let mut stream_started = false;
    let mut ready_to_stop_seen = false;
    let mut last_status: Option<String> = None;
    let mut last_caption_key: Option<(String, bool)> = None;
    let mut last_translation_key: Option<(String, bool)> = None;

    let stop_timeout = Duration::from_secs(cfg.stop_timeout_secs);
    let send_budget = Duration::from_secs_f64(cfg.send_budget_secs.max(0.01));
    let mut no_audio_deadline = tokio::time::Instant::now() + stop_timeout;
    let mut ping_interval = tokio::time::interval(Duration::from_secs(ASR_PING_INTERVAL_SECS));
    ping_interval.tick().await;
    let mut last_recv_at = Instant::now();
    let mut ping_inflight = false;

    let outcome = loop {
        tokio::select! {
            () = signals.stop.wait() => break SessionOutcome::Stopped,

            chunk_result = next_outgoing_chunk(&mut pending_chunk, buffer, signals, no_audio_deadline, send_budget) => {
                match chunk_result {
                    Ok(chunk) => {
                        if let Err(e) = ws.send(WsMessage::Binary(chunk)).await {
                            break SessionOutcome::Error(format!("ASR send failed: {e}"));
                        }
                        stream_started = true;
                        no_audio_deadline = tokio::time::Instant::now() + stop_timeout;
                    }
                    Err(()) => break SessionOutcome::NoAudio,
                }
            }

            _ = ping_interval.tick() => {
                if ping_inflight && last_recv_at.elapsed() >= Duration::from_secs(ASR_PING_INTERVAL_SECS) {
                    break SessionOutcome::Closed;
                }
                if ws.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                    break SessionOutcome::Closed;
                }
                ping_inflight = true;
            }

            msg = ws.next() => {
                last_recv_at = Instant::now();
                ping_inflight = false;
                match msg {
                    None => break SessionOutcome::Closed,
                    Some(Err(e)) => break SessionOutcome::Error(format!("ASR read error: {e}")),
                    Some(Ok(WsMessage::Close(_))) => break SessionOutcome::Closed,
                    Some(Ok(WsMessage::Text(text))) => {
                        let is_ready_to_stop = handle_downlink_message(
                            &text,
                            cfg.debug,
                            subscribers,
                            &mut last_status,
                            &mut last_caption_key,
                            &mut last_translation_key,
                        );
                        if is_ready_to_stop {
                            ready_to_stop_seen = true;
                            break SessionOutcome::Closed;
                        }
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    };

    if !ready_to_stop_seen
        && (matches!(outcome, SessionOutcome::Stopped) || stream_started)
    {
        graceful_stop(&mut ws).await;
    }
    let _ = ws.close(None).await;

    outcome
}

/// Sends the empty-frame "flush" signal and waits up to the graceful-stop
/// deadline for the ASR's `ready_to_stop` acknowledgement.
async fn graceful_stop<S>(ws: &mut tokio_tungstenite::WebSocketStream<S>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    if ws.send(WsMessage::Binary(Bytes::new())).await.is_err() {
        return;
    }
    let deadline = tokio::time::Instant::now() + Duration::from_secs(GRACEFUL_STOP_TIMEOUT_SECS);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return;
        }
        match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(WsMessage::Text(text)))) => {
                if serde_json::from_str::<Value>(&text)
                    .ok()
                    .and_then(|v| v.get("type").and_then(Value::as_str).map(str::to_string))
                    .as_deref()
                    == Some("ready_to_stop")
                {
                    return;
                }
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => return,
        }
    }
}

/// Parses and dispatches one ASR downlink message. Returns `true` if it was
/// a `ready_to_stop` acknowledgement.
fn handle_downlink_message(
    raw: &str,
    debug: bool,
    subscribers: &SubscriberRegistry,
    last_status: &mut Option<String>,
    last_caption_key: &mut Option<(String, bool)>,
    last_translation_key: &mut Option<(String, bool)>,
) -> bool {
    let mut value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => {
            log::warn!("dropping non-JSON ASR message");
            return false;
        }
    };
    ensure_ts(&mut value);
    let msg_type = value.get("type").and_then(Value::as_str).unwrap_or("");

    match msg_type {
        "ready_to_stop" => {
            subscribers.broadcast(&value);
            return true;
        }
        "caption" | "status" => {
            emit_or_log(debug, subscribers, value);
        }
        _ => {
            if let Some(status) = value.get("status").and_then(Value::as_str) {
                if last_status.as_deref() != Some(status) {
                    *last_status = Some(status.to_string());
                    emit_or_log(debug, subscribers, downlink::status_message(status, status));
                }
            }

            let (line_text, line_translation) = last_non_empty_line_fields(&value);
            let buffer_transcription = value
                .get("buffer_transcription")
                .and_then(Value::as_str)
                .unwrap_or("");
            let buffer_translation = value
                .get("buffer_translation")
                .and_then(Value::as_str)
                .unwrap_or("");

            let text = join_and_trim(line_text.as_deref(), buffer_transcription);
            if !text.is_empty() {
                let partial = !buffer_transcription.is_empty();
                let key = (text.clone(), partial);
                if last_caption_key.as_ref() != Some(&key) {
                    *last_caption_key = Some(key);
                    emit_or_log(debug, subscribers, downlink::caption_message(&text, partial));
                }
            }

            let translation = join_and_trim(line_translation.as_deref(), buffer_translation);
            if !translation.is_empty() {
                let partial = !buffer_translation.is_empty();
                let key = (translation.clone(), partial);
                if last_translation_key.as_ref() != Some(&key) {
                    *last_translation_key = Some(key);
                    emit_or_log(
                        debug,
                        subscribers,
                        downlink::caption_translation_message(&translation, partial),
                    );
                }
            }
        }
    }
    false
}

/// Scans `lines` from last to first for the first non-empty `text` and the
/// first non-empty `translation` (or `text_translation`).
fn last_non_empty_line_fields(value: &Value) -> (Option<String>, Option<String>) {
    let mut line_text = None;
    let mut line_translation = None;
    if let Some(lines) = value.get("lines").and_then(Value::as_array) {
        for line in lines.iter().rev() {
            if line_text.is_none() {
                if let Some(t) = line.get("text").and_then(Value::as_str) {
                    if !t.is_empty() {
                        line_text = Some(t.to_string());
                    }
                }
            }
            if line_translation.is_none() {
                let tr = line
                    .get("translation")
                    .and_then(Value::as_str)
                    .or_else(|| line.get("text_translation").and_then(Value::as_str));
                if let Some(tr) = tr {
                    if !tr.is_empty() {
                        line_translation = Some(tr.to_string());
                    }
                }
            }
            if line_text.is_some() && line_translation.is_some() {
                break;
            }
        }
    }
    (line_text, line_translation)
}

fn join_and_trim(line: Option<&str>, buffered: &str) -> String {
    let mut combined = String::new();
    if let Some(line) = line {
        combined.push_str(line);
    }
    combined.push_str(buffered);
    combined.trim().to_string()
}

fn emit_or_log(debug: bool, subscribers: &SubscriberRegistry, message: Value) {
    if debug {
        log::info!("caption (debug, not broadcast): {message}");
    } else {
        subscribers.broadcast(&message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<SubscriberRegistry> {
        Arc::new(SubscriberRegistry::new())
    }

    #[test]
    fn ready_to_stop_is_detected_and_broadcast() {
        let subs = registry();
        let mut status = None;
        let mut caption = None;
        let mut translation = None;
        let hit = handle_downlink_message(
            r#"{"type":"ready_to_stop"}"#,
            false,
            &subs,
            &mut status,
            &mut caption,
            &mut translation,
        );
        assert!(hit);
    }

    #[test]
    fn duplicate_caption_is_suppressed() {
        let subs = registry();
        let mut status = None;
        let mut caption = None;
        let mut translation = None;
        let raw = r#"{"lines":[{"text":"hello"}]}"#;
        assert!(!handle_downlink_message(
            raw, false, &subs, &mut status, &mut caption, &mut translation
        ));
        assert_eq!(caption, Some(("hello".to_string(), false)));
        // same text again must not update the key a second time (idempotent check below
        // is implicit - calling again with identical input leaves the key unchanged).
        assert!(!handle_downlink_message(
            raw, false, &subs, &mut status, &mut caption, &mut translation
        ));
        assert_eq!(caption, Some(("hello".to_string(), false)));
    }

    #[test]
    fn non_json_message_is_dropped_without_panicking() {
        let subs = registry();
        let mut status = None;
        let mut caption = None;
        let mut translation = None;
        assert!(!handle_downlink_message(
            "not json", false, &subs, &mut status, &mut caption, &mut translation
        ));
    }

    #[test]
    fn partial_caption_uses_buffer_transcription() {
        let subs = registry();
        let mut status = None;
        let mut caption = None;
        let mut translation = None;
        handle_downlink_message(
            r#"{"buffer_transcription":"partial text"}"#,
            false,
            &subs,
            &mut status,
            &mut caption,
            &mut translation,
        );
        assert_eq!(caption, Some(("partial text".to_string(), true)));
    }

    #[tokio::test]
    async fn next_outgoing_chunk_honors_a_caller_owned_deadline() {
        // Deadline already in the past: the call must not grant itself a
        // fresh `now + stop_timeout` window internally, it must respect the
        // absolute deadline it was handed - simulating re-entry from an
        // unrelated `select!` branch (a downlink message, a ping tick).
        let buffer = AudioBuffer::new(4);
        let signals = EventSignals::new();
        let mut pending = None;
        let past_deadline = tokio::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let result = next_outgoing_chunk(
            &mut pending,
            &buffer,
            &signals,
            past_deadline,
            Duration::from_millis(50),
        )
        .await;

        assert_eq!(result, Err(()));
    }

    #[test]
    fn last_non_empty_line_scans_from_the_end() {
        let value: Value = serde_json::from_str(
            r#"{"lines":[{"text":"first"},{"text":""},{"text":"latest"}]}"#,
        )
        .unwrap();
        let (text, _) = last_non_empty_line_fields(&value);
        assert_eq!(text.as_deref(), Some("latest"));
    }
}
