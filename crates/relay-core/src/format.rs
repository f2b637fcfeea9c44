//! Latched audio format token shared between the ASR session and ingest.
//!
//! The ASR session is the sole writer: it learns the expected upload format
//! from the ASR's handshake message and latches it here. Ingest observes the
//! token to decide which transcoder invocation to run and to notice changes
//! that require a respawn.

use tokio::sync::watch;

/// Audio format the transcoder must produce for the ASR uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    /// Raw 16-bit little-endian mono PCM.
    Pcm,
    /// Opus-in-WebM, mono, 48 kHz.
    Webm,
}

/// Single-slot latch with change notification, written only by the ASR session.
pub struct FormatController {
    tx: watch::Sender<AudioFormat>,
}

impl FormatController {
    /// Creates the controller latched to `initial`.
    #[must_use]
    pub fn new(initial: AudioFormat) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Returns the current latched value.
    #[must_use]
    pub fn current(&self) -> AudioFormat {
        *self.tx.borrow()
    }

    /// Replaces the latched value. A no-op (no wakeups) if unchanged.
    pub fn set(&self, format: AudioFormat) {
        self.tx.send_if_modified(|current| {
            if *current == format {
                false
            } else {
                *current = format;
                true
            }
        });
    }

    /// Subscribes to change notifications; each caller should keep its own receiver.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AudioFormat> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_latched_at_construction() {
        let ctrl = FormatController::new(AudioFormat::Webm);
        assert_eq!(ctrl.current(), AudioFormat::Webm);
    }

    #[tokio::test]
    async fn set_wakes_subscriber_only_on_change() {
        let ctrl = FormatController::new(AudioFormat::Webm);
        let mut rx = ctrl.subscribe();

        ctrl.set(AudioFormat::Webm);
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), rx.changed())
                .await
                .is_err(),
            "setting the same value must not wake subscribers"
        );

        ctrl.set(AudioFormat::Pcm);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), AudioFormat::Pcm);
    }
}
