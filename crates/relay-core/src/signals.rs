//! Level-triggered event signals shared across the relay's long-lived tasks.
//!
//! Unlike a one-shot notification, a signal's "set" state persists until
//! explicitly cleared, so a task that checks after the fact still observes it.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// A level-triggered, idempotent, many-waiter signal.
pub struct Signal {
    flag: AtomicBool,
    notify: Notify,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    /// Creates an unset signal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Sets the signal. Idempotent: setting an already-set signal is a no-op.
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Clears the signal.
    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Returns whether the signal is currently set, without blocking.
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Waits until the signal is set. Returns immediately if already set.
    pub async fn wait(&self) {
        loop {
            if self.is_set() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// The three level-triggered signals the ingest and ASR loops coordinate through.
#[derive(Default)]
pub struct EventSignals {
    /// Set once at shutdown; observed by every suspension point in both loops.
    pub stop: Signal,
    /// Set by ingest when the source has been idle past the configured threshold.
    pub stream_end: Signal,
    /// Set by the ASR session after an uplink failure so ingest resets the transcoder.
    pub restart_ingest: Signal,
}

impl EventSignals {
    /// Creates a fresh, all-unset signal set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_immediately_if_already_set() {
        let signal = Signal::new();
        signal.set();
        tokio::time::timeout(Duration::from_millis(20), signal.wait())
            .await
            .expect("wait should not block once set");
    }

    #[tokio::test]
    async fn wait_wakes_on_set() {
        let signal = Arc::new(Signal::new());
        let waiter = signal.clone();
        let handle = tokio::spawn(async move {
            waiter.wait().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        signal.set();
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("task should complete")
            .unwrap();
    }

    #[test]
    fn set_is_idempotent() {
        let signal = Signal::new();
        signal.set();
        signal.set();
        assert!(signal.is_set());
        signal.clear();
        assert!(!signal.is_set());
    }
}
