//! Bounded single-producer/single-consumer audio chunk buffer.
//!
//! Ingest is the sole producer, the ASR session is the sole consumer. On
//! overflow the newest chunk is dropped rather than the oldest, matching a
//! live feed where stale audio is worthless but a stall must not grow memory
//! without bound.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};

use crate::constants::BUFFER_DROP_LOG_INTERVAL;

/// Bounded FIFO of opaque audio chunks between ingest and the ASR session.
pub struct AudioBuffer {
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
    dropped: AtomicU64,
}

impl AudioBuffer {
    /// Creates a buffer with the given capacity (in chunks, not bytes).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueues a chunk without blocking. Drops the chunk if the buffer is full.
    pub fn put(&self, chunk: Bytes) {
        match self.tx.try_send(chunk) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let count = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if count % BUFFER_DROP_LOG_INTERVAL == 0 {
                    log::warn!("audio buffer full, dropped {} chunk(s) so far", count);
                }
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("audio buffer put() after consumer dropped");
            }
        }
    }

    /// Waits for and removes the next chunk. Returns `None` if the producer side closed.
    pub async fn get(&self) -> Option<Bytes> {
        self.rx.lock().await.recv().await
    }

    /// Removes all currently buffered chunks without blocking.
    pub async fn drain(&self) {
        let mut rx = self.rx.lock().await;
        while rx.try_recv().is_ok() {}
    }

    /// Total number of chunks dropped due to overflow since creation.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_preserved() {
        let buf = AudioBuffer::new(4);
        buf.put(Bytes::from_static(b"a"));
        buf.put(Bytes::from_static(b"b"));
        assert_eq!(buf.get().await, Some(Bytes::from_static(b"a")));
        assert_eq!(buf.get().await, Some(Bytes::from_static(b"b")));
    }

    #[tokio::test]
    async fn overflow_drops_newest_and_counts() {
        let buf = AudioBuffer::new(1);
        buf.put(Bytes::from_static(b"keep"));
        buf.put(Bytes::from_static(b"dropped"));
        assert_eq!(buf.dropped_count(), 1);
        assert_eq!(buf.get().await, Some(Bytes::from_static(b"keep")));
    }

    #[tokio::test]
    async fn drain_empties_without_blocking() {
        let buf = AudioBuffer::new(4);
        buf.put(Bytes::from_static(b"a"));
        buf.put(Bytes::from_static(b"b"));
        buf.drain().await;

        let buf = std::sync::Arc::new(buf);
        let waiter = buf.clone();
        let handle = tokio::spawn(async move { waiter.get().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        handle.abort();
    }
}
