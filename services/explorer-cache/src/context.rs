//! Stream context registry
//!
//! Maps a string key to the single live stream for that key. Registering a
//! key that already has a stream cancels the old one first, so a rapid
//! sequence of reloads never leaves two producers writing into one store.
//!
//! The producer side of a stream is a [`StreamSink`]: a pair of unbounded
//! channels (decoded items, mid-stream errors) plus the handle's
//! cancellation signal. Dropping the sink closes both channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use explorer_types::errors::CacheError;
use explorer_types::ids::StreamId;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A registered, cancellable stream.
///
/// Cancellation is idempotent: cancelling twice is a no-op the second time.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    id: StreamId,
    key: String,
    token: CancellationToken,
}

impl StreamHandle {
    fn new(key: &str) -> Self {
        Self {
            id: StreamId::new(),
            key: key.to_string(),
            token: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Signal the stream to stop.
    ///
    /// The manager no longer counts the entry once it is cancelled.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the stream has been cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Process-local registry of live streams, at most one per key.
#[derive(Debug, Default)]
pub struct ContextManager {
    streams: Mutex<HashMap<String, StreamHandle>>,
}

impl ContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new stream for `key`, cancelling any stream it replaces.
    pub fn register(&self, key: &str) -> StreamHandle {
        let handle = StreamHandle::new(key);
        let prior = self.streams.lock().insert(key.to_string(), handle.clone());

        match prior {
            Some(prior) => {
                prior.cancel();
                info!(
                    key,
                    superseded = %prior.id,
                    stream_id = %handle.id,
                    "Superseding in-flight stream"
                );
            }
            None => debug!(key, stream_id = %handle.id, "Registered stream"),
        }

        handle
    }

    /// Remove and cancel the stream for `key`.
    ///
    /// Returns how many live streams were cancelled and whether the key was
    /// registered at all.
    pub fn unregister(&self, key: &str) -> (usize, bool) {
        let removed = self.streams.lock().remove(key);
        match removed {
            Some(handle) => {
                let was_live = !handle.is_cancelled();
                handle.cancel();
                debug!(key, stream_id = %handle.id, was_live, "Unregistered stream");
                (usize::from(was_live), true)
            }
            None => (0, false),
        }
    }

    /// Cancel the stream for `key`, if any.
    pub fn cancel_one(&self, key: &str) {
        self.unregister(key);
    }

    /// Cancel every registered stream. Returns the number that were live.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<StreamHandle> = {
            let mut streams = self.streams.lock();
            streams.drain().map(|(_, handle)| handle).collect()
        };

        let mut cancelled = 0;
        for handle in drained {
            if !handle.is_cancelled() {
                cancelled += 1;
            }
            handle.cancel();
        }

        if cancelled > 0 {
            info!(cancelled, "Cancelled all streams");
        }
        cancelled
    }

    /// Release the entry for `key` only if it still belongs to stream `id`.
    ///
    /// A finishing fetch calls this; a successor that already re-registered
    /// the key is left untouched.
    pub fn release(&self, key: &str, id: StreamId) -> bool {
        let removed = {
            let mut streams = self.streams.lock();
            match streams.get(key) {
                Some(handle) if handle.id == id => streams.remove(key),
                _ => None,
            }
        };

        match removed {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether `key` currently has a live stream.
    pub fn is_active(&self, key: &str) -> bool {
        self.streams
            .lock()
            .get(key)
            .map_or(false, |handle| !handle.is_cancelled())
    }

    /// Number of live streams. Entries cancelled through their handle are
    /// dropped here.
    pub fn len(&self) -> usize {
        let mut streams = self.streams.lock();
        streams.retain(|_, handle| !handle.is_cancelled());
        streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Producer end of a stream.
///
/// Items and errors are delivered to the draining store in send order.
#[derive(Debug)]
pub struct StreamSink<R> {
    items: mpsc::UnboundedSender<R>,
    errors: mpsc::UnboundedSender<String>,
    token: CancellationToken,
    expected_total: Arc<AtomicUsize>,
}

impl<R> StreamSink<R> {
    /// Deliver one raw item.
    ///
    /// Fails with [`CacheError::Cancelled`] once the stream is cancelled or
    /// the store has stopped draining; producers should stop on error.
    pub fn send_item(&self, raw: R) -> Result<(), CacheError> {
        if self.token.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        self.items.send(raw).map_err(|_| CacheError::Cancelled)
    }

    /// Report a mid-stream failure. The store stops draining on receipt.
    pub fn send_error(&self, message: impl Into<String>) -> Result<(), CacheError> {
        self.errors
            .send(message.into())
            .map_err(|_| CacheError::Cancelled)
    }

    /// Tell the store how many items the producer expects to deliver.
    pub fn set_expected_total(&self, total: usize) {
        self.expected_total.store(total, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Consumer end of a stream, drained by the store.
#[derive(Debug)]
pub(crate) struct StreamReceivers<R> {
    pub items: mpsc::UnboundedReceiver<R>,
    pub errors: mpsc::UnboundedReceiver<String>,
}

/// Create the channel pair for a registered stream.
pub(crate) fn stream_channel<R>(
    handle: &StreamHandle,
    expected_total: Arc<AtomicUsize>,
) -> (StreamSink<R>, StreamReceivers<R>) {
    let (items_tx, items_rx) = mpsc::unbounded_channel();
    let (errors_tx, errors_rx) = mpsc::unbounded_channel();
    let sink = StreamSink {
        items: items_tx,
        errors: errors_tx,
        token: handle.token.clone(),
        expected_total,
    };
    let receivers = StreamReceivers {
        items: items_rx,
        errors: errors_rx,
    };
    (sink, receivers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_supersedes_prior_stream() {
        let contexts = ContextManager::new();
        let first = contexts.register("transactions");
        let second = contexts.register("transactions");

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_ne!(first.id(), second.id());
        assert_eq!(contexts.len(), 1);
        assert!(contexts.is_active("transactions"));
    }

    #[test]
    fn test_unregister_reports_found_and_count() {
        let contexts = ContextManager::new();
        let handle = contexts.register("logs");

        assert_eq!(contexts.unregister("logs"), (1, true));
        assert!(handle.is_cancelled());
        assert_eq!(contexts.unregister("logs"), (0, false));
    }

    #[test]
    fn test_handle_cancel_releases_entry() {
        let contexts = ContextManager::new();
        let handle = contexts.register("balances");
        contexts.register("logs");
        assert_eq!(contexts.len(), 2);

        handle.cancel();
        assert_eq!(contexts.len(), 1);
        assert!(!contexts.is_active("balances"));
        assert_eq!(contexts.cancel_all(), 1);
        assert!(contexts.is_empty());
    }

    #[test]
    fn test_unregister_already_cancelled_handle() {
        let contexts = ContextManager::new();
        let handle = contexts.register("logs");
        handle.cancel();

        assert_eq!(contexts.unregister("logs"), (0, true));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let contexts = ContextManager::new();
        let handle = contexts.register("abis");
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());

        contexts.cancel_one("abis");
        contexts.cancel_one("abis");
        assert!(contexts.is_empty());
    }

    #[test]
    fn test_cancel_all() {
        let contexts = ContextManager::new();
        let a = contexts.register("a");
        let b = contexts.register("b");
        let c = contexts.register("c");
        c.cancel();

        assert_eq!(contexts.cancel_all(), 2);
        assert!(a.is_cancelled() && b.is_cancelled());
        assert!(contexts.is_empty());
        assert_eq!(contexts.cancel_all(), 0);
    }

    #[test]
    fn test_release_ignores_successor() {
        let contexts = ContextManager::new();
        let old = contexts.register("monitors");
        let new = contexts.register("monitors");

        assert!(!contexts.release("monitors", old.id()));
        assert!(contexts.is_active("monitors"));

        assert!(contexts.release("monitors", new.id()));
        assert!(contexts.is_empty());
        assert!(new.is_cancelled());
    }

    #[tokio::test]
    async fn test_sink_delivers_in_order_and_closes_on_drop() {
        let contexts = ContextManager::new();
        let handle = contexts.register("names");
        let expected = Arc::new(AtomicUsize::new(0));
        let (sink, mut rx) = stream_channel::<u32>(&handle, expected.clone());

        sink.set_expected_total(3);
        for i in 1..=3 {
            sink.send_item(i).unwrap();
        }
        drop(sink);

        let mut got = Vec::new();
        while let Some(i) = rx.items.recv().await {
            got.push(i);
        }
        assert_eq!(got, vec![1, 2, 3]);
        assert_eq!(expected.load(Ordering::Relaxed), 3);
        assert!(rx.errors.recv().await.is_none());
    }

    #[test]
    fn test_sink_rejects_after_cancel() {
        let contexts = ContextManager::new();
        let handle = contexts.register("names");
        let (sink, _rx) = stream_channel::<u32>(&handle, Arc::new(AtomicUsize::new(0)));

        handle.cancel();
        assert!(sink.is_cancelled());
        assert_eq!(sink.send_item(1), Err(CacheError::Cancelled));
    }
}
