//! Store: the single source of truth for one record type
//!
//! A store owns the cached items, an optional key index into them, and the
//! fetch lifecycle (see [`LoadState`]). Items arrive from a producer through
//! a registered stream and are pushed, in arrival order, to every
//! registered [`Observer`].
//!
//! Observers are called after the item has been appended and with no store
//! lock held, so they may read the store again. A notification therefore
//! means "at least this item has landed", not "this is the only new item".
//!
//! Fetch failure policy:
//! - stream error or producer error with zero items collected: `Stale`,
//!   error returned;
//! - the same with at least one item collected: `Loaded` (partial), error
//!   still returned to the caller;
//! - cancellation or supersession: `Loaded`, no error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use explorer_types::errors::CacheError;
use explorer_types::ids::StreamId;
use explorer_types::period::Period;
use explorer_types::record::SummaryRecord;
use explorer_types::state::LoadState;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use crate::context::{stream_channel, ContextManager, StreamSink};
use crate::summary::SummaryManager;

/// Error a producer may return from its query.
pub type ProducerError = Box<dyn std::error::Error + Send + Sync>;

/// Streams raw records into the sink; dropping the sink ends the stream.
pub type QueryFn<R> = Arc<dyn Fn(StreamSink<R>) -> Result<(), ProducerError> + Send + Sync>;
/// Turns a raw record into a cached item, or `None` to skip it.
pub type DecodeFn<R, T> = Arc<dyn Fn(R) -> Option<T> + Send + Sync>;
/// Secondary index key for an item, or `None` to leave it unindexed.
pub type IndexKeyFn<T> = Arc<dyn Fn(&T) -> Option<String> + Send + Sync>;
/// Ordering applied to [`Store::get_map_items`].
pub type MapOrderFn<T> = Arc<dyn Fn(&T, &T) -> std::cmp::Ordering + Send + Sync>;

/// Receives store mutations. Implemented by facets.
pub trait Observer<T>: Send + Sync {
    fn on_new_item(&self, item: &Arc<T>, index: usize);
    fn on_state_changed(&self, state: LoadState, reason: &str);
}

struct StoreData<T> {
    items: Vec<Arc<T>>,
    index: HashMap<String, Arc<T>>,
    state: LoadState,
    reason: String,
    /// Stream currently allowed to write into `items`.
    stream: Option<StreamId>,
}

impl<T> StoreData<T> {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
            state: LoadState::Stale,
            reason: String::new(),
            stream: None,
        }
    }

    fn clear(&mut self) {
        self.items.clear();
        self.index.clear();
    }
}

enum Ingest {
    Appended,
    Skipped,
    Superseded,
}

/// Handle on an in-flight fetch, shared by every caller that joined it.
#[derive(Clone)]
pub struct FetchTicket {
    outcome: Shared<BoxFuture<'static, Result<usize, CacheError>>>,
    done: Arc<AtomicBool>,
}

impl FetchTicket {
    fn new(
        store: &str,
        task: JoinHandle<Result<usize, CacheError>>,
        done: Arc<AtomicBool>,
    ) -> Self {
        let store = store.to_string();
        let outcome = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(CacheError::producer(store, e.to_string())),
            }
        }
        .boxed()
        .shared();
        Self { outcome, done }
    }

    pub fn is_finished(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Wait for the fetch. Returns the number of items collected.
    pub async fn wait(self) -> Result<usize, CacheError> {
        self.outcome.await
    }
}

impl std::fmt::Debug for FetchTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchTicket")
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Generic cache of items of one record type.
///
/// `R` is the raw record type the producer streams; it defaults to `T` for
/// producers that already deliver finished items.
pub struct Store<T, R = T> {
    name: String,
    contexts: Arc<ContextManager>,
    query: QueryFn<R>,
    decode: DecodeFn<R, T>,
    index_key: Option<IndexKeyFn<T>>,
    map_order: Option<MapOrderFn<T>>,
    data: RwLock<StoreData<T>>,
    /// Counter of the current stream; each fetch installs its own.
    expected_total: RwLock<Arc<AtomicUsize>>,
    observers: RwLock<Vec<Weak<dyn Observer<T>>>>,
    summary: SummaryManager<T>,
    in_flight: Mutex<Option<FetchTicket>>,
}

impl<T, R> Store<T, R> {
    /// Create a store streaming under context key `name`.
    pub fn new<Q, D>(
        name: impl Into<String>,
        contexts: Arc<ContextManager>,
        query: Q,
        decode: D,
    ) -> Self
    where
        Q: Fn(StreamSink<R>) -> Result<(), ProducerError> + Send + Sync + 'static,
        D: Fn(R) -> Option<T> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            contexts,
            query: Arc::new(query),
            decode: Arc::new(decode),
            index_key: None,
            map_order: None,
            data: RwLock::new(StoreData::new()),
            expected_total: RwLock::new(Arc::new(AtomicUsize::new(0))),
            observers: RwLock::new(Vec::new()),
            summary: SummaryManager::new(),
            in_flight: Mutex::new(None),
        }
    }

    /// Index items under the key `index_key` returns.
    pub fn with_index_key<F>(mut self, index_key: F) -> Self
    where
        F: Fn(&T) -> Option<String> + Send + Sync + 'static,
    {
        self.index_key = Some(Arc::new(index_key));
        self
    }

    /// Return [`Store::get_map_items`] sorted by `cmp`.
    pub fn with_map_order<F>(mut self, cmp: F) -> Self
    where
        F: Fn(&T, &T) -> std::cmp::Ordering + Send + Sync + 'static,
    {
        self.map_order = Some(Arc::new(cmp));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LoadState {
        self.data.read().state
    }

    pub fn state_reason(&self) -> String {
        self.data.read().reason.clone()
    }

    pub fn count(&self) -> usize {
        self.data.read().items.len()
    }

    /// Total the producer announced for the current fetch, 0 if unknown.
    pub fn expected_total(&self) -> usize {
        self.expected_total.read().load(Ordering::Relaxed)
    }

    pub fn get_item(&self, index: usize) -> Option<Arc<T>> {
        self.data.read().items.get(index).cloned()
    }

    pub fn get_item_by_key(&self, key: &str) -> Option<Arc<T>> {
        self.data.read().index.get(key).cloned()
    }

    /// Copy of the item sequence in arrival order.
    pub fn get_items(&self) -> Vec<Arc<T>> {
        self.data.read().items.clone()
    }

    /// Copy of the indexed items; ordered only if a map order is installed.
    pub fn get_map_items(&self) -> Vec<Arc<T>> {
        let mut items: Vec<Arc<T>> = self.data.read().index.values().cloned().collect();
        if let Some(cmp) = &self.map_order {
            items.sort_by(|a, b| cmp(a, b));
        }
        items
    }

    pub fn summaries(&self) -> &SummaryManager<T> {
        &self.summary
    }

    pub fn register_observer(&self, observer: Weak<dyn Observer<T>>) {
        self.observers.write().push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Insert an item directly, bypassing the producer.
    pub fn add_item(&self, item: T) -> Arc<T> {
        let key = self.index_key.as_ref().and_then(|f| f(&item));
        let item = Arc::new(item);
        let index = {
            let mut data = self.data.write();
            data.items.push(Arc::clone(&item));
            if let Some(key) = key {
                data.index.insert(key, Arc::clone(&item));
            }
            data.items.len() - 1
        };
        self.notify_item(&item, index);
        item
    }

    /// Swap the first item matching `matches` for `replacement`.
    ///
    /// Loaded views are resynchronized; returns false if nothing matched.
    pub fn replace_item<F>(&self, matches: F, replacement: T) -> bool
    where
        F: Fn(&T) -> bool,
    {
        let key = self.index_key.as_ref().and_then(|f| f(&replacement));
        let item = Arc::new(replacement);
        let state = {
            let mut data = self.data.write();
            let Some(pos) = data.items.iter().position(|i| matches(i)) else {
                return false;
            };
            let old = std::mem::replace(&mut data.items[pos], Arc::clone(&item));
            data.index.retain(|_, indexed| !Arc::ptr_eq(indexed, &old));
            if let Some(key) = key {
                data.index.insert(key, Arc::clone(&item));
            }
            data.state
        };

        debug!(store = %self.name, "Replaced item");
        if state == LoadState::Loaded {
            self.notify_state(LoadState::Loaded, "replaced");
        }
        true
    }

    /// Force a state transition and notify observers.
    pub fn set_state(&self, state: LoadState, reason: &str) {
        {
            let mut data = self.data.write();
            data.state = state;
            data.reason = reason.to_string();
        }
        self.notify_state(state, reason);
    }

    /// Cancel any stream and drop all cached data. Always ends `Stale`.
    pub fn reset(&self) {
        let (cancelled, _) = self.contexts.unregister(&self.name);
        {
            let mut data = self.data.write();
            data.clear();
            data.stream = None;
            data.state = LoadState::Stale;
            data.reason = "reset".to_string();
        }
        *self.expected_total.write() = Arc::new(AtomicUsize::new(0));
        self.summary.reset();
        *self.in_flight.lock() = None;

        info!(store = %self.name, cancelled, "Store reset");
        self.notify_state(LoadState::Stale, "reset");
    }

    fn live_observers(&self) -> Vec<Arc<dyn Observer<T>>> {
        let mut dead = false;
        let live: Vec<Arc<dyn Observer<T>>> = self
            .observers
            .read()
            .iter()
            .filter_map(|weak| {
                let strong = weak.upgrade();
                dead |= strong.is_none();
                strong
            })
            .collect();
        if dead {
            self.observers.write().retain(|weak| weak.strong_count() > 0);
        }
        live
    }

    fn notify_item(&self, item: &Arc<T>, index: usize) {
        for observer in self.live_observers() {
            observer.on_new_item(item, index);
        }
    }

    fn notify_state(&self, state: LoadState, reason: &str) {
        for observer in self.live_observers() {
            observer.on_state_changed(state, reason);
        }
    }

    fn ingest(&self, raw: R, stream: StreamId) -> Ingest {
        let Some(item) = (self.decode)(raw) else {
            return Ingest::Skipped;
        };
        let key = self.index_key.as_ref().and_then(|f| f(&item));
        let item = Arc::new(item);

        let index = {
            let mut data = self.data.write();
            if data.stream != Some(stream) {
                return Ingest::Superseded;
            }
            data.items.push(Arc::clone(&item));
            if let Some(key) = key {
                data.index.insert(key, Arc::clone(&item));
            }
            data.items.len() - 1
        };

        // A successor may have taken over between the append and here.
        if self.data.read().stream != Some(stream) {
            return Ingest::Superseded;
        }
        self.notify_item(&item, index);
        Ingest::Appended
    }

    /// Apply the closing transition if `stream` still owns the store.
    fn finish(&self, stream: StreamId, state: LoadState, reason: String) {
        let applied = {
            let mut data = self.data.write();
            if data.stream == Some(stream) {
                data.stream = None;
                data.state = state;
                data.reason = reason.clone();
                true
            } else {
                false
            }
        };

        if applied {
            self.notify_state(state, &reason);
        } else {
            debug!(
                store = %self.name,
                stream_id = %stream,
                "Stream no longer owns store, state untouched"
            );
        }
    }

    fn producer_failure(
        &self,
        joined: Result<Result<(), ProducerError>, JoinError>,
    ) -> Option<CacheError> {
        match joined {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(CacheError::producer(&self.name, e.to_string())),
            Err(e) => Some(CacheError::producer(
                &self.name,
                format!("producer task failed: {}", e),
            )),
        }
    }
}

impl<T, R> Store<T, R>
where
    T: Send + Sync + 'static,
    R: Send + 'static,
{
    /// Stream a fresh copy of the data into the store.
    ///
    /// Supersedes any stream registered under this store's key, clears the
    /// cache, and drains the new stream until it ends. Returns the number of
    /// items collected. Blocks (asynchronously) for the whole fetch; use
    /// [`Store::spawn_fetch`] to run it in the background.
    pub async fn fetch(&self) -> Result<usize, CacheError> {
        let handle = self.contexts.register(&self.name);
        let stream = handle.id();
        let expected_total = Arc::new(AtomicUsize::new(0));
        {
            let mut data = self.data.write();
            data.clear();
            data.stream = Some(stream);
            data.state = LoadState::Fetching;
            data.reason = "fetching".to_string();
            *self.expected_total.write() = Arc::clone(&expected_total);
        }
        self.summary.reset();
        info!(store = %self.name, stream_id = %stream, "Fetch started");
        self.notify_state(LoadState::Fetching, "fetching");

        let (sink, mut rx) = stream_channel(&handle, expected_total);
        let query = Arc::clone(&self.query);
        let mut producer = tokio::task::spawn_blocking(move || query(sink));

        let mut items_open = true;
        let mut errors_open = true;
        let mut producer_done = false;
        let mut cancelled = false;
        let mut failure: Option<CacheError> = None;
        let mut collected = 0usize;

        while items_open || errors_open {
            tokio::select! {
                biased;

                _ = handle.cancelled() => {
                    cancelled = true;
                    break;
                }
                raw = rx.items.recv(), if items_open => match raw {
                    Some(raw) => match self.ingest(raw, stream) {
                        Ingest::Appended => collected += 1,
                        Ingest::Skipped => {}
                        Ingest::Superseded => {
                            cancelled = true;
                            break;
                        }
                    },
                    None => items_open = false,
                },
                message = rx.errors.recv(), if errors_open => match message {
                    Some(message) => {
                        failure = Some(CacheError::stream(&self.name, message));
                        break;
                    }
                    None => errors_open = false,
                },
                joined = &mut producer, if !producer_done => {
                    producer_done = true;
                    if let Some(err) = self.producer_failure(joined) {
                        failure = Some(err);
                        break;
                    }
                }
            }
        }

        // Both channels closed: the producer is returning, collect its result.
        if !cancelled && failure.is_none() && !producer_done {
            failure = self.producer_failure(producer.await);
        }

        self.contexts.release(&self.name, stream);

        match failure {
            Some(err) => {
                if collected > 0 {
                    warn!(
                        store = %self.name,
                        collected,
                        error = %err,
                        "Fetch failed after partial delivery, keeping items"
                    );
                    self.finish(stream, LoadState::Loaded, format!("partial: {}", err));
                } else {
                    warn!(store = %self.name, error = %err, "Fetch failed with no items");
                    self.finish(stream, LoadState::Stale, err.to_string());
                }
                Err(err)
            }
            None => {
                let reason = if cancelled { "cancelled" } else { "loaded" };
                info!(store = %self.name, collected, reason, "Fetch finished");
                self.finish(stream, LoadState::Loaded, reason.to_string());
                Ok(collected)
            }
        }
    }

    /// Run [`Store::fetch`] in the background, at most one flight at a time.
    ///
    /// Returns the ticket of the flight and whether this call started it.
    /// Callers arriving while a flight is running join it instead.
    pub fn spawn_fetch(self: &Arc<Self>) -> Result<(FetchTicket, bool), CacheError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| CacheError::NoRuntime)?;

        let mut in_flight = self.in_flight.lock();
        if let Some(ticket) = in_flight.as_ref() {
            if !ticket.is_finished() {
                debug!(store = %self.name, "Joining in-flight fetch");
                return Ok((ticket.clone(), false));
            }
        }

        let store = Arc::clone(self);
        let done = Arc::new(AtomicBool::new(false));
        let task_done = Arc::clone(&done);
        let task = runtime.spawn(async move {
            let result = store.fetch().await;
            task_done.store(true, Ordering::Release);
            result
        });

        let ticket = FetchTicket::new(&self.name, task, done);
        *in_flight = Some(ticket.clone());
        Ok((ticket, true))
    }
}

impl<T: Send + Sync + 'static> Store<T, T> {
    /// A store whose producer already delivers finished items.
    pub fn passthrough<Q>(name: impl Into<String>, contexts: Arc<ContextManager>, query: Q) -> Self
    where
        Q: Fn(StreamSink<T>) -> Result<(), ProducerError> + Send + Sync + 'static,
    {
        Store::new(name, contexts, query, Some)
    }
}

impl<T: SummaryRecord, R> Store<T, R> {
    /// Insert a balance snapshot: cached like any item, and recorded as the
    /// latest value for its period and asset.
    pub fn add_balance(&self, item: T, period: Period) -> Arc<T> {
        let item = self.add_item(item);
        self.summary.add_balance(Arc::clone(&item), period);
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Row {
        id: u64,
        value: u64,
    }

    #[derive(Default)]
    struct Recorder {
        items: Mutex<Vec<(u64, usize)>>,
        states: Mutex<Vec<LoadState>>,
    }

    impl Observer<Row> for Recorder {
        fn on_new_item(&self, item: &Arc<Row>, index: usize) {
            self.items.lock().push((item.id, index));
        }

        fn on_state_changed(&self, state: LoadState, _reason: &str) {
            self.states.lock().push(state);
        }
    }

    fn rows(n: u64) -> Vec<Row> {
        (1..=n).map(|id| Row { id, value: id * 10 }).collect()
    }

    fn streaming_store(rows: Vec<Row>) -> Store<Row> {
        Store::passthrough("rows", Arc::new(ContextManager::new()), move |sink| {
            sink.set_expected_total(rows.len());
            for row in rows.iter().cloned() {
                sink.send_item(row)?;
            }
            Ok(())
        })
    }

    fn observe(store: &Store<Row>) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn Observer<Row>> = Arc::downgrade(&recorder) as Weak<dyn Observer<Row>>;
        store.register_observer(weak);
        recorder
    }

    #[tokio::test]
    async fn test_fetch_loads_in_order() {
        let store = streaming_store(rows(5));
        let recorder = observe(&store);

        assert_eq!(store.fetch().await, Ok(5));
        assert_eq!(store.state(), LoadState::Loaded);
        assert_eq!(store.count(), 5);
        assert_eq!(store.expected_total(), 5);
        assert_eq!(
            *recorder.items.lock(),
            vec![(1, 0), (2, 1), (3, 2), (4, 3), (5, 4)]
        );
        assert_eq!(
            *recorder.states.lock(),
            vec![LoadState::Fetching, LoadState::Loaded]
        );
    }

    #[tokio::test]
    async fn test_decode_skips_and_index() {
        let contexts = Arc::new(ContextManager::new());
        let store: Store<Row, u64> = Store::new(
            "decoded",
            contexts,
            |sink: StreamSink<u64>| {
                for raw in 0..6u64 {
                    sink.send_item(raw)?;
                }
                Ok(())
            },
            |raw: u64| (raw % 2 == 0).then(|| Row { id: raw, value: raw }),
        )
        .with_index_key(|row: &Row| Some(format!("row-{}", row.id)))
        .with_map_order(|a: &Row, b: &Row| b.id.cmp(&a.id));

        assert_eq!(store.fetch().await, Ok(3));
        assert_eq!(store.count(), 3);
        assert_eq!(store.get_item_by_key("row-4").map(|r| r.id), Some(4));
        assert!(store.get_item_by_key("row-1").is_none());

        let ids: Vec<u64> = store.get_map_items().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![4, 2, 0]);
    }

    #[tokio::test]
    async fn test_stream_error_after_items_is_partial_success() {
        let store = Store::passthrough("partial", Arc::new(ContextManager::new()), |sink| {
            for row in rows(3) {
                sink.send_item(row)?;
            }
            sink.send_error("node dropped connection")?;
            Ok(())
        });

        let result = store.fetch().await;
        assert!(matches!(result, Err(CacheError::Stream { .. })));
        assert_eq!(store.state(), LoadState::Loaded);
        assert_eq!(store.count(), 3);
        assert!(store.state_reason().starts_with("partial"));
    }

    #[tokio::test]
    async fn test_error_with_no_items_goes_stale() {
        let contexts = Arc::new(ContextManager::new());
        let store: Store<Row> = Store::passthrough("empty", contexts, |sink| {
            sink.send_error("bad address")?;
            Ok(())
        });

        assert!(store.fetch().await.is_err());
        assert_eq!(store.state(), LoadState::Stale);
        assert_eq!(store.count(), 0);
    }

    #[tokio::test]
    async fn test_synchronous_producer_error() {
        let contexts = Arc::new(ContextManager::new());
        let store: Store<Row> = Store::passthrough("sync", contexts, |_sink| {
            Err("chain not configured".into())
        });

        let err = store.fetch().await.unwrap_err();
        assert_eq!(err, CacheError::producer("sync", "chain not configured"));
        assert_eq!(store.state(), LoadState::Stale);
    }

    #[tokio::test]
    async fn test_producer_error_after_items_keeps_items() {
        let store = Store::passthrough("sync-partial", Arc::new(ContextManager::new()), |sink| {
            for row in rows(2) {
                sink.send_item(row)?;
            }
            Err("index truncated".into())
        });

        assert!(matches!(store.fetch().await, Err(CacheError::Producer { .. })));
        assert_eq!(store.state(), LoadState::Loaded);
        assert_eq!(store.count(), 2);
    }

    #[tokio::test]
    async fn test_cancel_is_not_an_error() {
        let contexts = Arc::new(ContextManager::new());
        let store = Arc::new(Store::passthrough("slow", Arc::clone(&contexts), |sink| {
            for row in rows(1_000) {
                if sink.send_item(row).is_err() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(2));
            }
            Ok(())
        }));

        let fetching = Arc::clone(&store);
        let task = tokio::spawn(async move { fetching.fetch().await });
        while store.count() < 3 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        contexts.cancel_one("slow");

        let collected = task.await.unwrap().unwrap();
        assert!(collected >= 3);
        assert_eq!(store.state(), LoadState::Loaded);
        assert_eq!(store.state_reason(), "cancelled");
    }

    #[tokio::test]
    async fn test_reset_always_stale() {
        let store = streaming_store(rows(4));
        let recorder = observe(&store);
        store.fetch().await.unwrap();

        store.reset();
        assert_eq!(store.state(), LoadState::Stale);
        assert_eq!(store.count(), 0);
        assert_eq!(store.expected_total(), 0);
        assert_eq!(recorder.states.lock().last(), Some(&LoadState::Stale));

        // Reset from Stale stays Stale.
        store.reset();
        assert_eq!(store.state(), LoadState::Stale);
    }

    #[tokio::test]
    async fn test_reset_during_fetch_stays_stale() {
        let contexts = Arc::new(ContextManager::new());
        let store = Arc::new(Store::passthrough("reset-mid", contexts, |sink| {
            for row in rows(500) {
                if sink.send_item(row).is_err() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        }));

        let fetching = Arc::clone(&store);
        let task = tokio::spawn(async move { fetching.fetch().await });
        while store.count() < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        store.reset();
        let _ = task.await.unwrap();

        assert_eq!(store.state(), LoadState::Stale);
        assert_eq!(store.count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_superseded_stream_cannot_touch_successor() {
        let generation = Arc::new(AtomicUsize::new(0));
        let stale_done = Arc::new(AtomicBool::new(false));
        let (resume, resumed) = std::sync::mpsc::channel::<()>();
        let resumed = Mutex::new(resumed);

        let seen = Arc::clone(&generation);
        let finished = Arc::clone(&stale_done);
        let store = Arc::new(Store::passthrough(
            "handover",
            Arc::new(ContextManager::new()),
            move |sink| {
                if seen.fetch_add(1, Ordering::SeqCst) > 0 {
                    sink.set_expected_total(2);
                    for row in rows(2) {
                        sink.send_item(row)?;
                    }
                    return Ok(());
                }
                sink.send_item(Row { id: 100, value: 0 })?;
                let _ = resumed.lock().recv();
                sink.set_expected_total(999);
                let late = sink.send_item(Row { id: 101, value: 0 });
                finished.store(true, Ordering::SeqCst);
                late?;
                Ok(())
            },
        ));
        let recorder = observe(&store);

        let fetching = Arc::clone(&store);
        let first = tokio::spawn(async move { fetching.fetch().await });
        while store.count() < 1 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert_eq!(store.fetch().await, Ok(2));
        assert!(first.await.unwrap().is_ok());
        resume.send(()).unwrap();
        while !stale_done.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert_eq!(store.expected_total(), 2);
        assert_eq!(store.count(), 2);
        assert!(recorder.items.lock().iter().all(|(id, _)| *id != 101));
    }

    #[tokio::test]
    async fn test_spawn_fetch_single_flight() {
        let store = Arc::new(Store::passthrough("flight", Arc::new(ContextManager::new()), |sink| {
            std::thread::sleep(Duration::from_millis(50));
            for row in rows(3) {
                sink.send_item(row)?;
            }
            Ok(())
        }));

        let (first, started_first) = store.spawn_fetch().unwrap();
        let (second, started_second) = store.spawn_fetch().unwrap();
        assert!(started_first);
        assert!(!started_second);

        assert_eq!(first.wait().await, Ok(3));
        assert_eq!(second.wait().await, Ok(3));

        // A finished flight does not block the next one.
        let (_third, started_third) = store.spawn_fetch().unwrap();
        assert!(started_third);
    }

    #[test]
    fn test_spawn_fetch_requires_runtime() {
        let store = Arc::new(streaming_store(rows(1)));
        assert!(matches!(store.spawn_fetch(), Err(CacheError::NoRuntime)));
    }

    #[test]
    fn test_add_item_indexes_and_notifies() {
        let store = streaming_store(Vec::new()).with_index_key(|r: &Row| Some(r.id.to_string()));
        let recorder = observe(&store);

        store.add_item(Row { id: 7, value: 70 });
        store.add_item(Row { id: 8, value: 80 });

        assert_eq!(store.count(), 2);
        assert_eq!(store.get_item_by_key("8").map(|r| r.value), Some(80));
        assert_eq!(*recorder.items.lock(), vec![(7, 0), (8, 1)]);
    }

    #[test]
    fn test_replace_item_reindexes() {
        let store = streaming_store(Vec::new()).with_index_key(|r: &Row| Some(r.id.to_string()));
        store.add_item(Row { id: 1, value: 10 });
        store.add_item(Row { id: 2, value: 20 });

        assert!(store.replace_item(|r| r.id == 2, Row { id: 3, value: 30 }));
        assert!(store.get_item_by_key("2").is_none());
        assert_eq!(store.get_item_by_key("3").map(|r| r.value), Some(30));
        assert_eq!(store.get_item(1).map(|r| r.id), Some(3));

        assert!(!store.replace_item(|r| r.id == 99, Row { id: 4, value: 0 }));
    }

    #[test]
    fn test_dropped_observers_are_pruned() {
        let store = streaming_store(Vec::new());
        let recorder = observe(&store);
        assert_eq!(store.observer_count(), 1);

        drop(recorder);
        store.add_item(Row { id: 1, value: 1 });
        assert_eq!(store.observer_count(), 0);
    }

    #[test]
    fn test_get_items_is_a_stable_copy() {
        let store = streaming_store(Vec::new());
        store.add_item(Row { id: 1, value: 1 });
        let snapshot = store.get_items();
        store.add_item(Row { id: 2, value: 2 });
        assert_eq!(snapshot.len(), 1);
        assert_eq!(store.count(), 2);
    }
}
