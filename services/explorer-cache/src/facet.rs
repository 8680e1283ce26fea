//! Facet: a filtered, deduplicated, paginated view over a store
//!
//! A facet registers itself with its store as an [`Observer`] and keeps its
//! own copy of the accepted items. Several facets can share one store; each
//! fetches through the store, so concurrent views never cause duplicate
//! fetches.
//!
//! ```text
//!   producer ──▶ Store ──on_new_item──▶ Facet ─┬─▶ view (filter, dedup)
//!                  │                           ├─▶ SummaryAccumulator
//!                  └──on_state_changed──▶      ├─▶ Buckets (chart fold)
//!                                              └─▶ FacetEvent broadcast
//! ```

use std::sync::{Arc, Weak};

use explorer_types::errors::CacheError;
use explorer_types::state::LoadState;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::buckets::Buckets;
use crate::config::{BucketConfig, FacetConfig};
use crate::events::FacetEvent;
use crate::progress::ProgressTracker;
use crate::store::{FetchTicket, Observer, Store};
use crate::summary::SummaryAccumulator;

/// Capacity of the per-facet event channel.
const EVENT_CAPACITY: usize = 256;

/// Keep items for which this returns true.
pub type FilterFn<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;
/// Returns true when the candidate already exists in the view.
///
/// Called with the view locked; it must not call back into the facet.
pub type DedupFn<T> = Arc<dyn Fn(&[Arc<T>], &T) -> bool + Send + Sync>;
/// Folds one item into the facet's chart.
pub type BucketFoldFn<T> = Arc<dyn Fn(&T, &mut Buckets) -> Result<(), CacheError> + Send + Sync>;
/// Caller-supplied sort for [`Facet::get_page`].
pub type SortFn<T> = dyn Fn(&mut [Arc<T>], &SortSpec) -> Result<(), CacheError> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Sort request: `fields[i]` is sorted in `orders[i]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub fields: Vec<String>,
    pub orders: Vec<SortOrder>,
}

impl SortSpec {
    pub fn by(field: impl Into<String>, order: SortOrder) -> Self {
        Self {
            fields: vec![field.into()],
            orders: vec![order],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// One page of a facet, with the totals a paginated table needs.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<Arc<T>>,
    /// Items matching the request before slicing.
    pub total_items: usize,
    pub state: LoadState,
    pub expected_total: usize,
}

impl<T> Page<T> {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

struct View<T> {
    items: Vec<Arc<T>>,
    expected_count: usize,
    /// Rebuilt from the store since the last clear.
    synced: bool,
    /// Store items covered by the last rebuild; lower indices were already
    /// considered.
    synced_upto: usize,
}

impl<T> View<T> {
    fn empty() -> Self {
        Self {
            items: Vec::new(),
            expected_count: 0,
            synced: false,
            synced_upto: 0,
        }
    }
}

/// Builder for [`Facet`]; the facet is registered with its store on build.
pub struct FacetBuilder<T, R = T> {
    name: String,
    store: Arc<Store<T, R>>,
    config: FacetConfig,
    bucket_config: BucketConfig,
    filter: Option<FilterFn<T>>,
    dedup: Option<DedupFn<T>>,
    accumulator: Option<Arc<dyn SummaryAccumulator<T>>>,
    bucket_fold: Option<BucketFoldFn<T>>,
}

impl<T, R> FacetBuilder<T, R>
where
    T: Send + Sync + 'static,
    R: Send + 'static,
{
    pub fn with_config(mut self, config: FacetConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn with_dedup<F>(mut self, dedup: F) -> Self
    where
        F: Fn(&[Arc<T>], &T) -> bool + Send + Sync + 'static,
    {
        self.dedup = Some(Arc::new(dedup));
        self
    }

    pub fn with_accumulator(mut self, accumulator: Arc<dyn SummaryAccumulator<T>>) -> Self {
        self.accumulator = Some(accumulator);
        self
    }

    pub fn with_bucket_fold<F>(mut self, config: BucketConfig, fold: F) -> Self
    where
        F: Fn(&T, &mut Buckets) -> Result<(), CacheError> + Send + Sync + 'static,
    {
        self.bucket_config = config;
        self.bucket_fold = Some(Arc::new(fold));
        self
    }

    pub fn build(self) -> Arc<Facet<T, R>> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let facet = Arc::new(Facet {
            progress: Mutex::new(ProgressTracker::from_config(&self.config)),
            buckets: RwLock::new(Buckets::new(&self.bucket_config)),
            name: self.name,
            store: self.store,
            config: self.config,
            filter: self.filter,
            dedup: self.dedup,
            accumulator: self.accumulator,
            bucket_fold: self.bucket_fold,
            view: RwLock::new(View::empty()),
            rebuild: Mutex::new(()),
            events,
        });

        let observer: Weak<dyn Observer<T>> = Arc::downgrade(&facet) as Weak<dyn Observer<T>>;
        facet.store.register_observer(observer);
        if facet.store.state() == LoadState::Loaded {
            facet.sync_with_store();
        }
        debug!(facet = %facet.name, store = %facet.store.name(), "Facet registered");
        facet
    }
}

/// Filtered view over a [`Store`].
pub struct Facet<T, R = T> {
    name: String,
    store: Arc<Store<T, R>>,
    config: FacetConfig,
    filter: Option<FilterFn<T>>,
    dedup: Option<DedupFn<T>>,
    accumulator: Option<Arc<dyn SummaryAccumulator<T>>>,
    bucket_fold: Option<BucketFoldFn<T>>,
    view: RwLock<View<T>>,
    buckets: RwLock<Buckets>,
    progress: Mutex<ProgressTracker>,
    /// Held by every writer of the view, summary and chart.
    rebuild: Mutex<()>,
    events: broadcast::Sender<FacetEvent>,
}

impl<T, R> Facet<T, R>
where
    T: Send + Sync + 'static,
    R: Send + 'static,
{
    pub fn builder(name: impl Into<String>, store: Arc<Store<T, R>>) -> FacetBuilder<T, R> {
        FacetBuilder {
            name: name.into(),
            store,
            config: FacetConfig::default(),
            bucket_config: BucketConfig::default(),
            filter: None,
            dedup: None,
            accumulator: None,
            bucket_fold: None,
        }
    }

    /// Unfiltered facet with default settings.
    pub fn new(name: impl Into<String>, store: Arc<Store<T, R>>) -> Arc<Self> {
        Self::builder(name, store).build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<Store<T, R>> {
        &self.store
    }

    pub fn count(&self) -> usize {
        self.view.read().items.len()
    }

    /// View size recorded at the last load.
    pub fn expected_count(&self) -> usize {
        self.view.read().expected_count
    }

    pub fn state(&self) -> LoadState {
        self.store.state()
    }

    pub fn is_loaded(&self) -> bool {
        self.store.state() == LoadState::Loaded
    }

    /// Stale store, or an empty view over a store that has data.
    pub fn needs_update(&self) -> bool {
        self.store.state() == LoadState::Stale || (self.count() == 0 && self.store.count() > 0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FacetEvent> {
        self.events.subscribe()
    }

    /// Start a background fetch of the underlying store.
    ///
    /// Fails with [`CacheError::AlreadyFetching`] while a fetch is running.
    /// While the returned ticket is pending the facet emits a progress
    /// heartbeat; a failure is logged and emitted as an error event.
    pub fn fetch_facet(self: &Arc<Self>) -> Result<FetchTicket, CacheError> {
        if self.store.state() == LoadState::Fetching {
            return Err(CacheError::AlreadyFetching);
        }
        let (ticket, started) = self.store.spawn_fetch()?;
        if !started {
            return Err(CacheError::AlreadyFetching);
        }
        debug!(facet = %self.name, store = %self.store.name(), "Facet fetch started");
        self.spawn_monitor(ticket.clone());
        Ok(ticket)
    }

    fn spawn_monitor(self: &Arc<Self>, ticket: FetchTicket) {
        let facet = Arc::clone(self);
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(facet.config.heartbeat_interval());
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let outcome = ticket.wait();
            tokio::pin!(outcome);

            loop {
                tokio::select! {
                    result = &mut outcome => {
                        if let Err(err) = result {
                            warn!(facet = %facet.name, error = %err, "Facet fetch failed");
                            facet.emit(FacetEvent::Error {
                                facet: facet.name.clone(),
                                message: err.to_string(),
                            });
                        }
                        break;
                    }
                    _ = heartbeat.tick() => {
                        facet.emit(FacetEvent::Progress {
                            facet: facet.name.clone(),
                            current: facet.count(),
                            expected: facet.store.expected_total(),
                        });
                    }
                }
            }
        });
    }

    /// Return one page of the view.
    ///
    /// An empty view that was never rebuilt is first resynchronized from the
    /// store, and a stale store is fetched in the background. `first`
    /// and `page_size` are clamped; out-of-range requests return an empty
    /// page carrying the real totals.
    pub fn get_page(
        self: &Arc<Self>,
        first: i64,
        page_size: i64,
        filter: Option<&(dyn Fn(&T) -> bool + Send + Sync)>,
        sort_spec: &SortSpec,
        sort_fn: Option<&SortFn<T>>,
    ) -> Result<Page<T>, CacheError> {
        let (mut items, synced) = {
            let view = self.view.read();
            (view.items.clone(), view.synced)
        };

        if items.is_empty() && !synced && self.store.count() > 0 {
            self.sync_with_store();
            items = self.view.read().items.clone();
        }
        if items.is_empty() && self.store.state() == LoadState::Stale {
            match self.fetch_facet() {
                Ok(_) => debug!(facet = %self.name, "Page request triggered fetch"),
                Err(err) if err.is_already_fetching() => {}
                Err(err) => warn!(facet = %self.name, error = %err, "Could not start fetch"),
            }
        }

        if let Some(filter) = filter {
            items.retain(|item| filter(item));
        }
        if let Some(sort) = sort_fn {
            sort(&mut items, sort_spec)?;
        }

        let total_items = items.len();
        let (start, end) = page_bounds(first, page_size, total_items);
        items.truncate(end);
        items.drain(..start);

        Ok(Page {
            items,
            total_items,
            state: self.store.state(),
            expected_total: self.expected_count(),
        })
    }

    /// Remove every view item `matches` accepts and run `action` on each.
    ///
    /// The store is untouched. Returns the number of items removed.
    pub fn for_every<A, M>(&self, mut action: A, matches: M) -> usize
    where
        A: FnMut(&Arc<T>),
        M: Fn(&T) -> bool,
    {
        let removed: Vec<Arc<T>> = {
            let mut view = self.view.write();
            let (removed, kept) = std::mem::take(&mut view.items)
                .into_iter()
                .partition(|item| matches(item));
            view.items = kept;
            removed
        };
        for item in &removed {
            action(item);
        }
        removed.len()
    }

    /// Rebuild the view, summary and chart from the store's items.
    ///
    /// Rebuilds are serialized with each other and with incoming items. The
    /// chart is folded into a private copy and swapped in at the end, so
    /// readers never see it half built.
    pub fn sync_with_store(&self) {
        let _rebuild = self.rebuild.lock();
        let items = self.store.get_items();
        let covered = items.len();
        if let Some(accumulator) = &self.accumulator {
            accumulator.reset();
        }
        let mut chart = self.bucket_fold.as_ref().map(|_| {
            let mut fresh = self.buckets.read().clone();
            fresh.clear();
            fresh
        });

        let mut rebuilt: Vec<Arc<T>> = Vec::with_capacity(items.len());
        for item in items {
            if !self.accepts(&item) {
                continue;
            }
            if let Some(dedup) = &self.dedup {
                if dedup(&rebuilt, &item) {
                    continue;
                }
            }
            if let Some(accumulator) = &self.accumulator {
                accumulator.accumulate(&item);
            }
            if let Some(chart) = chart.as_mut() {
                self.fold_into(&item, chart);
            }
            rebuilt.push(item);
        }

        if let Some(chart) = chart {
            *self.buckets.write() = chart;
        }
        let count = rebuilt.len();
        {
            let mut view = self.view.write();
            view.items = rebuilt;
            view.expected_count = count;
            view.synced = true;
            view.synced_upto = covered;
        }
        debug!(facet = %self.name, count, covered, "View synchronized with store");
    }

    /// Reset the underlying store; every facet over it is cleared.
    pub fn reset(&self) {
        self.store.reset();
    }

    pub fn get_buckets(&self) -> Buckets {
        self.buckets.read().clone()
    }

    pub fn set_buckets(&self, buckets: Buckets) {
        *self.buckets.write() = buckets;
    }

    pub fn update_buckets<F, O>(&self, update: F) -> O
    where
        F: FnOnce(&mut Buckets) -> O,
    {
        update(&mut self.buckets.write())
    }

    pub fn clear_buckets(&self) {
        self.buckets.write().clear();
    }

    fn accepts(&self, item: &T) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(item))
    }

    fn fold_into(&self, item: &T, buckets: &mut Buckets) {
        if let Some(fold) = &self.bucket_fold {
            if let Err(err) = fold(item, buckets) {
                warn!(facet = %self.name, error = %err, "Item left out of chart");
            }
        }
    }

    fn clear_view(&self) {
        let _rebuild = self.rebuild.lock();
        *self.view.write() = View::empty();
        self.progress.lock().reset();
        if let Some(accumulator) = &self.accumulator {
            accumulator.reset();
        }
        if self.bucket_fold.is_some() {
            self.buckets.write().clear();
        }
    }

    fn emit(&self, event: FacetEvent) {
        if let Err(err) = self.events.send(event) {
            // No subscribers is not an error.
            trace!(facet = %self.name, event = err.0.event_type_label(), "Event dropped");
        }
    }
}

/// Clamp a page request to `[start, end)` within `total` items.
fn page_bounds(first: i64, page_size: i64, total: usize) -> (usize, usize) {
    let start = usize::try_from(first).unwrap_or(0).min(total);
    let size = usize::try_from(page_size).unwrap_or(0);
    (start, start.saturating_add(size).min(total))
}

impl<T, R> Observer<T> for Facet<T, R>
where
    T: Send + Sync + 'static,
    R: Send + 'static,
{
    fn on_new_item(&self, item: &Arc<T>, index: usize) {
        if !self.accepts(item) {
            return;
        }

        let rebuild = self.rebuild.lock();
        // A superseded or reset stream may still deliver an item that is no
        // longer in the store.
        let current = self
            .store
            .get_item(index)
            .map_or(false, |stored| Arc::ptr_eq(&stored, item));
        if !current {
            trace!(facet = %self.name, index, "Ignoring item no longer in store");
            return;
        }

        let progress = {
            let mut view = self.view.write();
            if index < view.synced_upto {
                return;
            }
            if let Some(dedup) = &self.dedup {
                if dedup(&view.items, item) {
                    return;
                }
            }
            view.items.push(Arc::clone(item));
            self.progress.lock().advance()
        };

        if let Some(accumulator) = &self.accumulator {
            accumulator.accumulate(item);
        }
        if self.bucket_fold.is_some() {
            self.fold_into(item, &mut self.buckets.write());
        }
        drop(rebuild);

        if let Some(current) = progress {
            self.emit(FacetEvent::Progress {
                facet: self.name.clone(),
                current,
                expected: self.store.expected_total(),
            });
        }
    }

    fn on_state_changed(&self, state: LoadState, reason: &str) {
        if state.invalidates_view() {
            debug!(facet = %self.name, %state, reason, "Clearing view");
            self.clear_view();
            return;
        }

        self.sync_with_store();
        self.progress.lock().reset();
        self.emit(FacetEvent::Loaded {
            facet: self.name.clone(),
            count: self.count(),
            summary: self.accumulator.as_ref().map(|a| a.snapshot()),
        });
    }
}
