//! Period summaries
//!
//! Groups items by (period start, period, asset). Two write modes:
//!
//! - [`SummaryManager::add`] accumulates: every item is appended, which suits
//!   count and flow style facts.
//! - [`SummaryManager::add_balance`] replaces: the bucket for the item's
//!   period and asset holds exactly the latest item, which suits
//!   point-in-time balance snapshots.
//!
//! Buckets are kept in a BTreeMap so summaries come back in period order.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use explorer_types::period::Period;
use explorer_types::record::SummaryRecord;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

const HOUR: i64 = 3_600;
const DAY: i64 = 86_400;

/// Key of one summary bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SummaryKey {
    pub period: Period,
    pub timestamp: i64,
    pub asset: String,
}

/// Floor a Unix timestamp (seconds, UTC) to the start of its period.
///
/// Weeks start on Sunday. `Blockly` is the identity. Timestamps chrono
/// cannot represent are returned unchanged.
pub fn normalize_to_period(timestamp: i64, period: Period) -> i64 {
    match period {
        Period::Blockly => timestamp,
        Period::Hourly => timestamp - timestamp.rem_euclid(HOUR),
        Period::Daily => timestamp - timestamp.rem_euclid(DAY),
        Period::Weekly => {
            let day = timestamp - timestamp.rem_euclid(DAY);
            // 1970-01-01 was a Thursday, four days after Sunday.
            let days_since_sunday = (day / DAY + 4).rem_euclid(7);
            day - days_since_sunday * DAY
        }
        Period::Monthly | Period::Quarterly | Period::Annually => {
            let Some(dt) = DateTime::from_timestamp(timestamp, 0) else {
                return timestamp;
            };
            let month = match period {
                Period::Monthly => dt.month(),
                Period::Quarterly => (dt.month0() / 3) * 3 + 1,
                _ => 1,
            };
            Utc.with_ymd_and_hms(dt.year(), month, 1, 0, 0, 0)
                .single()
                .map_or(timestamp, |start| start.timestamp())
        }
    }
}

/// Period-bucketed aggregation of items.
#[derive(Debug)]
pub struct SummaryManager<T> {
    summaries: RwLock<BTreeMap<SummaryKey, Vec<Arc<T>>>>,
}

impl<T> Default for SummaryManager<T> {
    fn default() -> Self {
        Self {
            summaries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T> SummaryManager<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// See [`normalize_to_period`].
    pub fn normalize_to_period(timestamp: i64, period: Period) -> i64 {
        normalize_to_period(timestamp, period)
    }

    /// All items summarized under `period`, across every timestamp and asset.
    pub fn get_summaries(&self, period: Period) -> Vec<Arc<T>> {
        self.summaries
            .read()
            .iter()
            .filter(|(key, _)| key.period == period)
            .flat_map(|(_, items)| items.iter().cloned())
            .collect()
    }

    /// Number of distinct buckets held for `period`.
    pub fn period_count(&self, period: Period) -> usize {
        self.summaries
            .read()
            .keys()
            .filter(|key| key.period == period)
            .count()
    }

    /// Number of buckets across all periods.
    pub fn len(&self) -> usize {
        self.summaries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.read().is_empty()
    }

    pub fn reset(&self) {
        self.summaries.write().clear();
    }
}

impl<T: SummaryRecord> SummaryManager<T> {
    /// Append each item to its period bucket.
    pub fn add(&self, items: &[Arc<T>], period: Period) {
        let mut summaries = self.summaries.write();
        for item in items {
            let key = SummaryKey {
                period,
                timestamp: normalize_to_period(item.timestamp(), period),
                asset: String::new(),
            };
            summaries.entry(key).or_default().push(Arc::clone(item));
        }
    }

    /// Replace the bucket for the item's period and asset with this item.
    pub fn add_balance(&self, item: Arc<T>, period: Period) {
        let key = SummaryKey {
            period,
            timestamp: normalize_to_period(item.timestamp(), period),
            asset: item.asset_key().to_string(),
        };
        self.summaries.write().insert(key, vec![item]);
    }
}

/// Point-in-time description of a summary, carried by load notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarySnapshot {
    pub period: Period,
    /// Distinct period buckets.
    pub periods: usize,
    /// Items across those buckets.
    pub items: usize,
}

/// Folds streamed items into a running summary.
pub trait SummaryAccumulator<T>: Send + Sync {
    fn accumulate(&self, item: &Arc<T>);
    fn reset(&self);
    fn snapshot(&self) -> SummarySnapshot;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccumulateMode {
    Flows,
    Balances,
}

/// A [`SummaryAccumulator`] backed by a private [`SummaryManager`].
#[derive(Debug)]
pub struct PeriodAccumulator<T> {
    period: Period,
    mode: AccumulateMode,
    manager: SummaryManager<T>,
}

impl<T> PeriodAccumulator<T> {
    /// Accumulate every item.
    pub fn flows(period: Period) -> Self {
        Self {
            period,
            mode: AccumulateMode::Flows,
            manager: SummaryManager::new(),
        }
    }

    /// Keep only the latest item per period and asset.
    pub fn balances(period: Period) -> Self {
        Self {
            period,
            mode: AccumulateMode::Balances,
            manager: SummaryManager::new(),
        }
    }

    pub fn summaries(&self) -> Vec<Arc<T>> {
        self.manager.get_summaries(self.period)
    }
}

impl<T> SummaryAccumulator<T> for PeriodAccumulator<T>
where
    T: SummaryRecord + Send + Sync,
{
    fn accumulate(&self, item: &Arc<T>) {
        match self.mode {
            AccumulateMode::Flows => self.manager.add(std::slice::from_ref(item), self.period),
            AccumulateMode::Balances => self.manager.add_balance(Arc::clone(item), self.period),
        }
    }

    fn reset(&self) {
        self.manager.reset();
    }

    fn snapshot(&self) -> SummarySnapshot {
        SummarySnapshot {
            period: self.period,
            periods: self.manager.period_count(self.period),
            items: self.manager.get_summaries(self.period).len(),
        }
    }
}
