//! Block-range bucket aggregation for charts
//!
//! A fact (a value attached to a block range) is spread over a fixed-size
//! bucket grid in proportion to how much of the range each bucket covers.
//! A fact spanning three buckets therefore contributes to all three without
//! being counted more than once in total.
//!
//! Bucket `i` always spans blocks `[i * size, (i + 1) * size - 1]`.
//!
//! The grid is dense (one bucket per index up to the highest touched), so
//! growth is bounded by a configured ceiling instead of following far-future
//! block numbers without limit.

use std::collections::BTreeMap;

use explorer_types::errors::CacheError;
use serde::{Deserialize, Serialize};

use crate::config::BucketConfig;

/// One cell of the chart grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub bucket_key: String,
    pub start_block: u64,
    pub end_block: u64,
    pub total: f64,
    /// Deviation from the series average, `(total - avg) / avg`.
    pub color_value: f64,
}

impl Bucket {
    /// Empty bucket at its canonical position in a grid of `size` blocks.
    pub fn at(index: usize, size: u64) -> Self {
        let start_block = (index as u64).saturating_mul(size);
        let end_block = start_block.saturating_add(size.saturating_sub(1));
        Self {
            bucket_key: start_block.to_string(),
            start_block,
            end_block,
            total: 0.0,
            color_value: 0.0,
        }
    }
}

/// Summary statistics over one series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketStats {
    pub total: f64,
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

/// Grid geometry, independent of the data currently in the grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridInfo {
    pub rows: usize,
    pub columns: usize,
    pub bucket_size: u64,
    pub bucket_count: usize,
    pub max_block: u64,
}

impl GridInfo {
    pub fn new(bucket_size: u64, columns: usize) -> Self {
        Self {
            rows: 0,
            columns,
            bucket_size,
            bucket_count: 0,
            max_block: 0,
        }
    }
}

fn bucket_index(block: u64, size: u64, max_buckets: usize) -> Result<usize, CacheError> {
    let index = block / size;
    usize::try_from(index)
        .ok()
        .filter(|&i| i < max_buckets)
        .ok_or(CacheError::BucketLimitExceeded {
            requested: usize::try_from(index).unwrap_or(usize::MAX).saturating_add(1),
            limit: max_buckets,
        })
}

/// Grow `buckets` so that `target_index` exists.
///
/// New buckets get their canonical block span. Fails without allocating if
/// the grid would exceed `max_buckets`.
pub fn ensure_buckets_exist(
    buckets: &mut Vec<Bucket>,
    target_index: usize,
    size: u64,
    max_buckets: usize,
) -> Result<(), CacheError> {
    if size == 0 {
        return Err(CacheError::InvalidBucketSize);
    }
    let needed = target_index.saturating_add(1);
    if needed > max_buckets {
        return Err(CacheError::BucketLimitExceeded {
            requested: needed,
            limit: max_buckets,
        });
    }
    if buckets.len() < needed {
        let start = buckets.len();
        buckets.extend((start..needed).map(|i| Bucket::at(i, size)));
    }
    Ok(())
}

/// Spread `value` over every bucket that `[first_block, last_block]` overlaps.
///
/// Each bucket receives `value * overlap / range`, so the contributions sum
/// to `value`.
pub fn distribute_to_buckets(
    buckets: &mut Vec<Bucket>,
    first_block: u64,
    last_block: u64,
    value: f64,
    size: u64,
    max_buckets: usize,
) -> Result<(), CacheError> {
    if size == 0 {
        return Err(CacheError::InvalidBucketSize);
    }
    if first_block > last_block {
        return Err(CacheError::InvalidBlockRange {
            first: first_block,
            last: last_block,
        });
    }

    let first_index = bucket_index(first_block, size, max_buckets)?;
    let last_index = bucket_index(last_block, size, max_buckets)?;
    ensure_buckets_exist(buckets, last_index, size, max_buckets)?;

    let range = (last_block - first_block) as f64 + 1.0;
    for bucket in &mut buckets[first_index..=last_index] {
        let overlap_start = first_block.max(bucket.start_block);
        let overlap_end = last_block.min(bucket.end_block);
        let overlap = (overlap_end - overlap_start) as f64 + 1.0;
        bucket.total += value * overlap / range;
    }
    Ok(())
}

/// Compute series statistics, then each bucket's color value.
pub fn calculate_bucket_stats_and_colors(buckets: &mut [Bucket]) -> BucketStats {
    if buckets.is_empty() {
        return BucketStats::default();
    }

    let mut stats = BucketStats {
        total: 0.0,
        average: 0.0,
        min: f64::INFINITY,
        max: f64::NEG_INFINITY,
        count: buckets.len(),
    };
    for bucket in buckets.iter() {
        stats.total += bucket.total;
        stats.min = stats.min.min(bucket.total);
        stats.max = stats.max.max(bucket.total);
    }
    stats.average = stats.total / stats.count as f64;

    for bucket in buckets.iter_mut() {
        bucket.color_value = if stats.average == 0.0 {
            0.0
        } else {
            (bucket.total - stats.average) / stats.average
        };
    }
    stats
}

/// Raise the grid's bucket count and max block; never shrinks either.
pub fn update_grid_info(grid_info: &mut GridInfo, bucket_count: usize, last_block: u64) {
    grid_info.bucket_count = grid_info.bucket_count.max(bucket_count);
    grid_info.max_block = grid_info.max_block.max(last_block);
    grid_info.rows = if grid_info.columns == 0 {
        0
    } else {
        grid_info.bucket_count.div_ceil(grid_info.columns)
    };
}

fn default_max_buckets() -> usize {
    BucketConfig::default().max_buckets
}

/// Chart state of one facet: named series over a shared grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Buckets {
    pub series: BTreeMap<String, Vec<Bucket>>,
    pub stats: BTreeMap<String, BucketStats>,
    pub grid_info: GridInfo,
    #[serde(skip, default = "default_max_buckets")]
    max_buckets: usize,
}

impl Default for Buckets {
    fn default() -> Self {
        Self::new(&BucketConfig::default())
    }
}

impl Buckets {
    pub fn new(config: &BucketConfig) -> Self {
        Self {
            series: BTreeMap::new(),
            stats: BTreeMap::new(),
            grid_info: GridInfo::new(config.bucket_size, config.columns),
            max_buckets: config.max_buckets,
        }
    }

    /// Fold one fact into `series` and refresh that series' statistics.
    pub fn add_fact(
        &mut self,
        series: &str,
        first_block: u64,
        last_block: u64,
        value: f64,
    ) -> Result<(), CacheError> {
        let size = self.grid_info.bucket_size;
        let buckets = self.series.entry(series.to_string()).or_default();
        distribute_to_buckets(buckets, first_block, last_block, value, size, self.max_buckets)?;

        let stats = calculate_bucket_stats_and_colors(buckets);
        let count = buckets.len();
        self.stats.insert(series.to_string(), stats);
        update_grid_info(&mut self.grid_info, count, last_block);
        Ok(())
    }

    pub fn get_series(&self, series: &str) -> &[Bucket] {
        self.series.get(series).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get_stats(&self, series: &str) -> Option<&BucketStats> {
        self.stats.get(series)
    }

    /// Drop all data, keeping the grid geometry.
    pub fn clear(&mut self) {
        self.series.clear();
        self.stats.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.series.values().all(Vec::is_empty)
    }
}
