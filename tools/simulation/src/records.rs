//! Synthetic records
//!
//! Records walk forward in block and time with random gaps, spread across a
//! small set of assets, like a wallet's transfer history.

use explorer_types::record::SummaryRecord;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Transfer-like record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticRecord {
    pub id: u64,
    pub block: u64,
    /// Unix seconds.
    pub timestamp: i64,
    pub asset: String,
    pub value: f64,
}

impl SummaryRecord for SyntheticRecord {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn asset_key(&self) -> &str {
        &self.asset
    }
}

/// Shape of generated histories. Missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub start_block: u64,
    pub start_timestamp: i64,
    /// Blocks between consecutive records, drawn from `1..=max_block_gap`.
    pub max_block_gap: u64,
    /// Seconds per block.
    pub block_time_secs: i64,
    pub assets: Vec<String>,
    /// Values are drawn from `0..max_value`.
    pub max_value: f64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            start_block: 18_000_000,
            // 2023-11-14T22:13:20Z
            start_timestamp: 1_700_000_000,
            max_block_gap: 500,
            block_time_secs: 12,
            assets: vec!["ETH".to_string(), "USDC".to_string(), "DAI".to_string()],
            max_value: 1_000.0,
        }
    }
}

/// Seeded record generator.
pub struct RecordGenerator {
    config: GeneratorConfig,
    rng: ChaCha8Rng,
    next_id: u64,
    block: u64,
}

impl RecordGenerator {
    pub fn new(config: GeneratorConfig, seed: u64) -> Self {
        Self {
            block: config.start_block,
            config,
            rng: ChaCha8Rng::seed_from_u64(seed),
            next_id: 1,
        }
    }

    pub fn next_record(&mut self) -> SyntheticRecord {
        let gap = self.rng.gen_range(1..=self.config.max_block_gap.max(1));
        self.block += gap;

        let elapsed_blocks = (self.block - self.config.start_block) as i64;
        let timestamp = self.config.start_timestamp + elapsed_blocks * self.config.block_time_secs;

        let asset = if self.config.assets.is_empty() {
            String::new()
        } else {
            let pick = self.rng.gen_range(0..self.config.assets.len());
            self.config.assets[pick].clone()
        };
        let value = if self.config.max_value > 0.0 {
            self.rng.gen_range(0.0..self.config.max_value)
        } else {
            0.0
        };

        let id = self.next_id;
        self.next_id += 1;
        SyntheticRecord {
            id,
            block: self.block,
            timestamp,
            asset,
            value,
        }
    }

    pub fn generate(&mut self, count: usize) -> Vec<SyntheticRecord> {
        (0..count).map(|_| self.next_record()).collect()
    }
}
