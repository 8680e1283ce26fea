//! Synthetic streaming producers
//!
//! A [`SyntheticProducer`] pre-generates its records from a seed and streams
//! the same sequence on every invocation, so repeated fetches of a store are
//! comparable. The scenario decides how the stream ends.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use explorer_cache::{ContextManager, ProducerError, Store, StreamSink};
use tracing::debug;

use crate::records::{GeneratorConfig, RecordGenerator, SyntheticRecord};

/// How a synthetic stream behaves.
#[derive(Debug, Clone, PartialEq)]
pub enum Scenario {
    /// Deliver `n` records and finish.
    Clean(usize),
    /// Deliver `n` records, then report a mid-stream error.
    FailAfter(usize),
    /// Fail synchronously before streaming anything.
    FailBeforeStart,
    /// Deliver `n` records, pausing `delay` before each one.
    Slow(usize, Duration),
}

impl Scenario {
    /// Records this scenario delivers when not cancelled.
    pub fn record_count(&self) -> usize {
        match self {
            Scenario::Clean(n) | Scenario::FailAfter(n) | Scenario::Slow(n, _) => *n,
            Scenario::FailBeforeStart => 0,
        }
    }
}

pub struct SyntheticProducer {
    scenario: Scenario,
    records: Arc<Vec<SyntheticRecord>>,
    invocations: Arc<AtomicUsize>,
}

impl SyntheticProducer {
    pub fn new(scenario: Scenario, seed: u64) -> Self {
        Self::with_config(scenario, GeneratorConfig::default(), seed)
    }

    pub fn with_config(scenario: Scenario, config: GeneratorConfig, seed: u64) -> Self {
        let records = RecordGenerator::new(config, seed).generate(scenario.record_count());
        Self {
            scenario,
            records: Arc::new(records),
            invocations: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    /// The records a full, uncancelled stream delivers.
    pub fn records(&self) -> &[SyntheticRecord] {
        &self.records
    }

    /// Times the query function has been called.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Query function for [`Store::new`] / [`Store::passthrough`].
    pub fn query(
        &self,
    ) -> impl Fn(StreamSink<SyntheticRecord>) -> Result<(), ProducerError> + Send + Sync + 'static {
        let scenario = self.scenario.clone();
        let records = Arc::clone(&self.records);
        let invocations = Arc::clone(&self.invocations);

        move |sink: StreamSink<SyntheticRecord>| -> Result<(), ProducerError> {
            let call = invocations.fetch_add(1, Ordering::SeqCst);
            debug!(?scenario, call, "Synthetic stream started");

            let delay = match &scenario {
                Scenario::FailBeforeStart => {
                    return Err("synthetic producer refused to start".into());
                }
                Scenario::Slow(_, delay) => Some(*delay),
                Scenario::Clean(_) | Scenario::FailAfter(_) => None,
            };

            sink.set_expected_total(records.len());
            for record in records.iter() {
                if let Some(delay) = delay {
                    std::thread::sleep(delay);
                }
                if sink.send_item(record.clone()).is_err() {
                    debug!(call, "Synthetic stream cancelled");
                    return Ok(());
                }
            }

            if let Scenario::FailAfter(n) = &scenario {
                sink.send_error(format!("synthetic failure after {} records", n))?;
            }
            Ok(())
        }
    }

    /// A store streaming this producer's records under key `name`.
    pub fn store(&self, name: &str, contexts: Arc<ContextManager>) -> Store<SyntheticRecord> {
        Store::passthrough(name, contexts, self.query())
    }
}
