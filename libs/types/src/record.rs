//! Record capabilities consumed by the summary layer
//!
//! Record schemas differ per collection (transactions, statements, balances
//! and so on). Instead of probing fields at runtime, a record type opts in to
//! period summaries by implementing [`SummaryRecord`].

/// A record that can be grouped into time periods.
pub trait SummaryRecord {
    /// Unix timestamp (seconds) of the record.
    fn timestamp(&self) -> i64;

    /// Asset the record belongs to, for per-asset balance snapshots.
    ///
    /// Records without an asset dimension share the empty key.
    fn asset_key(&self) -> &str {
        ""
    }
}

impl<T: SummaryRecord + ?Sized> SummaryRecord for std::sync::Arc<T> {
    fn timestamp(&self) -> i64 {
        (**self).timestamp()
    }

    fn asset_key(&self) -> &str {
        (**self).asset_key()
    }
}
