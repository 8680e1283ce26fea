//! Time-aggregation granularities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported summary periods.
///
/// `Blockly` is the "no aggregation" sentinel: timestamps are kept as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    #[default]
    Blockly,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Annually,
}

impl Period {
    /// All periods, finest first.
    pub fn all() -> &'static [Period] {
        &[
            Period::Blockly,
            Period::Hourly,
            Period::Daily,
            Period::Weekly,
            Period::Monthly,
            Period::Quarterly,
            Period::Annually,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Blockly => "blockly",
            Period::Hourly => "hourly",
            Period::Daily => "daily",
            Period::Weekly => "weekly",
            Period::Monthly => "monthly",
            Period::Quarterly => "quarterly",
            Period::Annually => "annually",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown period name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown period: {0}")]
pub struct UnknownPeriod(pub String);

impl FromStr for Period {
    type Err = UnknownPeriod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Period::all()
            .iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownPeriod(s.to_string()))
    }
}
