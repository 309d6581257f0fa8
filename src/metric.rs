use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// Measurement unit attached to a metric, matching the sink's unit
/// vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Count,
    Percent,
    Seconds,
    Milliseconds,
    Bytes,
    None,
}

impl Unit {
    /// Returns the unit string used inside an EMF envelope.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "Count",
            Self::Percent => "Percent",
            Self::Seconds => "Seconds",
            Self::Milliseconds => "Milliseconds",
            Self::Bytes => "Bytes",
            Self::None => "None",
        }
    }

    /// Parses a unit string case-insensitively. Unknown units fall back to
    /// `Count`.
    pub fn parse_or_count(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "count" => Self::Count,
            "percent" => Self::Percent,
            "seconds" => Self::Seconds,
            "milliseconds" => Self::Milliseconds,
            "bytes" => Self::Bytes,
            "none" => Self::None,
            _ => Self::Count,
        }
    }
}

/// A single metric observation produced by a quota-collection job and
/// consumed by a regional metric batcher.
///
/// Dimensions are kept in a `BTreeMap` so the dimension-key order in any
/// derived EMF document is lexicographic by construction.
#[derive(Debug, Clone)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub unit: Unit,
    pub time: DateTime<Utc>,
    pub dimensions: BTreeMap<String, String>,
}

impl Metric {
    /// Creates a metric stamped with the current time and no dimensions.
    pub fn new(name: impl Into<String>, value: f64, unit: Unit) -> Self {
        Self {
            name: name.into(),
            value,
            unit,
            time: Utc::now(),
            dimensions: BTreeMap::new(),
        }
    }

    /// Adds one dimension, returning self for chaining.
    pub fn with_dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }
}
