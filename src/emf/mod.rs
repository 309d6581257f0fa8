use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::metric::{Metric, Unit};

/// Fixed per-record overhead the sink charges on top of the payload bytes.
pub const EVENT_OVERHEAD_BYTES: usize = 26;

/// Inputs for building one EMF document.
pub struct EmfInput<'a> {
    pub namespace: &'a str,
    pub metric_name: &'a str,
    pub value: f64,
    pub unit: Unit,
    pub dimensions: &'a BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

/// A serialized EMF document plus its millisecond timestamp.
///
/// The payload is a single-line JSON object: one top-level field per metric
/// name, one per dimension key, and a `_aws` envelope naming the namespace,
/// the dimension keys, the metric name, and the unit.
#[derive(Debug, Clone)]
pub struct EmfRecord {
    pub payload: Vec<u8>,
    pub timestamp_ms: i64,
}

/// Builds the JSON-encoded EMF document for one metric value.
///
/// Dimension keys land in the envelope in lexicographic order; the
/// `BTreeMap` input makes that order a property of iteration, not of the
/// caller's insertion sequence.
pub fn build(input: &EmfInput<'_>) -> Result<EmfRecord> {
    let timestamp_ms = input.timestamp.timestamp_millis();

    let mut doc = Map::new();
    doc.insert(input.metric_name.to_string(), json!(input.value));

    let mut dim_keys = Vec::with_capacity(input.dimensions.len());
    for (key, value) in input.dimensions {
        doc.insert(key.clone(), Value::String(value.clone()));
        dim_keys.push(key.as_str());
    }

    doc.insert(
        "_aws".to_string(),
        json!({
            "Timestamp": timestamp_ms,
            "CloudWatchMetrics": [{
                "Namespace": input.namespace,
                "Dimensions": [dim_keys],
                "Metrics": [{"Name": input.metric_name, "Unit": input.unit.as_str()}],
            }],
        }),
    );

    let payload = serde_json::to_vec(&doc).context("serializing EMF document")?;

    Ok(EmfRecord {
        payload,
        timestamp_ms,
    })
}

/// Builds the EMF document for a job-produced metric.
pub fn from_metric(metric: &Metric, namespace: &str) -> Result<EmfRecord> {
    build(&EmfInput {
        namespace,
        metric_name: &metric.name,
        value: metric.value,
        unit: metric.unit,
        dimensions: &metric.dimensions,
        timestamp: metric.time,
    })
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "_aws")]
    aws: EnvelopeMeta,
}

#[derive(Deserialize)]
struct EnvelopeMeta {
    #[serde(rename = "Timestamp")]
    timestamp: i64,
}

/// Extracts the millisecond timestamp from one serialized EMF line.
///
/// Parses only the `_aws.Timestamp` field; anything else in the line is
/// ignored. Returns `None` for lines that are not EMF documents, letting
/// stage-file readers skip malformed lines without aborting the flush.
pub fn extract_timestamp_ms(line: &[u8]) -> Option<i64> {
    serde_json::from_slice::<Envelope>(line)
        .ok()
        .map(|envelope| envelope.aws.timestamp)
}
