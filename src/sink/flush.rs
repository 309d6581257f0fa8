use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::emf::EmfRecord;
use crate::region::RegionMap;
use crate::sink::{InputLogEvent, SharedLogsClient, SinkError};

/// Errors from submitting a batch to a regional sink.
#[derive(Debug, Error)]
pub enum FlushError {
    #[error("no sink client for region {0}")]
    UnknownRegion(String),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Converts a batch of EMF records into a single ordered submission to the
/// region's sink client.
///
/// This is the one place where the sink's ordering requirement is imposed:
/// events are sorted ascending by timestamp (stable, so input order breaks
/// ties) before submission. No retry; callers enforce batch size caps.
pub struct Flusher {
    clients: Arc<RegionMap<SharedLogsClient>>,
    group: String,
    stream: String,
}

impl Flusher {
    pub fn new(
        clients: Arc<RegionMap<SharedLogsClient>>,
        group: impl Into<String>,
        stream: impl Into<String>,
    ) -> Self {
        Self {
            clients,
            group: group.into(),
            stream: stream.into(),
        }
    }

    /// Submits one batch for one region. An empty batch is a no-op.
    pub async fn flush(&self, region: &str, batch: &[EmfRecord]) -> Result<(), FlushError> {
        if batch.is_empty() {
            debug!(region, "empty batch, nothing to flush");
            return Ok(());
        }

        let client = self
            .clients
            .load(region)
            .ok_or_else(|| FlushError::UnknownRegion(region.to_string()))?;

        let mut events: Vec<InputLogEvent> = batch
            .iter()
            .map(|record| InputLogEvent {
                timestamp_ms: record.timestamp_ms,
                message: String::from_utf8_lossy(&record.payload).into_owned(),
            })
            .collect();

        events.sort_by_key(|event| event.timestamp_ms);

        client
            .put_log_events(&self.group, &self.stream, events)
            .await?;

        debug!(
            region,
            batch_size = batch.len(),
            group = %self.group,
            stream = %self.stream,
            "flushed batch",
        );

        Ok(())
    }
}
