use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::file::{FileBatcher, CALL_COUNT_METRIC, EVENT_NAME_DIMENSION};
use crate::batch::BatchConfig;
use crate::emf::{self, EmfInput, EmfRecord};
use crate::event::AuditEvent;
use crate::job::{Job, JobManager, JobManagerConfig};
use crate::metric::Unit;
use crate::pipeline::MetricPipeline;
use crate::sink::flush::Flusher;

/// One raw record as delivered by the host: an opaque id for partial-batch
/// retry plus the JSON body.
#[derive(Debug, Clone)]
pub struct IngestRecord {
    pub id: String,
    pub body: String,
}

/// A record the host should redeliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestFailure {
    pub id: String,
}

/// Entry adaptor for the ingest path: decodes raw audit events and routes
/// them into the file batcher keyed by the event's region.
pub struct IngestHandler {
    batcher: Arc<FileBatcher>,
}

impl IngestHandler {
    pub fn new(batcher: Arc<FileBatcher>) -> Self {
        Self { batcher }
    }

    /// Processes one delivery batch. Decode failures are returned to the
    /// host for redelivery; staging failures are logged and absorbed, since
    /// the record's durability is the stage file's concern from here on.
    pub async fn handle(&self, records: Vec<IngestRecord>) -> Vec<IngestFailure> {
        info!(records = records.len(), "handling ingest batch");

        let mut failures = Vec::new();
        for record in records {
            let event = match AuditEvent::decode(&record.body) {
                Ok(event) => event,
                Err(e) => {
                    warn!(id = %record.id, error = %e, "failed to decode audit event");
                    failures.push(IngestFailure { id: record.id });
                    continue;
                }
            };

            debug!(id = %record.id, region = %event.region, name = %event.event_name, "staging event");
            if let Err(e) = self.batcher.add(&event.region, &event).await {
                warn!(id = %record.id, region = %event.region, error = %e, "failed to stage event");
            }
        }

        if failures.is_empty() {
            debug!("all records staged");
        } else {
            info!(failed = failures.len(), "reporting failed records for retry");
        }

        failures
    }
}

/// Ingest adaptor that bypasses disk staging: decodes each record, groups
/// the derived EMF records by region, and flushes every region in
/// parallel within the call.
///
/// Unlike [`IngestHandler`], flush failures here are reported per record,
/// since the records have no durable home once this call returns.
pub struct DirectIngestHandler {
    namespace: String,
    flusher: Arc<Flusher>,
}

impl DirectIngestHandler {
    pub fn new(namespace: impl Into<String>, flusher: Arc<Flusher>) -> Self {
        Self {
            namespace: namespace.into(),
            flusher,
        }
    }

    /// Processes one delivery batch, returning every record the host
    /// should redeliver.
    pub async fn handle(&self, records: Vec<IngestRecord>) -> Vec<IngestFailure> {
        info!(records = records.len(), "handling direct ingest batch");

        struct Entry {
            id: String,
            record: EmfRecord,
        }

        let mut by_region: HashMap<String, Vec<Entry>> = HashMap::new();
        let mut failures = Vec::new();

        for record in records {
            let event = match AuditEvent::decode(&record.body) {
                Ok(event) => event,
                Err(e) => {
                    warn!(id = %record.id, error = %e, "failed to decode audit event");
                    failures.push(IngestFailure { id: record.id });
                    continue;
                }
            };

            let mut dimensions = BTreeMap::new();
            dimensions.insert(EVENT_NAME_DIMENSION.to_string(), event.event_name.clone());

            let emf_record = match emf::build(&EmfInput {
                namespace: &self.namespace,
                metric_name: CALL_COUNT_METRIC,
                value: 1.0,
                unit: Unit::Count,
                dimensions: &dimensions,
                timestamp: event.event_time,
            }) {
                Ok(record) => record,
                Err(e) => {
                    warn!(id = %record.id, error = %e, "failed to build EMF record");
                    failures.push(IngestFailure { id: record.id });
                    continue;
                }
            };

            by_region.entry(event.region).or_default().push(Entry {
                id: record.id,
                record: emf_record,
            });
        }

        if by_region.is_empty() {
            debug!("no records to flush");
            return failures;
        }

        let mut tasks = JoinSet::new();
        for (region, entries) in by_region {
            let flusher = Arc::clone(&self.flusher);
            tasks.spawn(async move {
                let batch: Vec<EmfRecord> =
                    entries.iter().map(|entry| entry.record.clone()).collect();

                match flusher.flush(&region, &batch).await {
                    Ok(()) => {
                        debug!(region = %region, records = entries.len(), "direct flush complete");
                        Vec::new()
                    }
                    Err(e) => {
                        warn!(region = %region, error = %e, "direct flush failed");
                        entries
                            .into_iter()
                            .map(|entry| IngestFailure { id: entry.id })
                            .collect()
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(mut failed) => failures.append(&mut failed),
                Err(e) => warn!(error = %e, "direct flush task join failed"),
            }
        }

        if !failures.is_empty() {
            info!(failed = failures.len(), "reporting failed records for retry");
        }

        failures
    }
}

/// Entry adaptor for the quota path: fans the job catalogue out over a
/// worker pool and drains the per-region metric batchers once all jobs are
/// done.
pub struct QuotaHandler {
    regions: Vec<String>,
    namespace: String,
    flusher: Arc<Flusher>,
    batch_cfg: BatchConfig,
    manager_cfg: JobManagerConfig,
}

impl QuotaHandler {
    pub fn new(
        regions: Vec<String>,
        namespace: impl Into<String>,
        flusher: Arc<Flusher>,
        batch_cfg: BatchConfig,
        manager_cfg: JobManagerConfig,
    ) -> Self {
        Self {
            regions,
            namespace: namespace.into(),
            flusher,
            batch_cfg,
            manager_cfg,
        }
    }

    /// Runs one collection tick: a fresh pipeline and worker pool per tick,
    /// torn down completely before returning.
    pub async fn handle_tick(
        &self,
        jobs: Vec<Arc<dyn Job>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!(jobs = jobs.len(), regions = self.regions.len(), "quota tick started");

        let pipeline = MetricPipeline::build(
            &self.regions,
            &self.namespace,
            Arc::clone(&self.flusher),
            self.batch_cfg.clone(),
            cancel.child_token(),
        );

        let manager = JobManager::new(
            self.manager_cfg.clone(),
            pipeline.channels(),
            cancel.child_token(),
        );

        for job in jobs {
            manager.add_job(job).await;
        }

        manager.wait().await;
        pipeline.drain().await;

        info!("quota tick complete");
        Ok(())
    }
}
