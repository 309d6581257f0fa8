use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::emf::{self, EmfInput, EmfRecord};
use crate::event::AuditEvent;
use crate::metric::Unit;
use crate::sink::flush::Flusher;

/// Metric name emitted for every ingested audit event.
pub const CALL_COUNT_METRIC: &str = "CallCount";

/// Dimension key carrying the audit event name.
pub const EVENT_NAME_DIMENSION: &str = "eventName";

/// Configuration for the file-backed regional batcher.
///
/// A zero `max_count` or `max_bytes` disables that threshold; a zero
/// `flush_interval` disables the periodic flush.
#[derive(Debug, Clone)]
pub struct FileBatcherConfig {
    pub namespace: String,
    pub metric_name: String,
    pub base_dir: PathBuf,
    pub max_count: usize,
    pub max_bytes: u64,
    pub flush_interval: Duration,
}

impl FileBatcherConfig {
    pub fn new(namespace: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            namespace: namespace.into(),
            metric_name: CALL_COUNT_METRIC.to_string(),
            base_dir: base_dir.into(),
            max_count: 0,
            max_bytes: 0,
            flush_interval: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct RegionGauge {
    count: usize,
    bytes: u64,
}

struct Inner {
    cfg: FileBatcherConfig,
    flusher: Arc<Flusher>,
    /// region → what is currently staged on disk for it. One mutex guards
    /// both counters so they move together with truncation.
    gauges: Mutex<HashMap<String, RegionGauge>>,
    cancel: CancellationToken,
}

/// Disk-staged per-region batcher for ingested audit events.
///
/// Every event is converted to an EMF record and appended to that region's
/// stage file before any threshold bookkeeping, so records survive the
/// process terminating ahead of a flush; a later pass picks leftovers up via
/// [`FileBatcher::recover`]. Pre-add and post-add threshold checks keep each
/// stage file within the configured caps, except by at most a single record.
pub struct FileBatcher {
    inner: Arc<Inner>,
    ticker_cancel: CancellationToken,
    ticker_task: Option<JoinHandle<()>>,
}

impl FileBatcher {
    /// Creates the batcher and starts its periodic flush ticker.
    pub fn new(cfg: FileBatcherConfig, flusher: Arc<Flusher>, parent: CancellationToken) -> Self {
        let inner = Arc::new(Inner {
            flusher,
            gauges: Mutex::new(HashMap::new()),
            cancel: parent.child_token(),
            cfg,
        });

        let ticker_cancel = CancellationToken::new();
        let ticker_task = (inner.cfg.flush_interval > Duration::ZERO).then(|| {
            let inner = Arc::clone(&inner);
            let ticker_cancel = ticker_cancel.clone();
            tokio::spawn(async move {
                let period = inner.cfg.flush_interval;
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = ticker_cancel.cancelled() => return,
                        _ = inner.cancel.cancelled() => return,
                        _ = ticker.tick() => {
                            inner.flush_all_regions().await;
                        }
                    }
                }
            })
        });

        Self {
            inner,
            ticker_cancel,
            ticker_task,
        }
    }

    /// Converts one audit event to an EMF record, stages it on disk for the
    /// event's region, and flushes the region when a threshold trips.
    pub async fn add(&self, region: &str, event: &AuditEvent) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            bail!("file batcher is stopped");
        }

        let mut dimensions = BTreeMap::new();
        dimensions.insert(
            EVENT_NAME_DIMENSION.to_string(),
            event.event_name.clone(),
        );

        let record = emf::build(&EmfInput {
            namespace: &self.inner.cfg.namespace,
            metric_name: &self.inner.cfg.metric_name,
            value: 1.0,
            unit: Unit::Count,
            dimensions: &dimensions,
            timestamp: event.event_time,
        })
        .context("building EMF record for audit event")?;

        // Newline separator counts against the byte cap.
        let record_size = record.payload.len() as u64 + 1;

        let staged = self.inner.gauge(region);
        if self.inner.would_overflow(&staged, record_size) {
            info!(region, "threshold reached before add, flushing");
            self.inner.flush_region(region).await;
        }

        self.inner
            .append(region, &record.payload)
            .await
            .with_context(|| format!("appending to stage file for region {region}"))?;

        let staged = {
            let mut gauges = self.inner.gauges.lock().unwrap();
            let gauge = gauges.entry(region.to_string()).or_default();
            gauge.count += 1;
            gauge.bytes += record_size;
            *gauge
        };

        if self.inner.cap_reached(&staged) {
            info!(region, "threshold reached after add, flushing");
            self.inner.flush_region(region).await;
        }

        Ok(())
    }

    /// Flushes stage files left behind by a previous process pass.
    ///
    /// Scans the staging directory for `emf_<region>.ndjson` files and
    /// flushes each in parallel. Run once at boot, before accepting events.
    pub async fn recover(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.inner.cfg.base_dir)
            .await
            .context("reading staging directory")?;

        let mut regions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("listing staging directory")?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(region) = name
                .strip_prefix("emf_")
                .and_then(|rest| rest.strip_suffix(".ndjson"))
            {
                if !region.is_empty() {
                    regions.push(region.to_string());
                }
            }
        }

        if regions.is_empty() {
            return Ok(());
        }

        info!(
            files = regions.len(),
            "recovering staged records from a previous run",
        );

        let mut tasks = JoinSet::new();
        for region in regions {
            let inner = Arc::clone(&self.inner);
            tasks.spawn(async move {
                inner.flush_region(&region).await;
            });
        }
        while tasks.join_next().await.is_some() {}

        Ok(())
    }

    /// Stops the ticker, flushes all regions in parallel, and cancels the
    /// internal context. `add` after `stop` returns an error.
    pub async fn stop(&mut self) {
        self.ticker_cancel.cancel();
        if let Some(task) = self.ticker_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "flush ticker join failed");
            }
        }

        self.inner.flush_all_regions().await;
        self.inner.cancel.cancel();
        info!("file batcher stopped");
    }
}

impl Inner {
    fn stage_path(&self, region: &str) -> PathBuf {
        self.cfg.base_dir.join(format!("emf_{region}.ndjson"))
    }

    fn gauge(&self, region: &str) -> RegionGauge {
        self.gauges
            .lock()
            .unwrap()
            .get(region)
            .copied()
            .unwrap_or_default()
    }

    fn would_overflow(&self, staged: &RegionGauge, record_size: u64) -> bool {
        (self.cfg.max_count > 0 && staged.count + 1 > self.cfg.max_count)
            || (self.cfg.max_bytes > 0 && staged.bytes + record_size > self.cfg.max_bytes)
    }

    fn cap_reached(&self, staged: &RegionGauge) -> bool {
        (self.cfg.max_count > 0 && staged.count >= self.cfg.max_count)
            || (self.cfg.max_bytes > 0 && staged.bytes >= self.cfg.max_bytes)
    }

    async fn append(&self, region: &str, payload: &[u8]) -> Result<()> {
        let path = self.stage_path(region);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(payload).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    /// Snapshots the known regions and flushes each in parallel, waiting
    /// for all to complete.
    async fn flush_all_regions(self: &Arc<Self>) {
        let regions: Vec<String> = {
            let gauges = self.gauges.lock().unwrap();
            gauges.keys().cloned().collect()
        };

        let mut tasks = JoinSet::new();
        for region in regions {
            let inner = Arc::clone(self);
            tasks.spawn(async move {
                inner.flush_region(&region).await;
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Reads the region's stage file, submits its records, truncates the
    /// file, and resets the counters. Malformed lines are skipped; flush
    /// and truncate failures are logged, never propagated.
    async fn flush_region(&self, region: &str) {
        if self.cancel.is_cancelled() {
            return;
        }

        let path = self.stage_path(region);
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                error!(region, error = %e, "cannot open stage file for flush");
                return;
            }
        };

        let mut batch: Vec<EmfRecord> = Vec::new();
        let mut lines = BufReader::new(file).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.is_empty() {
                        continue;
                    }
                    match emf::extract_timestamp_ms(line.as_bytes()) {
                        Some(timestamp_ms) => batch.push(EmfRecord {
                            payload: line.into_bytes(),
                            timestamp_ms,
                        }),
                        None => warn!(region, "skipping malformed stage line"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(region, error = %e, "error reading stage file");
                    break;
                }
            }
        }

        if !batch.is_empty() {
            debug!(region, batch_size = batch.len(), "flushing stage file");
            if let Err(e) = self.flusher.flush(region, &batch).await {
                warn!(region, error = %e, "stage flush failed");
            }
        }

        if let Err(e) = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .await
        {
            error!(region, error = %e, "failed to truncate stage file");
        }

        let mut gauges = self.gauges.lock().unwrap();
        let gauge = gauges.entry(region.to_string()).or_default();
        gauge.count = 0;
        gauge.bytes = 0;
    }
}
