use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::batch::{BatchConfig, BatchHandler, BatchProcessor};
use crate::emf::{self, EmfRecord, EVENT_OVERHEAD_BYTES};
use crate::metric::Metric;
use crate::sink::flush::Flusher;

/// Batch handler that serialises job metrics to EMF and flushes them
/// through the primitive bound to one region.
struct EmfMetricHandler {
    namespace: Arc<str>,
    region: String,
    flusher: Arc<Flusher>,
}

impl BatchHandler for EmfMetricHandler {
    type Input = Metric;
    type Output = EmfRecord;

    fn map(&mut self, metric: Metric) -> Result<EmfRecord> {
        emf::from_metric(&metric, &self.namespace)
    }

    fn size(&self, record: &EmfRecord) -> usize {
        record.payload.len() + EVENT_OVERHEAD_BYTES
    }

    fn flush(&mut self, batch: &[EmfRecord]) -> impl Future<Output = Result<()>> + Send {
        async move {
            self.flusher.flush(&self.region, batch).await?;
            Ok(())
        }
    }
}

/// Per-region in-memory metric batchers plus the channel map that feeds
/// them.
///
/// One [`BatchProcessor`] per configured region consumes that region's
/// channel; the job manager looks senders up in [`MetricPipeline::channels`]
/// and dispatches into them. Built fresh for each quota tick.
pub struct MetricPipeline {
    channels: Arc<crate::region::RegionMap<mpsc::Sender<Metric>>>,
    batchers: Vec<(String, BatchProcessor<Metric>)>,
}

impl MetricPipeline {
    /// Constructs one metric batcher and channel per region.
    pub fn build(
        regions: &[String],
        namespace: &str,
        flusher: Arc<Flusher>,
        cfg: BatchConfig,
        cancel: CancellationToken,
    ) -> Self {
        let namespace: Arc<str> = Arc::from(namespace);
        let channels = Arc::new(crate::region::RegionMap::new());
        let mut batchers = Vec::with_capacity(regions.len());

        for region in regions {
            let handler = EmfMetricHandler {
                namespace: Arc::clone(&namespace),
                region: region.clone(),
                flusher: Arc::clone(&flusher),
            };

            let batcher = BatchProcessor::spawn(cfg.clone(), cancel.child_token(), handler);
            if let Some(sender) = batcher.sender() {
                channels.insert(region.clone(), sender);
            }
            batchers.push((region.clone(), batcher));

            debug!(region = %region, "metric batcher started");
        }

        Self { channels, batchers }
    }

    /// The region → channel map the job manager dispatches into.
    pub fn channels(&self) -> Arc<crate::region::RegionMap<mpsc::Sender<Metric>>> {
        Arc::clone(&self.channels)
    }

    /// Closes every region channel and waits for each batcher's final
    /// flush.
    ///
    /// All other holders of the channel map (the job manager) must be done
    /// before this is called, otherwise their sender clones keep the
    /// channels open.
    pub async fn drain(self) {
        // Drop the map so the batchers' input channels can close.
        for region in self.channels.regions() {
            self.channels.remove(&region);
        }
        drop(self.channels);

        for (region, batcher) in self.batchers {
            debug!(region = %region, "draining metric batcher");
            batcher.wait().await;
        }

        info!("metric batchers drained in all regions");
    }
}
