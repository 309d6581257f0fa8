pub mod catalog;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metric::Metric;
use crate::region::RegionMap;

/// How many jobs the queue buffers before `add_job` blocks.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// One unit of metric-collecting work, identified by name and region.
///
/// Jobs are stateless between invocations and run at most once per tick.
/// `execute` receives a cancellation token derived from the manager's
/// parent; the job is responsible for respecting it.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;
    fn region(&self) -> &str;
    async fn execute(&self, cancel: CancellationToken) -> Result<Vec<Metric>>;
}

/// Sizing for a [`JobManager`].
#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    pub worker_count: usize,
    pub job_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::config::DEFAULT_WORKER_COUNT,
            job_timeout: crate::config::DEFAULT_JOB_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Fixed-size worker pool that executes jobs with per-job deadlines and
/// dispatches the produced metrics into per-region channels.
///
/// Exactly `worker_count` workers are started at construction; the pool
/// never grows. Job errors and timeouts are logged and absorbed, so one
/// slow or failing job never takes down the tick.
pub struct JobManager {
    cancel: CancellationToken,
    tx: Option<mpsc::Sender<Arc<dyn Job>>>,
    workers: Vec<JoinHandle<()>>,
}

impl JobManager {
    pub fn new(
        cfg: JobManagerConfig,
        channels: Arc<RegionMap<mpsc::Sender<Metric>>>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Arc<dyn Job>>(cfg.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        info!(workers = cfg.worker_count, "starting job workers");

        let workers = (0..cfg.worker_count)
            .map(|id| {
                let rx = Arc::clone(&rx);
                let channels = Arc::clone(&channels);
                let cancel = cancel.clone();
                tokio::spawn(worker(id, cfg.job_timeout, rx, channels, cancel))
            })
            .collect();

        Self {
            cancel,
            tx: Some(tx),
            workers,
        }
    }

    /// Enqueues a job, blocking while the queue is full. If the parent
    /// context is already cancelled the job is dropped instead.
    pub async fn add_job(&self, job: Arc<dyn Job>) {
        if self.cancel.is_cancelled() {
            debug!(
                job = job.name(),
                region = job.region(),
                "parent context cancelled, dropping job",
            );
            return;
        }

        let Some(tx) = &self.tx else {
            warn!(job = job.name(), "job queue already closed, dropping job");
            return;
        };

        if tx.send(job).await.is_err() {
            warn!("job queue consumer gone, dropping job");
        }
    }

    /// Closes the queue and blocks until every worker has exited. Workers
    /// finish their current job, bounded by the per-job timeout.
    pub async fn wait(mut self) {
        self.tx.take();
        info!("waiting for job workers to finish");
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                warn!(error = %e, "job worker join failed");
            }
        }
        info!("all job workers exited");
    }
}

async fn worker(
    id: usize,
    job_timeout: Duration,
    rx: Arc<Mutex<mpsc::Receiver<Arc<dyn Job>>>>,
    channels: Arc<RegionMap<mpsc::Sender<Metric>>>,
    cancel: CancellationToken,
) {
    debug!(worker = id, "job worker started");

    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(worker = id, "job worker shutting down (cancelled)");
                    return;
                }
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => {
                        debug!(worker = id, "job worker shutting down (queue closed)");
                        return;
                    }
                },
            }
        };

        debug!(worker = id, job = job.name(), region = job.region(), "executing job");

        let metrics =
            match tokio::time::timeout(job_timeout, job.execute(cancel.child_token())).await {
                Err(_) => {
                    warn!(
                        worker = id,
                        job = job.name(),
                        region = job.region(),
                        timeout = ?job_timeout,
                        "job timed out",
                    );
                    continue;
                }
                Ok(Err(e)) => {
                    warn!(
                        worker = id,
                        job = job.name(),
                        region = job.region(),
                        error = %e,
                        "job failed",
                    );
                    continue;
                }
                Ok(Ok(metrics)) => metrics,
            };

        debug!(
            worker = id,
            job = job.name(),
            metrics = metrics.len(),
            "job produced metrics",
        );

        for metric in metrics {
            if cancel.is_cancelled() {
                debug!(worker = id, "interrupted before dispatching all metrics");
                return;
            }

            let Some(channel) = channels.load(job.region()) else {
                error!(region = job.region(), "no metric channel for region");
                continue;
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(worker = id, "interrupted while dispatching metric");
                    return;
                }
                sent = channel.send(metric) => {
                    if sent.is_err() {
                        warn!(region = job.region(), "metric channel closed, dropping metric");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::metric::Unit;

    struct FakeJob {
        name: String,
        region: String,
        metrics: Vec<Metric>,
        delay: Duration,
        fail: bool,
        executions: Arc<AtomicUsize>,
    }

    impl FakeJob {
        fn new(name: &str, region: &str, count: usize) -> Self {
            let metrics = (0..count)
                .map(|i| Metric::new(format!("m{i}"), i as f64, Unit::Count))
                .collect();
            Self {
                name: name.to_string(),
                region: region.to_string(),
                metrics,
                delay: Duration::ZERO,
                fail: false,
                executions: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Job for FakeJob {
        fn name(&self) -> &str {
            &self.name
        }

        fn region(&self) -> &str {
            &self.region
        }

        async fn execute(&self, _cancel: CancellationToken) -> Result<Vec<Metric>> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            if self.delay > Duration::ZERO {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                anyhow::bail!("job exploded");
            }
            Ok(self.metrics.clone())
        }
    }

    fn channel_map(regions: &[&str]) -> (Arc<RegionMap<mpsc::Sender<Metric>>>, Vec<mpsc::Receiver<Metric>>) {
        let map = Arc::new(RegionMap::new());
        let mut receivers = Vec::new();
        for region in regions {
            let (tx, rx) = mpsc::channel(16);
            map.insert(*region, tx);
            receivers.push(rx);
        }
        (map, receivers)
    }

    #[tokio::test]
    async fn test_happy_path_delivers_metric() {
        let (channels, mut receivers) = channel_map(&["r1"]);
        let manager = JobManager::new(
            JobManagerConfig {
                worker_count: 2,
                job_timeout: Duration::from_millis(500),
                queue_capacity: DEFAULT_QUEUE_CAPACITY,
            },
            Arc::clone(&channels),
            CancellationToken::new(),
        );

        manager.add_job(Arc::new(FakeJob::new("quota", "r1", 1))).await;
        manager.wait().await;

        let mut rx = receivers.remove(0);
        let metric = rx.try_recv().expect("one metric delivered");
        assert_eq!(metric.name, "m0");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_dispatch() {
        let (channels, mut receivers) = channel_map(&["r1"]);
        let cancel = CancellationToken::new();
        let manager = JobManager::new(
            JobManagerConfig {
                worker_count: 1,
                job_timeout: Duration::from_millis(500),
                queue_capacity: DEFAULT_QUEUE_CAPACITY,
            },
            Arc::clone(&channels),
            cancel.clone(),
        );

        let mut job = FakeJob::new("slow", "r1", 2);
        job.delay = Duration::from_millis(50);
        manager.add_job(Arc::new(job)).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        manager.wait().await;

        let mut rx = receivers.remove(0);
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert!(received <= 1, "received {received} metrics after cancel");
    }

    #[tokio::test]
    async fn test_job_error_does_not_stop_others() {
        let (channels, mut receivers) = channel_map(&["r1"]);
        let manager = JobManager::new(
            JobManagerConfig {
                worker_count: 1,
                job_timeout: Duration::from_millis(500),
                queue_capacity: DEFAULT_QUEUE_CAPACITY,
            },
            Arc::clone(&channels),
            CancellationToken::new(),
        );

        let mut failing = FakeJob::new("bad", "r1", 1);
        failing.fail = true;
        manager.add_job(Arc::new(failing)).await;
        manager.add_job(Arc::new(FakeJob::new("good", "r1", 1))).await;
        manager.wait().await;

        let mut rx = receivers.remove(0);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_job_timeout_is_absorbed() {
        let (channels, mut receivers) = channel_map(&["r1"]);
        let manager = JobManager::new(
            JobManagerConfig {
                worker_count: 1,
                job_timeout: Duration::from_millis(20),
                queue_capacity: DEFAULT_QUEUE_CAPACITY,
            },
            Arc::clone(&channels),
            CancellationToken::new(),
        );

        let mut stuck = FakeJob::new("stuck", "r1", 1);
        stuck.delay = Duration::from_millis(200);
        manager.add_job(Arc::new(stuck)).await;
        manager.add_job(Arc::new(FakeJob::new("fast", "r1", 1))).await;
        manager.wait().await;

        // Only the fast job's metric arrives.
        let mut rx = receivers.remove(0);
        let metric = rx.try_recv().expect("fast job metric");
        assert_eq!(metric.name, "m0");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_region_channel_drops_metric() {
        let (channels, _receivers) = channel_map(&["r1"]);
        let manager = JobManager::new(
            JobManagerConfig {
                worker_count: 2,
                job_timeout: Duration::from_millis(500),
                queue_capacity: DEFAULT_QUEUE_CAPACITY,
            },
            Arc::clone(&channels),
            CancellationToken::new(),
        );

        manager
            .add_job(Arc::new(FakeJob::new("orphan", "nowhere", 1)))
            .await;
        // Wait returns cleanly; the metric was dropped, not wedged.
        manager.wait().await;
    }

    #[tokio::test]
    async fn test_add_job_after_cancel_drops_job() {
        let (channels, _receivers) = channel_map(&["r1"]);
        let cancel = CancellationToken::new();
        let manager = JobManager::new(
            JobManagerConfig::default(),
            Arc::clone(&channels),
            cancel.clone(),
        );

        cancel.cancel();
        let job = FakeJob::new("late", "r1", 1);
        let executions = Arc::clone(&job.executions);
        manager.add_job(Arc::new(job)).await;
        manager.wait().await;

        assert_eq!(executions.load(Ordering::SeqCst), 0);
    }
}
