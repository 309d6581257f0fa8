pub mod file;

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default capacity of a batch processor's input channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// Thresholds and timing for a [`BatchProcessor`].
///
/// A zero `max_count` or `max_bytes` disables that threshold; a zero
/// `flush_interval` disables time-based flushing.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_count: usize,
    pub max_bytes: usize,
    pub flush_interval: Duration,
    pub channel_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_count: 0,
            max_bytes: 0,
            flush_interval: Duration::ZERO,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Per-instance behavior of a batch processor: how to convert an input item
/// into an output record, how to size a record against the byte threshold,
/// and how to deliver an accumulated batch.
///
/// The consumer task owns the handler, so `map` and `flush` take `&mut self`
/// and need no internal locking.
pub trait BatchHandler: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Converts one input item. An error skips the item; the batch
    /// continues.
    fn map(&mut self, item: Self::Input) -> Result<Self::Output>;

    /// Size of one record as charged against `max_bytes`.
    fn size(&self, record: &Self::Output) -> usize;

    /// Delivers one accumulated batch. The buffer is considered delivered
    /// regardless of the result; errors are logged, never retried here.
    fn flush(&mut self, batch: &[Self::Output]) -> impl Future<Output = Result<()>> + Send;

    /// Runs with the flushed records after `flush` returns.
    fn after_flush(&mut self, _flushed: &[Self::Output]) {}
}

/// Channel-driven batch accumulator.
///
/// A single consumer task maps incoming items, accumulates the results, and
/// flushes when the count or byte threshold trips, when the flush interval
/// elapses, or on termination. Closing the input channel is the normal
/// termination; cancelling the token is abrupt, with one best-effort final
/// flush either way.
pub struct BatchProcessor<I> {
    tx: Option<mpsc::Sender<I>>,
    task: Option<JoinHandle<()>>,
}

impl<I: Send + 'static> BatchProcessor<I> {
    /// Starts the consumer task and returns the processor handle.
    pub fn spawn<H>(cfg: BatchConfig, cancel: CancellationToken, handler: H) -> Self
    where
        H: BatchHandler<Input = I>,
    {
        let (tx, rx) = mpsc::channel(cfg.channel_capacity.max(1));
        let task = tokio::spawn(run(cfg, cancel, handler, rx));

        Self {
            tx: Some(tx),
            task: Some(task),
        }
    }

    /// Enqueues one item, blocking while the input channel is full.
    pub async fn add(&self, item: I) -> Result<()> {
        let Some(tx) = &self.tx else {
            anyhow::bail!("batch processor input channel closed");
        };
        tx.send(item)
            .await
            .map_err(|_| anyhow::anyhow!("batch processor consumer exited"))
    }

    /// Returns a clone of the input channel sender.
    ///
    /// Every clone keeps the channel open; all clones must be dropped
    /// before [`BatchProcessor::wait`] can observe channel close.
    pub fn sender(&self) -> Option<mpsc::Sender<I>> {
        self.tx.clone()
    }

    /// Closes this handle's sender and blocks until the consumer has
    /// performed its final flush and exited.
    pub async fn wait(mut self) {
        self.tx.take();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "batch processor task join failed");
            }
        }
    }
}

async fn run<H>(
    cfg: BatchConfig,
    cancel: CancellationToken,
    mut handler: H,
    mut rx: mpsc::Receiver<H::Input>,
) where
    H: BatchHandler,
{
    let mut buffer: Vec<H::Output> = Vec::new();
    let mut current_bytes = 0usize;

    let mut ticker = (cfg.flush_interval > Duration::ZERO).then(|| {
        let mut t = interval_at(Instant::now() + cfg.flush_interval, cfg.flush_interval);
        t.set_missed_tick_behavior(MissedTickBehavior::Skip);
        t
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("batch processor cancelled, flushing buffer");
                flush_once(&mut handler, &mut buffer, &mut current_bytes).await;
                return;
            }

            item = rx.recv() => {
                let Some(item) = item else {
                    debug!("input channel closed, flushing buffer");
                    flush_once(&mut handler, &mut buffer, &mut current_bytes).await;
                    return;
                };

                let record = match handler.map(item) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(error = %e, "dropping item that failed to map");
                        continue;
                    }
                };

                let size = handler.size(&record);
                if cfg.max_bytes > 0 && current_bytes + size > cfg.max_bytes {
                    debug!(current_bytes, size, "byte threshold reached, flushing buffer");
                    flush_once(&mut handler, &mut buffer, &mut current_bytes).await;
                }

                buffer.push(record);
                current_bytes += size;

                if cfg.max_count > 0 && buffer.len() >= cfg.max_count {
                    debug!(batch_size = buffer.len(), "count threshold reached, flushing buffer");
                    flush_once(&mut handler, &mut buffer, &mut current_bytes).await;
                }
            }

            _ = tick(ticker.as_mut()) => {
                flush_once(&mut handler, &mut buffer, &mut current_bytes).await;
            }
        }
    }
}

async fn tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Flushes the buffer and resets state. The buffer is empty afterwards
/// whether or not delivery succeeded.
async fn flush_once<H: BatchHandler>(
    handler: &mut H,
    buffer: &mut Vec<H::Output>,
    current_bytes: &mut usize,
) {
    if buffer.is_empty() {
        return;
    }

    if let Err(e) = handler.flush(buffer.as_slice()).await {
        warn!(error = %e, batch_size = buffer.len(), "batch flush failed");
    }

    handler.after_flush(buffer.as_slice());
    buffer.clear();
    *current_bytes = 0;
}
