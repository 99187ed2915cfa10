use crate::error::WriteError;
use crate::store::{PointWriter, SeriesPoint};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum BatchCommand {
    Point(SeriesPoint),
    Flush(oneshot::Sender<()>),
}

/// Queue front of the raw-point writer. Writes succeed once the point is queued.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<BatchCommand>,
    stats: Arc<IngestStats>,
}

impl PipelineHandle {
    pub fn new(tx: mpsc::Sender<BatchCommand>, stats: Arc<IngestStats>) -> Self {
        Self { tx, stats }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub async fn enqueue(&self, point: SeriesPoint) -> Result<(), WriteError> {
        let queue_depth = self.stats.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(queue_depth, series = %point.series, "queued point");
        if self.tx.send(BatchCommand::Point(point)).await.is_err() {
            self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
            return Err(WriteError::QueueClosed);
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<(), WriteError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(BatchCommand::Flush(tx))
            .await
            .map_err(|_| WriteError::QueueClosed)?;
        rx.await.map_err(|_| WriteError::QueueClosed)
    }
}

#[async_trait]
impl PointWriter for PipelineHandle {
    async fn write(&self, point: SeriesPoint) -> Result<(), WriteError> {
        self.enqueue(point).await
    }
}

#[derive(Debug)]
pub struct IngestStats {
    pub queue_depth: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub average_flush_micros: AtomicU64,
    pub inflight_flushes: AtomicU64,
    pub dropped_points: AtomicU64,
    pub bus_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            queue_depth: AtomicU64::new(0),
            last_flush_unix_ms: AtomicU64::new(0),
            last_batch_len: AtomicU64::new(0),
            average_flush_micros: AtomicU64::new(0),
            inflight_flushes: AtomicU64::new(0),
            dropped_points: AtomicU64::new(0),
            bus_connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_bus_connected(&self, connected: bool) {
        self.bus_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }
}

/// Drains the queue into `sink`, flushing on batch size, on `flush_interval`,
/// on demand and when every handle has been dropped.
pub fn spawn_worker(
    sink: Arc<dyn PointWriter>,
    mut rx: mpsc::Receiver<BatchCommand>,
    stats: Arc<IngestStats>,
    batch_size: usize,
    flush_interval: Duration,
) -> JoinHandle<()> {
    let batch_size = batch_size.max(1);
    tokio::spawn(async move {
        let mut buffer: Vec<SeriesPoint> = Vec::with_capacity(batch_size);
        let mut ticker = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = flush(sink.as_ref(), &mut buffer, &stats).await {
                        tracing::warn!(error=%err, "flush on interval failed");
                    }
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(BatchCommand::Point(point)) => {
                            stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                            buffer.push(point);
                            if buffer.len() >= batch_size {
                                if let Err(err) = flush(sink.as_ref(), &mut buffer, &stats).await {
                                    tracing::warn!(error=%err, "flush on batch size failed");
                                }
                            }
                        }
                        Some(BatchCommand::Flush(done)) => {
                            if let Err(err) = flush(sink.as_ref(), &mut buffer, &stats).await {
                                tracing::warn!(error=%err, "flush on demand failed");
                            }
                            let _ = done.send(());
                        }
                        None => {
                            if let Err(err) = flush(sink.as_ref(), &mut buffer, &stats).await {
                                tracing::warn!(error=%err, "flush during shutdown failed");
                            }
                            break;
                        }
                    }
                }
            }
        }
        tracing::debug!("point pipeline drained");
    })
}

async fn flush(
    sink: &dyn PointWriter,
    buffer: &mut Vec<SeriesPoint>,
    stats: &IngestStats,
) -> Result<(), WriteError> {
    if buffer.is_empty() {
        return Ok(());
    }

    let started = Instant::now();
    stats.inflight_flushes.fetch_add(1, Ordering::Relaxed);
    let items = std::mem::take(buffer);
    let len = items.len();

    let result = sink.write_batch(items).await;
    stats.inflight_flushes.fetch_sub(1, Ordering::Relaxed);

    match result {
        Ok(written) => {
            stats.last_batch_len.store(len as u64, Ordering::Relaxed);
            let now = Utc::now().timestamp_millis() as u64;
            stats.last_flush_unix_ms.store(now, Ordering::Relaxed);
            let micros = started.elapsed().as_micros() as u64;
            let prev = stats.average_flush_micros.load(Ordering::Relaxed);
            let avg = if prev == 0 {
                micros
            } else {
                (prev + micros) / 2
            };
            stats.average_flush_micros.store(avg, Ordering::Relaxed);
            stats.clear_error();
            tracing::debug!(len, written, micros, "flushed points batch");
            Ok(())
        }
        Err(err) => {
            // Write failures are not retried; the batch is discarded.
            stats.dropped_points.fetch_add(len as u64, Ordering::Relaxed);
            stats.record_error(err.to_string());
            tracing::error!(error=%err, len, "failed to flush points; batch dropped");
            Err(err)
        }
    }
}
