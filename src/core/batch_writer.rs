//! Batched persistence of buffered events.
//!
//! One writer task per call owns every flush. It wakes on the batch
//! interval, on a size signal from the ingest path, or on shutdown, and
//! writes contiguous batches in sequence order. A batch that cannot be
//! written after all retries goes back to the head of the buffer, and the
//! failure is published on the writer's health channel until a later flush
//! succeeds.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::CallStore;
use crate::config::BatchConfig;

use super::buffer::EventBuffer;
use super::error::{RecorderError, Result};
use super::retry::RetryPolicy;

/// Counters shared between the writer task and its session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    pub batches_written: u64,
    pub events_written: u64,
    /// Flushes that exhausted their retries
    pub failed_flushes: u64,
    pub last_error: Option<String>,
}

/// Moves events from a buffer into the relational store
pub struct BatchWriter {
    buffer: Arc<EventBuffer>,
    store: Arc<dyn CallStore>,
    batch: BatchConfig,
    retry: RetryPolicy,
    stats: Arc<Mutex<WriterStats>>,
}

impl BatchWriter {
    pub fn new(
        buffer: Arc<EventBuffer>,
        store: Arc<dyn CallStore>,
        batch: BatchConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            buffer,
            store,
            batch,
            retry,
            stats: Arc::new(Mutex::new(WriterStats::default())),
        }
    }

    fn batch_size(&self) -> usize {
        self.batch.size.max(1)
    }

    fn update_stats(&self, f: impl FnOnce(&mut WriterStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut stats);
    }

    /// Write the oldest unflushed batch. Returns the number of events written.
    pub async fn flush_once(&self) -> Result<usize> {
        let Some(batch) = self.buffer.take_batch(self.batch_size()) else {
            return Ok(0);
        };

        let store = &self.store;
        let events = batch.events();
        let result = self
            .retry
            .run("batch write", move |_| async move {
                store
                    .write_events(events)
                    .await
                    .map_err(|e| RecorderError::Store(format!("{:#}", e)))
            })
            .await;

        match result {
            Ok(inserted) => {
                let count = batch.len();
                debug!(
                    call_id = %self.buffer.call_id(),
                    first = batch.first_sequence(),
                    last = batch.last_sequence(),
                    inserted,
                    "Batch written"
                );
                batch.commit();
                self.update_stats(|s| {
                    s.batches_written += 1;
                    s.events_written += count as u64;
                });
                Ok(count)
            }
            Err(e) => {
                error!(
                    call_id = %self.buffer.call_id(),
                    first = batch.first_sequence(),
                    count = batch.len(),
                    error = %e,
                    "Batch write failed, events re-queued"
                );
                drop(batch);
                let message = e.to_string();
                self.update_stats(|s| {
                    s.failed_flushes += 1;
                    s.last_error = Some(message);
                });
                Err(e)
            }
        }
    }

    /// Flush at least once, then keep going while a full batch is waiting
    async fn flush_ready(&self) -> Result<usize> {
        let mut written = self.flush_once().await?;
        while self.buffer.unflushed_len() >= self.batch_size() {
            let n = self.flush_once().await?;
            if n == 0 {
                break;
            }
            written += n;
        }
        Ok(written)
    }

    /// Flush until the buffer is empty or a batch fails
    #[instrument(skip(self), fields(call_id = %self.buffer.call_id()))]
    pub async fn drain_all(&self) -> Result<usize> {
        let mut written = 0;
        loop {
            match self.flush_once().await? {
                0 => return Ok(written),
                n => written += n,
            }
        }
    }

    /// Start the writer task
    pub fn spawn(self) -> WriterHandle {
        let notify = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (health_tx, health_rx) = watch::channel(None);
        let stats = Arc::clone(&self.stats);
        let buffer = Arc::clone(&self.buffer);
        let threshold = self.batch_size();

        let task = tokio::spawn(self.run(Arc::clone(&notify), shutdown_rx, health_tx));

        WriterHandle {
            trigger: FlushTrigger {
                buffer,
                threshold,
                notify,
            },
            shutdown_tx,
            health: health_rx,
            stats,
            task: Some(task),
        }
    }

    async fn run(
        self,
        notify: Arc<Notify>,
        mut shutdown_rx: watch::Receiver<bool>,
        health_tx: watch::Sender<Option<String>>,
    ) -> Result<usize> {
        let period = self.batch.interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = notify.notified() => {}
                _ = shutdown_rx.changed() => break,
            }

            if self.buffer.unflushed_len() == 0 {
                continue;
            }
            match self.flush_ready().await {
                Ok(_) => {
                    health_tx.send_if_modified(|last| last.take().is_some());
                }
                // Events stay queued for the next trigger
                Err(e) => {
                    warn!(
                        call_id = %self.buffer.call_id(),
                        unflushed = self.buffer.unflushed_len(),
                        error = %e,
                        "Recorder falling behind, events held in memory"
                    );
                    health_tx.send_replace(Some(e.to_string()));
                }
            }
        }

        let written = self.drain_all().await?;
        info!(call_id = %self.buffer.call_id(), written, "Final flush complete");
        Ok(written)
    }
}

/// Wakes the writer from the ingest path
#[derive(Clone)]
pub struct FlushTrigger {
    buffer: Arc<EventBuffer>,
    threshold: usize,
    notify: Arc<Notify>,
}

impl FlushTrigger {
    /// Wake the writer if a full batch is waiting
    pub fn events_appended(&self) {
        if self.buffer.unflushed_len() >= self.threshold {
            self.notify.notify_one();
        }
    }
}

/// Session-side handle to a running writer task
pub struct WriterHandle {
    trigger: FlushTrigger,
    shutdown_tx: watch::Sender<bool>,
    health: watch::Receiver<Option<String>>,
    stats: Arc<Mutex<WriterStats>>,
    task: Option<JoinHandle<Result<usize>>>,
}

impl WriterHandle {
    pub fn trigger(&self) -> FlushTrigger {
        self.trigger.clone()
    }

    pub fn stats(&self) -> WriterStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Error of the latest failed background flush, cleared by the next
    /// successful one
    pub fn health(&self) -> watch::Receiver<Option<String>> {
        self.health.clone()
    }

    /// Ask the task to flush what is left and wait for it.
    ///
    /// Returns the number of events written by the final flush. The task is
    /// aborted if it does not finish within `timeout`; its in-flight batch
    /// returns to the buffer.
    pub async fn finish(&mut self, timeout: std::time::Duration) -> Result<usize> {
        let _ = self.shutdown_tx.send(true);

        let Some(mut task) = self.task.take() else {
            return Ok(0);
        };

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(RecorderError::Store(format!(
                "writer task ended abnormally: {}",
                join_error
            ))),
            Err(_) => {
                task.abort();
                let _ = task.await;
                Err(RecorderError::Timeout {
                    operation: "final flush".to_string(),
                    after: timeout,
                })
            }
        }
    }
}

impl Drop for WriterHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CallEvent, PendingEvent, Role};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingStore {
        batches: Mutex<Vec<Vec<u64>>>,
    }

    #[async_trait]
    impl CallStore for RecordingStore {
        async fn open_call(&self, _: &str, _: &str, _: DateTime<Utc>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn write_events(&self, events: &[CallEvent]) -> anyhow::Result<usize> {
            self.batches
                .lock()
                .unwrap()
                .push(events.iter().map(|e| e.sequence).collect());
            Ok(events.len())
        }

        async fn close_call(&self, _: &str, _: DateTime<Utc>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn writer(size: usize, store: Arc<RecordingStore>) -> (Arc<EventBuffer>, BatchWriter) {
        let buffer = Arc::new(EventBuffer::new("call-1", "room"));
        let writer = BatchWriter::new(
            Arc::clone(&buffer),
            store,
            BatchConfig {
                size,
                interval_ms: 60_000,
            },
            RetryPolicy::default(),
        );
        (buffer, writer)
    }

    #[tokio::test]
    async fn test_drain_all_writes_bounded_batches_in_order() {
        let store = Arc::new(RecordingStore::default());
        let (buffer, writer) = writer(2, Arc::clone(&store));
        for i in 0..5 {
            buffer.append(PendingEvent::new(Role::User, i.to_string())).unwrap();
        }

        assert_eq!(writer.drain_all().await.unwrap(), 5);
        assert_eq!(
            *store.batches.lock().unwrap(),
            vec![vec![0, 1], vec![2, 3], vec![4]]
        );
        assert_eq!(writer.stats.lock().unwrap().batches_written, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_flushes_partial_batch() {
        let store = Arc::new(RecordingStore::default());
        let (buffer, writer) = writer(10, Arc::clone(&store));
        let mut handle = writer.spawn();

        buffer.append(PendingEvent::new(Role::Agent, "hello")).unwrap();
        handle.trigger().events_appended();
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(*store.batches.lock().unwrap(), vec![vec![0]]);
        assert_eq!(handle.finish(Duration::from_secs(1)).await.unwrap(), 0);
    }

    struct FailingStore;

    #[async_trait]
    impl CallStore for FailingStore {
        async fn open_call(&self, _: &str, _: &str, _: DateTime<Utc>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn write_events(&self, _: &[CallEvent]) -> anyhow::Result<usize> {
            anyhow::bail!("database is locked")
        }

        async fn close_call(&self, _: &str, _: DateTime<Utc>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_failure_is_published_on_health() {
        let buffer = Arc::new(EventBuffer::new("call-1", "room"));
        let writer = BatchWriter::new(
            Arc::clone(&buffer),
            Arc::new(FailingStore),
            BatchConfig {
                size: 1,
                interval_ms: 60_000,
            },
            RetryPolicy {
                max_attempts: 2,
                initial_delay_ms: 1,
                max_delay_ms: 1,
                backoff_multiplier: 1.0,
                attempt_timeout_ms: 100,
            },
        );
        let handle = writer.spawn();
        let mut health = handle.health();
        assert!(health.borrow().is_none());

        buffer.append(PendingEvent::new(Role::User, "hi")).unwrap();
        handle.trigger().events_appended();

        health.changed().await.unwrap();
        let error = health.borrow().clone().unwrap();
        assert!(error.contains("database is locked"));
        assert_eq!(buffer.unflushed_len(), 1);
    }

    #[tokio::test]
    async fn test_finish_flushes_remaining_events() {
        let store = Arc::new(RecordingStore::default());
        let (buffer, writer) = writer(50, Arc::clone(&store));
        let mut handle = writer.spawn();

        buffer.append(PendingEvent::new(Role::User, "a")).unwrap();
        buffer.append(PendingEvent::new(Role::User, "b")).unwrap();

        assert_eq!(handle.finish(Duration::from_secs(5)).await.unwrap(), 2);
        assert_eq!(buffer.unflushed_len(), 0);
        assert_eq!(handle.stats().events_written, 2);
    }
}
