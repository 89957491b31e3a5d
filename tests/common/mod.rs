//! In-memory collaborators with failure injection.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use callrec::adapters::{
    ArtifactStore, ArtifactWrite, CallStore, EgressPlatform, EgressRequest, ObjectStore,
    PutReceipt,
};
use callrec::config::{BatchConfig, Credentials, ShutdownConfig, StorageConfig};
use callrec::core::{EgressTimings, RecorderServices, RetryPolicy, SessionSettings};
use callrec::domain::{
    Artifact, CallEvent, EgressFile, EgressInfo, RemoteEgressStatus, StorageLocation,
};

pub const BUCKET: &str = "test-bucket";

/// Retry policy with millisecond backoff
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_multiplier: 2.0,
        attempt_timeout_ms: 200,
    }
}

pub fn storage_config() -> StorageConfig {
    StorageConfig::new(
        BUCKET,
        Credentials {
            access_key_id: "AKIATEST".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: None,
        },
    )
}

/// Settings with a long batch interval so only size and shutdown trigger flushes
pub fn settings(batch_size: usize) -> SessionSettings {
    SessionSettings {
        batch: BatchConfig {
            size: batch_size,
            interval_ms: 60_000,
        },
        retry: fast_retry(2),
        shutdown: ShutdownConfig {
            deadline_ms: 3_000,
            drain_timeout_ms: 1_000,
            upload_timeout_ms: 1_000,
            egress_stop_timeout_ms: 1_000,
            bookkeeping_timeout_ms: 500,
        },
        prefix: "recordings/".to_string(),
        storage: Some(storage_config()),
        egress: EgressTimings {
            poll_interval: std::time::Duration::from_millis(10),
            confirm_timeout: std::time::Duration::from_millis(500),
        },
        artifacts_enabled: true,
        dedupe_consecutive: true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Ok,
    /// Reject the write
    Fail,
    /// Persist the rows, then report an error (lost acknowledgement)
    FailAfterCommit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRow {
    pub room: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Relational store fake
pub struct MemoryStore {
    pub rows: Mutex<BTreeMap<(String, u64), CallEvent>>,
    /// Sequences of every accepted write call, in order
    pub batches: Mutex<Vec<Vec<u64>>>,
    pub write_attempts: AtomicUsize,
    pub calls: Mutex<HashMap<String, CallRow>>,
    pub artifacts: Mutex<Vec<Artifact>>,
    pub has_artifact_table: bool,
    mode: Mutex<WriteMode>,
    /// Failures left before the mode falls back to `Ok`
    failures_left: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_artifact_table(true))
    }

    pub fn without_artifact_table() -> Arc<Self> {
        Arc::new(Self::with_artifact_table(false))
    }

    fn with_artifact_table(has_artifact_table: bool) -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            batches: Mutex::new(Vec::new()),
            write_attempts: AtomicUsize::new(0),
            calls: Mutex::new(HashMap::new()),
            artifacts: Mutex::new(Vec::new()),
            has_artifact_table,
            mode: Mutex::new(WriteMode::Ok),
            failures_left: AtomicU32::new(0),
        }
    }

    /// Fail the next `count` writes with `mode`
    pub fn fail_next(&self, mode: WriteMode, count: u32) {
        *self.mode.lock().unwrap() = mode;
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn fail_always(&self) {
        self.fail_next(WriteMode::Fail, u32::MAX);
    }

    pub fn heal(&self) {
        self.fail_next(WriteMode::Ok, 0);
    }

    pub fn sequences(&self, call_id: &str) -> Vec<u64> {
        self.rows
            .lock()
            .unwrap()
            .keys()
            .filter(|(id, _)| id == call_id)
            .map(|(_, seq)| *seq)
            .collect()
    }

    pub fn texts(&self, call_id: &str) -> Vec<String> {
        self.rows
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.call_id == call_id)
            .map(|e| e.text.clone())
            .collect()
    }

    pub fn call(&self, call_id: &str) -> Option<CallRow> {
        self.calls.lock().unwrap().get(call_id).cloned()
    }

    fn current_failure(&self) -> WriteMode {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left == 0 {
            return WriteMode::Ok;
        }
        if left != u32::MAX {
            self.failures_left.store(left - 1, Ordering::SeqCst);
        }
        *self.mode.lock().unwrap()
    }

    fn insert(&self, events: &[CallEvent]) -> usize {
        let mut rows = self.rows.lock().unwrap();
        let mut inserted = 0;
        for event in events {
            let key = (event.call_id.clone(), event.sequence);
            if !rows.contains_key(&key) {
                rows.insert(key, event.clone());
                inserted += 1;
            }
        }
        inserted
    }
}

#[async_trait]
impl CallStore for MemoryStore {
    async fn open_call(&self, call_id: &str, room: &str, started_at: DateTime<Utc>) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .entry(call_id.to_string())
            .or_insert_with(|| CallRow {
                room: room.to_string(),
                started_at,
                ended_at: None,
            });
        Ok(())
    }

    async fn write_events(&self, events: &[CallEvent]) -> Result<usize> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        match self.current_failure() {
            WriteMode::Ok => {
                let inserted = self.insert(events);
                self.batches
                    .lock()
                    .unwrap()
                    .push(events.iter().map(|e| e.sequence).collect());
                Ok(inserted)
            }
            WriteMode::Fail => bail!("database is locked"),
            WriteMode::FailAfterCommit => {
                self.insert(events);
                bail!("connection reset after commit")
            }
        }
    }

    async fn close_call(&self, call_id: &str, ended_at: DateTime<Utc>) -> Result<()> {
        if let Some(row) = self.calls.lock().unwrap().get_mut(call_id) {
            row.ended_at.get_or_insert(ended_at);
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn record_artifact(&self, artifact: &Artifact) -> Result<ArtifactWrite> {
        if !self.has_artifact_table {
            return Ok(ArtifactWrite::SchemaMissing);
        }

        let mut artifacts = self.artifacts.lock().unwrap();
        if artifacts
            .iter()
            .any(|a| a.natural_key() == artifact.natural_key())
        {
            return Ok(ArtifactWrite::AlreadyPresent);
        }
        artifacts.push(artifact.clone());
        Ok(ArtifactWrite::Inserted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    Ok,
    /// Connection refused
    Fail,
    /// Never answers
    Hang,
    /// Confirms fewer bytes than sent
    Truncate,
}

/// Object store fake
pub struct MemoryObjects {
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
    pub puts: AtomicUsize,
    mode: Mutex<PutMode>,
}

impl MemoryObjects {
    pub fn new() -> Arc<Self> {
        Self::with_mode(PutMode::Ok)
    }

    pub fn with_mode(mode: PutMode) -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            puts: AtomicUsize::new(0),
            mode: Mutex::new(mode),
        })
    }

    pub fn set_mode(&self, mode: PutMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn body(&self, key: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|b| String::from_utf8(b.clone()).unwrap())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjects {
    fn location(&self, key: &str) -> StorageLocation {
        StorageLocation::new(BUCKET, key)
    }

    async fn put_object(&self, key: &str, body: Vec<u8>, _content_type: &str) -> Result<PutReceipt> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();
        match mode {
            PutMode::Ok => {
                let size_bytes = body.len() as u64;
                self.objects.lock().unwrap().insert(key.to_string(), body);
                Ok(PutReceipt {
                    etag: Some(format!("etag-{}", size_bytes)),
                    size_bytes,
                })
            }
            PutMode::Fail => bail!("connection refused"),
            PutMode::Hang => std::future::pending().await,
            PutMode::Truncate => Ok(PutReceipt {
                etag: None,
                size_bytes: (body.len() / 2) as u64,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressBehavior {
    /// Completes after this many status polls
    CompleteAfter(u32),
    /// Reports failure once stopped
    FailOnStop,
    /// Never reaches a terminal status
    NeverEnds,
    /// Rejects the start request
    RejectStart,
}

/// Media platform fake
pub struct FakeEgress {
    pub starts: Mutex<Vec<EgressRequest>>,
    pub stops: AtomicUsize,
    pub polls: AtomicU32,
    behavior: EgressBehavior,
    start_delay: Duration,
    reported_location: Mutex<Option<String>>,
}

impl FakeEgress {
    pub fn new(behavior: EgressBehavior) -> Arc<Self> {
        Self::with_start_delay(behavior, Duration::ZERO)
    }

    /// Start requests are accepted, then answered after `delay`
    pub fn with_start_delay(behavior: EgressBehavior, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            starts: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            polls: AtomicU32::new(0),
            behavior,
            start_delay: delay,
            reported_location: Mutex::new(None),
        })
    }

    /// Report this file location instead of the requested one
    pub fn report_location(&self, uri: &str) {
        *self.reported_location.lock().unwrap() = Some(uri.to_string());
    }

    pub fn start_count(&self) -> usize {
        self.starts.lock().unwrap().len()
    }

    fn info(&self, status: RemoteEgressStatus) -> EgressInfo {
        let reported = self.reported_location.lock().unwrap().clone();
        let location = reported.or_else(|| {
            self.starts
                .lock()
                .unwrap()
                .first()
                .map(|r| format!("s3://{}/{}", r.output.bucket, r.output.key))
        });
        EgressInfo {
            egress_id: "EG_test".to_string(),
            status,
            file: Some(EgressFile {
                location,
                size_bytes: status.is_success().then_some(4096),
            }),
            error: (status == RemoteEgressStatus::Failed).then(|| "encoder crashed".to_string()),
        }
    }
}

#[async_trait]
impl EgressPlatform for FakeEgress {
    async fn start_audio_egress(&self, request: &EgressRequest) -> Result<EgressInfo> {
        if self.behavior == EgressBehavior::RejectStart {
            bail!("twirp error permission_denied");
        }
        self.starts.lock().unwrap().push(request.clone());
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        Ok(self.info(RemoteEgressStatus::Starting))
    }

    async fn stop_egress(&self, _egress_id: &str) -> Result<EgressInfo> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(self.info(RemoteEgressStatus::Ending))
    }

    async fn get_egress(&self, _egress_id: &str) -> Result<EgressInfo> {
        let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        let status = match self.behavior {
            EgressBehavior::CompleteAfter(n) if polls >= n => RemoteEgressStatus::Complete,
            EgressBehavior::FailOnStop => RemoteEgressStatus::Failed,
            _ => RemoteEgressStatus::Ending,
        };
        Ok(self.info(status))
    }
}

/// Services wired to the given fakes
pub fn services(
    store: &Arc<MemoryStore>,
    objects: Option<&Arc<MemoryObjects>>,
    egress: Option<&Arc<FakeEgress>>,
) -> RecorderServices {
    RecorderServices {
        calls: Arc::clone(store) as Arc<dyn CallStore>,
        artifacts: Some(Arc::clone(store) as Arc<dyn ArtifactStore>),
        objects: objects.map(|o| Arc::clone(o) as Arc<dyn ObjectStore>),
        egress: egress.map(|e| Arc::clone(e) as Arc<dyn EgressPlatform>),
    }
}
