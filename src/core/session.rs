//! Recording session for one call.
//!
//! A session moves through `active → draining → finalizing → closed` and
//! never skips a state. Shutdown always reaches `closed`: every step runs
//! under its own sub-deadline, clipped to the overall deadline, and a step
//! that overruns is abandoned and reported as timed out.
//!
//! Starting a session does no I/O on the caller's task. The call row and the
//! audio egress request run on their own tasks, which shutdown joins (or
//! abandons) under the matching sub-deadlines.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn, Instrument};

use crate::adapters::{ArtifactStore, CallStore, EgressPlatform, ObjectStore};
use crate::config::{BatchConfig, RecorderConfig, ShutdownConfig, StorageConfig};
use crate::domain::{Artifact, PendingEvent, Role, TranscriptEvent};

use super::archiver::TranscriptArchiver;
use super::artifact_recorder::{ArtifactRecorder, RecordOutcome, SkipReason};
use super::batch_writer::{BatchWriter, FlushTrigger, WriterHandle, WriterStats};
use super::buffer::EventBuffer;
use super::egress::{AudioEgressController, EgressState, EgressStop, EgressTimings};
use super::error::{RecorderError, Result};
use super::retry::RetryPolicy;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Draining,
    Finalizing,
    Closed,
}

impl SessionState {
    fn next(self) -> Option<SessionState> {
        match self {
            Self::Active => Some(Self::Draining),
            Self::Draining => Some(Self::Finalizing),
            Self::Finalizing => Some(Self::Closed),
            Self::Closed => None,
        }
    }
}

/// Result of one shutdown step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Skipped { reason: String },
    Failed { error: String },
    TimedOut { after_ms: u64 },
}

impl StepOutcome {
    fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    fn failed(error: impl std::fmt::Display) -> Self {
        Self::Failed {
            error: error.to_string(),
        }
    }

    fn timed_out(after: Duration) -> Self {
        Self::TimedOut {
            after_ms: after.as_millis() as u64,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped { .. })
    }
}

/// Artifact produced during finalizing and what happened to its row
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactReport {
    pub artifact: Artifact,
    pub record: StepOutcome,
}

/// Structured report of a finished shutdown
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownOutcome {
    pub call_id: String,
    pub final_state: SessionState,
    /// States entered after `active`, in order
    pub transitions: Vec<SessionState>,
    pub events_recorded: usize,
    /// Events that never reached the relational store
    pub events_unflushed: usize,
    pub drain: StepOutcome,
    pub transcript_upload: StepOutcome,
    pub egress_stop: StepOutcome,
    pub egress_state: EgressState,
    pub artifacts: Vec<ArtifactReport>,
    pub call_close: StepOutcome,
    pub writer: WriterStats,
    pub elapsed_ms: u64,
}

impl ShutdownOutcome {
    /// True when no step failed or timed out and nothing was lost
    pub fn is_clean(&self) -> bool {
        self.events_unflushed == 0
            && self.writer.failed_flushes == 0
            && self.drain.is_success()
            && self.transcript_upload.is_success()
            && self.egress_stop.is_success()
            && self.call_close.is_success()
            && self.artifacts.iter().all(|a| a.record.is_success())
    }
}

/// Shared clients, one per process
#[derive(Clone)]
pub struct RecorderServices {
    pub calls: Arc<dyn CallStore>,
    pub artifacts: Option<Arc<dyn ArtifactStore>>,
    pub objects: Option<Arc<dyn ObjectStore>>,
    pub egress: Option<Arc<dyn EgressPlatform>>,
}

/// Per-session tunables
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub batch: BatchConfig,
    pub retry: RetryPolicy,
    pub shutdown: ShutdownConfig,
    /// Key prefix for uploaded objects
    pub prefix: String,
    /// Upload target handed to the media platform
    pub storage: Option<StorageConfig>,
    pub egress: EgressTimings,
    pub artifacts_enabled: bool,
    pub dedupe_consecutive: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            retry: RetryPolicy::default(),
            shutdown: ShutdownConfig::default(),
            prefix: "recordings/".to_string(),
            storage: None,
            egress: EgressTimings::default(),
            artifacts_enabled: true,
            dedupe_consecutive: true,
        }
    }
}

impl From<&RecorderConfig> for SessionSettings {
    fn from(config: &RecorderConfig) -> Self {
        Self {
            batch: config.batch.clone(),
            retry: config.retry.clone(),
            shutdown: config.shutdown.clone(),
            prefix: config
                .storage
                .as_ref()
                .map(|s| s.prefix.clone())
                .unwrap_or_else(|| "recordings/".to_string()),
            storage: config.storage.clone(),
            egress: config
                .egress
                .as_ref()
                .map(EgressTimings::from)
                .unwrap_or_default(),
            artifacts_enabled: config.artifacts_enabled,
            dedupe_consecutive: config.dedupe_consecutive,
        }
    }
}

/// Cheap, cloneable entry point for the call's event stream.
///
/// Appends never wait on I/O.
#[derive(Clone)]
pub struct RecorderHandle {
    buffer: Arc<EventBuffer>,
    trigger: FlushTrigger,
    health: watch::Receiver<Option<String>>,
    last_by_role: Option<Arc<Mutex<HashMap<Role, String>>>>,
}

impl RecorderHandle {
    pub fn call_id(&self) -> &str {
        self.buffer.call_id()
    }

    pub fn is_closed(&self) -> bool {
        self.buffer.is_sealed()
    }

    /// Latest background persistence failure, if the writer is behind
    pub fn persistence_error(&self) -> Option<String> {
        self.health.borrow().clone()
    }

    /// Append an event as-is
    pub fn append(&self, event: PendingEvent) -> Result<u64> {
        let sequence = self.buffer.append(event)?;
        self.trigger.events_appended();
        Ok(sequence)
    }

    /// Record a finalized message.
    ///
    /// Text is trimmed and blank text is dropped. A user or agent message
    /// repeating that role's previous message is dropped too; system notes
    /// are never deduplicated. Dropped text returns `Ok(None)`.
    pub fn record(&self, role: Role, text: &str) -> Result<Option<u64>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        let last_by_role = match self.last_by_role {
            Some(ref last) if role != Role::System => last,
            _ => return self.append(PendingEvent::new(role, text)).map(Some),
        };

        let normalized = normalize(text);
        let mut last = last_by_role.lock().unwrap_or_else(|p| p.into_inner());
        if last.get(&role) == Some(&normalized) {
            debug!(call_id = %self.call_id(), role = %role, "Dropping repeated message");
            return Ok(None);
        }

        let sequence = self.append(PendingEvent::new(role, text))?;
        last.insert(role, normalized);
        Ok(Some(sequence))
    }

    /// Record a speech-to-text or agent event; interim results are ignored
    pub fn on_transcript(&self, event: &TranscriptEvent) -> Result<Option<u64>> {
        if !event.is_final {
            return Ok(None);
        }
        self.record(event.role, &event.text)
    }

    /// Record an operational note (handoff, warning)
    pub fn record_system(&self, text: &str) -> Result<Option<u64>> {
        self.record(Role::System, text)
    }
}

/// Collapse whitespace and lower-case for repeat detection
fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Orchestrates recording for one call
pub struct CallRecorderSession {
    call_id: String,
    room: String,
    state: SessionState,
    started: Instant,
    buffer: Arc<EventBuffer>,
    writer: WriterHandle,
    handle: RecorderHandle,
    archiver: Option<TranscriptArchiver>,
    egress: Arc<AsyncMutex<AudioEgressController>>,
    egress_start: Option<JoinHandle<()>>,
    open_call: Option<JoinHandle<()>>,
    recorder: ArtifactRecorder,
    calls: Arc<dyn CallStore>,
    shutdown: ShutdownConfig,
}

impl CallRecorderSession {
    /// Start the writer, then open the call row and request audio egress
    /// in the background.
    ///
    /// Returns as soon as events can be recorded. Bookkeeping and egress
    /// failures are logged; the session is usable either way.
    #[instrument(skip(services, settings), fields(call_id = %call_id, room = %room))]
    pub async fn start(
        call_id: &str,
        room: &str,
        media_session: &str,
        services: &RecorderServices,
        settings: &SessionSettings,
    ) -> Self {
        let started_at = Utc::now();
        let buffer = Arc::new(EventBuffer::new(call_id, room));

        let calls = Arc::clone(&services.calls);
        let open_call = {
            let calls = Arc::clone(&calls);
            let limit = settings.shutdown.bookkeeping_timeout();
            let (call_id, room) = (call_id.to_string(), room.to_string());
            tokio::spawn(
                async move {
                    match tokio::time::timeout(limit, calls.open_call(&call_id, &room, started_at))
                        .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(error = %e, "Failed to open call row"),
                        Err(_) => warn!("Opening call row timed out"),
                    }
                }
                .in_current_span(),
            )
        };

        let writer = BatchWriter::new(
            Arc::clone(&buffer),
            Arc::clone(&services.calls),
            settings.batch.clone(),
            settings.retry.clone(),
        )
        .spawn();

        let handle = RecorderHandle {
            buffer: Arc::clone(&buffer),
            trigger: writer.trigger(),
            health: writer.health(),
            last_by_role: settings
                .dedupe_consecutive
                .then(|| Arc::new(Mutex::new(HashMap::new()))),
        };

        let archiver = services.objects.as_ref().map(|store| {
            TranscriptArchiver::new(Arc::clone(store), settings.prefix.clone(), settings.retry.clone())
        });
        if archiver.is_none() {
            debug!("Object storage not configured, transcript upload disabled");
        }

        let controller = AudioEgressController::new(
            services.egress.clone(),
            settings.storage.clone(),
            settings.egress,
        );
        let enabled = controller.is_enabled();
        let egress = Arc::new(AsyncMutex::new(controller));
        let egress_start = if enabled {
            // Locked before spawning so state queries wait for the request
            let mut controller = Arc::clone(&egress).lock_owned().await;
            let (call_id, room, media_session) =
                (call_id.to_string(), room.to_string(), media_session.to_string());
            Some(tokio::spawn(
                async move {
                    if let Err(e) = controller.start(&call_id, &room, &media_session, started_at).await {
                        warn!(error = %e, "Audio egress did not start");
                    }
                }
                .in_current_span(),
            ))
        } else {
            debug!("Audio egress not configured");
            None
        };

        let recorder = ArtifactRecorder::new(
            services.artifacts.clone(),
            settings.artifacts_enabled,
            settings.retry.clone(),
        );

        info!("Recording session active");

        Self {
            call_id: call_id.to_string(),
            room: room.to_string(),
            state: SessionState::Active,
            started: Instant::now(),
            buffer,
            writer,
            handle,
            archiver,
            egress,
            egress_start,
            open_call: Some(open_call),
            recorder,
            calls,
            shutdown: settings.shutdown.clone(),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Egress state, once a pending start request has settled
    pub async fn egress_state(&self) -> EgressState {
        self.egress.lock().await.state()
    }

    pub fn handle(&self) -> RecorderHandle {
        self.handle.clone()
    }

    pub fn buffer(&self) -> &Arc<EventBuffer> {
        &self.buffer
    }

    fn advance(&mut self, transitions: &mut Vec<SessionState>) {
        if let Some(next) = self.state.next() {
            debug!(call_id = %self.call_id, from = ?self.state, to = ?next, "Session state change");
            self.state = next;
            transitions.push(next);
        }
    }

    /// Drain, archive and close. Never fails; the outcome records what
    /// succeeded.
    #[instrument(skip(self), fields(call_id = %self.call_id))]
    pub async fn shutdown(mut self) -> ShutdownOutcome {
        let began = Instant::now();
        let deadline = began + self.shutdown.deadline();
        let budget = |cap: Duration| cap.min(deadline.saturating_duration_since(Instant::now()));
        let mut transitions = Vec::with_capacity(3);

        // Draining
        self.advance(&mut transitions);
        self.buffer.seal();

        let drain_budget = budget(self.shutdown.drain_timeout());
        let drain = match self.writer.finish(drain_budget).await {
            Ok(written) if self.buffer.unflushed_len() == 0 => {
                debug!(written, "Buffer drained");
                StepOutcome::Succeeded
            }
            Ok(_) => StepOutcome::failed(format!(
                "{} events left unflushed",
                self.buffer.unflushed_len()
            )),
            Err(RecorderError::Timeout { after, .. }) => StepOutcome::timed_out(after),
            Err(e) => StepOutcome::failed(e),
        };
        if !drain.is_success() {
            warn!(unflushed = self.buffer.unflushed_len(), outcome = ?drain, "Final flush incomplete");
        }

        // Finalizing
        self.advance(&mut transitions);
        let transcript = self.buffer.full_transcript();
        let upload_budget = budget(self.shutdown.upload_timeout());
        let egress_budget = budget(self.shutdown.egress_stop_timeout());

        let archiver = self.archiver.as_ref();
        let call_id = self.call_id.as_str();
        let room = self.room.as_str();
        let egress = Arc::clone(&self.egress);
        let mut egress_start = self.egress_start.take();

        let upload_step = async {
            let Some(archiver) = archiver else {
                return (StepOutcome::skipped("object storage not configured"), None);
            };
            match tokio::time::timeout(
                upload_budget,
                archiver.archive(call_id, room, &transcript, Utc::now()),
            )
            .await
            {
                Ok(Ok(Some(artifact))) => (StepOutcome::Succeeded, Some(artifact)),
                Ok(Ok(None)) => (StepOutcome::skipped("no events recorded"), None),
                Ok(Err(e)) => (StepOutcome::failed(e), None),
                Err(_) => (StepOutcome::timed_out(upload_budget), None),
            }
        };

        let egress_step = async {
            let stopped = tokio::time::timeout(egress_budget, async {
                if let Some(task) = egress_start.as_mut() {
                    let _ = task.await;
                }
                egress_start = None;
                egress.lock().await.stop().await
            })
            .await;
            match stopped {
                Ok(EgressStop::NotStarted) => (StepOutcome::skipped("egress not running"), None),
                Ok(EgressStop::Stopped(artifact)) => (StepOutcome::Succeeded, Some(artifact)),
                Ok(EgressStop::Failed(reason)) => (StepOutcome::failed(reason), None),
                Ok(EgressStop::TimedOut) => (StepOutcome::timed_out(egress_budget), None),
                Err(_) => {
                    if let Some(task) = egress_start.take() {
                        task.abort();
                        let _ = task.await;
                    }
                    egress.lock().await.abandon();
                    (StepOutcome::timed_out(egress_budget), None)
                }
            }
        };

        let ((transcript_upload, transcript_artifact), (egress_stop, audio_artifact)) =
            tokio::join!(upload_step, egress_step);

        if !transcript_upload.is_success() {
            warn!(outcome = ?transcript_upload, "Transcript upload failed");
        }

        let mut artifacts = Vec::new();
        for artifact in transcript_artifact.into_iter().chain(audio_artifact) {
            let record = self.record_artifact(&artifact, &budget).await;
            artifacts.push(ArtifactReport { artifact, record });
        }

        // The row must exist before it can be closed
        let close_budget = budget(self.shutdown.bookkeeping_timeout());
        let mut open_call = self.open_call.take();
        let calls = Arc::clone(&self.calls);
        let call_id = self.call_id.clone();
        let closed = tokio::time::timeout(close_budget, async {
            if let Some(task) = open_call.as_mut() {
                let _ = task.await;
            }
            open_call = None;
            calls.close_call(&call_id, Utc::now()).await
        })
        .await;
        if let Some(task) = open_call.take() {
            task.abort();
        }
        let call_close = match closed {
            Ok(Ok(())) => StepOutcome::Succeeded,
            Ok(Err(e)) => StepOutcome::failed(format!("{:#}", e)),
            Err(_) => StepOutcome::timed_out(close_budget),
        };

        // Closed
        self.advance(&mut transitions);

        let outcome = ShutdownOutcome {
            call_id: self.call_id.clone(),
            final_state: self.state,
            transitions,
            events_recorded: self.buffer.len(),
            events_unflushed: self.buffer.unflushed_len(),
            drain,
            transcript_upload,
            egress_stop,
            egress_state: self.egress.lock().await.state(),
            artifacts,
            call_close,
            writer: self.writer.stats(),
            elapsed_ms: began.elapsed().as_millis() as u64,
        };

        info!(
            events = outcome.events_recorded,
            unflushed = outcome.events_unflushed,
            artifacts = outcome.artifacts.len(),
            clean = outcome.is_clean(),
            active_ms = self.started.elapsed().as_millis() as u64,
            elapsed_ms = outcome.elapsed_ms,
            "Recording session closed"
        );
        outcome
    }

    async fn record_artifact(
        &self,
        artifact: &Artifact,
        budget: &impl Fn(Duration) -> Duration,
    ) -> StepOutcome {
        if !self.recorder.is_enabled() {
            return StepOutcome::skipped("artifact recording disabled");
        }

        let limit = budget(self.shutdown.bookkeeping_timeout());
        match tokio::time::timeout(limit, self.recorder.record(artifact)).await {
            Ok(Ok(RecordOutcome::Recorded)) => StepOutcome::Succeeded,
            Ok(Ok(RecordOutcome::AlreadyPresent)) => StepOutcome::skipped("already recorded"),
            Ok(Ok(RecordOutcome::Skipped(SkipReason::SchemaMissing))) => {
                StepOutcome::skipped("artifact table missing")
            }
            Ok(Ok(RecordOutcome::Skipped(SkipReason::Disabled))) => {
                StepOutcome::skipped("artifact recording disabled")
            }
            Ok(Err(e)) => StepOutcome::failed(e),
            Err(_) => StepOutcome::timed_out(limit),
        }
    }
}
