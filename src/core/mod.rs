//! Core recording logic.
//!
//! This module contains:
//! - EventBuffer: Per-call append log with an unflushed view
//! - BatchWriter: Timed and size-triggered batch persistence
//! - TranscriptArchiver: JSONL transcript upload
//! - AudioEgressController: Remote audio capture lifecycle
//! - ArtifactRecorder: Artifact row bookkeeping
//! - CallRecorderSession: Per-call orchestration and shutdown
//! - CallRecorder: Registry of open sessions

pub mod archiver;
pub mod artifact_recorder;
pub mod batch_writer;
pub mod buffer;
pub mod egress;
pub mod error;
pub mod registry;
pub mod retry;
pub mod session;

// Re-export commonly used types
pub use archiver::{archive_key, encode_transcript, TranscriptArchiver};
pub use artifact_recorder::{ArtifactRecorder, RecordOutcome, SkipReason};
pub use batch_writer::{BatchWriter, FlushTrigger, WriterHandle, WriterStats};
pub use buffer::{Batch, EventBuffer};
pub use egress::{AudioEgressController, EgressState, EgressStop, EgressTimings};
pub use error::{RecorderError, Result};
pub use registry::CallRecorder;
pub use retry::RetryPolicy;
pub use session::{
    ArtifactReport, CallRecorderSession, RecorderHandle, RecorderServices, SessionSettings,
    SessionState, ShutdownOutcome, StepOutcome,
};
