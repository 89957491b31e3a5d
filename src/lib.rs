//! callrec - Call recording and archival pipeline
//!
//! Captures the transcript of a live voice call, persists it in batches to
//! a relational store, and archives the finished transcript and audio to
//! object storage without ever blocking the conversation loop.
//!
//! # Architecture
//!
//! Each call gets a session with its own append log:
//! - Events are sequenced on append and never reordered
//! - A writer task flushes them in bounded batches with retry
//! - Shutdown drains, archives and records artifacts under deadlines
//!
//! # Modules
//!
//! - `adapters`: External systems (SQLite, S3, LiveKit egress)
//! - `core`: Recording logic (EventBuffer, BatchWriter, sessions)
//! - `domain`: Data structures (CallEvent, Artifact, EgressJob)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Create the database, including the artifact table
//! callrec init-db --with-artifacts
//!
//! # Feed a scripted call through a full session
//! callrec replay call.jsonl --room demo
//!
//! # Inspect what was stored
//! callrec events <call-id>
//! callrec artifacts <call-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use crate::core::{
    CallRecorder, CallRecorderSession, RecorderError, RecorderHandle, RecorderServices,
    SessionSettings, SessionState, ShutdownOutcome, StepOutcome,
};
pub use config::RecorderConfig;
pub use domain::{Artifact, ArtifactKind, CallEvent, PendingEvent, Role, TranscriptEvent};
