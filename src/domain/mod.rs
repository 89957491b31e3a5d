//! Domain types for the call recorder.
//!
//! This module contains the core data structures:
//! - Events: Sequenced utterances and messages of one call
//! - Artifact: Uploaded transcript/audio objects
//! - Egress: Remote audio-capture jobs

pub mod artifact;
pub mod egress;
pub mod events;

// Re-export commonly used types
pub use artifact::{Artifact, ArtifactKind, StorageLocation};
pub use egress::{EgressFile, EgressInfo, EgressJob, EgressJobStatus, RemoteEgressStatus};
pub use events::{CallEvent, PendingEvent, Role, Timestamp, TranscriptEvent};
