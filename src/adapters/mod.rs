//! Adapter interfaces for external systems.
//!
//! The recorder talks to three collaborators: a relational store for events
//! and artifact rows, an object store for uploaded files, and a media
//! platform that runs audio egress jobs. Each sits behind an async trait so
//! sessions share one pooled client per collaborator.

pub mod livekit;
pub mod s3;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Artifact, CallEvent, EgressInfo, StorageLocation};

pub use livekit::LiveKitEgressClient;
pub use s3::S3Client;
pub use sqlite::SqliteStore;

/// Durable store for call rows and sequenced events
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Insert the call row if it does not exist yet
    async fn open_call(&self, call_id: &str, room: &str, started_at: DateTime<Utc>) -> Result<()>;

    /// Write a batch in one transaction.
    ///
    /// Rows are keyed by (call_id, sequence); replays are ignored. Returns the
    /// number of rows that were new.
    async fn write_events(&self, events: &[CallEvent]) -> Result<usize>;

    /// Set the call's end time unless it is already set
    async fn close_call(&self, call_id: &str, ended_at: DateTime<Utc>) -> Result<()>;
}

/// Outcome of writing an artifact row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactWrite {
    Inserted,
    AlreadyPresent,
    /// The deployment has no artifact table
    SchemaMissing,
}

/// Bookkeeping for uploaded objects
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn record_artifact(&self, artifact: &Artifact) -> Result<ArtifactWrite>;
}

/// Result of a confirmed object write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReceipt {
    pub etag: Option<String>,
    pub size_bytes: u64,
}

/// Object storage (S3-compatible)
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Where an object with this key lives
    fn location(&self, key: &str) -> StorageLocation;

    /// Write the whole body under `key`, replacing any previous object.
    ///
    /// Succeeds only once the store confirmed the complete body.
    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<PutReceipt>;
}

/// Destination the media platform uploads the recording to
#[derive(Clone, PartialEq, Eq)]
pub struct S3Upload {
    pub bucket: String,
    pub key: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub force_path_style: bool,
    pub access_key: String,
    pub secret: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for S3Upload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Upload")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Request for an audio-only capture of a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressRequest {
    pub room_name: String,
    pub output: S3Upload,
}

/// Media platform that records rooms
#[async_trait]
pub trait EgressPlatform: Send + Sync {
    async fn start_audio_egress(&self, request: &EgressRequest) -> Result<EgressInfo>;

    async fn stop_egress(&self, egress_id: &str) -> Result<EgressInfo>;

    async fn get_egress(&self, egress_id: &str) -> Result<EgressInfo>;
}
