//! Artifacts produced from a call.
//!
//! An artifact describes one uploaded object (transcript or audio). It is
//! created when the upload is confirmed and never mutated afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An uploaded object belonging to a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// The call this artifact belongs to
    pub call_id: String,

    /// What the object holds
    pub kind: ArtifactKind,

    /// Where the object lives
    pub location: StorageLocation,

    /// Size in bytes, if the store reported it
    pub size_bytes: Option<u64>,

    /// Hex SHA-256 of the body, when the uploader computed it
    pub checksum_sha256: Option<String>,

    /// MIME type of the object
    pub content_type: Option<String>,

    /// ETag returned by the object store
    pub etag: Option<String>,

    /// Egress job that produced the object (audio only)
    pub egress_id: Option<String>,

    /// When the upload was confirmed
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Create an artifact descriptor stamped with the current time
    pub fn new(call_id: impl Into<String>, kind: ArtifactKind, location: StorageLocation) -> Self {
        Self {
            call_id: call_id.into(),
            kind,
            location,
            size_bytes: None,
            checksum_sha256: None,
            content_type: None,
            etag: None,
            egress_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }

    pub fn with_checksum(mut self, checksum: String) -> Self {
        self.checksum_sha256 = Some(checksum);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    pub fn with_egress_id(mut self, egress_id: impl Into<String>) -> Self {
        self.egress_id = Some(egress_id.into());
        self
    }

    /// Natural key used to make artifact bookkeeping idempotent
    pub fn natural_key(&self) -> (String, ArtifactKind, String) {
        (self.call_id.clone(), self.kind, self.location.uri())
    }
}

/// Kinds of artifacts a call produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Line-delimited JSON transcript
    Transcript,

    /// Audio recording captured by egress
    Audio,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transcript => "transcript",
            Self::Audio => "audio",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "transcript" => Some(Self::Transcript),
            "audio" => Some(Self::Audio),
            _ => None,
        }
    }
}

/// Bucket and key of an object, plus the endpoint details needed to find it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageLocation {
    pub bucket: String,
    pub key: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
}

impl StorageLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            region: None,
            endpoint: None,
        }
    }

    /// `s3://bucket/key`
    pub fn uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }

    /// Same endpoint, bucket and key taken from an `s3://bucket/key` URI.
    /// Any other form of URI yields `None`.
    pub fn with_uri(&self, uri: &str) -> Option<Self> {
        let (bucket, key) = uri.strip_prefix("s3://")?.split_once('/')?;
        if bucket.is_empty() || key.is_empty() {
            return None;
        }
        Some(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            ..self.clone()
        })
    }
}
