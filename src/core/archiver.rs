//! Transcript archival to object storage.
//!
//! The whole ordered transcript goes up as one JSONL object per call. The key
//! depends only on the upload date, room and call id, so a retried or
//! repeated upload overwrites the same object.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use crate::adapters::ObjectStore;
use crate::domain::{Artifact, ArtifactKind, CallEvent};

use super::error::{RecorderError, Result};
use super::retry::RetryPolicy;

pub const TRANSCRIPT_FILE: &str = "transcript.jsonl";
pub const TRANSCRIPT_CONTENT_TYPE: &str = "application/x-ndjson";

/// Build `{prefix}/{YYYY}/{MM}/{DD}/{room}/{call_id}/{file_name}`
pub fn archive_key(
    prefix: &str,
    at: DateTime<Utc>,
    room: &str,
    call_id: &str,
    file_name: &str,
) -> String {
    let prefix = prefix.trim_end_matches('/');
    let date = at.format("%Y/%m/%d");
    if prefix.is_empty() {
        format!("{}/{}/{}/{}", date, room, call_id, file_name)
    } else {
        format!("{}/{}/{}/{}/{}", prefix, date, room, call_id, file_name)
    }
}

/// One line of the transcript object
#[derive(Debug, Serialize)]
struct TranscriptLine<'a> {
    sequence: u64,
    ts: String,
    sender: &'a str,
    text: &'a str,
    call_id: &'a str,
    room: &'a str,
}

/// Serialize events as newline-terminated JSON records in sequence order
pub fn encode_transcript(events: &[CallEvent]) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    for event in events {
        let line = TranscriptLine {
            sequence: event.sequence,
            ts: event.timestamp.wall.to_rfc3339(),
            sender: event.role.as_str(),
            text: &event.text,
            call_id: &event.call_id,
            room: &event.room,
        };
        serde_json::to_writer(&mut body, &line)?;
        body.push(b'\n');
    }
    Ok(body)
}

/// Uploads finished transcripts
pub struct TranscriptArchiver {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    retry: RetryPolicy,
}

impl TranscriptArchiver {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            retry,
        }
    }

    pub fn key_for(&self, room: &str, call_id: &str, at: DateTime<Utc>) -> String {
        archive_key(&self.prefix, at, room, call_id, TRANSCRIPT_FILE)
    }

    /// Upload the transcript and describe the stored object.
    ///
    /// Returns `Ok(None)` when there is nothing to upload. The object is
    /// written whole or the attempt counts as failed.
    #[instrument(skip(self, events), fields(events = events.len()))]
    pub async fn archive(
        &self,
        call_id: &str,
        room: &str,
        events: &[CallEvent],
        uploaded_at: DateTime<Utc>,
    ) -> Result<Option<Artifact>> {
        if events.is_empty() {
            debug!("No transcript events, skipping upload");
            return Ok(None);
        }

        let body = encode_transcript(events)?;
        let checksum = hex::encode(Sha256::digest(&body));
        let expected_size = body.len() as u64;
        let key = self.key_for(room, call_id, uploaded_at);

        let store = &self.store;
        let key_ref = key.as_str();
        let body_ref = &body;
        let receipt = self
            .retry
            .run("transcript upload", move |_| async move {
                let receipt = store
                    .put_object(key_ref, body_ref.clone(), TRANSCRIPT_CONTENT_TYPE)
                    .await
                    .map_err(|e| RecorderError::Storage(format!("{:#}", e)))?;

                if receipt.size_bytes != expected_size {
                    return Err(RecorderError::Storage(format!(
                        "partial upload: {} of {} bytes confirmed",
                        receipt.size_bytes, expected_size
                    )));
                }
                Ok(receipt)
            })
            .await?;

        let artifact = Artifact::new(call_id, ArtifactKind::Transcript, self.store.location(&key))
            .with_size(expected_size)
            .with_checksum(checksum)
            .with_content_type(TRANSCRIPT_CONTENT_TYPE)
            .with_etag(receipt.etag);

        info!(uri = %artifact.location.uri(), size_bytes = expected_size, "Transcript archived");
        Ok(Some(artifact))
    }
}
