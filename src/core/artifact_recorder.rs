//! Artifact bookkeeping.

use std::sync::Arc;

use tracing::{debug, info};

use crate::adapters::{ArtifactStore, ArtifactWrite};
use crate::domain::Artifact;

use super::error::{RecorderError, Result};
use super::retry::RetryPolicy;

/// What happened to one artifact row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    /// A row with the same natural key already existed
    AlreadyPresent,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Artifact recording is turned off or no store is attached
    Disabled,
    /// The deployment has no artifact table
    SchemaMissing,
}

/// Persists artifact descriptors when the deployment supports it
pub struct ArtifactRecorder {
    store: Option<Arc<dyn ArtifactStore>>,
    enabled: bool,
    retry: RetryPolicy,
}

impl ArtifactRecorder {
    pub fn new(store: Option<Arc<dyn ArtifactStore>>, enabled: bool, retry: RetryPolicy) -> Self {
        Self {
            store,
            enabled,
            retry,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, false, RetryPolicy::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && self.store.is_some()
    }

    /// Write one artifact row. Safe to repeat: rows are unique on
    /// (call_id, kind, location).
    pub async fn record(&self, artifact: &Artifact) -> Result<RecordOutcome> {
        let Some(store) = self.store.as_ref().filter(|_| self.enabled) else {
            return Ok(RecordOutcome::Skipped(SkipReason::Disabled));
        };

        let write = self
            .retry
            .run("artifact record", move |_| async move {
                store
                    .record_artifact(artifact)
                    .await
                    .map_err(|e| RecorderError::Store(format!("{:#}", e)))
            })
            .await?;

        let outcome = match write {
            ArtifactWrite::Inserted => RecordOutcome::Recorded,
            ArtifactWrite::AlreadyPresent => RecordOutcome::AlreadyPresent,
            ArtifactWrite::SchemaMissing => {
                debug!(call_id = %artifact.call_id, "Artifact table missing, skipping");
                RecordOutcome::Skipped(SkipReason::SchemaMissing)
            }
        };

        if outcome == RecordOutcome::Recorded {
            info!(
                call_id = %artifact.call_id,
                kind = artifact.kind.as_str(),
                uri = %artifact.location.uri(),
                "Artifact recorded"
            );
        }
        Ok(outcome)
    }
}
