//! Audio egress lifecycle for one call.
//!
//! State machine:
//!
//! ```text
//! idle ─▶ starting ─▶ active ─▶ stopping ─▶ stopped
//!            │           │          │
//!            └───────────┴──────────┴─▶ failed
//! ```
//!
//! A controller built without a platform or without object storage never
//! leaves `idle` and never contacts the platform.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::adapters::{EgressPlatform, EgressRequest, S3Upload};
use crate::config::{EgressConfig, StorageConfig};
use crate::domain::{
    Artifact, ArtifactKind, EgressInfo, EgressJob, EgressJobStatus, StorageLocation,
};

use super::archiver::archive_key;
use super::error::{RecorderError, Result};

pub const AUDIO_FILE: &str = "audio.mp4";
/// Audio-only recordings still use the MP4 video container type
pub const AUDIO_CONTENT_TYPE: &str = "video/mp4";

/// Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EgressState {
    Idle,
    Starting,
    Active,
    Stopping,
    Stopped,
    Failed,
}

impl EgressState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    fn can_transition_to(&self, next: EgressState) -> bool {
        use EgressState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Active)
                | (Starting, Failed)
                | (Active, Stopping)
                | (Active, Failed)
                | (Stopping, Stopped)
                | (Stopping, Failed)
        )
    }
}

impl std::fmt::Display for EgressState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of asking the controller to stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EgressStop {
    /// No job was running
    NotStarted,
    /// The recording was confirmed written
    Stopped(Artifact),
    /// The platform reported a failure
    Failed(String),
    /// No terminal status arrived within the confirmation window
    TimedOut,
}

impl EgressStop {
    pub fn artifact(&self) -> Option<&Artifact> {
        match self {
            Self::Stopped(artifact) => Some(artifact),
            _ => None,
        }
    }
}

/// Polling cadence and confirmation bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EgressTimings {
    pub poll_interval: Duration,
    pub confirm_timeout: Duration,
}

impl From<&EgressConfig> for EgressTimings {
    fn from(config: &EgressConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            confirm_timeout: config.stop_timeout(),
        }
    }
}

impl Default for EgressTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            confirm_timeout: Duration::from_secs(8),
        }
    }
}

/// Starts and stops the single audio capture job of a call
pub struct AudioEgressController {
    platform: Option<Arc<dyn EgressPlatform>>,
    storage: Option<StorageConfig>,
    timings: EgressTimings,
    state: EgressState,
    job: Option<EgressJob>,
    location: Option<StorageLocation>,
}

impl AudioEgressController {
    pub fn new(
        platform: Option<Arc<dyn EgressPlatform>>,
        storage: Option<StorageConfig>,
        timings: EgressTimings,
    ) -> Self {
        Self {
            platform,
            storage,
            timings,
            state: EgressState::Idle,
            job: None,
            location: None,
        }
    }

    /// A controller that stays idle
    pub fn disabled() -> Self {
        Self::new(None, None, EgressTimings::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.platform.is_some() && self.storage.is_some()
    }

    pub fn state(&self) -> EgressState {
        self.state
    }

    pub fn job(&self) -> Option<&EgressJob> {
        self.job.as_ref()
    }

    fn transition(&mut self, next: EgressState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(RecorderError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }

        debug!(from = %self.state, to = %next, "Egress state change");
        self.state = next;
        if let Some(job) = self.job.as_mut() {
            job.status = match next {
                EgressState::Active => EgressJobStatus::Active,
                EgressState::Stopped => EgressJobStatus::Stopped,
                EgressState::Failed => EgressJobStatus::Failed,
                _ => job.status,
            };
        }
        Ok(())
    }

    /// Request a recording of `media_session`.
    ///
    /// A second call returns the current state without contacting the
    /// platform. Errors leave the controller in `failed`.
    #[instrument(skip(self, started_at), fields(call_id = %call_id))]
    pub async fn start(
        &mut self,
        call_id: &str,
        room: &str,
        media_session: &str,
        started_at: DateTime<Utc>,
    ) -> Result<EgressState> {
        let (Some(platform), Some(storage)) = (self.platform.clone(), self.storage.as_ref()) else {
            debug!("Audio egress disabled, not starting");
            return Ok(self.state);
        };
        if self.state != EgressState::Idle {
            return Ok(self.state);
        }

        let key = archive_key(&storage.prefix, started_at, room, call_id, AUDIO_FILE);
        let request = EgressRequest {
            room_name: media_session.to_string(),
            output: S3Upload {
                bucket: storage.bucket.clone(),
                key: key.clone(),
                region: storage.region.clone(),
                endpoint: storage.endpoint.clone(),
                force_path_style: storage.force_path_style,
                access_key: storage.credentials.access_key_id.clone(),
                secret: storage.credentials.secret_access_key.clone(),
                session_token: storage.credentials.session_token.clone(),
            },
        };
        let location = StorageLocation {
            bucket: storage.bucket.clone(),
            key: key.clone(),
            region: Some(storage.region.clone()),
            endpoint: storage.endpoint.clone(),
        };

        self.transition(EgressState::Starting)?;

        let response = tokio::time::timeout(
            self.timings.confirm_timeout,
            platform.start_audio_egress(&request),
        )
        .await;

        let info = match response {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                self.transition(EgressState::Failed)?;
                return Err(RecorderError::Egress(format!("{:#}", e)));
            }
            Err(_) => {
                self.transition(EgressState::Failed)?;
                return Err(RecorderError::Timeout {
                    operation: "egress start".to_string(),
                    after: self.timings.confirm_timeout,
                });
            }
        };

        self.job = Some(EgressJob {
            egress_id: info.egress_id.clone(),
            call_id: call_id.to_string(),
            started_at,
            status: EgressJobStatus::Pending,
            output_key: key,
        });
        self.location = Some(location);
        self.transition(EgressState::Active)?;

        info!(egress_id = %info.egress_id, "Audio egress started");
        Ok(self.state)
    }

    /// Stop the job and wait for the recording to be confirmed.
    ///
    /// Anything other than an active job is a no-op.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> EgressStop {
        if self.state != EgressState::Active {
            return EgressStop::NotStarted;
        }
        let (Some(platform), Some(job), Some(location)) =
            (self.platform.clone(), self.job.clone(), self.location.clone())
        else {
            return EgressStop::NotStarted;
        };

        if self.transition(EgressState::Stopping).is_err() {
            return EgressStop::NotStarted;
        }

        let confirmed = tokio::time::timeout(
            self.timings.confirm_timeout,
            confirm_stop(platform.as_ref(), &job.egress_id, self.timings.poll_interval),
        )
        .await;

        match confirmed {
            Ok(info) if info.status.is_success() => {
                let _ = self.transition(EgressState::Stopped);

                // Prefer where the platform says it wrote the file
                let location = info
                    .file
                    .as_ref()
                    .and_then(|f| f.location.as_deref())
                    .and_then(|uri| location.with_uri(uri))
                    .unwrap_or(location);
                let mut artifact = Artifact::new(&job.call_id, ArtifactKind::Audio, location)
                    .with_content_type(AUDIO_CONTENT_TYPE)
                    .with_egress_id(&job.egress_id);
                if let Some(size) = info.file.as_ref().and_then(|f| f.size_bytes) {
                    artifact = artifact.with_size(size);
                }

                info!(egress_id = %job.egress_id, uri = %artifact.location.uri(), "Audio egress stopped");
                EgressStop::Stopped(artifact)
            }
            Ok(info) => {
                let _ = self.transition(EgressState::Failed);
                let reason = info
                    .error
                    .unwrap_or_else(|| format!("egress ended with {:?}", info.status));
                warn!(egress_id = %job.egress_id, reason = %reason, "Audio egress failed");
                EgressStop::Failed(reason)
            }
            Err(_) => {
                let _ = self.transition(EgressState::Failed);
                warn!(
                    egress_id = %job.egress_id,
                    timeout_ms = self.timings.confirm_timeout.as_millis() as u64,
                    "Audio egress stop not confirmed"
                );
                EgressStop::TimedOut
            }
        }
    }

    /// Mark a job whose stop was cut short as failed
    pub fn abandon(&mut self) {
        if matches!(
            self.state,
            EgressState::Starting | EgressState::Active | EgressState::Stopping
        ) {
            let _ = self.transition(EgressState::Failed);
        }
    }
}

/// Send the stop request, then poll until the job reaches a terminal status
async fn confirm_stop(
    platform: &dyn EgressPlatform,
    egress_id: &str,
    poll_interval: Duration,
) -> EgressInfo {
    let mut latest = match platform.stop_egress(egress_id).await {
        Ok(info) => Some(info),
        Err(e) => {
            warn!(egress_id, error = %e, "Stop request failed, polling status");
            None
        }
    };

    loop {
        if let Some(info) = latest.take() {
            if info.status.is_terminal() {
                return info;
            }
        }

        tokio::time::sleep(poll_interval).await;
        match platform.get_egress(egress_id).await {
            Ok(info) => latest = Some(info),
            Err(e) => debug!(egress_id, error = %e, "Egress status poll failed"),
        }
    }
}
