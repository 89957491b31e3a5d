//! Process-wide registry of recording sessions.
//!
//! Receives the voice pipeline's lifecycle notifications. Sessions share the
//! registry's clients and nothing else.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::adapters::{
    ArtifactStore, CallStore, EgressPlatform, LiveKitEgressClient, ObjectStore, S3Client,
    SqliteStore,
};
use crate::config::RecorderConfig;

use super::session::{
    CallRecorderSession, RecorderHandle, RecorderServices, SessionSettings, ShutdownOutcome,
};

/// Owns every open call's session
pub struct CallRecorder {
    services: RecorderServices,
    settings: SessionSettings,
    sessions: Mutex<HashMap<String, CallRecorderSession>>,
}

impl CallRecorder {
    pub fn new(services: RecorderServices, settings: SessionSettings) -> Self {
        Self {
            services,
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Build clients from resolved configuration
    pub fn from_config(config: &RecorderConfig) -> Result<Self> {
        let store = SqliteStore::open(&config.database_path)?;
        let calls: Arc<dyn CallStore> = Arc::new(store.clone());
        let artifacts: Option<Arc<dyn ArtifactStore>> = config
            .artifacts_enabled
            .then(|| Arc::new(store) as Arc<dyn ArtifactStore>);

        let objects = config
            .storage
            .clone()
            .map(|storage| Arc::new(S3Client::new(storage)) as Arc<dyn ObjectStore>);

        // Egress without storage stays inert
        let egress = match (&config.egress, &config.storage) {
            (Some(egress), Some(_)) => {
                Some(Arc::new(LiveKitEgressClient::new(egress)) as Arc<dyn EgressPlatform>)
            }
            _ => None,
        };

        info!(
            database = %config.database_path.display(),
            storage = objects.is_some(),
            egress = egress.is_some(),
            artifacts = artifacts.is_some(),
            "Call recorder configured"
        );

        Ok(Self::new(
            RecorderServices {
                calls,
                artifacts,
                objects,
                egress,
            },
            SessionSettings::from(config),
        ))
    }

    /// Begin recording a call. A repeated notification returns the existing
    /// session's handle.
    ///
    /// The slot is claimed and the session built under one lock; session
    /// start only spawns its I/O, so exactly one egress request and one call
    /// row exist per call.
    pub async fn call_started(&self, call_id: &str, room: &str, media_session: &str) -> RecorderHandle {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(call_id) {
            debug!(call_id, "Call already recording");
            return session.handle();
        }

        let session =
            CallRecorderSession::start(call_id, room, media_session, &self.services, &self.settings)
                .await;
        let handle = session.handle();
        sessions.insert(call_id.to_string(), session);
        handle
    }

    /// Finish a call and report the outcome. Unknown calls return `None`.
    pub async fn call_ended(&self, call_id: &str) -> Option<ShutdownOutcome> {
        let session = self.sessions.lock().await.remove(call_id)?;
        Some(session.shutdown().await)
    }

    pub async fn handle(&self, call_id: &str) -> Option<RecorderHandle> {
        self.sessions.lock().await.get(call_id).map(|s| s.handle())
    }

    pub async fn active_calls(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Finalize every open call concurrently
    pub async fn shutdown_all(&self) -> Vec<ShutdownOutcome> {
        let sessions: Vec<CallRecorderSession> =
            self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        if sessions.is_empty() {
            return Vec::new();
        }

        info!(calls = sessions.len(), "Finalizing open calls");
        let mut tasks = JoinSet::new();
        for session in sessions {
            tasks.spawn(session.shutdown());
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "Session shutdown task failed"),
            }
        }
        outcomes.sort_by(|a, b| a.call_id.cmp(&b.call_id));
        outcomes
    }
}
