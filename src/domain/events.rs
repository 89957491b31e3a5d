//! Call events captured from the live conversation.
//!
//! Events are immutable once appended to a call's buffer. The buffer assigns
//! the sequence number and capture time; everything else comes from the
//! voice pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced an utterance or message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The caller
    User,

    /// The voice agent
    Agent,

    /// Out-of-band notes (handoffs, warnings)
    System,
}

impl Role {
    /// Stable lowercase name, used for storage columns
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }

    /// Parse the storage representation back into a role
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "agent" => Some(Self::Agent),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capture time of an event.
///
/// `wall` orders events for humans; `offset_ms` is measured on the monotonic
/// clock from the start of the session and never goes backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Wall-clock time (UTC)
    pub wall: DateTime<Utc>,

    /// Milliseconds since the session started (monotonic)
    pub offset_ms: u64,
}

/// An event as delivered by the voice pipeline, before it is sequenced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEvent {
    pub role: Role,
    pub text: String,
}

impl PendingEvent {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }
}

/// One recorded utterance or message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEvent {
    /// Opaque call identifier, stable for the call's lifetime
    pub call_id: String,

    /// Communication session/room the call happens in
    pub room: String,

    /// Who said it
    pub role: Role,

    /// Final (non-interim) transcript or message content
    pub text: String,

    /// When the event was appended
    pub timestamp: Timestamp,

    /// Position in the call, contiguous from 0
    pub sequence: u64,
}

/// A transcript fragment from the speech pipeline.
///
/// Only final fragments are recorded; interim ones are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub role: Role,
    pub text: String,
    #[serde(default = "default_is_final")]
    pub is_final: bool,
}

fn default_is_final() -> bool {
    true
}
