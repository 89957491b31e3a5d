//! In-memory event log for one active call.
//!
//! One ordered append log with two views over it: the unflushed tail that the
//! batch writer drains, and the full log used to assemble the transcript.
//! Because sequence numbers start at 0 and are contiguous, an event's
//! sequence is also its index in the log, so draining and re-queueing only
//! move a cursor.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::Utc;

use crate::domain::{CallEvent, PendingEvent, Timestamp};

use super::error::{RecorderError, Result};

/// Append-only event buffer shared by the ingest path and the batch writer
#[derive(Debug)]
pub struct EventBuffer {
    call_id: String,
    room: String,
    started: Instant,
    state: Mutex<BufferState>,
}

#[derive(Debug, Default)]
struct BufferState {
    /// Every event appended so far, in sequence order
    log: Vec<CallEvent>,

    /// Index of the oldest event not yet handed to the writer
    cursor: usize,

    /// Set once the session starts draining
    sealed: bool,
}

impl EventBuffer {
    pub fn new(call_id: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            room: room.into(),
            started: Instant::now(),
            state: Mutex::new(BufferState::default()),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        // Every mutation is a single push or cursor move, so a poisoned
        // state is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sequence and timestamp a pending event and store it.
    ///
    /// Constant time; never waits on I/O.
    pub fn append(&self, pending: PendingEvent) -> Result<u64> {
        let offset_ms = self.started.elapsed().as_millis() as u64;
        let mut state = self.lock();

        if state.sealed {
            return Err(RecorderError::SessionClosed {
                call_id: self.call_id.clone(),
            });
        }

        let sequence = state.log.len() as u64;
        state.log.push(CallEvent {
            call_id: self.call_id.clone(),
            room: self.room.clone(),
            role: pending.role,
            text: pending.text,
            timestamp: Timestamp {
                wall: Utc::now(),
                offset_ms,
            },
            sequence,
        });

        Ok(sequence)
    }

    /// Remove and return up to `max_count` of the oldest unflushed events.
    ///
    /// The full log is untouched.
    pub fn drain(&self, max_count: usize) -> Vec<CallEvent> {
        let mut state = self.lock();
        let start = state.cursor;
        let end = (start + max_count).min(state.log.len());
        state.cursor = end;
        state.log[start..end].to_vec()
    }

    /// Put drained events back at the head of the unflushed view.
    ///
    /// Order is preserved because the cursor simply moves back to the first
    /// returned sequence.
    pub fn requeue(&self, events: &[CallEvent]) {
        let Some(first) = events.first() else {
            return;
        };

        let mut state = self.lock();
        let index = first.sequence as usize;
        if index < state.cursor {
            state.cursor = index;
        }
    }

    /// Drain a batch that returns itself to the buffer unless committed
    pub fn take_batch(self: &Arc<Self>, max_count: usize) -> Option<Batch> {
        let events = self.drain(max_count);
        if events.is_empty() {
            return None;
        }

        Some(Batch {
            events,
            buffer: Arc::clone(self),
            settled: false,
        })
    }

    /// Every event appended so far, in sequence order
    pub fn full_transcript(&self) -> Vec<CallEvent> {
        self.lock().log.clone()
    }

    /// Number of events not yet handed to the writer
    pub fn unflushed_len(&self) -> usize {
        let state = self.lock();
        state.log.len() - state.cursor
    }

    /// Total number of events appended
    pub fn len(&self) -> usize {
        self.lock().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting appends
    pub fn seal(&self) {
        self.lock().sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }
}

/// A contiguous slice of unflushed events owned by the batch writer.
///
/// Dropping an uncommitted batch (failed write, abandoned task) re-queues its
/// events so nothing is lost.
#[derive(Debug)]
pub struct Batch {
    events: Vec<CallEvent>,
    buffer: Arc<EventBuffer>,
    settled: bool,
}

impl Batch {
    pub fn events(&self) -> &[CallEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn first_sequence(&self) -> u64 {
        self.events.first().map(|e| e.sequence).unwrap_or(0)
    }

    pub fn last_sequence(&self) -> u64 {
        self.events.last().map(|e| e.sequence).unwrap_or(0)
    }

    /// Mark the batch as durably written
    pub fn commit(mut self) {
        self.settled = true;
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        if !self.settled {
            self.buffer.requeue(&self.events);
        }
    }
}
