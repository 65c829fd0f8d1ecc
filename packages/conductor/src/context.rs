//! Runtime state of the one active execution.
//!
//! An [`ExecutionContext`] is created when the executor starts a request and
//! dropped when it finishes. The engine keeps a shared reference while it
//! runs so callers can read progress, merge into the shared payload, or
//! cancel it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::bus::Baton;
use crate::error::BeatError;
use crate::lock_unpoisoned;
use crate::request::{Priority, RequestId, SequenceRequest};

/// Executor state for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    /// Every beat ran; some may have recorded errors under `continue`.
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

// =============================================================================
// Cancellation
// =============================================================================

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

/// Cooperative cancellation flag checked between beats and during delays.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Only the first reason is kept.
    ///
    /// Returns `false` if the token was already cancelled.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        {
            let mut slot = lock_unpoisoned(&self.state.reason);
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason.into());
        }
        self.state.cancelled.store(true, Ordering::Release);
        self.state.notify.notify_waiters();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<String> {
        lock_unpoisoned(&self.state.reason).clone()
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking so a cancel in between is not missed.
            let notified = self.state.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

// =============================================================================
// Context
// =============================================================================

/// A beat that finished (successfully or not) during this execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedBeat {
    pub movement: String,
    pub beat: u32,
    pub event: String,
}

#[derive(Debug)]
struct Progress {
    status: ExecutionStatus,
    movement_index: usize,
    beat_index: usize,
    completed_beats: Vec<CompletedBeat>,
    errors: Vec<BeatError>,
    failure: Option<String>,
}

/// State of the single running request.
#[derive(Debug)]
pub struct ExecutionContext {
    request: SequenceRequest,
    total_beats: usize,
    started_at: DateTime<Utc>,
    started: Instant,
    baton: Baton,
    cancel: CancelToken,
    progress: Mutex<Progress>,
}

impl ExecutionContext {
    /// The shared payload starts as a copy of the request data.
    pub fn new(request: SequenceRequest, total_beats: usize) -> Self {
        let baton = Baton::new(request.data.clone());
        Self {
            request,
            total_beats,
            started_at: Utc::now(),
            started: Instant::now(),
            baton,
            cancel: CancelToken::new(),
            progress: Mutex::new(Progress {
                status: ExecutionStatus::Running,
                movement_index: 0,
                beat_index: 0,
                completed_beats: Vec::new(),
                errors: Vec::new(),
                failure: None,
            }),
        }
    }

    pub fn request(&self) -> &SequenceRequest {
        &self.request
    }

    pub fn execution_id(&self) -> RequestId {
        self.request.id
    }

    pub fn baton(&self) -> &Baton {
        &self.baton
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn status(&self) -> ExecutionStatus {
        lock_unpoisoned(&self.progress).status
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    pub(crate) fn set_position(&self, movement_index: usize, beat_index: usize) {
        let mut progress = lock_unpoisoned(&self.progress);
        progress.movement_index = movement_index;
        progress.beat_index = beat_index;
    }

    pub(crate) fn complete_beat(&self, beat: CompletedBeat) {
        lock_unpoisoned(&self.progress).completed_beats.push(beat);
    }

    pub(crate) fn record_error(&self, error: BeatError) {
        lock_unpoisoned(&self.progress).errors.push(error);
    }

    pub fn beats_completed(&self) -> usize {
        lock_unpoisoned(&self.progress).completed_beats.len()
    }

    pub fn errors(&self) -> Vec<BeatError> {
        lock_unpoisoned(&self.progress).errors.clone()
    }

    /// Set the terminal status. A terminal status is never overwritten.
    pub(crate) fn finish(&self, status: ExecutionStatus, failure: Option<String>) {
        let mut progress = lock_unpoisoned(&self.progress);
        if progress.status.is_terminal() {
            return;
        }
        progress.status = status;
        progress.failure = failure;
    }

    /// Point-in-time view for `current_execution`.
    pub fn snapshot(&self) -> ExecutionSnapshot {
        let progress = lock_unpoisoned(&self.progress);
        ExecutionSnapshot {
            request_id: self.request.id,
            sequence_id: self.request.sequence_id.clone(),
            sequence_name: self.request.sequence_name.clone(),
            priority: self.request.priority,
            status: progress.status,
            movement_index: progress.movement_index,
            beat_index: progress.beat_index,
            total_beats: self.total_beats,
            completed_beats: progress.completed_beats.clone(),
            errors: progress.errors.clone(),
            payload: self.baton.snapshot(),
            started_at: self.started_at,
            elapsed_ms: self.elapsed().as_millis() as u64,
        }
    }

    /// History record for a finished execution.
    pub fn summary(&self) -> ExecutionSummary {
        let progress = lock_unpoisoned(&self.progress);
        ExecutionSummary {
            request_id: self.request.id,
            sequence_id: self.request.sequence_id.clone(),
            sequence_name: self.request.sequence_name.clone(),
            priority: self.request.priority,
            status: progress.status,
            beats_completed: progress.completed_beats.len(),
            total_beats: self.total_beats,
            errors: progress.errors.clone(),
            failure: progress.failure.clone(),
            started_at: self.started_at,
            duration_ms: self.elapsed().as_millis() as u64,
        }
    }
}

/// Live view of the running execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSnapshot {
    pub request_id: RequestId,
    pub sequence_id: String,
    pub sequence_name: String,
    pub priority: Priority,
    pub status: ExecutionStatus,
    pub movement_index: usize,
    pub beat_index: usize,
    pub total_beats: usize,
    pub completed_beats: Vec<CompletedBeat>,
    pub errors: Vec<BeatError>,
    pub payload: Map<String, Value>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// Outcome of a finished execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub request_id: RequestId,
    pub sequence_id: String,
    pub sequence_name: String,
    pub priority: Priority,
    pub status: ExecutionStatus,
    pub beats_completed: usize,
    pub total_beats: usize,
    pub errors: Vec<BeatError>,
    /// Why the execution failed or was cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ExecutionSummary {
    /// Outcome for a request that never reached the executor.
    pub(crate) fn unexecuted(
        request: &SequenceRequest,
        status: ExecutionStatus,
        failure: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request.id,
            sequence_id: request.sequence_id.clone(),
            sequence_name: request.sequence_name.clone(),
            priority: request.priority,
            status,
            beats_completed: 0,
            total_beats: 0,
            errors: Vec::new(),
            failure: Some(failure.into()),
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    /// Completed, but at least one beat recorded an error.
    pub fn completed_with_errors(&self) -> bool {
        self.status == ExecutionStatus::Completed && !self.errors.is_empty()
    }

    /// Completed without recording any beat error.
    pub fn is_clean(&self) -> bool {
        self.status == ExecutionStatus::Completed && self.errors.is_empty()
    }
}
