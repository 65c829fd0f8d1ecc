//! Three-tier admission queue.
//!
//! Requests are ordered by tier (HIGH, then CHAINED, then NORMAL) and FIFO
//! within a tier. Nothing here blocks; every operation is O(n) or better.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::request::{Priority, RequestId, SequenceRequest};

/// Pending requests plus the id of the one currently executing.
#[derive(Debug, Default)]
pub struct AdmissionQueue {
    pending: VecDeque<SequenceRequest>,
    executing: Option<RequestId>,
    completed: u64,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert behind every request of the same or a higher tier.
    pub fn enqueue(&mut self, request: SequenceRequest) {
        let rank = request.priority.rank();
        let position = self
            .pending
            .iter()
            .position(|queued| queued.priority.rank() > rank)
            .unwrap_or(self.pending.len());
        self.pending.insert(position, request);
    }

    pub fn dequeue(&mut self) -> Option<SequenceRequest> {
        self.pending.pop_front()
    }

    pub fn peek(&self) -> Option<&SequenceRequest> {
        self.pending.front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every pending request, returning them.
    pub fn drain(&mut self) -> Vec<SequenceRequest> {
        self.pending.drain(..).collect()
    }

    /// Drop every pending request, returning how many were removed.
    pub fn clear(&mut self) -> usize {
        self.drain().len()
    }

    pub fn mark_executing(&mut self, id: RequestId) {
        self.executing = Some(id);
    }

    /// Clear the executing marker if it still points at `id`.
    ///
    /// Only a matching id counts toward [`completed_count`](Self::completed_count).
    pub fn mark_completed(&mut self, id: RequestId) -> bool {
        if self.executing != Some(id) {
            return false;
        }
        self.executing = None;
        self.completed += 1;
        true
    }

    pub fn executing(&self) -> Option<RequestId> {
        self.executing
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.pending.iter().any(|r| r.id == id)
    }

    /// Ids of every pending request, in dequeue order.
    pub fn pending_ids(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.pending.iter().map(|r| r.id)
    }

    pub fn completed_count(&self) -> u64 {
        self.completed
    }

    pub fn snapshot(&self) -> Vec<QueuedRequest> {
        self.pending.iter().map(QueuedRequest::from).collect()
    }
}

/// Diagnostic view of a pending request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedRequest {
    pub id: RequestId,
    pub sequence_id: String,
    pub sequence_name: String,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub resource_id: String,
}

impl From<&SequenceRequest> for QueuedRequest {
    fn from(request: &SequenceRequest) -> Self {
        Self {
            id: request.id,
            sequence_id: request.sequence_id.clone(),
            sequence_name: request.sequence_name.clone(),
            priority: request.priority,
            enqueued_at: request.enqueued_at,
            resource_id: request.resource_id.clone(),
        }
    }
}

/// Snapshot returned by `Conductor::queue_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub length: usize,
    pub is_executing: bool,
    pub active_request: Option<RequestId>,
    pub active_sequence: Option<String>,
    pub pending: Vec<QueuedRequest>,
    pub deferred: usize,
}
