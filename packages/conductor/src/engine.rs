//! The orchestration engine.
//!
//! [`Conductor`] owns every piece of engine state: the admission queue, the
//! duplicate detector, resource ownership, the sequence registry, mounted
//! plugins, statistics and history. It is explicitly constructed and cheap to
//! clone; there are no process-wide singletons.
//!
//! # Admission
//!
//! `submit` runs synchronously under the state lock:
//!
//! 1. resolve the sequence (`SequenceNotFound` otherwise)
//! 2. duplicate check; a duplicate returns [`RequestId::DUPLICATE`]
//! 3. record the hash before anything is queued
//! 4. derive owner, resource and instance ids
//! 5. conflict decision: ALLOW acquires, INTERRUPT transfers, REJECT errors,
//!    QUEUE parks the request until the resource is released
//! 6. enqueue, wake the drain worker, publish telemetry (after the lock drops)
//!
//! # Draining
//!
//! A single worker started by [`Conductor::start`] loops: dequeue, run to a
//! terminal status, release the request's resource, repeat. It parks on a
//! `Notify` when the queue is empty. A request whose sequence was unmounted
//! while it waited is logged and skipped.
//!
//! # Locking
//!
//! Lock order is plugins, then state. No engine lock is held while bus
//! subscribers run, so handlers may call back into the engine.
//!
//! # Example
//!
//! ```ignore
//! let conductor = ConductorBuilder::new(ConductorConfig::default()).build();
//! conductor.mount(sequence, Some(handlers), None, None);
//! let worker = conductor.start();
//!
//! let summary = conductor
//!     .submit_and_wait("canvas-drop", json!({ "componentId": "c1" }), Priority::Normal)
//!     .await?;
//!
//! worker.shutdown().await;
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, Message, Subscription};
use crate::config::ConductorConfig;
use crate::context::{
    CancelToken, ExecutionContext, ExecutionSnapshot, ExecutionStatus, ExecutionSummary,
};
use crate::dedup::{request_hash, DuplicateCheck, DuplicateDetector};
use crate::error::{describe_requester, AdmissionError, SequenceError};
use crate::executor::Executor;
use crate::lock_unpoisoned;
use crate::manifest::{
    fallback_sequence, ManifestReport, ModuleLoader, SkippedPlugin, FALLBACK_PLUGIN_ID,
};
use crate::plugin::{HandlerTable, MountResult, PluginInfo, PluginRecord, PluginRegistry};
use crate::queue::{AdmissionQueue, QueueStatus};
use crate::request::{self, Priority, RequestId, SequenceRequest};
use crate::resource::{Claim, ConflictDecision, ResourceOwnership, ResourceTracker};
use crate::sequence::Sequence;
use crate::stats::Statistics;
use crate::telemetry::{self, TelemetryEvent};

// =============================================================================
// Completion Tracking
// =============================================================================

#[derive(Default)]
struct CompletionEntry {
    waiters: AtomicUsize,
    outcome: Mutex<Option<ExecutionSummary>>,
    notify: Notify,
}

/// Terminal outcomes keyed by request id, kept only while someone waits.
#[derive(Default)]
struct CompletionTracker {
    entries: DashMap<RequestId, Arc<CompletionEntry>>,
}

impl CompletionTracker {
    fn register(&self, id: RequestId) {
        self.entries.insert(id, Arc::new(CompletionEntry::default()));
    }

    /// Attach a waiter to a pending request.
    fn waiter(&self, id: RequestId) -> Option<WaiterGuard<'_>> {
        let entry = self.entries.get(&id).map(|e| e.value().clone())?;
        entry.waiters.fetch_add(1, Ordering::AcqRel);
        Some(WaiterGuard {
            tracker: self,
            id,
            entry,
        })
    }

    fn complete(&self, id: RequestId, summary: ExecutionSummary) {
        let Some(entry) = self.entries.get(&id).map(|e| e.value().clone()) else {
            return;
        };
        *lock_unpoisoned(&entry.outcome) = Some(summary);
        entry.notify.notify_waiters();
        if entry.waiters.load(Ordering::Acquire) == 0 {
            self.entries.remove(&id);
        }
    }

    fn pending(&self) -> usize {
        self.entries.len()
    }
}

/// Counts a waiter; the entry is dropped once it is resolved and unwatched.
struct WaiterGuard<'a> {
    tracker: &'a CompletionTracker,
    id: RequestId,
    entry: Arc<CompletionEntry>,
}

impl WaiterGuard<'_> {
    async fn wait(&self) -> ExecutionSummary {
        loop {
            // Register before checking; notify_waiters only reaches existing futures.
            let notified = self.entry.notify.notified();
            let outcome = lock_unpoisoned(&self.entry.outcome).clone();
            if let Some(summary) = outcome {
                return summary;
            }
            notified.await;
        }
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let last = self.entry.waiters.fetch_sub(1, Ordering::AcqRel) == 1;
        if last && lock_unpoisoned(&self.entry.outcome).is_some() {
            self.tracker.entries.remove(&self.id);
        }
    }
}

// =============================================================================
// Engine State
// =============================================================================

struct EngineState {
    queue: AdmissionQueue,
    dedup: DuplicateDetector,
    resources: ResourceTracker,
    sequences: HashMap<String, Arc<Sequence>>,
    active: Option<Arc<ExecutionContext>>,
    deferred: Vec<SequenceRequest>,
    stats: Statistics,
    history: VecDeque<ExecutionSummary>,
}

impl EngineState {
    fn new(config: &ConductorConfig) -> Self {
        Self {
            queue: AdmissionQueue::new(),
            dedup: DuplicateDetector::new(
                config.idempotency_window,
                config.strict_mode_threshold,
                config.dedup_capacity,
            ),
            resources: ResourceTracker::new(config.ownership_ttl, config.defer_on_conflict),
            sequences: HashMap::new(),
            active: None,
            deferred: Vec::new(),
            stats: Statistics::default(),
            history: VecDeque::new(),
        }
    }

    fn claim(request: &SequenceRequest) -> Claim {
        Claim {
            resource_id: request.resource_id.clone(),
            owner: request.owner.clone(),
            instance_id: request.instance_id.clone(),
            priority: request.priority,
            execution_id: request.id,
        }
    }

    /// Re-admit requests parked behind `resource_id`, in arrival order.
    fn readmit(
        &mut self,
        resource_id: &str,
        now: Instant,
        completions: &CompletionTracker,
    ) -> Vec<TelemetryEvent> {
        let (waiting, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|r| r.blocked_by.as_deref() == Some(resource_id));
        self.deferred = rest;

        let mut events = Vec::new();
        for mut request in waiting {
            let claim = Self::claim(&request);
            match self.resources.decide(&claim) {
                ConflictDecision::Allow { .. } => {
                    if let Err(reason) = self.resources.acquire(&claim, now).map(|_| ()) {
                        self.reject_deferred(&request, &reason, completions);
                        continue;
                    }
                    request.blocked_by = None;
                    info!(
                        request_id = %request.id,
                        sequence_id = %request.sequence_id,
                        resource_id,
                        "deferred request readmitted"
                    );
                    events.push(TelemetryEvent::SequenceReadmitted {
                        request_id: request.id,
                        sequence_id: request.sequence_id.clone(),
                        resource_id: resource_id.to_string(),
                    });
                    self.queue.enqueue(request);
                    self.stats.total_queued += 1;
                }
                ConflictDecision::Queue { .. } => self.deferred.push(request),
                ConflictDecision::Reject { reason, .. } => {
                    self.reject_deferred(&request, &reason, completions);
                }
                ConflictDecision::Interrupt { current } => {
                    let reason = format!("{} is owned by {}", resource_id, current.owner);
                    self.reject_deferred(&request, &reason, completions);
                }
            }
        }
        events
    }

    fn reject_deferred(
        &mut self,
        request: &SequenceRequest,
        reason: &str,
        completions: &CompletionTracker,
    ) {
        warn!(request_id = %request.id, sequence_id = %request.sequence_id, reason, "deferred request rejected");
        self.stats.rejected += 1;
        completions.complete(
            request.id,
            ExecutionSummary::unexecuted(request, ExecutionStatus::Failed, reason),
        );
    }

    /// Release what `request` holds and re-admit whatever waited on it.
    fn release_request(
        &mut self,
        request: &SequenceRequest,
        now: Instant,
        completions: &CompletionTracker,
    ) -> Vec<TelemetryEvent> {
        match self.resources.release_for(&request.resource_id, request.id) {
            Some(_) => {
                debug!(request_id = %request.id, resource_id = %request.resource_id, "resource released");
                self.readmit(&request.resource_id, now, completions)
            }
            None => Vec::new(),
        }
    }

    /// Drop ownership left behind by idle instances.
    fn cleanup(&mut self, now: Instant, completions: &CompletionTracker) -> Vec<TelemetryEvent> {
        self.dedup.prune(now);
        let live: HashSet<RequestId> = self
            .queue
            .pending_ids()
            .chain(self.active.as_ref().map(|ctx| ctx.execution_id()))
            .collect();
        let released = self.resources.cleanup_stale(now, &live);
        let mut events = Vec::new();
        for resource_id in released {
            debug!(%resource_id, "stale ownership released");
            events.extend(self.readmit(&resource_id, now, completions));
        }
        events
    }
}

// =============================================================================
// Conductor
// =============================================================================

struct Inner {
    config: ConductorConfig,
    bus: EventBus,
    plugins: Mutex<PluginRegistry>,
    state: Mutex<EngineState>,
    executor: Executor,
    completions: CompletionTracker,
    /// Signals the drain worker that work may be available.
    wake: Notify,
    /// Signals `wait_idle` callers after each execution.
    idle: Notify,
}

enum Job {
    Run(Arc<Sequence>, Arc<ExecutionContext>),
    Missing(SequenceRequest),
}

/// Handle to the orchestration engine.
///
/// Cloning shares the same engine.
#[derive(Clone)]
pub struct Conductor {
    inner: Arc<Inner>,
}

impl Conductor {
    pub fn builder(config: ConductorConfig) -> ConductorBuilder {
        ConductorBuilder::new(config)
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.inner.config
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Spawn the drain worker.
    pub fn start(&self) -> ConductorHandle {
        info!("starting conductor");
        let shutdown = CancelToken::new();
        let handle = tokio::spawn(drain(self.inner.clone(), shutdown.clone()));
        ConductorHandle { shutdown, handle }
    }

    /// Clear the queue, deferred requests, dedup store, ownership, statistics
    /// and history. Mounted plugins stay mounted.
    ///
    /// A running execution is cancelled.
    pub fn reset(&self) {
        let (cleared, active) = {
            let mut state = lock_unpoisoned(&self.inner.state);
            let mut cleared: Vec<SequenceRequest> = std::mem::take(&mut state.deferred);
            cleared.extend(state.queue.drain());
            state.dedup.clear();
            state.resources.clear();
            state.stats = Statistics::default();
            state.history.clear();
            (cleared, state.active.clone())
        };

        if let Some(ctx) = active {
            ctx.cancel_token().cancel("conductor reset");
        }
        for request in &cleared {
            self.inner.completions.complete(
                request.id,
                ExecutionSummary::unexecuted(
                    request,
                    ExecutionStatus::Cancelled,
                    SequenceError::Cleared(request.id).to_string(),
                ),
            );
        }
        info!(cleared = cleared.len(), "conductor reset");
        self.inner.idle.notify_waiters();
    }

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------

    /// Admit a request for `sequence_id`.
    ///
    /// `data` must be a JSON object or null. A duplicate inside the
    /// idempotency window returns [`RequestId::DUPLICATE`].
    pub fn submit(
        &self,
        sequence_id: &str,
        data: Value,
        priority: Priority,
    ) -> Result<RequestId, AdmissionError> {
        self.admit(sequence_id, data, priority, false)
            .map(|(id, _)| id)
    }

    /// Submit and wait for the request's terminal outcome.
    ///
    /// Returns `None` for a suppressed duplicate.
    pub async fn submit_and_wait(
        &self,
        sequence_id: &str,
        data: Value,
        priority: Priority,
    ) -> Result<Option<ExecutionSummary>, AdmissionError> {
        let (_, waiter) = self.admit(sequence_id, data, priority, true)?;
        match waiter {
            Some(waiter) => Ok(Some(waiter.wait().await)),
            None => Ok(None),
        }
    }

    /// Wait for a submitted request to finish.
    ///
    /// Requests that already finished are answered from history.
    pub async fn wait_for(&self, request_id: RequestId) -> Result<ExecutionSummary, SequenceError> {
        if let Some(waiter) = self.inner.completions.waiter(request_id) {
            return Ok(waiter.wait().await);
        }

        self.finished(request_id)
            .ok_or(SequenceError::UnknownRequest(request_id))
    }

    fn finished(&self, request_id: RequestId) -> Option<ExecutionSummary> {
        lock_unpoisoned(&self.inner.state)
            .history
            .iter()
            .rev()
            .find(|summary| summary.request_id == request_id)
            .cloned()
    }

    /// Wait until nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    fn is_idle(&self) -> bool {
        let state = lock_unpoisoned(&self.inner.state);
        state.queue.is_empty() && state.active.is_none()
    }

    fn admit(
        &self,
        sequence_id: &str,
        data: Value,
        priority: Priority,
        wait: bool,
    ) -> Result<(RequestId, Option<WaiterGuard<'_>>), AdmissionError> {
        let mut events = Vec::new();
        let result = self.admit_locked(sequence_id, data, priority, wait, &mut events);

        if matches!(&result, Ok((id, _)) if !id.is_duplicate()) {
            self.inner.wake.notify_one();
        }
        for event in events {
            telemetry::emit(&self.inner.bus, event);
        }
        result
    }

    fn admit_locked(
        &self,
        sequence_id: &str,
        data: Value,
        priority: Priority,
        wait: bool,
        events: &mut Vec<TelemetryEvent>,
    ) -> Result<(RequestId, Option<WaiterGuard<'_>>), AdmissionError> {
        let data = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(AdmissionError::Malformed(format!(
                    "request data must be a JSON object, got {}",
                    json_kind(&other)
                )))
            }
        };

        let mut state = lock_unpoisoned(&self.inner.state);
        let now = Instant::now();

        // 1. Resolve
        let sequence = state.sequences.get(sequence_id).cloned().ok_or_else(|| {
            AdmissionError::SequenceNotFound {
                sequence_id: sequence_id.to_string(),
            }
        })?;

        // 2-3. Duplicate check, record before queueing
        state.dedup.prune(now);
        let hash = request_hash(&sequence.name, priority, &data);
        if !sequence.bypass_dedup {
            if let DuplicateCheck::Duplicate { since, rapid } = state.dedup.check(&hash, now) {
                state.stats.duplicates_suppressed += 1;
                info!(
                    sequence_id,
                    %priority,
                    since_ms = since.as_millis() as u64,
                    rapid,
                    "duplicate submission suppressed"
                );
                events.push(TelemetryEvent::SequenceDuplicate {
                    sequence_id: sequence.id.clone(),
                    sequence_name: sequence.name.clone(),
                    priority,
                    hash,
                    since_ms: since.as_millis() as u64,
                    rapid,
                });
                return Ok((RequestId::DUPLICATE, None));
            }
            state.dedup.record(hash.clone(), now);
        }

        // 4. Derive identities
        let owner = request::owner_name(&sequence.name);
        let mut request = SequenceRequest {
            id: RequestId::new(),
            sequence_id: sequence.id.clone(),
            sequence_name: sequence.name.clone(),
            resource_id: request::resource_id(&owner, &data),
            instance_id: request::instance_id(&owner, &data),
            owner,
            data,
            priority,
            enqueued_at: Utc::now(),
            hash,
            blocked_by: None,
        };
        let claim = EngineState::claim(&request);

        // 5. Conflict decision
        match state.resources.decide(&claim) {
            ConflictDecision::Allow { reentry } => {
                if let Err(reason) = state.resources.acquire(&claim, now).map(|_| ()) {
                    return Err(AdmissionError::ResourceConflict {
                        resource_id: request.resource_id.clone(),
                        current_owner: state
                            .resources
                            .owner_of(&request.resource_id)
                            .map(|o| o.owner.clone())
                            .unwrap_or_default(),
                        requester: describe_requester(&request.owner, &request.instance_id, priority),
                        reason,
                    });
                }
                debug!(
                    request_id = %request.id,
                    resource_id = %request.resource_id,
                    reentry,
                    "resource acquired"
                );
            }
            ConflictDecision::Interrupt { current } => {
                let previous = state.resources.transfer(&claim, now)?;
                state.stats.interrupts += 1;
                warn!(
                    resource_id = %request.resource_id,
                    previous_owner = %previous.owner,
                    new_owner = %request.owner,
                    "resource interrupted"
                );
                events.push(TelemetryEvent::ResourceInterrupted {
                    resource_id: request.resource_id.clone(),
                    previous_owner: current.owner,
                    previous_instance: current.instance_id,
                    previous_execution: current.execution_id,
                    new_owner: request.owner.clone(),
                    request_id: request.id,
                });
            }
            ConflictDecision::Reject { current, reason } => {
                state.stats.rejected += 1;
                warn!(
                    sequence_id,
                    resource_id = %request.resource_id,
                    current_owner = %current.owner,
                    %reason,
                    "submission rejected"
                );
                return Err(AdmissionError::ResourceConflict {
                    resource_id: request.resource_id,
                    current_owner: current.owner,
                    requester: describe_requester(&request.owner, &request.instance_id, priority),
                    reason,
                });
            }
            ConflictDecision::Queue {
                current,
                blocked_by,
            } => {
                let id = request.id;
                state.stats.deferred += 1;
                info!(
                    request_id = %id,
                    sequence_id,
                    blocked_by = %blocked_by,
                    current_owner = %current.owner,
                    "submission deferred"
                );
                events.push(TelemetryEvent::SequenceDeferred {
                    request_id: id,
                    sequence_id: request.sequence_id.clone(),
                    blocked_by: blocked_by.clone(),
                    current_owner: current.owner,
                });
                request.blocked_by = Some(blocked_by);
                state.deferred.push(request);

                self.inner.completions.register(id);
                let waiter = wait.then(|| self.inner.completions.waiter(id)).flatten();
                return Ok((id, waiter));
            }
        }

        // 6. Enqueue
        let id = request.id;
        let resource_id = request.resource_id.clone();
        state.queue.enqueue(request);
        state.stats.total_queued += 1;
        let queue_length = state.queue.len();

        self.inner.completions.register(id);
        let waiter = wait.then(|| self.inner.completions.waiter(id)).flatten();

        info!(request_id = %id, sequence_id, %priority, %resource_id, queue_length, "sequence queued");
        events.push(TelemetryEvent::SequenceQueued {
            request_id: id,
            sequence_id: sequence.id.clone(),
            sequence_name: sequence.name.clone(),
            priority,
            resource_id,
            queue_length,
        });

        Ok((id, waiter))
    }

    /// Cancel the running execution. Returns `false` if nothing was running
    /// or it was already cancelled.
    pub fn cancel_current(&self, reason: impl Into<String>) -> bool {
        let active = lock_unpoisoned(&self.inner.state).active.clone();
        match active {
            Some(ctx) => {
                let cancelled = ctx.cancel_token().cancel(reason);
                if cancelled {
                    info!(request_id = %ctx.execution_id(), "cancellation requested");
                }
                cancelled
            }
            None => false,
        }
    }

    /// Drop every queued and deferred request, releasing their resources.
    ///
    /// Returns how many requests were removed.
    pub fn clear_queue(&self) -> usize {
        let cleared = {
            let mut state = lock_unpoisoned(&self.inner.state);
            let mut cleared: Vec<SequenceRequest> = std::mem::take(&mut state.deferred);
            cleared.extend(state.queue.drain());
            for request in &cleared {
                state.resources.release_for(&request.resource_id, request.id);
            }
            cleared
        };

        for request in &cleared {
            self.inner.completions.complete(
                request.id,
                ExecutionSummary::unexecuted(
                    request,
                    ExecutionStatus::Cancelled,
                    SequenceError::Cleared(request.id).to_string(),
                ),
            );
        }
        if !cleared.is_empty() {
            info!(cleared = cleared.len(), "queue cleared");
        }
        self.inner.idle.notify_waiters();
        cleared.len()
    }

    // -------------------------------------------------------------------------
    // Plugins
    // -------------------------------------------------------------------------

    /// Validate and mount a plugin.
    ///
    /// `plugin_id` defaults to the sequence name. Never panics or errors;
    /// failures come back in the [`MountResult`].
    pub fn mount(
        &self,
        sequence: Sequence,
        handlers: Option<HandlerTable>,
        plugin_id: Option<&str>,
        metadata: Option<Value>,
    ) -> MountResult {
        let plugin_id = plugin_id
            .map(str::to_string)
            .unwrap_or_else(|| sequence.name.clone());

        let mut plugins = lock_unpoisoned(&self.inner.plugins);
        let warnings = match plugins.validate(&plugin_id, &sequence, handlers.as_ref()) {
            Ok(warnings) => warnings,
            Err((warnings, error)) => {
                warn!(plugin_id = %plugin_id, reason = error.reason(), error = %error, "mount rejected");
                return MountResult::failed(plugin_id, warnings, error);
            }
        };

        let sequence = Arc::new(sequence);
        let mut handler_events = BTreeSet::new();
        let mut subscriptions = Vec::new();
        for (event, handler) in handlers.into_iter().flatten() {
            subscriptions.push(self.inner.bus.subscribe_arc(event.clone(), handler));
            handler_events.insert(event);
        }

        lock_unpoisoned(&self.inner.state)
            .sequences
            .insert(sequence.id.clone(), sequence.clone());

        plugins.insert(PluginRecord {
            id: plugin_id.clone(),
            sequence: sequence.clone(),
            handler_events,
            subscriptions,
            metadata,
            warnings: warnings.clone(),
            mounted_at: Utc::now(),
        });
        drop(plugins);

        for warning in &warnings {
            debug!(plugin_id = %plugin_id, %warning, "mount warning");
        }
        info!(plugin_id = %plugin_id, sequence_id = %sequence.id, warnings = warnings.len(), "plugin mounted");
        telemetry::emit(
            &self.inner.bus,
            TelemetryEvent::PluginMounted {
                plugin_id: plugin_id.clone(),
                sequence_id: sequence.id.clone(),
                warnings: warnings.len(),
            },
        );

        MountResult::mounted(plugin_id, warnings)
    }

    /// Unregister a plugin's sequence and handlers.
    ///
    /// Requests already queued for its sequence are skipped when dequeued.
    pub fn unmount(&self, plugin_id: &str) -> bool {
        let mut plugins = lock_unpoisoned(&self.inner.plugins);
        let Some(record) = plugins.remove(plugin_id) else {
            return false;
        };
        for subscription in &record.subscriptions {
            self.inner.bus.unsubscribe(subscription);
        }
        lock_unpoisoned(&self.inner.state)
            .sequences
            .remove(&record.sequence.id);
        drop(plugins);

        info!(plugin_id, sequence_id = %record.sequence.id, "plugin unmounted");
        telemetry::emit(
            &self.inner.bus,
            TelemetryEvent::PluginUnmounted {
                plugin_id: record.id.clone(),
                sequence_id: record.sequence.id.clone(),
            },
        );
        true
    }

    pub fn plugin_info(&self, plugin_id: &str) -> Option<PluginInfo> {
        lock_unpoisoned(&self.inner.plugins).info(plugin_id)
    }

    pub fn mounted_plugin_ids(&self) -> Vec<String> {
        lock_unpoisoned(&self.inner.plugins).ids()
    }

    /// Unmount every plugin.
    pub fn unmount_all(&self) -> usize {
        let records = lock_unpoisoned(&self.inner.plugins).drain();
        let count = records.len();
        for record in records {
            for subscription in &record.subscriptions {
                self.inner.bus.unsubscribe(subscription);
            }
            lock_unpoisoned(&self.inner.state)
                .sequences
                .remove(&record.sequence.id);
        }
        count
    }

    /// Registered sequence, if any plugin provides `sequence_id`.
    pub fn sequence(&self, sequence_id: &str) -> Option<Arc<Sequence>> {
        lock_unpoisoned(&self.inner.state)
            .sequences
            .get(sequence_id)
            .cloned()
    }

    /// Mount every `autoMount` plugin listed in a manifest.
    ///
    /// If the manifest itself cannot be loaded, the built-in fallback
    /// sequence is mounted instead.
    pub async fn mount_from_manifest<L>(&self, loader: &L, manifest_path: impl AsRef<Path>) -> ManifestReport
    where
        L: ModuleLoader + ?Sized,
    {
        let manifest_path = manifest_path.as_ref();
        let mut report = ManifestReport::default();

        let manifest = match loader.load_manifest(manifest_path).await {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(path = %manifest_path.display(), error = %e, "manifest unavailable, mounting fallback");
                report.warnings.push(e.to_string());
                report.fallback_used = true;
                if lock_unpoisoned(&self.inner.plugins).contains(FALLBACK_PLUGIN_ID) {
                    report.already_mounted.push(FALLBACK_PLUGIN_ID.to_string());
                    return report;
                }
                let result = self.mount(fallback_sequence(), None, Some(FALLBACK_PLUGIN_ID), None);
                match result.error {
                    None => report.mounted.push(result.plugin_id),
                    Some(error) => report.failed.push((result.plugin_id, error)),
                }
                return report;
            }
        };

        for descriptor in &manifest.plugins {
            if !descriptor.auto_mount {
                report.manual.push(descriptor.name.clone());
                continue;
            }
            if lock_unpoisoned(&self.inner.plugins).contains(&descriptor.name) {
                report.already_mounted.push(descriptor.name.clone());
                continue;
            }

            let module = match loader.load_module(descriptor).await {
                Ok(module) => module,
                Err(e) => {
                    warn!(plugin = %descriptor.name, error = %e, "plugin module could not be loaded");
                    report.skipped.push(SkippedPlugin {
                        name: descriptor.name.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let (sequence, handlers) = match (module.sequence, module.handlers) {
                (Some(sequence), Some(handlers)) => (sequence, handlers),
                (sequence, _) => {
                    let missing = if sequence.is_none() {
                        "sequence"
                    } else {
                        "handler table"
                    };
                    let reason = format!("module does not export a {missing}");
                    warn!(plugin = %descriptor.name, %reason, "plugin skipped");
                    report
                        .warnings
                        .push(format!("{}: {reason}", descriptor.name));
                    report.skipped.push(SkippedPlugin {
                        name: descriptor.name.clone(),
                        reason,
                    });
                    continue;
                }
            };

            let metadata = serde_json::json!({
                "path": descriptor.path,
                "version": descriptor.version,
            });
            let result = self.mount(sequence, Some(handlers), Some(&descriptor.name), Some(metadata));
            report.warnings.extend(
                result
                    .warnings
                    .iter()
                    .map(|w| format!("{}: {w}", descriptor.name)),
            );
            match result.error {
                None => report.mounted.push(result.plugin_id),
                Some(error) => report.failed.push((result.plugin_id, error)),
            }
        }

        info!(
            mounted = report.mounted.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "manifest processed"
        );
        report
    }

    // -------------------------------------------------------------------------
    // Bus access
    // -------------------------------------------------------------------------

    pub fn subscribe<F>(&self, topic: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(topic, callback)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.inner.bus.unsubscribe(subscription)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.bus.subscriber_count(topic)
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn statistics(&self) -> Statistics {
        let state = lock_unpoisoned(&self.inner.state);
        let mut stats = state.stats.clone();
        stats.current_queue_length = state.queue.len();
        stats
    }

    pub fn queue_status(&self) -> QueueStatus {
        let state = lock_unpoisoned(&self.inner.state);
        QueueStatus {
            length: state.queue.len(),
            is_executing: state.active.is_some(),
            active_request: state.queue.executing(),
            active_sequence: state
                .active
                .as_ref()
                .map(|ctx| ctx.request().sequence_id.clone()),
            pending: state.queue.snapshot(),
            deferred: state.deferred.len(),
        }
    }

    /// Whether anything (or the given sequence) is executing.
    pub fn is_running(&self, sequence_id: Option<&str>) -> bool {
        let state = lock_unpoisoned(&self.inner.state);
        match (&state.active, sequence_id) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(ctx), Some(id)) => ctx.request().sequence_id == id,
        }
    }

    /// Whether a beat's handlers are running right now.
    pub fn beat_in_progress(&self) -> bool {
        self.inner.executor.gate().is_busy()
    }

    pub fn current_execution(&self) -> Option<ExecutionSnapshot> {
        let active = lock_unpoisoned(&self.inner.state).active.clone();
        active.map(|ctx| ctx.snapshot())
    }

    /// Finished executions, oldest first.
    pub fn execution_history(&self) -> Vec<ExecutionSummary> {
        lock_unpoisoned(&self.inner.state)
            .history
            .iter()
            .cloned()
            .collect()
    }

    /// Merge into the running execution's shared payload.
    ///
    /// Returns `false` when nothing is running.
    pub fn update_shared_payload(&self, data: Map<String, Value>) -> bool {
        let active = lock_unpoisoned(&self.inner.state).active.clone();
        match active {
            Some(ctx) => {
                ctx.baton().merge(data);
                true
            }
            None => false,
        }
    }

    pub fn shared_payload(&self) -> Option<Map<String, Value>> {
        let active = lock_unpoisoned(&self.inner.state).active.clone();
        active.map(|ctx| ctx.baton().snapshot())
    }

    pub fn resource_ownership(&self) -> Vec<ResourceOwnership> {
        lock_unpoisoned(&self.inner.state).resources.snapshot()
    }

    pub fn owner_resource_map(&self) -> BTreeMap<String, Vec<String>> {
        lock_unpoisoned(&self.inner.state).resources.owner_map()
    }

    /// Requests with a registered completion entry that have not resolved yet.
    pub fn pending_completions(&self) -> usize {
        self.inner.completions.pending()
    }
}

impl std::fmt::Debug for Conductor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conductor")
            .field("config", &self.inner.config)
            .field("bus", &self.inner.bus)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Drain Worker
// =============================================================================

async fn drain(inner: Arc<Inner>, shutdown: CancelToken) {
    debug!("drain worker started");
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        match next_job(&inner) {
            Some(Job::Run(sequence, ctx)) => {
                let summary = inner.executor.execute(&sequence, &ctx).await;
                finish(&inner, &ctx, summary);
            }
            Some(Job::Missing(request)) => {
                let error = SequenceError::SequenceMissing {
                    sequence_id: request.sequence_id.clone(),
                    request_id: request.id,
                };
                warn!(request_id = %request.id, sequence_id = %request.sequence_id, "sequence missing, skipping request");
                inner.completions.complete(
                    request.id,
                    ExecutionSummary::unexecuted(&request, ExecutionStatus::Failed, error.to_string()),
                );
            }
            None => {
                inner.idle.notify_waiters();
                tokio::select! {
                    _ = inner.wake.notified() => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }
    }
    debug!("drain worker stopped");
}

/// Dequeue the next runnable request and make it the active execution.
fn next_job(inner: &Inner) -> Option<Job> {
    let mut events = Vec::new();
    let job = {
        let mut state = lock_unpoisoned(&inner.state);
        if state.active.is_some() {
            return None;
        }
        let now = Instant::now();
        events.extend(state.cleanup(now, &inner.completions));

        match state.queue.dequeue() {
            None => None,
            Some(request) => match state.sequences.get(&request.sequence_id).cloned() {
                Some(sequence) => {
                    let ctx = Arc::new(ExecutionContext::new(request, sequence.total_beats()));
                    state.queue.mark_executing(ctx.execution_id());
                    state.active = Some(ctx.clone());
                    Some(Job::Run(sequence, ctx))
                }
                None => {
                    events.extend(state.release_request(&request, now, &inner.completions));
                    Some(Job::Missing(request))
                }
            },
        }
    };

    for event in events {
        telemetry::emit(&inner.bus, event);
    }
    job
}

/// Free the executor slot and record the outcome.
fn finish(inner: &Inner, ctx: &ExecutionContext, summary: ExecutionSummary) {
    let request = ctx.request();
    let events = {
        let mut state = lock_unpoisoned(&inner.state);
        state.active = None;
        state.queue.mark_completed(request.id);
        state.stats.record_execution(&summary);
        state.history.push_back(summary.clone());
        while state.history.len() > inner.config.history_limit {
            state.history.pop_front();
        }
        state.release_request(request, Instant::now(), &inner.completions)
    };

    if !events.is_empty() {
        inner.wake.notify_one();
    }
    for event in events {
        telemetry::emit(&inner.bus, event);
    }
    inner.completions.complete(request.id, summary);
    inner.idle.notify_waiters();
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Conductor Handle
// =============================================================================

/// Handle to the running drain worker.
pub struct ConductorHandle {
    shutdown: CancelToken,
    handle: JoinHandle<()>,
}

impl ConductorHandle {
    /// Stop the worker after the current execution finishes.
    pub async fn shutdown(self) {
        self.shutdown.cancel("shutdown");
        if let Err(e) = self.handle.await {
            warn!(error = %e, "drain worker ended abnormally");
        }
        info!("conductor stopped");
    }

    /// Abort the worker immediately.
    ///
    /// Intended for test teardown.
    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl std::fmt::Debug for ConductorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConductorHandle")
            .field("finished", &self.handle.is_finished())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Conductor Builder
// =============================================================================

/// Builder for a [`Conductor`].
///
/// ```ignore
/// let conductor = ConductorBuilder::new(ConductorConfig::from_env()?)
///     .with_bus(shared_bus)
///     .build();
/// ```
pub struct ConductorBuilder {
    config: ConductorConfig,
    bus: Option<EventBus>,
}

impl ConductorBuilder {
    pub fn new(config: ConductorConfig) -> Self {
        Self { config, bus: None }
    }

    /// Use an existing bus instead of creating one.
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> Conductor {
        let bus = self.bus.unwrap_or_default();
        let executor = Executor::new(
            bus.clone(),
            self.config.default_tempo,
            self.config.beat_retry_limit,
            self.config.retry_backoff,
        );
        let state = EngineState::new(&self.config);

        Conductor {
            inner: Arc::new(Inner {
                config: self.config,
                bus,
                plugins: Mutex::new(PluginRegistry::new()),
                state: Mutex::new(state),
                executor,
                completions: CompletionTracker::default(),
                wake: Notify::new(),
                idle: Notify::new(),
            }),
        }
    }
}

impl Default for ConductorBuilder {
    fn default() -> Self {
        Self::new(ConductorConfig::default())
    }
}
