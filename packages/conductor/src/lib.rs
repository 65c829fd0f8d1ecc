//! # Conductor
//!
//! A single-slot orchestration engine for named, multi-step workflows.
//!
//! Work is described declaratively as a [`Sequence`] of movements, each an
//! ordered list of beats. A beat publishes one event on the [`EventBus`];
//! handlers supplied by mounted plugins react to it. Callers submit requests
//! against registered sequences and the engine runs them one at a time.
//!
//! ## Architecture
//!
//! ```text
//! submit()
//!     │
//!     ▼
//! Admission ── duplicate? ──► DUPLICATE sentinel (nothing queued)
//!     │
//!     ├─► Conflict Resolver ── REJECT ──► AdmissionError
//!     │        │
//!     │        ├── QUEUE ──► deferred until the resource is released
//!     │        └── INTERRUPT / ALLOW ──┐
//!     │                                ▼
//!     │                         AdmissionQueue (priority ordered)
//!     │                                │
//!     ▼                                ▼ drain worker
//! telemetry ◄──────────────── Executor ── beat by beat ──► EventBus ──► handlers
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Single flight** - at most one execution runs at any moment
//! 2. **Priority order** - HIGH before CHAINED before NORMAL, FIFO within a level
//! 3. **Beat order** - movements in declaration order, beats ascending
//! 4. **Exclusive ownership** - a resource has at most one owner
//! 5. **Nothing blocks forever** - every execution reaches a terminal status
//!    and frees the slot, including on handler panics
//!
//! ## Example
//!
//! ```ignore
//! use conductor::{handler, ConductorBuilder, ConductorConfig, Dynamics, HandlerTable, Priority, Sequence};
//! use serde_json::json;
//!
//! let sequence = Sequence::builder("canvas-drop", "Canvas.drop-symphony")
//!     .movement("place", |m| {
//!         m.beat(1, "canvas:validate", Dynamics::Piano)
//!             .beat(2, "canvas:render", Dynamics::Forte)
//!     })
//!     .build();
//!
//! let mut handlers = HandlerTable::new();
//! handlers.insert("canvas:validate".into(), handler(|_| Ok(())));
//! handlers.insert("canvas:render".into(), handler(|msg| {
//!     if let Some(baton) = msg.baton() {
//!         baton.set("rendered", json!(true));
//!     }
//!     Ok(())
//! }));
//!
//! let conductor = ConductorBuilder::new(ConductorConfig::from_env()?).build();
//! conductor.mount(sequence, Some(handlers), None, None);
//! let worker = conductor.start();
//!
//! let summary = conductor
//!     .submit_and_wait("canvas-drop", json!({ "componentId": "c1" }), Priority::Normal)
//!     .await?;
//!
//! worker.shutdown().await;
//! ```

// Core modules
mod bus;
mod config;
mod context;
mod dedup;
mod engine;
mod error;
mod executor;
mod gate;
mod plugin;
mod queue;
mod request;
mod resource;
mod sequence;
mod stats;

// Plugin loading
pub mod manifest;

// Telemetry topics and payloads
pub mod telemetry;

use std::any::Any;
use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-export the engine
pub use engine::{Conductor, ConductorBuilder, ConductorHandle};

// Re-export the data model
pub use sequence::{
    beat_duration, Beat, Dynamics, ErrorHandling, Movement, MovementBuilder, Sequence,
    SequenceBuilder, Timing, Validation, DEFAULT_TEMPO,
};
pub use request::{Priority, RequestId, SequenceRequest};

// Re-export bus types
pub use bus::{Baton, Callback, EventBus, Message, PublishReport, SubscriberFailure, Subscription};

// Re-export plugin types
pub use plugin::{handler, Handler, HandlerTable, MountResult, PluginInfo};

// Re-export execution state
pub use context::{
    CancelToken, CompletedBeat, ExecutionContext, ExecutionSnapshot, ExecutionStatus,
    ExecutionSummary,
};
pub use gate::{BeatGate, BeatPermit};

// Re-export admission building blocks
pub use dedup::{normalize, request_hash, DuplicateCheck, DuplicateDetector};
pub use queue::{AdmissionQueue, QueueStatus, QueuedRequest};
pub use resource::{Claim, ConflictDecision, ResourceOwnership, ResourceTracker};

// Re-export plugin loading
pub use manifest::{
    fallback_sequence, FsModuleLoader, HandlerFactory, ManifestReport, ModuleLoader,
    PluginDescriptor, PluginManifest, PluginModule, SkippedPlugin, FALLBACK_PLUGIN_ID,
};

// Re-export configuration and statistics
pub use config::ConductorConfig;
pub use stats::Statistics;

// Re-export error types
pub use error::{
    AdmissionError, BeatError, Categorizable, ErrorCategory, ManifestError, MountError,
    ResourceTransferError, SequenceError,
};

// Re-export telemetry payloads
pub use telemetry::{topics, TelemetryEvent};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Best-effort text of a caught panic payload.
#[allow(clippy::borrowed_box)]
pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
