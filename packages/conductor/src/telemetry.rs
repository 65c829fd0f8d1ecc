//! Lifecycle telemetry published on the bus.
//!
//! Every engine state transition publishes a [`TelemetryEvent`] on a topic
//! under the reserved `conductor:` prefix and mirrors it into `tracing`.
//! Plugins observe the engine by subscribing to these topics; they may not
//! declare beat events under the prefix themselves.
//!
//! Telemetry is always published after the engine's state lock is released,
//! so subscribers are free to call back into the engine.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::error::ErrorCategory;
use crate::request::{Priority, RequestId};
use crate::sequence::{Dynamics, ErrorHandling, Timing};

/// Prefix reserved for engine telemetry topics.
pub const RESERVED_PREFIX: &str = "conductor:";

/// Topic names.
pub mod topics {
    pub const SEQUENCE_QUEUED: &str = "conductor:sequence-queued";
    pub const SEQUENCE_DUPLICATE: &str = "conductor:sequence-duplicate";
    pub const SEQUENCE_DEFERRED: &str = "conductor:sequence-deferred";
    pub const SEQUENCE_READMITTED: &str = "conductor:sequence-readmitted";
    pub const RESOURCE_INTERRUPTED: &str = "conductor:resource-interrupted";
    pub const SEQUENCE_STARTED: &str = "conductor:sequence-started";
    pub const SEQUENCE_COMPLETED: &str = "conductor:sequence-completed";
    pub const SEQUENCE_FAILED: &str = "conductor:sequence-failed";
    pub const SEQUENCE_CANCELLED: &str = "conductor:sequence-cancelled";
    pub const BEAT_STARTED: &str = "conductor:beat-started";
    pub const BEAT_COMPLETED: &str = "conductor:beat-completed";
    pub const BEAT_FAILED: &str = "conductor:beat-failed";
    pub const PLUGIN_MOUNTED: &str = "conductor:plugin-mounted";
    pub const PLUGIN_UNMOUNTED: &str = "conductor:plugin-unmounted";
}

/// Payload of a telemetry topic.
///
/// Serialized with a `type` tag matching the topic suffix.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum TelemetryEvent {
    SequenceQueued {
        request_id: RequestId,
        sequence_id: String,
        sequence_name: String,
        priority: Priority,
        resource_id: String,
        queue_length: usize,
    },
    /// A submission suppressed inside the idempotency window.
    SequenceDuplicate {
        sequence_id: String,
        sequence_name: String,
        priority: Priority,
        hash: String,
        since_ms: u64,
        rapid: bool,
    },
    SequenceDeferred {
        request_id: RequestId,
        sequence_id: String,
        blocked_by: String,
        current_owner: String,
    },
    SequenceReadmitted {
        request_id: RequestId,
        sequence_id: String,
        resource_id: String,
    },
    ResourceInterrupted {
        resource_id: String,
        previous_owner: String,
        previous_instance: String,
        previous_execution: RequestId,
        new_owner: String,
        request_id: RequestId,
    },
    SequenceStarted {
        request_id: RequestId,
        sequence_id: String,
        sequence_name: String,
        priority: Priority,
        total_beats: usize,
    },
    SequenceCompleted {
        request_id: RequestId,
        sequence_id: String,
        beats_completed: usize,
        error_count: usize,
        duration_ms: u64,
    },
    SequenceFailed {
        request_id: RequestId,
        sequence_id: String,
        category: ErrorCategory,
        error: String,
        duration_ms: u64,
    },
    SequenceCancelled {
        request_id: RequestId,
        sequence_id: String,
        reason: String,
    },
    BeatStarted {
        request_id: RequestId,
        sequence_id: String,
        movement: String,
        beat: u32,
        event: String,
        timing: Timing,
        dynamics: Option<Dynamics>,
        payload: Map<String, Value>,
    },
    BeatCompleted {
        request_id: RequestId,
        sequence_id: String,
        movement: String,
        beat: u32,
        event: String,
        elapsed_ms: u64,
    },
    BeatFailed {
        request_id: RequestId,
        sequence_id: String,
        movement: String,
        beat: u32,
        event: String,
        attempt: u32,
        policy: ErrorHandling,
        message: String,
    },
    PluginMounted {
        plugin_id: String,
        sequence_id: String,
        warnings: usize,
    },
    PluginUnmounted {
        plugin_id: String,
        sequence_id: String,
    },
}

impl TelemetryEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            TelemetryEvent::SequenceQueued { .. } => topics::SEQUENCE_QUEUED,
            TelemetryEvent::SequenceDuplicate { .. } => topics::SEQUENCE_DUPLICATE,
            TelemetryEvent::SequenceDeferred { .. } => topics::SEQUENCE_DEFERRED,
            TelemetryEvent::SequenceReadmitted { .. } => topics::SEQUENCE_READMITTED,
            TelemetryEvent::ResourceInterrupted { .. } => topics::RESOURCE_INTERRUPTED,
            TelemetryEvent::SequenceStarted { .. } => topics::SEQUENCE_STARTED,
            TelemetryEvent::SequenceCompleted { .. } => topics::SEQUENCE_COMPLETED,
            TelemetryEvent::SequenceFailed { .. } => topics::SEQUENCE_FAILED,
            TelemetryEvent::SequenceCancelled { .. } => topics::SEQUENCE_CANCELLED,
            TelemetryEvent::BeatStarted { .. } => topics::BEAT_STARTED,
            TelemetryEvent::BeatCompleted { .. } => topics::BEAT_COMPLETED,
            TelemetryEvent::BeatFailed { .. } => topics::BEAT_FAILED,
            TelemetryEvent::PluginMounted { .. } => topics::PLUGIN_MOUNTED,
            TelemetryEvent::PluginUnmounted { .. } => topics::PLUGIN_UNMOUNTED,
        }
    }
}

/// Publish a telemetry event and mirror it into the trace.
///
/// Subscriber failures on telemetry topics are logged and otherwise ignored.
pub(crate) fn emit(bus: &EventBus, event: TelemetryEvent) {
    let topic = event.topic();
    let data = match serde_json::to_value(&event) {
        Ok(value) => value,
        Err(e) => {
            warn!(topic, error = %e, "failed to serialize telemetry");
            return;
        }
    };

    debug!(topic, payload = %data, "telemetry");

    let report = bus.publish(topic, data, None);
    for failure in &report.failures {
        warn!(
            topic,
            subscriber = failure.subscriber,
            error = %failure.message,
            "telemetry subscriber failed"
        );
    }
}
