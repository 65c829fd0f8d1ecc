//! Sequence → movement → beat execution.
//!
//! # Beat lifecycle
//!
//! ```text
//! check cancel ─► acquire gate ─► beat-started ─► publish event ─┬─► beat-completed
//!                                                   ▲            │
//!                                                   └─ retry ◄───┴─► beat-failed
//!                                                                     │
//!                                       continue / abort-sequence ◄───┘
//! ```
//!
//! After a beat, the executor waits the delay implied by its timing policy
//! (skipped after the final beat). Delays and retry backoff are cancellable.
//!
//! "Beat completed" means every subscriber of the beat's event returned.
//! Work a handler spawns in the background is not awaited.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::context::{CompletedBeat, ExecutionContext, ExecutionStatus, ExecutionSummary};
use crate::error::{BeatError, Categorizable, SequenceError};
use crate::gate::BeatGate;
use crate::panic_message;
use crate::sequence::{beat_duration, Beat, ErrorHandling, Movement, Sequence};
use crate::telemetry::{self, TelemetryEvent};

/// Event name recorded for the synthetic error a cancellation leaves behind.
const CANCELLED_EVENT: &str = "conductor:cancelled";

/// Runs one execution at a time, beat by beat, over the bus.
#[derive(Debug)]
pub(crate) struct Executor {
    bus: EventBus,
    gate: BeatGate,
    default_tempo: u32,
    retry_limit: u32,
    retry_backoff: Duration,
}

/// Where a beat sits in the sequence.
struct BeatPosition<'a> {
    movement: &'a Movement,
    movement_index: usize,
    beat_index: usize,
    ordinal: usize,
    total_beats: usize,
}

impl Executor {
    pub(crate) fn new(
        bus: EventBus,
        default_tempo: u32,
        retry_limit: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            bus,
            gate: BeatGate::new(),
            default_tempo,
            retry_limit,
            retry_backoff,
        }
    }

    pub(crate) fn gate(&self) -> &BeatGate {
        &self.gate
    }

    /// Run `sequence` to a terminal status and return its summary.
    ///
    /// Never fails: beat errors, cancellation and panics all end up in the
    /// summary and in telemetry.
    pub(crate) async fn execute(&self, sequence: &Sequence, ctx: &ExecutionContext) -> ExecutionSummary {
        let request = ctx.request();
        info!(
            request_id = %request.id,
            sequence_id = %sequence.id,
            priority = %request.priority,
            beats = sequence.total_beats(),
            "sequence started"
        );
        telemetry::emit(
            &self.bus,
            TelemetryEvent::SequenceStarted {
                request_id: request.id,
                sequence_id: sequence.id.clone(),
                sequence_name: sequence.name.clone(),
                priority: request.priority,
                total_beats: sequence.total_beats(),
            },
        );

        let outcome = match AssertUnwindSafe(self.run(sequence, ctx)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic_info) => {
                let panic_msg = panic_message(&panic_info);
                error!(request_id = %request.id, panic = %panic_msg, "executor panicked");
                Err(SequenceError::ExecutorFault(panic_msg))
            }
        };

        let duration_ms = ctx.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => {
                ctx.finish(ExecutionStatus::Completed, None);
                let errors = ctx.errors().len();
                info!(
                    request_id = %request.id,
                    sequence_id = %sequence.id,
                    beats = ctx.beats_completed(),
                    errors,
                    duration_ms,
                    "sequence completed"
                );
                telemetry::emit(
                    &self.bus,
                    TelemetryEvent::SequenceCompleted {
                        request_id: request.id,
                        sequence_id: sequence.id.clone(),
                        beats_completed: ctx.beats_completed(),
                        error_count: errors,
                        duration_ms,
                    },
                );
            }
            Err(SequenceError::Cancelled { reason }) => {
                ctx.finish(ExecutionStatus::Cancelled, Some(reason.clone()));
                warn!(request_id = %request.id, sequence_id = %sequence.id, %reason, "sequence cancelled");
                telemetry::emit(
                    &self.bus,
                    TelemetryEvent::SequenceCancelled {
                        request_id: request.id,
                        sequence_id: sequence.id.clone(),
                        reason,
                    },
                );
            }
            Err(e) => {
                ctx.finish(ExecutionStatus::Failed, Some(e.to_string()));
                error!(request_id = %request.id, sequence_id = %sequence.id, error = %e, "sequence failed");
                telemetry::emit(
                    &self.bus,
                    TelemetryEvent::SequenceFailed {
                        request_id: request.id,
                        sequence_id: sequence.id.clone(),
                        category: e.category(),
                        error: e.safe_message().into_owned(),
                        duration_ms,
                    },
                );
            }
        }

        ctx.summary()
    }

    async fn run(&self, sequence: &Sequence, ctx: &ExecutionContext) -> Result<(), SequenceError> {
        let beat_len = beat_duration(sequence.tempo.unwrap_or(self.default_tempo));
        let total_beats = sequence.total_beats();
        let mut ordinal = 0;

        for (movement_index, movement) in sequence.movements.iter().enumerate() {
            let mut beats: Vec<&Beat> = movement.beats.iter().collect();
            beats.sort_by_key(|b| b.beat);

            for (beat_index, beat) in beats.into_iter().enumerate() {
                ordinal += 1;
                let position = BeatPosition {
                    movement,
                    movement_index,
                    beat_index,
                    ordinal,
                    total_beats,
                };

                if ctx.cancel_token().is_cancelled() {
                    return Err(self.cancelled(ctx, movement, beat));
                }
                ctx.set_position(movement_index, beat_index);

                if let Err(beat_error) = self.run_beat(sequence, ctx, &position, beat).await? {
                    ctx.record_error(beat_error.clone());
                    match beat.error_handling {
                        ErrorHandling::Continue => {
                            debug!(
                                request_id = %ctx.execution_id(),
                                beat = beat.beat,
                                "beat failed, continuing"
                            );
                        }
                        ErrorHandling::AbortSequence | ErrorHandling::Retry => {
                            return Err(SequenceError::Aborted(beat_error));
                        }
                    }
                }

                // A handler may cancel mid-beat, including on the final beat.
                if ctx.cancel_token().is_cancelled() {
                    return Err(self.cancelled(ctx, movement, beat));
                }

                if ordinal < total_beats {
                    let delay = beat.timing.delay(beat_len);
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = ctx.cancel_token().cancelled() => {
                                return Err(self.cancelled(ctx, movement, beat));
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Publish one beat, retrying per its policy.
    ///
    /// The outer `Result` is a cancellation during retry backoff; the inner one
    /// is the beat's own outcome.
    async fn run_beat(
        &self,
        sequence: &Sequence,
        ctx: &ExecutionContext,
        position: &BeatPosition<'_>,
        beat: &Beat,
    ) -> Result<Result<(), BeatError>, SequenceError> {
        let request_id = ctx.execution_id();
        let movement = position.movement;
        let _permit = self.gate.acquire().await;

        debug!(
            %request_id,
            movement = %movement.name,
            beat = beat.beat,
            event = %beat.event,
            "beat started"
        );
        telemetry::emit(
            &self.bus,
            TelemetryEvent::BeatStarted {
                request_id,
                sequence_id: sequence.id.clone(),
                movement: movement.name.clone(),
                beat: beat.beat,
                event: beat.event.clone(),
                timing: beat.timing,
                dynamics: beat.dynamics,
                payload: ctx.baton().snapshot(),
            },
        );

        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let payload = beat_payload(sequence, ctx, position, beat);
            let report = self
                .bus
                .publish(&beat.event, Value::Object(payload), Some(ctx.baton().clone()));

            if report.is_ok() {
                ctx.complete_beat(CompletedBeat {
                    movement: movement.name.clone(),
                    beat: beat.beat,
                    event: beat.event.clone(),
                });
                let elapsed_ms = started.elapsed().as_millis() as u64;
                debug!(%request_id, beat = beat.beat, handlers = report.delivered, elapsed_ms, "beat completed");
                telemetry::emit(
                    &self.bus,
                    TelemetryEvent::BeatCompleted {
                        request_id,
                        sequence_id: sequence.id.clone(),
                        movement: movement.name.clone(),
                        beat: beat.beat,
                        event: beat.event.clone(),
                        elapsed_ms,
                    },
                );
                return Ok(Ok(()));
            }

            let message = report.failure_summary();
            warn!(
                %request_id,
                movement = %movement.name,
                beat = beat.beat,
                event = %beat.event,
                attempt,
                policy = beat.error_handling.as_str(),
                error = %message,
                "beat failed"
            );
            telemetry::emit(
                &self.bus,
                TelemetryEvent::BeatFailed {
                    request_id,
                    sequence_id: sequence.id.clone(),
                    movement: movement.name.clone(),
                    beat: beat.beat,
                    event: beat.event.clone(),
                    attempt,
                    policy: beat.error_handling,
                    message: message.clone(),
                },
            );

            let retries_used = attempt - 1;
            if beat.error_handling == ErrorHandling::Retry && retries_used < self.retry_limit {
                let backoff = self.retry_backoff * 2u32.saturating_pow(retries_used);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = ctx.cancel_token().cancelled() => {
                        return Err(self.cancelled(ctx, movement, beat));
                    }
                }
                continue;
            }

            return Ok(Err(BeatError {
                movement: movement.name.clone(),
                beat: beat.beat,
                event: beat.event.clone(),
                message,
                attempts: attempt,
            }));
        }
    }

    /// Record the synthetic cancellation error and build the sequence error.
    fn cancelled(&self, ctx: &ExecutionContext, movement: &Movement, beat: &Beat) -> SequenceError {
        let reason = ctx
            .cancel_token()
            .reason()
            .unwrap_or_else(|| "cancelled".to_string());
        ctx.record_error(BeatError {
            movement: movement.name.clone(),
            beat: beat.beat,
            event: CANCELLED_EVENT.to_string(),
            message: reason.clone(),
            attempts: 0,
        });
        SequenceError::Cancelled { reason }
    }
}

/// Shared payload, then the beat's static data, then `_beat` metadata.
fn beat_payload(
    sequence: &Sequence,
    ctx: &ExecutionContext,
    position: &BeatPosition<'_>,
    beat: &Beat,
) -> Map<String, Value> {
    let request = ctx.request();
    let mut payload = ctx.baton().snapshot();

    if let Some(data) = &beat.data {
        for (key, value) in data {
            payload.insert(key.clone(), value.clone());
        }
    }

    payload.insert(
        "_beat".to_string(),
        json!({
            "sequenceId": sequence.id,
            "sequenceName": sequence.name,
            "movement": position.movement.name,
            "movementIndex": position.movement_index,
            "beat": beat.beat,
            "beatIndex": position.beat_index,
            "event": beat.event,
            "executionId": request.id,
            "requestId": request.id,
            "priority": request.priority,
            "dynamics": beat.dynamics,
            "timing": beat.timing,
            "progress": {
                "beat": position.ordinal,
                "totalBeats": position.total_beats,
                "movement": position.movement_index + 1,
                "totalMovements": sequence.movements.len(),
            },
        }),
    );

    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Priority, RequestId, SequenceRequest};
    use crate::sequence::{Dynamics, Timing};
    use chrono::Utc;
    use std::sync::{Arc, Mutex};

    fn executor(bus: &EventBus) -> Executor {
        Executor::new(bus.clone(), 120, 2, Duration::from_millis(50))
    }

    fn context(sequence: &Sequence) -> ExecutionContext {
        let request = SequenceRequest {
            id: RequestId::new(),
            sequence_id: sequence.id.clone(),
            sequence_name: sequence.name.clone(),
            data: Map::new(),
            priority: Priority::Normal,
            enqueued_at: Utc::now(),
            resource_id: "Test-resource".into(),
            owner: "Test".into(),
            instance_id: "Test-default".into(),
            hash: String::new(),
            blocked_by: None,
        };
        ExecutionContext::new(request, sequence.total_beats())
    }

    fn three_beats(policy: ErrorHandling) -> Sequence {
        Sequence::builder("test", "Test.sequence")
            .movement("main", |m| {
                m.beat(1, "test:one", Dynamics::MezzoForte)
                    .beat_with(Beat::new(2, "test:two", Dynamics::Forte).error_handling(policy))
                    .beat(3, "test:three", Dynamics::Piano)
            })
            .build()
    }

    fn record(bus: &EventBus, topic: &str, log: &Arc<Mutex<Vec<String>>>) {
        let log = log.clone();
        let label = topic.to_string();
        bus.subscribe(topic, move |_| {
            log.lock().unwrap().push(label.clone());
            Ok(())
        });
    }

    #[tokio::test]
    async fn test_beats_run_in_ascending_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for topic in ["b:1", "b:2", "b:3"] {
            record(&bus, topic, &log);
        }
        // Declared out of order on purpose.
        let sequence = Sequence::builder("s", "S.s")
            .movement("m", |m| {
                m.beat(3, "b:3", Dynamics::Piano)
                    .beat(1, "b:1", Dynamics::Piano)
                    .beat(2, "b:2", Dynamics::Piano)
            })
            .build();

        let ctx = context(&sequence);
        let summary = executor(&bus).execute(&sequence, &ctx).await;

        assert_eq!(summary.status, ExecutionStatus::Completed);
        assert_eq!(*log.lock().unwrap(), vec!["b:1", "b:2", "b:3"]);
    }

    #[tokio::test]
    async fn test_continue_policy_completes_with_errors() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        record(&bus, "test:one", &log);
        bus.subscribe("test:two", |_| anyhow::bail!("render failed"));
        record(&bus, "test:three", &log);

        let sequence = three_beats(ErrorHandling::Continue);
        let ctx = context(&sequence);
        let summary = executor(&bus).execute(&sequence, &ctx).await;

        assert!(summary.completed_with_errors());
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].beat, 2);
        assert_eq!(summary.errors[0].message, "render failed");
        assert_eq!(*log.lock().unwrap(), vec!["test:one", "test:three"]);
    }

    #[tokio::test]
    async fn test_abort_policy_stops_the_sequence() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        record(&bus, "test:one", &log);
        bus.subscribe("test:two", |_| anyhow::bail!("render failed"));
        record(&bus, "test:three", &log);

        let sequence = three_beats(ErrorHandling::AbortSequence);
        let ctx = context(&sequence);
        let summary = executor(&bus).execute(&sequence, &ctx).await;

        assert_eq!(summary.status, ExecutionStatus::Failed);
        assert_eq!(summary.beats_completed, 1);
        assert_eq!(*log.lock().unwrap(), vec!["test:one"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_within_limit() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        bus.subscribe("test:two", move |_| {
            let mut calls = counter.lock().unwrap();
            *calls += 1;
            if *calls < 3 {
                anyhow::bail!("flaky");
            }
            Ok(())
        });

        let sequence = three_beats(ErrorHandling::Retry);
        let ctx = context(&sequence);
        let summary = executor(&bus).execute(&sequence, &ctx).await;

        assert!(summary.is_clean());
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_aborts() {
        let bus = EventBus::new();
        bus.subscribe("test:two", |_| anyhow::bail!("still broken"));

        let sequence = three_beats(ErrorHandling::Retry);
        let ctx = context(&sequence);
        let summary = executor(&bus).execute(&sequence, &ctx).await;

        assert_eq!(summary.status, ExecutionStatus::Failed);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_payload_carries_baton_static_data_and_metadata() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Value::Null));
        let sink = seen.clone();
        bus.subscribe("test:one", |msg| {
            msg.baton()
                .ok_or_else(|| anyhow::anyhow!("missing baton"))?
                .set("fromOne", json!(true));
            Ok(())
        });
        bus.subscribe("test:two", move |msg| {
            *sink.lock().unwrap() = msg.data.clone();
            Ok(())
        });

        let mut data = Map::new();
        data.insert("mode".into(), json!("static"));
        let sequence = Sequence::builder("s", "S.s")
            .movement("m", |m| {
                m.beat(1, "test:one", Dynamics::Piano)
                    .beat_with(Beat::new(2, "test:two", Dynamics::Forte).data(data))
            })
            .build();
        let ctx = context(&sequence);
        executor(&bus).execute(&sequence, &ctx).await;

        let payload = seen.lock().unwrap().clone();
        assert_eq!(payload["fromOne"], true);
        assert_eq!(payload["mode"], "static");
        assert_eq!(payload["_beat"]["beat"], 2);
        assert_eq!(payload["_beat"]["dynamics"], "f");
        assert_eq!(payload["_beat"]["progress"]["totalBeats"], 2);
        assert_eq!(payload["_beat"]["executionId"], json!(ctx.execution_id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_delay() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        record(&bus, "slow:two", &log);

        let sequence = Sequence::builder("s", "S.s")
            .tempo(60)
            .movement("m", |m| {
                m.beat_with(Beat::new(1, "slow:one", Dynamics::Piano).timing(Timing::AfterBeat))
                    .beat(2, "slow:two", Dynamics::Piano)
            })
            .build();
        let ctx = Arc::new(context(&sequence));
        let exec = executor(&bus);

        let canceller = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                ctx.cancel_token().cancel("user navigated away");
            })
        };
        let summary = exec.execute(&sequence, &ctx).await;
        canceller.await.unwrap();

        assert_eq!(summary.status, ExecutionStatus::Cancelled);
        assert_eq!(summary.failure.as_deref(), Some("user navigated away"));
        assert_eq!(summary.beats_completed, 1);
        assert_eq!(summary.errors.len(), 1);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_handler_is_a_beat_error() {
        let bus = EventBus::new();
        bus.subscribe("test:two", |_| panic!("handler exploded"));

        let sequence = three_beats(ErrorHandling::Continue);
        let ctx = context(&sequence);
        let exec = executor(&bus);
        let summary = exec.execute(&sequence, &ctx).await;

        assert!(summary.completed_with_errors());
        assert!(summary.errors[0].message.contains("handler exploded"));
        assert!(!exec.gate().is_busy());
    }
}
