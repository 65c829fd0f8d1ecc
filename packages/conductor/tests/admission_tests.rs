//! Integration tests for submission: lookup, duplicate suppression and queue
//! maintenance.

mod common;

use std::time::Duration;

use common::*;
use conductor::{
    topics, AdmissionError, Categorizable, ConductorConfig, ErrorCategory, ExecutionStatus,
    Priority, RequestId, SequenceError,
};
use serde_json::json;

fn harness() -> TestHarness {
    let h = TestHarness::new();
    h.mount(
        simple_sequence("canvas-drop", "Canvas.drop-symphony", &["canvas:drop"]),
        noop_handlers(&["canvas:drop"]),
    );
    h
}

#[tokio::test]
async fn test_unknown_sequence_is_not_found() {
    let h = harness();
    let err = h
        .conductor
        .submit("missing", json!({}), Priority::Normal)
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::NotFound);
    assert_eq!(h.conductor.statistics().total_queued, 0);
    assert_eq!(h.recorder.count(topics::SEQUENCE_QUEUED), 0);
}

#[tokio::test]
async fn test_scalar_data_is_malformed() {
    let h = harness();
    for data in [json!("text"), json!(7), json!(true)] {
        let err = h
            .conductor
            .submit("canvas-drop", data, Priority::Normal)
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Malformed(_)), "{err}");
    }
    // Null means "no data".
    assert!(h
        .conductor
        .submit("canvas-drop", serde_json::Value::Null, Priority::Normal)
        .is_ok());
}

#[tokio::test]
async fn test_queued_telemetry_carries_derived_resource() {
    let h = harness();
    let id = h
        .conductor
        .submit("canvas-drop", json!({ "componentId": "btn-1" }), Priority::High)
        .unwrap();

    let queued = h.recorder.on(topics::SEQUENCE_QUEUED);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0]["type"], "sequence-queued");
    assert_eq!(queued[0]["requestId"], id.to_string());
    assert_eq!(queued[0]["resourceId"], "btn-1");
    assert_eq!(queued[0]["priority"], "HIGH");
    assert_eq!(queued[0]["queueLength"], 1);

    assert_eq!(
        h.conductor.owner_resource_map().get("Canvas"),
        Some(&vec!["btn-1".to_string()])
    );
}

// =============================================================================
// Duplicate suppression
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_duplicate_inside_window_then_fresh_after() {
    let h = harness();
    let data = json!({ "componentId": "c1", "position": { "x": 10, "y": 20 } });

    let first = h
        .conductor
        .submit("canvas-drop", data.clone(), Priority::Normal)
        .unwrap();
    assert!(!first.is_duplicate());

    // Same content with keys in another order still matches.
    let reordered = json!({ "position": { "y": 20, "x": 10 }, "componentId": "c1" });
    let second = h
        .conductor
        .submit("canvas-drop", reordered, Priority::Normal)
        .unwrap();
    assert_eq!(second, RequestId::DUPLICATE);

    let duplicates = h.recorder.on(topics::SEQUENCE_DUPLICATE);
    assert_eq!(duplicates.len(), 1);
    assert_eq!(duplicates[0]["rapid"], true);

    tokio::time::advance(Duration::from_millis(2_000)).await;
    let third = h
        .conductor
        .submit("canvas-drop", data.clone(), Priority::Normal)
        .unwrap();
    assert!(third.is_duplicate());
    assert_eq!(h.recorder.on(topics::SEQUENCE_DUPLICATE)[1]["rapid"], false);

    // The window is measured from the last admission, not the last attempt.
    tokio::time::advance(Duration::from_millis(3_100)).await;
    let fourth = h
        .conductor
        .submit("canvas-drop", data, Priority::Normal)
        .unwrap();
    assert!(!fourth.is_duplicate());

    let stats = h.conductor.statistics();
    assert_eq!(stats.duplicates_suppressed, 2);
    assert_eq!(stats.total_queued, 2);
    assert_eq!(h.conductor.queue_status().length, 2);
}

#[tokio::test]
async fn test_priority_is_part_of_the_request_identity() {
    let h = harness();
    let data = json!({ "componentId": "c1" });

    h.conductor
        .submit("canvas-drop", data.clone(), Priority::Normal)
        .unwrap();
    let high = h
        .conductor
        .submit("canvas-drop", data, Priority::High)
        .unwrap();

    assert!(!high.is_duplicate());
    assert_eq!(h.conductor.queue_status().length, 2);
}

#[tokio::test]
async fn test_bypass_flag_skips_duplicate_check() {
    let h = TestHarness::new();
    let mut sequence = simple_sequence("boot", "App.boot", &["app:boot"]);
    sequence.bypass_dedup = true;
    h.mount(sequence, noop_handlers(&["app:boot"]));

    let a = h.conductor.submit("boot", json!({}), Priority::Normal).unwrap();
    let b = h.conductor.submit("boot", json!({}), Priority::Normal).unwrap();

    assert!(!a.is_duplicate());
    assert!(!b.is_duplicate());
    assert_ne!(a, b);
    assert_eq!(h.conductor.statistics().duplicates_suppressed, 0);
}

#[tokio::test]
async fn test_duplicate_submit_and_wait_returns_none() {
    let h = harness();
    h.conductor
        .submit("canvas-drop", json!({ "componentId": "c1" }), Priority::Normal)
        .unwrap();

    let outcome = h
        .conductor
        .submit_and_wait("canvas-drop", json!({ "componentId": "c1" }), Priority::Normal)
        .await
        .unwrap();
    assert!(outcome.is_none());
}

// =============================================================================
// Queue maintenance
// =============================================================================

#[tokio::test]
async fn test_clear_queue_cancels_pending_requests() {
    let mut h = harness();
    let ids: Vec<RequestId> = (0..3)
        .map(|i| {
            h.conductor
                .submit("canvas-drop", json!({ "componentId": format!("c{i}") }), Priority::Normal)
                .unwrap()
        })
        .collect();
    assert_eq!(h.conductor.resource_ownership().len(), 3);

    assert_eq!(h.conductor.clear_queue(), 3);
    assert_eq!(h.conductor.queue_status().length, 0);
    assert!(h.conductor.resource_ownership().is_empty());
    assert_eq!(h.conductor.pending_completions(), 0);

    // Nothing runs once the worker starts.
    h.start();
    h.conductor.wait_idle().await;
    assert_eq!(h.conductor.statistics().total_executed, 0);
    for id in ids {
        assert!(matches!(
            h.conductor.wait_for(id).await,
            Err(SequenceError::UnknownRequest(_))
        ));
    }

    h.shutdown().await;
}

#[tokio::test]
async fn test_wait_for_answers_from_history() {
    let mut h = harness();
    h.start();

    let id = h
        .conductor
        .submit("canvas-drop", json!({ "componentId": "c1" }), Priority::Normal)
        .unwrap();
    let live = h.conductor.wait_for(id).await.unwrap();
    let replay = h.conductor.wait_for(id).await.unwrap();

    assert_eq!(live.status, ExecutionStatus::Completed);
    assert_eq!(live, replay);
    assert_eq!(h.conductor.pending_completions(), 0);

    h.shutdown().await;
}

#[tokio::test]
async fn test_history_is_bounded() {
    let config = ConductorConfig {
        history_limit: 2,
        ..ConductorConfig::default()
    };
    let mut h = TestHarness::with_config(config);
    h.mount(
        simple_sequence("tick", "Clock.tick", &["clock:tick"]),
        noop_handlers(&["clock:tick"]),
    );
    h.start();

    for i in 0..4 {
        h.conductor
            .submit_and_wait("tick", json!({ "n": i }), Priority::Normal)
            .await
            .unwrap()
            .unwrap();
    }

    assert_eq!(h.conductor.execution_history().len(), 2);
    assert_eq!(h.conductor.statistics().total_executed, 4);

    h.shutdown().await;
}
