//! Running execution statistics.

use serde::Serialize;

use crate::context::{ExecutionStatus, ExecutionSummary};

/// Weight given to the newest sample in the execution-time average.
const AVERAGE_WEIGHT: f64 = 0.1;

/// Counters returned by `Conductor::statistics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub total_queued: u64,
    pub total_executed: u64,
    /// Completed without any beat error.
    pub completed_clean: u64,
    pub completed_with_errors: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub duplicates_suppressed: u64,
    pub rejected: u64,
    pub deferred: u64,
    pub interrupts: u64,
    pub total_beats_executed: u64,
    /// Exponential moving average, in milliseconds.
    pub average_execution_ms: f64,
    /// `completed_clean / total_executed`, 0 when nothing ran.
    pub completion_rate: f64,
    pub current_queue_length: usize,
}

impl Statistics {
    /// Fold a finished execution into the counters.
    pub fn record_execution(&mut self, summary: &ExecutionSummary) {
        self.total_executed += 1;
        self.total_beats_executed += summary.beats_completed as u64;

        match summary.status {
            ExecutionStatus::Completed if summary.errors.is_empty() => self.completed_clean += 1,
            ExecutionStatus::Completed => self.completed_with_errors += 1,
            ExecutionStatus::Failed => self.failed += 1,
            ExecutionStatus::Cancelled => self.cancelled += 1,
            ExecutionStatus::Running => {}
        }

        let sample = summary.duration_ms as f64;
        self.average_execution_ms = if self.total_executed == 1 {
            sample
        } else {
            self.average_execution_ms * (1.0 - AVERAGE_WEIGHT) + sample * AVERAGE_WEIGHT
        };

        self.completion_rate = self.completed_clean as f64 / self.total_executed as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Priority, RequestId};
    use chrono::Utc;

    fn summary(status: ExecutionStatus, errors: usize, duration_ms: u64) -> ExecutionSummary {
        ExecutionSummary {
            request_id: RequestId::new(),
            sequence_id: "s".into(),
            sequence_name: "S".into(),
            priority: Priority::Normal,
            status,
            beats_completed: 3,
            total_beats: 3,
            errors: (0..errors)
                .map(|i| crate::error::BeatError {
                    movement: "m".into(),
                    beat: i as u32 + 1,
                    event: "e".into(),
                    message: "x".into(),
                    attempts: 1,
                })
                .collect(),
            failure: None,
            started_at: Utc::now(),
            duration_ms,
        }
    }

    #[test]
    fn test_average_is_seeded_then_smoothed() {
        let mut stats = Statistics::default();
        stats.record_execution(&summary(ExecutionStatus::Completed, 0, 100));
        assert_eq!(stats.average_execution_ms, 100.0);

        stats.record_execution(&summary(ExecutionStatus::Completed, 0, 200));
        assert!((stats.average_execution_ms - 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_completion_rate_counts_only_clean_runs() {
        let mut stats = Statistics::default();
        stats.record_execution(&summary(ExecutionStatus::Completed, 0, 10));
        stats.record_execution(&summary(ExecutionStatus::Completed, 1, 10));
        stats.record_execution(&summary(ExecutionStatus::Failed, 1, 10));
        stats.record_execution(&summary(ExecutionStatus::Cancelled, 0, 10));

        assert_eq!(stats.total_executed, 4);
        assert_eq!(stats.completed_clean, 1);
        assert_eq!(stats.completed_with_errors, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.total_beats_executed, 12);
        assert!((stats.completion_rate - 0.25).abs() < 1e-9);
    }
}
