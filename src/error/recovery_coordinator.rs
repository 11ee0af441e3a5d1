/// Recovery coordinator - ties classification, retries and checkpoints together
///
/// This module provides:
/// - The [`RecoveryAction`] decision table, a pure mapping from an
///   [`ErrorContext`] to what the caller should do next
/// - [`RecoveryCoordinator`], which runs one bottle operation under the retry
///   policy, classifies the final failure, records the outcome in the run's
///   [`RecoveryState`] and checkpoints progress
use super::checkpoint::{PartialSyncRecovery, RecoveryState};
use super::classification::{ErrorClassifier, ErrorContext, ErrorType};
use super::retry::{RetryConfig, RetryHandler};
use crate::metrics::MetricsSink;
use crate::models::BottleStatus;
use crate::storage::StorageService;
use crate::{is_interrupted, SyncError};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

/// Recovery action to take after a classified failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Try the operation again
    Retry,

    /// Give up on this item and continue with the next one
    Skip,

    /// Stop the whole run
    Abort,

    /// Rebuild the hash file from object store listings
    Rebuild,

    /// Switch to an alternate source
    Fallback,
}

impl RecoveryAction {
    /// Decision table keyed on error type and 1-based attempt number
    pub fn decide(context: &ErrorContext) -> Self {
        let attempt = context.attempt_number;

        match context.error_type {
            ErrorType::Network => Self::retry_while(attempt < 5, Self::Skip),

            ErrorType::Storage => {
                if is_missing_key(context) {
                    // Permanent, the object will not appear by retrying
                    Self::Skip
                } else {
                    Self::retry_while(attempt < 3, Self::Skip)
                }
            }

            ErrorType::HashCorruption => Self::Rebuild,

            ErrorType::ResourceExhaustion => Self::retry_while(attempt < 10, Self::Abort),

            ErrorType::Validation => Self::Skip,

            ErrorType::Authentication => Self::Abort,

            ErrorType::Timeout => Self::retry_while(attempt < 3, Self::Skip),

            ErrorType::Cancelled => Self::Abort,

            ErrorType::Unknown => Self::retry_while(attempt < 2, Self::Skip),
        }
    }

    fn retry_while(condition: bool, otherwise: Self) -> Self {
        if condition {
            Self::Retry
        } else {
            otherwise
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::Retry => "retry",
            RecoveryAction::Skip => "skip",
            RecoveryAction::Abort => "abort",
            RecoveryAction::Rebuild => "rebuild",
            RecoveryAction::Fallback => "fallback",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_missing_key(context: &ErrorContext) -> bool {
    context.error_message.contains("NoSuchKey")
        || context.metadata.get("error_code").map(String::as_str) == Some("NoSuchKey")
}

/// Result of running one bottle through the coordinator
#[derive(Debug, Clone)]
pub enum BottleOutcome<T> {
    /// Operation succeeded (possibly after retries)
    Completed(T),

    /// Failure judged permanent for this bottle; the run continues
    Skipped(ErrorContext),

    /// Failure that was not skipped; `action` tells the caller what to do
    Failed {
        action: RecoveryAction,
        context: ErrorContext,
    },

    /// Shutdown requested before or during the operation
    Cancelled,
}

impl<T> BottleOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, BottleOutcome::Completed(_))
    }

    /// The run must stop (abort decision or cancellation)
    pub fn should_stop(&self) -> bool {
        matches!(
            self,
            BottleOutcome::Cancelled
                | BottleOutcome::Failed {
                    action: RecoveryAction::Abort,
                    ..
                }
        )
    }

    pub fn needs_rebuild(&self) -> bool {
        matches!(
            self,
            BottleOutcome::Failed {
                action: RecoveryAction::Rebuild,
                ..
            }
        )
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            BottleOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }
}

/// Recovery coordinator - main orchestration for a sync run
pub struct RecoveryCoordinator {
    classifier: ErrorClassifier,
    retry: RetryHandler,
    recovery: PartialSyncRecovery,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl RecoveryCoordinator {
    pub fn new(storage: StorageService, retry_config: RetryConfig) -> Self {
        let metrics = storage.metrics().cloned();
        let mut retry = RetryHandler::new(retry_config);
        if let Some(sink) = &metrics {
            retry = retry.with_metrics(Arc::clone(sink));
        }

        Self {
            classifier: ErrorClassifier::new(),
            retry,
            recovery: PartialSyncRecovery::new(storage),
            metrics,
        }
    }

    pub fn recovery(&self) -> &PartialSyncRecovery {
        &self.recovery
    }

    pub fn retry_handler(&self) -> &RetryHandler {
        &self.retry
    }

    /// Start or resume a run
    pub fn begin_sync(&self, sync_id: &str, total_bottles: usize) -> RecoveryState {
        match self.recovery.should_resume_sync(sync_id) {
            (true, Some(mut state)) => {
                state.total_bottles = state.total_bottles.max(total_bottles);
                tracing::info!(
                    sync_id,
                    resumed_from = %state.sync_id,
                    progress = %state.progress_description(),
                    "Resuming sync"
                );
                state
            }
            _ => {
                tracing::info!(sync_id, total_bottles, "Starting fresh sync");
                RecoveryState::new(sync_id, total_bottles)
            }
        }
    }

    /// Persist progress immediately (e.g. on shutdown)
    pub fn checkpoint(&self, state: &mut RecoveryState) -> bool {
        state.recovery_checkpoint = Some(chrono::Utc::now());
        self.recovery.save_recovery_state(state)
    }

    /// Clean completion: drop the checkpoint
    pub fn finish_sync(&self, state: &RecoveryState) -> bool {
        tracing::info!(progress = %state.progress_description(), "Sync finished");
        self.recovery.clear_recovery_state()
    }

    /// Execute one bottle operation with recovery.
    ///
    /// `operation` runs under the retry policy; the interrupt flag is checked
    /// before every attempt. The outcome is recorded in `state`, which may
    /// trigger a checkpoint.
    pub fn execute_with_recovery<T, F>(
        &self,
        operation: &str,
        bottle_id: &str,
        state: &mut RecoveryState,
        mut f: F,
    ) -> BottleOutcome<T>
    where
        F: FnMut() -> crate::SyncResult<T>,
    {
        if is_interrupted() {
            tracing::warn!(operation, bottle_id, "Interrupted, not starting operation");
            return BottleOutcome::Cancelled;
        }

        let attempts = Cell::new(0u32);
        let result = self.retry.retry_sync(operation, || {
            if is_interrupted() {
                return Err(SyncError::Cancelled);
            }
            attempts.set(attempts.get() + 1);
            f()
        });

        match result {
            Ok(value) => {
                if attempts.get() > 1 {
                    tracing::info!(
                        operation,
                        bottle_id,
                        attempts = attempts.get(),
                        "Bottle succeeded after retry"
                    );
                }
                self.recovery
                    .update_progress(state, bottle_id, BottleStatus::Completed);
                BottleOutcome::Completed(value)
            }

            Err(SyncError::Cancelled) => {
                tracing::warn!(operation, bottle_id, "Operation cancelled");
                BottleOutcome::Cancelled
            }

            Err(error) => {
                let context = self
                    .classifier
                    .classify_attempt(&error, operation, attempts.get())
                    .with_resource(bottle_id);
                let action = RecoveryAction::decide(&context);

                tracing::error!(
                    operation,
                    bottle_id,
                    error_type = %context.error_type,
                    attempt = context.attempt_number,
                    action = %action,
                    context = ?context,
                    "Bottle operation failed"
                );

                if let Some(metrics) = &self.metrics {
                    metrics.put_error_metric(&context);
                    metrics.put_recovery_metric(action.as_str(), false);
                }

                if action == RecoveryAction::Skip {
                    self.recovery
                        .update_progress(state, bottle_id, BottleStatus::Skipped);
                    BottleOutcome::Skipped(context)
                } else {
                    self.recovery
                        .update_progress(state, bottle_id, BottleStatus::Failed);
                    BottleOutcome::Failed { action, context }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetrics;
    use crate::storage::MemoryObjectStore;
    use serial_test::serial;
    use test_case::test_case;

    fn context(error_type: ErrorType, attempt: u32) -> ErrorContext {
        ErrorContext::new(error_type, "failure", "test_op").with_attempt(attempt)
    }

    #[test_case(ErrorType::Network, 4 => RecoveryAction::Retry ; "network below budget")]
    #[test_case(ErrorType::Network, 5 => RecoveryAction::Skip ; "network at budget")]
    #[test_case(ErrorType::Storage, 2 => RecoveryAction::Retry ; "storage below budget")]
    #[test_case(ErrorType::Storage, 3 => RecoveryAction::Skip ; "storage at budget")]
    #[test_case(ErrorType::HashCorruption, 1 => RecoveryAction::Rebuild ; "corruption first")]
    #[test_case(ErrorType::HashCorruption, 50 => RecoveryAction::Rebuild ; "corruption late")]
    #[test_case(ErrorType::ResourceExhaustion, 9 => RecoveryAction::Retry ; "throttle below budget")]
    #[test_case(ErrorType::ResourceExhaustion, 10 => RecoveryAction::Abort ; "throttle at budget")]
    #[test_case(ErrorType::Validation, 1 => RecoveryAction::Skip ; "validation")]
    #[test_case(ErrorType::Authentication, 1 => RecoveryAction::Abort ; "authentication")]
    #[test_case(ErrorType::Timeout, 2 => RecoveryAction::Retry ; "timeout below budget")]
    #[test_case(ErrorType::Timeout, 3 => RecoveryAction::Skip ; "timeout at budget")]
    #[test_case(ErrorType::Unknown, 1 => RecoveryAction::Retry ; "unknown first")]
    #[test_case(ErrorType::Unknown, 2 => RecoveryAction::Skip ; "unknown second")]
    #[test_case(ErrorType::Cancelled, 1 => RecoveryAction::Abort ; "cancelled")]
    fn test_decision_table(error_type: ErrorType, attempt: u32) -> RecoveryAction {
        RecoveryAction::decide(&context(error_type, attempt))
    }

    #[test]
    fn test_missing_key_is_skipped_immediately() {
        let by_message = ErrorContext::new(ErrorType::Storage, "NoSuchKey: gone", "get");
        assert_eq!(RecoveryAction::decide(&by_message), RecoveryAction::Skip);

        let by_code = ErrorContext::new(ErrorType::Storage, "object missing", "get")
            .with_metadata("error_code", "NoSuchKey");
        assert_eq!(RecoveryAction::decide(&by_code), RecoveryAction::Skip);
    }

    fn coordinator(max_attempts: u32) -> (RecoveryCoordinator, Arc<InMemoryMetrics>) {
        let metrics = Arc::new(InMemoryMetrics::new());
        let storage = StorageService::new(
            Arc::new(MemoryObjectStore::new("bottles")),
            RetryConfig::storage(),
        )
        .with_metrics(metrics.clone());
        let retry = RetryConfig {
            max_attempts,
            base_delay: 0.001,
            max_delay: 0.002,
            ..RetryConfig::default()
        };
        (RecoveryCoordinator::new(storage, retry), metrics)
    }

    #[test]
    #[serial]
    fn test_success_records_completion() {
        let (coordinator, _metrics) = coordinator(3);
        let mut state = coordinator.begin_sync("sync-1", 1);

        let outcome = coordinator.execute_with_recovery("download", "wget", &mut state, || Ok(7));

        assert_eq!(outcome.into_value(), Some(7));
        assert!(state.is_done("wget"));
    }

    #[test]
    #[serial]
    fn test_validation_failure_is_skipped() {
        let (coordinator, metrics) = coordinator(3);
        let mut state = coordinator.begin_sync("sync-1", 1);

        let outcome: BottleOutcome<()> =
            coordinator.execute_with_recovery("download", "bad", &mut state, || {
                Err(SyncError::Validation("bad sha".into()))
            });

        assert!(matches!(outcome, BottleOutcome::Skipped(_)));
        assert_eq!(state.status_of("bad"), Some(BottleStatus::Skipped));
        assert_eq!(metrics.count("Errors"), 1.0);
        let recovery = metrics.datums_named("Recovery");
        assert_eq!(recovery[0].dimension("RecoveryType"), Some("skip"));
    }

    #[test]
    #[serial]
    fn test_exhausted_network_failure_is_failed_with_attempts() {
        let (coordinator, _metrics) = coordinator(3);
        let mut state = coordinator.begin_sync("sync-1", 1);
        let mut calls = 0;

        let outcome: BottleOutcome<()> =
            coordinator.execute_with_recovery("download", "flaky", &mut state, || {
                calls += 1;
                Err(SyncError::Connection("reset".into()))
            });

        assert_eq!(calls, 3);
        match outcome {
            BottleOutcome::Failed { action, context } => {
                assert_eq!(action, RecoveryAction::Retry);
                assert_eq!(context.attempt_number, 3);
                assert_eq!(context.resource_id.as_deref(), Some("flaky"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(state.status_of("flaky"), Some(BottleStatus::Failed));
    }

    #[test]
    #[serial]
    fn test_auth_failure_stops_run() {
        let (coordinator, _metrics) = coordinator(3);
        let mut state = coordinator.begin_sync("sync-1", 1);

        let outcome: BottleOutcome<()> =
            coordinator.execute_with_recovery("upload", "x", &mut state, || {
                Err(SyncError::storage("InvalidAccessKeyId", "bad key"))
            });
        assert!(outcome.should_stop());
    }

    #[test]
    #[serial]
    fn test_corruption_requests_rebuild() {
        let (coordinator, _metrics) = coordinator(1);
        let mut state = coordinator.begin_sync("sync-1", 1);

        let outcome: BottleOutcome<()> =
            coordinator.execute_with_recovery("verify", "x", &mut state, || {
                Err(SyncError::Other("hash mismatch".into()))
            });
        assert!(outcome.needs_rebuild());
    }

    #[test]
    #[serial]
    fn test_begin_sync_resumes_saved_state() {
        let (coordinator, _metrics) = coordinator(3);
        let mut state = coordinator.begin_sync("sync-1", 3);
        coordinator.execute_with_recovery("download", "a", &mut state, || Ok(()));
        assert!(coordinator.checkpoint(&mut state));

        let resumed = coordinator.begin_sync("sync-2", 3);
        assert_eq!(resumed.sync_id, "sync-1");
        assert!(resumed.is_done("a"));

        assert!(coordinator.finish_sync(&resumed));
        let fresh = coordinator.begin_sync("sync-3", 3);
        assert_eq!(fresh.sync_id, "sync-3");
    }

    #[test]
    #[serial]
    fn test_interrupt_cancels_before_start() {
        let (coordinator, _metrics) = coordinator(3);
        let mut state = coordinator.begin_sync("sync-1", 1);
        let mut calls = 0;

        crate::set_interrupted();
        let outcome: BottleOutcome<()> =
            coordinator.execute_with_recovery("download", "x", &mut state, || {
                calls += 1;
                Ok(())
            });
        crate::reset_interrupted();

        assert!(matches!(outcome, BottleOutcome::Cancelled));
        assert!(outcome.should_stop());
        assert_eq!(calls, 0);
        assert_eq!(state.status_of("x"), None);
    }

    #[test]
    #[serial]
    fn test_interrupt_between_attempts_cancels() {
        let (coordinator, _metrics) = coordinator(5);
        let mut state = coordinator.begin_sync("sync-1", 1);
        let mut calls = 0;

        let outcome: BottleOutcome<()> =
            coordinator.execute_with_recovery("download", "x", &mut state, || {
                calls += 1;
                crate::set_interrupted();
                Err(SyncError::Connection("reset".into()))
            });
        crate::reset_interrupted();

        assert!(matches!(outcome, BottleOutcome::Cancelled));
        assert_eq!(calls, 1);
    }
}
