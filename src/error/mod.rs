/// Error recovery system for bottle sync
///
/// This module provides the failure-handling layers used by every sync:
/// - Error classification into [`ErrorType`] categories
/// - Retry with exponential backoff and jitter (blocking and async)
/// - The recovery decision table ([`RecoveryAction`])
/// - Partial sync checkpoints for resuming interrupted runs
///
/// # Architecture
///
/// ```text
/// ┌──────────────────────────────────────────┐
/// │   Recovery Coordinator (per bottle)       │
/// └────────────────┬─────────────────────────┘
///                  │
///      ┌───────────┴───────────┐
///      ↓                       ↓
/// ┌──────────────┐      ┌───────────────────┐
/// │Classification│      │ PartialSyncRecovery│
/// │   & Retry    │      │   (checkpoints)    │
/// └──────────────┘      └───────────────────┘
/// ```
///
/// # Usage Example
///
/// ```rust,ignore
/// use bottle_sync::error::{RecoveryCoordinator, RetryConfig};
///
/// let coordinator = RecoveryCoordinator::new(storage, RetryConfig::default());
/// let mut state = coordinator.begin_sync(&sync_id, bottles.len());
///
/// for bottle in &bottles {
///     if state.is_done(&bottle.key()) {
///         continue;
///     }
///     let outcome = coordinator.execute_with_recovery(
///         "download_bottle",
///         &bottle.key(),
///         &mut state,
///         || download(bottle),
///     );
///     if outcome.should_stop() {
///         coordinator.checkpoint(&mut state);
///         break;
///     }
/// }
///
/// coordinator.finish_sync(&state);
/// ```

pub mod checkpoint;
pub mod classification;
pub mod recovery_coordinator;
pub mod retry;

// Re-export main types for convenience
pub use checkpoint::{PartialSyncRecovery, RecoveryState, CHECKPOINT_INTERVAL, RECOVERY_STATE_KEY};
pub use classification::{ErrorClassifier, ErrorContext, ErrorType};
pub use recovery_coordinator::{BottleOutcome, RecoveryAction, RecoveryCoordinator};
pub use retry::{RetryConfig, RetryHandler, RETRYABLE_STORAGE_CODES};
