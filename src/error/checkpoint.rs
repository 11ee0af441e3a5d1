/// Partial sync recovery checkpoints
///
/// A [`RecoveryState`] tracks one sync run's progress. It is persisted to a
/// fixed key in the object store every 10 completions so an interrupted run
/// can pick up where it left off. States older than 24 hours that belong to
/// another run are discarded instead of resumed.
use crate::metrics::MetricsSink;
use crate::models::BottleStatus;
use crate::storage::StorageService;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Object key holding the checkpoint
pub const RECOVERY_STATE_KEY: &str = "sync_recovery_state.json";

/// Completions between automatic checkpoints
pub const CHECKPOINT_INTERVAL: usize = 10;

/// Foreign states younger than this are resumed
pub fn resume_window() -> Duration {
    Duration::hours(24)
}

/// Progress ledger for one sync run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryState {
    pub sync_id: String,

    pub start_time: DateTime<Utc>,

    #[serde(default)]
    pub last_successful_bottle: Option<String>,

    #[serde(default)]
    pub completed_bottles: BTreeSet<String>,

    #[serde(default)]
    pub failed_bottles: BTreeSet<String>,

    #[serde(default)]
    pub skipped_bottles: BTreeSet<String>,

    #[serde(default)]
    pub total_bottles: usize,

    /// When the state was last persisted
    #[serde(default)]
    pub recovery_checkpoint: Option<DateTime<Utc>>,

    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl RecoveryState {
    /// Create a new state for a run starting now
    pub fn new(sync_id: impl Into<String>, total_bottles: usize) -> Self {
        Self {
            sync_id: sync_id.into(),
            start_time: Utc::now(),
            last_successful_bottle: None,
            completed_bottles: BTreeSet::new(),
            failed_bottles: BTreeSet::new(),
            skipped_bottles: BTreeSet::new(),
            total_bottles,
            recovery_checkpoint: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Generate a fresh sync identifier
    pub fn generate_sync_id() -> String {
        format!("sync-{}", uuid::Uuid::new_v4())
    }

    /// Record an outcome, moving the bottle out of any other set.
    ///
    /// Returns true when the bottle was not already recorded with `status`.
    pub fn record(&mut self, bottle_id: &str, status: BottleStatus) -> bool {
        let (target, others) = match status {
            BottleStatus::Completed => (
                &mut self.completed_bottles,
                [&mut self.failed_bottles, &mut self.skipped_bottles],
            ),
            BottleStatus::Failed => (
                &mut self.failed_bottles,
                [&mut self.completed_bottles, &mut self.skipped_bottles],
            ),
            BottleStatus::Skipped => (
                &mut self.skipped_bottles,
                [&mut self.completed_bottles, &mut self.failed_bottles],
            ),
        };

        for other in others {
            other.remove(bottle_id);
        }
        let inserted = target.insert(bottle_id.to_string());

        if status == BottleStatus::Completed {
            self.last_successful_bottle = Some(bottle_id.to_string());
        }
        inserted
    }

    /// Status currently recorded for a bottle
    pub fn status_of(&self, bottle_id: &str) -> Option<BottleStatus> {
        if self.completed_bottles.contains(bottle_id) {
            Some(BottleStatus::Completed)
        } else if self.failed_bottles.contains(bottle_id) {
            Some(BottleStatus::Failed)
        } else if self.skipped_bottles.contains(bottle_id) {
            Some(BottleStatus::Skipped)
        } else {
            None
        }
    }

    /// Completed bottles need no further work on resume
    pub fn is_done(&self, bottle_id: &str) -> bool {
        self.completed_bottles.contains(bottle_id)
    }

    pub fn processed_count(&self) -> usize {
        self.completed_bottles.len() + self.failed_bottles.len() + self.skipped_bottles.len()
    }

    pub fn completion_percentage(&self) -> f64 {
        if self.total_bottles == 0 {
            return 0.0;
        }
        (self.processed_count() as f64 / self.total_bottles as f64) * 100.0
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.start_time
    }

    /// One-line progress summary
    pub fn progress_description(&self) -> String {
        format!(
            "{}: {}/{} processed ({:.1}%), {} completed, {} failed, {} skipped",
            self.sync_id,
            self.processed_count(),
            self.total_bottles,
            self.completion_percentage(),
            self.completed_bottles.len(),
            self.failed_bottles.len(),
            self.skipped_bottles.len()
        )
    }
}

/// Persists and reloads [`RecoveryState`] checkpoints
#[derive(Clone)]
pub struct PartialSyncRecovery {
    storage: StorageService,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl PartialSyncRecovery {
    pub fn new(storage: StorageService) -> Self {
        let metrics = storage.metrics().cloned();
        Self { storage, metrics }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Persist `state` under the fixed key, tagged with its sync id
    pub fn save_recovery_state(&self, state: &RecoveryState) -> bool {
        let mut metadata = HashMap::new();
        metadata.insert("sync_id".to_string(), state.sync_id.clone());

        let saved = self.storage.upload_json(state, RECOVERY_STATE_KEY, metadata);
        if saved {
            tracing::info!(sync_id = %state.sync_id, "Saved recovery state");
        } else {
            tracing::error!(sync_id = %state.sync_id, "Failed to save recovery state");
        }
        saved
    }

    /// Load the checkpoint; a state belonging to another run is treated as absent
    pub fn load_recovery_state(&self, sync_id: Option<&str>) -> Option<RecoveryState> {
        let state: RecoveryState = self.storage.download_json(RECOVERY_STATE_KEY)?;

        if let Some(expected) = sync_id {
            if state.sync_id != expected {
                tracing::warn!(
                    expected,
                    found = %state.sync_id,
                    "Recovery state sync ID mismatch"
                );
                return None;
            }
        }

        tracing::info!(sync_id = %state.sync_id, "Loaded recovery state");
        Some(state)
    }

    pub fn clear_recovery_state(&self) -> bool {
        let cleared = self.storage.delete_object(RECOVERY_STATE_KEY);
        if cleared {
            tracing::info!("Cleared recovery state");
        }
        cleared
    }

    /// Decide whether the current run should continue a saved one
    pub fn should_resume_sync(&self, current_sync_id: &str) -> (bool, Option<RecoveryState>) {
        self.should_resume_sync_at(current_sync_id, Utc::now())
    }

    /// [`Self::should_resume_sync`] against an explicit clock
    pub fn should_resume_sync_at(
        &self,
        current_sync_id: &str,
        now: DateTime<Utc>,
    ) -> (bool, Option<RecoveryState>) {
        let Some(state) = self.load_recovery_state(None) else {
            return (false, None);
        };

        if state.sync_id == current_sync_id {
            self.record_resume(true);
            return (true, Some(state));
        }

        let age = state.age(now);
        if age < resume_window() {
            tracing::info!(
                sync_id = %state.sync_id,
                age = %humantime::format_duration(age.to_std().unwrap_or_default()),
                "Found recent incomplete sync, resuming"
            );
            self.record_resume(true);
            (true, Some(state))
        } else {
            tracing::info!(
                sync_id = %state.sync_id,
                started = %state.start_time.to_rfc3339_opts(SecondsFormat::Secs, true),
                "Found stale incomplete sync, starting fresh"
            );
            self.clear_recovery_state();
            (false, None)
        }
    }

    /// Record an outcome; returns true when this call persisted a checkpoint.
    ///
    /// A checkpoint is written whenever a new completion brings the completed
    /// count to a multiple of [`CHECKPOINT_INTERVAL`].
    pub fn update_progress(
        &self,
        state: &mut RecoveryState,
        bottle_id: &str,
        status: BottleStatus,
    ) -> bool {
        let inserted = state.record(bottle_id, status);

        let due = inserted
            && status == BottleStatus::Completed
            && state.completed_bottles.len() % CHECKPOINT_INTERVAL == 0;
        if !due {
            return false;
        }

        state.recovery_checkpoint = Some(Utc::now());
        tracing::debug!(
            sync_id = %state.sync_id,
            completed = state.completed_bottles.len(),
            "Checkpointing sync progress"
        );
        self.save_recovery_state(state)
    }

    fn record_resume(&self, success: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.put_recovery_metric("sync_resume", success);
        }
    }
}
