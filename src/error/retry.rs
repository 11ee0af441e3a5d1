/// Retry engine with exponential backoff and jitter
///
/// A [`RetryHandler`] holds an immutable [`RetryConfig`] and an optional
/// metrics sink. Each `retry_*` call keeps its own attempt counter, so one
/// handler can be shared across concurrently running operations.
use crate::metrics::MetricsSink;
use crate::{SyncError, SyncResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Provider codes worth retrying
pub const RETRYABLE_STORAGE_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "ServiceUnavailable",
    "InternalError",
    "SlowDown",
];

/// Fraction of the computed delay used as the jitter range
const JITTER_FRACTION: f64 = 0.1;

/// Largest accepted `max_delay`, in seconds (one day)
pub const MAX_RETRY_DELAY: f64 = 86_400.0;

/// Retry policy, shared by every call made through one client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one (>= 1)
    pub max_attempts: u32,

    /// Delay before the second retry, in seconds
    pub base_delay: f64,

    /// Upper bound for any single delay, in seconds
    pub max_delay: f64,

    pub exponential_base: f64,

    /// Add up to ±10% uniform noise to each delay
    pub jitter: bool,

    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: 1.0,
            max_delay: 60.0,
            exponential_base: 2.0,
            jitter: true,
            backoff_multiplier: 1.0,
        }
    }
}

impl RetryConfig {
    /// Preset used by the storage service
    pub fn storage() -> Self {
        Self {
            max_attempts: 3,
            base_delay: 1.0,
            max_delay: 30.0,
            ..Self::default()
        }
    }

    /// Preset for calls against the upstream formula API
    pub fn api() -> Self {
        Self {
            max_attempts: 5,
            base_delay: 2.0,
            max_delay: 120.0,
            ..Self::default()
        }
    }

    /// Set the attempt budget
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.max_attempts < 1 {
            return Err(SyncError::Config("max_attempts must be at least 1".into()));
        }
        if !(self.base_delay >= 0.0) || !(self.max_delay >= 0.0) {
            return Err(SyncError::Config("retry delays cannot be negative".into()));
        }
        if !(self.max_delay <= MAX_RETRY_DELAY) {
            return Err(SyncError::Config(format!(
                "max_delay cannot exceed {} seconds",
                MAX_RETRY_DELAY
            )));
        }
        if self.max_delay < self.base_delay {
            return Err(SyncError::Config(
                "max_delay must be greater than or equal to base_delay".into(),
            ));
        }
        if !(self.exponential_base >= 1.0) {
            return Err(SyncError::Config("exponential_base must be at least 1".into()));
        }
        if !(self.backoff_multiplier > 0.0) {
            return Err(SyncError::Config("backoff_multiplier must be positive".into()));
        }
        Ok(())
    }
}

/// Executes operations under a [`RetryConfig`]
#[derive(Clone)]
pub struct RetryHandler {
    config: RetryConfig,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl std::fmt::Debug for RetryHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryHandler")
            .field("config", &self.config)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl RetryHandler {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            metrics: None,
        }
    }

    /// Attach a metrics sink for `Retries` datums
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay associated with a 1-based attempt number.
    ///
    /// Attempt 1 has no delay; attempt `n` waits
    /// `base_delay * exponential_base^(n-2) * backoff_multiplier`, capped at
    /// `max_delay`, optionally jittered by ±10%, never below zero.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let exponent = (attempt - 2) as f64;
        let mut delay = self.config.base_delay
            * self.config.exponential_base.powf(exponent)
            * self.config.backoff_multiplier;

        if !delay.is_finite() || delay > self.config.max_delay {
            delay = self.config.max_delay;
        }

        if self.config.jitter && delay > 0.0 {
            let range = delay * JITTER_FRACTION;
            delay += rand::thread_rng().gen_range(-range..=range);
        }

        Duration::try_from_secs_f64(delay.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Decide whether a failed attempt should be retried
    pub fn should_retry(&self, error: &SyncError, attempt: u32) -> bool {
        if attempt >= self.config.max_attempts {
            return false;
        }

        match error {
            SyncError::Connection(_) | SyncError::Timeout(_) => true,
            SyncError::Storage { code, .. } => RETRYABLE_STORAGE_CODES.contains(&code.as_str()),
            // Never retry validation, auth failures or shutdown
            SyncError::Validation(_)
            | SyncError::MissingField(_)
            | SyncError::Json(_)
            | SyncError::PermissionDenied(_)
            | SyncError::Config(_)
            | SyncError::Cancelled => false,
            SyncError::Io(io_err) => io_err.kind() != std::io::ErrorKind::PermissionDenied,
            SyncError::Http(_) | SyncError::Other(_) => true,
        }
    }

    /// Run a blocking operation, sleeping the current thread between attempts
    pub fn retry_sync<T, F>(&self, operation: &str, mut f: F) -> SyncResult<T>
    where
        F: FnMut() -> SyncResult<T>,
    {
        let mut attempt = 1;
        loop {
            tracing::debug!(
                operation,
                attempt,
                max_attempts = self.config.max_attempts,
                "Executing operation"
            );

            match f() {
                Ok(value) => {
                    self.record_success(operation, attempt);
                    return Ok(value);
                }
                Err(error) => match self.after_failure(operation, attempt, &error) {
                    Some(delay) => {
                        std::thread::sleep(delay);
                        attempt += 1;
                    }
                    None => return Err(error),
                },
            }
        }
    }

    /// Run an async operation, yielding to the runtime between attempts
    pub async fn retry_async<T, F, Fut>(&self, operation: &str, mut f: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut attempt = 1;
        loop {
            tracing::debug!(
                operation,
                attempt,
                max_attempts = self.config.max_attempts,
                "Executing operation"
            );

            match f().await {
                Ok(value) => {
                    self.record_success(operation, attempt);
                    return Ok(value);
                }
                Err(error) => match self.after_failure(operation, attempt, &error) {
                    Some(delay) => {
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(error),
                },
            }
        }
    }

    fn record_success(&self, operation: &str, attempt: u32) {
        if attempt > 1 {
            tracing::info!(operation, attempt, "Operation succeeded after retry");
            if let Some(metrics) = &self.metrics {
                metrics.put_retry_metric(operation, attempt, true);
            }
        }
    }

    /// Shared failure bookkeeping; returns the delay before the next attempt,
    /// or `None` when the error must be returned to the caller.
    fn after_failure(&self, operation: &str, attempt: u32, error: &SyncError) -> Option<Duration> {
        if let Some(metrics) = &self.metrics {
            metrics.put_retry_metric(operation, attempt, false);
        }

        if !self.should_retry(error, attempt) {
            if attempt >= self.config.max_attempts {
                tracing::error!(operation, attempt, error = %error, "Failed on final attempt");
            } else {
                tracing::error!(operation, attempt, error = %error, "Failed (not retryable)");
            }
            return None;
        }

        let delay = self.calculate_delay(attempt);
        tracing::warn!(
            operation,
            attempt,
            delay = %humantime::format_duration(delay),
            error = %error,
            "Operation failed, retrying"
        );
        Some(delay)
    }
}

impl Default for RetryHandler {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetrics;
    use proptest::prelude::*;
    use std::cell::Cell;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: 0.001,
            max_delay: 0.004,
            exponential_base: 2.0,
            jitter: false,
            backoff_multiplier: 1.0,
        }
    }

    #[test]
    fn test_first_attempt_has_no_delay() {
        let handler = RetryHandler::new(RetryConfig::default());
        assert_eq!(handler.calculate_delay(0), Duration::ZERO);
        assert_eq!(handler.calculate_delay(1), Duration::ZERO);
    }

    #[test]
    fn test_exponential_delays_without_jitter() {
        let handler = RetryHandler::new(RetryConfig::default().with_jitter(false));

        assert_eq!(handler.calculate_delay(2).as_secs_f64(), 1.0);
        assert_eq!(handler.calculate_delay(3).as_secs_f64(), 2.0);
        assert_eq!(handler.calculate_delay(4).as_secs_f64(), 4.0);
        assert_eq!(handler.calculate_delay(20).as_secs_f64(), 60.0);
    }

    #[test]
    fn test_backoff_multiplier_applies() {
        let config = RetryConfig {
            backoff_multiplier: 1.5,
            jitter: false,
            ..RetryConfig::default()
        };
        let handler = RetryHandler::new(config);
        assert_eq!(handler.calculate_delay(3).as_secs_f64(), 3.0);
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let handler = RetryHandler::new(RetryConfig::default());
        for _ in 0..200 {
            let delay = handler.calculate_delay(3).as_secs_f64();
            assert!((1.8..=2.2).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_huge_attempt_is_capped() {
        let handler = RetryHandler::new(RetryConfig::default().with_jitter(false));
        assert_eq!(handler.calculate_delay(u32::MAX).as_secs_f64(), 60.0);
    }

    proptest! {
        #[test]
        fn test_delay_is_monotonic_until_plateau(
            base in 0.001f64..5.0,
            factor in 1.0f64..4.0,
            cap in 5.0f64..500.0,
            attempt in 1u32..40,
        ) {
            let handler = RetryHandler::new(RetryConfig {
                max_attempts: 50,
                base_delay: base,
                max_delay: cap,
                exponential_base: factor,
                jitter: false,
                backoff_multiplier: 1.0,
            });
            let current = handler.calculate_delay(attempt);
            let next = handler.calculate_delay(attempt + 1);
            prop_assert!(next >= current);
            prop_assert!(next.as_secs_f64() <= cap + 1e-9);
        }
    }

    #[test]
    fn test_should_retry_by_error_kind() {
        let handler = RetryHandler::new(fast_config(5));

        assert!(handler.should_retry(&SyncError::Connection("reset".into()), 1));
        assert!(handler.should_retry(&SyncError::Timeout("slow".into()), 1));
        assert!(handler.should_retry(&SyncError::storage("SlowDown", "x"), 1));
        assert!(handler.should_retry(&SyncError::storage("ServiceUnavailable", "x"), 1));
        assert!(!handler.should_retry(&SyncError::storage("NoSuchKey", "x"), 1));
        assert!(!handler.should_retry(&SyncError::storage("AccessDenied", "x"), 1));
        assert!(!handler.should_retry(&SyncError::Validation("x".into()), 1));
        assert!(!handler.should_retry(&SyncError::MissingField("x".into()), 1));
        assert!(!handler.should_retry(&SyncError::PermissionDenied("x".into()), 1));
        assert!(!handler.should_retry(&SyncError::Cancelled, 1));
        assert!(handler.should_retry(&SyncError::Other("mystery".into()), 1));
    }

    #[test]
    fn test_should_retry_respects_budget() {
        let handler = RetryHandler::new(fast_config(3));
        let error = SyncError::Connection("reset".into());

        assert!(handler.should_retry(&error, 1));
        assert!(handler.should_retry(&error, 2));
        assert!(!handler.should_retry(&error, 3));
    }

    #[test]
    fn test_retry_sync_exhausts_exact_budget() {
        let handler = RetryHandler::new(fast_config(3));
        let calls = Cell::new(0);

        let result: SyncResult<()> = handler.retry_sync("always_fails", || {
            calls.set(calls.get() + 1);
            Err(SyncError::Connection("refused".into()))
        });

        assert!(matches!(result, Err(SyncError::Connection(_))));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_retry_sync_non_retryable_short_circuits() {
        let handler = RetryHandler::new(fast_config(10));
        let calls = Cell::new(0);

        let result: SyncResult<()> = handler.retry_sync("bad_input", || {
            calls.set(calls.get() + 1);
            Err(SyncError::Validation("malformed".into()))
        });

        assert!(matches!(result, Err(SyncError::Validation(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_retry_sync_recovers_and_emits_metrics() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let handler = RetryHandler::new(fast_config(5)).with_metrics(metrics.clone());
        let calls = Cell::new(0);

        let result = handler.retry_sync("flaky", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(SyncError::Timeout("slow".into()))
            } else {
                Ok(42)
            }
        });

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);

        let retries = metrics.datums_named("Retries");
        assert_eq!(retries.len(), 3);
        assert_eq!(retries[0].dimension("Success"), Some("False"));
        assert_eq!(retries[2].dimension("Success"), Some("True"));
        assert_eq!(retries[2].dimension("AttemptNumber"), Some("3"));
        assert_eq!(retries[2].dimension("Operation"), Some("flaky"));
    }

    #[test]
    fn test_first_try_success_emits_nothing() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let handler = RetryHandler::new(fast_config(3)).with_metrics(metrics.clone());

        let value = handler.retry_sync("ok", || Ok::<_, SyncError>("done")).unwrap();
        assert_eq!(value, "done");
        assert!(metrics.datums().is_empty());
    }

    #[tokio::test]
    async fn test_retry_async_exhausts_exact_budget() {
        let handler = RetryHandler::new(fast_config(3));
        let calls = std::sync::atomic::AtomicU32::new(0);

        let result: SyncResult<()> = handler
            .retry_async("async_fails", || {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err(SyncError::storage("Throttling", "slow down")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_async_recovers() {
        let handler = RetryHandler::new(fast_config(4));
        let calls = std::sync::atomic::AtomicU32::new(0);

        let result = handler
            .retry_async("async_flaky", || {
                let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(SyncError::Connection("reset".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 1);
    }

    #[test]
    fn test_config_validation() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(RetryConfig::storage().validate().is_ok());
        assert!(RetryConfig::default().with_max_attempts(0).validate().is_err());

        let inverted = RetryConfig {
            base_delay: 10.0,
            max_delay: 1.0,
            ..RetryConfig::default()
        };
        assert!(inverted.validate().is_err());

        let shrinking = RetryConfig {
            exponential_base: 0.5,
            ..RetryConfig::default()
        };
        assert!(shrinking.validate().is_err());
    }

    #[test]
    fn test_unbounded_max_delay_rejected() {
        for max_delay in [1e30, f64::INFINITY, f64::NAN, MAX_RETRY_DELAY + 1.0] {
            let config = RetryConfig {
                max_delay,
                ..RetryConfig::default()
            };
            assert!(config.validate().is_err(), "max_delay {} accepted", max_delay);
        }

        let day = RetryConfig {
            max_delay: MAX_RETRY_DELAY,
            ..RetryConfig::default()
        };
        assert!(day.validate().is_ok());
    }

    #[test]
    fn test_oversized_delay_saturates() {
        let handler = RetryHandler::new(RetryConfig {
            max_delay: 1e30,
            ..RetryConfig::default().with_jitter(false)
        });
        assert_eq!(handler.calculate_delay(100), Duration::MAX);
        assert_eq!(handler.calculate_delay(2), Duration::from_secs(1));
    }
}
