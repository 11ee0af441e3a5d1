/// Metrics sink for error, retry and recovery counters
///
/// The metric names and dimension keys are consumed by dashboards, so they
/// are fixed: `Errors{ErrorType,Operation}`, `Retries{Operation,AttemptNumber,Success}`
/// and `Recovery{RecoveryType,Success}`.
use crate::error::ErrorContext;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};

/// Default metric namespace
pub const DEFAULT_NAMESPACE: &str = "HomebrewSync";

/// Unit attached to a datum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MetricUnit {
    Count,
    Bytes,
    Seconds,
    Percent,
}

impl MetricUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricUnit::Count => "Count",
            MetricUnit::Bytes => "Bytes",
            MetricUnit::Seconds => "Seconds",
            MetricUnit::Percent => "Percent",
        }
    }
}

/// One emitted data point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricDatum {
    pub name: String,
    pub value: f64,
    pub unit: MetricUnit,
    pub dimensions: Vec<(String, String)>,
    pub timestamp: DateTime<Utc>,
}

impl MetricDatum {
    /// Look up a dimension value by name
    pub fn dimension(&self, name: &str) -> Option<&str> {
        self.dimensions
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

fn bool_dimension(value: bool) -> String {
    if value { "True" } else { "False" }.to_string()
}

/// Receiver for metric data points.
///
/// Implementations must tolerate concurrent callers; emission never fails
/// from the caller's point of view.
pub trait MetricsSink: Send + Sync {
    fn put_metric(&self, name: &str, value: f64, unit: MetricUnit, dimensions: &[(&str, String)]);

    /// Count one classified failure
    fn put_error_metric(&self, context: &ErrorContext) {
        let mut dimensions = vec![
            ("ErrorType", context.error_type.as_str().to_string()),
            ("Operation", context.operation.clone()),
        ];
        if let Some(resource) = &context.resource_id {
            dimensions.push(("ResourceId", resource.clone()));
        }
        self.put_metric("Errors", 1.0, MetricUnit::Count, &dimensions);
    }

    /// Count one retry attempt outcome
    fn put_retry_metric(&self, operation: &str, attempt: u32, success: bool) {
        self.put_metric(
            "Retries",
            1.0,
            MetricUnit::Count,
            &[
                ("Operation", operation.to_string()),
                ("AttemptNumber", attempt.to_string()),
                ("Success", bool_dimension(success)),
            ],
        );
    }

    /// Count one recovery action
    fn put_recovery_metric(&self, recovery_type: &str, success: bool) {
        self.put_metric(
            "Recovery",
            1.0,
            MetricUnit::Count,
            &[
                ("RecoveryType", recovery_type.to_string()),
                ("Success", bool_dimension(success)),
            ],
        );
    }
}

/// Emits every datum as a structured `tracing` event
#[derive(Debug, Clone)]
pub struct TracingMetrics {
    namespace: String,
}

impl TracingMetrics {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl Default for TracingMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl MetricsSink for TracingMetrics {
    fn put_metric(&self, name: &str, value: f64, unit: MetricUnit, dimensions: &[(&str, String)]) {
        let rendered = dimensions
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join(",");

        tracing::info!(
            target: "metrics",
            namespace = %self.namespace,
            metric = name,
            value,
            unit = unit.as_str(),
            dimensions = %rendered,
            "metric"
        );
    }
}

/// Records datums in memory, for tests and local summaries
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    datums: Mutex<Vec<MetricDatum>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<MetricDatum>> {
        // A panic while holding the lock cannot leave the Vec half-updated
        self.datums.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of everything recorded so far
    pub fn datums(&self) -> Vec<MetricDatum> {
        self.lock().clone()
    }

    pub fn datums_named(&self, name: &str) -> Vec<MetricDatum> {
        self.lock()
            .iter()
            .filter(|datum| datum.name == name)
            .cloned()
            .collect()
    }

    /// Sum of values recorded under `name`
    pub fn count(&self, name: &str) -> f64 {
        self.lock()
            .iter()
            .filter(|datum| datum.name == name)
            .map(|datum| datum.value)
            .sum()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl MetricsSink for InMemoryMetrics {
    fn put_metric(&self, name: &str, value: f64, unit: MetricUnit, dimensions: &[(&str, String)]) {
        self.lock().push(MetricDatum {
            name: name.to_string(),
            value,
            unit,
            dimensions: dimensions
                .iter()
                .map(|(key, value)| (key.to_string(), value.clone()))
                .collect(),
            timestamp: Utc::now(),
        });
    }
}
