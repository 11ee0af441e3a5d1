/// Storage service: retries, classification and metrics over an [`ObjectStore`]
///
/// Methods follow a bool/Option contract. Failures are logged with their full
/// error context and counted, but never propagated; a missing object is not
/// a failure.
use super::{ObjectMetadata, ObjectStore, ObjectSummary};
use crate::error::{ErrorClassifier, RetryConfig, RetryHandler};
use crate::metrics::{MetricUnit, MetricsSink};
use crate::SyncError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub struct StorageService {
    store: Arc<dyn ObjectStore>,
    retry: Arc<RetryHandler>,
    classifier: ErrorClassifier,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl std::fmt::Debug for StorageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageService")
            .field("bucket", &self.store.bucket())
            .field("retry", &self.retry.config())
            .finish()
    }
}

impl StorageService {
    pub fn new(store: Arc<dyn ObjectStore>, retry_config: RetryConfig) -> Self {
        Self {
            store,
            retry: Arc::new(RetryHandler::new(retry_config)),
            classifier: ErrorClassifier::new(),
            metrics: None,
        }
    }

    /// Attach a metrics sink (also used by the retry handler)
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        let handler = RetryHandler::new(self.retry.config().clone()).with_metrics(metrics.clone());
        self.retry = Arc::new(handler);
        self.metrics = Some(metrics);
        self
    }

    pub fn bucket(&self) -> &str {
        self.store.bucket()
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn metrics(&self) -> Option<&Arc<dyn MetricsSink>> {
        self.metrics.as_ref()
    }

    /// Service addressing another bucket on the same backend, sharing
    /// retry policy and metrics
    pub fn for_bucket(&self, bucket: &str) -> Option<Self> {
        if bucket == self.bucket() {
            return Some(self.clone());
        }
        match self.store.open_bucket(bucket) {
            Ok(store) => Some(Self {
                store,
                retry: Arc::clone(&self.retry),
                classifier: self.classifier,
                metrics: self.metrics.clone(),
            }),
            Err(e) => {
                self.report_failure("open_bucket", bucket, &e);
                None
            }
        }
    }

    pub fn upload_json<T: Serialize>(
        &self,
        value: &T,
        key: &str,
        metadata: HashMap<String, String>,
    ) -> bool {
        let body = match serde_json::to_vec_pretty(value) {
            Ok(body) => body,
            Err(e) => {
                self.report_failure("upload_json", key, &e.into());
                return false;
            }
        };

        let result = self.retry.retry_sync("upload_json", || {
            self.store.put_object(key, body.clone(), metadata.clone())
        });
        self.finish_write("upload_json", key, result)
    }

    /// Download and parse a JSON document; `None` when missing or unparseable
    pub fn download_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let object = match self.retry.retry_sync("download_json", || self.store.get_object(key)) {
            Ok(Some(object)) => object,
            Ok(None) => {
                tracing::debug!(bucket = %self.bucket(), key, "Object not found");
                return None;
            }
            Err(e) => {
                self.report_failure("download_json", key, &e);
                return None;
            }
        };

        match serde_json::from_slice(&object.body) {
            Ok(value) => {
                self.count("S3Download", "download_json");
                Some(value)
            }
            Err(e) => {
                self.report_failure("download_json", key, &e.into());
                None
            }
        }
    }

    pub fn upload_file(&self, path: &Path, key: &str, metadata: HashMap<String, String>) -> bool {
        let body = match fs::read(path) {
            Ok(body) => body,
            Err(e) => {
                self.report_failure("upload_file", key, &e.into());
                return false;
            }
        };

        let result = self.retry.retry_sync("upload_file", || {
            self.store.put_object(key, body.clone(), metadata.clone())
        });
        self.finish_write("upload_file", key, result)
    }

    pub fn download_file(&self, key: &str, path: &Path) -> bool {
        let object = match self.retry.retry_sync("download_file", || self.store.get_object(key)) {
            Ok(Some(object)) => object,
            Ok(None) => {
                tracing::warn!(bucket = %self.bucket(), key, "Object not found for download");
                return false;
            }
            Err(e) => {
                self.report_failure("download_file", key, &e);
                return false;
            }
        };

        let written = path
            .parent()
            .map(fs::create_dir_all)
            .unwrap_or(Ok(()))
            .and_then(|_| fs::write(path, &object.body));

        match written {
            Ok(()) => {
                self.count("S3Download", "download_file");
                true
            }
            Err(e) => {
                self.report_failure("download_file", key, &e.into());
                false
            }
        }
    }

    pub fn object_exists(&self, key: &str) -> bool {
        match self.retry.retry_sync("object_exists", || self.store.head_object(key)) {
            Ok(meta) => meta.is_some(),
            Err(e) => {
                self.report_failure("object_exists", key, &e);
                false
            }
        }
    }

    pub fn get_object_metadata(&self, key: &str) -> Option<ObjectMetadata> {
        match self
            .retry
            .retry_sync("get_object_metadata", || self.store.head_object(key))
        {
            Ok(meta) => meta,
            Err(e) => {
                self.report_failure("get_object_metadata", key, &e);
                None
            }
        }
    }

    pub fn delete_object(&self, key: &str) -> bool {
        match self.retry.retry_sync("delete_object", || self.store.delete_object(key)) {
            Ok(()) => {
                tracing::debug!(bucket = %self.bucket(), key, "Deleted object");
                true
            }
            Err(e) => {
                self.report_failure("delete_object", key, &e);
                false
            }
        }
    }

    /// Server-side copy within this bucket
    pub fn copy_object(&self, source_key: &str, dest_key: &str) -> bool {
        match self
            .retry
            .retry_sync("copy_object", || self.store.copy_object(source_key, dest_key))
        {
            Ok(()) => {
                tracing::debug!(bucket = %self.bucket(), source_key, dest_key, "Copied object");
                true
            }
            Err(e) => {
                self.report_failure("copy_object", source_key, &e);
                false
            }
        }
    }

    /// Listing, empty on failure
    pub fn list_objects(&self, prefix: &str, max_keys: usize) -> Vec<ObjectSummary> {
        self.list_objects_checked(prefix, max_keys)
            .unwrap_or_default()
    }

    /// Listing that tells a failed call apart from an empty bucket
    pub fn list_objects_checked(&self, prefix: &str, max_keys: usize) -> Option<Vec<ObjectSummary>> {
        match self
            .retry
            .retry_sync("list_objects", || self.store.list_objects(prefix, max_keys))
        {
            Ok(objects) => Some(objects),
            Err(e) => {
                self.report_failure("list_objects", prefix, &e);
                None
            }
        }
    }

    fn finish_write(&self, operation: &str, key: &str, result: crate::SyncResult<()>) -> bool {
        match result {
            Ok(()) => {
                tracing::info!(bucket = %self.bucket(), key, operation, "Uploaded object");
                self.count("S3Upload", operation);
                true
            }
            Err(e) => {
                self.report_failure(operation, key, &e);
                false
            }
        }
    }

    fn count(&self, name: &str, operation: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.put_metric(
                name,
                1.0,
                MetricUnit::Count,
                &[("Operation", operation.to_string())],
            );
        }
    }

    fn report_failure(&self, operation: &str, key: &str, error: &SyncError) {
        let context = self.classifier.classify(error, operation).with_resource(key);
        tracing::error!(
            bucket = %self.bucket(),
            key,
            operation,
            error_type = %context.error_type,
            error = %context.error_message,
            context = ?context,
            "Storage operation failed"
        );
        if let Some(metrics) = &self.metrics {
            metrics.put_error_metric(&context);
        }
    }
}
