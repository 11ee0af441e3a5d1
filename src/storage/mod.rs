// Object storage backends and the service wrapper used by the ledger
//
// [`ObjectStore`] is the raw, fallible blob-store seam. [`StorageService`]
// layers retries, classification and metrics on top of it and exposes the
// bool/Option contract the hash file and recovery code rely on.

pub mod fs;
pub mod memory;
pub mod service;

pub use fs::FsObjectStore;
pub use memory::{MemoryObjectStore, StoreOp};
pub use service::StorageService;

use crate::SyncResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// Object body plus its metadata
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub metadata: ObjectMetadata,
}

/// Result of a head request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub etag: String,

    /// User metadata supplied at upload time
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// One entry of a listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub etag: String,
}

impl From<(&str, &ObjectMetadata)> for ObjectSummary {
    fn from((key, meta): (&str, &ObjectMetadata)) -> Self {
        Self {
            key: key.to_string(),
            size: meta.size,
            last_modified: meta.last_modified,
            etag: meta.etag.clone(),
        }
    }
}

/// Key/value blob store with server-side copy.
///
/// Missing objects are reported as `Ok(None)` by reads and as a `NoSuchKey`
/// storage error by `copy_object`. `copy_object` must be atomic with respect
/// to readers of the destination key.
pub trait ObjectStore: Send + Sync {
    /// Name of the bucket this handle addresses
    fn bucket(&self) -> &str;

    fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> SyncResult<()>;

    fn get_object(&self, key: &str) -> SyncResult<Option<StoredObject>>;

    fn head_object(&self, key: &str) -> SyncResult<Option<ObjectMetadata>>;

    /// Deleting a missing key succeeds
    fn delete_object(&self, key: &str) -> SyncResult<()>;

    fn copy_object(&self, source_key: &str, dest_key: &str) -> SyncResult<()>;

    /// Keys starting with `prefix` in lexicographic order, at most `max_keys`
    fn list_objects(&self, prefix: &str, max_keys: usize) -> SyncResult<Vec<ObjectSummary>>;

    /// Handle to another bucket on the same backend
    fn open_bucket(&self, bucket: &str) -> SyncResult<Arc<dyn ObjectStore>>;
}

/// Entity tag for a body (hex SHA-256)
pub fn compute_etag(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    digest.iter().map(|byte| format!("{:02x}", byte)).collect()
}
