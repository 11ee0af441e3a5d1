/// In-memory object store with fault injection
///
/// All handles opened from one store share the same state, so a sibling
/// bucket obtained through `open_bucket` sees writes made by the parent.
use super::{compute_etag, ObjectMetadata, ObjectStore, ObjectSummary, StoredObject};
use crate::{SyncError, SyncResult};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

/// Store operation kinds that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Put,
    Get,
    Head,
    Delete,
    Copy,
    List,
}

type Tamper = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

struct InjectedFailure {
    remaining: usize,
    error: SyncError,
}

#[derive(Default)]
struct MemoryState {
    buckets: HashMap<String, BTreeMap<String, StoredObject>>,
    failures: HashMap<StoreOp, InjectedFailure>,
    tampers: HashMap<String, Tamper>,
}

impl MemoryState {
    fn take_failure(&mut self, op: StoreOp) -> Option<SyncError> {
        let failure = self.failures.get_mut(&op)?;
        if failure.remaining == 0 {
            return None;
        }
        failure.remaining -= 1;
        let error = failure.error.clone();
        if failure.remaining == 0 {
            self.failures.remove(&op);
        }
        Some(error)
    }
}

/// Thread-safe in-memory backend
#[derive(Clone)]
pub struct MemoryObjectStore {
    bucket: String,
    state: Arc<Mutex<MemoryState>>,
}

impl std::fmt::Debug for MemoryObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryObjectStore")
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `times` operations of kind `op` fail with `error`
    pub fn fail_next(&self, op: StoreOp, times: usize, error: SyncError) {
        self.lock().failures.insert(
            op,
            InjectedFailure {
                remaining: times,
                error,
            },
        );
    }

    /// Rewrite every body written to `key` through `tamper`
    pub fn set_write_tamper<F>(&self, key: impl Into<String>, tamper: F)
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.lock().tampers.insert(key.into(), Arc::new(tamper));
    }

    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.failures.clear();
        state.tampers.clear();
    }

    /// Keys currently stored in this bucket
    pub fn keys(&self) -> Vec<String> {
        self.lock()
            .buckets
            .get(&self.bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Raw body of `key`, bypassing fault injection
    pub fn raw_body(&self, key: &str) -> Option<Vec<u8>> {
        self.lock()
            .buckets
            .get(&self.bucket)
            .and_then(|objects| objects.get(key))
            .map(|object| object.body.clone())
    }

    fn check(&self, state: &mut MemoryState, op: StoreOp) -> SyncResult<()> {
        match state.take_failure(op) {
            Some(error) => {
                tracing::debug!(bucket = %self.bucket, op = ?op, "Injected store failure");
                Err(error)
            }
            None => Ok(()),
        }
    }
}

impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> SyncResult<()> {
        let mut state = self.lock();
        self.check(&mut state, StoreOp::Put)?;

        let body = match state.tampers.get(key) {
            Some(tamper) => tamper(&body),
            None => body,
        };

        let object = StoredObject {
            metadata: ObjectMetadata {
                size: body.len() as u64,
                last_modified: Utc::now(),
                etag: compute_etag(&body),
                metadata,
            },
            body,
        };

        state
            .buckets
            .entry(self.bucket.clone())
            .or_default()
            .insert(key.to_string(), object);
        Ok(())
    }

    fn get_object(&self, key: &str) -> SyncResult<Option<StoredObject>> {
        let mut state = self.lock();
        self.check(&mut state, StoreOp::Get)?;
        Ok(state
            .buckets
            .get(&self.bucket)
            .and_then(|objects| objects.get(key))
            .cloned())
    }

    fn head_object(&self, key: &str) -> SyncResult<Option<ObjectMetadata>> {
        let mut state = self.lock();
        self.check(&mut state, StoreOp::Head)?;
        Ok(state
            .buckets
            .get(&self.bucket)
            .and_then(|objects| objects.get(key))
            .map(|object| object.metadata.clone()))
    }

    fn delete_object(&self, key: &str) -> SyncResult<()> {
        let mut state = self.lock();
        self.check(&mut state, StoreOp::Delete)?;
        if let Some(objects) = state.buckets.get_mut(&self.bucket) {
            objects.remove(key);
        }
        Ok(())
    }

    fn copy_object(&self, source_key: &str, dest_key: &str) -> SyncResult<()> {
        let mut state = self.lock();
        self.check(&mut state, StoreOp::Copy)?;

        let objects = state.buckets.entry(self.bucket.clone()).or_default();
        let mut object = objects.get(source_key).cloned().ok_or_else(|| {
            SyncError::storage("NoSuchKey", format!("copy source {} does not exist", source_key))
        })?;
        object.metadata.last_modified = Utc::now();
        objects.insert(dest_key.to_string(), object);
        Ok(())
    }

    fn list_objects(&self, prefix: &str, max_keys: usize) -> SyncResult<Vec<ObjectSummary>> {
        let mut state = self.lock();
        self.check(&mut state, StoreOp::List)?;
        Ok(state
            .buckets
            .get(&self.bucket)
            .map(|objects| {
                objects
                    .iter()
                    .filter(|(key, _)| key.starts_with(prefix))
                    .take(max_keys)
                    .map(|(key, object)| ObjectSummary::from((key.as_str(), &object.metadata)))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn open_bucket(&self, bucket: &str) -> SyncResult<Arc<dyn ObjectStore>> {
        Ok(Arc::new(Self {
            bucket: bucket.to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}
