/// Directory-backed object store
///
/// Objects live at `<root>/<bucket>/<key>` with a JSON metadata sidecar at
/// `<root>/<bucket>/.meta/<key>.json`. Bodies are written to a temp file in
/// the destination directory and renamed into place, so readers never see
/// a partially written object.
///
/// Body and sidecar are two renames, not one. Writes drop the old sidecar
/// first and add the new one last; a body without a matching sidecar is
/// described from its file metadata alone.
use super::{compute_etag, ObjectMetadata, ObjectStore, ObjectSummary, StoredObject};
use crate::{SyncError, SyncResult};
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

const META_DIR: &str = ".meta";
const TEMP_PREFIX: &str = ".tmp-object";

#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
    bucket: String,
}

impl FsObjectStore {
    /// Open (and create if needed) `bucket` under `root`
    pub fn new(root: impl Into<PathBuf>, bucket: impl Into<String>) -> SyncResult<Self> {
        let store = Self {
            root: root.into(),
            bucket: bucket.into(),
        };
        validate_key(&store.bucket)?;
        fs::create_dir_all(store.bucket_dir())?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self) -> PathBuf {
        self.root.join(&self.bucket)
    }

    fn object_path(&self, key: &str) -> SyncResult<PathBuf> {
        validate_key(key)?;
        Ok(self.bucket_dir().join(key))
    }

    fn meta_path(&self, key: &str) -> SyncResult<PathBuf> {
        validate_key(key)?;
        Ok(self.bucket_dir().join(META_DIR).join(format!("{}.json", key)))
    }

    fn read_meta(&self, key: &str) -> SyncResult<Option<ObjectMetadata>> {
        let object_path = self.object_path(key)?;
        if !object_path.is_file() {
            return Ok(None);
        }

        let file = fs::metadata(&object_path)?;
        match fs::read(self.meta_path(key)?) {
            Ok(raw) => {
                let meta: ObjectMetadata = serde_json::from_slice(&raw)?;
                if meta.size == file.len() {
                    return Ok(Some(meta));
                }
                tracing::warn!(bucket = %self.bucket, key, "Metadata sidecar does not match object");
                Ok(Some(file_metadata(&file)?))
            }
            // Object dropped in by hand, or a write interrupted before its sidecar
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Some(file_metadata(&file)?)),
            Err(e) => Err(e.into()),
        }
    }

    /// Write body then sidecar, with no stale sidecar visible in between
    fn write_object(&self, key: &str, body: &[u8], meta: &ObjectMetadata) -> SyncResult<()> {
        let meta_path = self.meta_path(key)?;
        match fs::remove_file(&meta_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        write_atomically(&self.object_path(key)?, body)?;
        write_atomically(&meta_path, &serde_json::to_vec(meta)?)
    }
}

/// Metadata derived from the file alone; the etag is built from size and
/// mtime so large bodies are never read
fn file_metadata(file: &fs::Metadata) -> SyncResult<ObjectMetadata> {
    let modified = file.modified()?;
    let nanos = modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    Ok(ObjectMetadata {
        size: file.len(),
        last_modified: modified.into(),
        etag: format!("{:x}-{:x}", file.len(), nanos),
        metadata: HashMap::new(),
    })
}

/// Write `bytes` to `path` via a temp file in the same directory
fn write_atomically(path: &Path, bytes: &[u8]) -> SyncResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| SyncError::Validation(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(parent)?;

    let mut temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    persist(temp, path)
}

fn persist(temp: NamedTempFile, path: &Path) -> SyncResult<()> {
    temp.persist(path).map_err(|e| SyncError::Io(e.error))?;
    Ok(())
}

/// Keys are relative `/`-separated paths without `..` segments
fn validate_key(key: &str) -> SyncResult<()> {
    if key.is_empty() {
        return Err(SyncError::storage("InvalidRequest", "object key is empty"));
    }

    let path = Path::new(key);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    let reserved = path
        .components()
        .next()
        .map(|c| c.as_os_str() == META_DIR)
        .unwrap_or(false);

    if escapes || reserved {
        return Err(SyncError::storage(
            "InvalidRequest",
            format!("object key {} is not allowed", key),
        ));
    }
    Ok(())
}

impl ObjectStore for FsObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> SyncResult<()> {
        let meta = ObjectMetadata {
            size: body.len() as u64,
            last_modified: Utc::now(),
            etag: compute_etag(&body),
            metadata,
        };

        self.write_object(key, &body, &meta)?;
        tracing::trace!(bucket = %self.bucket, key, size = meta.size, "Stored object");
        Ok(())
    }

    fn get_object(&self, key: &str) -> SyncResult<Option<StoredObject>> {
        let Some(metadata) = self.read_meta(key)? else {
            return Ok(None);
        };
        match fs::read(self.object_path(key)?) {
            Ok(body) => Ok(Some(StoredObject { body, metadata })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn head_object(&self, key: &str) -> SyncResult<Option<ObjectMetadata>> {
        self.read_meta(key)
    }

    fn delete_object(&self, key: &str) -> SyncResult<()> {
        for path in [self.object_path(key)?, self.meta_path(key)?] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn copy_object(&self, source_key: &str, dest_key: &str) -> SyncResult<()> {
        let source = self.get_object(source_key)?.ok_or_else(|| {
            SyncError::storage("NoSuchKey", format!("copy source {} does not exist", source_key))
        })?;

        let mut meta = source.metadata;
        meta.last_modified = Utc::now();

        self.write_object(dest_key, &source.body, &meta)
    }

    fn list_objects(&self, prefix: &str, max_keys: usize) -> SyncResult<Vec<ObjectSummary>> {
        let bucket_dir = self.bucket_dir();
        let pattern = format!(
            "{}/**/*",
            glob::Pattern::escape(&bucket_dir.to_string_lossy())
        );
        let entries = glob::glob(&pattern)
            .map_err(|e| SyncError::Validation(format!("invalid listing pattern: {}", e)))?;

        let mut keys = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| SyncError::Io(e.into()))?;
            if !path.is_file() {
                continue;
            }
            let Ok(relative) = path.strip_prefix(&bucket_dir) else {
                continue;
            };

            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            let hidden = relative
                .components()
                .any(|c| c.as_os_str().to_string_lossy().starts_with(TEMP_PREFIX))
                || key.starts_with(META_DIR);
            if hidden || !key.starts_with(prefix) {
                continue;
            }
            keys.push(key);
        }
        keys.sort();

        let mut summaries = Vec::new();
        for key in keys.into_iter().take(max_keys) {
            if let Some(meta) = self.read_meta(&key)? {
                summaries.push(ObjectSummary::from((key.as_str(), &meta)));
            }
        }
        Ok(summaries)
    }

    fn open_bucket(&self, bucket: &str) -> SyncResult<Arc<dyn ObjectStore>> {
        Ok(Arc::new(Self::new(self.root.clone(), bucket)?))
    }
}
