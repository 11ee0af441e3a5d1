/// Hash file load ladder
///
/// External source first, then the canonical document. A corrupted or
/// unparseable canonical document is backed up and rebuilt from the bottle
/// objects; if that fails too the sync starts from an empty ledger and
/// re-downloads everything.
use super::{HashFileFetcher, HashFileManager, HASH_FILE_KEY};
use crate::config::SyncConfig;
use crate::storage::StorageService;
use std::fmt;
use std::sync::Arc;

/// Where the loaded ledger came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashFileSource {
    External,
    Canonical,
    Rebuilt,
    Empty,
}

impl HashFileSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashFileSource::External => "external",
            HashFileSource::Canonical => "canonical",
            HashFileSource::Rebuilt => "rebuilt",
            HashFileSource::Empty => "empty",
        }
    }
}

impl fmt::Display for HashFileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Load the ledger for a sync run. Never fails; the worst case is empty.
pub fn load_hash_file(
    storage: StorageService,
    config: &SyncConfig,
    fetcher: Option<Arc<dyn HashFileFetcher>>,
) -> (HashFileManager, HashFileSource) {
    let mut manager = HashFileManager::with_storage(storage.clone());
    if let Some(fetcher) = fetcher {
        manager = manager.with_fetcher(fetcher);
    }

    if config.external_source().is_some() {
        if manager.load_external_hash_file(config) {
            if !manager.detect_corruption() {
                tracing::info!(entries = manager.len(), "Using external hash file");
                return (manager, HashFileSource::External);
            }
            tracing::warn!("External hash file is corrupted, falling back to canonical");
            manager = manager.fresh();
        } else {
            tracing::warn!("External hash file could not be loaded, falling back to canonical");
        }
    }

    if manager.load_from_s3(None, None) {
        if !manager.detect_corruption() {
            return (manager, HashFileSource::Canonical);
        }
        tracing::error!("Hash file corruption detected");
    } else if storage.object_exists(HASH_FILE_KEY) {
        tracing::error!(key = HASH_FILE_KEY, "Hash file exists but could not be parsed");
    } else {
        tracing::info!("No existing hash file, starting fresh");
        return (manager.fresh(), HashFileSource::Empty);
    }

    recover(manager, &storage)
}

fn recover(mut manager: HashFileManager, storage: &StorageService) -> (HashFileManager, HashFileSource) {
    if !manager.backup_current_hash_file() {
        tracing::warn!("Continuing rebuild without a backup");
    }

    let rebuilt = manager.rebuild_from_s3_metadata();
    if let Some(metrics) = storage.metrics() {
        metrics.put_recovery_metric("hash_file_rebuild", rebuilt);
    }

    if rebuilt {
        tracing::info!(entries = manager.len(), "Rebuilt hash file from object metadata");
        return (manager, HashFileSource::Rebuilt);
    }

    tracing::error!("Hash file rebuild failed, starting with an empty ledger");
    if let Some(metrics) = storage.metrics() {
        metrics.put_recovery_metric("fallback", true);
    }
    (manager.fresh(), HashFileSource::Empty)
}
