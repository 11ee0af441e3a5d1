/// Hash file persistence against object storage
///
/// Saves go through a temporary key: write, read back and compare, copy to
/// the canonical key, delete the temporary. Readers of the canonical key only
/// ever see a complete document.
use super::{HashFileManager, HASH_FILE_KEY, TEMP_HASH_FILE_KEY};
use crate::models::{parse_date, HashEntry, UNKNOWN_SHA256};
use crate::storage::{ObjectSummary, StorageService};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;

/// Key prefix for timestamped backups
pub const BACKUP_PREFIX: &str = "backups/bottles_hash_";

/// Object suffix of a bottle archive
pub const BOTTLE_SUFFIX: &str = ".bottle.tar.gz";

/// Listing cap for a rebuild
pub const REBUILD_MAX_KEYS: usize = 10_000;

/// Backup key for the current second, `backups/bottles_hash_YYYYMMDD_HHMMSS.json`
pub fn backup_key() -> String {
    format!("{}{}.json", BACKUP_PREFIX, Utc::now().format("%Y%m%d_%H%M%S"))
}

/// Parse `<YYYY-MM-DD>/.../<formula>-<version>.<platform>.bottle.tar.gz`.
///
/// Returns (formula, version, platform, date folder).
pub fn parse_bottle_object_key(key: &str) -> Option<(&str, &str, &str, &str)> {
    if !key.ends_with(BOTTLE_SUFFIX) {
        return None;
    }

    let parts: Vec<&str> = key.split('/').collect();
    if parts.len() < 2 {
        return None;
    }
    let date_folder = parts[0];
    parse_date(date_folder)?;

    let filename = parts[parts.len() - 1];
    let base = filename.strip_suffix(BOTTLE_SUFFIX)?;
    let (formula_version, platform) = base.rsplit_once('.')?;
    let (formula, version) = formula_version.rsplit_once('-')?;

    if formula.is_empty() || version.is_empty() || platform.is_empty() {
        return None;
    }
    Some((formula, version, platform, date_folder))
}

impl HashFileManager {
    fn require_storage(&self, operation: &str) -> Option<&StorageService> {
        if self.storage.is_none() {
            tracing::error!(operation, "Hash file manager has no storage configured");
        }
        self.storage.as_ref()
    }

    /// Persist the ledger through the temporary key
    pub fn save_to_s3_atomic(&mut self) -> bool {
        let Some(storage) = self.storage.clone() else {
            tracing::error!(operation = "save_to_s3_atomic", "Hash file manager has no storage configured");
            return false;
        };

        self.touch();
        let document = self.to_dict();
        let metadata = HashMap::from([
            ("entries".to_string(), self.bottles.len().to_string()),
            (
                "last_updated".to_string(),
                self.last_updated.clone().unwrap_or_default(),
            ),
        ]);

        if !storage.upload_json(&document, TEMP_HASH_FILE_KEY, metadata) {
            tracing::error!(key = TEMP_HASH_FILE_KEY, "Failed to write temporary hash file");
            cleanup_temp(&storage);
            return false;
        }

        let verified = match storage.download_json::<Value>(TEMP_HASH_FILE_KEY) {
            Some(read_back) => {
                let matches = read_back.get("last_updated") == document.get("last_updated")
                    && read_back == document;
                if !matches {
                    tracing::error!(
                        key = TEMP_HASH_FILE_KEY,
                        expected = ?document.get("last_updated"),
                        found = ?read_back.get("last_updated"),
                        "Temporary hash file verification failed"
                    );
                }
                matches
            }
            None => {
                tracing::error!(key = TEMP_HASH_FILE_KEY, "Could not read back temporary hash file");
                false
            }
        };
        if !verified {
            cleanup_temp(&storage);
            return false;
        }

        if !storage.copy_object(TEMP_HASH_FILE_KEY, HASH_FILE_KEY) {
            tracing::error!("Failed to promote temporary hash file");
            cleanup_temp(&storage);
            return false;
        }

        if !storage.delete_object(TEMP_HASH_FILE_KEY) {
            tracing::warn!(key = TEMP_HASH_FILE_KEY, "Saved hash file but could not remove temporary copy");
        }

        tracing::info!(
            bucket = %storage.bucket(),
            entries = self.bottles.len(),
            "Saved hash file atomically"
        );
        true
    }

    /// Copy the canonical hash file to a timestamped backup key.
    ///
    /// Nothing to back up counts as success.
    pub fn backup_current_hash_file(&self) -> bool {
        let Some(storage) = self.require_storage("backup_current_hash_file") else {
            return false;
        };

        if !storage.object_exists(HASH_FILE_KEY) {
            tracing::info!("No existing hash file to back up");
            return true;
        }

        let key = backup_key();
        if storage.copy_object(HASH_FILE_KEY, &key) {
            tracing::info!(backup_key = %key, "Backed up hash file");
            true
        } else {
            tracing::error!(backup_key = %key, "Failed to back up hash file");
            false
        }
    }

    /// Load the ledger, trying an external key first when given.
    ///
    /// `external_bucket` only applies to `external_key`. Any failure on the
    /// external path falls back to the canonical key in the sync bucket.
    pub fn load_from_s3(&mut self, external_key: Option<&str>, external_bucket: Option<&str>) -> bool {
        let Some(storage) = self.require_storage("load_from_s3").cloned() else {
            return false;
        };

        if let Some(key) = external_key.filter(|k| !k.is_empty()) {
            if self.load_external_from_s3(key, external_bucket) {
                return true;
            }
            tracing::warn!(key, "External hash file unavailable, falling back to canonical");
        }

        if self.load_document(&storage, HASH_FILE_KEY) {
            tracing::info!(entries = self.bottles.len(), "Loaded hash file");
            return true;
        }

        tracing::info!(key = HASH_FILE_KEY, "No usable hash file in storage");
        false
    }

    /// Load `key` from `bucket` (or the sync bucket) with no canonical fallback
    pub fn load_external_from_s3(&mut self, key: &str, bucket: Option<&str>) -> bool {
        let Some(storage) = self.require_storage("load_external_from_s3").cloned() else {
            return false;
        };

        let source = match bucket.filter(|b| !b.is_empty()) {
            Some(bucket) => storage.for_bucket(bucket),
            None => Some(storage),
        };
        let Some(source) = source else {
            return false;
        };

        if !self.load_document(&source, key) {
            return false;
        }
        tracing::info!(
            bucket = %source.bucket(),
            key,
            entries = self.bottles.len(),
            "Loaded external hash file"
        );
        true
    }

    fn load_document(&mut self, storage: &StorageService, key: &str) -> bool {
        let Some(document) = storage.download_json::<Value>(key) else {
            return false;
        };
        match self.load_from_dict(&document) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(bucket = %storage.bucket(), key, error = %e, "Hash file rejected");
                false
            }
        }
    }

    /// Discard the ledger and reconstruct it from the bottle objects in storage.
    ///
    /// Content hashes cannot be recovered from listings, so every entry gets
    /// the [`UNKNOWN_SHA256`] placeholder and will be re-downloaded.
    pub fn rebuild_from_s3_metadata(&mut self) -> bool {
        let Some(storage) = self.require_storage("rebuild_from_s3_metadata").cloned() else {
            return false;
        };

        tracing::warn!(bucket = %storage.bucket(), "Rebuilding hash file from object metadata");
        self.bottles.clear();
        self.last_updated = None;

        let Some(objects) = storage.list_objects_checked("", REBUILD_MAX_KEYS) else {
            tracing::error!("Rebuild aborted: object listing failed");
            return false;
        };
        if objects.len() == REBUILD_MAX_KEYS {
            tracing::warn!(max_keys = REBUILD_MAX_KEYS, "Listing hit the key limit; rebuild may be partial");
        }

        let mut skipped = 0usize;
        for object in &objects {
            match rebuilt_entry(&storage, object) {
                Some(entry) => {
                    self.bottles.insert(entry.key(), entry);
                }
                None => skipped += 1,
            }
        }

        self.touch();
        tracing::info!(
            entries = self.bottles.len(),
            skipped,
            "Rebuilt hash file from object metadata"
        );
        true
    }
}

fn rebuilt_entry(storage: &StorageService, object: &ObjectSummary) -> Option<HashEntry> {
    let (formula, version, platform, date) = parse_bottle_object_key(&object.key)?;

    let Some(metadata) = storage.get_object_metadata(&object.key) else {
        tracing::warn!(key = %object.key, "No metadata for bottle object");
        return None;
    };
    if metadata.size == 0 {
        tracing::warn!(key = %object.key, "Skipping empty bottle object");
        return None;
    }

    let entry = HashEntry {
        formula_name: formula.to_string(),
        version: version.to_string(),
        platform: platform.to_string(),
        sha256: UNKNOWN_SHA256.to_string(),
        download_date: date.to_string(),
        file_size: metadata.size,
    };
    match entry.validate() {
        Ok(()) => Some(entry),
        Err(e) => {
            tracing::warn!(key = %object.key, error = %e, "Skipping unparseable bottle object");
            None
        }
    }
}

fn cleanup_temp(storage: &StorageService) {
    if storage.object_exists(TEMP_HASH_FILE_KEY) && !storage.delete_object(TEMP_HASH_FILE_KEY) {
        tracing::warn!(key = TEMP_HASH_FILE_KEY, "Could not clean up temporary hash file");
    }
}
