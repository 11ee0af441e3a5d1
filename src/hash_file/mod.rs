// Hash file: the ledger of bottles already synced to object storage
//
// Organized structure:
// - mod.rs: in-memory ledger, document conversion, corruption checks
// - persistence.rs: atomic save, backup, load and rebuild against storage
// - external.rs: importing hash files produced elsewhere (URL or other bucket)
// - loader.rs: the load ladder used at the start of a sync

pub mod external;
pub mod loader;
pub mod persistence;

pub use external::{
    migrate_external_hash_file, normalize_bottle_key, validate_external_hash_file,
    HashFileFetcher, ReqwestFetcher,
};
pub use loader::{load_hash_file, HashFileSource};
pub use persistence::{backup_key, parse_bottle_object_key, BACKUP_PREFIX};

use crate::models::{
    parse_date, parse_timestamp, split_bottle_key, utc_timestamp, BottleInfo, Formula, HashEntry,
    HashRecord,
};
use crate::storage::StorageService;
use crate::{SyncError, SyncResult};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Canonical object key of the hash file
pub const HASH_FILE_KEY: &str = "bottles_hash.json";

/// Temporary key written during an atomic save
pub const TEMP_HASH_FILE_KEY: &str = "bottles_hash.json.tmp";

/// Largest plausible bottle (10 GiB)
pub const MAX_BOTTLE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Entries older than this many days are reported but accepted
pub const STALE_ENTRY_DAYS: i64 = 730;

/// In-memory hash file.
///
/// Not synchronized: callers serialize `add_bottle`/`has_bottle` and only
/// share the manager once a save is done.
#[derive(Clone, Default)]
pub struct HashFileManager {
    /// Entries keyed by `formula-version-platform`
    pub bottles: BTreeMap<String, HashEntry>,

    /// ISO-8601 time of the last change
    pub last_updated: Option<String>,

    storage: Option<StorageService>,
    fetcher: Option<Arc<dyn HashFileFetcher>>,
}

impl std::fmt::Debug for HashFileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashFileManager")
            .field("bottles", &self.bottles.len())
            .field("last_updated", &self.last_updated)
            .field("storage", &self.storage.as_ref().map(|s| s.bucket().to_string()))
            .finish()
    }
}

/// Summary of a ledger's contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HashFileStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub per_platform: BTreeMap<String, usize>,

    /// Entries carrying the unknown placeholder hash
    pub unknown_hashes: usize,

    pub last_updated: Option<String>,
}

impl HashFileManager {
    /// Manager without storage, for in-memory use
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager backed by `storage`
    pub fn with_storage(storage: StorageService) -> Self {
        Self {
            storage: Some(storage),
            ..Self::default()
        }
    }

    /// Use `fetcher` for URL loads instead of the default HTTP client
    pub fn with_fetcher(mut self, fetcher: Arc<dyn HashFileFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn storage(&self) -> Option<&StorageService> {
        self.storage.as_ref()
    }

    /// Empty manager sharing this one's storage and fetcher
    pub fn fresh(&self) -> Self {
        Self {
            bottles: BTreeMap::new(),
            last_updated: None,
            storage: self.storage.clone(),
            fetcher: self.fetcher.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.bottles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bottles.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&HashEntry> {
        self.bottles.get(key)
    }

    /// Record a verified bottle, replacing any entry under the same key
    pub fn add_bottle(
        &mut self,
        formula: &Formula,
        platform: &str,
        bottle: &BottleInfo,
        download_date: &str,
    ) -> SyncResult<()> {
        let entry = HashEntry {
            formula_name: formula.name.clone(),
            version: formula.version.clone(),
            platform: platform.to_string(),
            sha256: bottle.sha256.clone(),
            download_date: download_date.to_string(),
            file_size: bottle.size,
        };
        entry.validate()?;
        self.bottles.insert(entry.key(), entry);
        Ok(())
    }

    /// True only when the key is present with the same sha256
    pub fn has_bottle(&self, formula: &Formula, platform: &str, bottle: &BottleInfo) -> bool {
        let key = crate::models::bottle_key(&formula.name, &formula.version, platform);
        self.bottles
            .get(&key)
            .map(|entry| entry.sha256 == bottle.sha256)
            .unwrap_or(false)
    }

    /// Validate every entry
    pub fn validate(&self) -> SyncResult<()> {
        for (key, entry) in &self.bottles {
            entry
                .validate()
                .map_err(|e| SyncError::Validation(format!("{}: {}", key, e)))?;
        }
        Ok(())
    }

    /// Serialize to the persisted document shape
    pub fn to_dict(&self) -> Value {
        let bottles: Map<String, Value> = self
            .bottles
            .iter()
            .map(|(key, entry)| {
                let record = entry.to_record();
                (
                    key.clone(),
                    serde_json::json!({
                        "sha256": record.sha256,
                        "download_date": record.download_date,
                        "file_size": record.file_size,
                    }),
                )
            })
            .collect();

        serde_json::json!({
            "last_updated": self.last_updated.clone().unwrap_or_else(utc_timestamp),
            "bottles": bottles,
        })
    }

    /// Replace the contents with a parsed document.
    ///
    /// Keys that do not split into formula, version and platform are skipped.
    /// Any other invalid entry fails the whole load and leaves the manager
    /// unchanged.
    pub fn load_from_dict(&mut self, data: &Value) -> SyncResult<()> {
        let document = data
            .as_object()
            .ok_or_else(|| SyncError::Validation("hash file must be a JSON object".into()))?;

        let last_updated = document
            .get("last_updated")
            .and_then(Value::as_str)
            .map(str::to_string);

        let empty = Map::new();
        let records = match document.get("bottles") {
            None | Some(Value::Null) => &empty,
            Some(Value::Object(records)) => records,
            Some(_) => {
                return Err(SyncError::Validation(
                    "'bottles' field must be an object".into(),
                ))
            }
        };

        let mut bottles = BTreeMap::new();
        for (key, raw) in records {
            let Some(entry) = parse_entry(key, raw)? else {
                tracing::debug!(key, "Skipping unparseable bottle key");
                continue;
            };
            bottles.insert(key.clone(), entry);
        }

        self.bottles = bottles;
        self.last_updated = last_updated;
        Ok(())
    }

    /// Check structural consistency; true means corrupted
    pub fn detect_corruption(&self) -> bool {
        self.detect_corruption_on(Utc::now().date_naive())
    }

    /// [`Self::detect_corruption`] against an explicit "today"
    pub fn detect_corruption_on(&self, today: NaiveDate) -> bool {
        if let Err(e) = self.validate() {
            tracing::warn!(error = %e, "Hash file validation failed");
            return true;
        }

        let Some(last_updated) = self.last_updated.as_deref() else {
            tracing::warn!("Hash file missing last_updated timestamp");
            return true;
        };
        if parse_timestamp(last_updated).is_none() {
            tracing::warn!(last_updated, "Hash file has invalid timestamp format");
            return true;
        }

        let mut derived_keys = HashSet::with_capacity(self.bottles.len());
        for (key, entry) in &self.bottles {
            let expected = entry.key();
            if *key != expected {
                tracing::warn!(key = %key, expected = %expected, "Hash file key mismatch");
                return true;
            }
            if !derived_keys.insert(expected) {
                tracing::warn!(key = %key, "Hash file contains duplicate bottle keys");
                return true;
            }

            if entry.file_size == 0 || entry.file_size > MAX_BOTTLE_SIZE {
                tracing::warn!(key = %key, file_size = entry.file_size, "Unreasonable file size");
                return true;
            }

            let Some(date) = parse_date(&entry.download_date) else {
                tracing::warn!(key = %key, date = %entry.download_date, "Invalid date format");
                return true;
            };
            if date > today {
                tracing::warn!(key = %key, date = %entry.download_date, "Future download date");
                return true;
            }

            let days_old = (today - date).num_days();
            if days_old > STALE_ENTRY_DAYS {
                tracing::warn!(
                    key = %key,
                    date = %entry.download_date,
                    days_old,
                    "Hash file contains very old date"
                );
            }
        }

        false
    }

    pub fn stats(&self) -> HashFileStats {
        let mut stats = HashFileStats {
            entries: self.bottles.len(),
            last_updated: self.last_updated.clone(),
            ..HashFileStats::default()
        };
        for entry in self.bottles.values() {
            stats.total_bytes = stats.total_bytes.saturating_add(entry.file_size);
            *stats.per_platform.entry(entry.platform.clone()).or_insert(0) += 1;
            if entry.has_unknown_hash() {
                stats.unknown_hashes += 1;
            }
        }
        stats
    }

    fn touch(&mut self) {
        self.last_updated = Some(utc_timestamp());
    }
}

/// Parse one `key -> record` pair; `Ok(None)` when the key cannot be split
fn parse_entry(key: &str, raw: &Value) -> SyncResult<Option<HashEntry>> {
    let Some((formula_name, version, platform)) = split_bottle_key(key) else {
        return Ok(None);
    };

    let record: HashRecord = serde_json::from_value(raw.clone())
        .map_err(|e| SyncError::Validation(format!("bottle {}: {}", key, e)))?;
    let entry = HashEntry::from_record(formula_name, version, platform, record);
    entry
        .validate()
        .map_err(|e| SyncError::Validation(format!("bottle {}: {}", key, e)))?;
    Ok(Some(entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UNKNOWN_SHA256;
    use serde_json::json;

    const SHA_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const SHA_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn formula() -> Formula {
        Formula::new("wget", "1.24.5")
    }

    fn bottle(sha: &str) -> BottleInfo {
        BottleInfo::new("https://ghcr.io/v2/homebrew/core/wget/blobs/x", sha, 4096)
    }

    fn populated() -> HashFileManager {
        let mut manager = HashFileManager::new();
        manager
            .add_bottle(&formula(), "arm64_sonoma", &bottle(SHA_A), "2024-06-01")
            .unwrap();
        manager
            .add_bottle(&Formula::new("python-tk", "3.12.4"), "monterey", &bottle(SHA_B), "2024-06-02")
            .unwrap();
        manager.last_updated = Some("2024-06-02T10:00:00Z".into());
        manager
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, 1).unwrap()
    }

    #[test]
    fn test_add_bottle_is_idempotent() {
        let mut manager = HashFileManager::new();
        for _ in 0..2 {
            manager
                .add_bottle(&formula(), "arm64_sonoma", &bottle(SHA_A), "2024-06-01")
                .unwrap();
        }
        assert_eq!(manager.len(), 1);
        assert!(manager.has_bottle(&formula(), "arm64_sonoma", &bottle(SHA_A)));
    }

    #[test]
    fn test_has_bottle_requires_matching_hash() {
        let manager = populated();
        assert!(manager.has_bottle(&formula(), "arm64_sonoma", &bottle(SHA_A)));
        assert!(!manager.has_bottle(&formula(), "arm64_sonoma", &bottle(SHA_B)));
        assert!(!manager.has_bottle(&formula(), "monterey", &bottle(SHA_A)));
        assert!(!manager.has_bottle(&Formula::new("wget", "1.25"), "arm64_sonoma", &bottle(SHA_A)));
    }

    #[test]
    fn test_add_bottle_rejects_invalid() {
        let mut manager = HashFileManager::new();
        assert!(manager
            .add_bottle(&formula(), "arm64_sonoma", &bottle("short"), "2024-06-01")
            .is_err());
        assert!(manager
            .add_bottle(&formula(), "arm64_sonoma", &bottle(SHA_A), "June 1st")
            .is_err());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_dict_round_trip() {
        let manager = populated();
        let document = manager.to_dict();
        assert_eq!(document["bottles"]["wget-1.24.5-arm64_sonoma"]["file_size"], 4096);

        let mut loaded = HashFileManager::new();
        loaded.load_from_dict(&document).unwrap();
        assert_eq!(loaded.bottles, manager.bottles);
        assert_eq!(loaded.last_updated, manager.last_updated);
    }

    #[test]
    fn test_load_skips_unsplittable_keys() {
        let mut manager = HashFileManager::new();
        manager
            .load_from_dict(&json!({
                "last_updated": "2024-06-01T00:00:00Z",
                "bottles": {
                    "nohyphens": {"sha256": SHA_A, "download_date": "2024-06-01", "file_size": 1},
                    "wget-1.0-monterey": {"sha256": SHA_A, "download_date": "2024-06-01", "file_size": 1}
                }
            }))
            .unwrap();
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_failed_load_leaves_manager_unchanged() {
        let mut manager = populated();
        let result = manager.load_from_dict(&json!({
            "last_updated": "2024-06-03T00:00:00Z",
            "bottles": {
                "wget-1.0-monterey": {"sha256": "nothex", "download_date": "2024-06-01", "file_size": 1}
            }
        }));

        assert!(result.is_err());
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.last_updated.as_deref(), Some("2024-06-02T10:00:00Z"));
    }

    #[test]
    fn test_clean_ledger_is_not_corrupted() {
        assert!(!populated().detect_corruption_on(today()));
        assert!(!HashFileManager {
            last_updated: Some("2024-06-02T10:00:00Z".into()),
            ..HashFileManager::new()
        }
        .detect_corruption_on(today()));
    }

    #[test]
    fn test_key_mismatch_is_corruption() {
        let mut manager = populated();
        let entry = manager.bottles["wget-1.24.5-arm64_sonoma"].clone();
        manager.bottles.insert("wget-9.9-arm64_sonoma".into(), entry);
        assert!(manager.detect_corruption_on(today()));
    }

    #[test]
    fn test_timestamp_problems_are_corruption() {
        let mut manager = populated();
        manager.last_updated = None;
        assert!(manager.detect_corruption_on(today()));

        manager.last_updated = Some("not a time".into());
        assert!(manager.detect_corruption_on(today()));
    }

    #[test]
    fn test_size_and_date_rules() {
        let mut huge = populated();
        huge.bottles.get_mut("wget-1.24.5-arm64_sonoma").unwrap().file_size = MAX_BOTTLE_SIZE + 1;
        assert!(huge.detect_corruption_on(today()));

        let mut future = populated();
        future.bottles.get_mut("wget-1.24.5-arm64_sonoma").unwrap().download_date =
            "2024-07-02".into();
        assert!(future.detect_corruption_on(today()));

        let mut old = populated();
        old.bottles.get_mut("wget-1.24.5-arm64_sonoma").unwrap().download_date =
            "2019-01-01".into();
        assert!(!old.detect_corruption_on(today()));
    }

    #[test]
    fn test_stats() {
        let mut manager = populated();
        manager.bottles.get_mut("wget-1.24.5-arm64_sonoma").unwrap().sha256 =
            UNKNOWN_SHA256.into();

        let stats = manager.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.total_bytes, 8192);
        assert_eq!(stats.unknown_hashes, 1);
        assert_eq!(stats.per_platform.get("monterey"), Some(&1));
    }
}
