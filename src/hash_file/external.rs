/// External hash files
///
/// Hash files produced by other systems are validated strictly, repaired on a
/// best-effort basis when validation fails, and then either replace or merge
/// into the local ledger. External entries win on conflict.
use super::HashFileManager;
use crate::config::{ExternalSource, SyncConfig};
use crate::models::{
    is_bottle_key, is_sha256, parse_date, parse_timestamp, split_bottle_key, utc_timestamp,
    utc_today, HashEntry, HashRecord, UNKNOWN_SHA256,
};
use crate::SyncResult;
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Timeout for fetching a hash file over HTTP
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

const REQUIRED_FIELDS: [&str; 3] = ["sha256", "download_date", "file_size"];

/// Source of JSON documents addressed by URL
#[cfg_attr(test, mockall::automock)]
pub trait HashFileFetcher: Send + Sync {
    fn fetch_json(&self, url: &str) -> SyncResult<Value>;
}

/// Blocking HTTP fetcher
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestFetcher {
    pub fn new() -> SyncResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("bottle-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl HashFileFetcher for ReqwestFetcher {
    fn fetch_json(&self, url: &str) -> SyncResult<Value> {
        let response = self.client.get(url).send()?.error_for_status()?;
        Ok(response.json()?)
    }
}

/// Strictly validate an external document, collecting every violation
pub fn validate_external_hash_file(data: &Value) -> (bool, Vec<String>) {
    let mut errors = Vec::new();

    let Some(document) = data.as_object() else {
        errors.push("Hash file must be a JSON object".to_string());
        return (false, errors);
    };

    if !document.contains_key("bottles") {
        errors.push("Missing 'bottles' field".to_string());
    }
    if !document.contains_key("last_updated") {
        errors.push("Missing 'last_updated' field".to_string());
    }

    match document.get("last_updated") {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) if s.is_empty() => {}
        Some(Value::String(s)) => {
            if parse_timestamp(s).is_none() {
                errors.push(format!("Invalid last_updated timestamp format: {}", s));
            }
        }
        Some(other) => errors.push(format!("Invalid last_updated timestamp format: {}", other)),
    }

    match document.get("bottles") {
        None => {}
        Some(Value::Object(bottles)) => {
            for (key, entry) in bottles {
                validate_entry(key, entry, &mut errors);
            }
        }
        Some(_) => errors.push("'bottles' field must be an object".to_string()),
    }

    (errors.is_empty(), errors)
}

fn validate_entry(key: &str, entry: &Value, errors: &mut Vec<String>) {
    let Some(fields) = entry.as_object() else {
        errors.push(format!("Bottle entry '{}' must be an object", key));
        return;
    };

    for field in REQUIRED_FIELDS {
        if !fields.contains_key(field) {
            errors.push(format!("Bottle '{}' missing required field: {}", key, field));
        }
    }

    if let Some(sha) = fields.get("sha256").and_then(Value::as_str) {
        if !sha.is_empty() && !is_sha256(sha) {
            errors.push(format!("Bottle '{}' has invalid SHA256 format: {}", key, sha));
        }
    }

    if let Some(date) = fields.get("download_date").and_then(Value::as_str) {
        if !date.is_empty() && parse_date(date).is_none() {
            errors.push(format!("Bottle '{}' has invalid date format: {}", key, date));
        }
    }

    match fields.get("file_size") {
        None | Some(Value::Null) => {}
        Some(size) => {
            if !size.as_u64().map(|n| n > 0).unwrap_or(false) {
                errors.push(format!("Bottle '{}' has invalid file size: {}", key, size));
            }
        }
    }

    if !is_bottle_key(key) {
        errors.push(format!("Invalid bottle key format: {}", key));
    }
}

/// Rewrite a malformed key as `formula-version-platform`.
///
/// The last hyphen segment is taken as the platform and the one before it as
/// the version. Keys with fewer than three segments are returned unchanged.
pub fn normalize_bottle_key(key: &str) -> String {
    if is_bottle_key(key) {
        return key.to_string();
    }

    let parts: Vec<&str> = key.split('-').filter(|p| !p.is_empty()).collect();
    if parts.len() < 3 {
        return key.to_string();
    }

    let platform = parts[parts.len() - 1];
    let version = parts[parts.len() - 2];
    let formula = parts[..parts.len() - 2].join("-");
    format!("{}-{}-{}", formula, version, platform)
}

/// Best-effort repair of a document that failed strict validation
pub fn migrate_external_hash_file(data: &Value) -> Value {
    let empty = Map::new();
    let document = data.as_object().unwrap_or(&empty);

    let last_updated = match document.get("last_updated").and_then(Value::as_str) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => utc_timestamp(),
    };

    let mut bottles = Map::new();
    if let Some(Value::Object(entries)) = document.get("bottles") {
        let today = utc_today();
        for (key, entry) in entries {
            let Some(fields) = entry.as_object() else {
                tracing::warn!(key = %key, "Skipping non-object bottle entry during migration");
                continue;
            };

            let mut fields = fields.clone();
            fields
                .entry("sha256")
                .or_insert_with(|| json!(UNKNOWN_SHA256));
            fields
                .entry("download_date")
                .or_insert_with(|| json!(today));
            fields.entry("file_size").or_insert_with(|| json!(0));

            let normalized = normalize_bottle_key(key);
            if normalized != *key {
                tracing::debug!(from = %key, to = %normalized, "Normalized bottle key");
            }
            bottles.insert(normalized, Value::Object(fields));
        }
    }

    json!({
        "last_updated": last_updated,
        "bottles": bottles,
    })
}

impl HashFileManager {
    /// Merge an external document into the ledger; returns the number of
    /// entries taken from it
    pub fn merge_with_external_hash_file(&mut self, data: &Value) -> usize {
        let (valid, errors) = validate_external_hash_file(data);
        let migrated;
        let data = if valid {
            data
        } else {
            tracing::warn!(
                error_count = errors.len(),
                errors = ?errors,
                "External hash file failed validation, attempting migration"
            );
            migrated = migrate_external_hash_file(data);
            &migrated
        };

        let Some(entries) = data.get("bottles").and_then(Value::as_object) else {
            return 0;
        };

        let mut merged = 0usize;
        for (key, raw) in entries {
            match external_entry(key, raw) {
                Ok(entry) => {
                    self.bottles.insert(entry.key(), entry);
                    merged += 1;
                }
                Err(reason) => {
                    tracing::warn!(key = %key, reason = %reason, "Skipping external bottle entry");
                }
            }
        }

        if merged > 0 {
            self.touch();
        }
        tracing::info!(merged, total = self.bottles.len(), "Merged external hash file");
        merged
    }

    /// Replace the ledger with a document fetched from `url`
    pub fn load_from_url(&mut self, url: &str) -> bool {
        let fetched = match &self.fetcher {
            Some(fetcher) => fetcher.fetch_json(url),
            None => ReqwestFetcher::new().and_then(|fetcher| fetcher.fetch_json(url)),
        };

        let document = match fetched {
            Ok(document) => document,
            Err(e) => {
                tracing::error!(url, error = %e, "Failed to fetch hash file");
                return false;
            }
        };

        match self.load_from_dict(&document) {
            Ok(()) => {
                tracing::info!(url, entries = self.bottles.len(), "Loaded hash file from URL");
                true
            }
            Err(e) => {
                tracing::error!(url, error = %e, "Hash file from URL rejected");
                false
            }
        }
    }

    /// Load whichever external source `config` names
    pub fn load_external_hash_file(&mut self, config: &SyncConfig) -> bool {
        match config.external_source() {
            Some(ExternalSource::Url(url)) => self.load_from_url(&url),
            Some(ExternalSource::S3 { key, bucket }) => self.load_external_from_s3(&key, bucket.as_deref()),
            None => {
                tracing::debug!("No external hash file configured");
                false
            }
        }
    }
}

fn external_entry(key: &str, raw: &Value) -> Result<HashEntry, String> {
    let (formula, version, platform) =
        split_bottle_key(key).ok_or_else(|| "key does not split into formula-version-platform".to_string())?;
    let record: HashRecord = serde_json::from_value(raw.clone()).map_err(|e| e.to_string())?;
    let entry = HashEntry::from_record(formula, version, platform, record);
    entry.validate().map_err(|e| e.to_string())?;
    Ok(entry)
}
