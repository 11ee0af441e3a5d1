/// Core data models for the bottle sync ledger
///
/// Formulas and bottles describe what the upstream API offers; hash entries
/// describe what has already been synced to object storage.
use crate::{SyncError, SyncResult};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Placeholder hash for entries whose content hash could not be recovered
pub const UNKNOWN_SHA256: &str = "unknown";

/// Date format used for download dates and date folders
pub const DATE_FORMAT: &str = "%Y-%m-%d";

lazy_static::lazy_static! {
    static ref SHA256_RE: Regex = Regex::new(r"^[a-fA-F0-9]{64}$").expect("valid sha256 regex");
    static ref DATE_RE: Regex = Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("valid date regex");
    static ref FORMULA_NAME_RE: Regex =
        Regex::new(r"^[a-zA-Z0-9_-]+$").expect("valid formula name regex");
    static ref BOTTLE_KEY_RE: Regex =
        Regex::new(r"^[a-zA-Z0-9_-]+-[a-zA-Z0-9._-]+-[a-zA-Z0-9_]+$").expect("valid bottle key regex");
}

/// Current UTC time as ISO-8601 with a trailing `Z`
pub fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Today's UTC date as `YYYY-MM-DD`
pub fn utc_today() -> String {
    Utc::now().format(DATE_FORMAT).to_string()
}

/// Parse an ISO-8601 timestamp; a missing offset is taken as UTC
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Check a string is a 64 character hex digest
pub fn is_sha256(value: &str) -> bool {
    SHA256_RE.is_match(value)
}

/// Parse a strict `YYYY-MM-DD` date
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    if !DATE_RE.is_match(value) {
        return None;
    }
    NaiveDate::parse_from_str(value, DATE_FORMAT).ok()
}

/// Check a bottle key has the `formula-version-platform` shape
pub fn is_bottle_key(value: &str) -> bool {
    BOTTLE_KEY_RE.is_match(value)
}

/// Compose the ledger key for a bottle
pub fn bottle_key(formula_name: &str, version: &str, platform: &str) -> String {
    format!("{}-{}-{}", formula_name, version, platform)
}

/// Split a ledger key into (formula, version, platform).
///
/// The platform is the last hyphen segment and the version the one before it;
/// everything earlier belongs to the formula name.
pub fn split_bottle_key(key: &str) -> Option<(&str, &str, &str)> {
    let (formula_version, platform) = key.rsplit_once('-')?;
    let (formula_name, version) = formula_version.rsplit_once('-')?;
    Some((formula_name, version, platform))
}

/// A precompiled binary for one formula on one platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BottleInfo {
    pub url: String,
    pub sha256: String,
    pub size: u64,
}

impl BottleInfo {
    pub fn new(url: impl Into<String>, sha256: impl Into<String>, size: u64) -> Self {
        Self {
            url: url.into(),
            sha256: sha256.into(),
            size,
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.url.is_empty() {
            return Err(SyncError::Validation("Bottle URL cannot be empty".into()));
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(SyncError::Validation(
                "Bottle URL must be a valid HTTP/HTTPS URL".into(),
            ));
        }
        if self.sha256.is_empty() {
            return Err(SyncError::Validation("SHA256 hash cannot be empty".into()));
        }
        if !is_sha256(&self.sha256) {
            return Err(SyncError::Validation(
                "SHA256 hash must be 64 hexadecimal characters".into(),
            ));
        }
        if self.size == 0 {
            return Err(SyncError::Validation("Bottle size must be positive".into()));
        }
        Ok(())
    }
}

/// A Homebrew formula and the bottles published for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formula {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub bottles: BTreeMap<String, BottleInfo>,
}

impl Formula {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            bottles: BTreeMap::new(),
        }
    }

    /// Attach a bottle for a platform
    pub fn with_bottle(mut self, platform: impl Into<String>, bottle: BottleInfo) -> Self {
        self.bottles.insert(platform.into(), bottle);
        self
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.name.is_empty() {
            return Err(SyncError::Validation("Formula name cannot be empty".into()));
        }
        if !FORMULA_NAME_RE.is_match(&self.name) {
            return Err(SyncError::Validation(
                "Formula name must contain only alphanumeric characters, hyphens, and underscores"
                    .into(),
            ));
        }
        if self.version.is_empty() {
            return Err(SyncError::Validation("Formula version cannot be empty".into()));
        }
        for (platform, bottle) in &self.bottles {
            if platform.is_empty() {
                return Err(SyncError::Validation("Platform name cannot be empty".into()));
            }
            bottle.validate()?;
        }
        Ok(())
    }

    /// Bottles for the requested platforms only
    pub fn target_bottles(&self, platforms: &[String]) -> BTreeMap<String, BottleInfo> {
        self.bottles
            .iter()
            .filter(|(platform, _)| platforms.contains(platform))
            .map(|(platform, bottle)| (platform.clone(), bottle.clone()))
            .collect()
    }
}

/// One synced bottle in the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashEntry {
    pub formula_name: String,
    pub version: String,
    pub platform: String,
    pub sha256: String,
    pub download_date: String,
    pub file_size: u64,
}

/// On-disk shape of a ledger entry; the identity lives in the map key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRecord {
    pub sha256: String,
    pub download_date: String,
    pub file_size: u64,
}

impl HashEntry {
    /// Ledger key derived from the entry's own fields
    pub fn key(&self) -> String {
        bottle_key(&self.formula_name, &self.version, &self.platform)
    }

    /// Whether the content hash is the rebuild placeholder
    pub fn has_unknown_hash(&self) -> bool {
        self.sha256 == UNKNOWN_SHA256
    }

    /// Validate every field.
    ///
    /// The [`UNKNOWN_SHA256`] placeholder is accepted so ledgers rebuilt from
    /// listings survive a save/load cycle.
    pub fn validate(&self) -> SyncResult<()> {
        if self.formula_name.is_empty() {
            return Err(SyncError::Validation("Formula name cannot be empty".into()));
        }
        if self.version.is_empty() {
            return Err(SyncError::Validation("Version cannot be empty".into()));
        }
        if self.platform.is_empty() {
            return Err(SyncError::Validation("Platform cannot be empty".into()));
        }
        if self.sha256.is_empty() {
            return Err(SyncError::Validation("SHA256 hash cannot be empty".into()));
        }
        if !self.has_unknown_hash() && !is_sha256(&self.sha256) {
            return Err(SyncError::Validation(
                "SHA256 hash must be 64 hexadecimal characters".into(),
            ));
        }
        if self.download_date.is_empty() {
            return Err(SyncError::Validation("Download date cannot be empty".into()));
        }
        if parse_date(&self.download_date).is_none() {
            return Err(SyncError::Validation(
                "Download date must be in YYYY-MM-DD format".into(),
            ));
        }
        if self.file_size == 0 {
            return Err(SyncError::Validation("File size must be positive".into()));
        }
        Ok(())
    }

    pub fn to_record(&self) -> HashRecord {
        HashRecord {
            sha256: self.sha256.clone(),
            download_date: self.download_date.clone(),
            file_size: self.file_size,
        }
    }

    pub fn from_record(
        formula_name: impl Into<String>,
        version: impl Into<String>,
        platform: impl Into<String>,
        record: HashRecord,
    ) -> Self {
        Self {
            formula_name: formula_name.into(),
            version: version.into(),
            platform: platform.into(),
            sha256: record.sha256,
            download_date: record.download_date,
            file_size: record.file_size,
        }
    }
}

/// Outcome of a single bottle within a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleStatus {
    Completed,
    Failed,
    Skipped,
}

impl BottleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BottleStatus::Completed => "completed",
            BottleStatus::Failed => "failed",
            BottleStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for BottleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
