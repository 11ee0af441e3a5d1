//! Common test utilities for integration tests
//!
//! Storage fixtures with fast retry policies, bottle builders and helpers for
//! seeding bottle objects the way the sync workers lay them out.
#![allow(dead_code)]

use anyhow::Result;
use bottle_sync::metrics::InMemoryMetrics;
use bottle_sync::models::{BottleInfo, Formula};
use bottle_sync::storage::{FsObjectStore, MemoryObjectStore, ObjectStore};
use bottle_sync::{RetryConfig, StorageService};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

pub const BUCKET: &str = "homebrew-bottles";

/// Storage retry policy with millisecond backoff
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        base_delay: 0.001,
        max_delay: 0.005,
        ..RetryConfig::storage()
    }
}

/// In-memory storage with a metrics recorder attached
pub fn create_test_storage() -> (StorageService, MemoryObjectStore, Arc<InMemoryMetrics>) {
    let store = MemoryObjectStore::new(BUCKET);
    let metrics = Arc::new(InMemoryMetrics::new());
    let storage =
        StorageService::new(Arc::new(store.clone()), fast_retry()).with_metrics(metrics.clone());
    (storage, store, metrics)
}

/// Directory-backed storage in a fresh temp dir
pub fn create_fs_storage() -> Result<(StorageService, FsObjectStore, TempDir)> {
    let dir = TempDir::new()?;
    let store = FsObjectStore::new(dir.path(), BUCKET)?;
    let storage = StorageService::new(Arc::new(store.clone()), fast_retry());
    Ok((storage, store, dir))
}

/// Deterministic 64 character hex digest
pub fn sha(seed: u8) -> String {
    format!("{:02x}", seed).repeat(32)
}

pub fn bottle(sha256: &str, size: u64) -> BottleInfo {
    BottleInfo::new("https://ghcr.io/v2/homebrew/core/blobs/sha256", sha256, size)
}

pub fn formula(name: &str, version: &str) -> Formula {
    Formula::new(name, version)
}

/// Store a bottle archive at `<date>/<name>-<version>.<platform>.bottle.tar.gz`
pub fn put_bottle_object(
    store: &dyn ObjectStore,
    date: &str,
    name: &str,
    version: &str,
    platform: &str,
    size: usize,
) -> Result<String> {
    let key = format!("{}/{}-{}.{}.bottle.tar.gz", date, name, version, platform);
    store.put_object(&key, vec![0x1f; size], HashMap::new())?;
    Ok(key)
}
