// not every test crate uses every helper
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use small_base::{
    init_log, Database, ReplacementPolicy, RuntimeConfig, StorageEngine,
};
use tempfile::TempDir;

/// Log setup for every integration test entry point. Repeated calls are
/// fine.
pub fn setup() {
    init_log();
}

/// A config without background workers, so tests observe exactly the
/// I/O they trigger themselves.
pub fn quiet_config() -> RuntimeConfig {
    RuntimeConfig {
        flush_interval_ms: 0,
        readahead_enabled: false,
        ..RuntimeConfig::default()
    }
}

/// Like [`quiet_config`], with a small pool to force evictions.
pub fn tiny_pool_config(pages: usize) -> RuntimeConfig {
    RuntimeConfig {
        buffer_pool_pages: pages,
        flush_interval_ms: 0,
        readahead_enabled: false,
        autoresize_enabled: false,
        replacement_policy: ReplacementPolicy::Lru,
        ..RuntimeConfig::default()
    }
}

/// A scratch database file path inside a fresh temp directory. The
/// directory is removed when the returned guard drops.
pub fn scratch_db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("small.db")
}

pub fn new_temp_dir() -> TempDir {
    TempDir::new().expect("create temp dir")
}

pub fn open_engine(dir: &TempDir, config: &RuntimeConfig) -> Arc<StorageEngine> {
    Arc::new(StorageEngine::open(scratch_db_path(dir), config).expect("open storage engine"))
}

pub fn open_database(dir: &TempDir) -> Database {
    Database::open(scratch_db_path(dir), &quiet_config()).expect("open database")
}

/// Shorthand for running one statement that must succeed.
pub fn run(db: &Database, sql: &str) -> small_base::QueryResult {
    db.run_sql(sql, "root")
        .unwrap_or_else(|e| panic!("statement {:?} failed: {}", sql, e))
}

/// Collect the row texts of a query result.
pub fn rows_of(result: &small_base::QueryResult) -> Vec<Vec<String>> {
    match result {
        small_base::QueryResult::Rows { rows, .. } => rows.iter().map(|r| r.texts()).collect(),
        small_base::QueryResult::Summary(s) => panic!("expected rows, got summary {:?}", s),
    }
}
