use std::path::Path;
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::config::RuntimeConfig;
use crate::error::SmallError;
use crate::executor::{Executor, PermissionChecker, QueryResult};
use crate::sql::plan_statement;
use crate::storage::engine::StorageEngine;
use crate::types::SmallResult;

/// One open database: the storage engine, the catalog loaded from it and
/// an executor wired to both. Construction is explicit; there is no
/// process-global instance, so tests can run databases side by side.
pub struct Database {
    engine: Arc<StorageEngine>,
    catalog: Arc<Catalog>,
    executor: Executor,
}

impl Database {
    /// Open (or create) the database at `db_file`, replaying the WAL and
    /// loading the catalog.
    pub fn open<P: AsRef<Path>>(db_file: P, config: &RuntimeConfig) -> Result<Self, SmallError> {
        let engine = Arc::new(StorageEngine::open(db_file, config)?);
        let catalog = Arc::new(Catalog::new(Arc::clone(&engine)));
        catalog.load_from_storage()?;
        let executor = Executor::new(Arc::clone(&engine), Arc::clone(&catalog));
        Ok(Self {
            engine,
            catalog,
            executor,
        })
    }

    /// Like [`Database::open`], with a caller-supplied authorization
    /// hook gating the executor.
    pub fn open_with_checker<P: AsRef<Path>>(
        db_file: P,
        config: &RuntimeConfig,
        checker: Box<dyn PermissionChecker>,
    ) -> Result<Self, SmallError> {
        let engine = Arc::new(StorageEngine::open(db_file, config)?);
        let catalog = Arc::new(Catalog::new(Arc::clone(&engine)));
        catalog.load_from_storage()?;
        let executor =
            Executor::with_permission_checker(Arc::clone(&engine), Arc::clone(&catalog), checker);
        Ok(Self {
            engine,
            catalog,
            executor,
        })
    }

    /// Plan and execute one SQL statement on behalf of `user`.
    pub fn run_sql(&self, sql: &str, user: &str) -> Result<QueryResult, SmallError> {
        let plan = plan_statement(sql)?;
        self.executor.execute(&plan, user)
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Flush everything and truncate the WAL.
    pub fn checkpoint(&self) -> SmallResult {
        self.engine.checkpoint()
    }

    /// Checkpoint and close. Also happens when the database is dropped.
    pub fn shutdown(&self) {
        self.engine.shutdown();
    }
}
