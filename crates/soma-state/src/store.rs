//! StateStore: redb-backed state persistence for Soma.
//!
//! Records are JSON-serialized into redb's `&[u8]` value columns and
//! addressed through the [`Record`] trait. Single-record operations open
//! their own transaction; multi-row state changes go through
//! [`StateStore::write`], which commits only if the closure succeeds.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableHandle, WriteTransaction};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::status::DeploymentStatus;
use crate::tables::{ALL_TABLES, COUNTERS, JOB_SEQUENCE};
use crate::types::*;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in ALL_TABLES {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run `f` inside one write transaction.
    ///
    /// The transaction commits only when `f` returns `Ok`; on error every
    /// write made through the [`WriteTxn`] is rolled back.
    pub fn write<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<StateError>,
        F: FnOnce(&WriteTxn<'_>) -> Result<T, E>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        match f(&WriteTxn { txn: &txn }) {
            Ok(value) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort) = txn.abort() {
                    debug!(error = %abort, "transaction abort failed");
                }
                Err(e)
            }
        }
    }

    // ── Generic record access ──────────────────────────────────────

    /// Get a record by key.
    pub fn get<R: Record>(&self, key: &str) -> StateResult<Option<R>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: R =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Get a record by key, failing with `NotFound` if absent.
    pub fn require<R: Record>(&self, key: &str) -> StateResult<R> {
        self.get(key)?
            .ok_or_else(|| StateError::NotFound(format!("{}/{key}", table_name::<R>())))
    }

    /// List every record of a table.
    pub fn list<R: Record>(&self) -> StateResult<Vec<R>> {
        self.list_where(|_: &R| true)
    }

    /// List records matching a predicate.
    pub fn list_where<R, P>(&self, mut predicate: P) -> StateResult<Vec<R>>
    where
        R: Record,
        P: FnMut(&R) -> bool,
    {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: R =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if predicate(&record) {
                results.push(record);
            }
        }
        Ok(results)
    }

    /// Insert or update a record.
    pub fn put<R: Record>(&self, record: &R) -> StateResult<()> {
        self.write(|txn| txn.put(record))
    }

    /// Delete a record by key. Returns true if it existed.
    pub fn delete<R: Record>(&self, key: &str) -> StateResult<bool> {
        self.write(|txn| txn.delete::<R>(key))
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Persist a new job with the next admission sequence number. Returns
    /// the number of rows written, which is 0 when a job with the same id
    /// already exists.
    pub fn insert_job(&self, job: &Job) -> StateResult<u64> {
        let written = self.write(|txn| {
            if txn.get::<Job>(&job.id)?.is_some() {
                return Ok(0);
            }
            let mut job = job.clone();
            job.sequence = txn.next_sequence(JOB_SEQUENCE)?;
            txn.put(&job)?;
            Ok(1)
        })?;
        debug!(job_id = %job.id, written, "job recorded");
        Ok(written)
    }

    /// Mark a job as picked up by its tree keeper.
    pub fn start_job(&self, job_id: &str) -> StateResult<Job> {
        self.write(|txn| {
            let mut job: Job = txn.require(job_id)?;
            job.status = JobStatus::InProgress;
            job.started_at = Some(epoch_secs());
            txn.put(&job)?;
            Ok(job)
        })
    }

    /// Record the terminal result of a job.
    pub fn finish_job(&self, job_id: &str, error: Option<String>) -> StateResult<Job> {
        self.write(|txn| {
            let mut job: Job = txn.require(job_id)?;
            job.status = JobStatus::Processed;
            job.result = if error.is_some() {
                JobResult::Failed
            } else {
                JobResult::Success
            };
            job.error = error;
            job.finished_at = Some(epoch_secs());
            txn.put(&job)?;
            Ok(job)
        })
    }

    /// List jobs for a repository in admission order.
    pub fn list_jobs_for_repository(&self, repository_id: &str) -> StateResult<Vec<Job>> {
        let mut jobs = self.list_where(|j: &Job| j.repository_id == repository_id)?;
        jobs.sort_by_key(|j| j.sequence);
        Ok(jobs)
    }

    // ── Inventory ──────────────────────────────────────────────────

    /// Insert a repository unless its id or name is taken. The check and
    /// the write share one transaction.
    pub fn insert_repository(&self, repository: &Repository) -> StateResult<()> {
        self.write(|txn| {
            let taken = txn.list_where(|r: &Repository| {
                r.id == repository.id || r.name == repository.name
            })?;
            if let Some(existing) = taken.first() {
                return Err(StateError::Constraint(format!(
                    "repository {} conflicts with {} ({})",
                    repository.name, existing.id, existing.name
                )));
            }
            txn.put(repository)
        })?;
        debug!(repository_id = %repository.id, "repository recorded");
        Ok(())
    }

    /// Ids of every bucket in a repository.
    pub fn bucket_ids_for_repository(&self, repository_id: &str) -> StateResult<Vec<String>> {
        Ok(self
            .list_where(|b: &Bucket| b.repository_id == repository_id)?
            .into_iter()
            .map(|b| b.id)
            .collect())
    }

    /// Repository owning a bucket.
    pub fn repository_for_bucket(&self, bucket_id: &str) -> StateResult<Option<Repository>> {
        match self.get::<Bucket>(bucket_id)? {
            Some(bucket) => self.get(&bucket.repository_id),
            None => Ok(None),
        }
    }

    // ── Check instance configurations ──────────────────────────────

    /// Every configuration version of a check instance, oldest first.
    pub fn configs_for_instance(
        &self,
        instance_id: &str,
    ) -> StateResult<Vec<CheckInstanceConfiguration>> {
        let mut configs = self
            .list_where(|c: &CheckInstanceConfiguration| c.check_instance_id == instance_id)?;
        configs.sort_by_key(|c| c.version);
        Ok(configs)
    }

    /// Insert or update a configuration, enforcing that an instance has at
    /// most one `active` configuration.
    pub fn put_instance_config(&self, config: &CheckInstanceConfiguration) -> StateResult<()> {
        self.write(|txn| txn.put_instance_config(config))
    }
}

/// Handle to an open write transaction.
///
/// Every helper opens and releases its table before returning, so helpers
/// can be called in any order within one transaction.
pub struct WriteTxn<'a> {
    txn: &'a WriteTransaction,
}

impl WriteTxn<'_> {
    pub fn get<R: Record>(&self, key: &str) -> StateResult<Option<R>> {
        let table = self.txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        let bytes = table
            .get(key)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec());
        match bytes {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?,
            )),
            None => Ok(None),
        }
    }

    pub fn require<R: Record>(&self, key: &str) -> StateResult<R> {
        self.get(key)?
            .ok_or_else(|| StateError::NotFound(format!("{}/{key}", table_name::<R>())))
    }

    pub fn list_where<R, P>(&self, mut predicate: P) -> StateResult<Vec<R>>
    where
        R: Record,
        P: FnMut(&R) -> bool,
    {
        let table = self.txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: R =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if predicate(&record) {
                results.push(record);
            }
        }
        Ok(results)
    }

    pub fn put<R: Record>(&self, record: &R) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let mut table = self.txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        table
            .insert(key.as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Increment and return a named counter, starting at 1.
    pub fn next_sequence(&self, name: &str) -> StateResult<u64> {
        let mut table = self.txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        let next = table
            .get(name)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0)
            + 1;
        table.insert(name, next).map_err(map_err!(Write))?;
        Ok(next)
    }

    pub fn delete<R: Record>(&self, key: &str) -> StateResult<bool> {
        let mut table = self.txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        let existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        Ok(existed)
    }

    /// Configuration versions of one instance, oldest first.
    pub fn configs_for_instance(
        &self,
        instance_id: &str,
    ) -> StateResult<Vec<CheckInstanceConfiguration>> {
        let mut configs = self
            .list_where(|c: &CheckInstanceConfiguration| c.check_instance_id == instance_id)?;
        configs.sort_by_key(|c| c.version);
        Ok(configs)
    }

    pub fn put_instance_config(&self, config: &CheckInstanceConfiguration) -> StateResult<()> {
        if config.status == DeploymentStatus::Active {
            let clash = self.list_where(|c: &CheckInstanceConfiguration| {
                c.check_instance_id == config.check_instance_id
                    && c.id != config.id
                    && c.status == DeploymentStatus::Active
            })?;
            if let Some(other) = clash.first() {
                return Err(StateError::Constraint(format!(
                    "check instance {} already has active configuration {}",
                    config.check_instance_id, other.id
                )));
            }
        }
        self.put(config)
    }

    /// Dependency edges that block the given configuration.
    pub fn dependencies_blocking(
        &self,
        blocked_id: &str,
    ) -> StateResult<Vec<CheckInstanceConfigurationDependency>> {
        self.list_where(|d: &CheckInstanceConfigurationDependency| {
            d.blocked_instance_config_id == blocked_id
        })
    }
}

fn table_name<R: Record>() -> String {
    let table = R::TABLE;
    table.name().to_string()
}
