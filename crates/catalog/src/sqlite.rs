//! Catalog trait and SQLite implementation.

use crate::error::{CatalogError, CatalogResult};
use crate::models::{
    ContentChunkRow, CreateVersionOutcome, FileVersionRow, IndexRow, NewIndexEntry, PackRow,
    PackUsageRow, ServerStats, VacuumJobRow,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Vacuum job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VacuumJobStatus {
    Running,
    Completed,
    Failed,
}

impl VacuumJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Maximum number of bound variables per statement; batched lookups chunk
/// their inputs to stay under SQLite's limit.
const MAX_BATCH_BINDS: usize = 500;

/// Catalog operations.
///
/// All multi-row writes are single transactions serialized by the
/// implementation's write mutex; reads run concurrently against the pool.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Check database connectivity.
    async fn health_check(&self) -> CatalogResult<()>;

    // ----- packs -----

    /// Register a pack and all of its index entries in one transaction.
    async fn register_pack(
        &self,
        sum: &str,
        size: u64,
        object_key: &str,
        entries: &[NewIndexEntry],
    ) -> CatalogResult<i64>;

    /// Look up a pack by its sum.
    async fn get_pack_by_sum(&self, sum: &str) -> CatalogResult<Option<PackRow>>;

    /// Positional existence check: `out[i]` is true iff some index entry
    /// carries `sums[i]`. Lookup-only.
    async fn chunks_exist(&self, sums: &[String]) -> CatalogResult<Vec<bool>>;

    // ----- files -----

    /// Register a file version from its ordered chunk sums.
    ///
    /// Resolves each sum to an index entry (`MissingChunks` if any is
    /// absent), creates the `files` row if needed, and inserts the version
    /// with dense contents 0..n-1. Idempotent on `version_sum`. When
    /// `versioning` is false, prior versions of the same name are deleted in
    /// the same transaction.
    async fn create_file_version(
        &self,
        name: &str,
        version_sum: &str,
        created_at: i64,
        chunk_sums: &[String],
        versioning: bool,
    ) -> CatalogResult<CreateVersionOutcome>;

    /// Look up a file version by its sum.
    async fn get_file_version(&self, sum: &str) -> CatalogResult<Option<FileVersionRow>>;

    /// The version's chunks in dense sequence order, joined through their
    /// index entries and packs.
    async fn get_file_contents(&self, version_id: i64) -> CatalogResult<Vec<ContentChunkRow>>;

    /// Delete a file version and its contents. Chunks and packs survive
    /// until vacuum.
    async fn delete_file_version(&self, sum: &str) -> CatalogResult<()>;

    /// List files matching a name prefix, newest version per file, ordered
    /// by name. `after_name` resumes a previous page.
    async fn list_files(
        &self,
        prefix: &str,
        limit: u32,
        after_name: Option<&str>,
        ascending: bool,
    ) -> CatalogResult<Vec<FileVersionRow>>;

    /// List the versions of one file name. Default order is newest first.
    async fn list_versions(
        &self,
        name: &str,
        limit: u32,
        after_version_id: Option<i64>,
        ascending: bool,
    ) -> CatalogResult<Vec<FileVersionRow>>;

    /// Aggregate catalog statistics.
    async fn server_stats(&self) -> CatalogResult<ServerStats>;

    // ----- vacuum -----

    /// Create a vacuum job in `running` state. Fails with `Constraint` when
    /// another job is already running (single-flight).
    async fn create_vacuum_job(&self, job_id: Uuid, started_at: i64) -> CatalogResult<()>;

    async fn get_vacuum_job(&self, job_id: Uuid) -> CatalogResult<Option<VacuumJobRow>>;

    /// Transition a job out of `running`.
    async fn finish_vacuum_job(
        &self,
        job_id: Uuid,
        status: VacuumJobStatus,
        completed_at: i64,
    ) -> CatalogResult<()>;

    /// Mark jobs left `running` by a previous process as failed. Returns the
    /// number of recovered jobs.
    async fn recover_orphaned_vacuum_jobs(&self, completed_at: i64) -> CatalogResult<u64>;

    /// Per-pack liveness summary for the vacuum mark phase.
    async fn pack_usage(&self) -> CatalogResult<Vec<PackUsageRow>>;

    /// Index entries of a pack still referenced by some live version, in
    /// sequence order.
    async fn live_indexes_for_pack(&self, pack_id: i64) -> CatalogResult<Vec<IndexRow>>;

    /// Atomically replace a rewritten pack: insert the new pack and entries,
    /// repoint `file_contents` rows per `remap` (old idx id → new sequence),
    /// and drop the old pack and its entries.
    ///
    /// Liveness is re-checked inside the transaction: if a version committed
    /// since the rewrite snapshot references an entry `remap` does not cover,
    /// nothing is changed and `None` is returned; the old pack stays
    /// authoritative.
    async fn swap_rewritten_pack(
        &self,
        old_pack_id: i64,
        new_sum: &str,
        new_size: u64,
        new_object_key: &str,
        entries: &[NewIndexEntry],
        remap: &[(i64, u32)],
    ) -> CatalogResult<Option<i64>>;

    /// Delete an unreachable pack and its index entries.
    ///
    /// Liveness is re-checked inside the transaction: if a version committed
    /// since the mark phase references the pack, nothing is deleted and
    /// false is returned.
    async fn delete_pack(&self, pack_id: i64) -> CatalogResult<bool>;
}

/// SQLite-backed catalog.
pub struct SqliteCatalog {
    pool: Pool<Sqlite>,
    /// Serializes write transactions. Readers go straight to the pool.
    write_lock: Mutex<()>,
}

impl SqliteCatalog {
    /// Open (creating if missing) the catalog database at `path`.
    pub async fn new(path: impl AsRef<Path>) -> CatalogResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CatalogError::Internal(format!("creating database directory: {e}"))
            })?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors when a reader
            // overlaps the writer.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Resolve chunk sums to `(idx_id, chunk_size)`, choosing the lowest
    /// index entry per sum. Returns a map keyed by sum; absent sums are
    /// simply not present.
    async fn resolve_chunks(
        &self,
        sums: &[String],
    ) -> CatalogResult<HashMap<String, (i64, i64)>> {
        let mut resolved = HashMap::new();
        let mut distinct: Vec<&String> = sums.iter().collect();
        distinct.sort();
        distinct.dedup();

        for batch in distinct.chunks(MAX_BATCH_BINDS) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!(
                "SELECT i.sum, i.idx_id, i.chunk_size FROM indexes i \
                 WHERE i.idx_id IN ( \
                     SELECT MIN(idx_id) FROM indexes WHERE sum IN ({placeholders}) GROUP BY sum \
                 )"
            );
            let mut query = sqlx::query_as::<_, (String, i64, i64)>(&sql);
            for sum in batch {
                query = query.bind(sum.as_str());
            }
            for (sum, idx_id, chunk_size) in query.fetch_all(&self.pool).await? {
                resolved.insert(sum, (idx_id, chunk_size));
            }
        }
        Ok(resolved)
    }
}

fn constraint_error(err: sqlx::Error, what: &str) -> CatalogError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            CatalogError::Constraint(what.to_string())
        }
        _ => CatalogError::Database(err),
    }
}

/// Escape `%`, `_` and the escape character itself for a LIKE prefix match.
fn escape_like(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl Catalog for SqliteCatalog {
    async fn health_check(&self) -> CatalogResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn register_pack(
        &self,
        sum: &str,
        size: u64,
        object_key: &str,
        entries: &[NewIndexEntry],
    ) -> CatalogResult<i64> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "INSERT INTO packs (sum, num_chunks, size, object_key) VALUES (?, ?, ?, ?)",
        )
        .bind(sum)
        .bind(entries.len() as i64)
        .bind(size as i64)
        .bind(object_key)
        .execute(&mut *tx)
        .await
        .map_err(|e| constraint_error(e, &format!("pack {sum} already registered")))?;
        let pack_id = result.last_insert_rowid();

        for entry in entries {
            sqlx::query(
                "INSERT INTO indexes (pack_id, sequence, sum, chunk_size, mode, byte_offset, stored_size) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(pack_id)
            .bind(entry.sequence as i64)
            .bind(&entry.sum)
            .bind(entry.chunk_size as i64)
            .bind(entry.mode as i64)
            .bind(entry.byte_offset as i64)
            .bind(entry.stored_size as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| constraint_error(e, &format!("duplicate sequence in pack {sum}")))?;
        }

        tx.commit().await?;
        Ok(pack_id)
    }

    async fn get_pack_by_sum(&self, sum: &str) -> CatalogResult<Option<PackRow>> {
        let row = sqlx::query_as::<_, PackRow>("SELECT * FROM packs WHERE sum = ?")
            .bind(sum)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn chunks_exist(&self, sums: &[String]) -> CatalogResult<Vec<bool>> {
        let resolved = self.resolve_chunks(sums).await?;
        Ok(sums.iter().map(|s| resolved.contains_key(s)).collect())
    }

    async fn create_file_version(
        &self,
        name: &str,
        version_sum: &str,
        created_at: i64,
        chunk_sums: &[String],
        versioning: bool,
    ) -> CatalogResult<CreateVersionOutcome> {
        // Resolve under the write lock: a vacuum delete commits under the
        // same lock, so an index entry resolved here cannot vanish before
        // the file_contents insert below.
        let _guard = self.write_lock.lock().await;
        let resolved = self.resolve_chunks(chunk_sums).await?;
        let missing: Vec<String> = {
            let mut seen: Vec<&String> = chunk_sums
                .iter()
                .filter(|s| !resolved.contains_key(s.as_str()))
                .collect();
            seen.sort();
            seen.dedup();
            seen.into_iter().cloned().collect()
        };
        if !missing.is_empty() {
            return Err(CatalogError::MissingChunks {
                missing_chunks: missing,
            });
        }
        let total_size: i64 = chunk_sums.iter().map(|s| resolved[s].1).sum();

        let mut tx = self.pool.begin().await?;

        if let Some((version_id,)) =
            sqlx::query_as::<_, (i64,)>("SELECT version_id FROM file_versions WHERE sum = ?")
                .bind(version_sum)
                .fetch_optional(&mut *tx)
                .await?
        {
            return Ok(CreateVersionOutcome {
                version_id,
                created: false,
            });
        }

        sqlx::query("INSERT INTO files (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        let (file_id,) = sqlx::query_as::<_, (i64,)>("SELECT file_id FROM files WHERE name = ?")
            .bind(name)
            .fetch_one(&mut *tx)
            .await?;

        let result = sqlx::query(
            "INSERT INTO file_versions (file_id, created_at, size, num_chunks, sum) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(file_id)
        .bind(created_at)
        .bind(total_size)
        .bind(chunk_sums.len() as i64)
        .bind(version_sum)
        .execute(&mut *tx)
        .await
        .map_err(|e| constraint_error(e, &format!("version {version_sum} already exists")))?;
        let version_id = result.last_insert_rowid();

        for (sequence, sum) in chunk_sums.iter().enumerate() {
            let (idx_id, _) = resolved[sum];
            sqlx::query(
                "INSERT INTO file_contents (version_id, idx_id, sequence) VALUES (?, ?, ?)",
            )
            .bind(version_id)
            .bind(idx_id)
            .bind(sequence as i64)
            .execute(&mut *tx)
            .await?;
        }

        if !versioning {
            sqlx::query("DELETE FROM file_versions WHERE file_id = ? AND version_id != ?")
                .bind(file_id)
                .bind(version_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(CreateVersionOutcome {
            version_id,
            created: true,
        })
    }

    async fn get_file_version(&self, sum: &str) -> CatalogResult<Option<FileVersionRow>> {
        let row = sqlx::query_as::<_, FileVersionRow>(
            "SELECT fv.version_id, fv.file_id, f.name, fv.created_at, fv.size, fv.num_chunks, fv.sum \
             FROM file_versions fv JOIN files f ON f.file_id = fv.file_id \
             WHERE fv.sum = ?",
        )
        .bind(sum)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_file_contents(&self, version_id: i64) -> CatalogResult<Vec<ContentChunkRow>> {
        let rows = sqlx::query_as::<_, ContentChunkRow>(
            "SELECT fc.sequence, i.idx_id, i.sum AS chunk_sum, i.chunk_size, i.mode, \
                    i.byte_offset, i.stored_size, \
                    p.pack_id, p.sum AS pack_sum, p.object_key AS pack_object_key \
             FROM file_contents fc \
             JOIN indexes i ON i.idx_id = fc.idx_id \
             JOIN packs p ON p.pack_id = i.pack_id \
             WHERE fc.version_id = ? \
             ORDER BY fc.sequence",
        )
        .bind(version_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_file_version(&self, sum: &str) -> CatalogResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM file_versions WHERE sum = ?")
            .bind(sum)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound(format!("file version {sum}")));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_files(
        &self,
        prefix: &str,
        limit: u32,
        after_name: Option<&str>,
        ascending: bool,
    ) -> CatalogResult<Vec<FileVersionRow>> {
        let cursor_clause = match (after_name, ascending) {
            (None, _) => "",
            (Some(_), true) => "AND f.name > ?",
            (Some(_), false) => "AND f.name < ?",
        };
        let order = if ascending { "ASC" } else { "DESC" };
        let sql = format!(
            "SELECT fv.version_id, fv.file_id, f.name, fv.created_at, fv.size, fv.num_chunks, fv.sum \
             FROM files f \
             JOIN file_versions fv ON fv.version_id = ( \
                 SELECT v.version_id FROM file_versions v WHERE v.file_id = f.file_id \
                 ORDER BY v.created_at DESC, v.version_id DESC LIMIT 1) \
             WHERE f.name LIKE ? ESCAPE '\\' {cursor_clause} \
             ORDER BY f.name {order} LIMIT ?"
        );

        let mut query =
            sqlx::query_as::<_, FileVersionRow>(&sql).bind(format!("{}%", escape_like(prefix)));
        if let Some(name) = after_name {
            query = query.bind(name);
        }
        let rows = query.bind(limit as i64).fetch_all(&self.pool).await?;
        Ok(rows)
    }

    async fn list_versions(
        &self,
        name: &str,
        limit: u32,
        after_version_id: Option<i64>,
        ascending: bool,
    ) -> CatalogResult<Vec<FileVersionRow>> {
        let cursor_clause = match (after_version_id, ascending) {
            (None, _) => "",
            (Some(_), true) => "AND fv.version_id > ?",
            (Some(_), false) => "AND fv.version_id < ?",
        };
        let order = if ascending { "ASC" } else { "DESC" };
        let sql = format!(
            "SELECT fv.version_id, fv.file_id, f.name, fv.created_at, fv.size, fv.num_chunks, fv.sum \
             FROM file_versions fv JOIN files f ON f.file_id = fv.file_id \
             WHERE f.name = ? {cursor_clause} \
             ORDER BY fv.version_id {order} LIMIT ?"
        );

        let mut query = sqlx::query_as::<_, FileVersionRow>(&sql).bind(name);
        if let Some(id) = after_version_id {
            query = query.bind(id);
        }
        let rows = query.bind(limit as i64).fetch_all(&self.pool).await?;
        Ok(rows)
    }

    async fn server_stats(&self) -> CatalogResult<ServerStats> {
        let stats = sqlx::query_as::<_, ServerStats>(
            "SELECT \
                 (SELECT COUNT(DISTINCT file_id) FROM file_versions) AS num_files, \
                 (SELECT COUNT(*) FROM file_versions) AS num_file_versions, \
                 (SELECT COALESCE(SUM(size), 0) FROM file_versions) AS total_files_size, \
                 (SELECT COALESCE(SUM(size), 0) FROM packs) AS total_data_size",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }

    async fn create_vacuum_job(&self, job_id: Uuid, started_at: i64) -> CatalogResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("INSERT INTO vacuum_jobs (job_id, status, started_at) VALUES (?, 'running', ?)")
            .bind(job_id)
            .bind(started_at)
            .execute(&self.pool)
            .await
            .map_err(|e| constraint_error(e, "another vacuum is already running"))?;
        Ok(())
    }

    async fn get_vacuum_job(&self, job_id: Uuid) -> CatalogResult<Option<VacuumJobRow>> {
        let row = sqlx::query_as::<_, VacuumJobRow>("SELECT * FROM vacuum_jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn finish_vacuum_job(
        &self,
        job_id: Uuid,
        status: VacuumJobStatus,
        completed_at: i64,
    ) -> CatalogResult<()> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "UPDATE vacuum_jobs SET status = ?, completed_at = ? WHERE job_id = ?",
        )
        .bind(status.as_str())
        .bind(completed_at)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound(format!("vacuum job {job_id}")));
        }
        Ok(())
    }

    async fn recover_orphaned_vacuum_jobs(&self, completed_at: i64) -> CatalogResult<u64> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "UPDATE vacuum_jobs SET status = 'failed', completed_at = ? WHERE status = 'running'",
        )
        .bind(completed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn pack_usage(&self) -> CatalogResult<Vec<PackUsageRow>> {
        let rows = sqlx::query_as::<_, PackUsageRow>(
            "SELECT p.pack_id, p.sum, p.size, p.object_key, \
                    COUNT(live.idx_id) AS live_chunks, \
                    COALESCE(SUM(CASE WHEN i.idx_id IS NOT NULL AND live.idx_id IS NULL \
                                      THEN i.stored_size ELSE 0 END), 0) AS dead_bytes \
             FROM packs p \
             LEFT JOIN indexes i ON i.pack_id = p.pack_id \
             LEFT JOIN (SELECT DISTINCT idx_id FROM file_contents) live \
                    ON live.idx_id = i.idx_id \
             GROUP BY p.pack_id \
             ORDER BY p.pack_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn live_indexes_for_pack(&self, pack_id: i64) -> CatalogResult<Vec<IndexRow>> {
        let rows = sqlx::query_as::<_, IndexRow>(
            "SELECT * FROM indexes \
             WHERE pack_id = ? AND idx_id IN (SELECT DISTINCT idx_id FROM file_contents) \
             ORDER BY sequence",
        )
        .bind(pack_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn swap_rewritten_pack(
        &self,
        old_pack_id: i64,
        new_sum: &str,
        new_size: u64,
        new_object_key: &str,
        entries: &[NewIndexEntry],
        remap: &[(i64, u32)],
    ) -> CatalogResult<Option<i64>> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        // The rewrite snapshot was taken outside this transaction. Any live
        // entry it missed would be orphaned by the swap, so the pack is left
        // for the next pass instead.
        let live_now: Vec<(i64,)> = sqlx::query_as(
            "SELECT DISTINCT fc.idx_id FROM file_contents fc \
             JOIN indexes i ON i.idx_id = fc.idx_id \
             WHERE i.pack_id = ?",
        )
        .bind(old_pack_id)
        .fetch_all(&mut *tx)
        .await?;
        let remapped: HashSet<i64> = remap.iter().map(|(old_idx_id, _)| *old_idx_id).collect();
        if live_now.iter().any(|(idx_id,)| !remapped.contains(idx_id)) {
            return Ok(None);
        }

        let result = sqlx::query(
            "INSERT INTO packs (sum, num_chunks, size, object_key) VALUES (?, ?, ?, ?)",
        )
        .bind(new_sum)
        .bind(entries.len() as i64)
        .bind(new_size as i64)
        .bind(new_object_key)
        .execute(&mut *tx)
        .await
        .map_err(|e| constraint_error(e, &format!("pack {new_sum} already registered")))?;
        let new_pack_id = result.last_insert_rowid();

        let mut idx_by_sequence: HashMap<u32, i64> = HashMap::with_capacity(entries.len());
        for entry in entries {
            let result = sqlx::query(
                "INSERT INTO indexes (pack_id, sequence, sum, chunk_size, mode, byte_offset, stored_size) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(new_pack_id)
            .bind(entry.sequence as i64)
            .bind(&entry.sum)
            .bind(entry.chunk_size as i64)
            .bind(entry.mode as i64)
            .bind(entry.byte_offset as i64)
            .bind(entry.stored_size as i64)
            .execute(&mut *tx)
            .await?;
            idx_by_sequence.insert(entry.sequence, result.last_insert_rowid());
        }

        for (old_idx_id, new_sequence) in remap {
            let new_idx_id = idx_by_sequence.get(new_sequence).ok_or_else(|| {
                CatalogError::Internal(format!(
                    "rewrite remap references unknown sequence {new_sequence}"
                ))
            })?;
            sqlx::query("UPDATE file_contents SET idx_id = ? WHERE idx_id = ?")
                .bind(new_idx_id)
                .bind(old_idx_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM indexes WHERE pack_id = ?")
            .bind(old_pack_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM packs WHERE pack_id = ?")
            .bind(old_pack_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(new_pack_id))
    }

    async fn delete_pack(&self, pack_id: i64) -> CatalogResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        // The mark phase ran outside this transaction; a version committed
        // since then may reference this pack.
        let (live,) = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*) FROM file_contents WHERE idx_id IN \
             (SELECT idx_id FROM indexes WHERE pack_id = ?)",
        )
        .bind(pack_id)
        .fetch_one(&mut *tx)
        .await?;
        if live > 0 {
            return Ok(false);
        }

        sqlx::query("DELETE FROM indexes WHERE pack_id = ?")
            .bind(pack_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM packs WHERE pack_id = ?")
            .bind(pack_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound(format!("pack {pack_id}")));
        }

        tx.commit().await?;
        Ok(true)
    }
}

const SCHEMA_SQL: &str = r#"
-- Packs: one row per immutable packfile object.
CREATE TABLE IF NOT EXISTS packs (
    pack_id INTEGER PRIMARY KEY,
    sum TEXT NOT NULL UNIQUE,
    num_chunks INTEGER NOT NULL,
    size INTEGER NOT NULL,
    object_key TEXT NOT NULL
);

-- Index entries: one row per chunk stored in a pack.
CREATE TABLE IF NOT EXISTS indexes (
    idx_id INTEGER PRIMARY KEY,
    pack_id INTEGER NOT NULL REFERENCES packs(pack_id),
    sequence INTEGER NOT NULL,
    sum TEXT NOT NULL,
    chunk_size INTEGER NOT NULL,
    mode INTEGER NOT NULL,
    byte_offset INTEGER NOT NULL,
    stored_size INTEGER NOT NULL,
    UNIQUE (pack_id, sequence)
);
-- Dedup lookups resolve chunk sums through this index.
CREATE INDEX IF NOT EXISTS idx_indexes_sum ON indexes(sum);

-- Files: one row per name ever seen.
CREATE TABLE IF NOT EXISTS files (
    file_id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);
CREATE INDEX IF NOT EXISTS idx_files_name ON files(name);

-- File versions: identity is the sum over (name || ordered chunk sums).
-- created_at is epoch milliseconds.
CREATE TABLE IF NOT EXISTS file_versions (
    version_id INTEGER PRIMARY KEY,
    file_id INTEGER NOT NULL REFERENCES files(file_id),
    created_at INTEGER NOT NULL,
    size INTEGER NOT NULL,
    num_chunks INTEGER NOT NULL,
    sum TEXT NOT NULL UNIQUE
);
CREATE INDEX IF NOT EXISTS idx_file_versions_file ON file_versions(file_id, created_at);

-- Ordered version -> chunk mapping; sequences are dense 0..n-1.
CREATE TABLE IF NOT EXISTS file_contents (
    version_id INTEGER NOT NULL REFERENCES file_versions(version_id) ON DELETE CASCADE,
    idx_id INTEGER NOT NULL REFERENCES indexes(idx_id),
    sequence INTEGER NOT NULL,
    PRIMARY KEY (version_id, sequence)
);
CREATE INDEX IF NOT EXISTS idx_file_contents_idx ON file_contents(idx_id);

-- Vacuum jobs. The partial unique index enforces one running job at a time.
CREATE TABLE IF NOT EXISTS vacuum_jobs (
    job_id BLOB PRIMARY KEY,
    status TEXT NOT NULL DEFAULT 'running',
    started_at INTEGER NOT NULL,
    completed_at INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_vacuum_jobs_running
ON vacuum_jobs(status) WHERE status = 'running';
"#;

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_catalog() -> (tempfile::TempDir, SqliteCatalog) {
        let temp = tempfile::tempdir().unwrap();
        let catalog = SqliteCatalog::new(temp.path().join("catalog.db"))
            .await
            .unwrap();
        (temp, catalog)
    }

    fn entry(sequence: u32, sum: &str, chunk_size: u64) -> NewIndexEntry {
        NewIndexEntry {
            sequence,
            sum: sum.to_string(),
            chunk_size,
            mode: 0,
            byte_offset: 47 + sequence as u64 * 100,
            stored_size: chunk_size,
        }
    }

    fn sum(tag: &str) -> String {
        // 64-char pseudo-hex label; the catalog treats sums as opaque text.
        format!("{tag:0>64}")
    }

    #[tokio::test]
    async fn register_pack_and_lookup_chunks() {
        let (_temp, catalog) = open_catalog().await;

        let entries = vec![entry(0, &sum("a1"), 100), entry(1, &sum("b2"), 200)];
        let pack_id = catalog
            .register_pack(&sum("d1"), 1000, "d1.pack", &entries)
            .await
            .unwrap();
        assert!(pack_id > 0);

        let pack = catalog.get_pack_by_sum(&sum("d1")).await.unwrap().unwrap();
        assert_eq!(pack.num_chunks, 2);
        assert_eq!(pack.object_key, "d1.pack");

        let exists = catalog
            .chunks_exist(&[sum("a1"), sum("zz"), sum("b2")])
            .await
            .unwrap();
        assert_eq!(exists, vec![true, false, true]);
    }

    #[tokio::test]
    async fn duplicate_pack_sum_is_a_constraint() {
        let (_temp, catalog) = open_catalog().await;
        let entries = vec![entry(0, &sum("a1"), 100)];
        catalog
            .register_pack(&sum("d1"), 500, "d1.pack", &entries)
            .await
            .unwrap();
        match catalog
            .register_pack(&sum("d1"), 500, "d1.pack", &entries)
            .await
        {
            Err(CatalogError::Constraint(_)) => {}
            other => panic!("expected constraint, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_file_version_reports_missing_chunks() {
        let (_temp, catalog) = open_catalog().await;
        catalog
            .register_pack(&sum("d1"), 500, "d1.pack", &[entry(0, &sum("a1"), 100)])
            .await
            .unwrap();

        match catalog
            .create_file_version("x", &sum("f1"), 1, &[sum("a1"), sum("nope")], true)
            .await
        {
            Err(CatalogError::MissingChunks { missing_chunks }) => {
                assert_eq!(missing_chunks, vec![sum("nope")]);
            }
            other => panic!("expected MissingChunks, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_file_version_is_idempotent() {
        let (_temp, catalog) = open_catalog().await;
        catalog
            .register_pack(
                &sum("d1"),
                500,
                "d1.pack",
                &[entry(0, &sum("a1"), 100), entry(1, &sum("b2"), 200)],
            )
            .await
            .unwrap();

        let chunks = vec![sum("a1"), sum("b2"), sum("a1")];
        let first = catalog
            .create_file_version("x", &sum("f1"), 1, &chunks, true)
            .await
            .unwrap();
        assert!(first.created);

        let second = catalog
            .create_file_version("x", &sum("f1"), 2, &chunks, true)
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.version_id, first.version_id);

        // Duplicate chunk sums count once per occurrence toward the size.
        let version = catalog.get_file_version(&sum("f1")).await.unwrap().unwrap();
        assert_eq!(version.size, 100 + 200 + 100);
        assert_eq!(version.num_chunks, 3);
        assert_eq!(version.name, "x");

        let contents = catalog.get_file_contents(first.version_id).await.unwrap();
        assert_eq!(contents.len(), 3);
        for (i, row) in contents.iter().enumerate() {
            assert_eq!(row.sequence, i as i64);
        }
        assert_eq!(contents[0].chunk_sum, sum("a1"));
        assert_eq!(contents[2].chunk_sum, sum("a1"));
    }

    #[tokio::test]
    async fn versioning_disabled_supersedes_prior_versions() {
        let (_temp, catalog) = open_catalog().await;
        catalog
            .register_pack(
                &sum("d1"),
                500,
                "d1.pack",
                &[entry(0, &sum("a1"), 100), entry(1, &sum("b2"), 200)],
            )
            .await
            .unwrap();

        catalog
            .create_file_version("x", &sum("f1"), 1, &[sum("a1")], false)
            .await
            .unwrap();
        catalog
            .create_file_version("x", &sum("f2"), 2, &[sum("b2")], false)
            .await
            .unwrap();

        assert!(catalog.get_file_version(&sum("f1")).await.unwrap().is_none());
        assert!(catalog.get_file_version(&sum("f2")).await.unwrap().is_some());

        let versions = catalog.list_versions("x", 10, None, false).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].sum, sum("f2"));
    }

    #[tokio::test]
    async fn versioning_enabled_keeps_history() {
        let (_temp, catalog) = open_catalog().await;
        catalog
            .register_pack(
                &sum("d1"),
                500,
                "d1.pack",
                &[entry(0, &sum("a1"), 100), entry(1, &sum("b2"), 200)],
            )
            .await
            .unwrap();

        catalog
            .create_file_version("x", &sum("f1"), 1, &[sum("a1")], true)
            .await
            .unwrap();
        catalog
            .create_file_version("x", &sum("f2"), 2, &[sum("b2")], true)
            .await
            .unwrap();

        let versions = catalog.list_versions("x", 10, None, false).await.unwrap();
        assert_eq!(versions.len(), 2);
        // Newest first by default.
        assert_eq!(versions[0].sum, sum("f2"));
        assert_eq!(versions[1].sum, sum("f1"));
    }

    #[tokio::test]
    async fn delete_file_version_then_not_found() {
        let (_temp, catalog) = open_catalog().await;
        catalog
            .register_pack(&sum("d1"), 500, "d1.pack", &[entry(0, &sum("a1"), 100)])
            .await
            .unwrap();
        catalog
            .create_file_version("x", &sum("f1"), 1, &[sum("a1")], true)
            .await
            .unwrap();

        catalog.delete_file_version(&sum("f1")).await.unwrap();
        assert!(catalog.get_file_version(&sum("f1")).await.unwrap().is_none());

        match catalog.delete_file_version(&sum("f1")).await {
            Err(CatalogError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn list_files_prefix_and_pagination() {
        let (_temp, catalog) = open_catalog().await;
        catalog
            .register_pack(&sum("d1"), 500, "d1.pack", &[entry(0, &sum("a1"), 100)])
            .await
            .unwrap();

        for (i, name) in ["docs/a", "docs/b", "docs/c", "other"].iter().enumerate() {
            catalog
                .create_file_version(name, &sum(&format!("f{i}")), i as i64, &[sum("a1")], true)
                .await
                .unwrap();
        }

        let page1 = catalog.list_files("docs/", 2, None, true).await.unwrap();
        assert_eq!(
            page1.iter().map(|v| v.name.as_str()).collect::<Vec<_>>(),
            vec!["docs/a", "docs/b"]
        );

        let page2 = catalog
            .list_files("docs/", 2, Some("docs/b"), true)
            .await
            .unwrap();
        assert_eq!(
            page2.iter().map(|v| v.name.as_str()).collect::<Vec<_>>(),
            vec!["docs/c"]
        );

        let all_desc = catalog.list_files("", 10, None, false).await.unwrap();
        assert_eq!(all_desc.first().unwrap().name, "other");
    }

    #[tokio::test]
    async fn list_files_shows_latest_version() {
        let (_temp, catalog) = open_catalog().await;
        catalog
            .register_pack(
                &sum("d1"),
                500,
                "d1.pack",
                &[entry(0, &sum("a1"), 100), entry(1, &sum("b2"), 200)],
            )
            .await
            .unwrap();

        catalog
            .create_file_version("x", &sum("f1"), 100, &[sum("a1")], true)
            .await
            .unwrap();
        catalog
            .create_file_version("x", &sum("f2"), 200, &[sum("b2")], true)
            .await
            .unwrap();

        let files = catalog.list_files("", 10, None, true).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].sum, sum("f2"));
    }

    #[tokio::test]
    async fn stats_track_files_and_packs() {
        let (_temp, catalog) = open_catalog().await;
        catalog
            .register_pack(
                &sum("d1"),
                1234,
                "d1.pack",
                &[entry(0, &sum("a1"), 100), entry(1, &sum("b2"), 200)],
            )
            .await
            .unwrap();
        catalog
            .create_file_version("x", &sum("f1"), 1, &[sum("a1"), sum("b2")], true)
            .await
            .unwrap();
        catalog
            .create_file_version("y", &sum("f2"), 2, &[sum("a1")], true)
            .await
            .unwrap();

        let stats = catalog.server_stats().await.unwrap();
        assert_eq!(stats.num_files, 2);
        assert_eq!(stats.num_file_versions, 2);
        assert_eq!(stats.total_files_size, 300 + 100);
        assert_eq!(stats.total_data_size, 1234);
    }

    #[tokio::test]
    async fn vacuum_jobs_are_single_flight() {
        let (_temp, catalog) = open_catalog().await;
        let first = Uuid::new_v4();
        catalog.create_vacuum_job(first, 1).await.unwrap();

        match catalog.create_vacuum_job(Uuid::new_v4(), 2).await {
            Err(CatalogError::Constraint(_)) => {}
            other => panic!("expected constraint, got {other:?}"),
        }

        catalog
            .finish_vacuum_job(first, VacuumJobStatus::Completed, 3)
            .await
            .unwrap();
        let job = catalog.get_vacuum_job(first).await.unwrap().unwrap();
        assert_eq!(job.status, "completed");
        assert_eq!(job.completed_at, Some(3));

        // A finished job no longer blocks a new one.
        catalog.create_vacuum_job(Uuid::new_v4(), 4).await.unwrap();
    }

    #[tokio::test]
    async fn orphaned_vacuum_jobs_are_recovered() {
        let (_temp, catalog) = open_catalog().await;
        let job_id = Uuid::new_v4();
        catalog.create_vacuum_job(job_id, 1).await.unwrap();

        let recovered = catalog.recover_orphaned_vacuum_jobs(9).await.unwrap();
        assert_eq!(recovered, 1);
        let job = catalog.get_vacuum_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, "failed");
        assert_eq!(job.completed_at, Some(9));
    }

    #[tokio::test]
    async fn pack_usage_reports_dead_bytes() {
        let (_temp, catalog) = open_catalog().await;
        catalog
            .register_pack(
                &sum("d1"),
                1000,
                "d1.pack",
                &[entry(0, &sum("a1"), 100), entry(1, &sum("b2"), 200)],
            )
            .await
            .unwrap();
        catalog
            .create_file_version("x", &sum("f1"), 1, &[sum("a1")], true)
            .await
            .unwrap();

        let usage = catalog.pack_usage().await.unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].live_chunks, 1);
        assert_eq!(usage[0].dead_bytes, 200);

        catalog.delete_file_version(&sum("f1")).await.unwrap();
        let usage = catalog.pack_usage().await.unwrap();
        assert_eq!(usage[0].live_chunks, 0);
        assert_eq!(usage[0].dead_bytes, 300);
    }

    #[tokio::test]
    async fn swap_rewritten_pack_repoints_contents() {
        let (_temp, catalog) = open_catalog().await;
        let old_pack_id = catalog
            .register_pack(
                &sum("d1"),
                1000,
                "d1.pack",
                &[entry(0, &sum("a1"), 100), entry(1, &sum("b2"), 200)],
            )
            .await
            .unwrap();
        let outcome = catalog
            .create_file_version("x", &sum("f1"), 1, &[sum("b2")], true)
            .await
            .unwrap();

        let old_live = catalog.live_indexes_for_pack(old_pack_id).await.unwrap();
        assert_eq!(old_live.len(), 1);
        assert_eq!(old_live[0].sum, sum("b2"));

        let new_entries = vec![entry(0, &sum("b2"), 200)];
        let remap = vec![(old_live[0].idx_id, 0u32)];
        let new_pack_id = catalog
            .swap_rewritten_pack(old_pack_id, &sum("d2"), 400, "d2.pack", &new_entries, &remap)
            .await
            .unwrap()
            .expect("remap covers every live entry");

        assert!(catalog.get_pack_by_sum(&sum("d1")).await.unwrap().is_none());
        let contents = catalog.get_file_contents(outcome.version_id).await.unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].pack_id, new_pack_id);
        assert_eq!(contents[0].pack_object_key, "d2.pack");
        assert_eq!(contents[0].chunk_sum, sum("b2"));
    }

    #[tokio::test]
    async fn delete_pack_removes_rows() {
        let (_temp, catalog) = open_catalog().await;
        let pack_id = catalog
            .register_pack(&sum("d1"), 500, "d1.pack", &[entry(0, &sum("a1"), 100)])
            .await
            .unwrap();

        assert!(catalog.delete_pack(pack_id).await.unwrap());
        assert!(catalog.get_pack_by_sum(&sum("d1")).await.unwrap().is_none());
        assert_eq!(
            catalog.chunks_exist(&[sum("a1")]).await.unwrap(),
            vec![false]
        );

        match catalog.delete_pack(pack_id).await {
            Err(CatalogError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_pack_refuses_pack_with_live_references() {
        let (_temp, catalog) = open_catalog().await;
        let pack_id = catalog
            .register_pack(&sum("d1"), 500, "d1.pack", &[entry(0, &sum("a1"), 100)])
            .await
            .unwrap();

        // A version registered after the mark phase would have seen this
        // pack as dead; the delete must notice the new reference and back
        // off without touching anything.
        catalog
            .create_file_version("x", &sum("f1"), 1, &[sum("a1")], true)
            .await
            .unwrap();

        assert!(!catalog.delete_pack(pack_id).await.unwrap());
        assert!(catalog.get_pack_by_sum(&sum("d1")).await.unwrap().is_some());
        assert_eq!(
            catalog.chunks_exist(&[sum("a1")]).await.unwrap(),
            vec![true]
        );
    }

    #[tokio::test]
    async fn swap_rewritten_pack_skips_when_new_reference_appears() {
        let (_temp, catalog) = open_catalog().await;
        let old_pack_id = catalog
            .register_pack(
                &sum("d1"),
                1000,
                "d1.pack",
                &[entry(0, &sum("a1"), 100), entry(1, &sum("b2"), 200)],
            )
            .await
            .unwrap();
        catalog
            .create_file_version("x", &sum("f1"), 1, &[sum("b2")], true)
            .await
            .unwrap();

        // Rewrite snapshot: only b2 was live. Before the swap lands, a new
        // version starts referencing a1 as well.
        let snapshot = catalog.live_indexes_for_pack(old_pack_id).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        let remap = vec![(snapshot[0].idx_id, 0u32)];
        catalog
            .create_file_version("y", &sum("f2"), 2, &[sum("a1")], true)
            .await
            .unwrap();

        let new_entries = vec![entry(0, &sum("b2"), 200)];
        let outcome = catalog
            .swap_rewritten_pack(old_pack_id, &sum("d2"), 400, "d2.pack", &new_entries, &remap)
            .await
            .unwrap();
        assert!(outcome.is_none());

        // The old pack is untouched and both versions still resolve.
        assert!(catalog.get_pack_by_sum(&sum("d1")).await.unwrap().is_some());
        assert!(catalog.get_pack_by_sum(&sum("d2")).await.unwrap().is_none());
        assert_eq!(
            catalog.chunks_exist(&[sum("a1"), sum("b2")]).await.unwrap(),
            vec![true, true]
        );
    }

    #[test]
    fn escape_like_escapes_wildcards() {
        assert_eq!(escape_like("a%b_c\\d"), "a\\%b\\_c\\\\d");
        assert_eq!(escape_like("plain"), "plain");
    }
}
