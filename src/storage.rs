//! SQLite storage layer.
//!
//! Single source of truth for job and worker state. WAL mode for
//! concurrent read access. Every read-then-write sequence runs inside one
//! transaction so concurrent dispatch attempts observe consistent status
//! transitions.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Error, Result};
use crate::model::{Job, JobStatus, Worker, WorkerStatus};

/// Storage backend. Owns the SQLite connection.
pub struct Storage {
    conn: Connection,
}

/// Handle for performing storage operations within a transaction.
///
/// All methods delegate to the same SQL logic as `Storage`, but execute
/// against the transaction's connection. Either all operations commit
/// together or none do.
pub struct TxContext<'a> {
    tx: &'a Connection,
}

impl TxContext<'_> {
    pub fn find_job(&self, expression: &str, owner: &str) -> Result<Option<Job>> {
        find_job_on(self.tx, expression, owner)
    }

    pub fn insert_job(&self, expression: &str, owner: &str) -> Result<Job> {
        insert_job_on(self.tx, expression, owner)
    }

    pub fn get_job(&self, id: i64) -> Result<Job> {
        get_job_on(self.tx, id)
    }

    pub fn update_job_status(&self, id: i64, new_status: JobStatus) -> Result<JobStatus> {
        update_job_status_on(self.tx, id, new_status)
    }

    pub fn complete_job(&self, id: i64, result: i64) -> Result<()> {
        complete_job_on(self.tx, id, result)
    }

    pub fn pending_jobs(&self, owner: &str) -> Result<Vec<Job>> {
        jobs_by_status_on(self.tx, owner, JobStatus::Pending)
    }

    pub fn claim_worker(&self, owner: &str) -> Result<Option<Worker>> {
        claim_worker_on(self.tx, owner)
    }

    pub fn release_worker(&self, id: i64) -> Result<()> {
        set_worker_status_on(self.tx, id, WorkerStatus::Alive)
    }

    pub fn touch_worker(&self, id: i64, owner: &str, now: DateTime<Utc>) -> Result<()> {
        touch_worker_on(self.tx, id, owner, now)
    }

    pub fn stale_workers(&self, cutoff: DateTime<Utc>) -> Result<Vec<Worker>> {
        stale_workers_on(self.tx, cutoff)
    }

    pub fn mark_worker_dead(&self, id: i64) -> Result<()> {
        set_worker_status_on(self.tx, id, WorkerStatus::Dead)
    }

    pub fn recover_interrupted(&self) -> Result<(usize, usize)> {
        recover_interrupted_on(self.tx)
    }
}

impl Storage {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let storage = Self { conn };
        storage.init()?;
        Ok(storage)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self { conn };
        storage.init()?;
        Ok(storage)
    }

    fn init(&self) -> Result<()> {
        // WAL mode for concurrent readers
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS expressions (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                expression  TEXT NOT NULL,
                owner       TEXT NOT NULL,
                status      TEXT NOT NULL DEFAULT 'pending',
                result      INTEGER,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                UNIQUE (expression, owner)
            );

            CREATE INDEX IF NOT EXISTS idx_expr_owner_status
                ON expressions(owner, status);

            CREATE TABLE IF NOT EXISTS agents (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                endpoint    TEXT NOT NULL,
                owner       TEXT NOT NULL,
                status      TEXT NOT NULL DEFAULT 'alive',
                last_ping   TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_agents_owner_status
                ON agents(owner, status);
            ",
        )?;

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Execute a closure within a SQLite transaction.
    ///
    /// The transaction commits if the closure returns Ok, rolls back on Err
    /// (including the early-return paths — the uncommitted transaction is
    /// rolled back when dropped).
    pub fn with_transaction<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&TxContext) -> Result<T>,
    {
        let tx = self.conn.transaction()?;
        let ctx = TxContext { tx: &tx };
        let result = f(&ctx)?;
        tx.commit()?;
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Look up the job for an (expression, owner) pair.
    pub fn find_job(&self, expression: &str, owner: &str) -> Result<Option<Job>> {
        find_job_on(&self.conn, expression, owner)
    }

    /// Get a job by id.
    pub fn get_job(&self, id: i64) -> Result<Job> {
        get_job_on(&self.conn, id)
    }

    /// List an owner's jobs, newest first.
    pub fn list_jobs(&self, owner: &str) -> Result<Vec<Job>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, expression, owner, status, result, created_at, updated_at
             FROM expressions WHERE owner = ?1 ORDER BY id DESC",
        )?;
        let jobs = stmt
            .query_map(params![owner], row_to_job)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// List an owner's jobs still waiting for dispatch.
    pub fn pending_jobs(&self, owner: &str) -> Result<Vec<Job>> {
        jobs_by_status_on(&self.conn, owner, JobStatus::Pending)
    }

    /// Update a job's status. Returns the previous status.
    pub fn update_job_status(&self, id: i64, new_status: JobStatus) -> Result<JobStatus> {
        update_job_status_on(&self.conn, id, new_status)
    }

    // -----------------------------------------------------------------------
    // Workers
    // -----------------------------------------------------------------------

    /// Register a worker, alive, with last_ping = now. Returns its id.
    pub fn insert_worker(&self, endpoint: &str, owner: &str) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO agents (endpoint, owner, status, last_ping) VALUES (?1, ?2, 'alive', ?3)",
            params![endpoint, owner, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Get a worker by id.
    pub fn get_worker(&self, id: i64) -> Result<Worker> {
        self.conn
            .query_row(
                "SELECT id, endpoint, owner, status, last_ping FROM agents WHERE id = ?1",
                params![id],
                row_to_worker,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("worker {id}")))
    }

    /// List all workers for an owner.
    pub fn list_workers(&self, owner: &str) -> Result<Vec<Worker>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, endpoint, owner, status, last_ping
             FROM agents WHERE owner = ?1 ORDER BY id ASC",
        )?;
        let workers = stmt
            .query_map(params![owner], row_to_worker)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(workers)
    }
}

// ---------------------------------------------------------------------------
// Inner functions — accept &Connection so they work with both
// Connection (auto-commit) and Transaction (deref to Connection).
// ---------------------------------------------------------------------------

fn find_job_on(conn: &Connection, expression: &str, owner: &str) -> Result<Option<Job>> {
    conn.query_row(
        "SELECT id, expression, owner, status, result, created_at, updated_at
         FROM expressions WHERE expression = ?1 AND owner = ?2",
        params![expression, owner],
        row_to_job,
    )
    .optional()
    .map_err(Error::from)
}

/// Insert a pending job row. The UNIQUE(expression, owner) index makes this
/// a no-op for a concurrent duplicate; the existing row is returned either
/// way (upsert-by-lookup, never a blind second insert).
fn insert_job_on(conn: &Connection, expression: &str, owner: &str) -> Result<Job> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO expressions (expression, owner, status, created_at, updated_at)
         VALUES (?1, ?2, 'pending', ?3, ?3)
         ON CONFLICT (expression, owner) DO NOTHING",
        params![expression, owner, now],
    )?;
    find_job_on(conn, expression, owner)?
        .ok_or_else(|| Error::Other("job vanished after insert".to_string()))
}

fn get_job_on(conn: &Connection, id: i64) -> Result<Job> {
    conn.query_row(
        "SELECT id, expression, owner, status, result, created_at, updated_at
         FROM expressions WHERE id = ?1",
        params![id],
        row_to_job,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("job {id}")))
}

fn update_job_status_on(conn: &Connection, id: i64, new_status: JobStatus) -> Result<JobStatus> {
    let old_status = get_job_on(conn, id)?.status;

    if !old_status.can_transition_to(new_status) {
        return Err(Error::InvalidTransition {
            from: old_status,
            to: new_status,
        });
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE expressions SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![new_status.to_string(), now, id],
    )?;

    Ok(old_status)
}

/// Store the result and move the job to success in one statement pair.
fn complete_job_on(conn: &Connection, id: i64, result: i64) -> Result<()> {
    update_job_status_on(conn, id, JobStatus::Success)?;
    conn.execute(
        "UPDATE expressions SET result = ?1 WHERE id = ?2",
        params![result, id],
    )?;
    Ok(())
}

fn jobs_by_status_on(conn: &Connection, owner: &str, status: JobStatus) -> Result<Vec<Job>> {
    let mut stmt = conn.prepare(
        "SELECT id, expression, owner, status, result, created_at, updated_at
         FROM expressions WHERE owner = ?1 AND status = ?2 ORDER BY id ASC",
    )?;
    let jobs = stmt
        .query_map(params![owner, status.to_string()], row_to_job)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(jobs)
}

/// First-match worker selection with an in-transaction claim: the `alive`
/// read and the `busy` write commit atomically, so two concurrent
/// dispatches cannot claim the same worker.
fn claim_worker_on(conn: &Connection, owner: &str) -> Result<Option<Worker>> {
    let worker = conn
        .query_row(
            "SELECT id, endpoint, owner, status, last_ping
             FROM agents WHERE owner = ?1 AND status = 'alive'
             ORDER BY id ASC LIMIT 1",
            params![owner],
            row_to_worker,
        )
        .optional()?;

    let Some(mut worker) = worker else {
        return Ok(None);
    };

    set_worker_status_on(conn, worker.id, WorkerStatus::Busy)?;
    worker.status = WorkerStatus::Busy;
    Ok(Some(worker))
}

fn set_worker_status_on(conn: &Connection, id: i64, status: WorkerStatus) -> Result<()> {
    let updated = conn.execute(
        "UPDATE agents SET status = ?1 WHERE id = ?2",
        params![status.to_string(), id],
    )?;
    if updated == 0 {
        return Err(Error::NotFound(format!("worker {id}")));
    }
    Ok(())
}

/// Heartbeat receipt: bump last_ping and revive to alive unless the worker
/// is mid-evaluation. last_ping never moves backwards.
fn touch_worker_on(conn: &Connection, id: i64, owner: &str, now: DateTime<Utc>) -> Result<()> {
    let updated = conn.execute(
        "UPDATE agents
         SET last_ping = max(last_ping, ?1),
             status = CASE WHEN status = 'busy' THEN 'busy' ELSE 'alive' END
         WHERE id = ?2 AND owner = ?3",
        params![now.to_rfc3339(), id, owner],
    )?;
    if updated == 0 {
        return Err(Error::NotFound(format!("worker {id} for owner '{owner}'")));
    }
    Ok(())
}

/// Reset rows left behind by a crash mid-dispatch: every `processing` job
/// goes back to `pending` and every `busy` worker back to `alive`. Run once
/// at startup, before any request is served, so no row is orphaned by a
/// dispatch that never reached its finalizing transaction. Returns the
/// (job, worker) reset counts.
fn recover_interrupted_on(conn: &Connection) -> Result<(usize, usize)> {
    let now = Utc::now().to_rfc3339();
    let jobs = conn.execute(
        "UPDATE expressions SET status = 'pending', updated_at = ?1
         WHERE status = 'processing'",
        params![now],
    )?;
    let workers = conn.execute(
        "UPDATE agents SET status = 'alive' WHERE status = 'busy'",
        [],
    )?;
    Ok((jobs, workers))
}

fn stale_workers_on(conn: &Connection, cutoff: DateTime<Utc>) -> Result<Vec<Worker>> {
    let mut stmt = conn.prepare(
        "SELECT id, endpoint, owner, status, last_ping
         FROM agents WHERE status != 'dead' AND last_ping < ?1",
    )?;
    let workers = stmt
        .query_map(params![cutoff.to_rfc3339()], row_to_worker)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(workers)
}

// ---------------------------------------------------------------------------
// Row parsing helpers
// ---------------------------------------------------------------------------

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let status_str: String = row.get(3)?;
    let created_str: String = row.get(5)?;
    let updated_str: String = row.get(6)?;

    Ok(Job {
        id: row.get(0)?,
        expression: row.get(1)?,
        owner: row.get(2)?,
        status: status_str
            .parse()
            .map_err(|e: String| text_column_error(3, e))?,
        result: row.get(4)?,
        created_at: parse_timestamp(5, &created_str)?,
        updated_at: parse_timestamp(6, &updated_str)?,
    })
}

fn row_to_worker(row: &rusqlite::Row) -> rusqlite::Result<Worker> {
    let status_str: String = row.get(3)?;
    let ping_str: String = row.get(4)?;

    Ok(Worker {
        id: row.get(0)?,
        endpoint: row.get(1)?,
        owner: row.get(2)?,
        status: status_str
            .parse()
            .map_err(|e: String| text_column_error(3, e))?,
        last_ping: parse_timestamp(4, &ping_str)?,
    })
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse()
        .map_err(|e: chrono::ParseError| text_column_error(idx, e.to_string()))
}

fn text_column_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        message.into(),
    )
}
