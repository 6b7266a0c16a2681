#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **soc-store** – SQLite-backed persistence for incidents, events and
//! approvals.
//!
//! This crate owns the schema migration and the low-level row
//! access. Write paths that must participate in the aggregator's
//! single-batch transaction take an explicit `&mut Transaction<'_, Sqlite>`;
//! read paths used by the query layer run directly against the pool since
//! they only ever observe committed state (§4.7).
//!
//! Invariant (I2) — at most one incident per cluster key — is enforced with
//! a unique index on `incidents.cluster_key` plus a retry-on-conflict loop
//! in [`get_or_create_incident`], the first of the two strategies described
//! for concurrent ingests.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Executor, Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;

use soc_types::{ApprovalRow, EventRow, IncidentRow, IncidentStatus};

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite/sqlx failure.
    #[error("storage error: {0}")]
    Sqlx(#[from] sqlx::Error),
    /// A row was expected to exist after a write but could not be re-read.
    /// Should not happen in practice; surfaced rather than panicking.
    #[error("row disappeared after write for cluster_key {0}")]
    RowDisappeared(String),
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Aggregate counters used to derive the metrics endpoint (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCounts {
    /// Total event rows.
    pub events: i64,
    /// Total incident rows.
    pub incidents: i64,
    /// Incidents with status other than `noise`.
    pub incidents_active: i64,
    /// Σ max(0, count_per_cluster − 1) across all incidents.
    pub suppressed_events: i64,
}

/// The SQLite-backed persistence layer.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open or create a SQLite database at the given connection string,
    /// running migrations to ensure the schema is current.
    ///
    /// Connects via `SqliteConnectOptions` with `create_if_missing(true)` so
    /// a fresh process booting against the default, file-backed
    /// `DATABASE_URL` creates the database file instead of failing with
    /// `SQLITE_CANTOPEN`.
    pub async fn open(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// Open or create a SQLite database at a filesystem path.
    pub async fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let url = format!("sqlite://{}", path.as_ref().display());
        Self::open(&url).await
    }

    /// Open an in-memory SQLite database. Useful for tests.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS incidents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cluster_key TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                summary TEXT NOT NULL DEFAULT '',
                count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                last_seen TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                event_type TEXT NOT NULL,
                raw TEXT NOT NULL,
                normalized TEXT NOT NULL,
                redacted TEXT NOT NULL,
                residency_tag TEXT NOT NULL,
                cluster_key TEXT NOT NULL,
                incident_id INTEGER NOT NULL REFERENCES incidents(id),
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS approvals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                incident_id INTEGER NOT NULL REFERENCES incidents(id),
                action_name TEXT NOT NULL,
                approved_by TEXT NOT NULL DEFAULT 'human@operator',
                approved_at TEXT NOT NULL,
                notes TEXT NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_cluster_key ON events(cluster_key)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_incident_id ON events(incident_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_source ON events(source)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_event_type ON events(event_type)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_approvals_incident_id ON approvals(incident_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Start a new transaction. The aggregator opens exactly one of these
    /// per ingest batch and commits it once at the end (§4.6).
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    //─────────────────────────────
    //  Read projections (pool-based, committed state only)
    //─────────────────────────────

    /// List all incidents ordered by `last_seen` descending.
    pub async fn list_incidents(&self) -> Result<Vec<IncidentRow>> {
        let rows = sqlx::query(INCIDENT_COLUMNS_SQL_LIST)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(row_to_incident).collect())
    }

    /// Fetch a single incident by id.
    pub async fn get_incident(&self, id: i64) -> Result<Option<IncidentRow>> {
        let row = sqlx::query(&format!("{INCIDENT_COLUMNS_SQL} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_incident))
    }

    /// Fetch a single incident by its cluster key.
    pub async fn get_incident_by_cluster_key(&self, cluster_key: &str) -> Result<Option<IncidentRow>> {
        fetch_incident_by_key(&self.pool, cluster_key).await
    }

    /// Fetch a single event by id.
    pub async fn get_event(&self, id: i64) -> Result<Option<EventRow>> {
        let row = sqlx::query(&format!("{EVENT_COLUMNS_SQL} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_event))
    }

    /// Most recent `limit` events, newest first.
    pub async fn recent_events(&self, limit: i64) -> Result<Vec<EventRow>> {
        let rows = sqlx::query(&format!("{EVENT_COLUMNS_SQL} ORDER BY id DESC LIMIT ?"))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(row_to_event).collect())
    }

    /// Most recent events for a given incident, newest first.
    pub async fn events_for_incident(&self, incident_id: i64, limit: i64) -> Result<Vec<EventRow>> {
        let rows = sqlx::query(&format!(
            "{EVENT_COLUMNS_SQL} WHERE incident_id = ? ORDER BY id DESC LIMIT ?"
        ))
        .bind(incident_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_event).collect())
    }

    /// All approvals recorded against an incident, oldest first.
    pub async fn approvals_for_incident(&self, incident_id: i64) -> Result<Vec<ApprovalRow>> {
        let rows = sqlx::query(&format!(
            "{APPROVAL_COLUMNS_SQL} WHERE incident_id = ? ORDER BY id ASC"
        ))
        .bind(incident_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_approval).collect())
    }

    /// Aggregate counters for the `/metrics` endpoint.
    pub async fn counts(&self) -> Result<StoreCounts> {
        let events: i64 = sqlx::query("SELECT COUNT(*) AS n FROM events")
            .fetch_one(&self.pool)
            .await?
            .get("n");
        let incidents: i64 = sqlx::query("SELECT COUNT(*) AS n FROM incidents")
            .fetch_one(&self.pool)
            .await?
            .get("n");
        let incidents_active: i64 =
            sqlx::query("SELECT COUNT(*) AS n FROM incidents WHERE status != 'noise'")
                .fetch_one(&self.pool)
                .await?
                .get("n");
        let suppressed_events: i64 = sqlx::query(
            "SELECT COALESCE(SUM(MAX(count - 1, 0)), 0) AS n FROM incidents",
        )
        .fetch_one(&self.pool)
        .await?
        .get("n");

        Ok(StoreCounts {
            events,
            incidents,
            incidents_active,
            suppressed_events,
        })
    }

    /// Insert an approval row. Append-only; returns the new row.
    pub async fn insert_approval(
        &self,
        incident_id: i64,
        action_name: &str,
        notes: &str,
        approved_at: DateTime<Utc>,
    ) -> Result<ApprovalRow> {
        let approved_by = "human@operator";
        let result = sqlx::query(
            "INSERT INTO approvals (incident_id, action_name, approved_by, approved_at, notes) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(incident_id)
        .bind(action_name)
        .bind(approved_by)
        .bind(approved_at)
        .bind(notes)
        .execute(&self.pool)
        .await?;

        Ok(ApprovalRow {
            id: result.last_insert_rowid(),
            incident_id,
            action_name: action_name.to_string(),
            approved_by: approved_by.to_string(),
            approved_at,
            notes: notes.to_string(),
        })
    }
}

//─────────────────────────────
//  Write path (transaction-scoped)
//─────────────────────────────

/// Get the incident for `cluster_key`, creating it if absent.
///
/// On a unique-constraint conflict (a concurrent batch won the race to
/// create the same cluster key) this re-selects the winning row instead of
/// failing — the retry strategy described in §5.
pub async fn get_or_create_incident(
    tx: &mut Transaction<'_, Sqlite>,
    cluster_key: &str,
    title: &str,
    initial_status: IncidentStatus,
    now: DateTime<Utc>,
) -> Result<IncidentRow> {
    if let Some(existing) = fetch_incident_by_key(&mut *tx, cluster_key).await? {
        return Ok(existing);
    }

    let inserted = sqlx::query(
        "INSERT INTO incidents (cluster_key, title, summary, count, status, last_seen) \
         VALUES (?, ?, '', 0, ?, ?)",
    )
    .bind(cluster_key)
    .bind(title)
    .bind(initial_status.as_str())
    .bind(now)
    .execute(&mut *tx)
    .await;

    match inserted {
        Ok(result) => Ok(IncidentRow {
            id: result.last_insert_rowid(),
            cluster_key: cluster_key.to_string(),
            title: title.to_string(),
            summary: String::new(),
            count: 0,
            status: initial_status,
            last_seen: now,
        }),
        Err(e) if is_unique_violation(&e) => {
            fetch_incident_by_key(&mut *tx, cluster_key)
                .await?
                .ok_or_else(|| StoreError::RowDisappeared(cluster_key.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Fields needed to insert a new event row.
pub struct NewEvent<'a> {
    /// Lowercased emitter/source label.
    pub source: &'a str,
    /// Lowercased event type.
    pub event_type: &'a str,
    /// Original message text, or empty when raw-storage is disabled.
    pub raw: &'a str,
    /// Post-normalization text.
    pub normalized: &'a str,
    /// Post-redaction text.
    pub redacted: &'a str,
    /// Two-character residency tag.
    pub residency_tag: &'a str,
    /// Cluster key, denormalized from the parent incident.
    pub cluster_key: &'a str,
    /// Id of the incident this event attaches to.
    pub incident_id: i64,
    /// Insertion timestamp.
    pub created_at: DateTime<Utc>,
}

/// Insert an event row within the caller's transaction.
pub async fn insert_event(tx: &mut Transaction<'_, Sqlite>, e: NewEvent<'_>) -> Result<EventRow> {
    let result = sqlx::query(
        "INSERT INTO events \
         (source, event_type, raw, normalized, redacted, residency_tag, cluster_key, incident_id, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(e.source)
    .bind(e.event_type)
    .bind(e.raw)
    .bind(e.normalized)
    .bind(e.redacted)
    .bind(e.residency_tag)
    .bind(e.cluster_key)
    .bind(e.incident_id)
    .bind(e.created_at)
    .execute(&mut *tx)
    .await?;

    Ok(EventRow {
        id: result.last_insert_rowid(),
        source: e.source.to_string(),
        event_type: e.event_type.to_string(),
        raw: e.raw.to_string(),
        normalized: e.normalized.to_string(),
        redacted: e.redacted.to_string(),
        residency_tag: e.residency_tag.to_string(),
        cluster_key: e.cluster_key.to_string(),
        incident_id: e.incident_id,
        created_at: e.created_at,
    })
}

/// Update an incident's rollup state within the caller's transaction.
pub async fn update_incident_rollup(
    tx: &mut Transaction<'_, Sqlite>,
    incident_id: i64,
    count: i64,
    summary: &str,
    status: IncidentStatus,
    last_seen: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE incidents SET count = ?, summary = ?, status = ?, last_seen = ? WHERE id = ?",
    )
    .bind(count)
    .bind(summary)
    .bind(status.as_str())
    .bind(last_seen)
    .bind(incident_id)
    .execute(&mut *tx)
    .await?;
    Ok(())
}

/// Fetch the most recent `limit` events for a cluster key, newest first,
/// within the caller's transaction — used by the promotion heuristic.
pub async fn recent_events_for_cluster(
    tx: &mut Transaction<'_, Sqlite>,
    cluster_key: &str,
    limit: i64,
) -> Result<Vec<EventRow>> {
    let rows = sqlx::query(&format!(
        "{EVENT_COLUMNS_SQL} WHERE cluster_key = ? ORDER BY id DESC LIMIT ?"
    ))
    .bind(cluster_key)
    .bind(limit)
    .fetch_all(&mut *tx)
    .await?;
    Ok(rows.into_iter().map(row_to_event).collect())
}

//─────────────────────────────
//  Shared helpers
//─────────────────────────────

const INCIDENT_COLUMNS_SQL: &str =
    "SELECT id, cluster_key, title, summary, count, status, last_seen FROM incidents";
const INCIDENT_COLUMNS_SQL_LIST: &str =
    "SELECT id, cluster_key, title, summary, count, status, last_seen FROM incidents ORDER BY last_seen DESC";
const EVENT_COLUMNS_SQL: &str = "SELECT id, source, event_type, raw, normalized, redacted, \
     residency_tag, cluster_key, incident_id, created_at FROM events";
const APPROVAL_COLUMNS_SQL: &str =
    "SELECT id, incident_id, action_name, approved_by, approved_at, notes FROM approvals";

async fn fetch_incident_by_key<'e, E>(executor: E, cluster_key: &str) -> Result<Option<IncidentRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!("{INCIDENT_COLUMNS_SQL} WHERE cluster_key = ?"))
        .bind(cluster_key)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(row_to_incident))
}

fn row_to_incident(row: SqliteRow) -> IncidentRow {
    IncidentRow {
        id: row.get("id"),
        cluster_key: row.get("cluster_key"),
        title: row.get("title"),
        summary: row.get("summary"),
        count: row.get("count"),
        status: IncidentStatus::from_str_lenient(row.get::<String, _>("status").as_str()),
        last_seen: row.get("last_seen"),
    }
}

fn row_to_event(row: SqliteRow) -> EventRow {
    EventRow {
        id: row.get("id"),
        source: row.get("source"),
        event_type: row.get("event_type"),
        raw: row.get("raw"),
        normalized: row.get("normalized"),
        redacted: row.get("redacted"),
        residency_tag: row.get("residency_tag"),
        cluster_key: row.get("cluster_key"),
        incident_id: row.get("incident_id"),
        created_at: row.get("created_at"),
    }
}

fn row_to_approval(row: SqliteRow) -> ApprovalRow {
    ApprovalRow {
        id: row.get("id"),
        incident_id: row.get("incident_id"),
        action_name: row.get("action_name"),
        approved_by: row.get("approved_by"),
        approved_at: row.get("approved_at"),
        notes: row.get("notes"),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err.as_database_error() {
        Some(db_err) => db_err
            .code()
            .map(|code| code == "2067" || code == "1555")
            .unwrap_or(false)
            || db_err.message().contains("UNIQUE constraint failed"),
        None => false,
    }
}
