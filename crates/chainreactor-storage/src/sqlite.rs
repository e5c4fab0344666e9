//! SQLite storage backend for ChainReactor.
//!
//! Persists the cursor, block index, canonical log, projections, consumer
//! offsets, trigger firings, action tasks, and alarms to a single SQLite file.
//! Uses `sqlx` with WAL mode for concurrent read performance.
//!
//! Every multi-row operation runs in one SQLite transaction. Ledger commits
//! and firings open with a write (the cursor compare-and-set, the firing
//! insert), so the write lock is held before anything is read.
//!
//! # Usage
//! ```rust,no_run
//! use chainreactor_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./reactor.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;

use chainreactor_core::action::{ActionTask, ClaimBatch, ClaimRequest, NewTask, TaskFailure, TaskStatus, LEASE_EXPIRED};
use chainreactor_core::alarm::{Alarm, AlarmKind, NewAlarm};
use chainreactor_core::cursor::Cursor;
use chainreactor_core::error::ReactorError;
use chainreactor_core::log::CanonicalLog;
use chainreactor_core::projection::{ProjectionKind, ProjectionRecord, RecordRef, RecordWrite};
use chainreactor_core::store::{
    AlarmStore, CommitSummary, ConsumerStore, LedgerCommit, LedgerStore, ProjectionStore, SkippedEvent,
    TaskStore, TriggerStore,
};
use chainreactor_core::trigger::{FireOutcome, NewFiring, TriggerFiring};
use chainreactor_core::types::{ChainEvent, EventDraft, EventKey, EventStatus, StoredBlock};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS cursors (
        chain                 TEXT    PRIMARY KEY,
        last_confirmed_height INTEGER NOT NULL,
        last_confirmed_hash   TEXT    NOT NULL,
        watermark_height      INTEGER NOT NULL,
        watermark_hash        TEXT    NOT NULL,
        observed_tip_height   INTEGER NOT NULL,
        halted                TEXT,
        version               INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS blocks (
        hash        TEXT    PRIMARY KEY,
        height      INTEGER NOT NULL,
        parent_hash TEXT    NOT NULL,
        timestamp   INTEGER NOT NULL,
        orphaned    INTEGER NOT NULL DEFAULT 0
    );",
    "CREATE INDEX IF NOT EXISTS idx_blocks_height ON blocks (height);",
    "CREATE TABLE IF NOT EXISTS chain_events (
        sequence_id   INTEGER PRIMARY KEY,
        block_height  INTEGER NOT NULL,
        block_hash    TEXT    NOT NULL,
        tx_signature  TEXT    NOT NULL,
        logical_index INTEGER NOT NULL,
        kind          TEXT    NOT NULL,
        payload       TEXT    NOT NULL,
        observed_at   INTEGER NOT NULL,
        status        TEXT    NOT NULL,
        revoked       INTEGER NOT NULL DEFAULT 0,
        UNIQUE (block_hash, tx_signature, logical_index)
    );",
    "CREATE INDEX IF NOT EXISTS idx_events_status ON chain_events (status, sequence_id);",
    "CREATE INDEX IF NOT EXISTS idx_events_height ON chain_events (block_height);",
    "CREATE TABLE IF NOT EXISTS ledger_meta (
        name  TEXT    PRIMARY KEY,
        value INTEGER NOT NULL
    );",
    "INSERT OR IGNORE INTO ledger_meta (name, value) VALUES ('last_sequence_id', 0);",
    "CREATE TABLE IF NOT EXISTS projections (
        kind                     TEXT    NOT NULL,
        key                      TEXT    NOT NULL,
        state                    TEXT    NOT NULL,
        last_applied_sequence_id INTEGER NOT NULL,
        updated_at               INTEGER NOT NULL,
        PRIMARY KEY (kind, key)
    );",
    "CREATE TABLE IF NOT EXISTS consumer_offsets (
        consumer         TEXT    PRIMARY KEY,
        last_sequence_id INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS skipped_events (
        consumer    TEXT    NOT NULL,
        sequence_id INTEGER NOT NULL,
        reason      TEXT    NOT NULL,
        recorded_at INTEGER NOT NULL,
        PRIMARY KEY (consumer, sequence_id)
    );",
    "CREATE TABLE IF NOT EXISTS trigger_firings (
        firing_id               INTEGER PRIMARY KEY AUTOINCREMENT,
        rule_id                 TEXT    NOT NULL,
        chain_event_sequence_id INTEGER NOT NULL,
        fired_at                INTEGER NOT NULL,
        status                  TEXT    NOT NULL,
        UNIQUE (rule_id, chain_event_sequence_id)
    );",
    "CREATE TABLE IF NOT EXISTS action_tasks (
        task_id           INTEGER PRIMARY KEY AUTOINCREMENT,
        trigger_firing_id INTEGER NOT NULL REFERENCES trigger_firings (firing_id),
        rule_id           TEXT    NOT NULL,
        sequence_id       INTEGER NOT NULL,
        action            TEXT    NOT NULL,
        payload           TEXT    NOT NULL,
        idempotency_key   TEXT    NOT NULL UNIQUE,
        attempt           INTEGER NOT NULL DEFAULT 0,
        next_retry_at     INTEGER NOT NULL,
        lease_until       INTEGER,
        status            TEXT    NOT NULL,
        last_error        TEXT,
        receipt           TEXT,
        updated_at        INTEGER NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_tasks_due ON action_tasks (status, next_retry_at);",
    "CREATE TABLE IF NOT EXISTS alarms (
        alarm_id    INTEGER PRIMARY KEY AUTOINCREMENT,
        kind        TEXT    NOT NULL,
        message     TEXT    NOT NULL,
        sequence_id INTEGER,
        raised_at   INTEGER NOT NULL
    );",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_alarms_event ON alarms (kind, sequence_id)
        WHERE sequence_id IS NOT NULL;",
];

const CURSOR_COLUMNS: &str = "chain, last_confirmed_height, last_confirmed_hash, watermark_height, \
     watermark_hash, observed_tip_height, halted, version";
const BLOCK_COLUMNS: &str = "hash, height, parent_hash, timestamp, orphaned";
const EVENT_COLUMNS: &str = "sequence_id, block_height, block_hash, tx_signature, logical_index, \
     kind, payload, observed_at, status, revoked";
const RECORD_COLUMNS: &str = "kind, key, state, last_applied_sequence_id, updated_at";
const FIRING_COLUMNS: &str = "firing_id, rule_id, chain_event_sequence_id, fired_at, status";
const TASK_COLUMNS: &str = "task_id, trigger_firing_id, rule_id, sequence_id, action, payload, \
     idempotency_key, attempt, next_retry_at, lease_until, status, last_error, receipt, updated_at";
const ALARM_COLUMNS: &str = "alarm_id, kind, message, sequence_id, raised_at";

fn storage(e: sqlx::Error) -> ReactorError {
    ReactorError::Storage(e.to_string())
}

/// SQLite-backed implementation of every store trait.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./reactor.db"`) or a full
    /// SQLite URL (`"sqlite:./reactor.db"`).
    pub async fn open(path: &str) -> Result<Self, ReactorError> {
        let options = if path.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(path).map_err(storage)?
        } else {
            SqliteConnectOptions::new().filename(path)
        }
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(storage)?;
        debug!(path, "opened sqlite store");

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// A single connection is kept for the pool's lifetime, since every
    /// in-memory connection is its own database. Data is lost on drop.
    pub async fn in_memory() -> Result<Self, ReactorError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(storage)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(storage)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<(), ReactorError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await.map_err(storage)?;
        }
        Ok(())
    }
}

// ─── Row mapping ──────────────────────────────────────────────────────────────

fn cursor_from_row(row: &SqliteRow) -> Result<Cursor, ReactorError> {
    Ok(Cursor {
        chain: row.try_get("chain").map_err(storage)?,
        last_confirmed_height: row.try_get::<i64, _>("last_confirmed_height").map_err(storage)? as u64,
        last_confirmed_hash: row.try_get("last_confirmed_hash").map_err(storage)?,
        watermark_height: row.try_get::<i64, _>("watermark_height").map_err(storage)? as u64,
        watermark_hash: row.try_get("watermark_hash").map_err(storage)?,
        observed_tip_height: row.try_get::<i64, _>("observed_tip_height").map_err(storage)? as u64,
        halted: row.try_get("halted").map_err(storage)?,
        version: row.try_get::<i64, _>("version").map_err(storage)? as u64,
    })
}

fn block_from_row(row: &SqliteRow) -> Result<StoredBlock, ReactorError> {
    Ok(StoredBlock {
        height: row.try_get::<i64, _>("height").map_err(storage)? as u64,
        hash: row.try_get("hash").map_err(storage)?,
        parent_hash: row.try_get("parent_hash").map_err(storage)?,
        timestamp: row.try_get("timestamp").map_err(storage)?,
        orphaned: row.try_get("orphaned").map_err(storage)?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<ChainEvent, ReactorError> {
    let payload: String = row.try_get("payload").map_err(storage)?;
    let status: String = row.try_get("status").map_err(storage)?;
    Ok(ChainEvent {
        sequence_id: row.try_get::<i64, _>("sequence_id").map_err(storage)? as u64,
        block_height: row.try_get::<i64, _>("block_height").map_err(storage)? as u64,
        block_hash: row.try_get("block_hash").map_err(storage)?,
        tx_signature: row.try_get("tx_signature").map_err(storage)?,
        logical_index: row.try_get::<i64, _>("logical_index").map_err(storage)? as u32,
        kind: row.try_get("kind").map_err(storage)?,
        payload: serde_json::from_str(&payload)?,
        observed_at: row.try_get("observed_at").map_err(storage)?,
        status: status.parse()?,
        revoked: row.try_get("revoked").map_err(storage)?,
    })
}

fn record_from_row(row: &SqliteRow) -> Result<ProjectionRecord, ReactorError> {
    let kind: String = row.try_get("kind").map_err(storage)?;
    let state: String = row.try_get("state").map_err(storage)?;
    Ok(ProjectionRecord {
        kind: kind.parse()?,
        key: row.try_get("key").map_err(storage)?,
        state: serde_json::from_str(&state)?,
        last_applied_sequence_id: row.try_get::<i64, _>("last_applied_sequence_id").map_err(storage)? as u64,
        updated_at: row.try_get("updated_at").map_err(storage)?,
    })
}

fn firing_from_row(row: &SqliteRow) -> Result<TriggerFiring, ReactorError> {
    let status: String = row.try_get("status").map_err(storage)?;
    Ok(TriggerFiring {
        firing_id: row.try_get::<i64, _>("firing_id").map_err(storage)? as u64,
        rule_id: row.try_get("rule_id").map_err(storage)?,
        chain_event_sequence_id: row.try_get::<i64, _>("chain_event_sequence_id").map_err(storage)? as u64,
        fired_at: row.try_get("fired_at").map_err(storage)?,
        status: status.parse()?,
    })
}

fn task_from_row(row: &SqliteRow) -> Result<ActionTask, ReactorError> {
    let action: String = row.try_get("action").map_err(storage)?;
    let payload: String = row.try_get("payload").map_err(storage)?;
    let status: String = row.try_get("status").map_err(storage)?;
    Ok(ActionTask {
        task_id: row.try_get::<i64, _>("task_id").map_err(storage)? as u64,
        trigger_firing_id: row.try_get::<i64, _>("trigger_firing_id").map_err(storage)? as u64,
        rule_id: row.try_get("rule_id").map_err(storage)?,
        sequence_id: row.try_get::<i64, _>("sequence_id").map_err(storage)? as u64,
        action: serde_json::from_str(&action)?,
        payload: serde_json::from_str(&payload)?,
        idempotency_key: row.try_get("idempotency_key").map_err(storage)?,
        attempt: row.try_get::<i64, _>("attempt").map_err(storage)? as u32,
        next_retry_at: row.try_get("next_retry_at").map_err(storage)?,
        lease_until: row.try_get("lease_until").map_err(storage)?,
        status: status.parse()?,
        last_error: row.try_get("last_error").map_err(storage)?,
        receipt: row.try_get("receipt").map_err(storage)?,
        updated_at: row.try_get("updated_at").map_err(storage)?,
    })
}

fn alarm_from_row(row: &SqliteRow) -> Result<Alarm, ReactorError> {
    let kind: String = row.try_get("kind").map_err(storage)?;
    Ok(Alarm {
        alarm_id: row.try_get::<i64, _>("alarm_id").map_err(storage)? as u64,
        kind: AlarmKind::from_str(&kind)?,
        message: row.try_get("message").map_err(storage)?,
        sequence_id: row.try_get::<Option<i64>, _>("sequence_id").map_err(storage)?.map(|s| s as u64),
        raised_at: row.try_get("raised_at").map_err(storage)?,
    })
}

// ─── Statements shared by transactions ────────────────────────────────────────

/// Whether an append created (or revived) an event.
enum Appended {
    New,
    Existing,
}

async fn next_sequence_id(conn: &mut SqliteConnection) -> Result<u64, ReactorError> {
    let value: i64 = sqlx::query_scalar(
        "UPDATE ledger_meta SET value = value + 1 WHERE name = 'last_sequence_id' RETURNING value",
    )
    .fetch_one(&mut *conn)
    .await
    .map_err(storage)?;
    Ok(value as u64)
}

async fn append_draft(conn: &mut SqliteConnection, draft: EventDraft) -> Result<(Appended, ChainEvent), ReactorError> {
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM chain_events
         WHERE block_hash = ? AND tx_signature = ? AND logical_index = ?"
    );
    let existing = sqlx::query(&sql)
        .bind(&draft.block_hash)
        .bind(&draft.tx_signature)
        .bind(draft.logical_index as i64)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage)?;

    if let Some(row) = existing {
        let mut event = event_from_row(&row)?;
        let orphaned: Option<bool> = sqlx::query_scalar("SELECT orphaned FROM blocks WHERE hash = ?")
            .bind(&draft.block_hash)
            .fetch_optional(&mut *conn)
            .await
            .map_err(storage)?;
        let revivable = event.status == EventStatus::Orphaned && !event.revoked;
        if !(revivable && orphaned == Some(false)) {
            return Ok((Appended::Existing, event));
        }

        let sequence_id = next_sequence_id(conn).await?;
        sqlx::query("UPDATE chain_events SET sequence_id = ?, status = 'provisional' WHERE sequence_id = ?")
            .bind(sequence_id as i64)
            .bind(event.sequence_id as i64)
            .execute(&mut *conn)
            .await
            .map_err(storage)?;
        debug!(old = event.sequence_id, new = sequence_id, "revived event");
        event.sequence_id = sequence_id;
        event.status = EventStatus::Provisional;
        return Ok((Appended::New, event));
    }

    let sequence_id = next_sequence_id(conn).await?;
    let event = ChainEvent::from_draft(draft, sequence_id);
    sqlx::query(
        "INSERT INTO chain_events
            (sequence_id, block_height, block_hash, tx_signature, logical_index,
             kind, payload, observed_at, status, revoked)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
    )
    .bind(event.sequence_id as i64)
    .bind(event.block_height as i64)
    .bind(&event.block_hash)
    .bind(&event.tx_signature)
    .bind(event.logical_index as i64)
    .bind(&event.kind)
    .bind(serde_json::to_string(&event.payload)?)
    .bind(event.observed_at)
    .bind(event.status.as_str())
    .execute(&mut *conn)
    .await
    .map_err(storage)?;
    Ok((Appended::New, event))
}

async fn orphan_blocks(conn: &mut SqliteConnection, hashes: &[String]) -> Result<(u64, Vec<u64>), ReactorError> {
    let mut changed = 0;
    let mut revoked = Vec::new();
    for hash in hashes {
        sqlx::query("UPDATE blocks SET orphaned = 1 WHERE hash = ?")
            .bind(hash)
            .execute(&mut *conn)
            .await
            .map_err(storage)?;

        let confirmed: Vec<i64> = sqlx::query_scalar(
            "SELECT sequence_id FROM chain_events
             WHERE block_hash = ? AND status = 'confirmed' ORDER BY sequence_id",
        )
        .bind(hash)
        .fetch_all(&mut *conn)
        .await
        .map_err(storage)?;
        revoked.extend(confirmed.into_iter().map(|s| s as u64));

        let result = sqlx::query(
            "UPDATE chain_events
             SET revoked = CASE WHEN status = 'confirmed' THEN 1 ELSE revoked END,
                 status  = 'orphaned'
             WHERE block_hash = ? AND status != 'orphaned'",
        )
        .bind(hash)
        .execute(&mut *conn)
        .await
        .map_err(storage)?;
        changed += result.rows_affected();
    }
    Ok((changed, revoked))
}

async fn adopt_block(conn: &mut SqliteConnection, block: &StoredBlock) -> Result<(), ReactorError> {
    sqlx::query(
        "INSERT INTO blocks (hash, height, parent_hash, timestamp, orphaned)
         VALUES (?, ?, ?, ?, 0)
         ON CONFLICT (hash) DO UPDATE SET
            height      = excluded.height,
            parent_hash = excluded.parent_hash,
            timestamp   = excluded.timestamp,
            orphaned    = 0",
    )
    .bind(&block.hash)
    .bind(block.height as i64)
    .bind(&block.parent_hash)
    .bind(block.timestamp)
    .execute(&mut *conn)
    .await
    .map_err(storage)?;
    Ok(())
}

async fn confirm_up_to(conn: &mut SqliteConnection, height: u64) -> Result<u64, ReactorError> {
    let result = sqlx::query(
        "UPDATE chain_events SET status = 'confirmed'
         WHERE status = 'provisional' AND block_height <= ?",
    )
    .bind(height as i64)
    .execute(&mut *conn)
    .await
    .map_err(storage)?;
    Ok(result.rows_affected())
}

async fn insert_alarm(conn: &mut SqliteConnection, alarm: &NewAlarm) -> Result<bool, ReactorError> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO alarms (kind, message, sequence_id, raised_at) VALUES (?, ?, ?, ?)",
    )
    .bind(alarm.kind.as_str())
    .bind(&alarm.message)
    .bind(alarm.sequence_id.map(|s| s as i64))
    .bind(alarm.raised_at)
    .execute(&mut *conn)
    .await
    .map_err(storage)?;
    Ok(result.rows_affected() == 1)
}

/// Compare-and-set the cursor row. Returns the stored version on conflict.
async fn write_cursor(
    conn: &mut SqliteConnection,
    cursor: &Cursor,
    expected_version: u64,
) -> Result<Option<u64>, ReactorError> {
    let version = (expected_version + 1) as i64;
    let result = if expected_version == 0 {
        sqlx::query(
            "INSERT INTO cursors
                (chain, last_confirmed_height, last_confirmed_hash, watermark_height,
                 watermark_hash, observed_tip_height, halted, version)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (chain) DO NOTHING",
        )
        .bind(&cursor.chain)
        .bind(cursor.last_confirmed_height as i64)
        .bind(&cursor.last_confirmed_hash)
        .bind(cursor.watermark_height as i64)
        .bind(&cursor.watermark_hash)
        .bind(cursor.observed_tip_height as i64)
        .bind(&cursor.halted)
        .bind(version)
        .execute(&mut *conn)
        .await
    } else {
        sqlx::query(
            "UPDATE cursors SET
                last_confirmed_height = ?, last_confirmed_hash = ?, watermark_height = ?,
                watermark_hash = ?, observed_tip_height = ?, halted = ?, version = ?
             WHERE chain = ? AND version = ?",
        )
        .bind(cursor.last_confirmed_height as i64)
        .bind(&cursor.last_confirmed_hash)
        .bind(cursor.watermark_height as i64)
        .bind(&cursor.watermark_hash)
        .bind(cursor.observed_tip_height as i64)
        .bind(&cursor.halted)
        .bind(version)
        .bind(&cursor.chain)
        .bind(expected_version as i64)
        .execute(&mut *conn)
        .await
    }
    .map_err(storage)?;

    if result.rows_affected() == 1 {
        return Ok(None);
    }
    let found: Option<i64> = sqlx::query_scalar("SELECT version FROM cursors WHERE chain = ?")
        .bind(&cursor.chain)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage)?;
    Ok(Some(found.unwrap_or(0) as u64))
}

// ─── Canonical log ────────────────────────────────────────────────────────────

#[async_trait]
impl CanonicalLog for SqliteStorage {
    async fn append(&self, draft: EventDraft) -> Result<ChainEvent, ReactorError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let (_, event) = append_draft(&mut tx, draft).await?;
        tx.commit().await.map_err(storage)?;
        Ok(event)
    }

    async fn mark_orphaned(&self, block_hashes: &[String]) -> Result<u64, ReactorError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let (changed, _) = orphan_blocks(&mut tx, block_hashes).await?;
        tx.commit().await.map_err(storage)?;
        Ok(changed)
    }

    async fn mark_confirmed(&self, up_to_height: u64) -> Result<u64, ReactorError> {
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        confirm_up_to(&mut conn, up_to_height).await
    }

    async fn confirmed_since(&self, after: u64, limit: usize) -> Result<Vec<ChainEvent>, ReactorError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM chain_events
             WHERE sequence_id > ? AND status = 'confirmed'
             ORDER BY sequence_id LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(after as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn event(&self, sequence_id: u64) -> Result<Option<ChainEvent>, ReactorError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM chain_events WHERE sequence_id = ?");
        let row = sqlx::query(&sql)
            .bind(sequence_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn event_by_key(&self, key: &EventKey) -> Result<Option<ChainEvent>, ReactorError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM chain_events
             WHERE block_hash = ? AND tx_signature = ? AND logical_index = ?"
        );
        let row = sqlx::query(&sql)
            .bind(&key.block_hash)
            .bind(&key.tx_signature)
            .bind(key.logical_index as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn events_in_block(&self, block_hash: &str) -> Result<Vec<ChainEvent>, ReactorError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM chain_events WHERE block_hash = ? ORDER BY sequence_id");
        let rows = sqlx::query(&sql)
            .bind(block_hash)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn revoked_events(&self) -> Result<Vec<ChainEvent>, ReactorError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM chain_events WHERE revoked = 1 ORDER BY sequence_id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await.map_err(storage)?;
        rows.iter().map(event_from_row).collect()
    }
}

// ─── Ledger ───────────────────────────────────────────────────────────────────

#[async_trait]
impl LedgerStore for SqliteStorage {
    async fn load_cursor(&self, chain: &str) -> Result<Option<Cursor>, ReactorError> {
        let sql = format!("SELECT {CURSOR_COLUMNS} FROM cursors WHERE chain = ?");
        let row = sqlx::query(&sql)
            .bind(chain)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(cursor_from_row).transpose()
    }

    async fn canonical_blocks_from(&self, from_height: u64) -> Result<Vec<StoredBlock>, ReactorError> {
        let sql = format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE orphaned = 0 AND height >= ? ORDER BY height"
        );
        let rows = sqlx::query(&sql)
            .bind(from_height as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(block_from_row).collect()
    }

    async fn block_by_hash(&self, hash: &str) -> Result<Option<StoredBlock>, ReactorError> {
        let sql = format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE hash = ?");
        let row = sqlx::query(&sql)
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(block_from_row).transpose()
    }

    async fn commit(&self, commit: LedgerCommit) -> Result<CommitSummary, ReactorError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        // Cursor first: a stale writer fails before touching anything else.
        if let Some(found) = write_cursor(&mut tx, &commit.cursor, commit.expected_version).await? {
            return Err(ReactorError::VersionConflict {
                expected: commit.expected_version,
                found,
            });
        }

        let mut summary = CommitSummary {
            cursor_version: commit.expected_version + 1,
            ..Default::default()
        };
        let (orphaned, revoked) = orphan_blocks(&mut tx, &commit.orphan_blocks).await?;
        summary.orphaned = orphaned;
        summary.revoked = revoked;

        for block in &commit.adopt_blocks {
            adopt_block(&mut tx, block).await?;
        }
        for draft in commit.events {
            match append_draft(&mut tx, draft).await?.0 {
                Appended::New => summary.appended += 1,
                Appended::Existing => summary.duplicates += 1,
            }
        }
        if let Some(height) = commit.confirm_up_to {
            summary.confirmed = confirm_up_to(&mut tx, height).await?;
        }
        for alarm in &commit.alarms {
            insert_alarm(&mut tx, alarm).await?;
        }

        tx.commit().await.map_err(storage)?;
        debug!(
            chain = %commit.cursor.chain,
            version = summary.cursor_version,
            appended = summary.appended,
            orphaned = summary.orphaned,
            confirmed = summary.confirmed,
            "ledger commit"
        );
        Ok(summary)
    }
}

// ─── Projections ──────────────────────────────────────────────────────────────

#[async_trait]
impl ProjectionStore for SqliteStorage {
    async fn load_record(&self, target: &RecordRef) -> Result<Option<ProjectionRecord>, ReactorError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM projections WHERE kind = ? AND key = ?");
        let row = sqlx::query(&sql)
            .bind(target.kind.as_str())
            .bind(&target.key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn write_records(&self, writes: Vec<RecordWrite>) -> Result<bool, ReactorError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        for w in &writes {
            let state = serde_json::to_string(&w.state)?;
            let result = match w.expected_sequence_id {
                None => sqlx::query(
                    "INSERT INTO projections (kind, key, state, last_applied_sequence_id, updated_at)
                     VALUES (?, ?, ?, ?, ?)
                     ON CONFLICT (kind, key) DO NOTHING",
                )
                .bind(w.target.kind.as_str())
                .bind(&w.target.key)
                .bind(state)
                .bind(w.sequence_id as i64)
                .bind(w.updated_at)
                .execute(&mut *tx)
                .await,
                Some(expected) => sqlx::query(
                    "UPDATE projections SET state = ?, last_applied_sequence_id = ?, updated_at = ?
                     WHERE kind = ? AND key = ? AND last_applied_sequence_id = ?",
                )
                .bind(state)
                .bind(w.sequence_id as i64)
                .bind(w.updated_at)
                .bind(w.target.kind.as_str())
                .bind(&w.target.key)
                .bind(expected as i64)
                .execute(&mut *tx)
                .await,
            }
            .map_err(storage)?;

            if result.rows_affected() == 0 {
                // Dropping the transaction rolls back the earlier writes.
                return Ok(false);
            }
        }
        tx.commit().await.map_err(storage)?;
        Ok(true)
    }

    async fn records(&self, kind: ProjectionKind) -> Result<Vec<ProjectionRecord>, ReactorError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM projections WHERE kind = ? ORDER BY key");
        let rows = sqlx::query(&sql)
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(record_from_row).collect()
    }
}

// ─── Consumers ────────────────────────────────────────────────────────────────

#[async_trait]
impl ConsumerStore for SqliteStorage {
    async fn load_offset(&self, consumer: &str) -> Result<u64, ReactorError> {
        let offset: Option<i64> =
            sqlx::query_scalar("SELECT last_sequence_id FROM consumer_offsets WHERE consumer = ?")
                .bind(consumer)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;
        Ok(offset.unwrap_or(0) as u64)
    }

    async fn save_offset(&self, consumer: &str, sequence_id: u64) -> Result<(), ReactorError> {
        sqlx::query(
            "INSERT INTO consumer_offsets (consumer, last_sequence_id) VALUES (?, ?)
             ON CONFLICT (consumer) DO UPDATE SET
                last_sequence_id = MAX(last_sequence_id, excluded.last_sequence_id)",
        )
        .bind(consumer)
        .bind(sequence_id as i64)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn record_skipped(&self, skipped: SkippedEvent) -> Result<(), ReactorError> {
        sqlx::query(
            "INSERT OR IGNORE INTO skipped_events (consumer, sequence_id, reason, recorded_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&skipped.consumer)
        .bind(skipped.sequence_id as i64)
        .bind(&skipped.reason)
        .bind(skipped.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn skipped_count(&self) -> Result<u64, ReactorError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM skipped_events")
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        Ok(count as u64)
    }
}

// ─── Triggers & tasks ─────────────────────────────────────────────────────────

#[async_trait]
impl TriggerStore for SqliteStorage {
    async fn fire(&self, firing: NewFiring, task: NewTask) -> Result<FireOutcome, ReactorError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let inserted = sqlx::query(
            "INSERT INTO trigger_firings (rule_id, chain_event_sequence_id, fired_at, status)
             VALUES (?, ?, ?, 'enqueued')
             ON CONFLICT (rule_id, chain_event_sequence_id) DO NOTHING",
        )
        .bind(&firing.rule_id)
        .bind(firing.sequence_id as i64)
        .bind(firing.fired_at)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        if inserted.rows_affected() == 0 {
            let firing_id: i64 = sqlx::query_scalar(
                "SELECT firing_id FROM trigger_firings WHERE rule_id = ? AND chain_event_sequence_id = ?",
            )
            .bind(&firing.rule_id)
            .bind(firing.sequence_id as i64)
            .fetch_one(&mut *tx)
            .await
            .map_err(storage)?;
            return Ok(FireOutcome::AlreadyFired {
                firing_id: firing_id as u64,
            });
        }
        let firing_id = inserted.last_insert_rowid();

        let task_row = sqlx::query(
            "INSERT INTO action_tasks
                (trigger_firing_id, rule_id, sequence_id, action, payload, idempotency_key,
                 attempt, next_retry_at, status, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 0, ?, 'queued', ?)",
        )
        .bind(firing_id)
        .bind(&firing.rule_id)
        .bind(firing.sequence_id as i64)
        .bind(serde_json::to_string(&task.action)?)
        .bind(serde_json::to_string(&task.payload)?)
        .bind(&task.idempotency_key)
        .bind(task.next_retry_at)
        .bind(firing.fired_at)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;
        let task_id = task_row.last_insert_rowid();

        tx.commit().await.map_err(storage)?;
        Ok(FireOutcome::Fired {
            firing_id: firing_id as u64,
            task_id: task_id as u64,
        })
    }

    async fn firing(&self, rule_id: &str, sequence_id: u64) -> Result<Option<TriggerFiring>, ReactorError> {
        let sql = format!(
            "SELECT {FIRING_COLUMNS} FROM trigger_firings WHERE rule_id = ? AND chain_event_sequence_id = ?"
        );
        let row = sqlx::query(&sql)
            .bind(rule_id)
            .bind(sequence_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(firing_from_row).transpose()
    }

    async fn firings(&self) -> Result<Vec<TriggerFiring>, ReactorError> {
        let sql = format!("SELECT {FIRING_COLUMNS} FROM trigger_firings ORDER BY firing_id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await.map_err(storage)?;
        rows.iter().map(firing_from_row).collect()
    }
}

#[async_trait]
impl TaskStore for SqliteStorage {
    async fn claim_due(&self, request: ClaimRequest) -> Result<ClaimBatch, ReactorError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        // Lapsed claims count as failed attempts before anything is handed out.
        let sql = format!(
            "UPDATE action_tasks SET
                attempt = attempt + 1, last_error = ?, lease_until = NULL, updated_at = ?,
                status = CASE WHEN attempt + 1 >= ? THEN 'dead' ELSE 'failed' END
             WHERE status = 'executing' AND lease_until IS NOT NULL AND lease_until <= ?
             RETURNING {TASK_COLUMNS}"
        );
        let expired = sqlx::query(&sql)
            .bind(LEASE_EXPIRED)
            .bind(request.now)
            .bind(request.max_attempts as i64)
            .bind(request.now)
            .fetch_all(&mut *tx)
            .await
            .map_err(storage)?;
        let mut dead_lettered = Vec::new();
        for row in &expired {
            let task = task_from_row(row)?;
            if task.status == TaskStatus::Dead {
                dead_lettered.push(task);
            }
        }
        dead_lettered.sort_by_key(|t| t.task_id);

        let sql = format!(
            "UPDATE action_tasks SET status = 'executing', lease_until = ?, updated_at = ?
             WHERE task_id IN (
                SELECT task_id FROM action_tasks
                WHERE status IN ('queued', 'failed') AND next_retry_at <= ?
                ORDER BY next_retry_at, task_id
                LIMIT ?
             )
             RETURNING {TASK_COLUMNS}"
        );
        let rows = sqlx::query(&sql)
            .bind(request.lease_until)
            .bind(request.now)
            .bind(request.now)
            .bind(request.limit as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(storage)?;
        let mut tasks = rows.iter().map(task_from_row).collect::<Result<Vec<_>, _>>()?;
        tasks.sort_by_key(|t| (t.next_retry_at, t.task_id));

        tx.commit().await.map_err(storage)?;
        Ok(ClaimBatch { tasks, dead_lettered })
    }

    async fn complete_task(&self, task_id: u64, attempt: u32, receipt: &str, at: i64) -> Result<bool, ReactorError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let result = sqlx::query(
            "UPDATE action_tasks SET status = 'succeeded', lease_until = NULL, receipt = ?, updated_at = ?
             WHERE task_id = ? AND status = 'executing' AND attempt = ?",
        )
        .bind(receipt)
        .bind(at)
        .bind(task_id as i64)
        .bind(attempt as i64)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            "UPDATE trigger_firings SET status = 'completed'
             WHERE firing_id = (SELECT trigger_firing_id FROM action_tasks WHERE task_id = ?)",
        )
        .bind(task_id as i64)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        Ok(true)
    }

    async fn fail_task(&self, task_id: u64, failure: TaskFailure) -> Result<bool, ReactorError> {
        let result = sqlx::query(
            "UPDATE action_tasks SET
                attempt = ?, status = ?, next_retry_at = ?, last_error = ?,
                lease_until = NULL, updated_at = ?
             WHERE task_id = ? AND status = 'executing' AND attempt = ?",
        )
        .bind(failure.attempt as i64)
        .bind(failure.status.as_str())
        .bind(failure.next_retry_at)
        .bind(&failure.error)
        .bind(failure.at)
        .bind(task_id as i64)
        .bind(failure.attempt.saturating_sub(1) as i64)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected() == 1)
    }

    async fn task(&self, task_id: u64) -> Result<Option<ActionTask>, ReactorError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM action_tasks WHERE task_id = ?");
        let row = sqlx::query(&sql)
            .bind(task_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<ActionTask>, ReactorError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM action_tasks WHERE status = ? ORDER BY task_id");
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(task_from_row).collect()
    }

    async fn count_tasks(&self, status: TaskStatus) -> Result<u64, ReactorError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM action_tasks WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        Ok(count as u64)
    }
}

// ─── Alarms ───────────────────────────────────────────────────────────────────

#[async_trait]
impl AlarmStore for SqliteStorage {
    async fn raise_alarm(&self, alarm: NewAlarm) -> Result<bool, ReactorError> {
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        insert_alarm(&mut conn, &alarm).await
    }

    async fn last_alarm(&self) -> Result<Option<Alarm>, ReactorError> {
        let sql = format!("SELECT {ALARM_COLUMNS} FROM alarms ORDER BY alarm_id DESC LIMIT 1");
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await.map_err(storage)?;
        row.as_ref().map(alarm_from_row).transpose()
    }

    async fn alarms(&self) -> Result<Vec<Alarm>, ReactorError> {
        let sql = format!("SELECT {ALARM_COLUMNS} FROM alarms ORDER BY alarm_id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await.map_err(storage)?;
        rows.iter().map(alarm_from_row).collect()
    }
}
