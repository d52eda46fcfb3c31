//! Persistent strategy store backed by SQLite.

use super::{Status, Strategy};
use crate::error::TuneError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A strategy handed to the run controller.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledStrategy {
    pub strategy: Strategy,
    /// Status the entry had when it was picked; `Ready` asks for a smoke test.
    pub status: Status,
    /// How many times this entry has been sampled, this one included.
    pub attempts: u32,
}

/// A strategy to insert into the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewStrategy {
    pub name: String,
    pub dataset_idx: usize,
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Skip the pipeline check and go straight to training.
    #[serde(default)]
    pub skip_check: bool,
}

/// A full store row, for listing.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyRecord {
    pub strategy: Strategy,
    pub status: Status,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

/// Read/write access to candidate strategies.
#[async_trait]
pub trait StrategyStore: Send + Sync {
    /// Pick the next strategy and mark it in progress.
    ///
    /// Entries awaiting a pipeline check are preferred over runnable ones.
    /// Returns `None` when nothing is eligible.
    async fn sample(&self) -> Result<Option<SampledStrategy>, TuneError>;

    async fn mark(&self, id: i64, status: Status) -> Result<(), TuneError>;

    async fn add(&self, strategy: NewStrategy) -> Result<i64, TuneError>;

    async fn list(&self) -> Result<Vec<StrategyRecord>, TuneError>;

    async fn get(&self, id: i64) -> Result<Option<StrategyRecord>, TuneError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS strategies (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT    NOT NULL,
    dataset_idx INTEGER NOT NULL DEFAULT 0,
    params      TEXT    NOT NULL DEFAULT '{}',
    status      TEXT    NOT NULL DEFAULT 'READY',
    attempts    INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT    NOT NULL,
    updated_at  TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_strategies_status ON strategies(status);
";

/// SQLite strategy store. Each call opens its own connection on a blocking
/// thread, so several controllers can share one database file.
#[derive(Debug, Clone)]
pub struct SqliteStrategyStore {
    path: PathBuf,
}

impl SqliteStrategyStore {
    /// Open (and create if needed) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, TuneError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| TuneError::store(format!("cannot open {}: {e}", path.display())))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, TuneError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, TuneError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Connection::open(&path)
                .map_err(|e| TuneError::store(format!("cannot open {}: {e}", path.display())))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| TuneError::store(format!("store task join error: {e}")))?
    }
}

type RawRow = (i64, String, i64, String, String, i64, String);

const SELECT_COLUMNS: &str = "id, name, dataset_idx, params, status, attempts, updated_at";

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_row(raw: RawRow) -> Result<StrategyRecord, TuneError> {
    let (id, name, dataset_idx, params, status, attempts, updated_at) = raw;
    let params: Map<String, Value> = serde_json::from_str(&params)
        .map_err(|e| TuneError::store(format!("strategy {id} has malformed params: {e}")))?;
    let status = status.parse::<Status>().map_err(TuneError::store)?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_at)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TuneError::store(format!("strategy {id} has a bad timestamp: {e}")))?;
    let dataset_idx = usize::try_from(dataset_idx)
        .map_err(|_| TuneError::store(format!("strategy {id} has a negative dataset index")))?;

    Ok(StrategyRecord {
        strategy: Strategy {
            id,
            name,
            dataset_idx,
            params,
        },
        status,
        attempts: attempts.max(0) as u32,
        updated_at,
    })
}

#[async_trait]
impl StrategyStore for SqliteStrategyStore {
    async fn sample(&self) -> Result<Option<SampledStrategy>, TuneError> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let mut picked = None;
            for tier in [Status::Ready, Status::Runnable] {
                let query = format!(
                    "SELECT {SELECT_COLUMNS} FROM strategies WHERE status = ?1 ORDER BY RANDOM() LIMIT 1"
                );
                let row = tx
                    .query_row(&query, params![tier.as_str()], raw_row)
                    .optional()?;
                if let Some(row) = row {
                    picked = Some(decode_row(row)?);
                    break;
                }
            }

            let Some(record) = picked else {
                return Ok(None);
            };

            let in_progress = if record.status.needs_pipeline_check() {
                Status::Debugging
            } else {
                Status::Running
            };
            tx.execute(
                "UPDATE strategies SET status = ?1, attempts = attempts + 1, updated_at = ?2 WHERE id = ?3",
                params![in_progress.as_str(), Utc::now().to_rfc3339(), record.strategy.id],
            )?;
            tx.commit()?;

            debug!(
                id = record.strategy.id,
                name = %record.strategy.name,
                status = %record.status,
                "Sampled strategy"
            );

            Ok(Some(SampledStrategy {
                strategy: record.strategy,
                status: record.status,
                attempts: record.attempts + 1,
            }))
        })
        .await
    }

    async fn mark(&self, id: i64, status: Status) -> Result<(), TuneError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE strategies SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), Utc::now().to_rfc3339(), id],
            )?;
            if changed == 0 {
                return Err(TuneError::not_found(format!("strategy {id}")));
            }
            Ok(())
        })
        .await
    }

    async fn add(&self, strategy: NewStrategy) -> Result<i64, TuneError> {
        if strategy.name.trim().is_empty() {
            return Err(TuneError::invalid_input("strategy name must not be empty"));
        }
        self.with_conn(move |conn| {
            let status = if strategy.skip_check {
                Status::Runnable
            } else {
                Status::Ready
            };
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO strategies (name, dataset_idx, params, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    strategy.name,
                    strategy.dataset_idx as i64,
                    serde_json::to_string(&strategy.params)?,
                    status.as_str(),
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<StrategyRecord>, TuneError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM strategies ORDER BY id"))?;
            let rows = stmt
                .query_map([], raw_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(decode_row).collect()
        })
        .await
    }

    async fn get(&self, id: i64) -> Result<Option<StrategyRecord>, TuneError> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {SELECT_COLUMNS} FROM strategies WHERE id = ?1"),
                    params![id],
                    raw_row,
                )
                .optional()?;
            row.map(decode_row).transpose()
        })
        .await
    }
}
