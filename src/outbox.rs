//! Generic outbox (`sync_queue`) for mutations without a dedicated syncer.
//!
//! Entries are replayed oldest first. Entries for the same record keep their
//! order: once one is waiting for a retry, later entries for that record
//! wait too. A failed replay is rescheduled with exponential backoff; entries
//! are never dropped.
//!
//! The originating row is only marked synced when the last replayed payload
//! still equals it, so local state the outbox never carried stays pending.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::db::Row;
use crate::entities;
use crate::error::{RemoteError, Result, SyncError};
use crate::remote::{Filter, RemoteTable};
use crate::store::{Executor, LocalStore, Tx};
use crate::upload::SyncReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(SyncError::Config(format!("unknown outbox operation `{other}`"))),
        }
    }
}

/// One `sync_queue` row.
#[derive(Debug, Clone, Deserialize)]
pub struct OutboxEntry {
    pub id: String,
    pub table_name: String,
    pub operation: Operation,
    pub record_id: String,
    /// Serialized snapshot of the row (or patch) at enqueue time.
    pub data: String,
    pub created_at: String,
    #[serde(default)]
    pub attempts: i64,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub next_retry_at: Option<String>,
}

impl OutboxEntry {
    fn from_row(row: Row) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(row))?)
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.next_retry_at.as_deref() {
            None => true,
            Some(at) => DateTime::parse_from_rfc3339(at)
                .map(|at| at.with_timezone(&Utc) <= now)
                .unwrap_or(true),
        }
    }
}

/// Backoff for failed outbox replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base: config.outbox_base_retry_delay(),
            max: config.outbox_max_retry_delay(),
        }
    }

    /// Delay before the next attempt after `attempts` failures.
    pub fn delay(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// Append an entry to the outbox inside the caller's transaction.
///
/// `table` must be a known entity table so the replay can address the
/// record by its id column.
pub fn enqueue(
    tx: &Tx<'_>,
    table: &str,
    operation: Operation,
    record_id: &str,
    data: &Value,
) -> Result<String> {
    entities::id_column(table)?;
    let id = uuid::Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO sync_queue (id, table_name, operation, record_id, data, created_at, synced, attempts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0)",
        &[
            Value::from(id.clone()),
            Value::from(table),
            Value::from(operation.as_str()),
            Value::from(record_id),
            Value::from(serde_json::to_string(data)?),
            Value::from(Utc::now().to_rfc3339()),
        ],
    )?;
    debug!(table, record_id, operation = %operation, "queued outbox entry");
    Ok(id)
}

/// Number of entries still waiting to be replayed.
pub async fn pending_count(store: &LocalStore) -> Result<i64> {
    let row = store
        .query_one("SELECT COUNT(*) AS n FROM sync_queue WHERE synced = 0", vec![])
        .await?;
    Ok(row.and_then(|r| r.get("n").and_then(Value::as_i64)).unwrap_or(0))
}

/// Replay every due outbox entry against the remote.
pub async fn process_sync_queue(
    store: &LocalStore,
    remote: &dyn RemoteTable,
    policy: &RetryPolicy,
) -> Result<SyncReport> {
    let rows = store
        .query_all(
            "SELECT * FROM sync_queue WHERE synced = 0 ORDER BY created_at ASC, rowid ASC",
            vec![],
        )
        .await?;

    let now = Utc::now();
    let mut report = SyncReport::default();
    let mut blocked: HashSet<(String, String)> = HashSet::new();

    for row in rows {
        let entry = OutboxEntry::from_row(row)?;
        let key = (entry.table_name.clone(), entry.record_id.clone());
        if blocked.contains(&key) {
            continue;
        }
        if !entry.is_due(now) {
            blocked.insert(key);
            continue;
        }

        match replay(remote, &entry).await {
            Ok(()) => {
                complete(store, &entry).await?;
                report.synced += 1;
            }
            Err(e) => {
                warn!(
                    table = %entry.table_name,
                    record_id = %entry.record_id,
                    operation = %entry.operation,
                    attempts = entry.attempts + 1,
                    error = %e,
                    "outbox replay failed, rescheduling"
                );
                reschedule(store, &entry, policy, &e.to_string()).await?;
                report.failed += 1;
                blocked.insert(key);
            }
        }
        report.attempted += 1;
    }

    if report.attempted > 0 {
        info!(
            synced = report.synced,
            failed = report.failed,
            "outbox pass finished"
        );
    }
    Ok(report)
}

async fn replay(remote: &dyn RemoteTable, entry: &OutboxEntry) -> Result<()> {
    let table = entry.table_name.as_str();
    let id_column = entities::id_column(table)?;
    let filter = Filter::eq(id_column, entry.record_id.as_str());

    match entry.operation {
        Operation::Insert => {
            let mut payload = payload(entry)?;
            payload
                .entry(id_column)
                .or_insert_with(|| Value::from(entry.record_id.clone()));
            match remote.insert(table, &payload).await {
                // The record exists remotely (an earlier replay whose
                // completion was lost, or a save of a known record).
                Err(RemoteError::Rejected { status: 409, .. }) => {
                    debug!(table, record_id = %entry.record_id, "record exists, applying insert as update");
                    Ok(remote.update(table, &filter, &payload).await?)
                }
                other => Ok(other?),
            }
        }
        Operation::Update => Ok(remote.update(table, &filter, &payload(entry)?).await?),
        Operation::Delete => Ok(remote.delete(table, &filter).await?),
    }
}

/// The stored snapshot, restricted to the fields the remote table knows.
fn payload(entry: &OutboxEntry) -> Result<Row> {
    let data: Value = serde_json::from_str(&entry.data)?;
    let Value::Object(row) = data else {
        return Err(SyncError::Config(format!(
            "outbox entry {} has a non-object payload",
            entry.id
        )));
    };
    Ok(match entities::for_table(&entry.table_name) {
        Some(spec) => spec.payload(&row),
        None => row,
    })
}

/// Drop the entry and, when nothing else is pending for the record and the
/// row still equals the replayed snapshot, mark the originating row synced.
/// One transaction.
async fn complete(store: &LocalStore, entry: &OutboxEntry) -> Result<()> {
    let entry = entry.clone();
    store
        .with_transaction(move |tx| {
            tx.execute("DELETE FROM sync_queue WHERE id = ?1", &[Value::from(entry.id.clone())])?;
            if entry.operation == Operation::Delete {
                return Ok(());
            }
            let others = tx.query_one(
                "SELECT COUNT(*) AS n FROM sync_queue
                 WHERE synced = 0 AND table_name = ?1 AND record_id = ?2",
                &[
                    Value::from(entry.table_name.clone()),
                    Value::from(entry.record_id.clone()),
                ],
            )?;
            let others = others
                .and_then(|r| r.get("n").and_then(Value::as_i64))
                .unwrap_or(0);
            if others > 0 {
                return Ok(());
            }
            let spec = entities::for_table(&entry.table_name)
                .ok_or_else(|| SyncError::UnknownTable(entry.table_name.clone()))?;
            let mut snapshot = payload(&entry)?;
            snapshot
                .entry(spec.id_column)
                .or_insert_with(|| Value::from(entry.record_id.clone()));
            if !spec.mark_synced_if_unchanged(tx, &snapshot)? {
                debug!(
                    table = %entry.table_name,
                    record_id = %entry.record_id,
                    "row differs from the replayed payload, left unsynced"
                );
            }
            Ok(())
        })
        .await
}

async fn reschedule(
    store: &LocalStore,
    entry: &OutboxEntry,
    policy: &RetryPolicy,
    error: &str,
) -> Result<()> {
    let attempts = entry.attempts.saturating_add(1);
    let delay = policy.delay(u32::try_from(attempts).unwrap_or(u32::MAX));
    let next = Utc::now()
        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(300));
    store
        .execute(
            "UPDATE sync_queue SET attempts = ?1, last_error = ?2, next_retry_at = ?3 WHERE id = ?4",
            vec![
                Value::from(attempts),
                Value::from(error),
                Value::from(next.to_rfc3339()),
                Value::from(entry.id.clone()),
            ],
        )
        .await?;
    Ok(())
}
