//! In-process remote backend with failure injection.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{Filter, RemoteResult, RemoteTable};
use crate::db::Row;
use crate::entities;
use crate::error::RemoteError;

/// Remote tables held in memory. Rows are keyed by the table's id column.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    tables: Mutex<BTreeMap<String, Vec<Row>>>,
    unreachable_tables: Mutex<HashSet<String>>,
    refused_tables: Mutex<HashSet<String>>,
    offline: AtomicBool,
    unauthorized: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, BTreeMap<String, Vec<Row>>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the content of `table`.
    pub fn seed(&self, table: &str, rows: Vec<Row>) {
        self.tables().insert(table.to_string(), rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables().get(table).cloned().unwrap_or_default()
    }

    pub fn get(&self, table: &str, id: &str) -> Option<Row> {
        let key = key_column(table);
        self.tables()
            .get(table)?
            .iter()
            .find(|r| entities::id_string(r.get(key)).as_deref() == Some(id))
            .cloned()
    }

    /// Number of successful write calls (insert, update, delete, upsert).
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Every call fails with a transport error while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every call fails with an authorization error while set.
    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.unauthorized.store(unauthorized, Ordering::SeqCst);
    }

    /// Calls against `table` fail with a transport error until restored.
    pub fn fail_table(&self, table: &str) {
        self.unreachable_tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.to_string());
    }

    /// Calls against `table` fail with an authorization error until
    /// restored.
    pub fn refuse_table(&self, table: &str) {
        self.refused_tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.to_string());
    }

    pub fn restore_table(&self, table: &str) {
        for set in [&self.unreachable_tables, &self.refused_tables] {
            set.lock().unwrap_or_else(PoisonError::into_inner).remove(table);
        }
    }

    fn check(&self, table: &str) -> RemoteResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::transport("network is unreachable"));
        }
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(RemoteError::unauthorized("JWT expired"));
        }
        let unreachable = self
            .unreachable_tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(table);
        if unreachable {
            return Err(RemoteError::transport(format!("timed out writing {table}")));
        }
        let refused = self
            .refused_tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(table);
        if refused {
            return Err(RemoteError::unauthorized(format!("permission denied for table {table}")));
        }
        Ok(())
    }

    fn count_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

fn key_column(table: &str) -> &'static str {
    entities::id_column(table).unwrap_or("id")
}

fn row_key(table: &str, row: &Row) -> RemoteResult<String> {
    entities::id_string(row.get(key_column(table)))
        .ok_or_else(|| RemoteError::rejected(400, format!("{table}: row has no id")))
}

#[async_trait]
impl RemoteTable for MemoryRemote {
    async fn select(&self, table: &str, filter: &Filter) -> RemoteResult<Vec<Row>> {
        self.check(table)?;
        Ok(self
            .tables()
            .get(table)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert(&self, table: &str, row: &Row) -> RemoteResult<()> {
        self.check(table)?;
        let key = row_key(table, row)?;
        let mut tables = self.tables();
        let rows = tables.entry(table.to_string()).or_default();
        let column = key_column(table);
        if rows
            .iter()
            .any(|r| entities::id_string(r.get(column)).as_deref() == Some(key.as_str()))
        {
            return Err(RemoteError::rejected(
                409,
                format!("duplicate key value violates unique constraint on {table}"),
            ));
        }
        rows.push(row.clone());
        drop(tables);
        self.count_write();
        Ok(())
    }

    async fn update(&self, table: &str, filter: &Filter, patch: &Row) -> RemoteResult<()> {
        self.check(table)?;
        let mut tables = self.tables();
        if let Some(rows) = tables.get_mut(table) {
            for row in rows.iter_mut().filter(|r| filter.matches(r)) {
                for (k, v) in patch {
                    row.insert(k.clone(), v.clone());
                }
            }
        }
        drop(tables);
        self.count_write();
        Ok(())
    }

    async fn delete(&self, table: &str, filter: &Filter) -> RemoteResult<()> {
        self.check(table)?;
        if filter.is_empty() {
            return Err(RemoteError::rejected(400, "refusing unfiltered delete"));
        }
        if let Some(rows) = self.tables().get_mut(table) {
            rows.retain(|r| !filter.matches(r));
        }
        self.count_write();
        Ok(())
    }

    async fn upsert(&self, table: &str, row: &Row) -> RemoteResult<()> {
        self.check(table)?;
        let key = row_key(table, row)?;
        let column = key_column(table);
        let mut tables = self.tables();
        let rows = tables.entry(table.to_string()).or_default();
        match rows
            .iter_mut()
            .find(|r| entities::id_string(r.get(column)).as_deref() == Some(key.as_str()))
        {
            Some(existing) => {
                for (k, v) in row {
                    existing.insert(k.clone(), v.clone());
                }
            }
            None => rows.push(row.clone()),
        }
        drop(tables);
        self.count_write();
        Ok(())
    }
}
