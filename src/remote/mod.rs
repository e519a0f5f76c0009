//! Remote table contract.
//!
//! The sync core talks to the backend only through [`RemoteTable`]: select,
//! insert, update, delete and upsert against a named table, addressed by
//! equality filters.

mod memory;
mod rest;

use async_trait::async_trait;
use serde_json::Value;

use crate::db::Row;
use crate::error::RemoteError;

pub use memory::MemoryRemote;
pub use rest::RestRemote;

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Conjunction of `column = value` conditions. Empty means "every row".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().and_eq(column, value)
    }

    pub fn and_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((column.into(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.conditions
            .iter()
            .all(|(column, value)| row.get(column) == Some(value))
    }
}

#[async_trait]
pub trait RemoteTable: Send + Sync {
    async fn select(&self, table: &str, filter: &Filter) -> RemoteResult<Vec<Row>>;

    async fn insert(&self, table: &str, row: &Row) -> RemoteResult<()>;

    async fn update(&self, table: &str, filter: &Filter, patch: &Row) -> RemoteResult<()>;

    async fn delete(&self, table: &str, filter: &Filter) -> RemoteResult<()>;

    /// Insert, or merge into the row with the same id.
    async fn upsert(&self, table: &str, row: &Row) -> RemoteResult<()>;
}
