//! Serialized access to the local store.
//!
//! Every operation goes through one FIFO queue (a fair `tokio::sync::Mutex`
//! around the single connection), so at most one store operation runs at a
//! time and operations complete in submission order. The work itself runs on
//! the blocking pool.
//!
//! Transactions hand their body a [`Tx`] context. A body that needs a nested
//! transaction calls [`Tx::with_transaction`], which runs directly on the
//! already-open native transaction instead of queueing again. Bodies are
//! synchronous, so no network call can happen while the queue is held.

use rusqlite::Connection;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::db::{self, Row};
use crate::error::{Result, SyncError};

/// Attempts made when SQLite still reports BUSY/LOCKED after `busy_timeout`.
const BUSY_RETRY_ATTEMPTS: u32 = 5;
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(50);

/// The three store primitives, available on any open store context.
pub trait Executor {
    fn execute(&self, sql: &str, args: &[Value]) -> Result<usize>;
    fn query_all(&self, sql: &str, args: &[Value]) -> Result<Vec<Row>>;
    fn query_one(&self, sql: &str, args: &[Value]) -> Result<Option<Row>>;
}

/// Handle to an open native transaction.
pub struct Tx<'a> {
    conn: &'a Connection,
}

impl<'a> Tx<'a> {
    /// Reentrant transaction: runs `f` inside the transaction that is
    /// already open. No second native transaction is started.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Tx<'a>) -> Result<T>) -> Result<T> {
        f(self)
    }

    pub fn connection(&self) -> &Connection {
        self.conn
    }
}

impl Executor for Tx<'_> {
    fn execute(&self, sql: &str, args: &[Value]) -> Result<usize> {
        db::execute(self.conn, sql, args)
    }

    fn query_all(&self, sql: &str, args: &[Value]) -> Result<Vec<Row>> {
        db::query_all(self.conn, sql, args)
    }

    fn query_one(&self, sql: &str, args: &[Value]) -> Result<Option<Row>> {
        db::query_one(self.conn, sql, args)
    }
}

/// The serialized local store. Cheap to share behind an `Arc`.
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl LocalStore {
    /// Open the database file, creating the schema on first use.
    pub async fn open(path: impl Into<PathBuf>, busy_timeout: Duration) -> Result<Self> {
        let path = path.into();
        let open_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || db::init(&open_path, busy_timeout)).await??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue `f` behind every earlier store operation and run it on the
    /// blocking pool with exclusive use of the connection.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut guard = self.conn.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || f(&mut *guard)).await?
    }

    pub async fn execute(&self, sql: impl Into<String>, args: Vec<Value>) -> Result<usize> {
        let sql = sql.into();
        self.run(move |conn| retry_busy(|| db::execute(conn, &sql, &args)))
            .await
    }

    pub async fn query_all(&self, sql: impl Into<String>, args: Vec<Value>) -> Result<Vec<Row>> {
        let sql = sql.into();
        self.run(move |conn| retry_busy(|| db::query_all(conn, &sql, &args)))
            .await
    }

    pub async fn query_one(
        &self,
        sql: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<Option<Row>> {
        let sql = sql.into();
        self.run(move |conn| retry_busy(|| db::query_one(conn, &sql, &args)))
            .await
    }

    /// Run `f` in one native transaction. Commits when `f` returns `Ok`,
    /// rolls back otherwise.
    pub async fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&Tx<'a>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run(move |conn| {
            if !conn.is_autocommit() {
                warn!("rolling back transaction left open by an aborted operation");
                conn.execute_batch("ROLLBACK")?;
            }
            retry_busy(|| {
                conn.execute_batch("BEGIN IMMEDIATE")
                    .map_err(SyncError::from)
            })?;
            match f(&Tx { conn: &*conn }) {
                Ok(out) => {
                    if let Err(e) = conn.execute_batch("COMMIT") {
                        let _ = conn.execute_batch("ROLLBACK");
                        return Err(e.into());
                    }
                    Ok(out)
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(e)
                }
            }
        })
        .await
    }
}

/// Retry an operation that failed with SQLITE_BUSY/LOCKED.
fn retry_busy<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(e) if e.is_busy() && attempt < BUSY_RETRY_ATTEMPTS => {
                attempt += 1;
                debug!(attempt, "local store busy, waiting");
                std::thread::sleep(BUSY_RETRY_DELAY * attempt);
            }
            Err(e) if e.is_busy() => {
                warn!(attempts = attempt, "local store still busy after retries");
                return Err(e);
            }
            other => return other,
        }
    }
}

/// Process-wide lazy owner of the local store.
///
/// The first caller of [`StoreProvider::ensure_ready`] opens the database and
/// runs migrations; concurrent callers await that same initialization.
pub struct StoreProvider {
    path: PathBuf,
    busy_timeout: Duration,
    cell: OnceCell<Arc<LocalStore>>,
}

impl StoreProvider {
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
            cell: OnceCell::new(),
        }
    }

    pub async fn ensure_ready(&self) -> Result<Arc<LocalStore>> {
        let store = self
            .cell
            .get_or_try_init(|| async {
                info!(path = %self.path.display(), "initializing local store");
                LocalStore::open(self.path.clone(), self.busy_timeout)
                    .await
                    .map(Arc::new)
            })
            .await?;
        Ok(store.clone())
    }
}
