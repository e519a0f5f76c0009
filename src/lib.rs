//! Offline-first sync core for the mobile POS.
//!
//! Business data is always read from and written to the local SQLite store.
//! The [`sync::SyncEngine`] later pushes rows still marked `synced = 0` to
//! the remote, replays the outbox, and refreshes shared reference data.
//!
//! Typical wiring:
//!
//! ```no_run
//! use std::sync::Arc;
//! use offline_pos_sync::{
//!     config, EntityServices, HttpProbe, RemoteCredentials, RestRemote, StoreProvider,
//!     SyncEngine,
//! };
//!
//! # async fn run() -> offline_pos_sync::Result<()> {
//! let _log_guard = offline_pos_sync::init_logging(Some(config::data_dir().join("logs").as_path()));
//! let creds = RemoteCredentials::load().expect("remote not configured");
//! let defaults = config::SyncConfig::default();
//!
//! let store = Arc::new(StoreProvider::new(config::default_db_path(), defaults.busy_timeout()));
//! let remote = Arc::new(RestRemote::new(creds.clone())?);
//! let probe = Arc::new(HttpProbe::new(&creds, defaults.probe_timeout()));
//! let engine = SyncEngine::with_stored_config(store, remote, probe).await?;
//!
//! let _periodic = engine.start_periodic_sync(engine.config().periodic_interval());
//! let services = EntityServices::new(engine.clone());
//! # let _ = services;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connectivity;
pub mod db;
pub mod download;
pub mod entities;
pub mod error;
pub mod logging;
pub mod outbox;
pub mod remote;
pub mod services;
pub mod storage;
pub mod store;
pub mod sync;
pub mod upload;

pub use connectivity::{is_online, ConnectivityProbe, HttpProbe, ManualProbe};
pub use error::{RemoteError, Result, SyncError};
pub use logging::init_logging;
pub use remote::{Filter, MemoryRemote, RemoteTable, RestRemote};
pub use services::{EntityServices, NewReturn, NewSale, NewSaleItem, WriteOutcome};
pub use storage::RemoteCredentials;
pub use store::{Executor, LocalStore, StoreProvider, Tx};
pub use sync::{PendingCounts, RunSummary, Subscription, SyncEngine, SyncOutcome, SyncStatus};
pub use upload::SyncReport;
