//! Sync tunables.
//!
//! Defaults cover every deployment; individual values can be overridden per
//! device through `local_settings` rows in the `sync` category, stored as
//! milliseconds (e.g. `periodic_interval_ms = 30000`).

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::db;
use crate::error::Result;

pub const SETTINGS_CATEGORY: &str = "sync";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound for one connectivity probe.
    pub probe_timeout_ms: u64,
    /// SQLite busy wait before a lock error is reported.
    pub busy_timeout_ms: u64,
    /// Quiet period that collapses bursts of change signals into one run.
    pub debounce_delay_ms: u64,
    /// Interval of the background sync timer.
    pub periodic_interval_ms: u64,
    /// A run marked as syncing for longer than this is considered dead.
    pub stale_lock_timeout_ms: u64,
    pub outbox_base_retry_delay_ms: u64,
    pub outbox_max_retry_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 2_000,
            busy_timeout_ms: 10_000,
            debounce_delay_ms: 2_000,
            periodic_interval_ms: 60_000,
            stale_lock_timeout_ms: 120_000,
            outbox_base_retry_delay_ms: 5_000,
            outbox_max_retry_delay_ms: 300_000,
        }
    }
}

impl SyncConfig {
    /// Defaults with any `local_settings` overrides applied.
    pub fn load(conn: &Connection) -> Self {
        let mut config = Self::default();
        let overrides: [(&str, &mut u64); 7] = [
            ("probe_timeout_ms", &mut config.probe_timeout_ms),
            ("busy_timeout_ms", &mut config.busy_timeout_ms),
            ("debounce_delay_ms", &mut config.debounce_delay_ms),
            ("periodic_interval_ms", &mut config.periodic_interval_ms),
            ("stale_lock_timeout_ms", &mut config.stale_lock_timeout_ms),
            ("outbox_base_retry_delay_ms", &mut config.outbox_base_retry_delay_ms),
            ("outbox_max_retry_delay_ms", &mut config.outbox_max_retry_delay_ms),
        ];
        for (key, slot) in overrides {
            let Some(raw) = db::get_setting(conn, SETTINGS_CATEGORY, key) else {
                continue;
            };
            match raw.trim().parse::<u64>() {
                Ok(v) if v > 0 => *slot = v,
                _ => warn!(key, value = %raw, "ignoring invalid sync setting"),
            }
        }
        config
    }

    /// Persist one override.
    pub fn save_override(conn: &Connection, key: &str, millis: u64) -> Result<()> {
        db::set_setting(conn, SETTINGS_CATEGORY, key, &millis.to_string())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn debounce_delay(&self) -> Duration {
        Duration::from_millis(self.debounce_delay_ms)
    }

    pub fn periodic_interval(&self) -> Duration {
        Duration::from_millis(self.periodic_interval_ms)
    }

    pub fn stale_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_lock_timeout_ms)
    }

    pub fn outbox_base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.outbox_base_retry_delay_ms)
    }

    pub fn outbox_max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.outbox_max_retry_delay_ms)
    }
}

/// Per-user data directory for the local store and logs.
pub fn data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("com.thesmall.pos")
}

/// Default location of the local store file.
pub fn default_db_path() -> PathBuf {
    data_dir().join("pos.db")
}
