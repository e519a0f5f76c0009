//! Reconciliation pass: refresh shared reference data from the remote.
//!
//! Only low-cardinality catalog tables are pulled. Each table is written in
//! one local transaction; rows with unsynced local changes are kept. A remote
//! row the local schema refuses is logged and skipped.

use serde::Serialize;
use tracing::{info, warn};

use crate::entities::{self, EntitySpec};
use crate::error::Result;
use crate::remote::{Filter, RemoteTable};
use crate::store::LocalStore;

/// Entities refreshed by [`download_data`], in dependency order.
pub static REFERENCE_ENTITIES: [&EntitySpec; 3] =
    [&entities::CATEGORIES, &entities::SUPPLIERS, &entities::PRODUCTS];

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadReport {
    /// Rows written per table.
    pub tables: Vec<(String, usize)>,
    /// Tables that could not be fetched this pass.
    pub failed: Vec<String>,
    /// Remote rows the local schema refused (missing required fields and
    /// the like).
    pub skipped: usize,
}

impl DownloadReport {
    pub fn rows_written(&self) -> usize {
        self.tables.iter().map(|(_, n)| n).sum()
    }
}

pub async fn download_data(store: &LocalStore, remote: &dyn RemoteTable) -> Result<DownloadReport> {
    let mut report = DownloadReport::default();

    for spec in REFERENCE_ENTITIES {
        let rows = match remote.select(spec.remote_table, &Filter::all()).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(table = spec.remote_table, error = %e, "download failed, keeping local copy");
                report.failed.push(spec.local_table.to_string());
                continue;
            }
        };

        let fetched = rows.len();
        let (written, skipped) = store
            .with_transaction(move |tx| {
                let mut written = 0;
                let mut skipped = 0;
                for row in &rows {
                    match spec.upsert_local(tx, row, true, true) {
                        Ok(n) => written += n,
                        Err(e) if e.is_busy() => return Err(e),
                        Err(e) => {
                            warn!(
                                table = spec.local_table,
                                id = spec.id_of(row).as_deref().unwrap_or("?"),
                                error = %e,
                                "skipping remote row the local store refuses"
                            );
                            skipped += 1;
                        }
                    }
                }
                Ok((written, skipped))
            })
            .await?;

        info!(table = spec.local_table, fetched, written, skipped, "reference data refreshed");
        report.tables.push((spec.local_table.to_string(), written));
        report.skipped += skipped;
    }

    Ok(report)
}
