//! Per-entity upload syncers.
//!
//! Each syncer reads the locally unsynced rows of one entity (outside any
//! transaction), pushes them one by one, and flips `synced = 1` in a short
//! transaction per row that the remote accepted. A record the remote refuses
//! is logged and left for the next pass; it never stops the batch.
//!
//! Parents go first. Children of a parent that failed stay unsynced with it.
//! A child that fails after its parent succeeded is picked up on a later
//! pass by the orphan sweep; the parent keeps its synced flag.

use serde::Serialize;
use serde_json::Value;
use std::ops::AddAssign;
use tracing::{debug, info, warn};

use crate::db::Row;
use crate::entities::{self, ChildSpec, EntitySpec, UploadMode};
use crate::error::Result;
use crate::remote::{Filter, RemoteTable};
use crate::store::LocalStore;

/// Outcome of one syncer pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
}

impl SyncReport {
    fn success(&mut self) {
        self.attempted += 1;
        self.synced += 1;
    }

    fn failure(&mut self) {
        self.attempted += 1;
        self.failed += 1;
    }
}

impl AddAssign for SyncReport {
    fn add_assign(&mut self, rhs: Self) {
        self.attempted += rhs.attempted;
        self.synced += rhs.synced;
        self.failed += rhs.failed;
    }
}

/// Upload order of a sync run. Sales go before returns and debts, which
/// reference them.
pub static UPLOAD_ORDER: [&EntitySpec; 9] = [
    &entities::SALES,
    &entities::RETURNS,
    &entities::DEBTS,
    &entities::USERS,
    &entities::PURCHASE_ORDERS,
    &entities::CUSTOMERS,
    &entities::INVENTORY_AUDITS,
    &entities::FEEDBACK,
    &entities::NOTIFICATIONS,
];

/// Whether `spec` has its own syncer. Entities without one reach the remote
/// through the outbox.
pub fn has_syncer(spec: &EntitySpec) -> bool {
    UPLOAD_ORDER.iter().any(|s| std::ptr::eq(*s, spec))
}

pub async fn sync_pending_sales(store: &LocalStore, remote: &dyn RemoteTable) -> Result<SyncReport> {
    sync_pending(store, remote, &entities::SALES).await
}

pub async fn sync_pending_returns(
    store: &LocalStore,
    remote: &dyn RemoteTable,
) -> Result<SyncReport> {
    sync_pending(store, remote, &entities::RETURNS).await
}

pub async fn sync_pending_debts(store: &LocalStore, remote: &dyn RemoteTable) -> Result<SyncReport> {
    sync_pending(store, remote, &entities::DEBTS).await
}

pub async fn sync_pending_users(store: &LocalStore, remote: &dyn RemoteTable) -> Result<SyncReport> {
    sync_pending(store, remote, &entities::USERS).await
}

pub async fn sync_pending_purchase_orders(
    store: &LocalStore,
    remote: &dyn RemoteTable,
) -> Result<SyncReport> {
    sync_pending(store, remote, &entities::PURCHASE_ORDERS).await
}

pub async fn sync_pending_customers(
    store: &LocalStore,
    remote: &dyn RemoteTable,
) -> Result<SyncReport> {
    sync_pending(store, remote, &entities::CUSTOMERS).await
}

pub async fn sync_pending_inventory_audits(
    store: &LocalStore,
    remote: &dyn RemoteTable,
) -> Result<SyncReport> {
    sync_pending(store, remote, &entities::INVENTORY_AUDITS).await
}

pub async fn sync_pending_feedback(
    store: &LocalStore,
    remote: &dyn RemoteTable,
) -> Result<SyncReport> {
    sync_pending(store, remote, &entities::FEEDBACK).await
}

pub async fn sync_pending_notification_reads(
    store: &LocalStore,
    remote: &dyn RemoteTable,
) -> Result<SyncReport> {
    sync_pending(store, remote, &entities::NOTIFICATIONS).await
}

/// Push every unsynced row of `spec` (and its children) to the remote.
///
/// Only local store failures are returned as errors.
pub async fn sync_pending(
    store: &LocalStore,
    remote: &dyn RemoteTable,
    spec: &'static EntitySpec,
) -> Result<SyncReport> {
    let pending = store
        .query_all(
            format!(
                "SELECT * FROM {} WHERE synced = 0 ORDER BY created_at ASC, rowid ASC",
                spec.local_table
            ),
            vec![],
        )
        .await?;

    let mut report = SyncReport::default();
    if !pending.is_empty() {
        debug!(table = spec.local_table, count = pending.len(), "uploading unsynced rows");
    }

    for row in pending {
        let Some(id) = spec.id_of(&row) else {
            warn!(table = spec.local_table, "skipping unsynced row without id");
            report.failure();
            continue;
        };

        if let Err(e) = push_row(remote, spec, &id, &row).await {
            warn!(table = spec.local_table, record_id = %id, error = %e, "upload failed, will retry");
            report.failure();
            continue;
        }

        let children = match spec.child {
            Some(child) => push_children(store, remote, child, &id, &mut report).await?,
            None => Vec::new(),
        };

        let marked = store
            .with_transaction(move |tx| {
                let parent = spec.mark_synced_if_unchanged(tx, &row)?;
                if let Some(child) = spec.child {
                    for snapshot in &children {
                        child.mark_synced_if_unchanged(tx, snapshot)?;
                    }
                }
                Ok(parent)
            })
            .await?;
        if !marked {
            debug!(table = spec.local_table, record_id = %id, "row changed during upload, left unsynced");
        }
        report.success();
    }

    if let Some(child) = spec.child {
        report += sync_orphan_children(store, remote, spec, child).await?;
    }

    if report.attempted > 0 {
        info!(
            table = spec.local_table,
            synced = report.synced,
            failed = report.failed,
            "upload pass finished"
        );
    }
    Ok(report)
}

async fn push_row(
    remote: &dyn RemoteTable,
    spec: &EntitySpec,
    id: &str,
    row: &Row,
) -> std::result::Result<(), crate::error::RemoteError> {
    match spec.mode {
        UploadMode::Upsert => remote.upsert(spec.remote_table, &spec.payload(row)).await,
        UploadMode::Patch(fields) => {
            let patch = entities::project(fields, row);
            remote
                .update(spec.remote_table, &Filter::eq(spec.id_column, id), &patch)
                .await
        }
    }
}

/// Upload the unsynced children of one parent. Returns the snapshots that
/// the remote accepted.
async fn push_children(
    store: &LocalStore,
    remote: &dyn RemoteTable,
    child: &ChildSpec,
    parent_id: &str,
    report: &mut SyncReport,
) -> Result<Vec<Row>> {
    let rows = store
        .query_all(
            format!(
                "SELECT * FROM {} WHERE {} = ?1 AND synced = 0 ORDER BY rowid ASC",
                child.local_table, child.parent_column
            ),
            vec![Value::from(parent_id)],
        )
        .await?;

    let mut accepted = Vec::with_capacity(rows.len());
    for row in rows {
        match remote.upsert(child.remote_table, &child.payload(&row)).await {
            Ok(()) => accepted.push(row),
            Err(e) => {
                warn!(
                    table = child.local_table,
                    parent_id,
                    error = %e,
                    "child upload failed, will retry"
                );
                report.failure();
            }
        }
    }
    Ok(accepted)
}

/// Children still unsynced although their parent is synced.
async fn sync_orphan_children(
    store: &LocalStore,
    remote: &dyn RemoteTable,
    parent: &EntitySpec,
    child: &'static ChildSpec,
) -> Result<SyncReport> {
    let rows = store
        .query_all(
            format!(
                "SELECT c.* FROM {child} c JOIN {parent} p ON p.{pid} = c.{fk}
                 WHERE c.synced = 0 AND p.synced = 1
                 ORDER BY c.rowid ASC",
                child = child.local_table,
                parent = parent.local_table,
                pid = parent.id_column,
                fk = child.parent_column,
            ),
            vec![],
        )
        .await?;

    let mut report = SyncReport::default();
    for row in rows {
        let id = entities::id_string(row.get("id")).unwrap_or_default();
        match remote.upsert(child.remote_table, &child.payload(&row)).await {
            Ok(()) => {
                store
                    .with_transaction(move |tx| child.mark_synced_if_unchanged(tx, &row))
                    .await?;
                report.success();
            }
            Err(e) => {
                warn!(table = child.local_table, record_id = %id, error = %e, "child retry failed");
                report.failure();
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use crate::store::test_support::temp_store;
    use serde_json::json;

    async fn seed_sale(store: &LocalStore, sale_id: &str, items: &[&str]) {
        store
            .execute(
                "INSERT INTO sales (id, total_amount, created_at, synced) VALUES (?1, 10.0, ?2, 0)",
                vec![json!(sale_id), json!("2026-10-18T10:00:00Z")],
            )
            .await
            .unwrap();
        for item in items {
            store
                .execute(
                    "INSERT INTO sale_items (id, sale_id, product_id, quantity, unit_price, subtotal, synced)
                     VALUES (?1, ?2, 'p1', 1, 10.0, 10.0, 0)",
                    vec![json!(item), json!(sale_id)],
                )
                .await
                .unwrap();
        }
    }

    async fn synced_flag(store: &LocalStore, table: &str, id: &str) -> i64 {
        store
            .query_one(format!("SELECT synced FROM {table} WHERE id = ?1"), vec![json!(id)])
            .await
            .unwrap()
            .unwrap()["synced"]
            .as_i64()
            .unwrap()
    }

    #[tokio::test]
    async fn test_sales_upload_with_items() {
        let (_dir, store) = temp_store().await;
        let remote = MemoryRemote::new();
        seed_sale(&store, "s1", &["si1", "si2"]).await;

        let report = sync_pending_sales(&store, &remote).await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.failed, 0);

        assert!(remote.get("sales", "s1").is_some());
        assert_eq!(remote.rows("sale_items").len(), 2);
        assert!(remote.get("sales", "s1").unwrap().get("synced").is_none());
        assert_eq!(synced_flag(&store, "sales", "s1").await, 1);
        assert_eq!(synced_flag(&store, "sale_items", "si1").await, 1);
        assert_eq!(synced_flag(&store, "sale_items", "si2").await, 1);
    }

    #[tokio::test]
    async fn test_failed_parent_keeps_children_unsynced() {
        let (_dir, store) = temp_store().await;
        let remote = MemoryRemote::new();
        seed_sale(&store, "s1", &["si1"]).await;
        remote.fail_table("sales");

        let report = sync_pending_sales(&store, &remote).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(remote.rows("sale_items").is_empty());
        assert_eq!(synced_flag(&store, "sales", "s1").await, 0);
        assert_eq!(synced_flag(&store, "sale_items", "si1").await, 0);
    }

    #[tokio::test]
    async fn test_failed_child_retried_on_next_pass() {
        let (_dir, store) = temp_store().await;
        let remote = MemoryRemote::new();
        seed_sale(&store, "s1", &["si1"]).await;
        remote.fail_table("sale_items");

        sync_pending_sales(&store, &remote).await.unwrap();
        assert_eq!(synced_flag(&store, "sales", "s1").await, 1);
        assert_eq!(synced_flag(&store, "sale_items", "si1").await, 0);

        remote.restore_table("sale_items");
        let report = sync_pending_sales(&store, &remote).await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(synced_flag(&store, "sale_items", "si1").await, 1);
        assert!(remote.get("sale_items", "si1").is_some());
    }

    #[tokio::test]
    async fn test_one_bad_record_does_not_block_batch() {
        let (_dir, store) = temp_store().await;
        let remote = MemoryRemote::new();
        for (id, name) in [("c1", "Ana"), ("c2", "Ben"), ("c3", "Cy")] {
            store
                .execute(
                    "INSERT INTO customers (id, name, synced) VALUES (?1, ?2, 0)",
                    vec![json!(id), json!(name)],
                )
                .await
                .unwrap();
        }
        // A row with an id the remote cannot key on.
        store
            .execute("INSERT INTO customers (id, name, synced) VALUES ('', 'Nobody', 0)", vec![])
            .await
            .unwrap();

        let report = sync_pending_customers(&store, &remote).await.unwrap();
        assert_eq!(report.synced, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(remote.rows("customers").len(), 3);
    }

    #[tokio::test]
    async fn test_notification_read_state_is_patched() {
        let (_dir, store) = temp_store().await;
        let remote = MemoryRemote::new();
        remote.seed(
            "notifications",
            vec![json!({ "id": "n1", "title": "Low stock", "is_read": 0 })
                .as_object()
                .cloned()
                .unwrap()],
        );
        store
            .execute(
                "INSERT INTO notifications (id, title, is_read, read_at, synced)
                 VALUES ('n1', 'Low stock (local)', 1, '2026-10-18T10:00:00Z', 0)",
                vec![],
            )
            .await
            .unwrap();

        let report = sync_pending_notification_reads(&store, &remote).await.unwrap();
        assert_eq!(report.synced, 1);
        let stored = remote.get("notifications", "n1").unwrap();
        assert_eq!(stored["is_read"], json!(1));
        assert_eq!(stored["title"], json!("Low stock"));
        assert_eq!(synced_flag(&store, "notifications", "n1").await, 1);
    }

    #[tokio::test]
    async fn test_synced_rows_are_not_resubmitted() {
        let (_dir, store) = temp_store().await;
        let remote = MemoryRemote::new();
        seed_sale(&store, "s1", &["si1"]).await;

        sync_pending_sales(&store, &remote).await.unwrap();
        let writes = remote.write_count();

        let report = sync_pending_sales(&store, &remote).await.unwrap();
        assert_eq!(report, SyncReport::default());
        assert_eq!(remote.write_count(), writes);
    }
}
