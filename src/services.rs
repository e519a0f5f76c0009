//! Write-through entity services.
//!
//! Every write tries the remote first when the probe says online. Accepted
//! writes land locally with `synced = 1`; transport failures and offline
//! mode fall back to a local write with `synced = 0` and schedule a debounced
//! sync. Authorization and validation failures are returned to the caller and
//! nothing is written locally, unless the remote already took part of the
//! write (a sale whose items were then refused), in which case the local
//! write happens first.
//!
//! Stock changes are always local: the product row is flipped to unsynced
//! and an outbox update carries the product with its new level. Entities
//! without an upload syncer (products, categories, suppliers) that could not
//! be written through are queued in the outbox as well.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::Row;
use crate::entities::{self, ChildSpec, EntitySpec};
use crate::error::{RemoteError, Result, SyncError};
use crate::outbox::{self, Operation};
use crate::remote::Filter;
use crate::store::{Executor, Tx};
use crate::sync::SyncEngine;
use crate::upload;

/// Result of a write-through call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub id: String,
    /// Whether the remote already has the write.
    pub synced: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSaleItem {
    pub product_id: String,
    pub quantity: i64,
    pub unit_price: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewSale {
    /// Client-generated id; one is created when absent.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub discount: f64,
    pub items: Vec<NewSaleItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewReturn {
    #[serde(default)]
    pub id: Option<String>,
    pub sale_id: String,
    pub sale_item_id: String,
    pub product_id: String,
    pub quantity: i64,
    pub refund_amount: f64,
    #[serde(default)]
    pub reason: Option<String>,
}

pub struct EntityServices {
    engine: Arc<SyncEngine>,
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn to_row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

/// `Ok(true)` when the remote accepted the write, `Ok(false)` when it should
/// stay local for a later sync.
fn accepted(table: &str, result: std::result::Result<(), RemoteError>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_transport() => {
            debug!(table, error = %e, "remote write failed, keeping it local");
            Ok(false)
        }
        Err(e) => {
            warn!(table, error = %e, "remote refused write");
            Err(e.into())
        }
    }
}

/// Add `delta` to a product's stock, flip it unsynced and queue the updated
/// product for upload. Returns the new stock, or `None` for an unknown
/// product.
fn apply_stock_delta(tx: &Tx<'_>, product_id: &str, delta: i64) -> Result<Option<i64>> {
    tx.with_transaction(|tx| {
        let changed = tx.execute(
            "UPDATE products SET stock = stock + ?1, synced = 0, updated_at = ?2 WHERE id = ?3",
            &[json!(delta), json!(now()), json!(product_id)],
        )?;
        if changed == 0 {
            warn!(product_id, "stock change for unknown product ignored");
            return Ok(None);
        }
        let Some(product) =
            tx.query_one("SELECT * FROM products WHERE id = ?1", &[json!(product_id)])?
        else {
            return Ok(None);
        };
        let stock = product.get("stock").and_then(Value::as_i64).unwrap_or_default();
        outbox::enqueue(
            tx,
            "products",
            Operation::Update,
            product_id,
            &Value::Object(entities::PRODUCTS.payload(&product)),
        )?;
        Ok(Some(stock))
    })
}

impl EntityServices {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }

    fn schedule_sync(&self) {
        self.engine
            .sync_all_debounced(self.engine.config().debounce_delay());
    }

    /// Record a sale with its items and take the sold quantities out of
    /// stock.
    pub async fn create_sale(&self, sale: NewSale) -> Result<WriteOutcome> {
        if sale.items.is_empty() {
            return Err(SyncError::Config("a sale needs at least one item".into()));
        }
        let id = sale.id.clone().unwrap_or_else(new_id);
        let created_at = now();
        let total: f64 = sale
            .items
            .iter()
            .map(|i| i.quantity as f64 * i.unit_price)
            .sum::<f64>()
            - sale.discount;

        let sale_row = to_row(json!({
            "id": id,
            "customer_id": sale.customer_id,
            "user_id": sale.user_id,
            "total_amount": total,
            "discount": sale.discount,
            "payment_method": sale.payment_method,
            "status": "completed",
            "created_at": created_at,
            "updated_at": created_at,
        }));
        let item_rows: Vec<Row> = sale
            .items
            .iter()
            .map(|item| {
                to_row(json!({
                    "id": new_id(),
                    "sale_id": id,
                    "product_id": item.product_id,
                    "quantity": item.quantity,
                    "unit_price": item.unit_price,
                    "subtotal": item.quantity as f64 * item.unit_price,
                    "created_at": created_at,
                }))
            })
            .collect();

        let mut sale_synced = false;
        let mut items_synced = vec![false; item_rows.len()];
        // Set when the remote refused an item after taking the sale. The sale
        // is then recorded locally before the error is returned.
        let mut item_refused = None;
        if self.engine.is_online().await {
            let remote = self.engine.remote();
            sale_synced = accepted(
                "sales",
                remote
                    .upsert(entities::SALES.remote_table, &entities::SALES.payload(&sale_row))
                    .await,
            )?;
            if sale_synced {
                for (row, synced) in item_rows.iter().zip(items_synced.iter_mut()) {
                    let result = remote
                        .upsert(entities::SALE_ITEMS.remote_table, &entities::SALE_ITEMS.payload(row))
                        .await;
                    match accepted("sale_items", result) {
                        Ok(taken) => *synced = taken,
                        Err(e) => {
                            item_refused = Some(e);
                            break;
                        }
                    }
                }
            }
        }

        let store = self.engine.ensure_store_ready().await?;
        store
            .with_transaction(move |tx| {
                entities::SALES.upsert_local(tx, &sale_row, sale_synced, false)?;
                for (row, synced) in item_rows.iter().zip(items_synced) {
                    insert_child(tx, &entities::SALE_ITEMS, row, synced)?;
                    let product_id = row.get("product_id").and_then(Value::as_str).unwrap_or_default();
                    let quantity = row.get("quantity").and_then(Value::as_i64).unwrap_or_default();
                    apply_stock_delta(tx, product_id, -quantity)?;
                }
                Ok(())
            })
            .await?;

        info!(sale_id = %id, synced = sale_synced, "sale recorded");
        self.schedule_sync();
        if let Some(e) = item_refused {
            return Err(e);
        }
        Ok(WriteOutcome {
            id,
            synced: sale_synced,
        })
    }

    /// Record a return against a sale item and put the quantity back in
    /// stock.
    pub async fn create_return(&self, ret: NewReturn) -> Result<WriteOutcome> {
        let id = ret.id.clone().unwrap_or_else(new_id);
        let row = to_row(json!({
            "id": id,
            "sale_id": ret.sale_id,
            "sale_item_id": ret.sale_item_id,
            "product_id": ret.product_id,
            "quantity": ret.quantity,
            "refund_amount": ret.refund_amount,
            "reason": ret.reason,
            "created_at": now(),
        }));

        let synced = self.push(&entities::RETURNS, &row).await?;

        let store = self.engine.ensure_store_ready().await?;
        let product_id = ret.product_id.clone();
        let quantity = ret.quantity;
        store
            .with_transaction(move |tx| {
                entities::RETURNS.upsert_local(tx, &row, synced, false)?;
                apply_stock_delta(tx, &product_id, quantity)?;
                Ok(())
            })
            .await?;

        info!(return_id = %id, synced, "return recorded");
        self.schedule_sync();
        Ok(WriteOutcome { id, synced })
    }

    /// Mark a notification read. Falls back to the outbox when the remote
    /// cannot take the update now.
    pub async fn mark_notification_read(&self, notification_id: &str) -> Result<WriteOutcome> {
        let read_at = now();
        let patch = to_row(json!({ "is_read": 1, "read_at": read_at }));

        let mut synced = false;
        if self.engine.is_online().await {
            let result = self
                .engine
                .remote()
                .update(
                    entities::NOTIFICATIONS.remote_table,
                    &Filter::eq(entities::NOTIFICATIONS.id_column, notification_id),
                    &patch,
                )
                .await;
            synced = accepted("notifications", result)?;
        }

        let store = self.engine.ensure_store_ready().await?;
        let id = notification_id.to_string();
        let record_id = id.clone();
        store
            .with_transaction(move |tx| {
                tx.execute(
                    "UPDATE notifications SET is_read = 1, read_at = ?1, synced = ?2 WHERE id = ?3",
                    &[json!(read_at), json!(i64::from(synced)), json!(record_id)],
                )?;
                if !synced {
                    outbox::enqueue(
                        tx,
                        "notifications",
                        Operation::Update,
                        &record_id,
                        &Value::Object(patch),
                    )?;
                }
                Ok(())
            })
            .await?;

        if !synced {
            self.schedule_sync();
        }
        Ok(WriteOutcome { id, synced })
    }

    /// Manual stock correction. Always local; the new level reaches the
    /// remote through the outbox. Returns the new stock.
    pub async fn adjust_stock(&self, product_id: &str, delta: i64) -> Result<i64> {
        let store = self.engine.ensure_store_ready().await?;
        let id = product_id.to_string();
        let stock = store
            .with_transaction(move |tx| apply_stock_delta(tx, &id, delta))
            .await?
            .ok_or_else(|| SyncError::Config(format!("unknown product `{product_id}`")))?;
        self.schedule_sync();
        Ok(stock)
    }

    /// Generic write-through create/update for any mapped entity. When the
    /// remote cannot take it and the entity has no upload syncer, the stored
    /// row is queued in the outbox.
    pub async fn save(&self, spec: &'static EntitySpec, mut row: Row) -> Result<WriteOutcome> {
        let id = match spec.id_of(&row) {
            Some(id) => id,
            None => {
                let id = new_id();
                row.insert(spec.id_column.to_string(), json!(id));
                id
            }
        };
        if spec.fields.contains(&"created_at") && !row.contains_key("created_at") {
            row.insert("created_at".into(), json!(now()));
        }

        let synced = self.push(spec, &row).await?;
        let queue = !synced && !upload::has_syncer(spec);

        let store = self.engine.ensure_store_ready().await?;
        let record_id = id.clone();
        store
            .with_transaction(move |tx| {
                spec.upsert_local(tx, &row, synced, false)?;
                if queue {
                    let stored = tx.query_one(
                        &format!("SELECT * FROM {} WHERE {} = ?1", spec.local_table, spec.id_column),
                        &[json!(record_id)],
                    )?;
                    let snapshot = spec.payload(stored.as_ref().unwrap_or(&row));
                    outbox::enqueue(
                        tx,
                        spec.local_table,
                        Operation::Insert,
                        &record_id,
                        &Value::Object(snapshot),
                    )?;
                }
                Ok(())
            })
            .await?;

        if !synced {
            self.schedule_sync();
        }
        Ok(WriteOutcome { id, synced })
    }

    async fn push(&self, spec: &EntitySpec, row: &Row) -> Result<bool> {
        if !self.engine.is_online().await {
            return Ok(false);
        }
        let result = self
            .engine
            .remote()
            .upsert(spec.remote_table, &spec.payload(row))
            .await;
        accepted(spec.local_table, result)
    }
}

fn insert_child(tx: &Tx<'_>, child: &ChildSpec, row: &Row, synced: bool) -> Result<usize> {
    let payload = child.payload(row);
    let columns: Vec<&String> = payload.keys().collect();
    let placeholders: Vec<String> = (1..=columns.len() + 1).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {} ({}, synced) VALUES ({})",
        child.local_table,
        columns.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(", "),
        placeholders.join(", "),
    );
    let mut args: Vec<Value> = payload.values().cloned().collect();
    args.push(json!(i64::from(synced)));
    tx.execute(&sql, &args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::connectivity::ManualProbe;
    use crate::remote::MemoryRemote;
    use crate::store::{LocalStore, StoreProvider};
    use crate::sync::SyncOutcome;
    use std::time::Duration;

    struct Harness {
        _dir: tempfile::TempDir,
        engine: Arc<SyncEngine>,
        services: EntityServices,
        remote: Arc<MemoryRemote>,
        probe: Arc<ManualProbe>,
    }

    async fn harness(online: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(StoreProvider::new(
            dir.path().join("pos.db"),
            Duration::from_secs(10),
        ));
        let remote = Arc::new(MemoryRemote::new());
        let probe = Arc::new(ManualProbe::new(online));
        // Keep background runs out of the way of explicit ones.
        let config = SyncConfig {
            debounce_delay_ms: 600_000,
            ..SyncConfig::default()
        };
        let engine = SyncEngine::new(provider, remote.clone(), probe.clone(), config);

        let store = engine.ensure_store_ready().await.unwrap();
        store
            .execute(
                "INSERT INTO products (id, name, price, stock, synced) VALUES ('p1', 'Tea', 2.0, 10, 1)",
                vec![],
            )
            .await
            .unwrap();
        remote.seed(
            "products",
            vec![to_row(json!({ "id": "p1", "name": "Tea", "price": 2.0, "stock": 10 }))],
        );

        Harness {
            _dir: dir,
            services: EntityServices::new(engine.clone()),
            engine,
            remote,
            probe,
        }
    }

    async fn one(store: &LocalStore, sql: &str) -> Row {
        store.query_one(sql, vec![]).await.unwrap().unwrap()
    }

    fn tea_sale(id: &str, quantity: i64) -> NewSale {
        NewSale {
            id: Some(id.to_string()),
            payment_method: Some("cash".into()),
            items: vec![NewSaleItem {
                product_id: "p1".into(),
                quantity,
                unit_price: 2.0,
            }],
            ..NewSale::default()
        }
    }

    #[tokio::test]
    async fn test_offline_sale_syncs_after_reconnect() {
        let h = harness(false).await;
        let store = h.engine.ensure_store_ready().await.unwrap();

        let outcome = h.services.create_sale(tea_sale("s1", 2)).await.unwrap();
        assert_eq!(outcome, WriteOutcome { id: "s1".into(), synced: false });

        let sale = one(&store, "SELECT synced FROM sales WHERE id = 's1'").await;
        assert_eq!(sale["synced"], json!(0));
        let product = one(&store, "SELECT stock FROM products WHERE id = 'p1'").await;
        assert_eq!(product["stock"], json!(8));

        h.probe.set_online(true);
        let outcome = h.engine.sync_all().await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Completed(_)));

        assert!(h.remote.get("sales", "s1").is_some());
        let items = h.remote.rows("sale_items");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["sale_id"], json!("s1"));
        assert_eq!(h.remote.get("products", "p1").unwrap()["stock"], json!(8));

        let sale = one(&store, "SELECT synced FROM sales WHERE id = 's1'").await;
        assert_eq!(sale["synced"], json!(1));
        let item = one(&store, "SELECT synced FROM sale_items WHERE sale_id = 's1'").await;
        assert_eq!(item["synced"], json!(1));
        let product = one(&store, "SELECT stock, synced FROM products WHERE id = 'p1'").await;
        assert_eq!(product["stock"], json!(8));
        assert_eq!(product["synced"], json!(1));
    }

    #[tokio::test]
    async fn test_online_sale_is_written_through() {
        let h = harness(true).await;
        let store = h.engine.ensure_store_ready().await.unwrap();

        let outcome = h.services.create_sale(tea_sale("s2", 1)).await.unwrap();
        assert!(outcome.synced);
        assert!(h.remote.get("sales", "s2").is_some());
        assert_eq!(h.remote.rows("sale_items").len(), 1);

        let sale = one(&store, "SELECT synced FROM sales WHERE id = 's2'").await;
        assert_eq!(sale["synced"], json!(1));
        // Stock still goes through the outbox.
        let product = one(&store, "SELECT stock, synced FROM products WHERE id = 'p1'").await;
        assert_eq!(product["stock"], json!(9));
        assert_eq!(product["synced"], json!(0));
        assert_eq!(outbox::pending_count(&store).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_write_is_surfaced() {
        let h = harness(true).await;
        let store = h.engine.ensure_store_ready().await.unwrap();
        h.remote.set_unauthorized(true);

        let err = h.services.create_sale(tea_sale("s3", 1)).await.unwrap_err();
        assert!(err.is_unauthorized());

        let sales = store.query_all("SELECT id FROM sales", vec![]).await.unwrap();
        assert!(sales.is_empty());
        let product = one(&store, "SELECT stock FROM products WHERE id = 'p1'").await;
        assert_eq!(product["stock"], json!(10));
    }

    #[tokio::test]
    async fn test_refused_item_still_records_accepted_sale() {
        let h = harness(true).await;
        let store = h.engine.ensure_store_ready().await.unwrap();
        h.remote.refuse_table("sale_items");

        let err = h.services.create_sale(tea_sale("s5", 2)).await.unwrap_err();
        assert!(err.is_unauthorized());
        assert!(h.remote.get("sales", "s5").is_some());

        let sale = one(&store, "SELECT synced FROM sales WHERE id = 's5'").await;
        assert_eq!(sale["synced"], json!(1));
        let item = one(&store, "SELECT synced FROM sale_items WHERE sale_id = 's5'").await;
        assert_eq!(item["synced"], json!(0));
        let product = one(&store, "SELECT stock FROM products WHERE id = 'p1'").await;
        assert_eq!(product["stock"], json!(8));

        h.remote.restore_table("sale_items");
        h.engine.sync_all().await.unwrap();
        assert_eq!(h.remote.rows("sale_items").len(), 1);
        let item = one(&store, "SELECT synced FROM sale_items WHERE sale_id = 's5'").await;
        assert_eq!(item["synced"], json!(1));
    }

    #[tokio::test]
    async fn test_offline_product_reaches_remote_with_stock_changes() {
        let h = harness(false).await;
        let store = h.engine.ensure_store_ready().await.unwrap();

        let outcome = h
            .services
            .save(
                &entities::PRODUCTS,
                to_row(json!({ "id": "p9", "name": "Soap", "price": 1.5, "stock": 4 })),
            )
            .await
            .unwrap();
        assert!(!outcome.synced);
        assert_eq!(h.services.adjust_stock("p9", -1).await.unwrap(), 3);
        assert_eq!(outbox::pending_count(&store).await.unwrap(), 2);

        h.probe.set_online(true);
        h.engine.sync_all().await.unwrap();

        let remote = h.remote.get("products", "p9").unwrap();
        assert_eq!(remote["name"], json!("Soap"));
        assert_eq!(remote["stock"], json!(3));
        let local = one(&store, "SELECT synced FROM products WHERE id = 'p9'").await;
        assert_eq!(local["synced"], json!(1));
        assert_eq!(outbox::pending_count(&store).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_falls_back_to_local() {
        let h = harness(true).await;
        h.remote.fail_table("customers");

        let outcome = h
            .services
            .save(&entities::CUSTOMERS, to_row(json!({ "name": "Ana" })))
            .await
            .unwrap();
        assert!(!outcome.synced);

        let store = h.engine.ensure_store_ready().await.unwrap();
        let row = store
            .query_one("SELECT name, synced FROM customers WHERE id = ?1", vec![json!(outcome.id)])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["name"], json!("Ana"));
        assert_eq!(row["synced"], json!(0));
    }

    #[tokio::test]
    async fn test_concurrent_returns_both_land() {
        let h = harness(false).await;
        h.services.create_sale(tea_sale("s1", 1)).await.unwrap();
        h.services
            .create_sale(NewSale {
                items: vec![
                    NewSaleItem { product_id: "p1".into(), quantity: 1, unit_price: 2.0 },
                    NewSaleItem { product_id: "p1".into(), quantity: 1, unit_price: 2.0 },
                ],
                ..tea_sale("s4", 0)
            })
            .await
            .unwrap();

        let store = h.engine.ensure_store_ready().await.unwrap();
        let items = store
            .query_all("SELECT id FROM sale_items WHERE sale_id = 's4' ORDER BY rowid", vec![])
            .await
            .unwrap();
        let item_id = |i: usize| items[i]["id"].as_str().unwrap().to_string();
        let ret = |sale_item_id: String| NewReturn {
            id: None,
            sale_id: "s4".into(),
            sale_item_id,
            product_id: "p1".into(),
            quantity: 1,
            refund_amount: 2.0,
            reason: Some("damaged".into()),
        };

        let (a, b) = tokio::join!(
            h.services.create_return(ret(item_id(0))),
            h.services.create_return(ret(item_id(1))),
        );
        a.unwrap();
        b.unwrap();

        let returns = store
            .query_all("SELECT id FROM returns WHERE sale_id = 's4'", vec![])
            .await
            .unwrap();
        assert_eq!(returns.len(), 2);
        let product = one(&store, "SELECT stock FROM products WHERE id = 'p1'").await;
        assert_eq!(product["stock"], json!(9));
    }

    #[tokio::test]
    async fn test_notification_read_goes_through_outbox_when_offline() {
        let h = harness(false).await;
        let store = h.engine.ensure_store_ready().await.unwrap();
        store
            .execute(
                "INSERT INTO notifications (id, title, is_read, synced) VALUES ('n1', 'Low stock', 0, 1)",
                vec![],
            )
            .await
            .unwrap();
        h.remote.seed(
            "notifications",
            vec![to_row(json!({ "id": "n1", "title": "Low stock", "is_read": 0 }))],
        );

        let outcome = h.services.mark_notification_read("n1").await.unwrap();
        assert!(!outcome.synced);
        let local = one(&store, "SELECT is_read, synced FROM notifications WHERE id = 'n1'").await;
        assert_eq!(local["is_read"], json!(1));
        assert_eq!(local["synced"], json!(0));
        assert_eq!(outbox::pending_count(&store).await.unwrap(), 1);

        h.probe.set_online(true);
        h.engine.sync_all().await.unwrap();
        assert_eq!(h.remote.get("notifications", "n1").unwrap()["is_read"], json!(1));
        assert_eq!(outbox::pending_count(&store).await.unwrap(), 0);
        let local = one(&store, "SELECT synced FROM notifications WHERE id = 'n1'").await;
        assert_eq!(local["synced"], json!(1));
    }

    #[tokio::test]
    async fn test_adjust_stock_marks_product_unsynced() {
        let h = harness(false).await;
        assert_eq!(h.services.adjust_stock("p1", -3).await.unwrap(), 7);
        assert!(h.services.adjust_stock("missing", 1).await.is_err());

        let store = h.engine.ensure_store_ready().await.unwrap();
        let product = one(&store, "SELECT synced FROM products WHERE id = 'p1'").await;
        assert_eq!(product["synced"], json!(0));
    }
}
