//! Fixed entity mappings: local table, remote table, id column and the
//! fields that travel between them.

use serde_json::Value;

use crate::db::Row;
use crate::error::{Result, SyncError};
use crate::store::{Executor, Tx};

/// How an upload syncer pushes a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    /// Send the whole row as an upsert keyed on the id column.
    Upsert,
    /// Send only these fields as an update of the existing remote row.
    Patch(&'static [&'static str]),
}

/// Child rows uploaded together with their parent.
#[derive(Debug)]
pub struct ChildSpec {
    pub local_table: &'static str,
    pub remote_table: &'static str,
    pub parent_column: &'static str,
    pub fields: &'static [&'static str],
}

#[derive(Debug)]
pub struct EntitySpec {
    pub local_table: &'static str,
    pub remote_table: &'static str,
    pub id_column: &'static str,
    pub fields: &'static [&'static str],
    pub mode: UploadMode,
    pub child: Option<&'static ChildSpec>,
}

pub static CATEGORIES: EntitySpec = EntitySpec {
    local_table: "categories",
    remote_table: "categories",
    id_column: "id",
    fields: &["id", "name", "description", "created_at", "updated_at"],
    mode: UploadMode::Upsert,
    child: None,
};

pub static SUPPLIERS: EntitySpec = EntitySpec {
    local_table: "suppliers",
    remote_table: "suppliers",
    id_column: "id",
    fields: &["id", "name", "phone", "email", "address", "created_at", "updated_at"],
    mode: UploadMode::Upsert,
    child: None,
};

pub static PRODUCTS: EntitySpec = EntitySpec {
    local_table: "products",
    remote_table: "products",
    id_column: "id",
    fields: &[
        "id",
        "name",
        "sku",
        "barcode",
        "category_id",
        "supplier_id",
        "price",
        "cost_price",
        "stock",
        "min_stock",
        "unit",
        "created_at",
        "updated_at",
    ],
    mode: UploadMode::Upsert,
    child: None,
};

pub static CUSTOMERS: EntitySpec = EntitySpec {
    local_table: "customers",
    remote_table: "customers",
    id_column: "id",
    fields: &["id", "name", "phone", "email", "address", "created_at", "updated_at"],
    mode: UploadMode::Upsert,
    child: None,
};

pub static USERS: EntitySpec = EntitySpec {
    local_table: "users",
    remote_table: "users",
    id_column: "id",
    fields: &[
        "id",
        "name",
        "email",
        "phone",
        "role",
        "is_active",
        "created_at",
        "updated_at",
    ],
    mode: UploadMode::Upsert,
    child: None,
};

const SALE_ITEM_FIELDS: &[&str] = &[
    "id",
    "sale_id",
    "product_id",
    "quantity",
    "unit_price",
    "subtotal",
    "created_at",
];

pub static SALE_ITEMS: ChildSpec = ChildSpec {
    local_table: "sale_items",
    remote_table: "sale_items",
    parent_column: "sale_id",
    fields: SALE_ITEM_FIELDS,
};

pub static SALES: EntitySpec = EntitySpec {
    local_table: "sales",
    remote_table: "sales",
    id_column: "id",
    fields: &[
        "id",
        "customer_id",
        "user_id",
        "total_amount",
        "discount",
        "payment_method",
        "status",
        "created_at",
        "updated_at",
    ],
    mode: UploadMode::Upsert,
    child: Some(&SALE_ITEMS),
};

pub static DEBTS: EntitySpec = EntitySpec {
    local_table: "debts",
    remote_table: "debts",
    id_column: "id",
    fields: &[
        "id",
        "sale_id",
        "customer_id",
        "amount",
        "paid_amount",
        "status",
        "due_date",
        "created_at",
        "updated_at",
    ],
    mode: UploadMode::Upsert,
    child: None,
};

pub static RETURNS: EntitySpec = EntitySpec {
    local_table: "returns",
    remote_table: "returns",
    id_column: "id",
    fields: &[
        "id",
        "sale_id",
        "sale_item_id",
        "product_id",
        "quantity",
        "refund_amount",
        "reason",
        "created_at",
    ],
    mode: UploadMode::Upsert,
    child: None,
};

const PURCHASE_ITEM_FIELDS: &[&str] = &[
    "id",
    "purchase_order_id",
    "product_id",
    "quantity",
    "unit_cost",
    "subtotal",
    "created_at",
];

pub static PURCHASE_ITEMS: ChildSpec = ChildSpec {
    local_table: "purchase_items",
    remote_table: "purchase_items",
    parent_column: "purchase_order_id",
    fields: PURCHASE_ITEM_FIELDS,
};

pub static PURCHASE_ORDERS: EntitySpec = EntitySpec {
    local_table: "purchase_orders",
    remote_table: "purchase_orders",
    id_column: "id",
    fields: &[
        "id",
        "supplier_id",
        "user_id",
        "total_amount",
        "status",
        "expected_date",
        "created_at",
        "updated_at",
    ],
    mode: UploadMode::Upsert,
    child: Some(&PURCHASE_ITEMS),
};

pub static NOTIFICATIONS: EntitySpec = EntitySpec {
    local_table: "notifications",
    remote_table: "notifications",
    id_column: "id",
    fields: &[
        "id", "user_id", "title", "message", "type", "is_read", "read_at", "created_at",
    ],
    mode: UploadMode::Patch(&["is_read", "read_at"]),
    child: None,
};

pub static INVENTORY_AUDITS: EntitySpec = EntitySpec {
    local_table: "inventory_audits",
    remote_table: "inventory_audits",
    id_column: "id",
    fields: &[
        "id",
        "product_id",
        "user_id",
        "expected_stock",
        "counted_stock",
        "difference",
        "notes",
        "created_at",
    ],
    mode: UploadMode::Upsert,
    child: None,
};

pub static FEEDBACK: EntitySpec = EntitySpec {
    local_table: "feedback",
    remote_table: "feedback",
    id_column: "id",
    fields: &["id", "user_id", "rating", "message", "created_at"],
    mode: UploadMode::Upsert,
    child: None,
};

/// Every entity with its own table.
pub static ALL: [&EntitySpec; 14] = [
    &CATEGORIES,
    &SUPPLIERS,
    &PRODUCTS,
    &CUSTOMERS,
    &USERS,
    &SALES,
    &DEBTS,
    &RETURNS,
    &PURCHASE_ORDERS,
    &NOTIFICATIONS,
    &INVENTORY_AUDITS,
    &FEEDBACK,
    &CHILD_SALE_ITEMS,
    &CHILD_PURCHASE_ITEMS,
];

// Child tables are also addressable on their own (outbox entries, lookups).
static CHILD_SALE_ITEMS: EntitySpec = EntitySpec {
    local_table: "sale_items",
    remote_table: "sale_items",
    id_column: "id",
    fields: SALE_ITEM_FIELDS,
    mode: UploadMode::Upsert,
    child: None,
};

static CHILD_PURCHASE_ITEMS: EntitySpec = EntitySpec {
    local_table: "purchase_items",
    remote_table: "purchase_items",
    id_column: "id",
    fields: PURCHASE_ITEM_FIELDS,
    mode: UploadMode::Upsert,
    child: None,
};

/// Look up the mapping for a local table name.
pub fn for_table(table: &str) -> Option<&'static EntitySpec> {
    ALL.iter().copied().find(|spec| spec.local_table == table)
}

/// Identifier column of `table`, used by the generic outbox processor.
pub fn id_column(table: &str) -> Result<&'static str> {
    for_table(table)
        .map(|spec| spec.id_column)
        .ok_or_else(|| SyncError::UnknownTable(table.to_string()))
}

/// Project a local row onto the given field list, dropping local-only
/// columns such as `synced`.
pub fn project(fields: &[&str], row: &Row) -> Row {
    fields
        .iter()
        .filter_map(|f| row.get(*f).map(|v| (f.to_string(), v.clone())))
        .collect()
}

/// String form of an id value.
pub fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl EntitySpec {
    pub fn payload(&self, row: &Row) -> Row {
        project(self.fields, row)
    }

    pub fn id_of(&self, row: &Row) -> Option<String> {
        id_string(row.get(self.id_column))
    }

    /// Insert or update a local row from `row`, using the known fields it
    /// carries, and set its `synced` flag.
    ///
    /// With `keep_unsynced`, an existing row that has local changes
    /// (`synced = 0`) is left untouched. Returns the number of rows written.
    pub fn upsert_local(
        &self,
        tx: &Tx<'_>,
        row: &Row,
        synced: bool,
        keep_unsynced: bool,
    ) -> Result<usize> {
        let columns: Vec<&str> = self
            .fields
            .iter()
            .copied()
            .filter(|f| row.contains_key(*f))
            .collect();
        if !columns.contains(&self.id_column) {
            return Ok(0);
        }

        let placeholders: Vec<String> = (1..=columns.len() + 1).map(|i| format!("?{i}")).collect();
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| **c != self.id_column)
            .map(|c| format!("{c} = excluded.{c}"))
            .chain(std::iter::once("synced = excluded.synced".to_string()))
            .collect();
        let guard = if keep_unsynced {
            format!(" WHERE {}.synced = 1", self.local_table)
        } else {
            String::new()
        };
        let sql = format!(
            "INSERT INTO {table} ({cols}, synced) VALUES ({vals})
             ON CONFLICT({id}) DO UPDATE SET {updates}{guard}",
            table = self.local_table,
            cols = columns.join(", "),
            vals = placeholders.join(", "),
            id = self.id_column,
            updates = updates.join(", "),
        );

        let mut args: Vec<Value> = columns.iter().map(|c| row[*c].clone()).collect();
        args.push(Value::from(i64::from(synced)));
        tx.execute(&sql, &args)
    }

    /// Mark one row synced, but only while it still matches the snapshot
    /// that was uploaded. A row changed locally in the meantime stays
    /// unsynced for the next pass.
    pub fn mark_synced_if_unchanged(&self, tx: &Tx<'_>, snapshot: &Row) -> Result<bool> {
        mark_synced_if_unchanged(tx, self.local_table, self.id_column, self.fields, snapshot)
    }
}

impl ChildSpec {
    pub fn payload(&self, row: &Row) -> Row {
        project(self.fields, row)
    }

    pub fn mark_synced_if_unchanged(&self, tx: &Tx<'_>, snapshot: &Row) -> Result<bool> {
        mark_synced_if_unchanged(tx, self.local_table, "id", self.fields, snapshot)
    }
}

fn mark_synced_if_unchanged(
    tx: &Tx<'_>,
    table: &str,
    id_column: &str,
    fields: &[&str],
    snapshot: &Row,
) -> Result<bool> {
    let Some(id) = id_string(snapshot.get(id_column)) else {
        return Ok(false);
    };
    let current = tx.query_one(
        &format!("SELECT * FROM {table} WHERE {id_column} = ?1"),
        &[Value::from(id.clone())],
    )?;
    let Some(current) = current else {
        return Ok(false);
    };
    // A field missing from the snapshot only matches a NULL column.
    let unchanged = fields.iter().all(|f| {
        current.get(*f).unwrap_or(&Value::Null) == snapshot.get(*f).unwrap_or(&Value::Null)
    });
    if !unchanged {
        return Ok(false);
    }
    let changed = tx.execute(
        &format!("UPDATE {table} SET synced = 1 WHERE {id_column} = ?1"),
        &[Value::from(id)],
    )?;
    Ok(changed > 0)
}
