//! Sends one typed mutation to the remote store, together with the inventory
//! bookkeeping that sales imply. Used by the sync engine and by the facades'
//! direct path.
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::mutation::Mutation;
use crate::remote::{row_id, Filter, Query, RemoteStore};

const INVENTORY: &str = "dynamic_inventory";
/// Inventory column holding the refs of the latest stock movements.
const APPLIED_REFS: &str = "applied_refs";
const APPLIED_REFS_KEPT: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// Server id of the created or updated row.
    pub server_id: Option<String>,
    pub row: Option<Value>,
    /// A create found its row already present from an earlier attempt.
    pub duplicate: bool,
}

impl Applied {
    fn row(row: Value, duplicate: bool) -> Self {
        Self {
            server_id: row_id(&row),
            row: Some(row),
            duplicate,
        }
    }

    fn empty() -> Self {
        Self {
            server_id: None,
            row: None,
            duplicate: false,
        }
    }
}

pub async fn apply(remote: &dyn RemoteStore, mutation: &Mutation, client_ref: &str) -> SyncResult<Applied> {
    let table = mutation.entity_type().as_str();
    match mutation {
        Mutation::CreateDebt(_) | Mutation::CreateSaleGroup(_) | Mutation::CreateCustomer(_) => {
            let (row, duplicate) = create_once(remote, table, mutation.data(), client_ref).await?;
            Ok(Applied::row(row, duplicate))
        }
        Mutation::CreateSale(line) => {
            let (row, duplicate) = create_once(remote, table, mutation.data(), client_ref).await?;
            // A replayed create may have stopped between the insert and the stock move.
            let moved = adjust_stock(
                remote,
                line.store_id,
                &line.dynamic_product_id,
                -line.quantity,
                line.quantity,
                client_ref,
            )
            .await?;
            if moved.is_none() {
                warn!(product = %line.dynamic_product_id, "no inventory row for sold product");
            }
            Ok(Applied::row(row, duplicate))
        }
        Mutation::UpdateDebt { id, .. } | Mutation::UpdateCustomer { id, .. } => {
            let rows = remote.update(table, &[Filter::eq("id", id)], &mutation.data()).await?;
            let row = rows
                .into_iter()
                .next()
                .ok_or_else(|| SyncError::Conflict(format!("{} {} no longer exists", table, id)))?;
            Ok(Applied::row(row, false))
        }
        Mutation::DeleteDebt { id } | Mutation::DeleteSaleGroup { id } | Mutation::DeleteCustomer { id } => {
            remote.delete(table, &[Filter::eq("id", id)]).await?;
            Ok(Applied::empty())
        }
        Mutation::DeleteSale { id, line } => {
            // Restock first, while the row still proves the sale exists. A
            // replay after the delete landed finds nothing and stops here.
            let existing = remote
                .select(table, &Query::new().eq("id", id).range(0, 0))
                .await?;
            if existing.is_empty() {
                debug!(id = %id, "sale already gone; nothing to restock");
                return Ok(Applied::empty());
            }
            let moved = adjust_stock(
                remote,
                line.store_id,
                &line.dynamic_product_id,
                line.quantity,
                -line.quantity,
                client_ref,
            )
            .await?;
            if moved.is_none() {
                warn!(product = %line.dynamic_product_id, "no inventory row to restock");
            }
            remote.delete(table, &[Filter::eq("id", id)]).await?;
            Ok(Applied::empty())
        }
        Mutation::AdjustInventory(adj) => {
            let row = adjust_stock(remote, adj.store_id, &adj.dynamic_product_id, adj.delta, 0, client_ref)
                .await?
                .ok_or_else(|| {
                    SyncError::Conflict(format!("no inventory row for product {}", adj.dynamic_product_id))
                })?;
            Ok(Applied::row(row, false))
        }
    }
}

/// Insert unless a row carrying `client_ref` already exists.
async fn create_once(
    remote: &dyn RemoteStore,
    table: &str,
    mut payload: Value,
    client_ref: &str,
) -> SyncResult<(Value, bool)> {
    let existing = remote
        .select(table, &Query::new().eq("client_ref", client_ref).range(0, 0))
        .await?;
    if let Some(row) = existing.into_iter().next() {
        debug!(table, client_ref, "create already applied");
        return Ok((row, true));
    }

    if let Value::Object(map) = &mut payload {
        map.insert("client_ref".to_string(), Value::String(client_ref.to_string()));
    }
    let row = remote.insert(table, &payload).await?;
    if row_id(&row).is_none() {
        return Err(SyncError::Conflict(format!("insert into {} returned no id", table)));
    }
    Ok((row, false))
}

fn int_field(row: &Value, key: &str) -> i64 {
    match row.get(key) {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn applied_refs(row: &Value) -> Vec<String> {
    match row.get(APPLIED_REFS) {
        Some(Value::Array(refs)) => refs.iter().filter_map(|r| r.as_str().map(str::to_string)).collect(),
        _ => Vec::new(),
    }
}

/// Move stock for one product. Neither counter goes below zero. The row
/// remembers the refs of its recent movements, so replaying `movement_ref`
/// leaves it untouched. Returns the inventory row, or `None` when the product
/// has no inventory row.
async fn adjust_stock(
    remote: &dyn RemoteStore,
    store_id: i64,
    product_id: &str,
    available_delta: i64,
    sold_delta: i64,
    movement_ref: &str,
) -> SyncResult<Option<Value>> {
    let rows = remote
        .select(
            INVENTORY,
            &Query::new()
                .eq("dynamic_product_id", product_id)
                .eq("store_id", store_id)
                .range(0, 0),
        )
        .await?;
    let Some(current) = rows.into_iter().next() else {
        return Ok(None);
    };
    let id = row_id(&current)
        .ok_or_else(|| SyncError::Conflict(format!("inventory row for {} has no id", product_id)))?;

    let mut refs = applied_refs(&current);
    if refs.iter().any(|r| r == movement_ref) {
        debug!(product = product_id, movement_ref, "stock movement already applied");
        return Ok(Some(current));
    }
    refs.push(movement_ref.to_string());
    if refs.len() > APPLIED_REFS_KEPT {
        refs.drain(..refs.len() - APPLIED_REFS_KEPT);
    }

    let available = (int_field(&current, "available_qty") + available_delta).max(0);
    let sold = (int_field(&current, "quantity_sold") + sold_delta).max(0);
    let patch = json!({
        "available_qty": available,
        "quantity_sold": sold,
        "applied_refs": refs,
        "updated_at": Utc::now().to_rfc3339(),
    });
    let updated = remote.update(INVENTORY, &[Filter::eq("id", &id)], &patch).await?;
    debug!(product = product_id, available, sold, "inventory adjusted");
    Ok(Some(updated.into_iter().next().unwrap_or(current)))
}
