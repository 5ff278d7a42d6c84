use serde_json::{json, Value};
use tracing::instrument;

use super::{OfflineWriter, Written};
use crate::db::{cache, Pool};
use crate::error::SyncResult;
use crate::model::{now_ms, CachedEntity, EntityType, Session};
use crate::mutation::{InventoryAdjustment, Mutation};
use crate::remote::row_id;

fn same_product(row: &Value, product_id: &str) -> bool {
    match row.get("dynamic_product_id") {
        Some(Value::String(s)) => s == product_id,
        Some(Value::Number(n)) => n.to_string() == product_id,
        _ => false,
    }
}

fn qty(row: &Value, key: &str) -> i64 {
    row.get(key).and_then(Value::as_i64).unwrap_or(0)
}

/// Mirror a stock movement in the cached inventory rows so reads reflect it
/// before the next refresh. Clamped at zero like the remote side.
pub(crate) async fn adjust_cached_stock(
    pool: &Pool,
    store_id: i64,
    product_id: &str,
    available_delta: i64,
    sold_delta: i64,
) -> SyncResult<()> {
    let rows = cache::get(pool, EntityType::DynamicInventory, store_id).await?;
    for mut record in rows.into_iter().filter(|r| same_product(&r.payload, product_id)) {
        let available = (qty(&record.payload, "available_qty") + available_delta).max(0);
        let sold = (qty(&record.payload, "quantity_sold") + sold_delta).max(0);
        if let Value::Object(map) = &mut record.payload {
            map.insert("available_qty".into(), json!(available));
            map.insert("quantity_sold".into(), json!(sold));
        }
        record.updated_at = now_ms();
        cache::put(pool, &record).await?;
    }
    Ok(())
}

#[derive(Clone)]
pub struct InventoryFacade {
    writer: OfflineWriter,
}

impl InventoryFacade {
    pub fn new(writer: OfflineWriter) -> Self {
        Self { writer }
    }

    /// Move `available_qty` of a product by `delta`; stock never drops below zero.
    /// `id` is the inventory row id when applied directly, else the queue ref.
    #[instrument(skip_all, fields(store_id = session.store_id, product = product_id, delta = delta))]
    pub async fn adjust(
        &self,
        session: &Session,
        product_id: &str,
        delta: i64,
        reason: Option<&str>,
    ) -> SyncResult<Written<InventoryAdjustment>> {
        let adjustment = InventoryAdjustment {
            dynamic_product_id: product_id.to_string(),
            store_id: session.store_id,
            delta,
            reason: reason.map(str::to_string),
        };
        let written = self
            .writer
            .submit(session, Mutation::AdjustInventory(adjustment.clone()))
            .await?;

        match &written.record {
            Some(row) => {
                if let Some(id) = row_id(row) {
                    let record =
                        CachedEntity::synced(EntityType::DynamicInventory, session.store_id, id, row.clone());
                    cache::put(self.writer.pool(), &record).await?;
                }
            }
            None => adjust_cached_stock(self.writer.pool(), session.store_id, product_id, delta, 0).await?,
        }
        Ok(Written {
            id: written.id,
            record: adjustment,
            pending: written.pending,
        })
    }

    /// Cached `available_qty` of a product, if its inventory row is cached.
    pub async fn available(&self, session: &Session, product_id: &str) -> SyncResult<Option<i64>> {
        let rows = cache::get(self.writer.pool(), EntityType::DynamicInventory, session.store_id).await?;
        Ok(rows
            .iter()
            .find(|r| same_product(&r.payload, product_id))
            .map(|r| qty(&r.payload, "available_qty")))
    }
}
