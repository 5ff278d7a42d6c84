use serde::Serialize;
use tracing::{info, instrument};

use super::inventory::adjust_cached_stock;
use super::{OfflineWriter, Written};
use crate::error::{SyncError, SyncResult};
use crate::model::{EntityType, Session};
use crate::mutation::{Mutation, SaleGroup, SaleLine};

/// A completed checkout: the group and its lines.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checkout {
    pub group: Written<SaleGroup>,
    pub lines: Vec<Written<SaleLine>>,
}

impl Checkout {
    pub fn pending(&self) -> bool {
        self.group.pending || self.lines.iter().any(|l| l.pending)
    }
}

#[derive(Clone)]
pub struct SalesFacade {
    writer: OfflineWriter,
}

impl SalesFacade {
    pub fn new(writer: OfflineWriter) -> Self {
        Self { writer }
    }

    pub async fn create_sale_group(&self, session: &Session, mut group: SaleGroup) -> SyncResult<Written<SaleGroup>> {
        group.store_id = session.store_id;
        group.created_by_user_id = session.user_id.clone();
        self.writer
            .create(session, Mutation::CreateSaleGroup(group))
            .await?
            .decode()
    }

    /// Record one sale line. Stock is taken from the product's inventory.
    #[instrument(skip_all, fields(store_id = session.store_id, product = %line.dynamic_product_id))]
    pub async fn create_sale(&self, session: &Session, mut line: SaleLine) -> SyncResult<Written<SaleLine>> {
        line.store_id = session.store_id;
        line.created_by_user_id = session.user_id.clone();
        let (product, quantity) = (line.dynamic_product_id.clone(), line.quantity);
        let written: Written<SaleLine> = self.writer.create(session, Mutation::CreateSale(line)).await?.decode()?;
        adjust_cached_stock(self.writer.pool(), session.store_id, &product, -quantity, quantity).await?;
        Ok(written)
    }

    /// Delete a sale line and put its quantity back into stock.
    #[instrument(skip_all, fields(store_id = session.store_id, id = id))]
    pub async fn delete_sale(&self, session: &Session, id: &str) -> SyncResult<Written<()>> {
        let current = self
            .writer
            .current(EntityType::DynamicSales, id)
            .await?
            .ok_or_else(|| SyncError::validation(format!("unknown sale {}", id)))?;
        let line: SaleLine = serde_json::from_value(current)?;
        let (product, quantity) = (line.dynamic_product_id.clone(), line.quantity);

        let written = self
            .writer
            .delete(
                session,
                Mutation::DeleteSale {
                    id: id.to_string(),
                    line,
                },
            )
            .await?;
        adjust_cached_stock(self.writer.pool(), session.store_id, &product, quantity, -quantity).await?;
        Ok(written)
    }

    /// Create a sale group and its lines. Every line is validated before
    /// anything is written. When the group is queued, its lines are queued
    /// too and sync after it.
    #[instrument(skip_all, fields(store_id = session.store_id, lines = lines.len()))]
    pub async fn checkout(&self, session: &Session, mut group: SaleGroup, lines: Vec<SaleLine>) -> SyncResult<Checkout> {
        if lines.is_empty() {
            return Err(SyncError::validation("checkout without sale lines"));
        }
        for line in &lines {
            line.validate()?;
        }
        if group.total_amount == 0 {
            group.total_amount = lines.iter().map(|l| l.amount).sum();
        }

        let group = self.create_sale_group(session, group).await?;
        let mut written = Vec::with_capacity(lines.len());
        for line in lines {
            let line = line.in_group(group.id.clone());
            written.push(self.create_sale(session, line).await?);
        }
        let checkout = Checkout { group, lines: written };
        info!(
            group_id = %checkout.group.id,
            pending = checkout.pending(),
            "checkout recorded"
        );
        Ok(checkout)
    }
}
