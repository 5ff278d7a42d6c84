use tracing::warn;

use super::{decode_rows, OfflineWriter, Written};
use crate::db::cache;
use crate::error::SyncResult;
use crate::model::{EntityType, Session};
use crate::mutation::{Customer, CustomerPatch, Mutation};
use crate::remote::{row_id, Order, Query};

#[derive(Clone)]
pub struct CustomerFacade {
    writer: OfflineWriter,
}

impl CustomerFacade {
    pub fn new(writer: OfflineWriter) -> Self {
        Self { writer }
    }

    pub async fn create(&self, session: &Session, mut customer: Customer) -> SyncResult<Written<Customer>> {
        customer.store_id = session.store_id;
        self.writer
            .create(session, Mutation::CreateCustomer(customer))
            .await?
            .decode()
    }

    pub async fn update(&self, session: &Session, id: &str, patch: CustomerPatch) -> SyncResult<Written<Customer>> {
        let mutation = Mutation::UpdateCustomer {
            id: id.to_string(),
            patch,
        };
        self.writer.update(session, mutation).await?.decode()
    }

    pub async fn delete(&self, session: &Session, id: &str) -> SyncResult<Written<()>> {
        self.writer
            .delete(session, Mutation::DeleteCustomer { id: id.to_string() })
            .await
    }

    pub async fn list(&self, session: &Session) -> SyncResult<Vec<Written<Customer>>> {
        let rows = self.writer.list(session, EntityType::Customers).await?;
        Ok(decode_rows(rows))
    }

    /// Name search: server-side `ilike` when online, the cache otherwise.
    pub async fn search(&self, session: &Session, term: &str) -> SyncResult<Vec<Written<Customer>>> {
        let term = term.trim();
        if self.writer.is_online() {
            let query = Query::new()
                .eq("store_id", session.store_id)
                .ilike("fullname", &format!("%{}%", term))
                .order("fullname", Order::Asc);
            match self.writer.remote().select(EntityType::Customers.as_str(), &query).await {
                Ok(rows) => {
                    return Ok(rows
                        .into_iter()
                        .filter_map(|row| {
                            let id = row_id(&row)?;
                            let record = serde_json::from_value(row).ok()?;
                            Some(Written {
                                id,
                                record,
                                pending: false,
                            })
                        })
                        .collect())
                }
                Err(err) if err.is_network() => warn!(%err, "customer search falling back to cache"),
                Err(err) => return Err(err),
            }
        }

        let needle = term.to_lowercase();
        let rows = cache::get_or_empty(self.writer.pool(), EntityType::Customers, session.store_id).await;
        Ok(decode_rows::<Customer>(rows)
            .into_iter()
            .filter(|c| c.record.fullname.to_lowercase().contains(&needle))
            .collect())
    }
}
