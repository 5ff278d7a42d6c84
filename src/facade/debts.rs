use tracing::instrument;

use super::{decode_rows, OfflineWriter, Written};
use crate::db::cache;
use crate::error::SyncResult;
use crate::model::{EntityType, Session};
use crate::mutation::{DebtEntry, DebtPatch, Mutation};

/// Customer debts. The table is a ledger: payments are appended as new rows
/// and a customer's balance is the sum over their rows.
#[derive(Clone)]
pub struct DebtFacade {
    writer: OfflineWriter,
}

impl DebtFacade {
    pub fn new(writer: OfflineWriter) -> Self {
        Self { writer }
    }

    #[instrument(skip_all, fields(store_id = session.store_id))]
    pub async fn create(&self, session: &Session, mut entry: DebtEntry) -> SyncResult<Written<DebtEntry>> {
        entry.store_id = session.store_id;
        entry.created_by_user_id = session.user_id.clone();
        entry.remaining_balance = entry.owed - entry.deposited;
        self.writer.create(session, Mutation::CreateDebt(entry)).await?.decode()
    }

    pub async fn record_payment(
        &self,
        session: &Session,
        customer_name: &str,
        amount: i64,
    ) -> SyncResult<Written<DebtEntry>> {
        self.create(session, DebtEntry::payment(session, customer_name, amount)).await
    }

    #[instrument(skip_all, fields(store_id = session.store_id, id = id))]
    pub async fn update(&self, session: &Session, id: &str, mut patch: DebtPatch) -> SyncResult<Written<DebtEntry>> {
        if patch.owed.is_some() || patch.deposited.is_some() {
            if let Some(current) = self.writer.current(EntityType::Debts, id).await? {
                let current: DebtEntry = serde_json::from_value(current)?;
                let owed = patch.owed.unwrap_or(current.owed);
                let deposited = patch.deposited.unwrap_or(current.deposited);
                patch.remaining_balance = Some(owed - deposited);
            }
        }
        let mutation = Mutation::UpdateDebt {
            id: id.to_string(),
            patch,
        };
        self.writer.update(session, mutation).await?.decode()
    }

    pub async fn delete(&self, session: &Session, id: &str) -> SyncResult<Written<()>> {
        self.writer
            .delete(session, Mutation::DeleteDebt { id: id.to_string() })
            .await
    }

    pub async fn list(&self, session: &Session) -> SyncResult<Vec<Written<DebtEntry>>> {
        let rows = self.writer.list(session, EntityType::Debts).await?;
        Ok(decode_rows(rows))
    }

    /// Outstanding balance for a customer from the local ledger, pending rows
    /// included. Works offline.
    pub async fn balance_for(&self, session: &Session, customer_name: &str) -> SyncResult<i64> {
        let name = customer_name.trim();
        let rows = cache::get(self.writer.pool(), EntityType::Debts, session.store_id).await?;
        let balance = decode_rows::<DebtEntry>(rows)
            .into_iter()
            .filter(|d| d.record.customer_name.trim().eq_ignore_ascii_case(name))
            .map(|d| d.record.owed - d.record.deposited)
            .sum();
        Ok(balance)
    }
}
