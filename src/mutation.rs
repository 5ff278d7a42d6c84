//! Typed mutations. Queue items carry `(entity_type, operation, data)`; this
//! module turns them into a tagged union with one payload schema per entity.
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::error::{SyncError, SyncResult};
use crate::model::{is_temp_id, EntityType, Operation, QueueItem, Session};

static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9][0-9 \-]{5,18}[0-9]$").expect("phone pattern compiles"));

fn require_name(field: &str, value: &str) -> SyncResult<()> {
    if value.trim().is_empty() {
        return Err(SyncError::validation(format!("{} must be non-empty", field)));
    }
    Ok(())
}

fn check_phone(phone: Option<&str>) -> SyncResult<()> {
    match phone.map(str::trim).filter(|p| !p.is_empty()) {
        Some(p) if !PHONE_RE.is_match(p) => Err(SyncError::validation(format!("invalid phone number {}", p))),
        _ => Ok(()),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Text(s) => s,
            RawId::Number(n) => n.to_string(),
        }
    }
}

/// Foreign keys arrive as numbers from the server and as strings locally.
fn id_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    RawId::deserialize(d).map(String::from)
}

fn opt_id_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<RawId>::deserialize(d)?.map(String::from))
}

fn non_negative(field: &str, value: i64) -> SyncResult<()> {
    if value < 0 {
        return Err(SyncError::validation(format!("{} must be >= 0", field)));
    }
    Ok(())
}

/// One row of the debts ledger. Payments are new rows (`owed = 0`), never
/// edits of an earlier balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebtEntry {
    pub customer_name: String,
    #[serde(default, deserialize_with = "opt_id_string", skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    pub owed: i64,
    pub deposited: i64,
    pub remaining_balance: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    pub store_id: i64,
    pub created_by_user_id: String,
}

impl DebtEntry {
    pub fn new(session: &Session, customer_name: impl Into<String>, owed: i64, deposited: i64) -> Self {
        Self {
            customer_name: customer_name.into(),
            customer_id: None,
            phone_number: None,
            owed,
            deposited,
            remaining_balance: owed - deposited,
            notes: None,
            date: None,
            store_id: session.store_id,
            created_by_user_id: session.user_id.clone(),
        }
    }

    /// A payment against an existing balance.
    pub fn payment(session: &Session, customer_name: impl Into<String>, amount: i64) -> Self {
        Self::new(session, customer_name, 0, amount)
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone_number = Some(phone.into());
        self
    }

    pub fn validate(&self) -> SyncResult<()> {
        require_name("customer_name", &self.customer_name)?;
        check_phone(self.phone_number.as_deref())?;
        non_negative("owed", self.owed)?;
        non_negative("deposited", self.deposited)?;
        if self.owed == 0 && self.deposited == 0 {
            return Err(SyncError::validation("a debt entry needs an amount owed or deposited"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebtPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposited: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_balance: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl DebtPatch {
    pub fn validate(&self) -> SyncResult<()> {
        if self == &DebtPatch::default() {
            return Err(SyncError::validation("empty debt update"));
        }
        if let Some(name) = &self.customer_name {
            require_name("customer_name", name)?;
        }
        check_phone(self.phone_number.as_deref())?;
        non_negative("owed", self.owed.unwrap_or(0))?;
        non_negative("deposited", self.deposited.unwrap_or(0))
    }
}

/// Parent row of a checkout; sale lines point at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleGroup {
    pub store_id: i64,
    pub total_amount: i64,
    pub payment_method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,
    pub created_by_user_id: String,
}

impl SaleGroup {
    pub fn new(session: &Session, total_amount: i64, payment_method: impl Into<String>) -> Self {
        Self {
            store_id: session.store_id,
            total_amount,
            payment_method: payment_method.into(),
            email_address: session.email.clone(),
            created_by_user_id: session.user_id.clone(),
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        non_negative("total_amount", self.total_amount)?;
        require_name("payment_method", &self.payment_method)
    }
}

/// One line of a sale (`dynamic_sales` row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleLine {
    #[serde(default, deserialize_with = "opt_id_string", skip_serializing_if = "Option::is_none")]
    pub sale_group_id: Option<String>,
    #[serde(deserialize_with = "id_string")]
    pub dynamic_product_id: String,
    pub quantity: i64,
    pub unit_price: i64,
    pub amount: i64,
    pub payment_method: String,
    #[serde(default, deserialize_with = "opt_id_string", skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    pub store_id: i64,
    pub created_by_user_id: String,
}

impl SaleLine {
    pub fn new(
        session: &Session,
        dynamic_product_id: impl Into<String>,
        quantity: i64,
        unit_price: i64,
        payment_method: impl Into<String>,
    ) -> Self {
        Self {
            sale_group_id: None,
            dynamic_product_id: dynamic_product_id.into(),
            quantity,
            unit_price,
            amount: quantity.saturating_mul(unit_price),
            payment_method: payment_method.into(),
            customer_id: None,
            store_id: session.store_id,
            created_by_user_id: session.user_id.clone(),
        }
    }

    pub fn in_group(mut self, sale_group_id: impl Into<String>) -> Self {
        self.sale_group_id = Some(sale_group_id.into());
        self
    }

    pub fn validate(&self) -> SyncResult<()> {
        require_name("dynamic_product_id", &self.dynamic_product_id)?;
        if self.quantity <= 0 {
            return Err(SyncError::validation("quantity must be positive"));
        }
        non_negative("unit_price", self.unit_price)?;
        non_negative("amount", self.amount)?;
        require_name("payment_method", &self.payment_method)
    }
}

/// Stock correction for one product; `delta` is applied to `available_qty`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryAdjustment {
    #[serde(deserialize_with = "id_string")]
    pub dynamic_product_id: String,
    pub store_id: i64,
    pub delta: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl InventoryAdjustment {
    pub fn validate(&self) -> SyncResult<()> {
        require_name("dynamic_product_id", &self.dynamic_product_id)?;
        if self.delta == 0 {
            return Err(SyncError::validation("inventory adjustment of zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub fullname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub store_id: i64,
}

impl Customer {
    pub fn new(session: &Session, fullname: impl Into<String>) -> Self {
        Self {
            fullname: fullname.into(),
            phone_number: None,
            email: None,
            address: None,
            store_id: session.store_id,
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        require_name("fullname", &self.fullname)?;
        check_phone(self.phone_number.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fullname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl CustomerPatch {
    pub fn validate(&self) -> SyncResult<()> {
        if self == &CustomerPatch::default() {
            return Err(SyncError::validation("empty customer update"));
        }
        if let Some(name) = &self.fullname {
            require_name("fullname", name)?;
        }
        check_phone(self.phone_number.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    CreateDebt(DebtEntry),
    UpdateDebt { id: String, patch: DebtPatch },
    DeleteDebt { id: String },
    CreateSaleGroup(SaleGroup),
    DeleteSaleGroup { id: String },
    CreateSale(SaleLine),
    /// Carries the line so its stock can be restored.
    DeleteSale { id: String, line: SaleLine },
    AdjustInventory(InventoryAdjustment),
    CreateCustomer(Customer),
    UpdateCustomer { id: String, patch: CustomerPatch },
    DeleteCustomer { id: String },
}

fn decode<T: DeserializeOwned>(entity_type: EntityType, data: &Value) -> SyncResult<T> {
    serde_json::from_value(data.clone())
        .map_err(|e| SyncError::Payload(format!("{} payload: {}", entity_type.as_str(), e)))
}

impl Mutation {
    /// Rebuild a mutation from its queued form.
    pub fn decode(
        entity_type: EntityType,
        operation: Operation,
        entity_id: Option<&str>,
        data: &Value,
    ) -> SyncResult<Self> {
        let id = || {
            entity_id.map(str::to_string).ok_or_else(|| {
                SyncError::Payload(format!(
                    "{}/{} without entity id",
                    entity_type.as_str(),
                    operation.as_str()
                ))
            })
        };
        let mutation = match (entity_type, operation) {
            (EntityType::Debts, Operation::Create) => Mutation::CreateDebt(decode(entity_type, data)?),
            (EntityType::Debts, Operation::Update) => Mutation::UpdateDebt {
                id: id()?,
                patch: decode(entity_type, data)?,
            },
            (EntityType::Debts, Operation::Delete) => Mutation::DeleteDebt { id: id()? },
            (EntityType::SaleGroups, Operation::Create) => Mutation::CreateSaleGroup(decode(entity_type, data)?),
            (EntityType::SaleGroups, Operation::Delete) => Mutation::DeleteSaleGroup { id: id()? },
            (EntityType::DynamicSales, Operation::Create) => Mutation::CreateSale(decode(entity_type, data)?),
            (EntityType::DynamicSales, Operation::Delete) => Mutation::DeleteSale {
                id: id()?,
                line: decode(entity_type, data)?,
            },
            (EntityType::DynamicInventory, Operation::Update) => {
                Mutation::AdjustInventory(decode(entity_type, data)?)
            }
            (EntityType::Customers, Operation::Create) => Mutation::CreateCustomer(decode(entity_type, data)?),
            (EntityType::Customers, Operation::Update) => Mutation::UpdateCustomer {
                id: id()?,
                patch: decode(entity_type, data)?,
            },
            (EntityType::Customers, Operation::Delete) => Mutation::DeleteCustomer { id: id()? },
            (entity_type, operation) => {
                return Err(SyncError::Unsupported {
                    entity_type: entity_type.as_str().to_string(),
                    operation: operation.as_str().to_string(),
                })
            }
        };
        Ok(mutation)
    }

    pub fn from_item(item: &QueueItem) -> SyncResult<Self> {
        Self::decode(item.entity_type, item.operation, item.entity_id.as_deref(), &item.data)
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            Mutation::CreateDebt(_) | Mutation::UpdateDebt { .. } | Mutation::DeleteDebt { .. } => EntityType::Debts,
            Mutation::CreateSaleGroup(_) | Mutation::DeleteSaleGroup { .. } => EntityType::SaleGroups,
            Mutation::CreateSale(_) | Mutation::DeleteSale { .. } => EntityType::DynamicSales,
            Mutation::AdjustInventory(_) => EntityType::DynamicInventory,
            Mutation::CreateCustomer(_) | Mutation::UpdateCustomer { .. } | Mutation::DeleteCustomer { .. } => {
                EntityType::Customers
            }
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Mutation::CreateDebt(_)
            | Mutation::CreateSaleGroup(_)
            | Mutation::CreateSale(_)
            | Mutation::CreateCustomer(_) => Operation::Create,
            Mutation::UpdateDebt { .. } | Mutation::AdjustInventory(_) | Mutation::UpdateCustomer { .. } => {
                Operation::Update
            }
            Mutation::DeleteDebt { .. }
            | Mutation::DeleteSaleGroup { .. }
            | Mutation::DeleteSale { .. }
            | Mutation::DeleteCustomer { .. } => Operation::Delete,
        }
    }

    /// Target row for updates and deletes.
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            Mutation::UpdateDebt { id, .. }
            | Mutation::DeleteDebt { id }
            | Mutation::DeleteSaleGroup { id }
            | Mutation::DeleteSale { id, .. }
            | Mutation::UpdateCustomer { id, .. }
            | Mutation::DeleteCustomer { id } => Some(id),
            _ => None,
        }
    }

    /// Payload snapshot stored in the queue.
    pub fn data(&self) -> Value {
        let value = match self {
            Mutation::CreateDebt(entry) => serde_json::to_value(entry),
            Mutation::UpdateDebt { patch, .. } => serde_json::to_value(patch),
            Mutation::CreateSaleGroup(group) => serde_json::to_value(group),
            Mutation::CreateSale(line) | Mutation::DeleteSale { line, .. } => serde_json::to_value(line),
            Mutation::AdjustInventory(adj) => serde_json::to_value(adj),
            Mutation::CreateCustomer(customer) => serde_json::to_value(customer),
            Mutation::UpdateCustomer { patch, .. } => serde_json::to_value(patch),
            Mutation::DeleteDebt { .. } | Mutation::DeleteSaleGroup { .. } | Mutation::DeleteCustomer { .. } => {
                Ok(json!({}))
            }
        };
        // Plain structs of strings and integers always serialize.
        value.unwrap_or(Value::Null)
    }

    pub fn validate(&self) -> SyncResult<()> {
        match self {
            Mutation::CreateDebt(entry) => entry.validate(),
            Mutation::UpdateDebt { patch, .. } => patch.validate(),
            Mutation::CreateSaleGroup(group) => group.validate(),
            Mutation::CreateSale(line) => line.validate(),
            Mutation::AdjustInventory(adj) => adj.validate(),
            Mutation::CreateCustomer(customer) => customer.validate(),
            Mutation::UpdateCustomer { patch, .. } => patch.validate(),
            Mutation::DeleteDebt { id }
            | Mutation::DeleteSaleGroup { id }
            | Mutation::DeleteSale { id, .. }
            | Mutation::DeleteCustomer { id } => require_name("id", id),
        }
    }

    /// A temporary id this mutation still depends on, if any. Such a mutation
    /// cannot be sent until the referenced record has its server id.
    pub fn pending_reference(&self) -> Option<&str> {
        if let Some(id) = self.entity_id().filter(|id| is_temp_id(id)) {
            return Some(id);
        }
        let refs: [Option<&str>; 2] = match self {
            Mutation::CreateSale(line) => [line.sale_group_id.as_deref(), line.customer_id.as_deref()],
            Mutation::CreateDebt(entry) => [entry.customer_id.as_deref(), None],
            _ => [None, None],
        };
        refs.into_iter().flatten().find(|id| is_temp_id(id))
    }
}
