use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix of ids generated locally for records that have not reached the server.
pub const TEMP_ID_PREFIX: &str = "offline_";

/// Default retry cap for queue items.
pub const MAX_ATTEMPTS: i64 = 5;

pub fn new_temp_id() -> String {
    format!("{}{}", TEMP_ID_PREFIX, uuid::Uuid::new_v4())
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn ms_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Who is acting and for which store. Passed explicitly into every facade and
/// engine call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub store_id: i64,
    pub user_id: String,
    pub email: Option<String>,
}

impl Session {
    pub fn new(store_id: i64, user_id: impl Into<String>) -> Self {
        Self {
            store_id,
            user_id: user_id.into(),
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Debts,
    SaleGroups,
    DynamicSales,
    DynamicInventory,
    Customers,
    Products,
}

impl EntityType {
    pub const ALL: [EntityType; 6] = [
        EntityType::Debts,
        EntityType::SaleGroups,
        EntityType::DynamicSales,
        EntityType::DynamicInventory,
        EntityType::Customers,
        EntityType::Products,
    ];

    /// Remote table name, also used as the queue discriminant.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Debts => "debts",
            EntityType::SaleGroups => "sale_groups",
            EntityType::DynamicSales => "dynamic_sales",
            EntityType::DynamicInventory => "dynamic_inventory",
            EntityType::Customers => "customers",
            EntityType::Products => "products",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        EntityType::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Lower drains sooner. Parents (sale groups, customers) precede the rows
    /// that reference them.
    pub fn default_priority(&self) -> i64 {
        match self {
            EntityType::SaleGroups | EntityType::Customers => 1,
            EntityType::Debts | EntityType::DynamicSales => 2,
            EntityType::DynamicInventory | EntityType::Products => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Syncing => "syncing",
            QueueStatus::Synced => "synced",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "syncing" => Some(QueueStatus::Syncing),
            "synced" => Some(QueueStatus::Synced),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }
}

/// Locally persisted copy of a remote record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedEntity {
    pub local_id: String,
    pub server_id: Option<String>,
    pub entity_type: EntityType,
    pub store_id: i64,
    pub payload: Value,
    pub dirty: bool,
    pub deleted: bool,
    pub updated_at: i64,
}

impl CachedEntity {
    /// A record created offline: temporary id, unsynced.
    pub fn pending(entity_type: EntityType, store_id: i64, payload: Value) -> Self {
        Self {
            local_id: new_temp_id(),
            server_id: None,
            entity_type,
            store_id,
            payload,
            dirty: true,
            deleted: false,
            updated_at: now_ms(),
        }
    }

    /// A record confirmed by the server.
    pub fn synced(entity_type: EntityType, store_id: i64, server_id: String, payload: Value) -> Self {
        Self {
            local_id: server_id.clone(),
            server_id: Some(server_id),
            entity_type,
            store_id,
            payload,
            dirty: false,
            deleted: false,
            updated_at: now_ms(),
        }
    }

    /// The id callers should use: server id once known, else the temporary one.
    pub fn id(&self) -> &str {
        self.server_id.as_deref().unwrap_or(&self.local_id)
    }

    pub fn is_pending_creation(&self) -> bool {
        self.server_id.is_none()
    }
}

/// One intended mutation against the remote store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueItem {
    pub seq: i64,
    pub client_ref: String,
    pub store_id: i64,
    pub entity_type: EntityType,
    pub operation: Operation,
    pub entity_id: Option<String>,
    pub local_id: Option<String>,
    pub data: Value,
    pub priority: i64,
    pub attempts: i64,
    pub status: QueueStatus,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub synced_at: Option<i64>,
}

/// Insert form of a queue item; the queue assigns ref, seq and status.
#[derive(Debug, Clone, PartialEq)]
pub struct NewQueueItem {
    pub entity_type: EntityType,
    pub operation: Operation,
    pub entity_id: Option<String>,
    pub local_id: Option<String>,
    pub data: Value,
    pub priority: i64,
    /// Idempotency key; a fresh one is generated when unset.
    pub client_ref: Option<String>,
}

impl NewQueueItem {
    pub fn new(entity_type: EntityType, operation: Operation, data: Value) -> Self {
        Self {
            entity_type,
            operation,
            entity_id: None,
            local_id: None,
            data,
            priority: entity_type.default_priority(),
            client_ref: None,
        }
    }

    pub fn entity_id(mut self, id: impl Into<String>) -> Self {
        self.entity_id = Some(id.into());
        self
    }

    pub fn local_id(mut self, id: impl Into<String>) -> Self {
        self.local_id = Some(id.into());
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Reuse a key already sent on the direct path.
    pub fn client_ref(mut self, client_ref: impl Into<String>) -> Self {
        self.client_ref = Some(client_ref.into());
        self
    }
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SyncReport {
    pub total: usize,
    pub synced: usize,
    pub failed: usize,
    pub started_at: i64,
    pub finished_at: i64,
}
