//! Remote data store: the sole source of truth when online.
//!
//! `RemoteStore` is the seam the sync engine and facades talk to. The real
//! implementation is [`PostgrestClient`]; tests substitute an in-memory store.
use async_trait::async_trait;
use serde_json::Value;

use crate::error::SyncResult;

pub mod postgrest;

pub use postgrest::PostgrestClient;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, String),
    ILike(String, String),
    In(String, Vec<String>),
}

impl Filter {
    pub fn eq(column: &str, value: impl ToString) -> Self {
        Filter::Eq(column.to_string(), value.to_string())
    }

    pub fn column(&self) -> &str {
        match self {
            Filter::Eq(c, _) | Filter::ILike(c, _) | Filter::In(c, _) => c,
        }
    }

    /// PostgREST operator form, e.g. `eq.42` or `in.(1,2)`.
    pub fn to_operator(&self) -> String {
        match self {
            Filter::Eq(_, v) => format!("eq.{}", v),
            Filter::ILike(_, v) => format!("ilike.{}", v),
            Filter::In(_, vs) => format!("in.({})", vs.join(",")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// `select(columns).eq/ilike/in/order/range(...)` over one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub columns: Option<String>,
    pub filters: Vec<Filter>,
    pub order: Option<(String, Order)>,
    pub range: Option<(u64, u64)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, columns: &str) -> Self {
        self.columns = Some(columns.to_string());
        self
    }

    pub fn eq(mut self, column: &str, value: impl ToString) -> Self {
        self.filters.push(Filter::eq(column, value));
        self
    }

    pub fn ilike(mut self, column: &str, pattern: &str) -> Self {
        self.filters.push(Filter::ILike(column.to_string(), pattern.to_string()));
        self
    }

    pub fn in_list<I, S>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.filters.push(Filter::In(
            column.to_string(),
            values.into_iter().map(|v| v.to_string()).collect(),
        ));
        self
    }

    pub fn order(mut self, column: &str, order: Order) -> Self {
        self.order = Some((column.to_string(), order));
        self
    }

    /// Inclusive row range, zero based.
    pub fn range(mut self, from: u64, to: u64) -> Self {
        self.range = Some((from, to.max(from)));
        self
    }

    /// Query-string pairs in PostgREST syntax.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![(
            "select".to_string(),
            self.columns.clone().unwrap_or_else(|| "*".to_string()),
        )];
        pairs.extend(filter_pairs(&self.filters));
        if let Some((column, order)) = &self.order {
            let dir = match order {
                Order::Asc => "asc",
                Order::Desc => "desc",
            };
            pairs.push(("order".to_string(), format!("{}.{}", column, dir)));
        }
        if let Some((from, to)) = self.range {
            pairs.push(("offset".to_string(), from.to_string()));
            pairs.push(("limit".to_string(), (to - from + 1).to_string()));
        }
        pairs
    }
}

pub fn filter_pairs(filters: &[Filter]) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|f| (f.column().to_string(), f.to_operator()))
        .collect()
}

/// Id of a remote row as a string, whether the column is numeric or text.
pub fn row_id(row: &Value) -> Option<String> {
    match row.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn select(&self, table: &str, query: &Query) -> SyncResult<Vec<Value>>;

    /// Insert one row and return it as stored (with its server id).
    async fn insert(&self, table: &str, row: &Value) -> SyncResult<Value>;

    /// Patch every row matching `filters`; returns the updated rows.
    async fn update(&self, table: &str, filters: &[Filter], patch: &Value) -> SyncResult<Vec<Value>>;

    async fn delete(&self, table: &str, filters: &[Filter]) -> SyncResult<()>;

    /// Cheap reachability check.
    async fn ping(&self) -> SyncResult<()>;
}
