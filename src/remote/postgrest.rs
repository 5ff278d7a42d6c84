use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use super::{filter_pairs, Filter, Query, RemoteStore};
use crate::error::{SyncError, SyncResult};

/// Supabase REST (PostgREST) client.
#[derive(Clone)]
pub struct PostgrestClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl fmt::Debug for PostgrestClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgrestClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl PostgrestClient {
    /// `project_url` is the Supabase project URL; requests go to `{project_url}/rest/v1/`.
    /// Every request is bounded by `timeout`.
    pub fn new(project_url: &str, api_key: String, timeout: Duration) -> anyhow::Result<Self> {
        let root = format!("{}/", project_url.trim_end_matches('/'));
        let base_url = Url::parse(&root)
            .and_then(|u| u.join("rest/v1/"))
            .with_context(|| format!("invalid remote url {}", project_url))?;
        let http = Client::builder()
            .user_agent("retail-sync/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    pub fn build_request(
        &self,
        method: Method,
        table: &str,
        pairs: &[(String, String)],
        body: Option<&Value>,
    ) -> SyncResult<reqwest::Request> {
        let mut endpoint = self
            .base_url
            .join(table)
            .map_err(|e| SyncError::Payload(format!("invalid table name {}: {}", table, e)))?;
        if !pairs.is_empty() {
            endpoint.query_pairs_mut().extend_pairs(pairs);
        }

        let mut builder = self
            .http
            .request(method.clone(), endpoint)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key));
        if method == Method::POST || method == Method::PATCH {
            builder = builder.header("Prefer", "return=representation");
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        builder
            .build()
            .map_err(|e| SyncError::Payload(format!("failed to build request: {}", e)))
    }

    async fn execute(&self, request: reqwest::Request) -> SyncResult<Option<Value>> {
        debug!(method = %request.method(), url = %request.url(), "remote request");
        let res = self.http.execute(request).await.map_err(transport_error)?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, body = %body, "remote store returned an error");
            return Err(classify_status(status, body));
        }

        let text = res.text().await.map_err(transport_error)?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        let value = serde_json::from_str(&text)
            .map_err(|e| SyncError::Network(format!("unreadable response: {}", e)))?;
        Ok(Some(value))
    }
}

fn transport_error(err: reqwest::Error) -> SyncError {
    if err.is_timeout() {
        SyncError::Network(format!("timed out: {}", err))
    } else {
        SyncError::Network(err.to_string())
    }
}

/// Transient statuses are network-class; anything else means the store
/// rejected the write.
pub fn classify_status(status: StatusCode, body: String) -> SyncError {
    let transient = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;
    if transient {
        SyncError::Network(format!("{}: {}", status, body))
    } else {
        SyncError::Conflict(format!("{}: {}", status, body))
    }
}

fn into_rows(value: Option<Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(rows)) => rows,
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![other],
    }
}

#[async_trait]
impl RemoteStore for PostgrestClient {
    async fn select(&self, table: &str, query: &Query) -> SyncResult<Vec<Value>> {
        let request = self.build_request(Method::GET, table, &query.to_pairs(), None)?;
        Ok(into_rows(self.execute(request).await?))
    }

    async fn insert(&self, table: &str, row: &Value) -> SyncResult<Value> {
        let request = self.build_request(Method::POST, table, &[], Some(row))?;
        into_rows(self.execute(request).await?)
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::Conflict(format!("insert into {} returned no row", table)))
    }

    async fn update(&self, table: &str, filters: &[Filter], patch: &Value) -> SyncResult<Vec<Value>> {
        let request = self.build_request(Method::PATCH, table, &filter_pairs(filters), Some(patch))?;
        Ok(into_rows(self.execute(request).await?))
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> SyncResult<()> {
        let request = self.build_request(Method::DELETE, table, &filter_pairs(filters), None)?;
        self.execute(request).await?;
        Ok(())
    }

    async fn ping(&self) -> SyncResult<()> {
        let request = self.build_request(Method::GET, "", &[], None)?;
        // Any HTTP answer means the store is reachable.
        self.http.execute(request).await.map_err(transport_error)?;
        Ok(())
    }
}
