#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use retail_sync::connectivity::Connectivity;
use retail_sync::db::{self, Pool};
use retail_sync::facade::OfflineWriter;
use retail_sync::model::Session;
use retail_sync::remote::{Filter, Order, Query, RemoteStore};
use retail_sync::sync::{EngineSettings, Notifier, SyncEngine};
use retail_sync::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Select,
    Insert,
    Update,
    Delete,
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Network,
    Conflict,
    /// The write lands, then the caller sees a network error.
    LostResponse,
}

fn response_lost() -> SyncError {
    SyncError::Network("connection reset after request was sent".into())
}

/// In-memory stand-in for the PostgREST store with scripted faults.
#[derive(Clone)]
pub struct MemoryRemote {
    tables: Arc<Mutex<HashMap<String, Vec<Value>>>>,
    next_id: Arc<AtomicI64>,
    unreachable: Arc<AtomicBool>,
    faults: Arc<Mutex<VecDeque<(String, Op, Fault)>>>,
    calls: Arc<Mutex<Vec<(Op, String)>>>,
    delay: Arc<Mutex<Option<Duration>>>,
}

fn value_str(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn matches(row: &Value, filters: &[Filter]) -> bool {
    filters.iter().all(|f| {
        let field = row.get(f.column()).map(value_str).unwrap_or_default();
        match f {
            Filter::Eq(_, v) => &field == v,
            Filter::ILike(_, pattern) => field
                .to_lowercase()
                .contains(&pattern.trim_matches('%').to_lowercase()),
            Filter::In(_, vs) => vs.contains(&field),
        }
    })
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            tables: Arc::default(),
            next_id: Arc::new(AtomicI64::new(1000)),
            unreachable: Arc::default(),
            faults: Arc::default(),
            calls: Arc::default(),
            delay: Arc::default(),
        }
    }

    pub async fn seed(&self, table: &str, mut row: Value) -> Value {
        if row.get("id").is_none() {
            row["id"] = json!(self.next_id.fetch_add(1, Ordering::SeqCst));
        }
        self.tables
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        row
    }

    pub async fn rows(&self, table: &str) -> Vec<Value> {
        self.tables.lock().await.get(table).cloned().unwrap_or_default()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// The next `op` against `table` fails with `fault`.
    pub async fn fail_next(&self, table: &str, op: Op, fault: Fault) {
        self.faults.lock().await.push_back((table.to_string(), op, fault));
    }

    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.lock().await = Some(delay);
    }

    pub async fn calls(&self) -> Vec<(Op, String)> {
        self.calls.lock().await.clone()
    }

    pub async fn count(&self, op: Op, table: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|(o, t)| *o == op && t == table)
            .count()
    }

    /// `Ok(true)` means apply the call but report it as lost.
    async fn before(&self, op: Op, table: &str) -> SyncResult<bool> {
        self.calls.lock().await.push((op, table.to_string()));
        let delay = *self.delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(SyncError::Network("connection refused".into()));
        }
        let mut faults = self.faults.lock().await;
        if let Some(pos) = faults.iter().position(|(t, o, _)| t == table && *o == op) {
            let (_, _, fault) = faults.remove(pos).unwrap();
            return match fault {
                Fault::Network => Err(SyncError::Network("simulated timeout".into())),
                Fault::Conflict => Err(SyncError::Conflict("409 Conflict: duplicate key".into())),
                Fault::LostResponse => Ok(true),
            };
        }
        Ok(false)
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn select(&self, table: &str, query: &Query) -> SyncResult<Vec<Value>> {
        if self.before(Op::Select, table).await? {
            return Err(response_lost());
        }
        let mut rows: Vec<Value> = self
            .rows(table)
            .await
            .into_iter()
            .filter(|r| matches(r, &query.filters))
            .collect();
        if let Some((column, order)) = &query.order {
            rows.sort_by_key(|r| r.get(column).map(value_str).unwrap_or_default());
            if *order == Order::Desc {
                rows.reverse();
            }
        }
        if let Some((from, to)) = query.range {
            rows = rows
                .into_iter()
                .skip(from as usize)
                .take((to - from + 1) as usize)
                .collect();
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, row: &Value) -> SyncResult<Value> {
        let lost = self.before(Op::Insert, table).await?;
        let row = self.seed(table, row.clone()).await;
        if lost {
            return Err(response_lost());
        }
        Ok(row)
    }

    async fn update(&self, table: &str, filters: &[Filter], patch: &Value) -> SyncResult<Vec<Value>> {
        let lost = self.before(Op::Update, table).await?;
        let mut tables = self.tables.lock().await;
        let mut updated = Vec::new();
        for row in tables.entry(table.to_string()).or_default().iter_mut() {
            if matches(row, filters) {
                if let (Value::Object(target), Value::Object(patch)) = (&mut *row, patch) {
                    for (k, v) in patch {
                        target.insert(k.clone(), v.clone());
                    }
                }
                updated.push(row.clone());
            }
        }
        if lost {
            return Err(response_lost());
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> SyncResult<()> {
        let lost = self.before(Op::Delete, table).await?;
        self.tables
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .retain(|row| !matches(row, filters));
        if lost {
            return Err(response_lost());
        }
        Ok(())
    }

    async fn ping(&self) -> SyncResult<()> {
        if self.before(Op::Ping, "").await? {
            return Err(response_lost());
        }
        Ok(())
    }
}

pub fn session() -> Session {
    Session::new(1, "user-1").with_email("owner@example.com")
}

pub struct Harness {
    pub pool: Pool,
    pub remote: MemoryRemote,
    pub connectivity: Connectivity,
    pub engine: Arc<SyncEngine>,
    pub writer: OfflineWriter,
    pub session: Session,
}

pub async fn harness(online: bool) -> Harness {
    let pool = db::init_memory_pool().await.unwrap();
    harness_with_pool(pool, online, EngineSettings::default())
}

pub fn harness_with_pool(pool: Pool, online: bool, settings: EngineSettings) -> Harness {
    let remote = MemoryRemote::new();
    remote.set_unreachable(!online);
    let connectivity = Connectivity::new(online, Notifier::new());
    let shared: Arc<dyn RemoteStore> = Arc::new(remote.clone());
    let engine = Arc::new(SyncEngine::new(pool.clone(), shared.clone(), connectivity.clone(), settings));
    let writer = OfflineWriter::new(pool.clone(), shared, connectivity.clone());
    Harness {
        pool,
        remote,
        connectivity,
        engine,
        writer,
        session: session(),
    }
}

impl Harness {
    /// Flip both the store and the monitor.
    pub fn go_online(&self) {
        self.remote.set_unreachable(false);
        self.connectivity.set_online(true);
    }

    pub fn go_offline(&self) {
        self.remote.set_unreachable(true);
        self.connectivity.set_online(false);
    }
}
