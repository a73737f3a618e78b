//! The runtime: config snapshot, pool registry and the per-client
//! session that implements [`VConn`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{BackendPool, PooledConn};
use crate::config::{ProxyConfig, UserConfig};
use crate::error::{ProxyError, Result};
use crate::mysql::client::QueryOutcome;
use crate::mysql::dsn::DsnConfig;
use crate::mysql::protocol::{SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_IN_TRANS};
use crate::mysql::rows::{Field, ResultSet};
use crate::mysql::value::Value;
use crate::optimize::{parse_statement, Optimizer};
use crate::plan::{Plan, SinglePlan};
use crate::rule::ShardingRule;

use super::{interpolate_params, DataSet, ExecuteResult, VConn, WriteResult};
use async_trait::async_trait;

/// Immutable view of the configuration one statement executes under.
/// Updates install a new snapshot; in-flight statements keep the one
/// they started with.
pub struct Snapshot {
    pub rule: ShardingRule,
    pub sources: HashMap<String, SourceEntry>,
    pub users: Vec<UserConfig>,
    pub default_db: String,
    pub server_version: String,
    pub statement_timeout: Option<Duration>,
}

pub struct SourceEntry {
    pub dsn: Arc<DsnConfig>,
    pub max_connections: usize,
    pub acquire_timeout: Duration,
}

impl Snapshot {
    pub fn from_config(config: &ProxyConfig) -> Result<Snapshot> {
        let mut sources = HashMap::new();
        for ds in &config.data_sources {
            let dsn = DsnConfig::parse(&ds.dsn)?;
            sources.insert(
                ds.name.clone(),
                SourceEntry {
                    dsn: Arc::new(dsn),
                    max_connections: ds.max_connections,
                    acquire_timeout: Duration::from_millis(ds.acquire_timeout_ms),
                },
            );
        }
        Ok(Snapshot {
            rule: config.rule.clone(),
            sources,
            users: config.users.clone(),
            default_db: config.default_data_source()?.to_string(),
            server_version: config.server_version.clone(),
            statement_timeout: match config.statement_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        })
    }
}

/// Owns the active snapshot and the per-data-source pools.
pub struct Runtime {
    snapshot: RwLock<Arc<Snapshot>>,
    pools: DashMap<String, Arc<BackendPool>>,
}

impl Runtime {
    pub fn new(config: &ProxyConfig) -> Result<Arc<Runtime>> {
        let snapshot = Arc::new(Snapshot::from_config(config)?);
        Ok(Arc::new(Runtime {
            snapshot: RwLock::new(snapshot),
            pools: DashMap::new(),
        }))
    }

    /// Installs a new configuration atomically. Fresh sessions and the
    /// next statement of idle sessions observe it; pools for vanished
    /// sources are dropped once their borrowers finish.
    pub fn install(&self, config: &ProxyConfig) -> Result<()> {
        let snapshot = Arc::new(Snapshot::from_config(config)?);
        let names: Vec<String> = self
            .pools
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for name in names {
            if !snapshot.sources.contains_key(&name) {
                self.pools.remove(&name);
            }
        }
        *self.snapshot.write() = snapshot;
        debug!("configuration snapshot installed");
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    fn pool(&self, snapshot: &Snapshot, name: &str) -> Result<Arc<BackendPool>> {
        if let Some(pool) = self.pools.get(name) {
            return Ok(pool.clone());
        }
        let entry = snapshot.sources.get(name).ok_or_else(|| {
            ProxyError::Routing(format!("unknown data source {:?}", name))
        })?;
        let pool = self
            .pools
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(BackendPool::new(
                    name,
                    entry.dsn.clone(),
                    entry.max_connections,
                    entry.acquire_timeout,
                ))
            })
            .clone();
        Ok(pool)
    }

    pub fn new_session(self: &Arc<Self>) -> Arc<RuntimeSession> {
        Arc::new(RuntimeSession {
            runtime: self.clone(),
            snapshot: RwLock::new(self.snapshot()),
            schema: Mutex::new(None),
            charset: AtomicU8::new(crate::mysql::protocol::UTF8_GENERAL_CI),
            autocommit: AtomicBool::new(true),
            in_transaction: AtomicBool::new(false),
            last_insert_id: AtomicU64::new(0),
            affected_rows: AtomicU64::new(0),
            pinned: Mutex::new(HashMap::new()),
        })
    }

    /// Parse → optimize → execute one statement for a session. This is
    /// the plan-execution entry point.
    pub async fn execute(
        &self,
        session: &Arc<RuntimeSession>,
        sql: &str,
        args: &[Value],
    ) -> Result<ExecuteResult> {
        session.refresh_snapshot();
        let snapshot = session.snapshot();
        let statement_id = Uuid::new_v4();
        debug!(%statement_id, sql, "executing statement");

        let plan = match parse_statement(sql) {
            Ok(stmt) => {
                Optimizer::new(&snapshot.rule, &snapshot.default_db).optimize(sql, &stmt, args)?
            }
            Err(ProxyError::Unsupported(reason)) => {
                // statements the parser cannot model pass through to the
                // default source untouched
                debug!(%statement_id, reason, "passing raw statement through");
                if raw_sql_returns_rows(sql) {
                    Plan::Single(SinglePlan::query(&snapshot.default_db, sql, args.to_vec()))
                } else {
                    Plan::Single(SinglePlan::exec(&snapshot.default_db, sql, args.to_vec()))
                }
            }
            Err(e) => return Err(e),
        };

        let vconn: Arc<dyn VConn> = session.clone();
        match snapshot.statement_timeout {
            Some(deadline) => tokio::time::timeout(deadline, plan.exec_in(vconn))
                .await
                .map_err(|_| ProxyError::Cancelled)?,
            None => plan.exec_in(vconn).await,
        }
    }
}

fn raw_sql_returns_rows(sql: &str) -> bool {
    let head = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    matches!(head.as_str(), "SELECT" | "SHOW" | "DESC" | "DESCRIBE" | "EXPLAIN")
}

type PinSlot = Arc<AsyncMutex<Option<PooledConn>>>;

/// Per-client-connection execution state: current schema, transaction
/// flags and the backends pinned by an open transaction.
pub struct RuntimeSession {
    runtime: Arc<Runtime>,
    snapshot: RwLock<Arc<Snapshot>>,
    pub schema: Mutex<Option<String>>,
    charset: AtomicU8,
    autocommit: AtomicBool,
    in_transaction: AtomicBool,
    last_insert_id: AtomicU64,
    affected_rows: AtomicU64,
    pinned: Mutex<HashMap<String, PinSlot>>,
}

/// A connection borrowed for one backend call, with its way home.
enum Borrowed {
    FromPool {
        pooled: PooledConn,
        pool: Arc<BackendPool>,
    },
    Pinned {
        pooled: PooledConn,
        slot: PinSlot,
    },
}

impl Borrowed {
    fn conn_mut(&mut self) -> &mut crate::mysql::client::BackendConnection {
        match self {
            Borrowed::FromPool { pooled, .. } | Borrowed::Pinned { pooled, .. } => {
                &mut pooled.conn
            }
        }
    }

    async fn finish(self) {
        match self {
            Borrowed::FromPool { pooled, pool } => pool.release(pooled),
            Borrowed::Pinned { pooled, slot } => {
                if pooled.conn.is_broken() {
                    // the transaction is poisoned; dropping the
                    // connection frees its permit, COMMIT will skip the
                    // empty slot
                    warn!("dropping broken pinned connection");
                } else {
                    *slot.lock().await = Some(pooled);
                }
            }
        }
    }
}

impl RuntimeSession {
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    /// Adopts the latest configuration at a statement boundary, unless a
    /// transaction holds the session to its current snapshot.
    fn refresh_snapshot(&self) {
        if !self.is_in_transaction() {
            *self.snapshot.write() = self.runtime.snapshot();
        }
    }

    pub fn set_schema(&self, schema: Option<String>) {
        *self.schema.lock() = schema;
    }

    pub fn current_schema(&self) -> Option<String> {
        self.schema.lock().clone()
    }

    pub fn set_charset(&self, charset: u8) {
        self.charset.store(charset, Ordering::SeqCst);
    }

    pub fn charset(&self) -> u8 {
        self.charset.load(Ordering::SeqCst)
    }

    /// Records the outcome of the last write so OK packets and
    /// LAST_INSERT_ID()-style probes see consistent values.
    pub fn record_write(&self, result: &WriteResult) {
        self.affected_rows
            .store(result.affected_rows, Ordering::SeqCst);
        if result.last_insert_id != 0 {
            self.last_insert_id
                .store(result.last_insert_id, Ordering::SeqCst);
        }
    }

    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id.load(Ordering::SeqCst)
    }

    pub fn affected_rows(&self) -> u64 {
        self.affected_rows.load(Ordering::SeqCst)
    }

    pub fn set_autocommit(&self, on: bool) {
        self.autocommit.store(on, Ordering::SeqCst);
    }

    pub fn is_in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::SeqCst) || !self.autocommit.load(Ordering::SeqCst)
    }

    /// Status bits reported to the client in OK/EOF packets.
    pub fn status_flags(&self) -> u16 {
        let mut flags = 0;
        if self.autocommit.load(Ordering::SeqCst) {
            flags |= SERVER_STATUS_AUTOCOMMIT;
        }
        if self.is_in_transaction() {
            flags |= SERVER_STATUS_IN_TRANS;
        }
        flags
    }

    pub fn begin(&self) {
        self.in_transaction.store(true, Ordering::SeqCst);
    }

    pub async fn commit(&self) -> Result<()> {
        self.end_transaction("COMMIT").await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.end_transaction("ROLLBACK").await
    }

    /// Fans the verb out to exactly the pinned backends. Best-effort:
    /// every backend is attempted, the first failure is reported and the
    /// rest are logged.
    async fn end_transaction(&self, verb: &str) -> Result<()> {
        let slots: Vec<(String, PinSlot)> = {
            let mut pinned = self.pinned.lock();
            pinned.drain().collect()
        };
        self.in_transaction.store(false, Ordering::SeqCst);

        let mut first_err = None;
        for (name, slot) in slots {
            let taken = slot.lock().await.take();
            let Some(mut pooled) = taken else {
                continue;
            };
            if let Err(e) = pooled.conn.execute(verb).await {
                if e.is_fatal_to_connection() {
                    pooled.conn.mark_broken();
                }
                warn!(source = %name, error = %e, "{} failed on pinned backend", verb);
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
            if let Ok(pool) = self.runtime.pool(&self.snapshot(), &name) {
                pool.release(pooled);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn borrow(&self, db: &str) -> Result<Borrowed> {
        let snapshot = self.snapshot();
        let pool = self.runtime.pool(&snapshot, db)?;

        if !self.is_in_transaction() {
            let pooled = pool.acquire().await?;
            return Ok(Borrowed::FromPool { pooled, pool });
        }

        let existing = self.pinned.lock().get(db).cloned();
        match existing {
            Some(slot) => {
                let taken = slot.lock().await.take();
                match taken {
                    Some(pooled) => Ok(Borrowed::Pinned { pooled, slot }),
                    None => Err(ProxyError::Pool(format!(
                        "pinned connection to {} is still streaming",
                        db
                    ))),
                }
            }
            None => {
                let slot: PinSlot = Arc::new(AsyncMutex::new(None));
                self.pinned.lock().insert(db.to_string(), slot.clone());
                let mut pooled = pool.acquire().await?;
                pooled.conn.execute("BEGIN").await?;
                Ok(Borrowed::Pinned { pooled, slot })
            }
        }
    }

    /// COM_FIELD_LIST service: resolves the logical table to one physical
    /// shard (the descriptors are identical across shards).
    pub async fn field_list(&self, table: &str, wildcard: &str) -> Result<Vec<Field>> {
        let snapshot = self.snapshot();
        let (db, physical) = match snapshot.rule.rule_for(table) {
            Some(rule) => {
                let shard = rule.shard_at(0);
                (shard.db, shard.table)
            }
            None => (snapshot.default_db.clone(), table.to_string()),
        };

        let mut borrowed = self.borrow(&db).await?;
        let result = borrowed.conn_mut().field_list(&physical, wildcard).await;
        if let Err(e) = &result {
            if e.is_fatal_to_connection() {
                borrowed.conn_mut().mark_broken();
            }
        }
        borrowed.finish().await;
        result
    }
}

#[async_trait]
impl VConn for RuntimeSession {
    async fn query(&self, db: &str, sql: &str, args: &[Value]) -> Result<DataSet> {
        let sql = interpolate_params(sql, args)?;
        let mut borrowed = self.borrow(db).await?;

        let outcome = match borrowed.conn_mut().start_query(&sql).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_fatal_to_connection() {
                    borrowed.conn_mut().mark_broken();
                }
                borrowed.finish().await;
                return Err(e);
            }
        };

        match outcome {
            QueryOutcome::Ok(_) => {
                borrowed.finish().await;
                Ok(DataSet::from_rows(ResultSet::new(Vec::new()), Vec::new()))
            }
            QueryOutcome::ResultSet(result_set) => {
                let (tx, ds) = DataSet::channel(result_set.clone());
                tokio::spawn(async move {
                    loop {
                        match borrowed.conn_mut().next_row(&result_set).await {
                            Ok(Some(row)) => {
                                if tx.send(Ok(row)).await.is_err() {
                                    // consumer closed early (LIMIT); the
                                    // connection must still drain to its
                                    // terminator before reuse
                                    while let Ok(Some(_)) =
                                        borrowed.conn_mut().next_row(&result_set).await
                                    {
                                    }
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                if e.is_fatal_to_connection() {
                                    borrowed.conn_mut().mark_broken();
                                }
                                let _ = tx.send(Err(e)).await;
                                break;
                            }
                        }
                    }
                    borrowed.finish().await;
                });
                Ok(ds)
            }
        }
    }

    async fn exec(&self, db: &str, sql: &str, args: &[Value]) -> Result<WriteResult> {
        let sql = interpolate_params(sql, args)?;
        let mut borrowed = self.borrow(db).await?;
        let result = borrowed.conn_mut().execute(&sql).await;
        if let Err(e) = &result {
            if e.is_fatal_to_connection() {
                borrowed.conn_mut().mark_broken();
            }
        }
        borrowed.finish().await;
        result
    }
}
