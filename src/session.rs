//! The public entry point: session setup, the request executor state machine,
//! the prepared statement cache, and the cluster worker that keeps pools in
//! step with host events.
//!
//! A request runs as one or more fibers. Each fiber walks the shared query
//! plan: acquire a connection from the next host's pool, send, and map any
//! failure through the retry policy (same host, next host, rethrow, ignore).
//! Speculative execution launches additional fibers after the configured
//! delay; the first terminal result wins and the siblings are aborted, their
//! stream ids coming back when their late responses arrive.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use fnv::FnvHashMap;
use slog::{debug, info, warn, Logger};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::config::{ConnectionConfig, SessionConfig};
use crate::connection::Connection;
use crate::control::{self, ControlContext, ControlHandle, Metadata};
use crate::error::{ConnectionError, DbError, NewSessionError, QueryError};
use crate::frame::ProtocolError;
use crate::host::{HostEvent, HostRegistry};
use crate::message::{
    Batch, BatchEntry, BatchType, ColumnSpec, CqlResult, Execute, Prepare, Query, QueryParams,
    Response, ResponseEnvelope, Row, SchemaChange, Value,
};
use crate::policy::{ClusterView, RetryContext, RetryDecision, RoutingInfo};
use crate::pool::HostPool;
use crate::{Consistency, ProtocolVersion, Uuid};

/// Per-request options; unset fields fall back to the session defaults.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub consistency: Option<Consistency>,
    pub serial_consistency: Option<Consistency>,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    pub timestamp: Option<i64>,
    /// Idempotent requests may be retried after transport errors and are
    /// eligible for speculative execution.
    pub idempotent: bool,
    pub routing_key: Option<Bytes>,
    pub keyspace: Option<String>,
    pub request_timeout: Option<Duration>,
}

/// A server-side prepared statement. The id is refreshed in place when a node
/// reports it unprepared and the executor re-prepares.
pub struct PreparedStatement {
    id: RwLock<Bytes>,
    pub query: String,
    /// Keyspace of the statement's table, as reported by the server.
    pub keyspace: Option<String>,
    /// Bind-variable indices forming the partition key (v4 servers report
    /// them; empty otherwise).
    pub pk_indices: Vec<u16>,
}

impl PreparedStatement {
    pub fn id(&self) -> Bytes {
        self.id.read().unwrap().clone()
    }

    fn set_id(&self, id: Bytes) {
        *self.id.write().unwrap() = id;
    }

    /// Assemble the routing key from bound values, when the partition key
    /// indices are known: the raw value for a single-column key, the
    /// length-prefixed composite form otherwise.
    pub fn compute_routing_key(&self, values: &[Value]) -> Option<Bytes> {
        if self.pk_indices.is_empty() {
            return None;
        }
        let mut parts = Vec::with_capacity(self.pk_indices.len());
        for idx in &self.pk_indices {
            match values.get(*idx as usize) {
                Some(Value::Set(bytes)) => parts.push(bytes.clone()),
                _ => return None,
            }
        }
        if parts.len() == 1 {
            return Some(parts.remove(0));
        }
        let mut out = BytesMut::new();
        for part in &parts {
            out.put_u16(part.len() as u16);
            out.put_slice(part);
            out.put_u8(0);
        }
        Some(out.freeze())
    }
}

/// A batch of statements executed as one request.
#[derive(Debug, Clone)]
pub struct BatchStatement {
    pub batch_type: BatchType,
    pub entries: Vec<BatchEntry>,
}

impl BatchStatement {
    pub fn logged() -> BatchStatement {
        BatchStatement {
            batch_type: BatchType::Logged,
            entries: Vec::new(),
        }
    }

    pub fn push_query(&mut self, query: impl Into<String>, values: Vec<Value>) {
        self.entries.push(BatchEntry::Query {
            query: query.into(),
            values,
        });
    }

    pub fn push_prepared(&mut self, prepared: &PreparedStatement, values: Vec<Value>) {
        self.entries.push(BatchEntry::Prepared {
            id: prepared.id(),
            values,
        });
    }
}

/// What a successful request returns.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Present for row-bearing results.
    pub rows: Option<Vec<Row>>,
    pub col_specs: Vec<ColumnSpec>,
    /// Opaque continuation token when the server has more pages.
    pub paging_state: Option<Bytes>,
    pub tracing_id: Option<Uuid>,
    pub warnings: Vec<String>,
    /// Set when the request was a DDL statement; schema agreement has already
    /// been awaited by the time the caller sees this.
    pub schema_change: Option<SchemaChange>,
}

impl QueryResult {
    fn empty() -> QueryResult {
        QueryResult {
            rows: None,
            col_specs: Vec::new(),
            paging_state: None,
            tracing_id: None,
            warnings: Vec::new(),
            schema_change: None,
        }
    }
}

enum Payload {
    Query {
        query: String,
    },
    Execute {
        prepared: Arc<PreparedStatement>,
    },
    Batch {
        batch_type: BatchType,
        entries: Vec<BatchEntry>,
    },
}

struct RequestShared {
    session: Arc<SessionShared>,
    payload: Payload,
    values: Vec<Value>,
    consistency: Consistency,
    serial_consistency: Option<Consistency>,
    page_size: Option<i32>,
    paging_state: Option<Bytes>,
    timestamp: Option<i64>,
    idempotent: bool,
    deadline: Duration,
    plan: Mutex<crate::policy::QueryPlan>,
    errors: Mutex<Vec<(SocketAddr, QueryError)>>,
    active_fibers: AtomicUsize,
    result_tx: mpsc::Sender<Result<QueryResult, QueryError>>,
}

struct SessionShared {
    log: Logger,
    config: Arc<SessionConfig>,
    version: ProtocolVersion,
    conn_config: Arc<ConnectionConfig>,
    registry: Arc<HostRegistry>,
    metadata: Arc<RwLock<Arc<Metadata>>>,
    pools: RwLock<FnvHashMap<SocketAddr, Arc<HostPool>>>,
    prepared: Mutex<FnvHashMap<String, Arc<PreparedStatement>>>,
    control: ControlHandle,
    schema_events: broadcast::Sender<SchemaChange>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A handle to one cluster: connection pools, metadata, and the request
/// executor. Dropping the session tears all of it down.
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Bootstrap against the configured contact points: negotiate the
    /// protocol version, publish the first metadata snapshot, and build pools
    /// for the discovered hosts.
    pub async fn connect(log: Logger, config: SessionConfig) -> Result<Session, NewSessionError> {
        if config.contact_points.is_empty() {
            return Err(NewSessionError::NoContactPoints);
        }
        let config = Arc::new(config);
        let registry = Arc::new(HostRegistry::new(
            log.clone(),
            config.event_channel_capacity,
        ));
        let metadata = Arc::new(RwLock::new(Arc::new(Metadata::empty())));
        let (schema_events, _) = broadcast::channel(config.event_channel_capacity);
        // Subscribe before the control loop starts so bootstrap-time host
        // events are waiting for the worker instead of lost.
        let host_events = registry.subscribe();

        let (init_tx, init_rx) = oneshot::channel();
        let (control, control_task) = control::spawn(
            ControlContext {
                log: log.clone(),
                config: config.clone(),
                registry: registry.clone(),
                metadata: metadata.clone(),
                schema_events: schema_events.clone(),
                seeds: config.contact_points.clone(),
            },
            init_tx,
        );

        let version = match timeout(config.bootstrap_timeout, init_rx).await {
            Err(_) => {
                control_task.abort();
                return Err(NewSessionError::Timeout);
            }
            Ok(Err(_)) => {
                control_task.abort();
                return Err(NewSessionError::AllContactPointsFailed);
            }
            Ok(Ok(version)) => version,
        };

        let shared = Arc::new(SessionShared {
            log: log.clone(),
            conn_config: config.connection_config(version),
            config,
            version,
            registry,
            metadata,
            pools: RwLock::new(FnvHashMap::default()),
            prepared: Mutex::new(FnvHashMap::default()),
            control,
            schema_events,
            tasks: Mutex::new(vec![control_task]),
        });

        for addr in shared.registry.up_addresses() {
            if let Err(e) = build_pool(&shared, addr).await {
                warn!(shared.log, "could not build pool"; "peer" => %addr, "error" => %e);
                shared.registry.set_down(addr);
            }
        }
        let worker = tokio::spawn(run_cluster_worker(shared.clone(), host_events));
        shared.tasks.lock().unwrap().push(worker);

        info!(log, "session ready";
              "hosts" => shared.registry.snapshot().len(),
              "version" => %version);
        Ok(Session { shared })
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.shared.version
    }

    /// The current metadata snapshot. Always available: during a control
    /// connection outage this is the last good view, not an error.
    pub fn metadata(&self) -> Arc<Metadata> {
        self.shared.metadata.read().unwrap().clone()
    }

    pub fn keyspaces(&self) -> Vec<String> {
        self.metadata().keyspaces.keys().cloned().collect()
    }

    pub fn subscribe_host_events(&self) -> broadcast::Receiver<HostEvent> {
        self.shared.registry.subscribe()
    }

    pub fn subscribe_schema_events(&self) -> broadcast::Receiver<SchemaChange> {
        self.shared.schema_events.subscribe()
    }

    /// Poll schema versions until the cluster agrees or the configured
    /// ceiling elapses.
    pub async fn await_schema_agreement(&self) -> Result<bool, QueryError> {
        self.shared.control.await_schema_agreement().await
    }

    pub async fn query(&self, query: &str, values: Vec<Value>) -> Result<QueryResult, QueryError> {
        self.query_with(query, values, QueryOptions::default()).await
    }

    pub async fn query_with(
        &self,
        query: &str,
        values: Vec<Value>,
        options: QueryOptions,
    ) -> Result<QueryResult, QueryError> {
        let routing_key = options.routing_key.clone();
        let keyspace = options.keyspace.clone();
        self.run_request(
            Payload::Query {
                query: query.to_owned(),
            },
            values,
            options,
            keyspace,
            routing_key,
        )
        .await
    }

    /// Prepare a statement, or return the cached handle for this query text.
    pub async fn prepare(&self, query: &str) -> Result<Arc<PreparedStatement>, QueryError> {
        if let Some(prepared) = self.shared.prepared.lock().unwrap().get(query) {
            return Ok(prepared.clone());
        }
        let view = self.cluster_view();
        let plan = self
            .shared
            .config
            .load_balancing
            .plan(&RoutingInfo::default(), &view);
        let mut errors: Vec<(SocketAddr, QueryError)> = Vec::new();
        for addr in plan {
            let conn = match self.acquire_from(addr) {
                Ok(conn) => conn,
                Err(e) => {
                    errors.push((addr, e));
                    continue;
                }
            };
            match conn.request(&Prepare { query }).await {
                Ok(envelope) => match envelope.message {
                    Response::Result(CqlResult::Prepared(p)) => {
                        let keyspace = p.col_specs.first().map(|s| s.keyspace.clone());
                        let prepared = Arc::new(PreparedStatement {
                            id: RwLock::new(p.id),
                            query: query.to_owned(),
                            keyspace,
                            pk_indices: p.pk_indices,
                        });
                        self.shared
                            .prepared
                            .lock()
                            .unwrap()
                            .insert(query.to_owned(), prepared.clone());
                        return Ok(prepared);
                    }
                    Response::Error { error, message } => {
                        // Grammar problems will not improve on another host.
                        return Err(QueryError::db(error, message));
                    }
                    other => {
                        return Err(unexpected_response(&other));
                    }
                },
                Err(e) => {
                    errors.push((addr, e.into()));
                    continue;
                }
            }
        }
        Err(QueryError::NoHostAvailable(errors))
    }

    pub async fn execute(
        &self,
        prepared: &Arc<PreparedStatement>,
        values: Vec<Value>,
    ) -> Result<QueryResult, QueryError> {
        self.execute_with(prepared, values, QueryOptions::default())
            .await
    }

    pub async fn execute_with(
        &self,
        prepared: &Arc<PreparedStatement>,
        values: Vec<Value>,
        options: QueryOptions,
    ) -> Result<QueryResult, QueryError> {
        let routing_key = options
            .routing_key
            .clone()
            .or_else(|| prepared.compute_routing_key(&values));
        let keyspace = options.keyspace.clone().or_else(|| prepared.keyspace.clone());
        self.run_request(
            Payload::Execute {
                prepared: prepared.clone(),
            },
            values,
            options,
            keyspace,
            routing_key,
        )
        .await
    }

    pub async fn batch(&self, batch: &BatchStatement) -> Result<QueryResult, QueryError> {
        self.batch_with(batch, QueryOptions::default()).await
    }

    pub async fn batch_with(
        &self,
        batch: &BatchStatement,
        options: QueryOptions,
    ) -> Result<QueryResult, QueryError> {
        let keyspace = options.keyspace.clone();
        let routing_key = options.routing_key.clone();
        self.run_request(
            Payload::Batch {
                batch_type: batch.batch_type,
                entries: batch.entries.clone(),
            },
            Vec::new(),
            options,
            keyspace,
            routing_key,
        )
        .await
    }

    /// Tear the session down: control loop, cluster worker, every pool.
    pub fn close(&self) {
        for task in self.shared.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let pools = ::std::mem::replace(
            &mut *self.shared.pools.write().unwrap(),
            FnvHashMap::default(),
        );
        for (_, pool) in pools {
            pool.close();
        }
    }

    fn cluster_view(&self) -> ClusterView {
        ClusterView {
            metadata: self.shared.metadata.read().unwrap().clone(),
            up_hosts: self.shared.registry.up_addresses(),
        }
    }

    fn acquire_from(&self, addr: SocketAddr) -> Result<Arc<Connection>, QueryError> {
        let pool = self.shared.pools.read().unwrap().get(&addr).cloned();
        match pool {
            Some(pool) => pool.acquire().map_err(QueryError::from),
            None => Err(QueryError::Connection(ConnectionError::Closed)),
        }
    }

    async fn run_request(
        &self,
        payload: Payload,
        values: Vec<Value>,
        options: QueryOptions,
        keyspace: Option<String>,
        routing_key: Option<Bytes>,
    ) -> Result<QueryResult, QueryError> {
        let consistency = options
            .consistency
            .unwrap_or(self.shared.config.default_consistency);
        if consistency.is_serial() {
            return Err(QueryError::BadQuery(format!(
                "{} is not a valid top-level consistency",
                consistency
            )));
        }
        let view = self.cluster_view();
        let token = routing_key
            .as_ref()
            .map(|key| view.metadata.partitioner.hash(key));
        let plan = self.shared.config.load_balancing.plan(
            &RoutingInfo {
                keyspace: keyspace.as_deref(),
                token,
            },
            &view,
        );

        let (result_tx, mut result_rx) = mpsc::channel(1);
        let request = Arc::new(RequestShared {
            session: self.shared.clone(),
            payload,
            values,
            consistency,
            serial_consistency: options.serial_consistency,
            page_size: options.page_size,
            paging_state: options.paging_state.clone(),
            timestamp: options.timestamp,
            idempotent: options.idempotent,
            deadline: options
                .request_timeout
                .unwrap_or(self.shared.config.request_timeout),
            plan: Mutex::new(plan),
            errors: Mutex::new(Vec::new()),
            active_fibers: AtomicUsize::new(0),
            result_tx,
        });

        let mut handles = vec![spawn_fiber(&request)];
        let speculative = if options.idempotent {
            self.shared.config.speculative.clone()
        } else {
            None
        };
        let mut launched = 1u32;
        let outcome = loop {
            let delay = speculative.as_ref().and_then(|p| p.delay(launched));
            tokio::select! {
                maybe = result_rx.recv() => {
                    break maybe.unwrap_or_else(|| {
                        Err(QueryError::NoHostAvailable(
                            request.errors.lock().unwrap().drain(..).collect(),
                        ))
                    });
                }
                _ = sleep(delay.unwrap_or(Duration::from_secs(3600))), if delay.is_some() => {
                    debug!(self.shared.log, "launching speculative execution"; "attempt" => launched + 1);
                    handles.push(spawn_fiber(&request));
                    launched += 1;
                }
            }
        };
        // First terminal result wins; cancel the siblings. Their stream ids
        // come back when the late responses arrive on their connections.
        for handle in handles {
            handle.abort();
        }

        if let Ok(result) = &outcome {
            if let Some(change) = &result.schema_change {
                self.shared
                    .control
                    .refresh_schema(Some(change.keyspace.clone()))
                    .await;
                match self.shared.control.await_schema_agreement().await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(self.shared.log, "schema agreement not reached before timeout")
                    }
                    Err(e) => {
                        warn!(self.shared.log, "schema agreement check failed"; "error" => %e)
                    }
                }
            }
        }
        outcome
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn unexpected_response(response: &Response) -> QueryError {
    let _ = response;
    QueryError::Connection(ConnectionError::Protocol(ProtocolError::Malformed(
        "unexpected response opcode",
    )))
}

fn envelope_to_result(envelope: ResponseEnvelope) -> Result<QueryResult, QueryError> {
    match envelope.message {
        Response::Result(result) => {
            let mut out = QueryResult::empty();
            out.tracing_id = envelope.tracing_id;
            out.warnings = envelope.warnings;
            match result {
                CqlResult::Void => {}
                CqlResult::SetKeyspace(_) => {}
                CqlResult::Rows(rows) => {
                    out.paging_state = rows.metadata.paging_state.clone();
                    out.col_specs = rows.metadata.col_specs.clone();
                    out.rows = Some(rows.rows);
                }
                CqlResult::SchemaChange(change) => out.schema_change = Some(change),
                CqlResult::Prepared(_) => return Err(unexpected_response(&Response::Ready)),
            }
            Ok(out)
        }
        Response::Error { error, message } => Err(QueryError::db(error, message)),
        ref other => Err(unexpected_response(other)),
    }
}

fn spawn_fiber(request: &Arc<RequestShared>) -> JoinHandle<()> {
    request.active_fibers.fetch_add(1, Ordering::SeqCst);
    let request = request.clone();
    tokio::spawn(run_fiber(request))
}

fn record_error(request: &RequestShared, addr: SocketAddr, error: QueryError) {
    request.errors.lock().unwrap().push((addr, error));
}

async fn run_fiber(request: Arc<RequestShared>) {
    let mut consistency = request.consistency;
    let mut retry_count = 0u32;
    let result = 'hosts: loop {
        let next = request.plan.lock().unwrap().next();
        let addr = match next {
            Some(addr) => addr,
            None => {
                // Plan exhausted. The last fiber standing reports the
                // aggregate failure.
                if request.active_fibers.fetch_sub(1, Ordering::SeqCst) == 1 {
                    let errors = request.errors.lock().unwrap().drain(..).collect();
                    let _ = request
                        .result_tx
                        .try_send(Err(QueryError::NoHostAvailable(errors)));
                }
                return;
            }
        };
        let pool = request.session.pools.read().unwrap().get(&addr).cloned();
        let conn = match pool {
            None => {
                record_error(
                    &request,
                    addr,
                    QueryError::Connection(ConnectionError::Closed),
                );
                continue 'hosts;
            }
            Some(pool) => match pool.acquire() {
                Ok(conn) => conn,
                Err(e) => {
                    if let ConnectionError::Closed = e {
                        // The pool has no live connection left; let the
                        // reconnection machinery take over.
                        request.session.registry.set_down(addr);
                    }
                    record_error(&request, addr, e.into());
                    continue 'hosts;
                }
            },
        };

        let mut reprepared = false;
        'same_host: loop {
            match attempt_once(&request, &conn, consistency).await {
                Ok(result) => break 'hosts Ok(result),
                Err(error) => {
                    if is_unprepared(&error) {
                        if let Payload::Execute { prepared } = &request.payload {
                            if !reprepared {
                                // Re-prepare on this very connection and
                                // re-send once, without consuming a retry.
                                match reprepare(&request, &conn, prepared).await {
                                    Ok(()) => {
                                        reprepared = true;
                                        continue 'same_host;
                                    }
                                    Err(e) => {
                                        record_error(&request, addr, e);
                                        continue 'hosts;
                                    }
                                }
                            }
                        }
                    }
                    let decision = request.session.config.retry.decide(&RetryContext {
                        error: &error,
                        consistency,
                        idempotent: request.idempotent,
                        retry_count,
                    });
                    match decision {
                        RetryDecision::RetrySameHost(cl) => {
                            retry_count += 1;
                            if let Some(cl) = cl {
                                consistency = cl;
                            }
                            if conn.is_closed() {
                                record_error(&request, addr, error);
                                continue 'hosts;
                            }
                            continue 'same_host;
                        }
                        RetryDecision::RetryNextHost(cl) => {
                            retry_count += 1;
                            if let Some(cl) = cl {
                                consistency = cl;
                            }
                            record_error(&request, addr, error);
                            continue 'hosts;
                        }
                        RetryDecision::DontRetry => break 'hosts Err(error),
                        RetryDecision::IgnoreError => break 'hosts Ok(QueryResult::empty()),
                    }
                }
            }
        }
    };
    let _ = request.result_tx.try_send(result);
    request.active_fibers.fetch_sub(1, Ordering::SeqCst);
}

fn is_unprepared(error: &QueryError) -> bool {
    matches!(
        error,
        QueryError::Db {
            error: DbError::Unprepared { .. },
            ..
        }
    )
}

async fn attempt_once(
    request: &RequestShared,
    conn: &Arc<Connection>,
    consistency: Consistency,
) -> Result<QueryResult, QueryError> {
    let params = QueryParams {
        consistency,
        serial_consistency: request.serial_consistency,
        values: request.values.clone(),
        skip_metadata: false,
        page_size: request.page_size,
        paging_state: request.paging_state.clone(),
        timestamp: request.timestamp,
    };
    let envelope = match &request.payload {
        Payload::Query { query } => {
            conn.request_with_timeout(
                &Query {
                    query,
                    params: &params,
                },
                request.deadline,
            )
            .await
        }
        Payload::Execute { prepared } => {
            let id = prepared.id();
            conn.request_with_timeout(
                &Execute {
                    id: &id,
                    params: &params,
                },
                request.deadline,
            )
            .await
        }
        Payload::Batch {
            batch_type,
            entries,
        } => {
            conn.request_with_timeout(
                &Batch {
                    batch_type: *batch_type,
                    entries,
                    consistency,
                    serial_consistency: request.serial_consistency,
                    timestamp: request.timestamp,
                },
                request.deadline,
            )
            .await
        }
    }
    .map_err(QueryError::from)?;
    envelope_to_result(envelope)
}

async fn reprepare(
    request: &RequestShared,
    conn: &Arc<Connection>,
    prepared: &Arc<PreparedStatement>,
) -> Result<(), QueryError> {
    debug!(request.session.log, "re-preparing statement";
           "query" => %prepared.query, "peer" => %conn.address());
    let envelope = conn
        .request(&Prepare {
            query: &prepared.query,
        })
        .await
        .map_err(QueryError::from)?;
    match envelope.message {
        Response::Result(CqlResult::Prepared(p)) => {
            prepared.set_id(p.id);
            Ok(())
        }
        Response::Error { error, message } => Err(QueryError::db(error, message)),
        ref other => Err(unexpected_response(other)),
    }
}

async fn build_pool(shared: &Arc<SessionShared>, addr: SocketAddr) -> Result<(), ConnectionError> {
    if shared.pools.read().unwrap().contains_key(&addr) {
        return Ok(());
    }
    let pool = HostPool::connect(
        shared.log.clone(),
        addr,
        shared.conn_config.clone(),
        shared.config.pool,
    )
    .await?;
    let mut pools = shared.pools.write().unwrap();
    if pools.contains_key(&addr) {
        // Someone else won the race; discard ours.
        pool.close();
    } else {
        pools.insert(addr, pool);
    }
    Ok(())
}

async fn run_cluster_worker(
    shared: Arc<SessionShared>,
    mut events: broadcast::Receiver<HostEvent>,
) {
    loop {
        match events.recv().await {
            Ok(HostEvent::Added(addr)) | Ok(HostEvent::Up(addr)) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = build_pool(&shared, addr).await {
                        warn!(shared.log, "pool build failed"; "peer" => %addr, "error" => %e);
                        shared.registry.set_down(addr);
                    }
                });
            }
            Ok(HostEvent::Down(addr)) => spawn_reconnector(&shared, addr),
            Ok(HostEvent::Removed(addr)) => {
                if let Some(pool) = shared.pools.write().unwrap().remove(&addr) {
                    pool.close();
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(shared.log, "host event stream lagged, resyncing"; "skipped" => skipped);
                for addr in shared.registry.up_addresses() {
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        let _ = build_pool(&shared, addr).await;
                    });
                }
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Bring one down host back: attempt on the reconnection policy's schedule
/// until a connection succeeds or the host is removed.
fn spawn_reconnector(shared: &Arc<SessionShared>, addr: SocketAddr) {
    let host = match shared.registry.try_get(addr) {
        Some(host) => host,
        None => return,
    };
    if !host.begin_reconnect() {
        return;
    }
    let shared = shared.clone();
    tokio::spawn(async move {
        let mut schedule = shared.config.reconnection.new_schedule();
        loop {
            let delay = schedule.next().unwrap_or(Duration::from_secs(600));
            sleep(delay).await;
            if shared.registry.try_get(addr).is_none() {
                break;
            }
            let pool = shared.pools.read().unwrap().get(&addr).cloned();
            let attempt = match pool {
                Some(pool) => pool.refill_one().await,
                None => build_pool(&shared, addr).await,
            };
            match attempt {
                Ok(()) => {
                    shared.registry.add_or_bring_up(addr);
                    break;
                }
                Err(e) => {
                    debug!(shared.log, "reconnection attempt failed";
                           "peer" => %addr, "error" => %e);
                }
            }
        }
        host.end_reconnect();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepared(pk_indices: Vec<u16>) -> PreparedStatement {
        PreparedStatement {
            id: RwLock::new(Bytes::from_static(b"\x01")),
            query: "INSERT INTO t (a, b) VALUES (?, ?)".to_owned(),
            keyspace: Some("ks".to_owned()),
            pk_indices,
        }
    }

    #[test]
    fn routing_key_single_column_is_raw_bytes() {
        let p = prepared(vec![0]);
        let key = p
            .compute_routing_key(&[Value::blob(b"kkkk"), Value::blob(b"vvvv")])
            .unwrap();
        assert_eq!(key.as_ref(), b"kkkk");
    }

    #[test]
    fn routing_key_composite_is_length_prefixed() {
        let p = prepared(vec![0, 1]);
        let key = p
            .compute_routing_key(&[Value::blob(b"ab"), Value::blob(b"c")])
            .unwrap();
        assert_eq!(key.as_ref(), b"\x00\x02ab\x00\x00\x01c\x00");
    }

    #[test]
    fn routing_key_requires_all_components() {
        let p = prepared(vec![0, 1]);
        assert!(p.compute_routing_key(&[Value::blob(b"ab")]).is_none());
        assert!(p
            .compute_routing_key(&[Value::blob(b"ab"), Value::Null])
            .is_none());
        assert!(prepared(vec![]).compute_routing_key(&[]).is_none());
    }

    #[test]
    fn prepared_id_can_be_swapped_in_place() {
        let p = prepared(vec![0]);
        assert_eq!(p.id().as_ref(), b"\x01");
        p.set_id(Bytes::from_static(b"\x02\x03"));
        assert_eq!(p.id().as_ref(), b"\x02\x03");
    }
}
