//! The control connection: one privileged connection that bootstraps and
//! refreshes cluster metadata, subscribes to server events, and re-homes on
//! failure.
//!
//! The loop owns at most one connection at a time, chosen from the up hosts
//! with the configured seeds first. While disconnected, the last good
//! metadata snapshot stays visible to readers; reconnection follows the
//! session's reconnection policy. Schema events are debounced so a burst of
//! DDL coalesces into one refresh.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use fnv::{FnvHashMap, FnvHashSet};
use slog::{debug, info, o, warn, Logger};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::config::SessionConfig;
use crate::connection::Connection;
use crate::error::QueryError;
use crate::host::HostRegistry;
use crate::message::{
    CqlResult, Event, Query, QueryParams, Response, Row, Rows, SchemaChange, StatusChange,
    TopologyChange,
};
use crate::ring::{Partitioner, ReplicationStrategy, RingHost, Token, TokenMap};
use crate::{Consistency, ProtocolVersion, Uuid};

const SELECT_LOCAL: &str = "SELECT cluster_name, data_center, rack, partitioner, tokens, \
                            release_version, schema_version FROM system.local";
const SELECT_PEERS: &str = "SELECT peer, rpc_address, data_center, rack, tokens, \
                            release_version, schema_version FROM system.peers";
const SELECT_KEYSPACES: &str = "SELECT keyspace_name, replication FROM system_schema.keyspaces";
const SELECT_TABLES: &str = "SELECT keyspace_name, table_name FROM system_schema.tables";
const SELECT_TYPES: &str =
    "SELECT keyspace_name, type_name, field_names, field_types FROM system_schema.types";
const SELECT_SCHEMA_LOCAL: &str = "SELECT schema_version FROM system.local";
const SELECT_SCHEMA_PEERS: &str = "SELECT peer, schema_version FROM system.peers";

const SCHEMA_AGREEMENT_PROBE_INTERVAL: Duration = Duration::from_millis(200);

/// What the cluster told us about one node.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub datacenter: Option<String>,
    pub rack: Option<String>,
    pub tokens: Vec<Token>,
    pub release_version: Option<String>,
    pub schema_version: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct UdtInfo {
    pub name: String,
    pub field_names: Vec<String>,
    pub field_types: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct KeyspaceInfo {
    pub strategy: Option<ReplicationStrategy>,
    pub tables: Vec<String>,
    pub user_types: Vec<UdtInfo>,
}

/// Immutable snapshot of everything the control connection has learned.
/// Published whole; readers clone the `Arc` and never see a half-applied
/// update.
pub struct Metadata {
    pub cluster_name: String,
    pub partitioner: Partitioner,
    pub hosts: FnvHashMap<SocketAddr, PeerInfo>,
    pub keyspaces: FnvHashMap<String, KeyspaceInfo>,
    pub token_map: Arc<TokenMap>,
}

impl Metadata {
    pub fn empty() -> Metadata {
        Metadata {
            cluster_name: String::new(),
            partitioner: Partitioner::Murmur3,
            hosts: FnvHashMap::default(),
            keyspaces: FnvHashMap::default(),
            token_map: Arc::new(TokenMap::empty(Partitioner::Murmur3)),
        }
    }
}

enum ControlCommand {
    RefreshSchema(Option<String>),
    RefreshTopology,
    AwaitSchemaAgreement {
        done: oneshot::Sender<Result<bool, QueryError>>,
    },
}

/// Cheap cloneable handle for talking to the control loop.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlCommand>,
}

impl ControlHandle {
    /// Enqueue a (debounced) refresh of schema metadata.
    pub async fn refresh_schema(&self, keyspace: Option<String>) {
        let _ = self.tx.send(ControlCommand::RefreshSchema(keyspace)).await;
    }

    pub async fn refresh_topology(&self) {
        let _ = self.tx.send(ControlCommand::RefreshTopology).await;
    }

    /// Poll local and peer schema versions until they agree or the configured
    /// ceiling elapses. `Ok(false)` means the cluster still disagrees.
    pub async fn await_schema_agreement(&self) -> Result<bool, QueryError> {
        let (done, rx) = oneshot::channel();
        if self
            .tx
            .send(ControlCommand::AwaitSchemaAgreement { done })
            .await
            .is_err()
        {
            return Err(QueryError::Connection(
                crate::error::ConnectionError::Closed,
            ));
        }
        rx.await
            .unwrap_or_else(|_| Err(QueryError::Connection(crate::error::ConnectionError::Closed)))
    }
}

/// Everything the control loop needs from the session.
pub struct ControlContext {
    pub log: Logger,
    pub config: Arc<SessionConfig>,
    pub registry: Arc<HostRegistry>,
    pub metadata: Arc<RwLock<Arc<Metadata>>>,
    pub schema_events: broadcast::Sender<SchemaChange>,
    pub seeds: Vec<SocketAddr>,
}

/// Start the control loop. The oneshot resolves with the negotiated protocol
/// version once the first metadata snapshot has been published.
pub fn spawn(
    ctx: ControlContext,
    init: oneshot::Sender<ProtocolVersion>,
) -> (ControlHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(32);
    let control = ControlLoop {
        log: ctx.log.new(o!("task" => "control")),
        config: ctx.config,
        registry: ctx.registry,
        metadata: ctx.metadata,
        schema_events: ctx.schema_events,
        seeds: ctx.seeds,
        version: None,
    };
    let task = tokio::spawn(control.run(rx, init));
    (ControlHandle { tx }, task)
}

enum ServeExit {
    ConnectionLost,
    Shutdown,
}

struct ControlLoop {
    log: Logger,
    config: Arc<SessionConfig>,
    registry: Arc<HostRegistry>,
    metadata: Arc<RwLock<Arc<Metadata>>>,
    schema_events: broadcast::Sender<SchemaChange>,
    seeds: Vec<SocketAddr>,
    /// Pinned after the first successful handshake.
    version: Option<ProtocolVersion>,
}

impl ControlLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<ControlCommand>,
        init: oneshot::Sender<ProtocolVersion>,
    ) {
        let mut init = Some(init);
        let mut schedule = self.config.reconnection.new_schedule();
        loop {
            let mut connected = None;
            for addr in self.candidates() {
                match self.connect(addr).await {
                    Ok(conn_and_events) => {
                        connected = Some(conn_and_events);
                        break;
                    }
                    Err(e) => {
                        warn!(self.log, "control candidate failed"; "peer" => %addr, "error" => %e);
                        self.registry.set_down(addr);
                    }
                }
            }
            let (conn, events) = match connected {
                Some(x) => x,
                None => {
                    let delay = schedule.next().unwrap_or(Duration::from_secs(600));
                    debug!(self.log, "no control candidate reachable"; "retry_in" => ?delay);
                    sleep(delay).await;
                    continue;
                }
            };
            schedule = self.config.reconnection.new_schedule();
            match self.serve(conn, events, &mut commands, &mut init).await {
                ServeExit::Shutdown => return,
                ServeExit::ConnectionLost => {
                    // The last good snapshot stays published while we re-home.
                    continue;
                }
            }
        }
    }

    /// Up hosts ordered with the configured seeds first; plain seeds when the
    /// registry knows nothing yet.
    fn candidates(&self) -> Vec<SocketAddr> {
        let up = self.registry.up_addresses();
        let mut out = Vec::with_capacity(up.len().max(self.seeds.len()));
        for seed in &self.seeds {
            if up.contains(seed) || !self.registry.contains(*seed) {
                out.push(*seed);
            }
        }
        for addr in up {
            if !out.contains(&addr) {
                out.push(addr);
            }
        }
        out
    }

    async fn connect(
        &mut self,
        addr: SocketAddr,
    ) -> Result<(Connection, mpsc::UnboundedReceiver<Event>), crate::error::ConnectionError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let attempts: Vec<ProtocolVersion> = match self.version {
            Some(v) => vec![v],
            None => {
                let mut versions = Vec::new();
                let mut v = Some(self.config.preferred_protocol_version);
                while let Some(version) = v {
                    versions.push(version);
                    v = version.downgrade();
                }
                versions
            }
        };
        let mut last = crate::error::ConnectionError::Closed;
        for version in attempts {
            let config = self.config.connection_config(version);
            match Connection::open(self.log.clone(), addr, config, Some(event_tx.clone())).await {
                Ok(conn) => {
                    conn.register_for_events().await?;
                    if self.version != Some(version) {
                        info!(self.log, "negotiated protocol version"; "version" => %version);
                    }
                    self.version = Some(version);
                    return Ok((conn, event_rx));
                }
                Err(crate::error::ConnectionError::VersionRejected(msg)) => {
                    debug!(self.log, "protocol version rejected, downgrading"; "detail" => %msg);
                    last = crate::error::ConnectionError::VersionRejected(msg);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    async fn serve(
        &mut self,
        conn: Connection,
        mut events: mpsc::UnboundedReceiver<Event>,
        commands: &mut mpsc::Receiver<ControlCommand>,
        init: &mut Option<oneshot::Sender<ProtocolVersion>>,
    ) -> ServeExit {
        if let Err(e) = self.refresh_all(&conn).await {
            warn!(self.log, "initial metadata refresh failed"; "error" => %e);
            return ServeExit::ConnectionLost;
        }
        if let Some(tx) = init.take() {
            let _ = tx.send(self.version.unwrap_or(self.config.preferred_protocol_version));
        }
        info!(self.log, "control connection established"; "peer" => %conn.address());

        let mut flush_at: Option<Instant> = None;
        loop {
            let flush_timer = flush_at.unwrap_or_else(|| {
                // Disabled branch below; value is never awaited.
                Instant::now() + Duration::from_secs(3600)
            });
            tokio::select! {
                _ = conn.wait_closed() => {
                    warn!(self.log, "control connection lost");
                    return ServeExit::ConnectionLost;
                }
                maybe = events.recv() => match maybe {
                    None => return ServeExit::ConnectionLost,
                    Some(event) => {
                        if self.handle_event(&conn, event, &mut flush_at).await.is_err() {
                            return ServeExit::ConnectionLost;
                        }
                    }
                },
                maybe = commands.recv() => match maybe {
                    None => return ServeExit::Shutdown,
                    Some(ControlCommand::RefreshSchema(_keyspace)) => {
                        let debounce = self.config.schema_refresh_debounce;
                        flush_at.get_or_insert_with(|| Instant::now() + debounce);
                    }
                    Some(ControlCommand::RefreshTopology) => {
                        if self.refresh_topology(&conn).await.is_err() {
                            return ServeExit::ConnectionLost;
                        }
                    }
                    Some(ControlCommand::AwaitSchemaAgreement { done }) => {
                        let result = self.wait_schema_agreement(&conn).await;
                        let _ = done.send(result);
                    }
                },
                _ = tokio::time::sleep_until(flush_timer), if flush_at.is_some() => {
                    flush_at = None;
                    if let Err(e) = self.refresh_schema(&conn).await {
                        warn!(self.log, "schema refresh failed"; "error" => %e);
                        return ServeExit::ConnectionLost;
                    }
                }
            }
        }
    }

    async fn handle_event(
        &mut self,
        conn: &Connection,
        event: Event,
        flush_at: &mut Option<Instant>,
    ) -> Result<(), QueryError> {
        match event {
            Event::StatusChange { change, addr } => {
                let addr = self.translate(addr);
                match change {
                    StatusChange::Up => {
                        self.registry.add_or_bring_up(addr);
                    }
                    StatusChange::Down => {
                        self.registry.set_down(addr);
                    }
                }
                Ok(())
            }
            Event::TopologyChange { change, addr } => {
                let addr = self.translate(addr);
                debug!(self.log, "topology change"; "change" => ?change, "peer" => %addr);
                if change == TopologyChange::RemovedNode {
                    self.registry.remove(addr);
                }
                // New, moved, and removed nodes all shift token ownership.
                self.refresh_topology(conn).await
            }
            Event::SchemaChange(change) => {
                let _ = self.schema_events.send(change);
                let debounce = self.config.schema_refresh_debounce;
                flush_at.get_or_insert_with(|| Instant::now() + debounce);
                Ok(())
            }
        }
    }

    fn translate(&self, addr: SocketAddr) -> SocketAddr {
        match &self.config.address_translator {
            Some(translator) => translator.translate(addr),
            None => addr,
        }
    }

    fn publish(&self, metadata: Metadata) {
        *self.metadata.write().unwrap() = Arc::new(metadata);
    }

    fn current(&self) -> Arc<Metadata> {
        self.metadata.read().unwrap().clone()
    }

    async fn query_rows(&self, conn: &Connection, cql: &str) -> Result<Rows, QueryError> {
        let params = QueryParams {
            consistency: Consistency::One,
            ..QueryParams::default()
        };
        let envelope = conn
            .request(&Query {
                query: cql,
                params: &params,
            })
            .await
            .map_err(QueryError::from)?;
        match envelope.message {
            Response::Result(CqlResult::Rows(rows)) => Ok(rows),
            Response::Error { error, message } => Err(QueryError::db(error, message)),
            other => Err(QueryError::BadQuery(format!(
                "unexpected control query response: {:?}",
                other
            ))),
        }
    }

    /// Full refresh: local node, peers, schema, token map; then publish.
    async fn refresh_all(&mut self, conn: &Connection) -> Result<(), QueryError> {
        let (hosts, cluster_name, partitioner) = self.fetch_topology(conn).await?;
        let keyspaces = self.fetch_schema(conn).await?;
        self.sync_registry(&hosts);
        let token_map = build_token_map(partitioner, &hosts, &keyspaces);
        self.publish(Metadata {
            cluster_name,
            partitioner,
            hosts,
            keyspaces,
            token_map: Arc::new(token_map),
        });
        Ok(())
    }

    /// Re-read local+peers, keep the current schema, rebuild the token map.
    async fn refresh_topology(&mut self, conn: &Connection) -> Result<(), QueryError> {
        let (hosts, cluster_name, partitioner) = self.fetch_topology(conn).await?;
        let keyspaces = self.current().keyspaces.clone();
        self.sync_registry(&hosts);
        let token_map = build_token_map(partitioner, &hosts, &keyspaces);
        self.publish(Metadata {
            cluster_name,
            partitioner,
            hosts,
            keyspaces,
            token_map: Arc::new(token_map),
        });
        Ok(())
    }

    /// Re-read schema tables, keep the current topology, rebuild the token
    /// map. Coalesced behind the debounce window, so it always reloads the
    /// whole schema.
    async fn refresh_schema(&mut self, conn: &Connection) -> Result<(), QueryError> {
        let keyspaces = self.fetch_schema(conn).await?;
        let current = self.current();
        let token_map = build_token_map(current.partitioner, &current.hosts, &keyspaces);
        self.publish(Metadata {
            cluster_name: current.cluster_name.clone(),
            partitioner: current.partitioner,
            hosts: current.hosts.clone(),
            keyspaces,
            token_map: Arc::new(token_map),
        });
        debug!(self.log, "schema metadata refreshed");
        Ok(())
    }

    async fn fetch_topology(
        &self,
        conn: &Connection,
    ) -> Result<(FnvHashMap<SocketAddr, PeerInfo>, String, Partitioner), QueryError> {
        let local = self.query_rows(conn, SELECT_LOCAL).await?;
        let cols = ColumnIndex::new(&local);
        let row = local
            .rows
            .first()
            .ok_or_else(|| QueryError::BadQuery("system.local returned no rows".into()))?;

        let cluster_name = cols.text(row, "cluster_name").unwrap_or_default();
        let partitioner = cols
            .text(row, "partitioner")
            .as_deref()
            .and_then(Partitioner::from_class_name)
            .unwrap_or_else(|| {
                warn!(self.log, "unrecognized partitioner, assuming murmur3");
                Partitioner::Murmur3
            });

        let mut hosts = FnvHashMap::default();
        hosts.insert(
            conn.address(),
            peer_info(&cols, row, partitioner),
        );

        let port = conn.address().port();
        let peers = self.query_rows(conn, SELECT_PEERS).await?;
        let peer_cols = ColumnIndex::new(&peers);
        for row in &peers.rows {
            let addr = match peer_endpoint(&peer_cols, row, port) {
                Some(addr) => self.translate(addr),
                None => {
                    warn!(self.log, "peers row without usable address, skipping");
                    continue;
                }
            };
            hosts.insert(addr, peer_info(&peer_cols, row, partitioner));
        }
        Ok((hosts, cluster_name, partitioner))
    }

    /// Bring the registry in line with a freshly fetched host set.
    fn sync_registry(&self, hosts: &FnvHashMap<SocketAddr, PeerInfo>) {
        for addr in hosts.keys() {
            if !self.registry.contains(*addr) {
                self.registry.add_or_bring_up(*addr);
            }
        }
        for host in self.registry.snapshot() {
            if !hosts.contains_key(&host.address) {
                self.registry.remove(host.address);
            }
        }
    }

    async fn fetch_schema(
        &self,
        conn: &Connection,
    ) -> Result<FnvHashMap<String, KeyspaceInfo>, QueryError> {
        let keyspace_rows = match self.query_rows(conn, SELECT_KEYSPACES).await {
            Ok(rows) => rows,
            Err(QueryError::Db { error, message }) => {
                // Old clusters without system_schema; serve queries with an
                // empty schema view rather than failing the control loop.
                warn!(self.log, "keyspace metadata unavailable";
                      "code" => error.code(), "detail" => %message);
                return Ok(FnvHashMap::default());
            }
            Err(e) => return Err(e),
        };
        let ks_cols = ColumnIndex::new(&keyspace_rows);
        let mut keyspaces: FnvHashMap<String, KeyspaceInfo> = FnvHashMap::default();
        for row in &keyspace_rows.rows {
            let name = match ks_cols.text(row, "keyspace_name") {
                Some(name) => name,
                None => continue,
            };
            let strategy = ks_cols
                .cell(row, "replication")
                .and_then(|v| v.as_text_map())
                .and_then(|options| ReplicationStrategy::from_replication(&options));
            keyspaces.insert(
                name,
                KeyspaceInfo {
                    strategy,
                    tables: Vec::new(),
                    user_types: Vec::new(),
                },
            );
        }

        if let Ok(table_rows) = self.query_rows(conn, SELECT_TABLES).await {
            let cols = ColumnIndex::new(&table_rows);
            for row in &table_rows.rows {
                if let (Some(ks), Some(table)) = (
                    cols.text(row, "keyspace_name"),
                    cols.text(row, "table_name"),
                ) {
                    if let Some(info) = keyspaces.get_mut(&ks) {
                        info.tables.push(table);
                    }
                }
            }
        }

        if let Ok(type_rows) = self.query_rows(conn, SELECT_TYPES).await {
            let cols = ColumnIndex::new(&type_rows);
            for row in &type_rows.rows {
                let ks = match cols.text(row, "keyspace_name") {
                    Some(ks) => ks,
                    None => continue,
                };
                let name = match cols.text(row, "type_name") {
                    Some(name) => name,
                    None => continue,
                };
                let field_names = cols
                    .cell(row, "field_names")
                    .and_then(|v| v.as_text_collection())
                    .map(|items| items.into_iter().map(str::to_owned).collect())
                    .unwrap_or_default();
                let field_types = cols
                    .cell(row, "field_types")
                    .and_then(|v| v.as_text_collection())
                    .map(|items| items.into_iter().map(str::to_owned).collect())
                    .unwrap_or_default();
                if let Some(info) = keyspaces.get_mut(&ks) {
                    info.user_types.push(UdtInfo {
                        name,
                        field_names,
                        field_types,
                    });
                }
            }
        }
        Ok(keyspaces)
    }

    async fn wait_schema_agreement(&self, conn: &Connection) -> Result<bool, QueryError> {
        let deadline = Instant::now() + self.config.schema_agreement_timeout;
        loop {
            let mut versions = Vec::new();
            let local = self.query_rows(conn, SELECT_SCHEMA_LOCAL).await?;
            let cols = ColumnIndex::new(&local);
            if let Some(row) = local.rows.first() {
                versions.push(cols.uuid(row, "schema_version"));
            }
            let peers = self.query_rows(conn, SELECT_SCHEMA_PEERS).await?;
            let cols = ColumnIndex::new(&peers);
            for row in &peers.rows {
                versions.push(cols.uuid(row, "schema_version"));
            }
            if schema_versions_unified(&versions) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(SCHEMA_AGREEMENT_PROBE_INTERVAL).await;
        }
    }
}

/// All known versions present and identical.
fn schema_versions_unified(versions: &[Option<Uuid>]) -> bool {
    let mut distinct = FnvHashSet::default();
    for version in versions {
        match version {
            Some(v) => {
                distinct.insert(*v);
            }
            None => return false,
        }
    }
    distinct.len() <= 1
}

fn build_token_map(
    partitioner: Partitioner,
    hosts: &FnvHashMap<SocketAddr, PeerInfo>,
    keyspaces: &FnvHashMap<String, KeyspaceInfo>,
) -> TokenMap {
    let ring_hosts: Vec<RingHost> = hosts
        .iter()
        .map(|(addr, peer)| RingHost {
            address: *addr,
            datacenter: peer.datacenter.clone(),
            rack: peer.rack.clone(),
            tokens: peer.tokens.clone(),
        })
        .collect();
    let strategies: Vec<(String, Option<ReplicationStrategy>)> = keyspaces
        .iter()
        .map(|(name, info)| (name.clone(), info.strategy.clone()))
        .collect();
    TokenMap::build(partitioner, &ring_hosts, &strategies)
}

/// Column-name to cell-index lookup for one result set.
struct ColumnIndex {
    by_name: FnvHashMap<String, usize>,
}

impl ColumnIndex {
    fn new(rows: &Rows) -> ColumnIndex {
        let by_name = rows
            .metadata
            .col_specs
            .iter()
            .enumerate()
            .map(|(i, spec)| (spec.name.clone(), i))
            .collect();
        ColumnIndex { by_name }
    }

    fn cell<'a>(&self, row: &'a Row, name: &str) -> Option<&'a crate::message::CqlValue> {
        row.cell(*self.by_name.get(name)?)
    }

    fn text(&self, row: &Row, name: &str) -> Option<String> {
        self.cell(row, name)?.as_text().map(str::to_owned)
    }

    fn uuid(&self, row: &Row, name: &str) -> Option<Uuid> {
        self.cell(row, name)?.as_uuid()
    }
}

fn peer_info(cols: &ColumnIndex, row: &Row, partitioner: Partitioner) -> PeerInfo {
    let tokens = cols
        .cell(row, "tokens")
        .and_then(|v| v.as_text_collection())
        .map(|items| {
            items
                .into_iter()
                .filter_map(|t| partitioner.parse_token(t))
                .collect()
        })
        .unwrap_or_default();
    PeerInfo {
        datacenter: cols.text(row, "data_center"),
        rack: cols.text(row, "rack"),
        tokens,
        release_version: cols.text(row, "release_version"),
        schema_version: cols.uuid(row, "schema_version"),
    }
}

/// A peer's dialable endpoint: `rpc_address` unless it is the unspecified
/// address, in which case the internal `peer` address is used.
fn peer_endpoint(cols: &ColumnIndex, row: &Row, port: u16) -> Option<SocketAddr> {
    let rpc = cols.cell(row, "rpc_address").and_then(|v| v.as_inet());
    let peer = cols.cell(row, "peer").and_then(|v| v.as_inet());
    let ip = match rpc {
        Some(ip) if !ip.is_unspecified() => Some(ip),
        _ => peer,
    }?;
    Some(SocketAddr::new(ip, port))
}
