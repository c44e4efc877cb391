//! End-to-end tests against an in-process scripted cluster.
//!
//! Each mock node speaks just enough of the wire protocol to bootstrap a
//! session: STARTUP, OPTIONS, REGISTER, the system table queries the control
//! connection issues, PREPARE/EXECUTE bookkeeping, and canned responses for
//! user queries. Nodes can push server events and be killed mid-test.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use slog::{o, Logger};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use cql_session::coding::{BufExt, BufMutExt};
use cql_session::frame::{encode_response, Opcode};
use cql_session::message::Value;
use cql_session::policy::ConstantReconnectionPolicy;
use cql_session::session::QueryOptions;
use cql_session::{ProtocolVersion, QueryError, Session, SessionConfig, StreamId};

fn logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

#[derive(Clone)]
struct NodeInfo {
    addr: SocketAddr,
    datacenter: String,
    rack: String,
    token: String,
}

struct MockCluster {
    name: String,
    nodes: Mutex<Vec<NodeInfo>>,
    /// (keyspace, replication options as key/value pairs)
    keyspaces: Vec<(String, Vec<(String, String)>)>,
}

impl MockCluster {
    fn new(keyspaces: Vec<(String, Vec<(String, String)>)>) -> Arc<MockCluster> {
        Arc::new(MockCluster {
            name: "mock".to_owned(),
            nodes: Mutex::new(Vec::new()),
            keyspaces,
        })
    }
}

enum Canned {
    Unavailable,
    Rows(String),
}

struct MockNode {
    addr: SocketAddr,
    cluster: Arc<MockCluster>,
    /// Marker returned in the single cell of default user-query responses.
    marker: String,
    prepared: Mutex<HashSet<Vec<u8>>>,
    canned: Mutex<VecDeque<Canned>>,
    query_count: AtomicUsize,
    prepare_count: AtomicUsize,
    execute_count: AtomicUsize,
    event_subs: Mutex<Vec<mpsc::UnboundedSender<Bytes>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MockNode {
    async fn start(
        cluster: Arc<MockCluster>,
        datacenter: &str,
        token: i64,
        marker: &str,
    ) -> Arc<MockNode> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        cluster.nodes.lock().unwrap().push(NodeInfo {
            addr,
            datacenter: datacenter.to_owned(),
            rack: "r1".to_owned(),
            token: token.to_string(),
        });
        let node = Arc::new(MockNode {
            addr,
            cluster,
            marker: marker.to_owned(),
            prepared: Mutex::new(HashSet::new()),
            canned: Mutex::new(VecDeque::new()),
            query_count: AtomicUsize::new(0),
            prepare_count: AtomicUsize::new(0),
            execute_count: AtomicUsize::new(0),
            event_subs: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        });
        let accept_node = node.clone();
        let accept = tokio::spawn(async move {
            loop {
                let (socket, _) = match listener.accept().await {
                    Ok(x) => x,
                    Err(_) => return,
                };
                socket.set_nodelay(true).ok();
                let (read, write) = socket.into_split();
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                let writer = tokio::spawn(write_loop(write, out_rx));
                let reader = tokio::spawn(serve_connection(accept_node.clone(), read, out_tx));
                accept_node.tasks.lock().unwrap().push(writer);
                accept_node.tasks.lock().unwrap().push(reader);
            }
        });
        node.tasks.lock().unwrap().push(accept);
        node
    }

    /// Stop listening and sever every open connection.
    fn kill(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.event_subs.lock().unwrap().clear();
    }

    /// Push a TOPOLOGY_CHANGE NEW_NODE event to every registered subscriber.
    fn push_new_node_event(&self, addr: SocketAddr) {
        let mut body = BytesMut::new();
        body.put_string("TOPOLOGY_CHANGE");
        body.put_string("NEW_NODE");
        body.put_inet(addr);
        let mut frame = BytesMut::new();
        encode_response(
            ProtocolVersion::V4,
            0,
            StreamId(-1),
            Opcode::Event,
            &body,
            &mut frame,
        );
        let frame = frame.freeze();
        for sub in self.event_subs.lock().unwrap().iter() {
            let _ = sub.send(frame.clone());
        }
    }
}

async fn write_loop(mut write: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        if write.write_all(&frame).await.is_err() {
            return;
        }
    }
}

struct Request {
    version: ProtocolVersion,
    stream: StreamId,
    opcode: Opcode,
    body: Bytes,
}

async fn read_request(read: &mut OwnedReadHalf) -> Option<Request> {
    let mut first = [0u8; 1];
    read.read_exact(&mut first).await.ok()?;
    let header_len = if first[0] & 0x7f == 0x02 { 8 } else { 9 };
    let mut rest = vec![0u8; header_len - 1];
    read.read_exact(&mut rest).await.ok()?;
    let mut header = BytesMut::new();
    header.extend_from_slice(&first);
    header.extend_from_slice(&rest);
    let mut header = header.freeze();
    let version_byte = header.get::<u8>().unwrap();
    let version = ProtocolVersion::from_wire(version_byte)?;
    let _flags = header.get::<u8>().unwrap();
    let stream = match version {
        ProtocolVersion::V2 => StreamId(i16::from(header.get::<i8>().unwrap())),
        _ => StreamId(header.get::<i16>().unwrap()),
    };
    let opcode = Opcode::from_wire(header.get::<u8>().unwrap()).ok()?;
    let len = header.get::<u32>().unwrap() as usize;
    let mut body = vec![0u8; len];
    read.read_exact(&mut body).await.ok()?;
    Some(Request {
        version,
        stream,
        opcode,
        body: Bytes::from(body),
    })
}

async fn serve_connection(
    node: Arc<MockNode>,
    mut read: OwnedReadHalf,
    out: mpsc::UnboundedSender<Bytes>,
) {
    while let Some(request) = read_request(&mut read).await {
        let (opcode, body) = respond(&node, &request, &out);
        let mut frame = BytesMut::new();
        encode_response(request.version, 0, request.stream, opcode, &body, &mut frame);
        if out.send(frame.freeze()).is_err() {
            return;
        }
    }
}

fn respond(
    node: &Arc<MockNode>,
    request: &Request,
    out: &mpsc::UnboundedSender<Bytes>,
) -> (Opcode, BytesMut) {
    let mut body = request.body.clone();
    match request.opcode {
        Opcode::Startup => (Opcode::Ready, BytesMut::new()),
        Opcode::Options => {
            let mut out = BytesMut::new();
            out.write::<u16>(0u16);
            (Opcode::Supported, out)
        }
        Opcode::Register => {
            node.event_subs.lock().unwrap().push(out.clone());
            (Opcode::Ready, BytesMut::new())
        }
        Opcode::Prepare => {
            node.prepare_count.fetch_add(1, Ordering::SeqCst);
            let _query = body.get_long_string().unwrap();
            node.prepared.lock().unwrap().insert(b"\xca\xfe".to_vec());
            (Opcode::Result, prepared_result(b"\xca\xfe"))
        }
        Opcode::Execute => {
            node.execute_count.fetch_add(1, Ordering::SeqCst);
            let id = body.get_short_bytes().unwrap();
            if node.prepared.lock().unwrap().contains(id.as_ref()) {
                (Opcode::Result, marker_rows(&node.marker))
            } else {
                (Opcode::Error, unprepared_error(&id))
            }
        }
        Opcode::Batch => {
            let mut out = BytesMut::new();
            out.write::<i32>(0x0001); // void
            (Opcode::Result, out)
        }
        Opcode::Query => {
            let query = body.get_long_string().unwrap();
            if query.starts_with("SELECT schema_version FROM system.local") {
                (Opcode::Result, schema_local_rows())
            } else if query.starts_with("SELECT peer, schema_version FROM system.peers") {
                (Opcode::Result, schema_peers_rows(node))
            } else if query.contains("FROM system.local") {
                (Opcode::Result, local_rows(node))
            } else if query.contains("FROM system.peers") {
                (Opcode::Result, peers_rows(node))
            } else if query.contains("FROM system_schema.keyspaces") {
                (Opcode::Result, keyspaces_rows(node))
            } else if query.contains("FROM system_schema.tables") {
                (Opcode::Result, empty_rows())
            } else if query.contains("FROM system_schema.types") {
                (Opcode::Result, empty_rows())
            } else {
                node.query_count.fetch_add(1, Ordering::SeqCst);
                let canned = node.canned.lock().unwrap().pop_front();
                match canned {
                    Some(Canned::Unavailable) => (Opcode::Error, unavailable_error()),
                    Some(Canned::Rows(marker)) => (Opcode::Result, marker_rows(&marker)),
                    None => (Opcode::Result, marker_rows(&node.marker)),
                }
            }
        }
        _ => {
            let mut out = BytesMut::new();
            out.write::<i32>(0x0000);
            out.put_string("unsupported opcode");
            (Opcode::Error, out)
        }
    }
}

//
// Response body builders
//

enum CellType {
    Varchar,
    Inet,
    Uuid,
    SetVarchar,
    MapVarcharVarchar,
}

impl CellType {
    fn write_option(&self, buf: &mut BytesMut) {
        match self {
            CellType::Varchar => buf.write::<u16>(0x000d_u16),
            CellType::Inet => buf.write::<u16>(0x0010_u16),
            CellType::Uuid => buf.write::<u16>(0x000c_u16),
            CellType::SetVarchar => {
                buf.write::<u16>(0x0022_u16);
                buf.write::<u16>(0x000d_u16);
            }
            CellType::MapVarcharVarchar => {
                buf.write::<u16>(0x0021_u16);
                buf.write::<u16>(0x000d_u16);
                buf.write::<u16>(0x000d_u16);
            }
        }
    }
}

fn rows_result(cols: Vec<(&str, CellType)>, rows: Vec<Vec<Option<Bytes>>>) -> BytesMut {
    let mut body = BytesMut::new();
    body.write::<i32>(0x0002); // rows
    body.write::<i32>(0x01); // global tables spec
    body.write::<i32>(cols.len() as i32);
    body.put_string("system");
    body.put_string("mock");
    for (name, ty) in &cols {
        body.put_string(name);
        ty.write_option(&mut body);
    }
    body.write::<i32>(rows.len() as i32);
    for row in rows {
        for cell in row {
            body.put_bytes_opt(cell.as_deref());
        }
    }
    body
}

fn empty_rows() -> BytesMut {
    let mut body = BytesMut::new();
    body.write::<i32>(0x0002);
    body.write::<i32>(0x00); // no global spec
    body.write::<i32>(0); // columns
    body.write::<i32>(0); // rows
    body
}

fn text_cell(s: &str) -> Option<Bytes> {
    Some(Bytes::copy_from_slice(s.as_bytes()))
}

fn inet_cell(addr: SocketAddr) -> Option<Bytes> {
    match addr.ip() {
        std::net::IpAddr::V4(ip) => Some(Bytes::copy_from_slice(&ip.octets())),
        std::net::IpAddr::V6(ip) => Some(Bytes::copy_from_slice(&ip.octets())),
    }
}

fn uuid_cell(fill: u8) -> Option<Bytes> {
    Some(Bytes::copy_from_slice(&[fill; 16]))
}

/// v3+ collection format: i32 count, i32-length elements.
fn set_text_cell(items: &[&str]) -> Option<Bytes> {
    let mut out = BytesMut::new();
    out.write::<i32>(items.len() as i32);
    for item in items {
        out.write::<i32>(item.len() as i32);
        out.extend_from_slice(item.as_bytes());
    }
    Some(out.freeze())
}

fn map_text_cell(entries: &[(String, String)]) -> Option<Bytes> {
    let mut out = BytesMut::new();
    out.write::<i32>(entries.len() as i32);
    for (k, v) in entries {
        out.write::<i32>(k.len() as i32);
        out.extend_from_slice(k.as_bytes());
        out.write::<i32>(v.len() as i32);
        out.extend_from_slice(v.as_bytes());
    }
    Some(out.freeze())
}

fn local_rows(node: &MockNode) -> BytesMut {
    let info = {
        let nodes = node.cluster.nodes.lock().unwrap();
        nodes.iter().find(|n| n.addr == node.addr).cloned().unwrap()
    };
    rows_result(
        vec![
            ("cluster_name", CellType::Varchar),
            ("data_center", CellType::Varchar),
            ("rack", CellType::Varchar),
            ("partitioner", CellType::Varchar),
            ("tokens", CellType::SetVarchar),
            ("release_version", CellType::Varchar),
            ("schema_version", CellType::Uuid),
        ],
        vec![vec![
            text_cell(&node.cluster.name),
            text_cell(&info.datacenter),
            text_cell(&info.rack),
            text_cell("org.apache.cassandra.dht.Murmur3Partitioner"),
            set_text_cell(&[&info.token]),
            text_cell("3.11.4"),
            uuid_cell(7),
        ]],
    )
}

fn peers_rows(node: &MockNode) -> BytesMut {
    let peers: Vec<NodeInfo> = node
        .cluster
        .nodes
        .lock()
        .unwrap()
        .iter()
        .filter(|n| n.addr != node.addr)
        .cloned()
        .collect();
    rows_result(
        vec![
            ("peer", CellType::Inet),
            ("rpc_address", CellType::Inet),
            ("data_center", CellType::Varchar),
            ("rack", CellType::Varchar),
            ("tokens", CellType::SetVarchar),
            ("release_version", CellType::Varchar),
            ("schema_version", CellType::Uuid),
        ],
        peers
            .iter()
            .map(|peer| {
                vec![
                    inet_cell(peer.addr),
                    inet_cell(peer.addr),
                    text_cell(&peer.datacenter),
                    text_cell(&peer.rack),
                    set_text_cell(&[&peer.token]),
                    text_cell("3.11.4"),
                    uuid_cell(7),
                ]
            })
            .collect(),
    )
}

fn keyspaces_rows(node: &MockNode) -> BytesMut {
    rows_result(
        vec![
            ("keyspace_name", CellType::Varchar),
            ("replication", CellType::MapVarcharVarchar),
        ],
        node.cluster
            .keyspaces
            .iter()
            .map(|(name, replication)| vec![text_cell(name), map_text_cell(replication)])
            .collect(),
    )
}

fn schema_local_rows() -> BytesMut {
    rows_result(
        vec![("schema_version", CellType::Uuid)],
        vec![vec![uuid_cell(7)]],
    )
}

fn schema_peers_rows(node: &MockNode) -> BytesMut {
    let peers: Vec<NodeInfo> = node
        .cluster
        .nodes
        .lock()
        .unwrap()
        .iter()
        .filter(|n| n.addr != node.addr)
        .cloned()
        .collect();
    rows_result(
        vec![
            ("peer", CellType::Inet),
            ("schema_version", CellType::Uuid),
        ],
        peers
            .iter()
            .map(|peer| vec![inet_cell(peer.addr), uuid_cell(7)])
            .collect(),
    )
}

fn marker_rows(marker: &str) -> BytesMut {
    rows_result(vec![("v", CellType::Varchar)], vec![vec![text_cell(marker)]])
}

fn prepared_result(id: &[u8]) -> BytesMut {
    let mut body = BytesMut::new();
    body.write::<i32>(0x0004); // prepared
    body.put_short_bytes(id);
    body.write::<i32>(0); // metadata flags
    body.write::<i32>(0); // columns
    body.write::<i32>(0); // pk count (v4)
    body.write::<i32>(0); // result metadata flags
    body.write::<i32>(0); // result columns
    body
}

fn unavailable_error() -> BytesMut {
    let mut body = BytesMut::new();
    body.write::<i32>(0x1000);
    body.put_string("not enough replicas");
    body.write::<u16>(0x0001_u16); // ONE
    body.write::<i32>(1);
    body.write::<i32>(0);
    body
}

fn unprepared_error(id: &Bytes) -> BytesMut {
    let mut body = BytesMut::new();
    body.write::<i32>(0x2500);
    body.put_string("unprepared");
    body.put_short_bytes(id);
    body
}

//
// Harness
//

fn test_config(seeds: Vec<SocketAddr>) -> SessionConfig {
    let mut config = SessionConfig::new(seeds);
    config.reconnection = Arc::new(ConstantReconnectionPolicy {
        delay: Duration::from_millis(100),
    });
    config.pool.core_size = 1;
    config.request_timeout = Duration::from_secs(2);
    config.connect_timeout = Duration::from_secs(2);
    config.bootstrap_timeout = Duration::from_secs(10);
    config.schema_refresh_debounce = Duration::from_millis(100);
    config
}

fn app_keyspace() -> Vec<(String, Vec<(String, String)>)> {
    vec![(
        "app".to_owned(),
        vec![
            (
                "class".to_owned(),
                "org.apache.cassandra.locator.SimpleStrategy".to_owned(),
            ),
            ("replication_factor".to_owned(), "1".to_owned()),
        ],
    )]
}

fn first_cell_text(result: &cql_session::QueryResult) -> String {
    result.rows.as_ref().unwrap()[0]
        .cell(0)
        .unwrap()
        .as_text()
        .unwrap()
        .to_owned()
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {}", what);
}

// `hash(b"foo")` is 0x4f38a2c6f83680d6, roughly 5.7e18. With tokens -6e18
// (node a), 0 (node b), 6e18 (node c), the key lands on node c's segment.
const FOO_OWNER_TOKEN: i64 = 6_000_000_000_000_000_000;

#[tokio::test]
async fn token_aware_read_goes_to_the_replica() {
    let cluster = MockCluster::new(app_keyspace());
    let a = MockNode::start(cluster.clone(), "dc1", -6_000_000_000_000_000_000, "a").await;
    let b = MockNode::start(cluster.clone(), "dc1", 0, "b").await;
    let c = MockNode::start(cluster.clone(), "dc1", FOO_OWNER_TOKEN, "c").await;

    let session = Session::connect(logger(), test_config(vec![a.addr]))
        .await
        .unwrap();
    wait_until("all pools ready", || {
        session.metadata().hosts.len() == 3
    })
    .await;

    let options = QueryOptions {
        keyspace: Some("app".to_owned()),
        routing_key: Some(Bytes::from_static(b"foo")),
        ..QueryOptions::default()
    };
    let result = session
        .query_with("SELECT v FROM app.t WHERE k = ?", vec![Value::text("foo")], options)
        .await
        .unwrap();

    assert_eq!(first_cell_text(&result), "c");
    assert_eq!(c.query_count.load(Ordering::SeqCst), 1);
    assert_eq!(a.query_count.load(Ordering::SeqCst), 0);
    assert_eq!(b.query_count.load(Ordering::SeqCst), 0);
    session.close();
}

#[tokio::test]
async fn unavailable_replica_fails_over_to_the_next_host() {
    let cluster = MockCluster::new(app_keyspace());
    let a = MockNode::start(cluster.clone(), "dc1", -6_000_000_000_000_000_000, "a").await;
    let b = MockNode::start(cluster.clone(), "dc1", 0, "b").await;
    let c = MockNode::start(cluster.clone(), "dc1", FOO_OWNER_TOKEN, "c").await;
    c.canned.lock().unwrap().push_back(Canned::Unavailable);

    let session = Session::connect(logger(), test_config(vec![a.addr]))
        .await
        .unwrap();
    wait_until("all pools ready", || {
        session.metadata().hosts.len() == 3
    })
    .await;

    let options = QueryOptions {
        keyspace: Some("app".to_owned()),
        routing_key: Some(Bytes::from_static(b"foo")),
        ..QueryOptions::default()
    };
    let result = session
        .query_with("SELECT v FROM app.t WHERE k = ?", vec![Value::text("foo")], options)
        .await
        .unwrap();

    // The replica got exactly one attempt; the retry landed elsewhere.
    let marker = first_cell_text(&result);
    assert!(marker == "a" || marker == "b", "unexpected marker {}", marker);
    assert_eq!(c.query_count.load(Ordering::SeqCst), 1);
    assert_eq!(
        a.query_count.load(Ordering::SeqCst) + b.query_count.load(Ordering::SeqCst),
        1
    );
    session.close();
}

#[tokio::test]
async fn unprepared_statement_is_reprepared_transparently() {
    let cluster = MockCluster::new(app_keyspace());
    let a = MockNode::start(cluster.clone(), "dc1", 0, "a").await;

    let session = Session::connect(logger(), test_config(vec![a.addr]))
        .await
        .unwrap();

    let prepared = session
        .prepare("SELECT v FROM app.t WHERE k = ?")
        .await
        .unwrap();
    assert_eq!(a.prepare_count.load(Ordering::SeqCst), 1);

    // The node "restarts" and forgets the statement.
    a.prepared.lock().unwrap().clear();

    let result = session
        .execute(&prepared, vec![Value::text("foo")])
        .await
        .unwrap();
    assert_eq!(first_cell_text(&result), "a");
    // First EXECUTE came back unprepared, then PREPARE, then EXECUTE again.
    assert_eq!(a.execute_count.load(Ordering::SeqCst), 2);
    assert_eq!(a.prepare_count.load(Ordering::SeqCst), 2);
    session.close();
}

#[tokio::test]
async fn new_node_event_adds_a_routable_host() {
    let cluster = MockCluster::new(app_keyspace());
    let a = MockNode::start(cluster.clone(), "dc1", -6_000_000_000_000_000_000, "a").await;
    let b = MockNode::start(cluster.clone(), "dc1", 0, "b").await;

    let session = Session::connect(logger(), test_config(vec![a.addr]))
        .await
        .unwrap();
    wait_until("initial hosts", || session.metadata().hosts.len() == 2).await;

    // A third node joins and the control host announces it.
    let x = MockNode::start(cluster.clone(), "dc1", FOO_OWNER_TOKEN, "x").await;
    a.push_new_node_event(x.addr);

    let metadata_session = &session;
    wait_until("new host discovered", || {
        metadata_session.metadata().hosts.contains_key(&x.addr)
    })
    .await;

    // Round-robin over three hosts must reach the new one.
    let mut saw_x = false;
    for _ in 0..30 {
        let result = session.query("SELECT v FROM app.t", vec![]).await.unwrap();
        if first_cell_text(&result) == "x" {
            saw_x = true;
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(saw_x, "new node never served a query");
    session.close();
}

#[tokio::test]
async fn control_failover_keeps_last_known_metadata() {
    let cluster = MockCluster::new(app_keyspace());
    let a = MockNode::start(cluster.clone(), "dc1", 0, "a").await;
    let b = MockNode::start(cluster.clone(), "dc1", FOO_OWNER_TOKEN, "b").await;

    let session = Session::connect(logger(), test_config(vec![a.addr]))
        .await
        .unwrap();
    wait_until("initial hosts", || session.metadata().hosts.len() == 2).await;

    // Kill the control host. The snapshot must remain readable, not error.
    a.kill();
    {
        let nodes = &a.cluster.nodes;
        nodes.lock().unwrap().retain(|n| n.addr != a.addr);
    }
    let metadata = session.metadata();
    assert_eq!(metadata.cluster_name, "mock");
    assert_eq!(metadata.hosts.len(), 2);

    // After the reconnection delay the control loop re-homes on b and the
    // session keeps serving queries.
    let deadline = timeout(Duration::from_secs(10), async {
        loop {
            let result = session.query("SELECT v FROM app.t", vec![]).await;
            if let Ok(result) = result {
                if first_cell_text(&result) == "b" {
                    return;
                }
            }
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    assert!(deadline.is_ok(), "session never recovered on the second host");
    session.close();
}

#[tokio::test]
async fn non_idempotent_write_is_not_retried_after_transport_errors() {
    let cluster = MockCluster::new(app_keyspace());
    let a = MockNode::start(cluster.clone(), "dc1", 0, "a").await;

    let session = Session::connect(logger(), test_config(vec![a.addr]))
        .await
        .unwrap();

    // Sever the data connections out from under the session; the control
    // connection dies too, but metadata stays.
    a.kill();
    let result = session
        .query("INSERT INTO app.t (k) VALUES (1)", vec![])
        .await;
    match result {
        Err(QueryError::Connection(_)) | Err(QueryError::NoHostAvailable(_)) | Err(QueryError::Timeout) => {}
        other => panic!("expected a transport-level failure, got {:?}", other.map(|_| ())),
    }
    session.close();
}

#[tokio::test]
async fn bad_query_errors_surface_immediately() {
    let cluster = MockCluster::new(app_keyspace());
    let a = MockNode::start(cluster.clone(), "dc1", 0, "a").await;

    let session = Session::connect(logger(), test_config(vec![a.addr]))
        .await
        .unwrap();

    // Top-level SERIAL is rejected locally, before any host is contacted.
    let before = a.query_count.load(Ordering::SeqCst);
    let options = QueryOptions {
        consistency: Some(cql_session::Consistency::Serial),
        ..QueryOptions::default()
    };
    let result = session
        .query_with("SELECT v FROM app.t", vec![], options)
        .await;
    assert!(matches!(result, Err(QueryError::BadQuery(_))));
    assert_eq!(a.query_count.load(Ordering::SeqCst), before);
    session.close();
}
