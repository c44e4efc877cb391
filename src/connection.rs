//! One TCP socket: request multiplexing by stream id, a single writer task
//! preserving submission order on the wire, a reader task routing responses
//! to their waiters, and an OPTIONS keepalive.
//!
//! Lifecycle is handshake → ready → draining → closed. Once closed, every
//! pending waiter is resolved with the closing error exactly once and no new
//! sends are accepted. A waiter abandoned by its caller (deadline elapsed,
//! speculative sibling won) keeps its stream id reserved until the late
//! response arrives or the connection closes; ids are recycled by the reader,
//! never by the caller.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use failure::Fail;
use fnv::FnvHashMap;
use slog::{debug, o, trace, warn, Logger};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, DbError, QueryError};
use crate::frame::{encode_request, FrameDecoder, FrameHeader, Opcode};
use crate::message::{
    parse_response, AuthResponse, Event, RequestMessage, Response, ResponseEnvelope, Startup,
};
use crate::{ProtocolVersion, RequestValidationError, StreamId, EVENT_STREAM_ID};

/// Channel server-pushed events are forwarded into; only the control
/// connection installs one.
pub type EventSender = mpsc::UnboundedSender<Event>;

/// A failure of one `request` call: either the request could not be expressed
/// for the negotiated protocol version, or the transport gave up.
#[derive(Debug, Fail)]
pub enum RequestError {
    #[fail(display = "{}", _0)]
    Validation(RequestValidationError),
    #[fail(display = "{}", _0)]
    Connection(ConnectionError),
}

impl From<RequestValidationError> for RequestError {
    fn from(x: RequestValidationError) -> Self {
        RequestError::Validation(x)
    }
}

impl From<ConnectionError> for RequestError {
    fn from(x: ConnectionError) -> Self {
        RequestError::Connection(x)
    }
}

impl From<RequestError> for QueryError {
    fn from(x: RequestError) -> Self {
        match x {
            RequestError::Validation(v) => QueryError::BadQuery(v.to_string()),
            RequestError::Connection(c) => c.into(),
        }
    }
}

impl RequestError {
    /// Collapse into a connection error; validation failures become handshake
    /// errors. Used on paths (handshake, keepalive) that only send messages
    /// every version can express.
    fn into_connection_error(self) -> ConnectionError {
        match self {
            RequestError::Connection(c) => c,
            RequestError::Validation(v) => ConnectionError::Handshake(v.to_string()),
        }
    }
}

type WaiterPayload = Result<(FrameHeader, Bytes), ConnectionError>;

struct Waiters {
    table: FnvHashMap<i16, oneshot::Sender<WaiterPayload>>,
    free_ids: Vec<i16>,
    next_fresh: i16,
    limit: i16,
    closed: bool,
}

impl Waiters {
    fn new(limit: i16) -> Waiters {
        Waiters {
            table: FnvHashMap::default(),
            free_ids: Vec::new(),
            next_fresh: 0,
            limit,
            closed: false,
        }
    }

    /// Hand out a stream id. Callers hold a semaphore permit, so an id is
    /// always available unless the connection closed under us.
    fn allocate(&mut self, tx: oneshot::Sender<WaiterPayload>) -> Option<StreamId> {
        if self.closed {
            return None;
        }
        let id = match self.free_ids.pop() {
            Some(id) => id,
            None => {
                if self.next_fresh >= self.limit {
                    return None;
                }
                let id = self.next_fresh;
                self.next_fresh += 1;
                id
            }
        };
        self.table.insert(id, tx);
        Some(StreamId(id))
    }

    /// Take the waiter for a routed response and recycle its id. `None` for
    /// ids we never allocated.
    fn complete(&mut self, id: i16) -> Option<oneshot::Sender<WaiterPayload>> {
        if self.closed {
            return None;
        }
        let tx = self.table.remove(&id)?;
        self.free_ids.push(id);
        Some(tx)
    }
}

struct Inner {
    log: Logger,
    address: SocketAddr,
    config: Arc<ConnectionConfig>,
    waiters: Mutex<Waiters>,
    ids: Semaphore,
    write_tx: mpsc::Sender<Bytes>,
    in_flight: AtomicUsize,
    created: Instant,
    /// Milliseconds since `created` of the last frame seen in either
    /// direction.
    last_activity: AtomicU64,
    closed: watch::Sender<bool>,
    close_reason: Mutex<Option<ConnectionError>>,
}

impl Inner {
    fn touch(&self) {
        let ms = self.created.elapsed().as_millis() as u64;
        self.last_activity.store(ms, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.created.elapsed().as_millis() as u64;
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn close_reason(&self) -> ConnectionError {
        self.close_reason
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(ConnectionError::Closed)
    }

    /// Route one decoded frame. An error here is fatal to the connection.
    fn handle_frame(
        &self,
        header: FrameHeader,
        body: Bytes,
        events: &Option<EventSender>,
    ) -> Result<(), ConnectionError> {
        self.touch();
        if header.stream == EVENT_STREAM_ID {
            let envelope = parse_response(&header, body).map_err(ConnectionError::from)?;
            match envelope.message {
                Response::Event(event) => {
                    trace!(self.log, "server event"; "event" => ?event);
                    if let Some(tx) = events {
                        let _ = tx.send(event);
                    }
                }
                other => {
                    warn!(self.log, "non-event frame on the event stream"; "response" => ?other)
                }
            }
            return Ok(());
        }
        let waiter = self.waiters.lock().unwrap().complete(header.stream.0);
        match waiter {
            Some(tx) => {
                self.in_flight.fetch_sub(1, Ordering::Relaxed);
                self.ids.add_permits(1);
                // An abandoned waiter just frees the id; its caller is gone.
                let _ = tx.send(Ok((header, body)));
            }
            None => {
                trace!(self.log, "response for unknown stream"; "stream" => %header.stream);
            }
        }
        Ok(())
    }
}

/// First close wins: set the reason, wake id waiters, fail response waiters.
fn close(inner: &Arc<Inner>, reason: ConnectionError) {
    {
        let mut guard = inner.close_reason.lock().unwrap();
        if guard.is_some() {
            return;
        }
        *guard = Some(reason.clone());
    }
    debug!(inner.log, "connection closed"; "reason" => %reason);
    let _ = inner.closed.send(true);
    inner.ids.close();
    let drained = {
        let mut waiters = inner.waiters.lock().unwrap();
        waiters.closed = true;
        waiters.free_ids.clear();
        waiters.table.drain().collect::<Vec<_>>()
    };
    for (_, tx) in drained {
        let _ = tx.send(Err(reason.clone()));
    }
    inner.in_flight.store(0, Ordering::Relaxed);
}

async fn request_raw(
    inner: &Arc<Inner>,
    opcode: Opcode,
    body: Bytes,
    deadline: Duration,
) -> Result<ResponseEnvelope, ConnectionError> {
    eprintln!("DBG request_raw start");
    if inner.is_closed() {
        return Err(inner.close_reason());
    }
    eprintln!("DBG before acquire");
    let permit = match timeout(inner.config.stream_wait_timeout, inner.ids.acquire()).await {
        // No id freed up within the bounded wait: the connection is
        // saturated, not broken.
        Err(_) => return Err(ConnectionError::Busy),
        Ok(Err(_)) => return Err(inner.close_reason()),
        Ok(Ok(permit)) => permit,
    };
    eprintln!("DBG after acquire");
    // The permit comes back when the reader recycles the id, not when this
    // future ends.
    permit.forget();

    let (tx, rx) = oneshot::channel();
    let stream = match inner.waiters.lock().unwrap().allocate(tx) {
        Some(stream) => stream,
        None => return Err(inner.close_reason()),
    };
    eprintln!("DBG allocated stream {:?}", stream);

    let mut frame = BytesMut::with_capacity(inner.config.version.header_len() + body.len());
    encode_request(inner.config.version, stream, opcode, &body, &mut frame);
    inner.in_flight.fetch_add(1, Ordering::Relaxed);
    eprintln!("DBG before write_tx.send");
    if inner.write_tx.send(frame.freeze()).await.is_err() {
        return Err(inner.close_reason());
    }
    eprintln!("DBG after write_tx.send, awaiting rx");

    match timeout(deadline, rx).await {
        Err(_) => {
            trace!(inner.log, "request timed out"; "stream" => %stream);
            Err(ConnectionError::RequestTimeout)
        }
        Ok(Err(_)) => Err(inner.close_reason()),
        Ok(Ok(Err(e))) => Err(e),
        Ok(Ok(Ok((header, body)))) => match parse_response(&header, body) {
            Ok(envelope) => Ok(envelope),
            Err(proto) => {
                let e = ConnectionError::from(proto);
                close(inner, e.clone());
                Err(e)
            }
        },
    }
}

async fn run_reader(
    inner: Arc<Inner>,
    mut read: OwnedReadHalf,
    events: Option<EventSender>,
    mut closed_rx: watch::Receiver<bool>,
) {
    let mut decoder = FrameDecoder::new(inner.config.version, inner.config.max_frame_len);
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let reason = 'outer: loop {
        loop {
            match decoder.decode(&mut buf) {
                Ok(Some((header, body))) => {
                    if let Err(e) = inner.handle_frame(header, body, &events) {
                        break 'outer e;
                    }
                }
                Ok(None) => break,
                Err(e) => break 'outer e.into(),
            }
        }
        tokio::select! {
            res = read.read_buf(&mut buf) => match res {
                Ok(0) => break 'outer ConnectionError::Closed,
                Ok(_) => {}
                Err(e) => break 'outer e.into(),
            },
            _ = closed_rx.changed() => return,
        }
    };
    close(&inner, reason);
}

async fn run_writer(
    inner: Arc<Inner>,
    mut write: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    mut closed_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(frame) => {
                    if let Err(e) = write.write_all(&frame).await {
                        close(&inner, e.into());
                        return;
                    }
                    inner.touch();
                }
                None => return,
            },
            _ = closed_rx.changed() => return,
        }
    }
}

async fn run_keepalive(inner: Arc<Inner>, mut closed_rx: watch::Receiver<bool>) {
    let idle = inner.config.idle_timeout;
    let mut misses = 0u32;
    loop {
        let quiet = inner.idle_for();
        if quiet < idle {
            tokio::select! {
                _ = tokio::time::sleep(idle - quiet) => {}
                _ = closed_rx.changed() => return,
            }
            continue;
        }
        trace!(inner.log, "sending keepalive probe");
        match request_raw(&inner, Opcode::Options, Bytes::new(), inner.config.request_timeout)
            .await
        {
            Ok(_) => misses = 0,
            Err(ConnectionError::RequestTimeout) | Err(ConnectionError::Busy) => {
                misses += 1;
                if misses >= 2 {
                    close(&inner, ConnectionError::KeepaliveTimeout);
                    return;
                }
            }
            // Any other failure already closed the connection.
            Err(_) => return,
        }
    }
}

pub struct Connection {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Connect, handshake (STARTUP and, if demanded, the authentication
    /// exchange), and start the reader/writer/keepalive tasks. A control
    /// connection passes an event sender and then calls
    /// [`register_for_events`](Connection::register_for_events).
    pub async fn open(
        log: Logger,
        address: SocketAddr,
        config: Arc<ConnectionConfig>,
        events: Option<EventSender>,
    ) -> Result<Connection, ConnectionError> {
        let log = log.new(o!("peer" => address.to_string()));
        let stream = timeout(config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ConnectionError::ConnectTimeout)??;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();

        let (write_tx, write_rx) = mpsc::channel(config.write_queue_depth);
        let (closed_tx, closed_rx) = watch::channel(false);
        let stream_ids = config.version.stream_id_space();
        let inner = Arc::new(Inner {
            log,
            address,
            waiters: Mutex::new(Waiters::new(stream_ids as i16)),
            ids: Semaphore::new(stream_ids),
            write_tx,
            in_flight: AtomicUsize::new(0),
            created: Instant::now(),
            last_activity: AtomicU64::new(0),
            closed: closed_tx,
            close_reason: Mutex::new(None),
            config,
        });

        let reader = tokio::spawn(run_reader(inner.clone(), read, events, closed_rx.clone()));
        let writer = tokio::spawn(run_writer(inner.clone(), write, write_rx, closed_rx.clone()));
        let connection = Connection {
            inner: inner.clone(),
            tasks: Mutex::new(vec![reader, writer]),
        };

        if let Err(e) = connection.handshake().await {
            connection.shutdown(e.clone());
            return Err(e);
        }
        let keepalive = tokio::spawn(run_keepalive(inner, closed_rx));
        connection.tasks.lock().unwrap().push(keepalive);
        debug!(connection.inner.log, "connection ready");
        Ok(connection)
    }

    async fn handshake(&self) -> Result<(), ConnectionError> {
        let envelope = self
            .request(&Startup)
            .await
            .map_err(RequestError::into_connection_error)?;
        match envelope.message {
            Response::Ready => Ok(()),
            Response::Authenticate(class) => self.authenticate(&class).await,
            Response::Error {
                error: DbError::ProtocolError,
                message,
            } => Err(ConnectionError::VersionRejected(message)),
            Response::Error {
                error: DbError::BadCredentials,
                message,
            } => Err(ConnectionError::Auth(message)),
            Response::Error { message, .. } => Err(ConnectionError::Handshake(message)),
            other => Err(ConnectionError::Handshake(format!(
                "unexpected startup response: {:?}",
                other
            ))),
        }
    }

    async fn authenticate(&self, class: &str) -> Result<(), ConnectionError> {
        let authenticator = self.inner.config.authenticator.clone().ok_or_else(|| {
            ConnectionError::Auth(format!(
                "server requires authentication ({}) but none is configured",
                class
            ))
        })?;
        let mut token = authenticator
            .initial_response(class)
            .map_err(ConnectionError::Auth)?;
        loop {
            let envelope = self
                .request(&AuthResponse {
                    token: token.take(),
                })
                .await
                .map_err(RequestError::into_connection_error)?;
            match envelope.message {
                Response::AuthSuccess(final_token) => {
                    authenticator.on_success(final_token.as_deref());
                    return Ok(());
                }
                Response::AuthChallenge(challenge) => {
                    token = authenticator
                        .evaluate_challenge(challenge.as_deref())
                        .map_err(ConnectionError::Auth)?;
                }
                Response::Error { message, .. } => return Err(ConnectionError::Auth(message)),
                other => {
                    return Err(ConnectionError::Handshake(format!(
                        "unexpected authentication response: {:?}",
                        other
                    )))
                }
            }
        }
    }

    /// Subscribe this connection to topology, status, and schema events.
    pub async fn register_for_events(&self) -> Result<(), ConnectionError> {
        let envelope = self
            .request(&crate::message::Register)
            .await
            .map_err(RequestError::into_connection_error)?;
        match envelope.message {
            Response::Ready => Ok(()),
            other => Err(ConnectionError::Handshake(format!(
                "unexpected register response: {:?}",
                other
            ))),
        }
    }

    /// Encode and send a request, then wait for its response under the
    /// default per-request deadline.
    pub async fn request<R: RequestMessage>(
        &self,
        message: &R,
    ) -> Result<ResponseEnvelope, RequestError> {
        self.request_with_timeout(message, self.inner.config.request_timeout)
            .await
    }

    pub async fn request_with_timeout<R: RequestMessage>(
        &self,
        message: &R,
        deadline: Duration,
    ) -> Result<ResponseEnvelope, RequestError> {
        let mut body = BytesMut::new();
        message.encode_body(self.inner.config.version, &mut body)?;
        let envelope = request_raw(&self.inner, R::OPCODE, body.freeze(), deadline).await?;
        Ok(envelope)
    }

    pub fn address(&self) -> SocketAddr {
        self.inner.address
    }

    pub fn version(&self) -> ProtocolVersion {
        self.inner.config.version
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Relaxed)
    }

    /// Resolves once the connection has transitioned to closed.
    pub async fn wait_closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn shutdown(&self, reason: ConnectionError) {
        close(&self.inner, reason);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    /// Close deliberately (pool shrink, session shutdown).
    pub fn close_gracefully(&self) {
        self.shutdown(ConnectionError::Closed);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown(ConnectionError::Closed);
    }
}
