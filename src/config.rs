//! Parameters governing the session core.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::policy::{
    AddressTranslator, Authenticator, DefaultRetryPolicy, ExponentialReconnectionPolicy,
    LoadBalancingPolicy, ReconnectionPolicy, RetryPolicy, RoundRobinPolicy,
    SpeculativeExecutionPolicy, TokenAwarePolicy,
};
use crate::{Consistency, ProtocolVersion};

/// Sizing of one per-host connection pool.
#[derive(Debug, Copy, Clone)]
pub struct PoolConfig {
    /// Connections opened eagerly when the pool is built.
    pub core_size: usize,
    /// Hard cap on connections per host.
    pub max_size: usize,
    /// In-flight requests one connection will accept before the pool refuses
    /// to hand it out. Bounded above by the protocol's stream id space.
    pub max_requests_per_connection: usize,
    /// Mean in-flight per connection above which the pool grows.
    pub grow_threshold: usize,
    /// Mean in-flight per connection below which an idle connection above
    /// `core_size` may be closed.
    pub shrink_threshold: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_size: 2,
            max_size: 8,
            max_requests_per_connection: 1024,
            grow_threshold: 800,
            shrink_threshold: 64,
        }
    }
}

/// Parameters of a single connection. Derived from [`SessionConfig`] once the
/// protocol version has been negotiated.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub version: ProtocolVersion,
    /// Upper bound on a single frame body.
    pub max_frame_len: usize,
    pub connect_timeout: Duration,
    /// Deadline for one request/response exchange.
    pub request_timeout: Duration,
    /// Quiet period after which a keepalive probe is sent. Two consecutive
    /// probe timeouts close the connection.
    pub idle_timeout: Duration,
    /// How long a sender may wait for a free stream id before giving up.
    pub stream_wait_timeout: Duration,
    /// Encoded frames queued to the writer task before senders are pushed
    /// back.
    pub write_queue_depth: usize,
    pub authenticator: Option<Arc<dyn Authenticator>>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::V4,
            max_frame_len: crate::MAX_FRAME_LEN,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(12),
            idle_timeout: Duration::from_secs(30),
            stream_wait_timeout: Duration::from_secs(5),
            write_queue_depth: 1024,
            authenticator: None,
        }
    }
}

/// Everything a [`Session`](crate::session::Session) needs to reach and keep
/// reaching a cluster.
#[derive(Clone)]
pub struct SessionConfig {
    /// Initial endpoints used to bootstrap topology discovery. Every
    /// discovered peer is assumed to listen on the same port as its
    /// `system.peers` address reports.
    pub contact_points: Vec<SocketAddr>,
    /// Highest protocol version to attempt; the session downgrades from here
    /// if the cluster rejects it.
    pub preferred_protocol_version: ProtocolVersion,
    /// Consistency applied to statements that do not set their own.
    pub default_consistency: Consistency,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
    pub stream_wait_timeout: Duration,
    pub max_frame_len: usize,
    pub pool: PoolConfig,
    pub load_balancing: Arc<dyn LoadBalancingPolicy>,
    pub retry: Arc<dyn RetryPolicy>,
    pub reconnection: Arc<dyn ReconnectionPolicy>,
    pub speculative: Option<Arc<dyn SpeculativeExecutionPolicy>>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub address_translator: Option<Arc<dyn AddressTranslator>>,
    /// Ceiling on the post-DDL wait for schema versions to converge.
    pub schema_agreement_timeout: Duration,
    /// Coalescing window for bursts of schema change events.
    pub schema_refresh_debounce: Duration,
    /// Ceiling on the initial metadata bootstrap.
    pub bootstrap_timeout: Duration,
    /// Capacity of the typed cluster event channels handed to subscribers.
    pub event_channel_capacity: usize,
}

impl SessionConfig {
    pub fn new(contact_points: Vec<SocketAddr>) -> SessionConfig {
        SessionConfig {
            contact_points,
            ..SessionConfig::default()
        }
    }

    pub(crate) fn connection_config(&self, version: ProtocolVersion) -> Arc<ConnectionConfig> {
        Arc::new(ConnectionConfig {
            version,
            max_frame_len: self.max_frame_len,
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            idle_timeout: self.idle_timeout,
            stream_wait_timeout: self.stream_wait_timeout,
            write_queue_depth: 1024,
            authenticator: self.authenticator.clone(),
        })
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            contact_points: Vec::new(),
            preferred_protocol_version: ProtocolVersion::V4,
            default_consistency: Consistency::One,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(12),
            idle_timeout: Duration::from_secs(30),
            stream_wait_timeout: Duration::from_secs(5),
            max_frame_len: crate::MAX_FRAME_LEN,
            pool: PoolConfig::default(),
            load_balancing: Arc::new(TokenAwarePolicy::new(Arc::new(RoundRobinPolicy::new()))),
            retry: Arc::new(DefaultRetryPolicy),
            reconnection: Arc::new(ExponentialReconnectionPolicy {
                base: Duration::from_secs(1),
                max: Duration::from_secs(600),
            }),
            speculative: None,
            authenticator: None,
            address_translator: None,
            schema_agreement_timeout: Duration::from_secs(10),
            schema_refresh_debounce: Duration::from_secs(1),
            bootstrap_timeout: Duration::from_secs(30),
            event_channel_capacity: 128,
        }
    }
}
