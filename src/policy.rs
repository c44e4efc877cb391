//! Pluggable policies: load balancing, retry, reconnection, speculative
//! execution, authentication, and address translation.
//!
//! A load-balancing policy turns one request plus one cluster view into a
//! query plan: a finite sequence of distinct up hosts. The executor walks the
//! plan; a retry policy maps every failed attempt to exactly one decision.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHashSet;
use rand::seq::SliceRandom;

use crate::control::Metadata;
use crate::error::{ConnectionError, DbError, QueryError, WriteType};
use crate::ring::Token;
use crate::Consistency;

/// The cluster as one request sees it: an immutable metadata snapshot plus
/// the hosts currently believed up, in a stable order.
#[derive(Clone)]
pub struct ClusterView {
    pub metadata: Arc<Metadata>,
    pub up_hosts: Vec<SocketAddr>,
}

/// Routing attributes of a single request.
#[derive(Debug, Default)]
pub struct RoutingInfo<'a> {
    pub keyspace: Option<&'a str>,
    pub token: Option<Token>,
}

/// An ordered sequence of candidate hosts. The executor consumes it lazily
/// and stops at the first success, so hosts past that point cost nothing.
#[derive(Debug)]
pub struct QueryPlan {
    hosts: Vec<SocketAddr>,
    next: usize,
}

impl QueryPlan {
    pub fn new(hosts: Vec<SocketAddr>) -> QueryPlan {
        QueryPlan { hosts, next: 0 }
    }
}

impl Iterator for QueryPlan {
    type Item = SocketAddr;
    fn next(&mut self) -> Option<SocketAddr> {
        let host = self.hosts.get(self.next).copied();
        self.next += 1;
        host
    }
}

pub trait LoadBalancingPolicy: Send + Sync {
    fn name(&self) -> &'static str;
    fn plan(&self, routing: &RoutingInfo<'_>, view: &ClusterView) -> QueryPlan;
}

/// All up hosts, in rotated order.
pub struct RoundRobinPolicy {
    counter: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> RoundRobinPolicy {
        RoundRobinPolicy {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}

fn rotated(hosts: &[SocketAddr], by: usize) -> Vec<SocketAddr> {
    if hosts.is_empty() {
        return Vec::new();
    }
    let pivot = by % hosts.len();
    let mut out = Vec::with_capacity(hosts.len());
    out.extend_from_slice(&hosts[pivot..]);
    out.extend_from_slice(&hosts[..pivot]);
    out
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn plan(&self, _routing: &RoutingInfo<'_>, view: &ClusterView) -> QueryPlan {
        let turn = self.counter.fetch_add(1, Ordering::Relaxed);
        QueryPlan::new(rotated(&view.up_hosts, turn))
    }
}

/// Local-datacenter hosts first (rotated), then up to
/// `used_hosts_per_remote_dc` hosts from each remote datacenter.
pub struct DcAwareRoundRobinPolicy {
    local_dc: String,
    used_hosts_per_remote_dc: usize,
    counter: AtomicUsize,
}

impl DcAwareRoundRobinPolicy {
    pub fn new(local_dc: impl Into<String>, used_hosts_per_remote_dc: usize) -> Self {
        DcAwareRoundRobinPolicy {
            local_dc: local_dc.into(),
            used_hosts_per_remote_dc,
            counter: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancingPolicy for DcAwareRoundRobinPolicy {
    fn name(&self) -> &'static str {
        "dc-aware-round-robin"
    }

    fn plan(&self, _routing: &RoutingInfo<'_>, view: &ClusterView) -> QueryPlan {
        let mut locals = Vec::new();
        // BTreeMap keeps remote datacenters in a stable order.
        let mut remotes: ::std::collections::BTreeMap<&str, Vec<SocketAddr>> = Default::default();
        for addr in &view.up_hosts {
            match view
                .metadata
                .hosts
                .get(addr)
                .and_then(|p| p.datacenter.as_deref())
            {
                Some(dc) if dc == self.local_dc => locals.push(*addr),
                Some(dc) => remotes.entry(dc).or_default().push(*addr),
                // Hosts of unknown datacenter are treated as remote.
                None => remotes.entry("").or_default().push(*addr),
            }
        }
        let turn = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut plan = rotated(&locals, turn);
        for (_, hosts) in remotes {
            plan.extend(hosts.into_iter().take(self.used_hosts_per_remote_dc));
        }
        QueryPlan::new(plan)
    }
}

/// Prepends the live replicas of the request's token (shuffled among
/// themselves to spread load), then defers to the child policy for the rest.
pub struct TokenAwarePolicy {
    child: Arc<dyn LoadBalancingPolicy>,
}

impl TokenAwarePolicy {
    pub fn new(child: Arc<dyn LoadBalancingPolicy>) -> Self {
        TokenAwarePolicy { child }
    }
}

impl LoadBalancingPolicy for TokenAwarePolicy {
    fn name(&self) -> &'static str {
        "token-aware"
    }

    fn plan(&self, routing: &RoutingInfo<'_>, view: &ClusterView) -> QueryPlan {
        let mut plan = Vec::new();
        if let (Some(keyspace), Some(token)) = (routing.keyspace, routing.token.as_ref()) {
            let up: FnvHashSet<SocketAddr> = view.up_hosts.iter().copied().collect();
            let mut replicas: Vec<SocketAddr> = view
                .metadata
                .token_map
                .replicas(keyspace, token)
                .iter()
                .filter(|addr| up.contains(addr))
                .copied()
                .collect();
            replicas.shuffle(&mut rand::thread_rng());
            plan = replicas;
        }
        let seen: FnvHashSet<SocketAddr> = plan.iter().copied().collect();
        for host in self.child.plan(routing, view) {
            if !seen.contains(&host) {
                plan.push(host);
            }
        }
        QueryPlan::new(plan)
    }
}

//
// Retry
//

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Re-send on the same connection, optionally at a different consistency.
    RetrySameHost(Option<Consistency>),
    /// Move to the next host of the plan.
    RetryNextHost(Option<Consistency>),
    /// Surface the error to the caller.
    DontRetry,
    /// Swallow the error and report an empty success.
    IgnoreError,
}

pub struct RetryContext<'a> {
    pub error: &'a QueryError,
    pub consistency: Consistency,
    pub idempotent: bool,
    /// Attempts consumed by retry decisions so far; the transparent
    /// re-prepare after an unprepared error does not count.
    pub retry_count: u32,
}

pub trait RetryPolicy: Send + Sync {
    fn name(&self) -> &'static str;
    fn decide(&self, ctx: &RetryContext<'_>) -> RetryDecision;
}

/// The stock decision table: one cautious retry where the server state is
/// known, next-host moves where another coordinator can plausibly do better,
/// rethrow everywhere else.
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn name(&self) -> &'static str {
        "default-retry"
    }

    fn decide(&self, ctx: &RetryContext<'_>) -> RetryDecision {
        match ctx.error {
            QueryError::Db { error, .. } => match error {
                DbError::ReadTimeout {
                    received,
                    required,
                    data_present,
                    ..
                } => {
                    if ctx.retry_count == 0 && received >= required && !data_present {
                        RetryDecision::RetrySameHost(None)
                    } else {
                        RetryDecision::DontRetry
                    }
                }
                DbError::WriteTimeout { write_type, .. } => {
                    if ctx.retry_count == 0 && *write_type == WriteType::BatchLog {
                        RetryDecision::RetrySameHost(None)
                    } else {
                        RetryDecision::DontRetry
                    }
                }
                DbError::Unavailable { .. } => {
                    if ctx.retry_count == 0 {
                        RetryDecision::RetryNextHost(None)
                    } else {
                        RetryDecision::DontRetry
                    }
                }
                DbError::Overloaded | DbError::IsBootstrapping => {
                    RetryDecision::RetryNextHost(None)
                }
                _ => RetryDecision::DontRetry,
            },
            QueryError::Connection(ConnectionError::RequestTimeout) => RetryDecision::DontRetry,
            QueryError::Connection(_) => {
                if ctx.idempotent {
                    RetryDecision::RetryNextHost(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            _ => RetryDecision::DontRetry,
        }
    }
}

/// Never retries; every error reaches the caller untouched.
pub struct FallthroughRetryPolicy;

impl RetryPolicy for FallthroughRetryPolicy {
    fn name(&self) -> &'static str {
        "fallthrough-retry"
    }

    fn decide(&self, _ctx: &RetryContext<'_>) -> RetryDecision {
        RetryDecision::DontRetry
    }
}

//
// Reconnection
//

pub trait ReconnectionPolicy: Send + Sync {
    /// A fresh schedule of delays between successive reconnection attempts.
    fn new_schedule(&self) -> Box<dyn Iterator<Item = Duration> + Send>;
}

pub struct ConstantReconnectionPolicy {
    pub delay: Duration,
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        let delay = self.delay;
        Box::new(::std::iter::repeat(delay))
    }
}

pub struct ExponentialReconnectionPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        let max = self.max;
        Box::new(::std::iter::successors(
            Some(self.base.min(max)),
            move |prev| Some(prev.checked_mul(2).map_or(max, |d| d.min(max))),
        ))
    }
}

//
// Speculative execution
//

pub trait SpeculativeExecutionPolicy: Send + Sync {
    /// Delay before launching the `attempt`-th parallel execution (1-based),
    /// or `None` to stop fanning out.
    fn delay(&self, attempt: u32) -> Option<Duration>;
}

pub struct ConstantSpeculativePolicy {
    pub delay: Duration,
    pub max_speculative_executions: u32,
}

impl SpeculativeExecutionPolicy for ConstantSpeculativePolicy {
    fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt <= self.max_speculative_executions {
            Some(self.delay)
        } else {
            None
        }
    }
}

//
// Authentication
//

pub trait Authenticator: Send + Sync {
    /// First token sent after the server names its authenticator class.
    fn initial_response(&self, authenticator: &str) -> Result<Option<Vec<u8>>, String>;
    fn evaluate_challenge(&self, challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>, String>;
    fn on_success(&self, _token: Option<&[u8]>) {}
}

/// SASL PLAIN credentials.
pub struct PlainTextAuthenticator {
    pub username: String,
    pub password: String,
}

impl Authenticator for PlainTextAuthenticator {
    fn initial_response(&self, _authenticator: &str) -> Result<Option<Vec<u8>>, String> {
        let mut token = Vec::with_capacity(self.username.len() + self.password.len() + 2);
        token.push(0);
        token.extend_from_slice(self.username.as_bytes());
        token.push(0);
        token.extend_from_slice(self.password.as_bytes());
        Ok(Some(token))
    }

    fn evaluate_challenge(&self, _challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>, String> {
        Err("unexpected authentication challenge".to_owned())
    }
}

/// Maps node addresses the cluster reports to addresses the client should
/// dial, for deployments behind NAT or proxies.
pub trait AddressTranslator: Send + Sync {
    fn translate(&self, addr: SocketAddr) -> SocketAddr;
}
