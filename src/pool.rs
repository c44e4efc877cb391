//! Per-host connection pool.
//!
//! Keeps between `core_size` and `max_size` connections to one endpoint.
//! Acquisition picks the connection with the fewest in-flight requests; when
//! the mean in-flight crosses the grow threshold a connection is opened in
//! the background, and an idle connection above `core_size` is closed once
//! load falls below the shrink threshold. A closed pool never hands out a
//! connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use slog::{debug, o, warn, Logger};

use crate::config::{ConnectionConfig, PoolConfig};
use crate::connection::Connection;
use crate::error::ConnectionError;

pub struct HostPool {
    log: Logger,
    address: SocketAddr,
    conn_config: Arc<ConnectionConfig>,
    pool_config: PoolConfig,
    conns: RwLock<Vec<Arc<Connection>>>,
    growing: AtomicBool,
    closed: AtomicBool,
}

impl HostPool {
    /// Open the core connections. At least one must succeed for the pool to
    /// exist at all; stragglers are filled in by later growth.
    pub async fn connect(
        log: Logger,
        address: SocketAddr,
        conn_config: Arc<ConnectionConfig>,
        pool_config: PoolConfig,
    ) -> Result<Arc<HostPool>, ConnectionError> {
        let log = log.new(o!("pool" => address.to_string()));
        let mut conns = Vec::with_capacity(pool_config.core_size);
        let mut last_error = None;
        for _ in 0..pool_config.core_size.max(1) {
            match Connection::open(log.clone(), address, conn_config.clone(), None).await {
                Ok(conn) => conns.push(Arc::new(conn)),
                Err(e) => {
                    warn!(log, "failed to open pooled connection"; "error" => %e);
                    last_error = Some(e);
                }
            }
        }
        if conns.is_empty() {
            return Err(last_error.unwrap_or(ConnectionError::Closed));
        }
        debug!(log, "pool ready"; "size" => conns.len());
        Ok(Arc::new(HostPool {
            log,
            address,
            conn_config,
            pool_config,
            conns: RwLock::new(conns),
            growing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn size(&self) -> usize {
        self.conns.read().unwrap().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Pick the least-loaded live connection. `Busy` means every connection
    /// is saturated; `Closed` means the pool has no live connection at all
    /// (a refill starts in the background in both cases where allowed).
    pub fn acquire(self: &Arc<Self>) -> Result<Arc<Connection>, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let (best, len, mean) = {
            let mut conns = self.conns.write().unwrap();
            conns.retain(|c| !c.is_closed());
            if conns.is_empty() {
                drop(conns);
                self.spawn_grow();
                return Err(ConnectionError::Closed);
            }
            let total: usize = conns.iter().map(|c| c.in_flight()).sum();
            let mean = total / conns.len();
            let best = conns
                .iter()
                .min_by_key(|c| c.in_flight())
                .cloned()
                .ok_or(ConnectionError::Closed)?;
            if mean <= self.pool_config.shrink_threshold
                && conns.len() > self.pool_config.core_size
            {
                if let Some(pos) = conns
                    .iter()
                    .position(|c| c.in_flight() == 0 && !Arc::ptr_eq(c, &best))
                {
                    let idle = conns.swap_remove(pos);
                    debug!(self.log, "shrinking pool"; "size" => conns.len());
                    idle.close_gracefully();
                }
            }
            (best, conns.len(), mean)
        };
        if mean >= self.pool_config.grow_threshold && len < self.pool_config.max_size {
            self.spawn_grow();
        }
        if best.in_flight() >= self.pool_config.max_requests_per_connection {
            if len < self.pool_config.max_size {
                self.spawn_grow();
            }
            return Err(ConnectionError::Busy);
        }
        Ok(best)
    }

    /// Open one connection now. Used by reconnection probes, which need the
    /// outcome rather than a background attempt.
    pub async fn refill_one(&self) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let conn = Connection::open(
            self.log.clone(),
            self.address,
            self.conn_config.clone(),
            None,
        )
        .await?;
        let mut conns = self.conns.write().unwrap();
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        conns.push(Arc::new(conn));
        Ok(())
    }

    fn spawn_grow(self: &Arc<Self>) {
        if self.growing.swap(true, Ordering::SeqCst) {
            return;
        }
        let pool = self.clone();
        tokio::spawn(async move {
            if let Err(e) = pool.refill_one().await {
                warn!(pool.log, "pool growth failed"; "error" => %e);
            }
            pool.growing.store(false, Ordering::SeqCst);
        });
    }

    /// Tear the pool down; every connection is closed and pending requests on
    /// them fail with a transport error.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let conns = ::std::mem::replace(&mut *self.conns.write().unwrap(), Vec::new());
        debug!(self.log, "pool closed"; "connections" => conns.len());
        for conn in conns {
            conn.close_gracefully();
        }
    }
}

impl Drop for HostPool {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            for conn in self.conns.write().unwrap().drain(..) {
                conn.close_gracefully();
            }
        }
    }
}
