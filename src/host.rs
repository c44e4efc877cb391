//! The authoritative set of known endpoints and their up/down status.
//!
//! Writers are the control connection and reconnection tasks; everyone else
//! takes snapshots. Pools and policies address hosts by endpoint key only, so
//! a `Host` can be dropped the moment the registry forgets it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use fnv::FnvHashMap;
use slog::{debug, info, Logger};
use tokio::sync::broadcast;

/// Membership and status transitions, published to any number of consumers.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HostEvent {
    Added(SocketAddr),
    Up(SocketAddr),
    Down(SocketAddr),
    Removed(SocketAddr),
}

pub struct Host {
    pub address: SocketAddr,
    up: AtomicBool,
    reconnecting: AtomicBool,
}

impl Host {
    fn new(address: SocketAddr) -> Host {
        Host {
            address,
            up: AtomicBool::new(true),
            reconnecting: AtomicBool::new(false),
        }
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    /// Claim the right to run the reconnection loop for this host. Only one
    /// claimant wins until `end_reconnect`.
    pub fn begin_reconnect(&self) -> bool {
        !self.reconnecting.swap(true, Ordering::SeqCst)
    }

    pub fn end_reconnect(&self) {
        self.reconnecting.store(false, Ordering::SeqCst);
    }
}

pub struct HostRegistry {
    log: Logger,
    hosts: RwLock<FnvHashMap<SocketAddr, Arc<Host>>>,
    events: broadcast::Sender<HostEvent>,
}

impl HostRegistry {
    pub fn new(log: Logger, event_capacity: usize) -> HostRegistry {
        let (events, _) = broadcast::channel(event_capacity);
        HostRegistry {
            log,
            hosts: RwLock::new(FnvHashMap::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: HostEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Returns true when the host was created or transitioned down to up.
    pub fn add_or_bring_up(&self, address: SocketAddr) -> bool {
        let created = {
            let mut hosts = self.hosts.write().unwrap();
            match hosts.get(&address) {
                Some(host) => {
                    if host.up.swap(true, Ordering::SeqCst) {
                        return false;
                    }
                    false
                }
                None => {
                    hosts.insert(address, Arc::new(Host::new(address)));
                    true
                }
            }
        };
        if created {
            info!(self.log, "host discovered"; "peer" => %address);
            self.emit(HostEvent::Added(address));
        } else {
            info!(self.log, "host back up"; "peer" => %address);
        }
        self.emit(HostEvent::Up(address));
        true
    }

    /// Returns true when the host transitioned up to down.
    pub fn set_down(&self, address: SocketAddr) -> bool {
        let transitioned = {
            let hosts = self.hosts.read().unwrap();
            match hosts.get(&address) {
                Some(host) => host.up.swap(false, Ordering::SeqCst),
                None => return false,
            }
        };
        if transitioned {
            debug!(self.log, "host marked down"; "peer" => %address);
            self.emit(HostEvent::Down(address));
        }
        transitioned
    }

    pub fn remove(&self, address: SocketAddr) -> bool {
        let removed = self.hosts.write().unwrap().remove(&address).is_some();
        if removed {
            info!(self.log, "host removed"; "peer" => %address);
            self.emit(HostEvent::Removed(address));
        }
        removed
    }

    pub fn try_get(&self, address: SocketAddr) -> Option<Arc<Host>> {
        self.hosts.read().unwrap().get(&address).cloned()
    }

    pub fn contains(&self, address: SocketAddr) -> bool {
        self.hosts.read().unwrap().contains_key(&address)
    }

    /// All hosts, sorted by endpoint for deterministic iteration.
    pub fn snapshot(&self) -> Vec<Arc<Host>> {
        let mut hosts: Vec<Arc<Host>> = self.hosts.read().unwrap().values().cloned().collect();
        hosts.sort_by_key(|h| h.address);
        hosts
    }

    /// Endpoints currently believed up, sorted.
    pub fn up_addresses(&self) -> Vec<SocketAddr> {
        let mut up: Vec<SocketAddr> = self
            .hosts
            .read()
            .unwrap()
            .values()
            .filter(|h| h.is_up())
            .map(|h| h.address)
            .collect();
        up.sort();
        up
    }
}
