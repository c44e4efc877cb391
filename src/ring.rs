//! Token ring: partitioners, replication strategies, and the immutable
//! snapshot mapping tokens to replica sets.
//!
//! A [`TokenMap`] is rebuilt from scratch whenever the host/token set or a
//! keyspace's replication changes, and published by pointer swap; lookups
//! always see one coherent snapshot. Replica lists are precomputed per ring
//! segment so a lookup is a binary search plus a slice borrow.

use std::net::SocketAddr;

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use fnv::{FnvHashMap, FnvHashSet};
use md5::{Digest, Md5};

/// A position on the ring. Orderings are only ever compared within a single
/// partitioner, so the variants never mix inside one ring.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Token {
    Murmur3(i64),
    Random(u128),
    Ordered(Bytes),
}

/// Function family mapping a partition key to a token.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Partitioner {
    Murmur3,
    Random,
    OrderedByteArray,
}

impl Partitioner {
    /// Recognize the partitioner from the fully-qualified class name the
    /// server reports in `system.local`.
    pub fn from_class_name(name: &str) -> Option<Partitioner> {
        if name.ends_with("Murmur3Partitioner") {
            Some(Partitioner::Murmur3)
        } else if name.ends_with("RandomPartitioner") {
            Some(Partitioner::Random)
        } else if name.ends_with("ByteOrderedPartitioner") || name.ends_with("OrderedPartitioner") {
            Some(Partitioner::OrderedByteArray)
        } else {
            None
        }
    }

    pub fn hash(self, key: &[u8]) -> Token {
        match self {
            Partitioner::Murmur3 => {
                let h = murmur3_x64_128(key);
                // The ring excludes i64::MIN.
                Token::Murmur3(if h == i64::min_value() {
                    i64::max_value()
                } else {
                    h
                })
            }
            Partitioner::Random => {
                let digest = Md5::digest(key);
                let mut raw = [0u8; 16];
                raw.copy_from_slice(&digest);
                Token::Random(i128::from_be_bytes(raw).unsigned_abs())
            }
            Partitioner::OrderedByteArray => Token::Ordered(Bytes::copy_from_slice(key)),
        }
    }

    /// Parse a token from its `system.local`/`system.peers` string form.
    pub fn parse_token(self, s: &str) -> Option<Token> {
        match self {
            Partitioner::Murmur3 => s.trim().parse::<i64>().ok().map(Token::Murmur3),
            Partitioner::Random => s.trim().parse::<u128>().ok().map(Token::Random),
            Partitioner::OrderedByteArray => {
                Some(Token::Ordered(Bytes::copy_from_slice(s.as_bytes())))
            }
        }
    }
}

const C1: i64 = 0x87c3_7b91_1142_53d5_u64 as i64;
const C2: i64 = 0x4cf5_ad43_2745_937f_u64 as i64;

fn fmix(mut k: i64) -> i64 {
    k ^= ((k as u64) >> 33) as i64;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd_u64 as i64);
    k ^= ((k as u64) >> 33) as i64;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53_u64 as i64);
    k ^= ((k as u64) >> 33) as i64;
    k
}

/// The x64 128-bit Murmur3 variant the server hashes partition keys with,
/// including its quirk of sign-extending tail bytes. Returns the low half.
fn murmur3_x64_128(data: &[u8]) -> i64 {
    let nblocks = data.len() / 16;
    let mut h1: i64 = 0;
    let mut h2: i64 = 0;

    for block in 0..nblocks {
        let mut k1 = LittleEndian::read_i64(&data[block * 16..]);
        let mut k2 = LittleEndian::read_i64(&data[block * 16 + 8..]);

        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(31);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(27);
        h1 = h1.wrapping_add(h2);
        h1 = h1.wrapping_mul(5).wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2);
        k2 = k2.rotate_left(33);
        k2 = k2.wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2.rotate_left(31);
        h2 = h2.wrapping_add(h1);
        h2 = h2.wrapping_mul(5).wrapping_add(0x3849_5ab5);
    }

    let tail = &data[nblocks * 16..];
    let byte = |i: usize| i64::from(tail[i] as i8);
    let mut k1: i64 = 0;
    let mut k2: i64 = 0;
    if tail.len() >= 9 {
        for i in (8..tail.len()).rev() {
            k2 ^= byte(i) << ((i - 8) * 8);
        }
        k2 = k2.wrapping_mul(C2);
        k2 = k2.rotate_left(33);
        k2 = k2.wrapping_mul(C1);
        h2 ^= k2;
    }
    if !tail.is_empty() {
        for i in (0..tail.len().min(8)).rev() {
            k1 ^= byte(i) << (i * 8);
        }
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(31);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as i64;
    h2 ^= data.len() as i64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix(h1);
    h2 = fmix(h2);
    h1 = h1.wrapping_add(h2);
    h1
}

/// How a keyspace spreads replicas over the ring.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationStrategy {
    Simple {
        replication_factor: usize,
    },
    NetworkTopology {
        /// Replication factor per datacenter name.
        datacenter_factors: Vec<(String, usize)>,
    },
}

impl ReplicationStrategy {
    /// Build from the `replication` map of a keyspace row. Returns `None` for
    /// local or unrecognized strategies, which then own no ring segments.
    pub fn from_replication(options: &[(&str, &str)]) -> Option<ReplicationStrategy> {
        let class = options
            .iter()
            .find(|(k, _)| *k == "class")
            .map(|(_, v)| *v)?;
        if class.ends_with("SimpleStrategy") {
            let rf = options
                .iter()
                .find(|(k, _)| *k == "replication_factor")
                .and_then(|(_, v)| v.trim().parse().ok())?;
            Some(ReplicationStrategy::Simple {
                replication_factor: rf,
            })
        } else if class.ends_with("NetworkTopologyStrategy") {
            let mut factors = Vec::new();
            for (k, v) in options {
                if *k == "class" {
                    continue;
                }
                if let Ok(rf) = v.trim().parse::<usize>() {
                    factors.push(((*k).to_owned(), rf));
                }
            }
            factors.sort();
            Some(ReplicationStrategy::NetworkTopology {
                datacenter_factors: factors,
            })
        } else {
            None
        }
    }
}

/// A host's contribution to the ring.
#[derive(Debug, Clone)]
pub struct RingHost {
    pub address: SocketAddr,
    pub datacenter: Option<String>,
    pub rack: Option<String>,
    pub tokens: Vec<Token>,
}

struct HostAttrs {
    datacenter: Option<String>,
    rack: Option<String>,
}

/// Immutable snapshot of token ownership with per-keyspace precomputed
/// replica lists.
pub struct TokenMap {
    partitioner: Partitioner,
    ring: Vec<(Token, SocketAddr)>,
    /// Keyed by keyspace; inner vec lines up with `ring`, holding the replica
    /// list of each segment.
    replicas: FnvHashMap<String, Vec<Vec<SocketAddr>>>,
}

impl TokenMap {
    pub fn empty(partitioner: Partitioner) -> TokenMap {
        TokenMap {
            partitioner,
            ring: Vec::new(),
            replicas: FnvHashMap::default(),
        }
    }

    pub fn build(
        partitioner: Partitioner,
        hosts: &[RingHost],
        keyspaces: &[(String, Option<ReplicationStrategy>)],
    ) -> TokenMap {
        let mut ring: Vec<(Token, SocketAddr)> = Vec::new();
        let mut attrs: FnvHashMap<SocketAddr, HostAttrs> = FnvHashMap::default();
        for host in hosts {
            for token in &host.tokens {
                ring.push((token.clone(), host.address));
            }
            attrs.insert(
                host.address,
                HostAttrs {
                    datacenter: host.datacenter.clone(),
                    rack: host.rack.clone(),
                },
            );
        }
        ring.sort();

        let mut replicas = FnvHashMap::default();
        for (name, strategy) in keyspaces {
            let strategy = match strategy {
                Some(s) => s,
                None => continue,
            };
            let per_segment = (0..ring.len())
                .map(|start| compute_replicas(&ring, &attrs, start, strategy))
                .collect();
            replicas.insert(name.clone(), per_segment);
        }
        TokenMap {
            partitioner,
            ring,
            replicas,
        }
    }

    pub fn partitioner(&self) -> Partitioner {
        self.partitioner
    }

    pub fn hash(&self, partition_key: &[u8]) -> Token {
        self.partitioner.hash(partition_key)
    }

    /// The ordered replica list owning `token` under `keyspace`, or empty if
    /// the keyspace (or its strategy) is unknown.
    pub fn replicas(&self, keyspace: &str, token: &Token) -> &[SocketAddr] {
        let lists = match self.replicas.get(keyspace) {
            Some(lists) if !self.ring.is_empty() => lists,
            _ => return &[],
        };
        let idx = self.segment_of(token);
        &lists[idx]
    }

    /// Index of the ring entry owning `token`: the first entry at or after
    /// it, wrapping at the end.
    fn segment_of(&self, token: &Token) -> usize {
        let idx = self.ring.partition_point(|(t, _)| t < token);
        if idx == self.ring.len() {
            0
        } else {
            idx
        }
    }
}

fn compute_replicas(
    ring: &[(Token, SocketAddr)],
    attrs: &FnvHashMap<SocketAddr, HostAttrs>,
    start: usize,
    strategy: &ReplicationStrategy,
) -> Vec<SocketAddr> {
    let walk = ring[start..].iter().chain(ring[..start].iter());
    match strategy {
        ReplicationStrategy::Simple { replication_factor } => {
            let distinct: FnvHashSet<SocketAddr> = ring.iter().map(|(_, a)| *a).collect();
            let wanted = (*replication_factor).min(distinct.len());
            let mut out = Vec::with_capacity(wanted);
            for (_, addr) in walk {
                if !out.contains(addr) {
                    out.push(*addr);
                    if out.len() == wanted {
                        break;
                    }
                }
            }
            out
        }
        ReplicationStrategy::NetworkTopology { datacenter_factors } => {
            struct DcState {
                wanted: usize,
                taken: usize,
                racks_seen: FnvHashSet<String>,
                skipped: Vec<SocketAddr>,
            }
            let mut states: FnvHashMap<&str, DcState> = datacenter_factors
                .iter()
                .map(|(dc, rf)| {
                    (
                        dc.as_str(),
                        DcState {
                            wanted: *rf,
                            taken: 0,
                            racks_seen: FnvHashSet::default(),
                            skipped: Vec::new(),
                        },
                    )
                })
                .collect();
            let mut out = Vec::new();
            for (_, addr) in walk {
                let host = match attrs.get(addr) {
                    Some(h) => h,
                    None => continue,
                };
                let dc = match host.datacenter.as_deref() {
                    Some(dc) => dc,
                    None => continue,
                };
                let state = match states.get_mut(dc) {
                    Some(s) => s,
                    None => continue,
                };
                if state.taken >= state.wanted || out.contains(addr) {
                    continue;
                }
                match host.rack.as_deref() {
                    // Prefer one replica per rack; same-rack candidates are
                    // remembered in ring order and used only if the walk
                    // cannot satisfy the factor from distinct racks.
                    Some(rack) if state.racks_seen.contains(rack) => {
                        if !state.skipped.contains(addr) {
                            state.skipped.push(*addr);
                        }
                    }
                    rack => {
                        if let Some(rack) = rack {
                            state.racks_seen.insert(rack.to_owned());
                        }
                        state.taken += 1;
                        out.push(*addr);
                    }
                }
            }
            for (dc, _) in datacenter_factors {
                let state = match states.get_mut(dc.as_str()) {
                    Some(s) => s,
                    None => continue,
                };
                let fill = ::std::mem::replace(&mut state.skipped, Vec::new());
                for addr in fill {
                    if state.taken >= state.wanted {
                        break;
                    }
                    if !out.contains(&addr) {
                        state.taken += 1;
                        out.push(addr);
                    }
                }
            }
            out
        }
    }
}
