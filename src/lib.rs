//! Session core for a wide-column database speaking the CQL binary framing
//! protocol (versions 2 through 4) over TCP.
//!
//! The crate owns a pool of long-lived multiplexed connections to cluster
//! nodes, keeps a live view of cluster topology and token ownership through a
//! dedicated control connection, and routes each request to a suitable replica
//! under pluggable load-balancing, retry, reconnection and speculative
//! execution policies.
//!
//! The entry point is [`Session`]; everything else is reachable from its
//! configuration.

use std::fmt;

use failure::Fail;

pub mod coding;
pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod frame;
pub mod host;
pub mod message;
pub mod policy;
pub mod pool;
pub mod ring;
pub mod session;

pub use crate::config::{ConnectionConfig, PoolConfig, SessionConfig};
pub use crate::control::Metadata;
pub use crate::error::{ConnectionError, DbError, NewSessionError, QueryError};
pub use crate::frame::ProtocolError;
pub use crate::message::Value;
pub use crate::ring::{Partitioner, Token, TokenMap};
pub use crate::session::{
    BatchStatement, PreparedStatement, QueryOptions, QueryResult, Session,
};

/// Default upper bound on the body length of a single frame.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Stream id reserved for server-initiated event frames.
pub const EVENT_STREAM_ID: StreamId = StreamId(-1);

/// Per-connection tag correlating a response frame to the request that
/// produced it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct StreamId(pub i16);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Wire protocol versions understood by this crate.
///
/// The version in use is negotiated once, when the control connection first
/// reaches a node, and pinned for every subsequent connection of the session.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ProtocolVersion {
    V2,
    V3,
    V4,
}

impl ProtocolVersion {
    /// Version byte carried by request frames.
    pub fn request_byte(self) -> u8 {
        match self {
            ProtocolVersion::V2 => 0x02,
            ProtocolVersion::V3 => 0x03,
            ProtocolVersion::V4 => 0x04,
        }
    }

    pub fn from_wire(byte: u8) -> Option<ProtocolVersion> {
        match byte & 0x7f {
            0x02 => Some(ProtocolVersion::V2),
            0x03 => Some(ProtocolVersion::V3),
            0x04 => Some(ProtocolVersion::V4),
            _ => None,
        }
    }

    /// Length of the fixed frame header: the stream id widens from 8 to 16
    /// bits in v3.
    pub fn header_len(self) -> usize {
        match self {
            ProtocolVersion::V2 => 8,
            _ => 9,
        }
    }

    /// Size of the per-connection stream id pool, excluding the reserved
    /// event id.
    pub fn stream_id_space(self) -> usize {
        match self {
            ProtocolVersion::V2 => 128,
            _ => 32768,
        }
    }

    /// The next version to fall back to when a node rejects this one.
    pub fn downgrade(self) -> Option<ProtocolVersion> {
        match self {
            ProtocolVersion::V4 => Some(ProtocolVersion::V3),
            ProtocolVersion::V3 => Some(ProtocolVersion::V2),
            ProtocolVersion::V2 => None,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.request_byte())
    }
}

/// How many replicas must acknowledge a read or write before it is considered
/// successful.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Consistency {
    Any,
    One,
    Two,
    Three,
    Quorum,
    All,
    LocalQuorum,
    EachQuorum,
    Serial,
    LocalSerial,
    LocalOne,
}

impl Consistency {
    pub fn to_wire(self) -> u16 {
        use self::Consistency::*;
        match self {
            Any => 0x00,
            One => 0x01,
            Two => 0x02,
            Three => 0x03,
            Quorum => 0x04,
            All => 0x05,
            LocalQuorum => 0x06,
            EachQuorum => 0x07,
            Serial => 0x08,
            LocalSerial => 0x09,
            LocalOne => 0x0a,
        }
    }

    pub fn from_wire(x: u16) -> Option<Consistency> {
        use self::Consistency::*;
        Some(match x {
            0x00 => Any,
            0x01 => One,
            0x02 => Two,
            0x03 => Three,
            0x04 => Quorum,
            0x05 => All,
            0x06 => LocalQuorum,
            0x07 => EachQuorum,
            0x08 => Serial,
            0x09 => LocalSerial,
            0x0a => LocalOne,
            _ => return None,
        })
    }

    /// Serial consistencies are only valid in the dedicated
    /// `serial_consistency` slot of a request, never as its top-level
    /// consistency.
    pub fn is_serial(self) -> bool {
        matches!(self, Consistency::Serial | Consistency::LocalSerial)
    }
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A 16-byte time-based identifier, used for schema versions and tracing ids.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Uuid(pub [u8; 16]);

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if let 4 | 6 | 8 | 10 = i {
                f.write_str("-")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Raised when a caller submits a request the negotiated protocol version or
/// the request's own shape cannot express.
#[derive(Debug, Clone, Eq, PartialEq, Fail)]
pub enum RequestValidationError {
    #[fail(display = "unset values require protocol v4, connection is {}", _0)]
    UnsetValue(ProtocolVersion),
    #[fail(display = "{} requires protocol v3 or later, connection is {}", feature, version)]
    Unsupported {
        feature: &'static str,
        version: ProtocolVersion,
    },
    #[fail(display = "{} is not a valid top-level consistency", _0)]
    SerialTopLevel(Consistency),
    #[fail(display = "{} is not a serial consistency", _0)]
    NotSerialConsistency(Consistency),
    #[fail(display = "batch contains {} statements, limit is 65535", _0)]
    BatchTooLarge(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistency_codes_round_trip() {
        for code in 0x00..=0x0a {
            let c = Consistency::from_wire(code).unwrap();
            assert_eq!(c.to_wire(), code);
        }
        assert_eq!(Consistency::from_wire(0x0b), None);
    }

    #[test]
    fn version_negotiation_chain() {
        assert_eq!(ProtocolVersion::V4.downgrade(), Some(ProtocolVersion::V3));
        assert_eq!(ProtocolVersion::V3.downgrade(), Some(ProtocolVersion::V2));
        assert_eq!(ProtocolVersion::V2.downgrade(), None);
    }

    #[test]
    fn uuid_formats_with_dashes() {
        let u = Uuid([
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
            0xee, 0xff,
        ]);
        assert_eq!(u.to_string(), "00112233-4455-6677-8899-aabbccddeeff");
    }
}
