//! Error taxonomy.
//!
//! Three layers, lowest first: [`ProtocolError`](crate::frame::ProtocolError)
//! for framing violations, [`ConnectionError`] for anything that poisons a
//! single connection, and [`QueryError`] for what a caller of
//! [`Session`](crate::session::Session) observes. Server-reported failures
//! are carried verbatim as [`DbError`] so the retry policy can map every
//! `(error, context)` pair to exactly one decision.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use failure::Fail;

use crate::frame::ProtocolError;
use crate::{Consistency, RequestValidationError};

/// The kind of write that timed out, as reported by the server.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum WriteType {
    Simple,
    Batch,
    UnloggedBatch,
    Counter,
    BatchLog,
    Cas,
    View,
    Cdc,
    Other(String),
}

impl WriteType {
    pub fn from_wire(s: &str) -> WriteType {
        use self::WriteType::*;
        match s {
            "SIMPLE" => Simple,
            "BATCH" => Batch,
            "UNLOGGED_BATCH" => UnloggedBatch,
            "COUNTER" => Counter,
            "BATCH_LOG" => BatchLog,
            "CAS" => Cas,
            "VIEW" => View,
            "CDC" => Cdc,
            other => Other(other.to_owned()),
        }
    }
}

impl fmt::Display for WriteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An ERROR response body, minus its human-readable message.
#[derive(Debug, Clone, PartialEq)]
pub enum DbError {
    ServerError,
    /// The server judged one of our frames invalid. Distinct from the local
    /// [`ProtocolError`]: this one is the server complaining about us.
    ProtocolError,
    BadCredentials,
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },
    Overloaded,
    IsBootstrapping,
    TruncateError,
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        write_type: WriteType,
    },
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        data_present: bool,
    },
    ReadFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        failures: i32,
        data_present: bool,
    },
    FunctionFailure {
        keyspace: String,
        function: String,
        arg_types: Vec<String>,
    },
    WriteFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        failures: i32,
        write_type: WriteType,
    },
    SyntaxError,
    Unauthorized,
    Invalid,
    ConfigError,
    AlreadyExists {
        keyspace: String,
        table: String,
    },
    Unprepared {
        id: Bytes,
    },
    Other(i32),
}

impl DbError {
    pub fn code(&self) -> i32 {
        use self::DbError::*;
        match *self {
            ServerError => 0x0000,
            ProtocolError => 0x000a,
            BadCredentials => 0x0100,
            Unavailable { .. } => 0x1000,
            Overloaded => 0x1001,
            IsBootstrapping => 0x1002,
            TruncateError => 0x1003,
            WriteTimeout { .. } => 0x1100,
            ReadTimeout { .. } => 0x1200,
            ReadFailure { .. } => 0x1300,
            FunctionFailure { .. } => 0x1400,
            WriteFailure { .. } => 0x1500,
            SyntaxError => 0x2000,
            Unauthorized => 0x2100,
            Invalid => 0x2200,
            ConfigError => 0x2300,
            AlreadyExists { .. } => 0x2400,
            Unprepared { .. } => 0x2500,
            Other(code) => code,
        }
    }

    /// Whether a retry can conceivably change the outcome. Grammar and
    /// permission problems cannot be retried away.
    pub fn is_retry_candidate(&self) -> bool {
        use self::DbError::*;
        !matches!(
            *self,
            SyntaxError | Unauthorized | Invalid | ConfigError | AlreadyExists { .. }
                | BadCredentials
                | FunctionFailure { .. }
        )
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::DbError::*;
        match *self {
            Unavailable {
                consistency,
                required,
                alive,
            } => write!(
                f,
                "unavailable at {}: {} required, {} alive",
                consistency, required, alive
            ),
            WriteTimeout {
                consistency,
                received,
                required,
                ref write_type,
            } => write!(
                f,
                "write timeout at {} ({} of {} acknowledged, type {})",
                consistency, received, required, write_type
            ),
            ReadTimeout {
                consistency,
                received,
                required,
                data_present,
            } => write!(
                f,
                "read timeout at {} ({} of {} responded, data {})",
                consistency,
                received,
                required,
                if data_present { "present" } else { "absent" }
            ),
            Unprepared { ref id } => write!(f, "unprepared statement {:02x?}", &id[..]),
            AlreadyExists {
                ref keyspace,
                ref table,
            } => write!(f, "{}.{} already exists", keyspace, table),
            Other(code) => write!(f, "server error code 0x{:04x}", code),
            ref other => write!(f, "{:?}", other),
        }
    }
}

/// Anything that poisons a single connection, or prevents one from opening.
#[derive(Debug, Clone, Fail)]
pub enum ConnectionError {
    #[fail(display = "io error: {}", _0)]
    Io(Arc<io::Error>),
    #[fail(display = "protocol violation: {}", _0)]
    Protocol(ProtocolError),
    #[fail(display = "connect timed out")]
    ConnectTimeout,
    #[fail(display = "request timed out")]
    RequestTimeout,
    #[fail(display = "keepalive timed out twice, closing")]
    KeepaliveTimeout,
    #[fail(display = "authentication failed: {}", _0)]
    Auth(String),
    #[fail(display = "server rejected protocol version: {}", _0)]
    VersionRejected(String),
    #[fail(display = "connection closed")]
    Closed,
    #[fail(display = "all connections to this host are saturated")]
    Busy,
    #[fail(display = "handshake failed: {}", _0)]
    Handshake(String),
}

impl From<io::Error> for ConnectionError {
    fn from(x: io::Error) -> Self {
        ConnectionError::Io(Arc::new(x))
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(x: ProtocolError) -> Self {
        ConnectionError::Protocol(x)
    }
}

impl ConnectionError {
    /// Timeouts leave the connection healthy; everything else closed it or
    /// found it unusable.
    pub fn is_fatal_to_connection(&self) -> bool {
        !matches!(self, ConnectionError::RequestTimeout | ConnectionError::Busy)
    }
}

/// What a caller of the session observes when a request fails.
#[derive(Debug, Clone, Fail)]
pub enum QueryError {
    /// The server rejected the request.
    Db { error: DbError, message: String },
    /// The request was invalid before anything reached the wire.
    BadQuery(String),
    /// Transport-level failure of the attempt.
    Connection(ConnectionError),
    /// The query plan was consumed without any host accepting the request.
    /// Carries the per-host cause of each failed attempt.
    NoHostAvailable(Vec<(SocketAddr, QueryError)>),
    /// The client-side deadline elapsed.
    Timeout,
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::QueryError::*;
        match *self {
            Db {
                ref error,
                ref message,
            } => write!(f, "database error: {} ({})", error, message),
            BadQuery(ref why) => write!(f, "bad query: {}", why),
            Connection(ref e) => write!(f, "connection error: {}", e),
            NoHostAvailable(ref tried) => {
                write!(f, "no host available, {} attempted", tried.len())?;
                if let Some((addr, cause)) = tried.first() {
                    write!(f, " (first: {}: {})", addr, cause)?;
                }
                Ok(())
            }
            Timeout => write!(f, "request timed out"),
        }
    }
}

impl From<ConnectionError> for QueryError {
    fn from(x: ConnectionError) -> Self {
        match x {
            ConnectionError::RequestTimeout => QueryError::Timeout,
            other => QueryError::Connection(other),
        }
    }
}

impl From<RequestValidationError> for QueryError {
    fn from(x: RequestValidationError) -> Self {
        QueryError::BadQuery(x.to_string())
    }
}

impl QueryError {
    pub fn db(error: DbError, message: String) -> QueryError {
        QueryError::Db { error, message }
    }
}

/// Failures of [`Session::connect`](crate::session::Session::connect).
#[derive(Debug, Fail)]
pub enum NewSessionError {
    #[fail(display = "no contact points supplied")]
    NoContactPoints,
    #[fail(display = "could not reach any contact point")]
    AllContactPointsFailed,
    #[fail(display = "cluster bootstrap failed: {}", _0)]
    Bootstrap(QueryError),
    #[fail(display = "bootstrap timed out")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_error_codes_match_the_wire() {
        assert_eq!(DbError::ServerError.code(), 0x0000);
        assert_eq!(
            DbError::Unavailable {
                consistency: Consistency::Quorum,
                required: 2,
                alive: 1
            }
            .code(),
            0x1000
        );
        assert_eq!(DbError::SyntaxError.code(), 0x2000);
        assert_eq!(DbError::Unprepared { id: Bytes::new() }.code(), 0x2500);
        assert_eq!(DbError::Other(0x7777).code(), 0x7777);
    }

    #[test]
    fn grammar_errors_are_not_retry_candidates() {
        assert!(!DbError::SyntaxError.is_retry_candidate());
        assert!(!DbError::Unauthorized.is_retry_candidate());
        assert!(DbError::Overloaded.is_retry_candidate());
        assert!(DbError::IsBootstrapping.is_retry_candidate());
    }

    #[test]
    fn request_timeout_becomes_caller_timeout() {
        let q: QueryError = ConnectionError::RequestTimeout.into();
        assert!(matches!(q, QueryError::Timeout));
        let q: QueryError = ConnectionError::Closed.into();
        assert!(matches!(q, QueryError::Connection(ConnectionError::Closed)));
    }
}
