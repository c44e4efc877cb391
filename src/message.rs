//! Request bodies, response bodies, and the values they carry.
//!
//! Requests know how to encode themselves for a given protocol version and
//! refuse locally anything the negotiated version cannot express. Responses
//! are parsed from the body bytes the frame layer hands over; only the cell
//! types the control plane reads are deserialized eagerly, everything else is
//! preserved as raw bytes.

use std::net::IpAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::coding::{BufExt, BufMutExt};
use crate::error::{DbError, WriteType};
use crate::frame::{flags, FrameHeader, Opcode, ProtocolError};
use crate::{Consistency, ProtocolVersion, RequestValidationError, Uuid};

/// Event classes a control connection subscribes to.
pub const EVENT_TYPES: [&str; 3] = ["TOPOLOGY_CHANGE", "STATUS_CHANGE", "SCHEMA_CHANGE"];

const CQL_VERSION: &str = "3.0.0";

//
// Bound values
//

/// A value bound to a statement slot. `Unset` (v4+) leaves the column
/// untouched instead of writing a null.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Set(Bytes),
    Null,
    Unset,
}

impl Value {
    pub fn text(s: &str) -> Value {
        Value::Set(Bytes::copy_from_slice(s.as_bytes()))
    }

    pub fn blob(b: &[u8]) -> Value {
        Value::Set(Bytes::copy_from_slice(b))
    }

    pub fn bigint(x: i64) -> Value {
        Value::Set(Bytes::copy_from_slice(&x.to_be_bytes()))
    }

    pub fn int(x: i32) -> Value {
        Value::Set(Bytes::copy_from_slice(&x.to_be_bytes()))
    }

    fn encode(
        &self,
        version: ProtocolVersion,
        buf: &mut BytesMut,
    ) -> Result<(), RequestValidationError> {
        match self {
            Value::Set(b) => buf.put_bytes_opt(Some(b)),
            Value::Null => buf.put_bytes_opt(None),
            Value::Unset => {
                if version < ProtocolVersion::V4 {
                    return Err(RequestValidationError::UnsetValue(version));
                }
                buf.write::<i32>(-2);
            }
        }
        Ok(())
    }
}

//
// Query parameters
//

/// The per-request parameter block shared by QUERY and EXECUTE.
#[derive(Debug, Clone)]
pub struct QueryParams {
    pub consistency: Consistency,
    pub serial_consistency: Option<Consistency>,
    pub values: Vec<Value>,
    pub skip_metadata: bool,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    /// Client-supplied default timestamp, microseconds. v3+.
    pub timestamp: Option<i64>,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            consistency: Consistency::One,
            serial_consistency: None,
            values: Vec::new(),
            skip_metadata: false,
            page_size: None,
            paging_state: None,
            timestamp: None,
        }
    }
}

mod query_flags {
    pub const VALUES: u8 = 0x01;
    pub const SKIP_METADATA: u8 = 0x02;
    pub const PAGE_SIZE: u8 = 0x04;
    pub const PAGING_STATE: u8 = 0x08;
    pub const SERIAL_CONSISTENCY: u8 = 0x10;
    pub const DEFAULT_TIMESTAMP: u8 = 0x20;
}

impl QueryParams {
    fn encode(
        &self,
        version: ProtocolVersion,
        buf: &mut BytesMut,
    ) -> Result<(), RequestValidationError> {
        if self.consistency.is_serial() {
            return Err(RequestValidationError::SerialTopLevel(self.consistency));
        }
        if let Some(serial) = self.serial_consistency {
            if !serial.is_serial() {
                return Err(RequestValidationError::NotSerialConsistency(serial));
            }
        }
        if self.timestamp.is_some() && version < ProtocolVersion::V3 {
            return Err(RequestValidationError::Unsupported {
                feature: "default timestamp",
                version,
            });
        }

        let mut flags = 0u8;
        if !self.values.is_empty() {
            flags |= query_flags::VALUES;
        }
        if self.skip_metadata {
            flags |= query_flags::SKIP_METADATA;
        }
        if self.page_size.is_some() {
            flags |= query_flags::PAGE_SIZE;
        }
        if self.paging_state.is_some() {
            flags |= query_flags::PAGING_STATE;
        }
        if self.serial_consistency.is_some() {
            flags |= query_flags::SERIAL_CONSISTENCY;
        }
        if self.timestamp.is_some() {
            flags |= query_flags::DEFAULT_TIMESTAMP;
        }

        buf.write::<u16>(self.consistency.to_wire());
        buf.write::<u8>(flags);
        if !self.values.is_empty() {
            buf.write::<u16>(self.values.len() as u16);
            for value in &self.values {
                value.encode(version, buf)?;
            }
        }
        if let Some(size) = self.page_size {
            buf.write::<i32>(size);
        }
        if let Some(ref state) = self.paging_state {
            buf.put_bytes_opt(Some(state));
        }
        if let Some(serial) = self.serial_consistency {
            buf.write::<u16>(serial.to_wire());
        }
        if let Some(ts) = self.timestamp {
            buf.write::<i64>(ts);
        }
        Ok(())
    }
}

//
// Requests
//

pub trait RequestMessage {
    const OPCODE: Opcode;
    fn encode_body(
        &self,
        version: ProtocolVersion,
        body: &mut BytesMut,
    ) -> Result<(), RequestValidationError>;
}

pub struct Startup;

impl RequestMessage for Startup {
    const OPCODE: Opcode = Opcode::Startup;
    fn encode_body(
        &self,
        _version: ProtocolVersion,
        body: &mut BytesMut,
    ) -> Result<(), RequestValidationError> {
        body.put_string_map(vec![("CQL_VERSION", CQL_VERSION)]);
        Ok(())
    }
}

pub struct Options;

impl RequestMessage for Options {
    const OPCODE: Opcode = Opcode::Options;
    fn encode_body(
        &self,
        _version: ProtocolVersion,
        _body: &mut BytesMut,
    ) -> Result<(), RequestValidationError> {
        Ok(())
    }
}

pub struct Register;

impl RequestMessage for Register {
    const OPCODE: Opcode = Opcode::Register;
    fn encode_body(
        &self,
        _version: ProtocolVersion,
        body: &mut BytesMut,
    ) -> Result<(), RequestValidationError> {
        let events: Vec<String> = EVENT_TYPES.iter().map(|s| (*s).to_owned()).collect();
        body.put_string_list(&events);
        Ok(())
    }
}

pub struct AuthResponse {
    pub token: Option<Vec<u8>>,
}

impl RequestMessage for AuthResponse {
    const OPCODE: Opcode = Opcode::AuthResponse;
    fn encode_body(
        &self,
        _version: ProtocolVersion,
        body: &mut BytesMut,
    ) -> Result<(), RequestValidationError> {
        body.put_bytes_opt(self.token.as_deref());
        Ok(())
    }
}

pub struct Query<'a> {
    pub query: &'a str,
    pub params: &'a QueryParams,
}

impl<'a> RequestMessage for Query<'a> {
    const OPCODE: Opcode = Opcode::Query;
    fn encode_body(
        &self,
        version: ProtocolVersion,
        body: &mut BytesMut,
    ) -> Result<(), RequestValidationError> {
        body.put_long_string(self.query);
        self.params.encode(version, body)
    }
}

pub struct Prepare<'a> {
    pub query: &'a str,
}

impl<'a> RequestMessage for Prepare<'a> {
    const OPCODE: Opcode = Opcode::Prepare;
    fn encode_body(
        &self,
        _version: ProtocolVersion,
        body: &mut BytesMut,
    ) -> Result<(), RequestValidationError> {
        body.put_long_string(self.query);
        Ok(())
    }
}

pub struct Execute<'a> {
    pub id: &'a [u8],
    pub params: &'a QueryParams,
}

impl<'a> RequestMessage for Execute<'a> {
    const OPCODE: Opcode = Opcode::Execute;
    fn encode_body(
        &self,
        version: ProtocolVersion,
        body: &mut BytesMut,
    ) -> Result<(), RequestValidationError> {
        body.put_short_bytes(self.id);
        self.params.encode(version, body)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BatchType {
    Logged,
    Unlogged,
    Counter,
}

impl BatchType {
    fn to_wire(self) -> u8 {
        match self {
            BatchType::Logged => 0,
            BatchType::Unlogged => 1,
            BatchType::Counter => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub enum BatchEntry {
    Query { query: String, values: Vec<Value> },
    Prepared { id: Bytes, values: Vec<Value> },
}

pub struct Batch<'a> {
    pub batch_type: BatchType,
    pub entries: &'a [BatchEntry],
    pub consistency: Consistency,
    pub serial_consistency: Option<Consistency>,
    pub timestamp: Option<i64>,
}

impl<'a> RequestMessage for Batch<'a> {
    const OPCODE: Opcode = Opcode::Batch;
    fn encode_body(
        &self,
        version: ProtocolVersion,
        body: &mut BytesMut,
    ) -> Result<(), RequestValidationError> {
        if self.consistency.is_serial() {
            return Err(RequestValidationError::SerialTopLevel(self.consistency));
        }
        if self.entries.len() > u16::max_value() as usize {
            return Err(RequestValidationError::BatchTooLarge(self.entries.len()));
        }
        body.write::<u8>(self.batch_type.to_wire());
        body.write::<u16>(self.entries.len() as u16);
        for entry in self.entries {
            let values = match entry {
                BatchEntry::Query { query, values } => {
                    body.write::<u8>(0);
                    body.put_long_string(query);
                    values
                }
                BatchEntry::Prepared { id, values } => {
                    body.write::<u8>(1);
                    body.put_short_bytes(id);
                    values
                }
            };
            body.write::<u16>(values.len() as u16);
            for value in values {
                value.encode(version, body)?;
            }
        }
        body.write::<u16>(self.consistency.to_wire());
        if version >= ProtocolVersion::V3 {
            let mut batch_flags = 0u8;
            if self.serial_consistency.is_some() {
                batch_flags |= query_flags::SERIAL_CONSISTENCY;
            }
            if self.timestamp.is_some() {
                batch_flags |= query_flags::DEFAULT_TIMESTAMP;
            }
            body.write::<u8>(batch_flags);
            if let Some(serial) = self.serial_consistency {
                if !serial.is_serial() {
                    return Err(RequestValidationError::NotSerialConsistency(serial));
                }
                body.write::<u16>(serial.to_wire());
            }
            if let Some(ts) = self.timestamp {
                body.write::<i64>(ts);
            }
        } else if self.serial_consistency.is_some() || self.timestamp.is_some() {
            return Err(RequestValidationError::Unsupported {
                feature: "batch serial consistency / timestamp",
                version,
            });
        }
        Ok(())
    }
}

//
// Column types and cell values
//

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    Bigint,
    Blob,
    Boolean,
    Counter,
    Decimal,
    Double,
    Float,
    Int,
    Text,
    Timestamp,
    Uuid,
    Varchar,
    Varint,
    Timeuuid,
    Inet,
    Date,
    Time,
    Smallint,
    Tinyint,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    Udt {
        keyspace: String,
        name: String,
        fields: Vec<(String, ColumnType)>,
    },
    Tuple(Vec<ColumnType>),
}

impl ColumnType {
    fn decode(buf: &mut Bytes) -> Result<ColumnType, ProtocolError> {
        use self::ColumnType::*;
        let id = buf.get::<u16>()?;
        Ok(match id {
            0x0000 => Custom(buf.get_string()?),
            0x0001 => Ascii,
            0x0002 => Bigint,
            0x0003 => Blob,
            0x0004 => Boolean,
            0x0005 => Counter,
            0x0006 => Decimal,
            0x0007 => Double,
            0x0008 => Float,
            0x0009 => Int,
            0x000a => Text,
            0x000b => Timestamp,
            0x000c => Uuid,
            0x000d => Varchar,
            0x000e => Varint,
            0x000f => Timeuuid,
            0x0010 => Inet,
            0x0011 => Date,
            0x0012 => Time,
            0x0013 => Smallint,
            0x0014 => Tinyint,
            0x0020 => List(Box::new(ColumnType::decode(buf)?)),
            0x0021 => Map(
                Box::new(ColumnType::decode(buf)?),
                Box::new(ColumnType::decode(buf)?),
            ),
            0x0022 => Set(Box::new(ColumnType::decode(buf)?)),
            0x0030 => {
                let keyspace = buf.get_string()?;
                let name = buf.get_string()?;
                let n = buf.get::<u16>()? as usize;
                let mut fields = Vec::with_capacity(n.min(256));
                for _ in 0..n {
                    let field = buf.get_string()?;
                    let ty = ColumnType::decode(buf)?;
                    fields.push((field, ty));
                }
                Udt {
                    keyspace,
                    name,
                    fields,
                }
            }
            0x0031 => {
                let n = buf.get::<u16>()? as usize;
                let mut items = Vec::with_capacity(n.min(256));
                for _ in 0..n {
                    items.push(ColumnType::decode(buf)?);
                }
                Tuple(items)
            }
            _ => return Err(ProtocolError::Malformed("column type option")),
        })
    }
}

/// A deserialized cell. Only the shapes the control plane reads get a typed
/// variant; anything else keeps its raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum CqlValue {
    Text(String),
    Int(i32),
    BigInt(i64),
    Boolean(bool),
    Blob(Bytes),
    Uuid(Uuid),
    Inet(IpAddr),
    List(Vec<CqlValue>),
    Set(Vec<CqlValue>),
    Map(Vec<(CqlValue, CqlValue)>),
    Other(Bytes),
}

impl CqlValue {
    fn deserialize(
        ty: &ColumnType,
        version: ProtocolVersion,
        mut raw: Bytes,
    ) -> Result<CqlValue, ProtocolError> {
        use self::ColumnType::*;
        Ok(match ty {
            Ascii | Text | Varchar => CqlValue::Text(
                String::from_utf8(raw.to_vec())
                    .map_err(|_| ProtocolError::Malformed("text cell"))?,
            ),
            Int => {
                if raw.len() != 4 {
                    return Err(ProtocolError::Malformed("int cell"));
                }
                CqlValue::Int(raw.get_i32())
            }
            Bigint | Counter | Timestamp | Time => {
                if raw.len() != 8 {
                    return Err(ProtocolError::Malformed("bigint cell"));
                }
                CqlValue::BigInt(raw.get_i64())
            }
            Boolean => {
                if raw.len() != 1 {
                    return Err(ProtocolError::Malformed("boolean cell"));
                }
                CqlValue::Boolean(raw[0] != 0)
            }
            Blob => CqlValue::Blob(raw),
            ColumnType::Uuid | Timeuuid => {
                if raw.len() != 16 {
                    return Err(ProtocolError::Malformed("uuid cell"));
                }
                let mut bytes = [0; 16];
                bytes.copy_from_slice(&raw);
                CqlValue::Uuid(crate::Uuid(bytes))
            }
            ColumnType::Inet => match raw.len() {
                4 => {
                    let mut o = [0; 4];
                    o.copy_from_slice(&raw);
                    CqlValue::Inet(IpAddr::from(o))
                }
                16 => {
                    let mut o = [0; 16];
                    o.copy_from_slice(&raw);
                    CqlValue::Inet(IpAddr::from(o))
                }
                _ => return Err(ProtocolError::Malformed("inet cell")),
            },
            List(inner) | ColumnType::Set(inner) => {
                let items = collection_items(&mut raw, version)?
                    .into_iter()
                    .map(|item| CqlValue::deserialize(inner, version, item))
                    .collect::<Result<Vec<_>, _>>()?;
                match ty {
                    List(_) => CqlValue::List(items),
                    _ => CqlValue::Set(items),
                }
            }
            Map(key_ty, value_ty) => {
                let items = collection_items(&mut raw, version)?;
                if items.len() % 2 != 0 {
                    return Err(ProtocolError::Malformed("map cell"));
                }
                let mut out = Vec::with_capacity(items.len() / 2);
                let mut iter = items.into_iter();
                while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                    out.push((
                        CqlValue::deserialize(key_ty, version, k)?,
                        CqlValue::deserialize(value_ty, version, v)?,
                    ));
                }
                CqlValue::Map(out)
            }
            _ => CqlValue::Other(raw),
        })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_inet(&self) -> Option<IpAddr> {
        match self {
            CqlValue::Inet(ip) => Some(*ip),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            CqlValue::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_text_collection(&self) -> Option<Vec<&str>> {
        match self {
            CqlValue::Set(items) | CqlValue::List(items) => {
                items.iter().map(CqlValue::as_text).collect()
            }
            _ => None,
        }
    }

    pub fn as_text_map(&self) -> Option<Vec<(&str, &str)>> {
        match self {
            CqlValue::Map(entries) => entries
                .iter()
                .map(|(k, v)| Some((k.as_text()?, v.as_text()?)))
                .collect(),
            _ => None,
        }
    }
}

/// Collections are length-prefixed with u16 counts and sizes in v2, i32 in
/// v3+. Elements come back as raw byte slices.
fn collection_items(
    raw: &mut Bytes,
    version: ProtocolVersion,
) -> Result<Vec<Bytes>, ProtocolError> {
    let count = match version {
        ProtocolVersion::V2 => raw.get::<u16>()? as usize,
        _ => {
            let n = raw.get::<i32>()?;
            if n < 0 {
                return Err(ProtocolError::Malformed("collection count"));
            }
            n as usize
        }
    };
    let mut out = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let len = match version {
            ProtocolVersion::V2 => raw.get::<u16>()? as usize,
            _ => {
                let n = raw.get::<i32>()?;
                if n < 0 {
                    return Err(ProtocolError::Malformed("collection element length"));
                }
                n as usize
            }
        };
        out.push(raw.take_bytes(len)?);
    }
    Ok(out)
}

//
// Results
//

#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub keyspace: String,
    pub table: String,
    pub name: String,
    pub ty: ColumnType,
}

#[derive(Debug, Clone, Default)]
pub struct RowsMetadata {
    pub paging_state: Option<Bytes>,
    /// Empty when the response was sent with metadata elided.
    pub col_specs: Vec<ColumnSpec>,
    pub columns_count: usize,
}

mod rows_flags {
    pub const GLOBAL_TABLES_SPEC: i32 = 0x01;
    pub const HAS_MORE_PAGES: i32 = 0x02;
    pub const NO_METADATA: i32 = 0x04;
}

impl RowsMetadata {
    fn decode(buf: &mut Bytes) -> Result<RowsMetadata, ProtocolError> {
        let meta_flags = buf.get::<i32>()?;
        let columns_count = buf.get::<i32>()?;
        if columns_count < 0 {
            return Err(ProtocolError::Malformed("columns count"));
        }
        let columns_count = columns_count as usize;
        let paging_state = if meta_flags & rows_flags::HAS_MORE_PAGES != 0 {
            buf.get_bytes()?
        } else {
            None
        };
        let mut col_specs = Vec::new();
        if meta_flags & rows_flags::NO_METADATA == 0 {
            let global = if meta_flags & rows_flags::GLOBAL_TABLES_SPEC != 0 {
                Some((buf.get_string()?, buf.get_string()?))
            } else {
                None
            };
            col_specs.reserve(columns_count.min(1024));
            for _ in 0..columns_count {
                let (keyspace, table) = match global {
                    Some((ref ks, ref table)) => (ks.clone(), table.clone()),
                    None => (buf.get_string()?, buf.get_string()?),
                };
                let name = buf.get_string()?;
                let ty = ColumnType::decode(buf)?;
                col_specs.push(ColumnSpec {
                    keyspace,
                    table,
                    name,
                    ty,
                });
            }
        }
        Ok(RowsMetadata {
            paging_state,
            col_specs,
            columns_count,
        })
    }
}

/// One decoded row. Cells line up with the result's column specs.
#[derive(Debug, Clone)]
pub struct Row {
    pub cells: Vec<Option<CqlValue>>,
}

impl Row {
    pub fn cell(&self, i: usize) -> Option<&CqlValue> {
        self.cells.get(i).and_then(Option::as_ref)
    }
}

#[derive(Debug, Clone)]
pub struct Rows {
    pub metadata: RowsMetadata,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone)]
pub struct Prepared {
    pub id: Bytes,
    /// Indices of the partition-key columns among the bind variables. v4
    /// reports them; earlier versions leave this empty.
    pub pk_indices: Vec<u16>,
    pub col_specs: Vec<ColumnSpec>,
    pub result_metadata: RowsMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaChangeTarget {
    Keyspace,
    Table,
    Type,
    Function,
    Aggregate,
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaChange {
    pub change: String,
    pub target: SchemaChangeTarget,
    pub keyspace: String,
    /// Table, type, or function name; empty for keyspace-level changes.
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub enum CqlResult {
    Void,
    Rows(Rows),
    SetKeyspace(String),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

fn decode_result(version: ProtocolVersion, buf: &mut Bytes) -> Result<CqlResult, ProtocolError> {
    let kind = buf.get::<i32>()?;
    Ok(match kind {
        0x0001 => CqlResult::Void,
        0x0002 => {
            let metadata = RowsMetadata::decode(buf)?;
            let rows_count = buf.get::<i32>()?;
            if rows_count < 0 {
                return Err(ProtocolError::Malformed("rows count"));
            }
            let mut rows = Vec::with_capacity((rows_count as usize).min(4096));
            for _ in 0..rows_count {
                let mut cells = Vec::with_capacity(metadata.columns_count);
                for i in 0..metadata.columns_count {
                    let raw = buf.get_bytes()?;
                    let cell = match (raw, metadata.col_specs.get(i)) {
                        (Some(raw), Some(spec)) => {
                            Some(CqlValue::deserialize(&spec.ty, version, raw)?)
                        }
                        (Some(raw), None) => Some(CqlValue::Other(raw)),
                        (None, _) => None,
                    };
                    cells.push(cell);
                }
                rows.push(Row { cells });
            }
            CqlResult::Rows(Rows { metadata, rows })
        }
        0x0003 => CqlResult::SetKeyspace(buf.get_string()?),
        0x0004 => {
            let id = buf.get_short_bytes()?;
            let meta_flags = buf.get::<i32>()?;
            let columns_count = buf.get::<i32>()?;
            if columns_count < 0 {
                return Err(ProtocolError::Malformed("columns count"));
            }
            let columns_count = columns_count as usize;
            let mut pk_indices = Vec::new();
            if version >= ProtocolVersion::V4 {
                let pk_count = buf.get::<i32>()?;
                if pk_count < 0 {
                    return Err(ProtocolError::Malformed("pk count"));
                }
                for _ in 0..pk_count {
                    pk_indices.push(buf.get::<u16>()?);
                }
            }
            let global = if meta_flags & rows_flags::GLOBAL_TABLES_SPEC != 0 {
                Some((buf.get_string()?, buf.get_string()?))
            } else {
                None
            };
            let mut col_specs = Vec::with_capacity(columns_count.min(1024));
            for _ in 0..columns_count {
                let (keyspace, table) = match global {
                    Some((ref ks, ref table)) => (ks.clone(), table.clone()),
                    None => (buf.get_string()?, buf.get_string()?),
                };
                let name = buf.get_string()?;
                let ty = ColumnType::decode(buf)?;
                col_specs.push(ColumnSpec {
                    keyspace,
                    table,
                    name,
                    ty,
                });
            }
            let result_metadata = RowsMetadata::decode(buf)?;
            CqlResult::Prepared(Prepared {
                id,
                pk_indices,
                col_specs,
                result_metadata,
            })
        }
        0x0005 => CqlResult::SchemaChange(decode_schema_change(version, buf)?),
        _ => return Err(ProtocolError::Malformed("result kind")),
    })
}

fn decode_schema_change(
    version: ProtocolVersion,
    buf: &mut Bytes,
) -> Result<SchemaChange, ProtocolError> {
    if version == ProtocolVersion::V2 {
        let change = buf.get_string()?;
        let keyspace = buf.get_string()?;
        let table = buf.get_string()?;
        let (target, name) = if table.is_empty() {
            (SchemaChangeTarget::Keyspace, None)
        } else {
            (SchemaChangeTarget::Table, Some(table))
        };
        return Ok(SchemaChange {
            change,
            target,
            keyspace,
            name,
        });
    }
    let change = buf.get_string()?;
    let target_str = buf.get_string()?;
    let target = match target_str.as_str() {
        "KEYSPACE" => SchemaChangeTarget::Keyspace,
        "TABLE" => SchemaChangeTarget::Table,
        "TYPE" => SchemaChangeTarget::Type,
        "FUNCTION" => SchemaChangeTarget::Function,
        "AGGREGATE" => SchemaChangeTarget::Aggregate,
        _ => SchemaChangeTarget::Other(target_str),
    };
    let keyspace = buf.get_string()?;
    let name = match target {
        SchemaChangeTarget::Keyspace => None,
        SchemaChangeTarget::Function | SchemaChangeTarget::Aggregate => {
            let name = buf.get_string()?;
            // Argument type list follows; we do not track signatures.
            let _ = buf.get_string_list()?;
            Some(name)
        }
        _ => Some(buf.get_string()?),
    };
    Ok(SchemaChange {
        change,
        target,
        keyspace,
        name,
    })
}

//
// Events
//

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    TopologyChange {
        change: TopologyChange,
        addr: ::std::net::SocketAddr,
    },
    StatusChange {
        change: StatusChange,
        addr: ::std::net::SocketAddr,
    },
    SchemaChange(SchemaChange),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TopologyChange {
    NewNode,
    RemovedNode,
    MovedNode,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StatusChange {
    Up,
    Down,
}

fn decode_event(version: ProtocolVersion, buf: &mut Bytes) -> Result<Event, ProtocolError> {
    let class = buf.get_string()?;
    Ok(match class.as_str() {
        "TOPOLOGY_CHANGE" => {
            let change = match buf.get_string()?.as_str() {
                "NEW_NODE" => TopologyChange::NewNode,
                "REMOVED_NODE" => TopologyChange::RemovedNode,
                "MOVED_NODE" => TopologyChange::MovedNode,
                _ => return Err(ProtocolError::Malformed("topology change")),
            };
            let addr = buf.get_inet()?;
            Event::TopologyChange { change, addr }
        }
        "STATUS_CHANGE" => {
            let change = match buf.get_string()?.as_str() {
                "UP" => StatusChange::Up,
                "DOWN" => StatusChange::Down,
                _ => return Err(ProtocolError::Malformed("status change")),
            };
            let addr = buf.get_inet()?;
            Event::StatusChange { change, addr }
        }
        "SCHEMA_CHANGE" => Event::SchemaChange(decode_schema_change(version, buf)?),
        _ => return Err(ProtocolError::Malformed("event class")),
    })
}

//
// Errors
//

fn decode_error(buf: &mut Bytes) -> Result<(DbError, String), ProtocolError> {
    let code = buf.get::<i32>()?;
    let message = buf.get_string()?;
    let get_consistency = |buf: &mut Bytes| -> Result<Consistency, ProtocolError> {
        let raw = buf.get::<u16>()?;
        Consistency::from_wire(raw).ok_or(ProtocolError::Malformed("consistency"))
    };
    let error = match code {
        0x0000 => DbError::ServerError,
        0x000a => DbError::ProtocolError,
        0x0100 => DbError::BadCredentials,
        0x1000 => DbError::Unavailable {
            consistency: get_consistency(buf)?,
            required: buf.get::<i32>()?,
            alive: buf.get::<i32>()?,
        },
        0x1001 => DbError::Overloaded,
        0x1002 => DbError::IsBootstrapping,
        0x1003 => DbError::TruncateError,
        0x1100 => DbError::WriteTimeout {
            consistency: get_consistency(buf)?,
            received: buf.get::<i32>()?,
            required: buf.get::<i32>()?,
            write_type: WriteType::from_wire(&buf.get_string()?),
        },
        0x1200 => DbError::ReadTimeout {
            consistency: get_consistency(buf)?,
            received: buf.get::<i32>()?,
            required: buf.get::<i32>()?,
            data_present: buf.get::<u8>()? != 0,
        },
        0x1300 => DbError::ReadFailure {
            consistency: get_consistency(buf)?,
            received: buf.get::<i32>()?,
            required: buf.get::<i32>()?,
            failures: buf.get::<i32>()?,
            data_present: buf.get::<u8>()? != 0,
        },
        0x1400 => DbError::FunctionFailure {
            keyspace: buf.get_string()?,
            function: buf.get_string()?,
            arg_types: buf.get_string_list()?,
        },
        0x1500 => DbError::WriteFailure {
            consistency: get_consistency(buf)?,
            received: buf.get::<i32>()?,
            required: buf.get::<i32>()?,
            failures: buf.get::<i32>()?,
            write_type: WriteType::from_wire(&buf.get_string()?),
        },
        0x2000 => DbError::SyntaxError,
        0x2100 => DbError::Unauthorized,
        0x2200 => DbError::Invalid,
        0x2300 => DbError::ConfigError,
        0x2400 => DbError::AlreadyExists {
            keyspace: buf.get_string()?,
            table: buf.get_string()?,
        },
        0x2500 => DbError::Unprepared {
            id: buf.get_short_bytes()?,
        },
        other => DbError::Other(other),
    };
    Ok((error, message))
}

//
// Response assembly
//

#[derive(Debug, Clone)]
pub enum Response {
    Ready,
    Authenticate(String),
    AuthChallenge(Option<Bytes>),
    AuthSuccess(Option<Bytes>),
    Supported(Vec<(String, Vec<String>)>),
    Result(CqlResult),
    Error { error: DbError, message: String },
    Event(Event),
}

/// A fully parsed response frame: body message plus the optional envelope
/// fields selected by the frame flags.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub tracing_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub message: Response,
}

pub fn parse_response(
    header: &FrameHeader,
    mut body: Bytes,
) -> Result<ResponseEnvelope, ProtocolError> {
    let tracing_id = if header.flags & flags::TRACING != 0 {
        Some(body.get::<Uuid>()?)
    } else {
        None
    };
    let warnings = if header.flags & flags::WARNING != 0 {
        body.get_string_list()?
    } else {
        Vec::new()
    };
    if header.flags & flags::CUSTOM_PAYLOAD != 0 {
        // A bytes map we carry no semantics for; skip it.
        let n = body.get::<u16>()?;
        for _ in 0..n {
            let _ = body.get_string()?;
            let _ = body.get_bytes()?;
        }
    }

    let version = header.version;
    let message = match header.opcode {
        Opcode::Ready => Response::Ready,
        Opcode::Authenticate => Response::Authenticate(body.get_string()?),
        Opcode::AuthChallenge => Response::AuthChallenge(body.get_bytes()?),
        Opcode::AuthSuccess => Response::AuthSuccess(body.get_bytes()?),
        Opcode::Supported => Response::Supported(body.get_string_multimap()?),
        Opcode::Result => Response::Result(decode_result(version, &mut body)?),
        Opcode::Error => {
            let (error, message) = decode_error(&mut body)?;
            Response::Error { error, message }
        }
        Opcode::Event => Response::Event(decode_event(version, &mut body)?),
        _ => return Err(ProtocolError::Malformed("response opcode")),
    };
    Ok(ResponseEnvelope {
        tracing_id,
        warnings,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamId;
    use assert_matches::assert_matches;

    fn encode<R: RequestMessage>(req: &R, version: ProtocolVersion) -> Bytes {
        let mut body = BytesMut::new();
        req.encode_body(version, &mut body).unwrap();
        body.freeze()
    }

    fn response_header(version: ProtocolVersion, opcode: Opcode, flags: u8) -> FrameHeader {
        FrameHeader {
            version,
            response: true,
            flags,
            stream: StreamId(1),
            opcode,
            length: 0,
        }
    }

    #[test]
    fn startup_carries_cql_version() {
        let mut body = encode(&Startup, ProtocolVersion::V4);
        let map = body.get_string_map().unwrap();
        assert_eq!(map, vec![("CQL_VERSION".to_owned(), "3.0.0".to_owned())]);
    }

    #[test]
    fn query_flags_cover_optional_fields() {
        let params = QueryParams {
            consistency: Consistency::Quorum,
            serial_consistency: Some(Consistency::LocalSerial),
            values: vec![Value::int(7)],
            skip_metadata: false,
            page_size: Some(5000),
            paging_state: Some(Bytes::from_static(b"st")),
            timestamp: Some(1234),
        };
        let mut body = encode(
            &Query {
                query: "SELECT x FROM t WHERE k = ?",
                params: &params,
            },
            ProtocolVersion::V4,
        );
        assert_eq!(body.get_long_string().unwrap(), "SELECT x FROM t WHERE k = ?");
        assert_eq!(body.get::<u16>().unwrap(), Consistency::Quorum.to_wire());
        let flags = body.get::<u8>().unwrap();
        assert_eq!(flags, 0x01 | 0x04 | 0x08 | 0x10 | 0x20);
        assert_eq!(body.get::<u16>().unwrap(), 1); // one value
        assert_eq!(body.get_bytes().unwrap().unwrap().as_ref(), &7i32.to_be_bytes());
        assert_eq!(body.get::<i32>().unwrap(), 5000);
        assert_eq!(body.get_bytes().unwrap().unwrap().as_ref(), b"st");
        assert_eq!(
            body.get::<u16>().unwrap(),
            Consistency::LocalSerial.to_wire()
        );
        assert_eq!(body.get::<i64>().unwrap(), 1234);
        assert_eq!(body.remaining(), 0);
    }

    #[test]
    fn unset_is_rejected_below_v4() {
        let params = QueryParams {
            values: vec![Value::Unset],
            ..QueryParams::default()
        };
        let query = Query {
            query: "UPDATE t SET x = ? WHERE k = 1",
            params: &params,
        };
        let mut body = BytesMut::new();
        assert_matches!(
            query.encode_body(ProtocolVersion::V3, &mut body),
            Err(RequestValidationError::UnsetValue(ProtocolVersion::V3))
        );
        let mut body = BytesMut::new();
        assert!(query.encode_body(ProtocolVersion::V4, &mut body).is_ok());
    }

    #[test]
    fn serial_top_level_consistency_is_rejected() {
        let params = QueryParams {
            consistency: Consistency::Serial,
            ..QueryParams::default()
        };
        let mut body = BytesMut::new();
        assert_matches!(
            Query {
                query: "SELECT 1",
                params: &params
            }
            .encode_body(ProtocolVersion::V4, &mut body),
            Err(RequestValidationError::SerialTopLevel(Consistency::Serial))
        );
    }

    #[test]
    fn timestamp_is_rejected_on_v2() {
        let params = QueryParams {
            timestamp: Some(99),
            ..QueryParams::default()
        };
        let mut body = BytesMut::new();
        assert_matches!(
            Query {
                query: "SELECT 1",
                params: &params
            }
            .encode_body(ProtocolVersion::V2, &mut body),
            Err(RequestValidationError::Unsupported { .. })
        );
    }

    #[test]
    fn batch_encodes_mixed_entries() {
        let entries = vec![
            BatchEntry::Query {
                query: "INSERT INTO t (k) VALUES (1)".to_owned(),
                values: vec![],
            },
            BatchEntry::Prepared {
                id: Bytes::from_static(b"\x10\x20"),
                values: vec![Value::Null],
            },
        ];
        let batch = Batch {
            batch_type: BatchType::Unlogged,
            entries: &entries,
            consistency: Consistency::One,
            serial_consistency: None,
            timestamp: None,
        };
        let mut body = encode(&batch, ProtocolVersion::V3);
        assert_eq!(body.get::<u8>().unwrap(), 1); // unlogged
        assert_eq!(body.get::<u16>().unwrap(), 2);
        assert_eq!(body.get::<u8>().unwrap(), 0); // query string kind
        assert_eq!(body.get_long_string().unwrap(), "INSERT INTO t (k) VALUES (1)");
        assert_eq!(body.get::<u16>().unwrap(), 0);
        assert_eq!(body.get::<u8>().unwrap(), 1); // prepared kind
        assert_eq!(body.get_short_bytes().unwrap().as_ref(), b"\x10\x20");
        assert_eq!(body.get::<u16>().unwrap(), 1);
        assert_eq!(body.get::<i32>().unwrap(), -1); // null value
        assert_eq!(body.get::<u16>().unwrap(), Consistency::One.to_wire());
        assert_eq!(body.get::<u8>().unwrap(), 0); // batch flags
        assert_eq!(body.remaining(), 0);
    }

    fn rows_body() -> BytesMut {
        // One column `name` of type varchar in ks.tbl, two rows.
        let mut body = BytesMut::new();
        body.write::<i32>(0x01); // global tables spec
        body.write::<i32>(1); // columns
        body.put_string("ks");
        body.put_string("tbl");
        body.put_string("name");
        body.write::<u16>(0x000d); // varchar
        body.write::<i32>(2); // rows
        body.put_bytes_opt(Some(b"alpha"));
        body.put_bytes_opt(None);
        body
    }

    #[test]
    fn rows_result_round_trip() {
        let header = response_header(ProtocolVersion::V4, Opcode::Result, 0);
        let mut body = BytesMut::new();
        body.write::<i32>(0x0002);
        body.extend_from_slice(&rows_body());
        let envelope = parse_response(&header, body.freeze()).unwrap();
        let rows = match envelope.message {
            Response::Result(CqlResult::Rows(rows)) => rows,
            other => panic!("unexpected response: {:?}", other),
        };
        assert_eq!(rows.metadata.col_specs.len(), 1);
        assert_eq!(rows.metadata.col_specs[0].name, "name");
        assert_eq!(rows.rows.len(), 2);
        assert_eq!(rows.rows[0].cell(0).unwrap().as_text(), Some("alpha"));
        assert!(rows.rows[1].cell(0).is_none());
    }

    #[test]
    fn tracing_and_warnings_envelope() {
        let header = response_header(
            ProtocolVersion::V4,
            Opcode::Result,
            flags::TRACING | flags::WARNING,
        );
        let mut body = BytesMut::new();
        body.put_slice(&[0xab; 16]);
        body.put_string_list(&["too slow".to_owned()]);
        body.write::<i32>(0x0001); // void
        let envelope = parse_response(&header, body.freeze()).unwrap();
        assert_eq!(envelope.tracing_id, Some(Uuid([0xab; 16])));
        assert_eq!(envelope.warnings, vec!["too slow".to_owned()]);
        assert_matches!(envelope.message, Response::Result(CqlResult::Void));
    }

    #[test]
    fn unavailable_error_round_trip() {
        let header = response_header(ProtocolVersion::V4, Opcode::Error, 0);
        let mut body = BytesMut::new();
        body.write::<i32>(0x1000);
        body.put_string("not enough replicas");
        body.write::<u16>(Consistency::Quorum.to_wire());
        body.write::<i32>(2);
        body.write::<i32>(1);
        let envelope = parse_response(&header, body.freeze()).unwrap();
        match envelope.message {
            Response::Error { error, message } => {
                assert_eq!(
                    error,
                    DbError::Unavailable {
                        consistency: Consistency::Quorum,
                        required: 2,
                        alive: 1
                    }
                );
                assert_eq!(message, "not enough replicas");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn topology_event_round_trip() {
        let header = response_header(ProtocolVersion::V3, Opcode::Event, 0);
        let mut body = BytesMut::new();
        body.put_string("TOPOLOGY_CHANGE");
        body.put_string("NEW_NODE");
        body.put_inet("10.0.0.9:9042".parse().unwrap());
        let envelope = parse_response(&header, body.freeze()).unwrap();
        assert_eq!(
            match envelope.message {
                Response::Event(e) => e,
                other => panic!("unexpected response: {:?}", other),
            },
            Event::TopologyChange {
                change: TopologyChange::NewNode,
                addr: "10.0.0.9:9042".parse().unwrap(),
            }
        );
    }

    #[test]
    fn schema_change_event_v3_targets() {
        let header = response_header(ProtocolVersion::V4, Opcode::Event, 0);
        let mut body = BytesMut::new();
        body.put_string("SCHEMA_CHANGE");
        body.put_string("UPDATED");
        body.put_string("TABLE");
        body.put_string("app");
        body.put_string("users");
        let envelope = parse_response(&header, body.freeze()).unwrap();
        match envelope.message {
            Response::Event(Event::SchemaChange(change)) => {
                assert_eq!(change.change, "UPDATED");
                assert_eq!(change.target, SchemaChangeTarget::Table);
                assert_eq!(change.keyspace, "app");
                assert_eq!(change.name.as_deref(), Some("users"));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn v2_collections_use_short_lengths() {
        let ty = ColumnType::Set(Box::new(ColumnType::Varchar));
        let mut raw = BytesMut::new();
        raw.write::<u16>(2);
        raw.write::<u16>(1);
        raw.put_slice(b"a");
        raw.write::<u16>(2);
        raw.put_slice(b"bc");
        let v = CqlValue::deserialize(&ty, ProtocolVersion::V2, raw.freeze()).unwrap();
        assert_eq!(v.as_text_collection().unwrap(), vec!["a", "bc"]);
    }

    #[test]
    fn prepared_result_with_pk_indices_v4() {
        let header = response_header(ProtocolVersion::V4, Opcode::Result, 0);
        let mut body = BytesMut::new();
        body.write::<i32>(0x0004);
        body.put_short_bytes(b"\xca\xfe");
        body.write::<i32>(0x01); // global spec
        body.write::<i32>(1); // one bind variable
        body.write::<i32>(1); // one pk column
        body.write::<u16>(0); // at index 0
        body.put_string("ks");
        body.put_string("tbl");
        body.put_string("k");
        body.write::<u16>(0x000d);
        // Result metadata: no columns.
        body.write::<i32>(0);
        body.write::<i32>(0);
        let envelope = parse_response(&header, body.freeze()).unwrap();
        match envelope.message {
            Response::Result(CqlResult::Prepared(p)) => {
                assert_eq!(p.id.as_ref(), b"\xca\xfe");
                assert_eq!(p.pk_indices, vec![0]);
                assert_eq!(p.col_specs.len(), 1);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }
}
