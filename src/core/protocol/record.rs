// src/core/protocol/record.rs

//! FastCGI 1.0 record structure and the typed bodies carried by specific record kinds.

use crate::core::FcgiError;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// The only protocol version this server speaks.
pub const FCGI_VERSION_1: u8 = 1;
/// Length of the fixed record header.
pub const HEADER_LEN: usize = 8;
/// Largest content a single record can carry (`contentLength` is a u16).
pub const MAX_CONTENT_LEN: usize = u16::MAX as usize;
/// Request id reserved for management records.
pub const NULL_REQUEST_ID: u16 = 0;
/// `flags` bit in a BeginRequest body asking the application to keep the connection open.
pub const FCGI_KEEP_CONN: u8 = 1;

// Variable names understood in GET_VALUES management records.
pub const FCGI_MAX_CONNS: &str = "FCGI_MAX_CONNS";
pub const FCGI_MAX_REQS: &str = "FCGI_MAX_REQS";
pub const FCGI_MPXS_CONNS: &str = "FCGI_MPXS_CONNS";

/// The type tag of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    BeginRequest,
    AbortRequest,
    EndRequest,
    Params,
    Stdin,
    Stdout,
    Stderr,
    Data,
    GetValues,
    GetValuesResult,
    UnknownType,
    /// A type code outside the FastCGI 1.0 range.
    Unknown(u8),
}

impl RecordKind {
    pub fn from_u8(code: u8) -> Self {
        match code {
            1 => RecordKind::BeginRequest,
            2 => RecordKind::AbortRequest,
            3 => RecordKind::EndRequest,
            4 => RecordKind::Params,
            5 => RecordKind::Stdin,
            6 => RecordKind::Stdout,
            7 => RecordKind::Stderr,
            8 => RecordKind::Data,
            9 => RecordKind::GetValues,
            10 => RecordKind::GetValuesResult,
            11 => RecordKind::UnknownType,
            other => RecordKind::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            RecordKind::BeginRequest => 1,
            RecordKind::AbortRequest => 2,
            RecordKind::EndRequest => 3,
            RecordKind::Params => 4,
            RecordKind::Stdin => 5,
            RecordKind::Stdout => 6,
            RecordKind::Stderr => 7,
            RecordKind::Data => 8,
            RecordKind::GetValues => 9,
            RecordKind::GetValuesResult => 10,
            RecordKind::UnknownType => 11,
            RecordKind::Unknown(code) => code,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::BeginRequest => f.write_str("BEGIN_REQUEST"),
            RecordKind::AbortRequest => f.write_str("ABORT_REQUEST"),
            RecordKind::EndRequest => f.write_str("END_REQUEST"),
            RecordKind::Params => f.write_str("PARAMS"),
            RecordKind::Stdin => f.write_str("STDIN"),
            RecordKind::Stdout => f.write_str("STDOUT"),
            RecordKind::Stderr => f.write_str("STDERR"),
            RecordKind::Data => f.write_str("DATA"),
            RecordKind::GetValues => f.write_str("GET_VALUES"),
            RecordKind::GetValuesResult => f.write_str("GET_VALUES_RESULT"),
            RecordKind::UnknownType => f.write_str("UNKNOWN_TYPE"),
            RecordKind::Unknown(code) => write!(f, "UNKNOWN({code})"),
        }
    }
}

/// One discrete, typed unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: RecordKind,
    pub request_id: u16,
    pub content: Bytes,
}

impl Record {
    pub fn new(kind: RecordKind, request_id: u16, content: impl Into<Bytes>) -> Self {
        Self {
            kind,
            request_id,
            content: content.into(),
        }
    }

    /// Management records are addressed to the application, not a request.
    pub fn is_management(&self) -> bool {
        self.request_id == NULL_REQUEST_ID
    }

    /// An empty stream record (PARAMS, STDIN, ...) terminates its stream.
    pub fn is_stream_end(&self) -> bool {
        self.content.is_empty()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (request {}, {} bytes)",
            self.kind,
            self.request_id,
            self.content.len()
        )
    }
}

/// The role the web server expects the application to play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Responder,
    Authorizer,
    Filter,
    Unknown(u16),
}

impl From<u16> for Role {
    fn from(code: u16) -> Self {
        match code {
            1 => Role::Responder,
            2 => Role::Authorizer,
            3 => Role::Filter,
            other => Role::Unknown(other),
        }
    }
}

impl From<Role> for u16 {
    fn from(role: Role) -> Self {
        match role {
            Role::Responder => 1,
            Role::Authorizer => 2,
            Role::Filter => 3,
            Role::Unknown(code) => code,
        }
    }
}

/// The body of a BEGIN_REQUEST record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequestBody {
    pub role: Role,
    pub flags: u8,
}

impl BeginRequestBody {
    pub const LEN: usize = 8;

    pub fn parse(content: &[u8]) -> Result<Self, FcgiError> {
        if content.len() < Self::LEN {
            return Err(FcgiError::Protocol(format!(
                "BEGIN_REQUEST body must be {} bytes, got {}",
                Self::LEN,
                content.len()
            )));
        }
        Ok(Self {
            role: Role::from(u16::from_be_bytes([content[0], content[1]])),
            flags: content[2],
        })
    }

    pub fn keep_conn(&self) -> bool {
        self.flags & FCGI_KEEP_CONN != 0
    }

    pub fn to_bytes(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u16(self.role.into());
        buf.put_u8(self.flags);
        buf.put_bytes(0, 5);
        buf.freeze()
    }
}

/// `protocolStatus` values of an END_REQUEST record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolStatus {
    RequestComplete = 0,
    CantMpxConn = 1,
    Overloaded = 2,
    UnknownRole = 3,
}

/// The body of an END_REQUEST record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequestBody {
    pub app_status: u32,
    pub protocol_status: ProtocolStatus,
}

impl EndRequestBody {
    pub fn to_bytes(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u32(self.app_status);
        buf.put_u8(self.protocol_status as u8);
        buf.put_bytes(0, 3);
        buf.freeze()
    }
}

/// Reads a name-value pair length: one byte, or four with the high bit set.
fn read_length(src: &[u8], pos: &mut usize) -> Result<usize, FcgiError> {
    let first = *src
        .get(*pos)
        .ok_or_else(|| FcgiError::Protocol("truncated name-value length".into()))?;
    if first & 0x80 == 0 {
        *pos += 1;
        return Ok(first as usize);
    }
    let bytes = src
        .get(*pos..*pos + 4)
        .ok_or_else(|| FcgiError::Protocol("truncated name-value length".into()))?;
    *pos += 4;
    Ok((u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) & 0x7fff_ffff) as usize)
}

/// Parses a complete PARAMS or GET_VALUES stream into name-value pairs.
pub fn parse_name_value_pairs(src: &[u8]) -> Result<Vec<(Bytes, Bytes)>, FcgiError> {
    let mut pairs = Vec::new();
    let mut pos = 0;
    while pos < src.len() {
        let name_len = read_length(src, &mut pos)?;
        let value_len = read_length(src, &mut pos)?;
        let end = pos
            .checked_add(name_len)
            .and_then(|n| n.checked_add(value_len))
            .filter(|&end| end <= src.len())
            .ok_or_else(|| FcgiError::Protocol("name-value pair exceeds stream".into()))?;
        let name = Bytes::copy_from_slice(&src[pos..pos + name_len]);
        let value = Bytes::copy_from_slice(&src[pos + name_len..end]);
        pairs.push((name, value));
        pos = end;
    }
    Ok(pairs)
}

fn put_length(dst: &mut BytesMut, len: usize) {
    if len < 0x80 {
        dst.put_u8(len as u8);
    } else {
        dst.put_u32(len as u32 | 0x8000_0000);
    }
}

/// Appends one encoded name-value pair to `dst`.
pub fn put_name_value_pair(dst: &mut BytesMut, name: &[u8], value: &[u8]) {
    put_length(dst, name.len());
    put_length(dst, value.len());
    dst.extend_from_slice(name);
    dst.extend_from_slice(value);
}
