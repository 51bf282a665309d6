//! Binary wire protocol for the collaboration server.
//!
//! Wire format, identical for every message:
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────────────────────────┐
//! │ kind     │ version  │ status   │ kind-specific payload        │
//! │ 1 byte   │ 1 byte   │ 1 byte   │ variable                     │
//! └──────────┴──────────┴──────────┴──────────────────────────────┘
//! ```
//!
//! Strings are UTF-8 bytes followed by a single NUL terminator. Cursor
//! positions are two 16-bit big-endian integers (line, then column); the
//! erase count is a 32-bit big-endian integer.
//!
//! Requests and responses share kind values: a response reuses its
//! request's kind with `status = 0` and a fixed number of string fields,
//! while write/erase successes are byte-for-byte echoes of the request.
//! Failures use [`MessageKind::Error`] with `status = 1` and one message
//! string.
//!
//! Decoding goes through [`ByteReader`], a bounds-checked cursor that
//! derives every field offset from the previous read, so no offset is
//! ever computed by hand. `encode(decode(bytes)) == bytes` holds for
//! every valid message, and decode never reads past the supplied buffer.

use std::fmt;

/// Protocol version carried in every header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Message kinds; the discriminants are the on-wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Write = 0,
    Erase = 1,
    Load = 2,
    Create = 3,
    Join = 4,
    Login = 5,
    Register = 6,
    Error = 7,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Write),
            1 => Some(Self::Erase),
            2 => Some(Self::Load),
            3 => Some(Self::Create),
            4 => Some(Self::Join),
            5 => Some(Self::Login),
            6 => Some(Self::Register),
            7 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Codec failures. Decode rejects malformed input with one of these
/// instead of reading out of bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The buffer ended before the message did.
    Truncated,
    /// Unknown kind byte, or a kind that is invalid in this direction.
    InvalidKind(u8),
    UnsupportedVersion(u8),
    /// A status byte that contradicts the message kind.
    UnexpectedStatus(u8),
    /// Bad UTF-8, or an interior NUL in a string field.
    InvalidString,
    /// Bytes left over after a complete message.
    TrailingBytes(usize),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "message truncated"),
            Self::InvalidKind(k) => write!(f, "invalid message kind {k}"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported protocol version {v}"),
            Self::UnexpectedStatus(s) => write!(f, "unexpected status code {s}"),
            Self::InvalidString => write!(f, "invalid string field"),
            Self::TrailingBytes(n) => write!(f, "{n} trailing bytes after message"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Bounds-checked read cursor over a byte buffer.
///
/// Every read advances the internal position, so field offsets always
/// follow from the actual sizes of the preceding fields.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a NUL-terminated UTF-8 string, consuming the terminator.
    pub fn read_str(&mut self) -> Result<String, ProtocolError> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::Truncated)?;
        let s = std::str::from_utf8(&rest[..nul]).map_err(|_| ProtocolError::InvalidString)?;
        self.pos += nul + 1;
        Ok(s.to_string())
    }
}

/// Write cursor building an encoded message.
pub struct ByteWriter {
    out: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { out: Vec::new() }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.out.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    /// Append a string field with its NUL terminator. Interior NULs would
    /// corrupt the framing and are rejected.
    pub fn put_str(&mut self, s: &str) -> Result<(), ProtocolError> {
        if s.bytes().any(|b| b == 0) {
            return Err(ProtocolError::InvalidString);
        }
        self.out.extend_from_slice(s.as_bytes());
        self.out.push(0);
        Ok(())
    }

    pub fn finish(self) -> Vec<u8> {
        self.out
    }
}

impl Default for ByteWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// The fixed-size leading fields of every message.
///
/// Always first in the buffer, so a reader can branch on kind before
/// parsing the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageKind,
    pub version: u8,
    pub status: u8,
}

impl Header {
    pub const SIZE: usize = 3;

    /// Read the header without committing to a payload parse.
    pub fn peek(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = ByteReader::new(buf);
        Self::read(&mut reader)
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, ProtocolError> {
        let kind_byte = reader.read_u8()?;
        let kind = MessageKind::from_u8(kind_byte).ok_or(ProtocolError::InvalidKind(kind_byte))?;
        let version = reader.read_u8()?;
        let status = reader.read_u8()?;
        Ok(Self {
            kind,
            version,
            status,
        })
    }

    fn write_to(&self, writer: &mut ByteWriter) {
        writer.put_u8(self.kind as u8);
        writer.put_u8(self.version);
        writer.put_u8(self.status);
    }
}

/// A cursor position as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor {
    pub line: u16,
    pub column: u16,
}

impl Cursor {
    pub fn new(line: u16, column: u16) -> Self {
        Self { line, column }
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, ProtocolError> {
        let line = reader.read_u16()?;
        let column = reader.read_u16()?;
        Ok(Self { line, column })
    }

    fn write_to(&self, writer: &mut ByteWriter) {
        writer.put_u16(self.line);
        writer.put_u16(self.column);
    }
}

/// A client request. Requests always carry `status = 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Register {
        username: String,
        password: String,
    },
    Login {
        username: String,
        password: String,
    },
    Create {
        user_id: String,
        filename: String,
    },
    Load {
        user_id: String,
        filename: String,
    },
    Join {
        user_id: String,
        access_code: String,
    },
    Write {
        user_id: String,
        cursor: Cursor,
        text: String,
    },
    Erase {
        user_id: String,
        cursor: Cursor,
        count: u32,
    },
}

impl Request {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Register { .. } => MessageKind::Register,
            Self::Login { .. } => MessageKind::Login,
            Self::Create { .. } => MessageKind::Create,
            Self::Load { .. } => MessageKind::Load,
            Self::Join { .. } => MessageKind::Join,
            Self::Write { .. } => MessageKind::Write,
            Self::Erase { .. } => MessageKind::Erase,
        }
    }

    /// The session token carried by session-scoped requests.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::Register { .. } | Self::Login { .. } => None,
            Self::Create { user_id, .. }
            | Self::Load { user_id, .. }
            | Self::Join { user_id, .. }
            | Self::Write { user_id, .. }
            | Self::Erase { user_id, .. } => Some(user_id),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut w = ByteWriter::new();
        Header {
            kind: self.kind(),
            version: PROTOCOL_VERSION,
            status: 0,
        }
        .write_to(&mut w);
        match self {
            Self::Register { username, password } | Self::Login { username, password } => {
                w.put_str(username)?;
                w.put_str(password)?;
            }
            Self::Create { user_id, filename } | Self::Load { user_id, filename } => {
                w.put_str(user_id)?;
                w.put_str(filename)?;
            }
            Self::Join {
                user_id,
                access_code,
            } => {
                w.put_str(user_id)?;
                w.put_str(access_code)?;
            }
            Self::Write {
                user_id,
                cursor,
                text,
            } => {
                w.put_str(user_id)?;
                cursor.write_to(&mut w);
                w.put_str(text)?;
            }
            Self::Erase {
                user_id,
                cursor,
                count,
            } => {
                w.put_str(user_id)?;
                cursor.write_to(&mut w);
                w.put_u32(*count);
            }
        }
        Ok(w.finish())
    }

    /// Decode one request from the front of `buf`, returning the bytes
    /// consumed. Lets stream readers peel messages off a receive buffer
    /// that may hold more than one.
    pub fn decode_prefix(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let mut r = ByteReader::new(buf);
        let header = Header::read(&mut r)?;
        if header.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }
        if header.status != 0 {
            return Err(ProtocolError::UnexpectedStatus(header.status));
        }
        let request = match header.kind {
            MessageKind::Register => Self::Register {
                username: r.read_str()?,
                password: r.read_str()?,
            },
            MessageKind::Login => Self::Login {
                username: r.read_str()?,
                password: r.read_str()?,
            },
            MessageKind::Create => Self::Create {
                user_id: r.read_str()?,
                filename: r.read_str()?,
            },
            MessageKind::Load => Self::Load {
                user_id: r.read_str()?,
                filename: r.read_str()?,
            },
            MessageKind::Join => Self::Join {
                user_id: r.read_str()?,
                access_code: r.read_str()?,
            },
            MessageKind::Write => Self::Write {
                user_id: r.read_str()?,
                cursor: Cursor::read(&mut r)?,
                text: r.read_str()?,
            },
            MessageKind::Erase => Self::Erase {
                user_id: r.read_str()?,
                cursor: Cursor::read(&mut r)?,
                count: r.read_u32()?,
            },
            MessageKind::Error => return Err(ProtocolError::InvalidKind(MessageKind::Error as u8)),
        };
        Ok((request, r.consumed()))
    }

    /// Decode a buffer holding exactly one request.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let (request, used) = Self::decode_prefix(buf)?;
        if used != buf.len() {
            return Err(ProtocolError::TrailingBytes(buf.len() - used));
        }
        Ok(request)
    }
}

/// A server response: the request's kind echoed back with a fixed number
/// of string fields, or [`MessageKind::Error`] with one message string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub kind: MessageKind,
    pub status: u8,
    pub fields: Vec<String>,
}

impl Response {
    /// Success response. `fields` must match [`Response::field_count`]
    /// for the kind.
    pub fn ok(kind: MessageKind, fields: Vec<String>) -> Self {
        Self {
            kind,
            status: 0,
            fields,
        }
    }

    /// Error response: one human-readable string, `status = 1`.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Error,
            status: 1,
            fields: vec![message.into()],
        }
    }

    pub fn is_error(&self) -> bool {
        self.status != 0
    }

    /// Number of string fields a response of this kind carries, or `None`
    /// for kinds whose successes are request echoes.
    pub fn field_count(kind: MessageKind) -> Option<usize> {
        match kind {
            MessageKind::Register
            | MessageKind::Login
            | MessageKind::Create
            | MessageKind::Join
            | MessageKind::Error => Some(1),
            MessageKind::Load => Some(2),
            MessageKind::Write | MessageKind::Erase => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut w = ByteWriter::new();
        Header {
            kind: self.kind,
            version: PROTOCOL_VERSION,
            status: self.status,
        }
        .write_to(&mut w);
        for field in &self.fields {
            w.put_str(field)?;
        }
        Ok(w.finish())
    }

    pub fn decode_prefix(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let mut r = ByteReader::new(buf);
        let header = Header::read(&mut r)?;
        if header.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }
        let expected = Self::field_count(header.kind)
            .ok_or(ProtocolError::InvalidKind(header.kind as u8))?;
        match (header.kind, header.status) {
            (MessageKind::Error, 0) => return Err(ProtocolError::UnexpectedStatus(0)),
            (MessageKind::Error, _) => {}
            (_, 0) => {}
            (_, status) => return Err(ProtocolError::UnexpectedStatus(status)),
        }
        let mut fields = Vec::with_capacity(expected);
        for _ in 0..expected {
            fields.push(r.read_str()?);
        }
        Ok((
            Self {
                kind: header.kind,
                status: header.status,
                fields,
            },
            r.consumed(),
        ))
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let (response, used) = Self::decode_prefix(buf)?;
        if used != buf.len() {
            return Err(ProtocolError::TrailingBytes(buf.len() - used));
        }
        Ok(response)
    }
}

/// A server-to-client message: either a reply/error, or a write/erase
/// echo broadcast to session participants (which arrives in request
/// form).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Reply(Response),
    Edit(Request),
}

impl Incoming {
    pub fn decode_prefix(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let header = Header::peek(buf)?;
        match header.kind {
            MessageKind::Write | MessageKind::Erase => {
                let (request, used) = Request::decode_prefix(buf)?;
                Ok((Self::Edit(request), used))
            }
            _ => {
                let (response, used) = Response::decode_prefix(buf)?;
                Ok((Self::Reply(response), used))
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let (incoming, used) = Self::decode_prefix(buf)?;
        if used != buf.len() {
            return Err(ProtocolError::TrailingBytes(buf.len() - used));
        }
        Ok(incoming)
    }
}
