//! Minimal protobuf wire codec for the control messages the gateway speaks.
//!
//! Only wire types 0 (varint), 2 (length-delimited), 1 (fixed64, skip-only)
//! and 5 (fixed32, skip-only) occur in this message set. Unknown fields are
//! skipped by wire type so newer servers stay decodable. Signed 32-bit
//! fields are plain sign-extended varints; Mumble does not use zigzag here.

use bytes::{BufMut, Bytes, BytesMut};

use crate::transport::errors::CodecError;

// Control message type ids, as carried in the TLS frame header.
pub const MSG_VERSION: u16 = 0;
pub const MSG_UDP_TUNNEL: u16 = 1;
pub const MSG_AUTHENTICATE: u16 = 2;
pub const MSG_PING: u16 = 3;
pub const MSG_REJECT: u16 = 4;
pub const MSG_SERVER_SYNC: u16 = 5;
pub const MSG_CHANNEL_REMOVE: u16 = 6;
pub const MSG_CHANNEL_STATE: u16 = 7;
pub const MSG_USER_REMOVE: u16 = 8;
pub const MSG_USER_STATE: u16 = 9;
pub const MSG_TEXT_MESSAGE: u16 = 11;
pub const MSG_PERMISSION_DENIED: u16 = 12;
pub const MSG_CRYPT_SETUP: u16 = 15;
pub const MSG_CODEC_VERSION: u16 = 21;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireType {
    Varint,
    Fixed64,
    LengthDelimited,
    Fixed32,
}

impl WireType {
    fn from_raw(raw: u64) -> Result<Self, CodecError> {
        match raw {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::Fixed64),
            2 => Ok(WireType::LengthDelimited),
            5 => Ok(WireType::Fixed32),
            _ => Err(CodecError::Malformed("protobuf wire type")),
        }
    }
}

/// Field-by-field reader over one serialized message.
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Returns the next `(field number, wire type)` key, or `None` at the end
    /// of the message.
    pub fn next_key(&mut self) -> Result<Option<(u32, WireType)>, CodecError> {
        if self.pos == self.data.len() {
            return Ok(None);
        }
        let key = self.varint()?;
        let field = (key >> 3) as u32;
        if field == 0 {
            return Err(CodecError::Malformed("protobuf field number"));
        }
        Ok(Some((field, WireType::from_raw(key & 0x7)?)))
    }

    pub fn varint(&mut self) -> Result<u64, CodecError> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = *self.data.get(self.pos).ok_or(CodecError::Truncated)?;
            self.pos += 1;
            if shift >= 64 {
                return Err(CodecError::Malformed("protobuf varint"));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub fn uint32(&mut self) -> Result<u32, CodecError> {
        Ok(self.varint()? as u32)
    }

    /// Sign-extended 32-bit varint (protobuf `int32`, no zigzag).
    pub fn int32(&mut self) -> Result<i32, CodecError> {
        Ok(self.varint()? as i32)
    }

    pub fn bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.varint()? != 0)
    }

    pub fn bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.varint()? as usize;
        if self.data.len() - self.pos < len {
            return Err(CodecError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn string(&mut self) -> Result<String, CodecError> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::Malformed("protobuf string"))
    }

    /// Reads a repeated uint32 field that may arrive either packed
    /// (length-delimited) or as a single unpacked varint.
    pub fn repeated_uint32(
        &mut self,
        wire: WireType,
        out: &mut Vec<u32>,
    ) -> Result<(), CodecError> {
        match wire {
            WireType::Varint => {
                out.push(self.uint32()?);
                Ok(())
            }
            WireType::LengthDelimited => {
                let packed = self.bytes()?;
                let mut inner = WireReader::new(packed);
                while inner.pos < inner.data.len() {
                    out.push(inner.uint32()?);
                }
                Ok(())
            }
            _ => Err(CodecError::Malformed("repeated uint32 wire type")),
        }
    }

    pub fn skip(&mut self, wire: WireType) -> Result<(), CodecError> {
        match wire {
            WireType::Varint => {
                self.varint()?;
            }
            WireType::Fixed64 => {
                if self.data.len() - self.pos < 8 {
                    return Err(CodecError::Truncated);
                }
                self.pos += 8;
            }
            WireType::LengthDelimited => {
                self.bytes()?;
            }
            WireType::Fixed32 => {
                if self.data.len() - self.pos < 4 {
                    return Err(CodecError::Truncated);
                }
                self.pos += 4;
            }
        }
        Ok(())
    }
}

/// Append-only writer for the outbound message subset.
#[derive(Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(&mut self, field: u32, wire: u8) {
        self.raw_varint((u64::from(field) << 3) | u64::from(wire));
    }

    fn raw_varint(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.put_u8(byte);
                return;
            }
            self.buf.put_u8(byte | 0x80);
        }
    }

    pub fn varint_field(&mut self, field: u32, value: u64) {
        self.key(field, 0);
        self.raw_varint(value);
    }

    pub fn bool_field(&mut self, field: u32, value: bool) {
        self.varint_field(field, u64::from(value));
    }

    pub fn bytes_field(&mut self, field: u32, value: &[u8]) {
        self.key(field, 2);
        self.raw_varint(value.len() as u64);
        self.buf.put_slice(value);
    }

    pub fn string_field(&mut self, field: u32, value: &str) {
        self.bytes_field(field, value.as_bytes());
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Version {
    pub version_v1: Option<u32>,
    pub release: Option<String>,
    pub os: Option<String>,
    pub os_version: Option<String>,
}

impl Version {
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut msg = Self::default();
        let mut r = WireReader::new(data);
        while let Some((field, wire)) = r.next_key()? {
            match (field, wire) {
                (1, WireType::Varint) => msg.version_v1 = Some(r.uint32()?),
                (2, WireType::LengthDelimited) => msg.release = Some(r.string()?),
                (3, WireType::LengthDelimited) => msg.os = Some(r.string()?),
                (4, WireType::LengthDelimited) => msg.os_version = Some(r.string()?),
                _ => r.skip(wire)?,
            }
        }
        Ok(msg)
    }

    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        if let Some(v) = self.version_v1 {
            w.varint_field(1, u64::from(v));
        }
        if let Some(release) = &self.release {
            w.string_field(2, release);
        }
        if let Some(os) = &self.os {
            w.string_field(3, os);
        }
        if let Some(os_version) = &self.os_version {
            w.string_field(4, os_version);
        }
        // Field 5 is the v2 version stamp; the gateway stays silent there to
        // keep the session on legacy voice framing.
        w.finish()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Authenticate {
    pub username: Option<String>,
    pub password: Option<String>,
    pub tokens: Vec<String>,
    pub opus: bool,
    pub client_type: i32,
}

impl Authenticate {
    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        if let Some(username) = &self.username {
            w.string_field(1, username);
        }
        if let Some(password) = &self.password {
            w.string_field(2, password);
        }
        for token in &self.tokens {
            w.string_field(3, token);
        }
        w.bool_field(5, self.opus);
        w.varint_field(6, self.client_type as u64);
        w.finish()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ping {
    pub timestamp: Option<u64>,
}

impl Ping {
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut msg = Self::default();
        let mut r = WireReader::new(data);
        while let Some((field, wire)) = r.next_key()? {
            match (field, wire) {
                (1, WireType::Varint) => msg.timestamp = Some(r.varint()?),
                _ => r.skip(wire)?,
            }
        }
        Ok(msg)
    }

    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        if let Some(timestamp) = self.timestamp {
            w.varint_field(1, timestamp);
        }
        w.finish()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reject {
    pub reject_type: Option<u32>,
    pub reason: Option<String>,
}

impl Reject {
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut msg = Self::default();
        let mut r = WireReader::new(data);
        while let Some((field, wire)) = r.next_key()? {
            match (field, wire) {
                (1, WireType::Varint) => msg.reject_type = Some(r.uint32()?),
                (2, WireType::LengthDelimited) => msg.reason = Some(r.string()?),
                _ => r.skip(wire)?,
            }
        }
        Ok(msg)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerSync {
    pub session: Option<u32>,
    pub max_bandwidth: Option<u32>,
    pub welcome_text: Option<String>,
}

impl ServerSync {
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut msg = Self::default();
        let mut r = WireReader::new(data);
        while let Some((field, wire)) = r.next_key()? {
            match (field, wire) {
                (1, WireType::Varint) => msg.session = Some(r.uint32()?),
                (2, WireType::Varint) => msg.max_bandwidth = Some(r.uint32()?),
                (3, WireType::LengthDelimited) => msg.welcome_text = Some(r.string()?),
                _ => r.skip(wire)?,
            }
        }
        Ok(msg)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelRemove {
    pub channel_id: Option<u32>,
}

impl ChannelRemove {
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut msg = Self::default();
        let mut r = WireReader::new(data);
        while let Some((field, wire)) = r.next_key()? {
            match (field, wire) {
                (1, WireType::Varint) => msg.channel_id = Some(r.uint32()?),
                _ => r.skip(wire)?,
            }
        }
        Ok(msg)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelState {
    pub channel_id: Option<u32>,
    pub parent: Option<u32>,
    pub name: Option<String>,
    pub links: Vec<u32>,
    pub has_links: bool,
    pub description: Option<String>,
    pub links_add: Vec<u32>,
    pub links_remove: Vec<u32>,
    pub position: Option<i32>,
}

impl ChannelState {
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut msg = Self::default();
        let mut r = WireReader::new(data);
        while let Some((field, wire)) = r.next_key()? {
            match (field, wire) {
                (1, WireType::Varint) => msg.channel_id = Some(r.uint32()?),
                (2, WireType::Varint) => msg.parent = Some(r.uint32()?),
                (3, WireType::LengthDelimited) => msg.name = Some(r.string()?),
                (4, _) => {
                    msg.has_links = true;
                    r.repeated_uint32(wire, &mut msg.links)?;
                }
                (5, WireType::LengthDelimited) => msg.description = Some(r.string()?),
                (6, _) => r.repeated_uint32(wire, &mut msg.links_add)?,
                (7, _) => r.repeated_uint32(wire, &mut msg.links_remove)?,
                (9, WireType::Varint) => msg.position = Some(r.int32()?),
                _ => r.skip(wire)?,
            }
        }
        Ok(msg)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserRemove {
    pub session: Option<u32>,
    pub reason: Option<String>,
}

impl UserRemove {
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut msg = Self::default();
        let mut r = WireReader::new(data);
        while let Some((field, wire)) = r.next_key()? {
            match (field, wire) {
                (1, WireType::Varint) => msg.session = Some(r.uint32()?),
                (3, WireType::LengthDelimited) => msg.reason = Some(r.string()?),
                _ => r.skip(wire)?,
            }
        }
        Ok(msg)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserState {
    pub session: Option<u32>,
    pub actor: Option<u32>,
    pub name: Option<String>,
    pub channel_id: Option<u32>,
    pub mute: Option<bool>,
    pub deaf: Option<bool>,
    pub suppress: Option<bool>,
    pub self_mute: Option<bool>,
    pub self_deaf: Option<bool>,
}

impl UserState {
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut msg = Self::default();
        let mut r = WireReader::new(data);
        while let Some((field, wire)) = r.next_key()? {
            match (field, wire) {
                (1, WireType::Varint) => msg.session = Some(r.uint32()?),
                (2, WireType::Varint) => msg.actor = Some(r.uint32()?),
                (3, WireType::LengthDelimited) => msg.name = Some(r.string()?),
                (5, WireType::Varint) => msg.channel_id = Some(r.uint32()?),
                (6, WireType::Varint) => msg.mute = Some(r.bool()?),
                (7, WireType::Varint) => msg.deaf = Some(r.bool()?),
                (8, WireType::Varint) => msg.suppress = Some(r.bool()?),
                (9, WireType::Varint) => msg.self_mute = Some(r.bool()?),
                (10, WireType::Varint) => msg.self_deaf = Some(r.bool()?),
                _ => r.skip(wire)?,
            }
        }
        Ok(msg)
    }

    /// Outbound join: only session (when known) and channel_id are sent.
    pub fn encode_join(session: Option<u32>, channel_id: u32) -> Bytes {
        let mut w = WireWriter::new();
        if let Some(session) = session {
            w.varint_field(1, u64::from(session));
        }
        w.varint_field(5, u64::from(channel_id));
        w.finish()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TextMessage {
    pub actor: Option<u32>,
    pub sessions: Vec<u32>,
    pub channel_ids: Vec<u32>,
    pub tree_ids: Vec<u32>,
    pub message: Option<String>,
}

impl TextMessage {
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut msg = Self::default();
        let mut r = WireReader::new(data);
        while let Some((field, wire)) = r.next_key()? {
            match (field, wire) {
                (1, WireType::Varint) => msg.actor = Some(r.uint32()?),
                (2, _) => r.repeated_uint32(wire, &mut msg.sessions)?,
                (3, _) => r.repeated_uint32(wire, &mut msg.channel_ids)?,
                (4, _) => r.repeated_uint32(wire, &mut msg.tree_ids)?,
                (5, WireType::LengthDelimited) => msg.message = Some(r.string()?),
                _ => r.skip(wire)?,
            }
        }
        Ok(msg)
    }

    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        for session in &self.sessions {
            w.varint_field(2, u64::from(*session));
        }
        for channel_id in &self.channel_ids {
            w.varint_field(3, u64::from(*channel_id));
        }
        for tree_id in &self.tree_ids {
            w.varint_field(4, u64::from(*tree_id));
        }
        if let Some(message) = &self.message {
            w.string_field(5, message);
        }
        w.finish()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PermissionDenied {
    pub permission: Option<u32>,
    pub channel_id: Option<u32>,
    pub session: Option<u32>,
    pub reason: Option<String>,
    pub deny_type: Option<u32>,
    pub name: Option<String>,
}

impl PermissionDenied {
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut msg = Self::default();
        let mut r = WireReader::new(data);
        while let Some((field, wire)) = r.next_key()? {
            match (field, wire) {
                (1, WireType::Varint) => msg.permission = Some(r.uint32()?),
                (2, WireType::Varint) => msg.channel_id = Some(r.uint32()?),
                (3, WireType::Varint) => msg.session = Some(r.uint32()?),
                (4, WireType::LengthDelimited) => msg.reason = Some(r.string()?),
                (5, WireType::Varint) => msg.deny_type = Some(r.uint32()?),
                (6, WireType::LengthDelimited) => msg.name = Some(r.string()?),
                _ => r.skip(wire)?,
            }
        }
        Ok(msg)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CryptSetup {
    pub key: Option<Vec<u8>>,
    pub client_nonce: Option<Vec<u8>>,
    pub server_nonce: Option<Vec<u8>>,
}

impl CryptSetup {
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut msg = Self::default();
        let mut r = WireReader::new(data);
        while let Some((field, wire)) = r.next_key()? {
            match (field, wire) {
                (1, WireType::LengthDelimited) => msg.key = Some(r.bytes()?.to_vec()),
                (2, WireType::LengthDelimited) => msg.client_nonce = Some(r.bytes()?.to_vec()),
                (3, WireType::LengthDelimited) => msg.server_nonce = Some(r.bytes()?.to_vec()),
                _ => r.skip(wire)?,
            }
        }
        Ok(msg)
    }

    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        if let Some(key) = &self.key {
            w.bytes_field(1, key);
        }
        if let Some(client_nonce) = &self.client_nonce {
            w.bytes_field(2, client_nonce);
        }
        if let Some(server_nonce) = &self.server_nonce {
            w.bytes_field(3, server_nonce);
        }
        w.finish()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CodecVersion {
    pub alpha: Option<i32>,
    pub beta: Option<i32>,
    pub prefer_alpha: Option<bool>,
    pub opus: Option<bool>,
}

impl CodecVersion {
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut msg = Self::default();
        let mut r = WireReader::new(data);
        while let Some((field, wire)) = r.next_key()? {
            match (field, wire) {
                (1, WireType::Varint) => msg.alpha = Some(r.int32()?),
                (2, WireType::Varint) => msg.beta = Some(r.int32()?),
                (3, WireType::Varint) => msg.prefer_alpha = Some(r.bool()?),
                (4, WireType::Varint) => msg.opus = Some(r.bool()?),
                _ => r.skip(wire)?,
            }
        }
        Ok(msg)
    }
}
