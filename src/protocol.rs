//! Minimal game protocol codec
//!
//! Only the handful of packets the gate needs are implemented:
//! - Handshake (client → server, id 0x00)
//! - Status request / response and ping / pong
//! - Login start (client → server) and login disconnect (server → client)
//!
//! Frames are `VarInt length | VarInt packet id | body`. Compression and
//! encryption are never negotiated, so frames stay in this plain form for the
//! whole intercepted exchange.

use crate::error::{ProtocolErrorKind, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Largest frame accepted from an intercepted client
pub const MAX_CLIENT_FRAME: usize = 32 * 1024;

/// Largest status response accepted from the backend (favicons are large)
pub const MAX_STATUS_FRAME: usize = 2 * 1024 * 1024;

/// Protocol number advertised in synthetic responses. No real client speaks
/// it, so clients render the version name as an error instead of joining.
pub const UNSUPPORTED_PROTOCOL: i32 = 1;

/// Protocol number sent by the health probe. Servers answer status queries
/// for any version; -1 is the conventional "just asking" value.
pub const PROBE_PROTOCOL: i32 = -1;

const MAX_USERNAME_LEN: usize = 16 * 4;
const MAX_ADDRESS_LEN: usize = 255 * 4;

const HANDSHAKE_ID: i32 = 0x00;
const STATUS_REQUEST_ID: i32 = 0x00;
const STATUS_RESPONSE_ID: i32 = 0x00;
const PING_ID: i32 = 0x01;
const LOGIN_START_ID: i32 = 0x00;
const LOGIN_DISCONNECT_ID: i32 = 0x00;

/// A decoded frame: packet id plus the remaining body bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub body: Vec<u8>,
}

/// Append a VarInt to `buf`
pub fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut v = value as u32;
    loop {
        if v & !0x7F == 0 {
            buf.push(v as u8);
            return;
        }
        buf.push(((v & 0x7F) | 0x80) as u8);
        v >>= 7;
    }
}

/// Cursor over a packet body
pub struct PacketReader<'a> {
    buf: &'a [u8],
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(ProtocolErrorKind::Truncated.into());
        }
        let buf: &'a [u8] = self.buf;
        let (head, tail) = buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_varint(&mut self) -> Result<i32> {
        let mut value: u32 = 0;
        for i in 0..5 {
            let byte = self.read_u8()?;
            value |= ((byte & 0x7F) as u32) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value as i32);
            }
        }
        Err(ProtocolErrorKind::VarIntTooLong.into())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(raw))
    }

    pub fn read_uuid(&mut self) -> Result<Uuid> {
        let bytes = self.take(16)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(bytes);
        Ok(Uuid::from_bytes(raw))
    }

    /// Length-prefixed byte array
    pub fn read_byte_array(&mut self, limit: usize) -> Result<&'a [u8]> {
        let len = self.read_varint()?;
        if len < 0 {
            return Err(ProtocolErrorKind::NegativeLength.into());
        }
        let len = len as usize;
        if len > limit {
            return Err(ProtocolErrorKind::StringTooLong { len, limit }.into());
        }
        self.take(len)
    }

    /// VarInt-prefixed UTF-8 string of at most `limit` bytes
    pub fn read_string(&mut self, limit: usize) -> Result<String> {
        let bytes = self.read_byte_array(limit)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolErrorKind::InvalidUtf8.into())
    }
}

/// Builder for a packet body
#[derive(Default)]
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn varint(mut self, value: i32) -> Self {
        write_varint(&mut self.buf, value);
        self
    }

    pub fn u16(mut self, value: u16) -> Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn i64(mut self, value: i64) -> Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn string(mut self, value: &str) -> Self {
        write_varint(&mut self.buf, value.len() as i32);
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    /// Wrap the body as a length-prefixed frame with the given packet id
    pub fn frame(self, id: i32) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.buf.len() + 5);
        write_varint(&mut payload, id);
        payload.extend_from_slice(&self.buf);

        let mut frame = Vec::with_capacity(payload.len() + 5);
        write_varint(&mut frame, payload.len() as i32);
        frame.extend_from_slice(&payload);
        frame
    }
}

async fn read_varint_async<R>(reader: &mut R) -> Result<i32>
where
    R: AsyncRead + Unpin,
{
    let mut value: u32 = 0;
    for i in 0..5 {
        let byte = reader.read_u8().await?;
        value |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(ProtocolErrorKind::VarIntTooLong.into())
}

/// Read one frame, rejecting anything larger than `limit`
pub async fn read_packet<R>(reader: &mut R, limit: usize) -> Result<Packet>
where
    R: AsyncRead + Unpin,
{
    let len = read_varint_async(reader).await?;
    if len <= 0 {
        return Err(ProtocolErrorKind::NegativeLength.into());
    }
    let len = len as usize;
    if len > limit {
        return Err(ProtocolErrorKind::FrameTooLarge { len, limit }.into());
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let mut cursor = PacketReader::new(&payload);
    let id = cursor.read_varint()?;
    let consumed = len - cursor.remaining();
    Ok(Packet {
        id,
        body: payload[consumed..].to_vec(),
    })
}

/// Requested phase after the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    Status,
    Login,
    /// Transfer from another server; treated like a login
    Transfer,
}

impl NextState {
    fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            1 => Ok(NextState::Status),
            2 => Ok(NextState::Login),
            3 => Ok(NextState::Transfer),
            other => Err(ProtocolErrorKind::UnknownNextState(other).into()),
        }
    }

    fn as_raw(self) -> i32 {
        match self {
            NextState::Status => 1,
            NextState::Login => 2,
            NextState::Transfer => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: NextState,
}

impl Handshake {
    pub fn decode(packet: &Packet) -> Result<Self> {
        if packet.id != HANDSHAKE_ID {
            return Err(ProtocolErrorKind::UnexpectedPacket {
                id: packet.id,
                phase: "handshake",
            }
            .into());
        }
        let mut r = PacketReader::new(&packet.body);
        Ok(Self {
            protocol_version: r.read_varint()?,
            server_address: r.read_string(MAX_ADDRESS_LEN)?,
            server_port: r.read_u16()?,
            next_state: NextState::from_raw(r.read_varint()?)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        PacketWriter::new()
            .varint(self.protocol_version)
            .string(&self.server_address)
            .u16(self.server_port)
            .varint(self.next_state.as_raw())
            .frame(HANDSHAKE_ID)
    }
}

/// Login start as sent by the client. The trailing fields changed across
/// protocol versions, so the uuid is read best effort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginStart {
    pub name: String,
    pub uuid: Option<Uuid>,
}

impl LoginStart {
    pub fn decode(packet: &Packet, protocol_version: i32) -> Result<Self> {
        if packet.id != LOGIN_START_ID {
            return Err(ProtocolErrorKind::UnexpectedPacket {
                id: packet.id,
                phase: "login",
            }
            .into());
        }
        let mut r = PacketReader::new(&packet.body);
        let name = r.read_string(MAX_USERNAME_LEN)?;
        let uuid = read_login_uuid(&mut r, protocol_version).ok().flatten();
        Ok(Self { name, uuid })
    }

    /// Encoded in the current (1.20.2+) layout
    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::new().string(&self.name);
        if let Some(uuid) = self.uuid {
            w.buf.extend_from_slice(uuid.as_bytes());
        }
        w.frame(LOGIN_START_ID)
    }
}

fn read_login_uuid(r: &mut PacketReader<'_>, protocol_version: i32) -> Result<Option<Uuid>> {
    match protocol_version {
        v if v >= 764 => r.read_uuid().map(Some),
        761..=763 => {
            if r.read_bool()? {
                r.read_uuid().map(Some)
            } else {
                Ok(None)
            }
        }
        759..=760 => {
            if r.read_bool()? {
                // signature data: timestamp, public key, signature
                r.read_i64()?;
                r.read_byte_array(MAX_CLIENT_FRAME)?;
                r.read_byte_array(MAX_CLIENT_FRAME)?;
            }
            if r.read_bool()? {
                r.read_uuid().map(Some)
            } else {
                Ok(None)
            }
        }
        _ => Ok(None),
    }
}

/// Version banner of a status response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StatusVersion {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub protocol: i32,
}

/// Player counts of a status response. `extra` keeps `sample` and anything
/// else the backend sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StatusPlayers {
    #[serde(default)]
    pub max: i64,
    #[serde(default)]
    pub online: i64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Server list status response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub version: StatusVersion,
    #[serde(default)]
    pub players: StatusPlayers,
    #[serde(default = "empty_description")]
    pub description: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn empty_description() -> Value {
    text_component("")
}

impl StatusResponse {
    /// A bare response carrying only a version banner and description text
    pub fn synthetic(version_name: &str, text: &str) -> Self {
        Self {
            version: StatusVersion {
                name: version_name.to_string(),
                protocol: UNSUPPORTED_PROTOCOL,
            },
            players: StatusPlayers::default(),
            description: text_component(text),
            favicon: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Online player count, clamped to zero
    pub fn online_players(&self) -> u32 {
        u32::try_from(self.players.online).unwrap_or(0)
    }

    /// Plain text of the description, whether sent as a string or component
    pub fn description_text(&self) -> String {
        match &self.description {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            _ => String::new(),
        }
    }
}

/// JSON text component with a single text node
pub fn text_component(text: &str) -> Value {
    serde_json::json!({ "text": text })
}

/// Write a status response packet
pub async fn write_status_response<W>(writer: &mut W, response: &StatusResponse) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_string(response)?;
    let frame = PacketWriter::new().string(&json).frame(STATUS_RESPONSE_ID);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Echo a ping payload back to the client
pub async fn write_pong<W>(writer: &mut W, payload: i64) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = PacketWriter::new().i64(payload).frame(PING_ID);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// End a login with a visible message
pub async fn write_login_disconnect<W>(writer: &mut W, message: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reason = text_component(message).to_string();
    let frame = PacketWriter::new().string(&reason).frame(LOGIN_DISCONNECT_ID);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Decode a status request (empty body) or report what arrived instead
pub fn expect_status_request(packet: &Packet) -> Result<()> {
    if packet.id != STATUS_REQUEST_ID {
        return Err(ProtocolErrorKind::UnexpectedPacket {
            id: packet.id,
            phase: "status",
        }
        .into());
    }
    Ok(())
}

/// Decode a ping packet's payload
pub fn decode_ping(packet: &Packet) -> Result<i64> {
    if packet.id != PING_ID {
        return Err(ProtocolErrorKind::UnexpectedPacket {
            id: packet.id,
            phase: "ping",
        }
        .into());
    }
    PacketReader::new(&packet.body).read_i64()
}

/// Client-side status request frame
pub fn encode_status_request() -> Vec<u8> {
    PacketWriter::new().frame(STATUS_REQUEST_ID)
}

/// Client-side ping frame
pub fn encode_ping(payload: i64) -> Vec<u8> {
    PacketWriter::new().i64(payload).frame(PING_ID)
}

/// Extract the plain text of a login disconnect sent by a server
pub fn decode_login_disconnect(packet: &Packet) -> Result<String> {
    if packet.id != LOGIN_DISCONNECT_ID {
        return Err(ProtocolErrorKind::UnexpectedPacket {
            id: packet.id,
            phase: "login",
        }
        .into());
    }
    let raw = PacketReader::new(&packet.body).read_string(MAX_CLIENT_FRAME)?;
    let reason: Value = serde_json::from_str(&raw)?;
    Ok(match reason {
        Value::String(text) => text,
        other => other
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

/// Decode a status response sent by a server
pub fn decode_status_response(packet: &Packet) -> Result<StatusResponse> {
    if packet.id != STATUS_RESPONSE_ID {
        return Err(ProtocolErrorKind::UnexpectedPacket {
            id: packet.id,
            phase: "status",
        }
        .into());
    }
    let json = PacketReader::new(&packet.body).read_string(MAX_STATUS_FRAME)?;
    Ok(serde_json::from_str(&json)?)
}

/// Perform a full status query as a client: handshake, status request, read
/// the response. The stream is left open for the caller to drop.
pub async fn query_status<S>(stream: &mut S, host: &str, port: u16) -> Result<StatusResponse>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handshake = Handshake {
        protocol_version: PROBE_PROTOCOL,
        server_address: host.to_string(),
        server_port: port,
        next_state: NextState::Status,
    };
    stream.write_all(&handshake.encode()).await?;
    stream.write_all(&encode_status_request()).await?;
    stream.flush().await?;

    let packet = read_packet(stream, MAX_STATUS_FRAME).await?;
    decode_status_response(&packet)
}
