use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, Result};

use super::protocol::*;

/// One MySQL frame: 3-byte little-endian length, 1-byte sequence id,
/// payload.
#[derive(Debug, Clone)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: Bytes) -> Self {
        Self {
            sequence_id,
            payload,
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(4 + self.payload.len());
        let len = self.payload.len() as u32;
        buf.put_u8((len & 0xff) as u8);
        buf.put_u8(((len >> 8) & 0xff) as u8);
        buf.put_u8(((len >> 16) & 0xff) as u8);
        buf.put_u8(self.sequence_id);
        buf.put_slice(&self.payload);
        buf
    }

    /// Pulls one frame out of `buf` if a complete one is buffered.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = (buf[0] as usize) | ((buf[1] as usize) << 8) | ((buf[2] as usize) << 16);
        let sequence_id = buf[3];
        if buf.len() < 4 + len {
            return Ok(None);
        }
        buf.advance(4);
        let payload = buf.split_to(len).freeze();
        Ok(Some(Packet {
            sequence_id,
            payload,
        }))
    }
}

/// Framed packet transport over any async byte stream. Owns the read
/// buffer and the per-direction sequence counter; the counter is reset at
/// each command boundary by the session driving it.
pub struct PacketStream<S> {
    stream: S,
    read_buf: BytesMut,
    pub sequence_id: u8,
}

impl<S: AsyncRead + AsyncWrite + Unpin> PacketStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(8192),
            sequence_id: 0,
        }
    }

    pub fn reset_sequence(&mut self) {
        self.sequence_id = 0;
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Reads one frame, advancing the expected sequence id.
    pub async fn read_frame(&mut self) -> Result<Packet> {
        loop {
            if let Some(packet) = Packet::decode(&mut self.read_buf)? {
                self.sequence_id = packet.sequence_id.wrapping_add(1);
                return Ok(packet);
            }
            let mut chunk = [0u8; 8192];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ProxyError::ConnectionClosed);
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Reads a full payload, joining continuation frames. A frame of
    /// exactly MAX_PAYLOAD_LEN is by definition followed by another frame
    /// (possibly empty) belonging to the same payload.
    pub async fn read_payload(&mut self) -> Result<Bytes> {
        let first = self.read_frame().await?;
        if first.payload.len() < MAX_PAYLOAD_LEN {
            return Ok(first.payload);
        }
        let mut joined = BytesMut::from(&first.payload[..]);
        loop {
            let next = self.read_frame().await?;
            let done = next.payload.len() < MAX_PAYLOAD_LEN;
            joined.extend_from_slice(&next.payload);
            if done {
                return Ok(joined.freeze());
            }
        }
    }

    /// Writes a payload, splitting it into max-size frames with
    /// incrementing sequence ids. A payload that is an exact multiple of
    /// the frame limit gets a trailing empty frame so the peer can detect
    /// the end.
    pub async fn write_payload(&mut self, payload: &[u8]) -> Result<()> {
        let mut rest = payload;
        loop {
            let take = rest.len().min(MAX_PAYLOAD_LEN);
            let (chunk, tail) = rest.split_at(take);
            let packet = Packet::new(self.sequence_id, Bytes::copy_from_slice(chunk));
            self.stream.write_all(&packet.encode()).await?;
            self.sequence_id = self.sequence_id.wrapping_add(1);
            rest = tail;
            if take < MAX_PAYLOAD_LEN {
                break;
            }
            // fall through: either more data, or an empty continuation
            if rest.is_empty() {
                let terminator = Packet::new(self.sequence_id, Bytes::new());
                self.stream.write_all(&terminator.encode()).await?;
                self.sequence_id = self.sequence_id.wrapping_add(1);
                break;
            }
        }
        self.stream.flush().await?;
        Ok(())
    }
}

/// Initial handshake the proxy sends to connecting clients (protocol v10).
pub struct HandshakePacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_plugin_data: Vec<u8>,
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_name: String,
}

impl HandshakePacket {
    pub fn new(connection_id: u32, server_version: &str) -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        // 20-byte nonce, avoiding NUL so the split parts stay
        // null-terminatable
        let auth_plugin_data: Vec<u8> = (0..20).map(|_| rng.gen_range(1..=255u8)).collect();

        Self {
            protocol_version: PROTOCOL_VERSION,
            server_version: server_version.to_string(),
            connection_id,
            auth_plugin_data,
            capability_flags: server_capabilities(),
            character_set: UTF8_GENERAL_CI,
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            auth_plugin_name: MYSQL_NATIVE_PASSWORD.to_string(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.protocol_version);
        write_null_terminated_str(&mut buf, &self.server_version);
        buf.put_u32_le(self.connection_id);
        // auth-plugin-data part 1
        buf.put_slice(&self.auth_plugin_data[0..8]);
        buf.put_u8(0); // filler
        buf.put_u16_le((self.capability_flags & 0xffff) as u16);
        buf.put_u8(self.character_set);
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le(((self.capability_flags >> 16) & 0xffff) as u16);
        // declared length covers both parts plus the trailing NUL
        buf.put_u8(self.auth_plugin_data.len() as u8 + 1);
        buf.put_bytes(0, 10); // reserved
        buf.put_slice(&self.auth_plugin_data[8..20]);
        buf.put_u8(0);
        write_null_terminated_str(&mut buf, &self.auth_plugin_name);
        buf.freeze()
    }

    pub fn nonce(&self) -> &[u8] {
        &self.auth_plugin_data
    }
}

/// Client's reply to the initial handshake (HandshakeResponse41).
#[derive(Debug)]
pub struct HandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: Option<String>,
}

impl HandshakeResponse {
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.len() < 32 {
            return Err(ProxyError::ProtocolFraming(
                "handshake response too short".to_string(),
            ));
        }

        let capability_flags = payload.get_u32_le();
        let max_packet_size = payload.get_u32_le();
        let character_set = payload.get_u8();
        payload.advance(23); // reserved

        let username = read_null_terminated_string(&mut payload)
            .ok_or_else(|| ProxyError::ProtocolFraming("handshake response has no username".to_string()))?;

        let auth_response = if capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            let len = read_lenenc_int(&mut payload).ok_or_else(|| {
                ProxyError::ProtocolFraming("handshake response has no auth length".to_string())
            })? as usize;
            if payload.remaining() < len {
                return Err(ProxyError::ProtocolFraming(
                    "handshake response auth data truncated".to_string(),
                ));
            }
            payload.copy_to_bytes(len).to_vec()
        } else if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = payload.get_u8() as usize;
            if payload.remaining() < len {
                return Err(ProxyError::ProtocolFraming(
                    "handshake response auth data truncated".to_string(),
                ));
            }
            payload.copy_to_bytes(len).to_vec()
        } else {
            read_null_terminated_string(&mut payload)
                .ok_or_else(|| {
                    ProxyError::ProtocolFraming("handshake response has no auth data".to_string())
                })?
                .into_bytes()
        };

        let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            read_null_terminated_string(&mut payload).filter(|db| !db.is_empty())
        } else {
            None
        };

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            read_null_terminated_string(&mut payload)
        } else {
            None
        };

        Ok(Self {
            capability_flags,
            max_packet_size,
            character_set,
            username,
            auth_response,
            database,
            auth_plugin_name,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

impl OkPacket {
    pub fn new(status_flags: u16) -> Self {
        Self {
            status_flags,
            ..Default::default()
        }
    }

    pub fn encode(&self) -> Bytes {
        self.encode_with_header(OK_PACKET)
    }

    /// OK with a 0xFE header, replacing EOF when CLIENT_DEPRECATE_EOF is
    /// negotiated.
    pub fn encode_as_eof(&self) -> Bytes {
        self.encode_with_header(EOF_PACKET)
    }

    fn encode_with_header(&self, header: u8) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(header);
        write_lenenc_int(&mut buf, self.affected_rows);
        write_lenenc_int(&mut buf, self.last_insert_id);
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le(self.warnings);
        if !self.info.is_empty() {
            buf.put_slice(self.info.as_bytes());
        }
        buf.freeze()
    }

    /// Parses an OK payload (header byte already verified by the caller).
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        payload.advance(1);
        let affected_rows = read_lenenc_int(&mut payload)
            .ok_or_else(|| ProxyError::ProtocolFraming("OK packet has no affected rows".to_string()))?;
        let last_insert_id = read_lenenc_int(&mut payload)
            .ok_or_else(|| ProxyError::ProtocolFraming("OK packet has no insert id".to_string()))?;
        let (status_flags, warnings) = if payload.remaining() >= 4 {
            (payload.get_u16_le(), payload.get_u16_le())
        } else {
            (0, 0)
        };
        Ok(Self {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info: read_string_to_end(&mut payload),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: String) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(ERR_PACKET);
        buf.put_u16_le(self.error_code);
        buf.put_u8(b'#');
        buf.put_slice(self.sql_state.as_bytes());
        buf.put_slice(self.error_message.as_bytes());
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.len() < 3 {
            return Err(ProxyError::ProtocolFraming("ERR packet too short".to_string()));
        }
        payload.advance(1);
        let error_code = payload.get_u16_le();
        let mut sql_state = String::from("HY000");
        if payload.remaining() >= 6 && payload[0] == b'#' {
            payload.advance(1);
            let raw = payload.copy_to_bytes(5);
            sql_state = String::from_utf8_lossy(&raw).to_string();
        }
        let error_message = read_string_to_end(&mut payload);
        Ok(Self {
            error_code,
            sql_state,
            error_message,
        })
    }

    pub fn to_error(&self) -> ProxyError {
        ProxyError::Sql {
            code: self.error_code,
            state: self.sql_state.clone(),
            message: self.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofPacket {
    pub fn new(status_flags: u16) -> Self {
        Self {
            warnings: 0,
            status_flags,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(EOF_PACKET);
        buf.put_u16_le(self.warnings);
        buf.put_u16_le(self.status_flags);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        payload.advance(1);
        let (warnings, status_flags) = if payload.remaining() >= 4 {
            (payload.get_u16_le(), payload.get_u16_le())
        } else {
            (0, 0)
        };
        Ok(Self {
            warnings,
            status_flags,
        })
    }
}

/// Serializes a column descriptor in the fixed "def" layout, appending
/// the default value when the descriptor carries one (COM_FIELD_LIST).
pub fn encode_column_definition(field: &super::rows::Field) -> Bytes {
    let mut buf = BytesMut::new();
    write_lenenc_str(&mut buf, "def");
    write_lenenc_str(&mut buf, &field.database);
    write_lenenc_str(&mut buf, &field.table);
    write_lenenc_str(&mut buf, &field.org_table);
    write_lenenc_str(&mut buf, &field.name);
    write_lenenc_str(&mut buf, &field.org_name);
    write_lenenc_int(&mut buf, 0x0c);
    buf.put_u16_le(field.charset);
    buf.put_u32_le(field.column_length);
    buf.put_u8(field.field_type as u8);
    buf.put_u16_le(field.flags);
    buf.put_u8(field.decimals);
    buf.put_u16_le(0); // filler
    if let Some(default) = &field.default_value {
        write_lenenc_bytes(&mut buf, default);
    }
    buf.freeze()
}

/// True when a 0xFE-headed payload is a real EOF packet rather than a
/// length-encoded integer or an OK-as-EOF.
pub fn is_eof_packet(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == EOF_PACKET && payload.len() < 9
}

pub fn is_ok_packet(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == OK_PACKET
}

pub fn is_err_packet(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == ERR_PACKET
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_round_trip() {
        let packet = Packet::new(3, Bytes::from_static(b"\x03SELECT 1"));
        let mut encoded = packet.encode();
        let decoded = Packet::decode(&mut encoded).unwrap().unwrap();
        assert_eq!(decoded.sequence_id, 3);
        assert_eq!(&decoded.payload[..], b"\x03SELECT 1");
        assert!(encoded.is_empty());
    }

    #[test]
    fn packet_decode_waits_for_full_frame() {
        let mut buf = BytesMut::from(&[5u8, 0, 0, 0, 1, 2][..]);
        assert!(Packet::decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&[3, 4, 5]);
        let packet = Packet::decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.payload.len(), 5);
    }

    #[tokio::test]
    async fn max_payload_gets_empty_continuation() {
        let (client, server) = tokio::io::duplex(1 << 26);
        let mut writer = PacketStream::new(client);
        let payload = vec![0xaau8; MAX_PAYLOAD_LEN];
        writer.write_payload(&payload).await.unwrap();
        drop(writer);

        let mut reader = PacketStream::new(server);
        let first = reader.read_frame().await.unwrap();
        assert_eq!(first.payload.len(), MAX_PAYLOAD_LEN);
        assert_eq!(first.sequence_id, 0);
        let second = reader.read_frame().await.unwrap();
        assert_eq!(second.payload.len(), 0);
        assert_eq!(second.sequence_id, 1);
    }

    #[tokio::test]
    async fn oversize_payload_joins_on_read() {
        let (client, server) = tokio::io::duplex(1 << 26);
        let mut writer = PacketStream::new(client);
        let payload = vec![0x55u8; MAX_PAYLOAD_LEN + 10];
        writer.write_payload(&payload).await.unwrap();
        drop(writer);

        let mut reader = PacketStream::new(server);
        let joined = reader.read_payload().await.unwrap();
        assert_eq!(joined.len(), MAX_PAYLOAD_LEN + 10);
    }

    #[test]
    fn ok_packet_round_trip() {
        let mut ok = OkPacket::new(SERVER_STATUS_AUTOCOMMIT);
        ok.affected_rows = 3;
        ok.last_insert_id = 7;
        let decoded = OkPacket::decode(ok.encode()).unwrap();
        assert_eq!(decoded.affected_rows, 3);
        assert_eq!(decoded.last_insert_id, 7);
        assert_eq!(decoded.status_flags, SERVER_STATUS_AUTOCOMMIT);
    }

    #[test]
    fn err_packet_round_trip() {
        let err = ErrPacket::new(1064, "42000", "bad syntax".to_string());
        let decoded = ErrPacket::decode(err.encode()).unwrap();
        assert_eq!(decoded.error_code, 1064);
        assert_eq!(decoded.sql_state, "42000");
        assert_eq!(decoded.error_message, "bad syntax");
    }

    #[test]
    fn eof_detection_respects_length_bound() {
        assert!(is_eof_packet(&[0xfe, 0, 0, 2, 0]));
        // 9+ bytes starting with 0xfe is a lenenc integer, not EOF
        assert!(!is_eof_packet(&[0xfe, 0, 0, 0, 0, 0, 0, 0, 0, 1]));
    }

    #[test]
    fn handshake_packet_layout() {
        let hs = HandshakePacket::new(42, "5.7.99-proxy");
        let encoded = hs.encode();
        assert_eq!(encoded[0], PROTOCOL_VERSION);
        // server version is null-terminated right after the version byte
        let nul = encoded[1..].iter().position(|&b| b == 0).unwrap() + 1;
        assert_eq!(&encoded[1..nul], b"5.7.99-proxy");
        let conn_id = u32::from_le_bytes([
            encoded[nul + 1],
            encoded[nul + 2],
            encoded[nul + 3],
            encoded[nul + 4],
        ]);
        assert_eq!(conn_id, 42);
        assert_eq!(hs.nonce().len(), 20);
    }

    #[test]
    fn handshake_response_with_lenenc_auth() {
        let mut buf = BytesMut::new();
        let caps = CLIENT_PROTOCOL_41
            | CLIENT_SECURE_CONNECTION
            | CLIENT_PLUGIN_AUTH
            | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
            | CLIENT_CONNECT_WITH_DB;
        buf.put_u32_le(caps);
        buf.put_u32_le(1 << 24);
        buf.put_u8(UTF8_GENERAL_CI);
        buf.put_bytes(0, 23);
        write_null_terminated_str(&mut buf, "admin");
        write_lenenc_bytes(&mut buf, &[1, 2, 3]);
        write_null_terminated_str(&mut buf, "demo");
        write_null_terminated_str(&mut buf, MYSQL_NATIVE_PASSWORD);

        let resp = HandshakeResponse::decode(buf.freeze()).unwrap();
        assert_eq!(resp.username, "admin");
        assert_eq!(resp.auth_response, vec![1, 2, 3]);
        assert_eq!(resp.database.as_deref(), Some("demo"));
        assert_eq!(resp.auth_plugin_name.as_deref(), Some(MYSQL_NATIVE_PASSWORD));
    }
}
