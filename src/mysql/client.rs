use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

use crate::error::{HandshakeError, ProxyError, Result};
use crate::runtime::WriteResult;

use super::auth::scramble_auth_response;
use super::dsn::DsnConfig;
use super::packet::{
    is_eof_packet, is_err_packet, is_ok_packet, ErrPacket, OkPacket, PacketStream,
};
use super::protocol::*;
use super::rows::{Field, ResultSet, TextRow};

/// Either transport a DSN can name.
pub enum NetStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for NetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            NetStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            NetStream::Tcp(s) => Pin::new(s).poll_write(cx, data),
            NetStream::Unix(s) => Pin::new(s).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            NetStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            NetStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Parsed fields of a server's initial handshake, validated strictly in
/// wire order. Each missing field maps to its own `HandshakeError`.
pub fn parse_initial_handshake(data: &[u8]) -> std::result::Result<(u32, Vec<u8>, String), HandshakeError> {
    if data.first() == Some(&ERR_PACKET) {
        // server refused before the handshake proper
        let code = if data.len() >= 3 {
            u16::from_le_bytes([data[1], data[2]])
        } else {
            0
        };
        let message = String::from_utf8_lossy(data.get(3..).unwrap_or(&[])).to_string();
        return Err(HandshakeError::ImmediateServerError { code, message });
    }

    match data.first() {
        Some(&PROTOCOL_VERSION) => {}
        Some(&other) => return Err(HandshakeError::UnsupportedProtocol(other)),
        None => return Err(HandshakeError::UnsupportedProtocol(0)),
    }
    let mut pos = 1;

    // null-terminated server version
    let nul = data[pos..]
        .iter()
        .position(|&b| b == 0)
        .ok_or(HandshakeError::NoServerVersion)?;
    pos += nul + 1;

    if data.len() < pos + 4 {
        return Err(HandshakeError::NoConnectionId);
    }
    pos += 4;

    if data.len() < pos + 8 {
        return Err(HandshakeError::NoAuthPart1);
    }
    let mut auth_data = data[pos..pos + 8].to_vec();
    pos += 8;

    if data.len() < pos + 1 {
        return Err(HandshakeError::NoFiller);
    }
    pos += 1;

    if data.len() < pos + 2 {
        return Err(HandshakeError::NoCapabilityLower);
    }
    let mut capabilities = u16::from_le_bytes([data[pos], data[pos + 1]]) as u32;
    pos += 2;

    if pos == data.len() {
        // short greeting: lower capability bytes are all the server sent
        return Ok((capabilities, auth_data, MYSQL_NATIVE_PASSWORD.to_string()));
    }

    if data.len() < pos + 1 {
        return Err(HandshakeError::NoCharset);
    }
    pos += 1;

    if data.len() < pos + 2 {
        return Err(HandshakeError::NoStatusFlags);
    }
    pos += 2;

    if data.len() < pos + 2 {
        return Err(HandshakeError::NoCapabilityUpper);
    }
    capabilities |= (u16::from_le_bytes([data[pos], data[pos + 1]]) as u32) << 16;
    pos += 2;

    if data.len() < pos + 1 {
        return Err(HandshakeError::NoAuthDataLength);
    }
    let auth_data_len = data[pos] as usize;
    pos += 1;

    // 10 reserved bytes; servers that stop here declared no more fields
    pos += 10;

    if capabilities & CLIENT_SECURE_CONNECTION != 0 {
        // part 2 carries the declared length minus part 1 minus the NUL
        let part2_len = auth_data_len.saturating_sub(8).saturating_sub(1);
        if data.len() < pos + part2_len {
            return Err(HandshakeError::NoAuthPart2);
        }
        auth_data.extend_from_slice(&data[pos..pos + part2_len]);
        pos += part2_len;
        // trailing NUL is not part of the nonce
        if data.get(pos) == Some(&0) {
            pos += 1;
        }
    }

    let plugin = if capabilities & CLIENT_PLUGIN_AUTH != 0 {
        if data.len() <= pos {
            return Err(HandshakeError::NoPluginName);
        }
        let end = data[pos..]
            .iter()
            .position(|&b| b == 0)
            .map(|i| pos + i)
            .unwrap_or(data.len());
        let name = String::from_utf8_lossy(&data[pos..end]).to_string();
        if name.is_empty() {
            MYSQL_NATIVE_PASSWORD.to_string()
        } else {
            name
        }
    } else {
        MYSQL_NATIVE_PASSWORD.to_string()
    };

    Ok((capabilities, auth_data, plugin))
}

/// Outcome of the first response packet of a text query.
pub enum QueryOutcome {
    Ok(WriteResult),
    ResultSet(Arc<ResultSet>),
}

/// Prepared-statement handle on a backend connection.
#[derive(Debug, Clone, Copy)]
pub struct BackendStatement {
    pub statement_id: u32,
    pub column_count: u16,
    pub param_count: u16,
}

/// One authenticated connection to a physical MySQL backend. Created via
/// `BackendConnection::connect`; poisoned by any framing error.
pub struct BackendConnection {
    conf: Arc<DsnConfig>,
    stream: PacketStream<NetStream>,
    pub capabilities: u32,
    pub status_flags: u16,
    current_db: String,
    broken: bool,
}

impl BackendConnection {
    pub async fn connect(conf: Arc<DsnConfig>) -> Result<Self> {
        let net = match conf.net.as_str() {
            "tcp" => NetStream::Tcp(TcpStream::connect(&conf.addr).await?),
            "unix" => NetStream::Unix(UnixStream::connect(&conf.addr).await?),
            other => return Err(ProxyError::DsnParse(format!("unknown network {:?}", other))),
        };

        let mut conn = Self {
            current_db: conf.db_name.clone(),
            conf,
            stream: PacketStream::new(net),
            capabilities: 0,
            status_flags: 0,
            broken: false,
        };
        conn.handshake().await?;
        Ok(conn)
    }

    async fn handshake(&mut self) -> Result<()> {
        let greeting = self.stream.read_payload().await?;
        let (server_caps, auth_data, plugin) = parse_initial_handshake(&greeting)?;

        let required = required_backend_capabilities();
        if server_caps & required != required {
            return Err(ProxyError::Auth(format!(
                "backend lacks required capabilities: has {:08x}, needs {:08x}",
                server_caps, required
            )));
        }
        self.capabilities = server_caps & required;

        let auth_response =
            scramble_auth_response(self.conf.passwd.as_bytes(), &auth_data, &plugin);
        self.write_handshake_response_41(&auth_response, &plugin)
            .await?;
        self.read_auth_result().await?;
        self.stream.reset_sequence();
        debug!(addr = %self.conf.addr, "backend connection authenticated");
        Ok(())
    }

    /// HandshakeResponse41: capability flags, max packet, charset, 23
    /// zero bytes, username, length-encoded auth response, database when
    /// CONNECT_WITH_DB, plugin name.
    async fn write_handshake_response_41(
        &mut self,
        auth_response: &[u8],
        plugin: &str,
    ) -> Result<()> {
        let mut caps = required_backend_capabilities();
        if self.conf.db_name.is_empty() {
            caps &= !CLIENT_CONNECT_WITH_DB;
        }

        let mut buf = BytesMut::new();
        buf.put_u32_le(caps);
        buf.put_u32_le(self.conf.max_allowed_packet.unwrap_or(1 << 24) as u32);
        buf.put_u8(UTF8_GENERAL_CI);
        buf.put_bytes(0, 23);
        write_null_terminated_str(&mut buf, &self.conf.user);
        write_lenenc_bytes(&mut buf, auth_response);
        if caps & CLIENT_CONNECT_WITH_DB != 0 {
            write_null_terminated_str(&mut buf, &self.conf.db_name);
        }
        write_null_terminated_str(&mut buf, plugin);

        self.stream.write_payload(&buf).await
    }

    /// Drives the post-response auth conversation: OK, ERR, auth-switch
    /// (0xFE) or caching_sha2 continuation (0x01).
    async fn read_auth_result(&mut self) -> Result<()> {
        loop {
            let payload = self.stream.read_payload().await?;
            match payload.first() {
                Some(&OK_PACKET) => return Ok(()),
                Some(&ERR_PACKET) => return Err(ErrPacket::decode(payload)?.to_error()),
                Some(&EOF_PACKET) => {
                    // auth switch: plugin name NUL, fresh nonce
                    let mut body = payload.slice(1..);
                    let plugin = read_null_terminated_string(&mut body)
                        .ok_or_else(|| ProxyError::Auth("malformed auth switch".to_string()))?;
                    let mut new_nonce = body.to_vec();
                    if new_nonce.last() == Some(&0) {
                        new_nonce.pop();
                    }
                    let response =
                        scramble_auth_response(self.conf.passwd.as_bytes(), &new_nonce, &plugin);
                    if response.is_empty() && !self.conf.passwd.is_empty() {
                        return Err(ProxyError::Auth(format!(
                            "unsupported auth plugin {:?}",
                            plugin
                        )));
                    }
                    self.stream.write_payload(&response).await?;
                }
                Some(&AUTH_MORE_DATA_PACKET) => match payload.get(1) {
                    // fast-auth success: terminal OK follows
                    Some(3) => continue,
                    // full auth requested
                    Some(4) => {
                        if self.conf.allow_cleartext_passwords {
                            let mut cleartext = self.conf.passwd.clone().into_bytes();
                            cleartext.push(0);
                            self.stream.write_payload(&cleartext).await?;
                        } else {
                            return Err(ProxyError::Auth(
                                "caching_sha2_password full authentication requires \
                                 allowCleartextPasswords"
                                    .to_string(),
                            ));
                        }
                    }
                    _ => {
                        // RSA key or other continuation data; not supported
                        return Err(ProxyError::Auth(
                            "unexpected auth continuation from server".to_string(),
                        ));
                    }
                },
                _ => {
                    return Err(ProxyError::ProtocolFraming(
                        "unexpected packet during authentication".to_string(),
                    ))
                }
            }
        }
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Poisons the connection so the pool discards it. Callers invoke
    /// this when an error outside the client's own read path (for
    /// example in a row-stream driver) was fatal.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn current_db(&self) -> &str {
        &self.current_db
    }

    fn fail<T>(&mut self, err: ProxyError) -> Result<T> {
        if err.is_fatal_to_connection() {
            self.broken = true;
        }
        Err(err)
    }

    async fn write_command(&mut self, command: u8, body: &[u8]) -> Result<()> {
        self.stream.reset_sequence();
        let mut buf = BytesMut::with_capacity(1 + body.len());
        buf.put_u8(command);
        buf.put_slice(body);
        self.stream.write_payload(&buf).await
    }

    pub async fn write_com_quit(&mut self) -> Result<()> {
        self.write_command(COM_QUIT, &[]).await
    }

    pub async fn write_com_ping(&mut self) -> Result<()> {
        self.write_command(COM_PING, &[]).await
    }

    pub async fn write_com_init_db(&mut self, db: &str) -> Result<()> {
        self.write_command(COM_INIT_DB, db.as_bytes()).await
    }

    pub async fn write_com_query(&mut self, sql: &str) -> Result<()> {
        self.write_command(COM_QUERY, sql.as_bytes()).await
    }

    pub async fn write_com_set_option(&mut self, option: u16) -> Result<()> {
        self.write_command(COM_SET_OPTION, &option.to_le_bytes())
            .await
    }

    pub async fn write_com_field_list(&mut self, table: &str, column: &str) -> Result<()> {
        let mut body = BytesMut::new();
        body.put_slice(table.as_bytes());
        body.put_u8(0);
        body.put_slice(column.as_bytes());
        self.write_command(COM_FIELD_LIST, &body).await
    }

    /// Switches the connection's default schema when it differs from the
    /// borrower's.
    pub async fn sync_db(&mut self, db: &str) -> Result<()> {
        if self.current_db == db {
            return Ok(());
        }
        self.write_com_init_db(db).await?;
        let payload = self.stream.read_payload().await?;
        if is_err_packet(&payload) {
            return Err(ErrPacket::decode(payload)?.to_error());
        }
        if !is_ok_packet(&payload) {
            return self.fail(ProxyError::ProtocolFraming(
                "unexpected response to COM_INIT_DB".to_string(),
            ));
        }
        self.current_db = db.to_string();
        Ok(())
    }

    /// Runs a statement, discarding any rows, and returns the write
    /// result. Used for DML, DDL and transaction control.
    pub async fn execute(&mut self, sql: &str) -> Result<WriteResult> {
        match self.start_query(sql).await? {
            QueryOutcome::Ok(result) => Ok(result),
            QueryOutcome::ResultSet(rs) => {
                while self.next_row(&rs).await?.is_some() {}
                Ok(WriteResult::default())
            }
        }
    }

    /// Sends COM_QUERY and reads the first response packet.
    pub async fn start_query(&mut self, sql: &str) -> Result<QueryOutcome> {
        self.write_com_query(sql).await?;
        self.read_query_response().await
    }

    async fn read_query_response(&mut self) -> Result<QueryOutcome> {
        let payload = self.stream.read_payload().await?;
        match payload.first() {
            None => self.fail(ProxyError::ProtocolFraming("empty query response".to_string())),
            Some(&OK_PACKET) => {
                let ok = OkPacket::decode(payload)?;
                self.status_flags = ok.status_flags;
                Ok(QueryOutcome::Ok(WriteResult {
                    affected_rows: ok.affected_rows,
                    last_insert_id: ok.last_insert_id,
                    status_flags: ok.status_flags,
                    warnings: ok.warnings,
                }))
            }
            Some(&ERR_PACKET) => Err(ErrPacket::decode(payload)?.to_error()),
            Some(&LOCAL_INFILE_PACKET) => {
                // refuse the transfer, then consume the server's verdict
                self.stream.write_payload(&[]).await?;
                let terminal = self.stream.read_payload().await?;
                if is_err_packet(&terminal) {
                    return Err(ErrPacket::decode(terminal)?.to_error());
                }
                Err(ProxyError::Unsupported(
                    "LOCAL INFILE is not supported".to_string(),
                ))
            }
            Some(_) => {
                let mut buf = payload.clone();
                let column_count = read_lenenc_int(&mut buf).ok_or_else(|| {
                    ProxyError::ProtocolFraming("malformed column count".to_string())
                })? as usize;

                let mut columns = Vec::with_capacity(column_count);
                for _ in 0..column_count {
                    let def = self.stream.read_payload().await?;
                    if is_err_packet(&def) {
                        return Err(ErrPacket::decode(def)?.to_error());
                    }
                    columns.push(parse_column_definition(&def, false)?);
                }

                // EOF between columns and rows, unless deprecated
                if self.capabilities & CLIENT_DEPRECATE_EOF == 0 {
                    let eof = self.stream.read_payload().await?;
                    if !is_eof_packet(&eof) && !is_ok_packet(&eof) {
                        return self.fail(ProxyError::ProtocolFraming(
                            "missing EOF after column definitions".to_string(),
                        ));
                    }
                }

                Ok(QueryOutcome::ResultSet(ResultSet::new(columns)))
            }
        }
    }

    /// Next text row of the open result, or `None` at the terminator.
    /// The proxy never negotiates CLIENT_DEPRECATE_EOF with backends, so
    /// the terminator is always a classic EOF packet; a 0xfe first byte
    /// with a 9+ byte payload is a row whose first value has an 8-byte
    /// length prefix.
    pub async fn next_row(&mut self, result_set: &Arc<ResultSet>) -> Result<Option<TextRow>> {
        let payload = self.stream.read_payload().await?;
        if is_err_packet(&payload) {
            return Err(ErrPacket::decode(payload)?.to_error());
        }
        if is_eof_packet(&payload) {
            let status = super::packet::EofPacket::decode(payload)?;
            self.status_flags = status.status_flags;
            return Ok(None);
        }
        Ok(Some(TextRow::new(payload, result_set.clone())))
    }

    /// COM_FIELD_LIST: returns the table's column definitions, each
    /// carrying its default value.
    pub async fn field_list(&mut self, table: &str, column: &str) -> Result<Vec<Field>> {
        self.write_com_field_list(table, column).await?;
        let mut fields = Vec::new();
        loop {
            let payload = self.stream.read_payload().await?;
            if is_err_packet(&payload) {
                return Err(ErrPacket::decode(payload)?.to_error());
            }
            if is_eof_packet(&payload) || is_ok_packet(&payload) {
                return Ok(fields);
            }
            fields.push(parse_column_definition(&payload, true)?);
        }
    }

    /// COM_STMT_PREPARE, skipping parameter and column metadata.
    pub async fn prepare(&mut self, sql: &str) -> Result<BackendStatement> {
        self.write_command(COM_STMT_PREPARE, sql.as_bytes()).await?;
        let payload = self.stream.read_payload().await?;
        if is_err_packet(&payload) {
            return Err(ErrPacket::decode(payload)?.to_error());
        }
        if payload.len() < 12 || payload[0] != OK_PACKET {
            return self.fail(ProxyError::ProtocolFraming(
                "malformed COM_STMT_PREPARE response".to_string(),
            ));
        }
        let statement_id = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
        let column_count = u16::from_le_bytes([payload[5], payload[6]]);
        let param_count = u16::from_le_bytes([payload[7], payload[8]]);

        // parameter definitions then column definitions, each EOF-terminated
        for count in [param_count, column_count] {
            if count > 0 {
                for _ in 0..count {
                    let _ = self.stream.read_payload().await?;
                }
                if self.capabilities & CLIENT_DEPRECATE_EOF == 0 {
                    let _ = self.stream.read_payload().await?;
                }
            }
        }

        Ok(BackendStatement {
            statement_id,
            column_count,
            param_count,
        })
    }
}

/// Parses a column-definition packet. `with_default` is set for
/// COM_FIELD_LIST responses, which append a default value.
pub fn parse_column_definition(payload: &[u8], with_default: bool) -> Result<Field> {
    let mut pos = 0usize;
    let truncated =
        || ProxyError::ProtocolFraming("truncated column definition".to_string());

    let mut next_str = |pos: &mut usize| -> Result<String> {
        let (raw, _, n) = read_lenenc_bytes_slice(&payload[*pos..]).ok_or_else(truncated)?;
        *pos += n;
        Ok(String::from_utf8_lossy(raw).to_string())
    };

    let _catalog = next_str(&mut pos)?;
    let database = next_str(&mut pos)?;
    let table = next_str(&mut pos)?;
    let org_table = next_str(&mut pos)?;
    let name = next_str(&mut pos)?;
    let org_name = next_str(&mut pos)?;

    // fixed-length block: length prefix (0x0c), charset, column length,
    // type, flags, decimals, 2-byte filler
    let (fixed_len, _, n) = read_lenenc_int_slice(&payload[pos..]);
    if n == 0 || fixed_len < 0x0c {
        return Err(truncated());
    }
    pos += n;
    if payload.len() < pos + 0x0c {
        return Err(truncated());
    }
    let charset = u16::from_le_bytes([payload[pos], payload[pos + 1]]);
    let column_length = u32::from_le_bytes([
        payload[pos + 2],
        payload[pos + 3],
        payload[pos + 4],
        payload[pos + 5],
    ]);
    let field_type = FieldType::from_byte(payload[pos + 6]).ok_or_else(|| {
        ProxyError::ProtocolFraming(format!("unknown field type {:#x}", payload[pos + 6]))
    })?;
    let flags = u16::from_le_bytes([payload[pos + 7], payload[pos + 8]]);
    let decimals = payload[pos + 9];
    pos += 0x0c;

    let default_value = if with_default && pos < payload.len() {
        read_lenenc_bytes_slice(&payload[pos..])
            .map(|(raw, _, _)| Bytes::copy_from_slice(raw))
    } else {
        None
    };

    Ok(Field {
        database,
        table,
        org_table,
        name,
        org_name,
        charset,
        column_length,
        field_type,
        flags,
        decimals,
        default_value,
    })
}

/// Type-and-flags-only fast path over a column definition, used when the
/// caller already knows the names.
pub fn parse_column_definition_type(payload: &[u8]) -> Result<(FieldType, u16)> {
    let mut pos = 0usize;
    let truncated =
        || ProxyError::ProtocolFraming("truncated column definition".to_string());

    for _ in 0..6 {
        let (_, _, n) = read_lenenc_bytes_slice(&payload[pos..]).ok_or_else(truncated)?;
        pos += n;
    }
    let (_, _, n) = read_lenenc_int_slice(&payload[pos..]);
    if n == 0 {
        return Err(truncated());
    }
    pos += n;
    if payload.len() < pos + 9 {
        return Err(truncated());
    }
    let field_type = FieldType::from_byte(payload[pos + 6]).ok_or_else(|| {
        ProxyError::ProtocolFraming(format!("unknown field type {:#x}", payload[pos + 6]))
    })?;
    let flags = u16::from_le_bytes([payload[pos + 7], payload[pos + 8]]);
    Ok((field_type, flags))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_server_error_carries_code_and_message() {
        let mut data = vec![0u8; 4];
        data[0] = ERR_PACKET;
        data[1] = (400 & 0xff) as u8;
        data[2] = (400 >> 8) as u8;
        data[3] = b'A';
        let err = parse_initial_handshake(&data).unwrap_err();
        assert_eq!(
            err,
            HandshakeError::ImmediateServerError {
                code: 400,
                message: "A".to_string()
            }
        );
    }

    #[test]
    fn rejects_older_protocol_versions() {
        let data = [PROTOCOL_VERSION - 1, 0, 0, 0];
        assert_eq!(
            parse_initial_handshake(&data).unwrap_err(),
            HandshakeError::UnsupportedProtocol(PROTOCOL_VERSION - 1)
        );
    }

    #[test]
    fn staged_field_validation() {
        let make = |len: usize| {
            let mut data = vec![0u8; len];
            data[0] = PROTOCOL_VERSION;
            data[1] = 1; // one-byte server version
            data
        };

        assert_eq!(
            parse_initial_handshake(&make(2)).unwrap_err(),
            HandshakeError::NoServerVersion
        );
        assert_eq!(
            parse_initial_handshake(&make(6)).unwrap_err(),
            HandshakeError::NoConnectionId
        );
        assert_eq!(
            parse_initial_handshake(&make(14)).unwrap_err(),
            HandshakeError::NoAuthPart1
        );
        assert_eq!(
            parse_initial_handshake(&make(15)).unwrap_err(),
            HandshakeError::NoFiller
        );
        assert_eq!(
            parse_initial_handshake(&make(16)).unwrap_err(),
            HandshakeError::NoCapabilityLower
        );
        assert_eq!(
            parse_initial_handshake(&make(19)).unwrap_err(),
            HandshakeError::NoStatusFlags
        );
        assert_eq!(
            parse_initial_handshake(&make(21)).unwrap_err(),
            HandshakeError::NoCapabilityUpper
        );
        assert_eq!(
            parse_initial_handshake(&make(23)).unwrap_err(),
            HandshakeError::NoAuthDataLength
        );
    }

    #[test]
    fn minimal_18_byte_greeting_has_zero_capabilities() {
        let mut data = vec![0u8; 18];
        data[0] = PROTOCOL_VERSION;
        data[1] = 1;
        let (caps, auth_data, plugin) = parse_initial_handshake(&data).unwrap();
        assert_eq!(caps, 0);
        assert_eq!(auth_data.len(), 8);
        assert_eq!(plugin, MYSQL_NATIVE_PASSWORD);
    }

    #[test]
    fn truncated_extended_greeting_defaults_plugin() {
        // all extended fields present up to the declared auth length, but
        // no capabilities that require more
        let mut data = vec![0u8; 24];
        data[0] = PROTOCOL_VERSION;
        data[1] = 1;
        let (caps, _, plugin) = parse_initial_handshake(&data).unwrap();
        assert_eq!(caps, 0);
        assert_eq!(plugin, MYSQL_NATIVE_PASSWORD);
    }

    #[test]
    fn full_greeting_extracts_nonce_and_plugin() {
        let mut data = vec![0u8; 37];
        data[0] = PROTOCOL_VERSION;
        data[1] = 1;
        data[17] = 255; // lower capabilities: includes SECURE_CONNECTION
        data[21] = 255; // upper capabilities: includes PLUGIN_AUTH
        data[23] = 9; // declared auth data length
        data[35] = b'A';
        let (_, auth_data, plugin) = parse_initial_handshake(&data).unwrap();
        assert_eq!(plugin, "A");
        assert_eq!(auth_data, vec![0u8; 8]);
    }

    #[test]
    fn column_definition_parse() {
        let mut buf = BytesMut::new();
        write_lenenc_str(&mut buf, "def");
        write_lenenc_str(&mut buf, "testbase");
        write_lenenc_str(&mut buf, "testtable");
        write_lenenc_str(&mut buf, "testtable");
        write_lenenc_str(&mut buf, "name");
        write_lenenc_str(&mut buf, "name");
        write_lenenc_int(&mut buf, 0x0c);
        buf.put_u16_le(33); // charset
        buf.put_u32_le(255); // column length
        buf.put_u8(FieldType::VarChar as u8);
        buf.put_u16_le(0); // flags
        buf.put_u8(0); // decimals
        buf.put_u16_le(0); // filler
        write_lenenc_str(&mut buf, "user"); // default value

        let field = parse_column_definition(&buf, true).unwrap();
        assert_eq!(field.database, "testbase");
        assert_eq!(field.table, "testtable");
        assert_eq!(field.name, "name");
        assert_eq!(field.field_type, FieldType::VarChar);
        assert_eq!(field.column_length, 255);
        assert_eq!(field.default_value.as_deref(), Some(&b"user"[..]));

        let (ty, flags) = parse_column_definition_type(&buf).unwrap();
        assert_eq!(ty, FieldType::VarChar);
        assert_eq!(flags, 0);
    }

    #[test]
    fn column_definition_without_default() {
        let mut buf = BytesMut::new();
        for s in ["def", "", "", "", "n", "n"] {
            write_lenenc_str(&mut buf, s);
        }
        write_lenenc_int(&mut buf, 0x0c);
        buf.put_u16_le(45);
        buf.put_u32_le(20);
        buf.put_u8(FieldType::LongLong as u8);
        buf.put_u16_le(UNSIGNED_FLAG);
        buf.put_u8(0);
        buf.put_u16_le(0);

        let field = parse_column_definition(&buf, false).unwrap();
        assert_eq!(field.field_type, FieldType::LongLong);
        assert_eq!(field.flags, UNSIGNED_FLAG);
        assert!(field.default_value.is_none());
    }
}
