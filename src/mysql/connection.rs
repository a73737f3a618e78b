use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{ProxyError, Result};
use crate::runtime::{DataSet, ExecuteResult, Runtime, RuntimeSession};

use super::auth::verify_native_password;
use super::packet::{
    encode_column_definition, EofPacket, ErrPacket, HandshakePacket, HandshakeResponse,
    OkPacket, PacketStream,
};
use super::protocol::*;

/// Sessions that sit idle longer than this are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

const ER_ACCESS_DENIED: u16 = 1045;
const ER_UNSUPPORTED_PS: u16 = 1295;
const ER_UNKNOWN_COM_ERROR: u16 = 1047;

/// One client session: Unauth → Authenticating → Idle ⇄ Executing →
/// Closed. Statements execute serially; fan-out happens inside the plan
/// executor.
pub struct ClientConnection {
    stream: PacketStream<TcpStream>,
    connection_id: u32,
    runtime: Arc<Runtime>,
    session: Arc<RuntimeSession>,
    client_capabilities: u32,
    username: String,
}

impl ClientConnection {
    pub fn new(stream: TcpStream, connection_id: u32, runtime: Arc<Runtime>) -> Self {
        let session = runtime.new_session();
        Self {
            stream: PacketStream::new(stream),
            connection_id,
            runtime,
            session,
            client_capabilities: 0,
            username: String::new(),
        }
    }

    pub async fn handle(mut self) -> Result<()> {
        debug!(connection_id = self.connection_id, "client connected");

        if let Err(e) = self.handshake().await {
            warn!(connection_id = self.connection_id, error = %e, "handshake failed");
            return Err(e);
        }

        loop {
            match self.serve_command().await {
                Ok(true) => continue,
                Ok(false) => {
                    debug!(connection_id = self.connection_id, "client quit");
                    break;
                }
                Err(ProxyError::ConnectionClosed) => {
                    debug!(connection_id = self.connection_id, "client disconnected");
                    break;
                }
                Err(e) if e.is_fatal_to_connection() => {
                    error!(connection_id = self.connection_id, error = %e, "fatal session error");
                    break;
                }
                Err(e) => {
                    // recoverable statement failure: report and stay open
                    self.send_error(&e).await?;
                }
            }
        }

        // roll back anything a dropped session left pinned
        if self.session.is_in_transaction() {
            let _ = self.session.rollback().await;
        }
        Ok(())
    }

    async fn handshake(&mut self) -> Result<()> {
        let snapshot = self.runtime.snapshot();
        let greeting = HandshakePacket::new(self.connection_id, &snapshot.server_version);
        self.stream.write_payload(&greeting.encode()).await?;

        let payload = self.stream.read_payload().await?;
        let response = HandshakeResponse::decode(payload)?;
        self.client_capabilities = response.capability_flags & server_capabilities();

        let authenticated = self
            .authenticate(&snapshot.users, &response, greeting.nonce())
            .await?;
        if !authenticated {
            let err = ErrPacket::new(
                ER_ACCESS_DENIED,
                "28000",
                format!("Access denied for user '{}'", response.username),
            );
            self.stream.write_payload(&err.encode()).await?;
            return Err(ProxyError::Auth(format!(
                "access denied for {:?}",
                response.username
            )));
        }

        self.username = response.username;
        self.session.set_charset(response.character_set);
        self.session.set_schema(response.database);
        info!(
            connection_id = self.connection_id,
            user = %self.username,
            "client authenticated"
        );

        let ok = OkPacket::new(self.session.status_flags());
        self.stream.write_payload(&ok.encode()).await
    }

    /// Verifies the native-password response, switching plugins first for
    /// clients that led with something else.
    async fn authenticate(
        &mut self,
        users: &[crate::config::UserConfig],
        response: &HandshakeResponse,
        nonce: &[u8],
    ) -> Result<bool> {
        let Some(user) = users
            .iter()
            .find(|u| u.username == response.username)
        else {
            return Ok(false);
        };

        let auth_response = match response.auth_plugin_name.as_deref() {
            None | Some(MYSQL_NATIVE_PASSWORD) => response.auth_response.clone(),
            Some(_) => {
                // ask the client to redo the scramble with our plugin
                let mut switch = BytesMut::new();
                switch.put_u8(EOF_PACKET);
                write_null_terminated_str(&mut switch, MYSQL_NATIVE_PASSWORD);
                switch.put_slice(nonce);
                switch.put_u8(0);
                self.stream.write_payload(&switch).await?;
                self.stream.read_payload().await?.to_vec()
            }
        };

        Ok(verify_native_password(
            user.password.as_bytes(),
            nonce,
            &auth_response,
        ))
    }

    /// Reads and dispatches one command. Returns `false` on COM_QUIT.
    async fn serve_command(&mut self) -> Result<bool> {
        let payload = match timeout(IDLE_TIMEOUT, self.stream.read_payload()).await {
            Ok(result) => result?,
            Err(_) => {
                info!(connection_id = self.connection_id, "idle timeout");
                return Ok(false);
            }
        };
        if payload.is_empty() {
            return Err(ProxyError::ProtocolFraming("empty command packet".to_string()));
        }

        let command = Command::from(payload[0]);
        let body = payload.slice(1..);
        debug!(connection_id = self.connection_id, ?command, "command");

        match command {
            Command::Quit => return Ok(false),
            Command::Ping => self.send_ok(OkPacket::new(self.session.status_flags())).await?,
            Command::InitDb => {
                let db = String::from_utf8_lossy(&body).trim_matches('\0').to_string();
                self.session.set_schema(Some(db));
                self.send_ok(OkPacket::new(self.session.status_flags())).await?;
            }
            Command::Query => {
                let sql = String::from_utf8_lossy(&body).to_string();
                self.handle_query(&sql).await?;
            }
            Command::FieldList => {
                self.handle_field_list(&body).await?;
            }
            Command::SetOption => {
                self.send_ok(OkPacket::new(self.session.status_flags())).await?;
            }
            Command::StmtPrepare | Command::StmtExecute | Command::StmtClose => {
                let err = ErrPacket::new(
                    ER_UNSUPPORTED_PS,
                    "HY000",
                    "prepared statements are not supported by this proxy".to_string(),
                );
                self.stream.write_payload(&err.encode()).await?;
            }
            Command::Unknown(code) => {
                warn!(connection_id = self.connection_id, code, "unknown command");
                let err = ErrPacket::new(
                    ER_UNKNOWN_COM_ERROR,
                    "08S01",
                    format!("unknown command {:#x}", code),
                );
                self.stream.write_payload(&err.encode()).await?;
            }
        }

        Ok(true)
    }

    async fn handle_query(&mut self, sql: &str) -> Result<()> {
        let trimmed = sql.trim().trim_end_matches(';').trim();
        let upper = trimmed.to_ascii_uppercase();

        // session-scoped statements never reach the optimizer
        if let Some(db) = upper.strip_prefix("USE ") {
            let db = trimmed[trimmed.len() - db.trim().len()..].trim_matches('`').to_string();
            self.session.set_schema(Some(db));
            return self.send_ok(OkPacket::new(self.session.status_flags())).await;
        }
        if upper == "BEGIN" || upper.starts_with("START TRANSACTION") {
            self.session.begin();
            return self.send_ok(OkPacket::new(self.session.status_flags())).await;
        }
        if upper == "COMMIT" {
            return match self.session.commit().await {
                Ok(()) => self.send_ok(OkPacket::new(self.session.status_flags())).await,
                Err(e) => self.send_error(&e).await,
            };
        }
        if upper == "ROLLBACK" {
            return match self.session.rollback().await {
                Ok(()) => self.send_ok(OkPacket::new(self.session.status_flags())).await,
                Err(e) => self.send_error(&e).await,
            };
        }
        if let Some(rest) = upper.strip_prefix("SET ") {
            let rest = rest.replace(' ', "");
            if let Some(v) = rest.strip_prefix("AUTOCOMMIT=") {
                self.session.set_autocommit(v == "1" || v == "ON" || v == "TRUE");
            }
            // other session variables are acknowledged without forwarding
            return self.send_ok(OkPacket::new(self.session.status_flags())).await;
        }

        match self.runtime.execute(&self.session, sql, &[]).await {
            Ok(ExecuteResult::Write(write)) => {
                self.session.record_write(&write);
                let mut ok = OkPacket::new(self.session.status_flags());
                ok.affected_rows = write.affected_rows;
                ok.last_insert_id = write.last_insert_id;
                ok.warnings = write.warnings;
                self.send_ok(ok).await
            }
            Ok(ExecuteResult::Query(ds)) => self.write_result_set(ds).await,
            Err(e) => self.send_error(&e).await,
        }
    }

    async fn handle_field_list(&mut self, body: &Bytes) -> Result<()> {
        let nul = body.iter().position(|&b| b == 0).unwrap_or(body.len());
        let table = String::from_utf8_lossy(&body[..nul]).to_string();
        let wildcard = if nul + 1 < body.len() {
            String::from_utf8_lossy(&body[nul + 1..]).to_string()
        } else {
            String::new()
        };

        match self.session.field_list(&table, &wildcard).await {
            Ok(fields) => {
                for field in &fields {
                    self.stream
                        .write_payload(&encode_column_definition(field))
                        .await?;
                }
                let eof = EofPacket::new(self.session.status_flags());
                self.stream.write_payload(&eof.encode()).await
            }
            Err(e) => self.send_error(&e).await,
        }
    }

    /// Streams a result set to the client, honoring the negotiated
    /// CLIENT_DEPRECATE_EOF. Row payloads pass through without copying.
    async fn write_result_set(&mut self, mut ds: DataSet) -> Result<()> {
        let fields = ds.fields().clone();
        if fields.column_count() == 0 {
            // a statement that produced no metadata reports as a plain OK
            return self.send_ok(OkPacket::new(self.session.status_flags())).await;
        }
        let deprecate_eof = self.client_capabilities & CLIENT_DEPRECATE_EOF != 0;

        let mut count_buf = BytesMut::new();
        write_lenenc_int(&mut count_buf, fields.column_count() as u64);
        self.stream.write_payload(&count_buf).await?;

        for field in &fields.columns {
            self.stream
                .write_payload(&encode_column_definition(field))
                .await?;
        }
        if !deprecate_eof {
            let eof = EofPacket::new(self.session.status_flags());
            self.stream.write_payload(&eof.encode()).await?;
        }

        while let Some(row) = ds.next_row().await {
            match row {
                Ok(row) => self.stream.write_payload(&row.content).await?,
                Err(e) => {
                    // the protocol allows an ERR packet in place of a row
                    warn!(connection_id = self.connection_id, error = %e, "result stream failed");
                    let (code, state, message) = e.to_sql_error();
                    let err = ErrPacket::new(code, &state, message);
                    return self.stream.write_payload(&err.encode()).await;
                }
            }
        }

        if deprecate_eof {
            let ok = OkPacket::new(self.session.status_flags());
            self.stream.write_payload(&ok.encode_as_eof()).await
        } else {
            let eof = EofPacket::new(self.session.status_flags());
            self.stream.write_payload(&eof.encode()).await
        }
    }

    async fn send_ok(&mut self, ok: OkPacket) -> Result<()> {
        self.stream.write_payload(&ok.encode()).await
    }

    async fn send_error(&mut self, error: &ProxyError) -> Result<()> {
        let (code, state, message) = error.to_sql_error();
        debug!(connection_id = self.connection_id, code, %message, "statement error");
        let err = ErrPacket::new(code, &state, message);
        self.stream.write_payload(&err.encode()).await
    }
}
