use thiserror::Error;

/// Errors produced while validating a backend's initial handshake packet.
/// Each missing field gets its own variant so connect failures are
/// attributable to the exact byte the server left out.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("immediate error from server errorCode={code} errorMsg={message}")]
    ImmediateServerError { code: u16, message: String },

    #[error("unsupported protocol version {0}")]
    UnsupportedProtocol(u8),

    #[error("packet has no server version")]
    NoServerVersion,

    #[error("packet has no connection id")]
    NoConnectionId,

    #[error("packet has no auth-plugin-data-part-1")]
    NoAuthPart1,

    #[error("packet has no filler")]
    NoFiller,

    #[error("packet has no capability flags (lower 2 bytes)")]
    NoCapabilityLower,

    #[error("packet has no character set")]
    NoCharset,

    #[error("packet has no status flags")]
    NoStatusFlags,

    #[error("packet has no capability flags (upper 2 bytes)")]
    NoCapabilityUpper,

    #[error("packet has no length of auth-plugin-data")]
    NoAuthDataLength,

    #[error("packet has no auth-plugin-data-part-2")]
    NoAuthPart2,

    #[error("packet has no auth-plugin name")]
    NoPluginName,
}

#[derive(Error, Debug)]
pub enum ProxyError {
    /// Malformed packet length, truncated payload, out-of-order sequence.
    /// Fatal to the offending connection.
    #[error("protocol framing error: {0}")]
    ProtocolFraming(String),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Handshake field rejection on the frontend, or auth plugin refusal.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid DSN: {0}")]
    DsnParse(String),

    /// ERR packet from a backend, surfaced to the client unchanged.
    #[error("SQL error {code} ({state}): {message}")]
    Sql {
        code: u16,
        state: String,
        message: String,
    },

    /// No rule matches, or a multi-shard write without a shard key where
    /// the rule forbids it. Reported to the client with a vendor code
    /// outside the real MySQL range.
    #[error("routing error: {0}")]
    Routing(String),

    #[error("statement cancelled")]
    Cancelled,

    /// Acquire timeout or max connections exceeded. Retryable at the next
    /// statement boundary.
    #[error("pool error: {0}")]
    Pool(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Vendor error code for proxy-originated routing failures, outside the
/// range real MySQL servers use.
pub const ER_PROXY_ROUTING: u16 = 10501;
/// Vendor error code for proxy-internal failures surfaced as SQL errors.
pub const ER_PROXY_INTERNAL: u16 = 10500;

pub const SQLSTATE_GENERAL: &str = "HY000";
pub const SQLSTATE_CANCELLED: &str = "57014";

impl ProxyError {
    /// (code, sqlstate, message) triple used when re-encoding the error as
    /// a MySQL ERR packet for the client.
    pub fn to_sql_error(&self) -> (u16, String, String) {
        match self {
            ProxyError::Sql {
                code,
                state,
                message,
            } => (*code, state.clone(), message.clone()),
            ProxyError::Routing(msg) => {
                (ER_PROXY_ROUTING, SQLSTATE_GENERAL.to_string(), msg.clone())
            }
            ProxyError::Cancelled => (
                ER_PROXY_INTERNAL,
                SQLSTATE_CANCELLED.to_string(),
                "query execution was interrupted".to_string(),
            ),
            other => (
                ER_PROXY_INTERNAL,
                SQLSTATE_GENERAL.to_string(),
                other.to_string(),
            ),
        }
    }

    /// Errors that poison the backend connection they occurred on. The
    /// pool discards such connections instead of reusing them.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            ProxyError::ProtocolFraming(_)
                | ProxyError::Handshake(_)
                | ProxyError::Auth(_)
                | ProxyError::ConnectionClosed
                | ProxyError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_error_passes_through_unchanged() {
        let err = ProxyError::Sql {
            code: 1064,
            state: "42000".to_string(),
            message: "syntax error".to_string(),
        };
        let (code, state, msg) = err.to_sql_error();
        assert_eq!(code, 1064);
        assert_eq!(state, "42000");
        assert_eq!(msg, "syntax error");
    }

    #[test]
    fn routing_error_uses_vendor_code() {
        let (code, state, _) = ProxyError::Routing("no rule".into()).to_sql_error();
        assert_eq!(code, ER_PROXY_ROUTING);
        assert_eq!(state, SQLSTATE_GENERAL);
        assert!(code > 10000);
    }

    #[test]
    fn cancelled_maps_to_sqlstate_57014() {
        let (_, state, _) = ProxyError::Cancelled.to_sql_error();
        assert_eq!(state, SQLSTATE_CANCELLED);
    }
}
