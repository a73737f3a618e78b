//! MySQL wire protocol: framing, packets, auth, DSN, rows and both ends
//! of the proxy (client-facing server session, backend-facing client).

pub mod auth;
pub mod client;
pub mod connection;
pub mod dsn;
pub mod packet;
pub mod protocol;
pub mod rows;
pub mod server;
pub mod value;

pub use client::{parse_initial_handshake, BackendConnection};
pub use connection::ClientConnection;
pub use dsn::DsnConfig;
pub use packet::{Packet, PacketStream};
pub use protocol::{Command, FieldType};
pub use rows::{BinaryRow, Field, ResultSet, Row, TextRow};
pub use server::MysqlServer;
pub use value::Value;
