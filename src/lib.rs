//! A MySQL-wire-compatible proxy that transparently shards tables
//! across backend MySQL instances.

pub mod backend;
pub mod config;
pub mod error;
pub mod mysql;
pub mod optimize;
pub mod plan;
pub mod rule;
pub mod runtime;

pub use config::{ConfigKey, ConfigProvider, FileConfigProvider, ProxyConfig};
pub use error::{HandshakeError, ProxyError, Result};
pub use optimize::{parse_statement, Optimizer};
pub use plan::Plan;
pub use rule::{ShardAlgorithm, ShardingRule, TableRule};
pub use runtime::{DataSet, ExecuteResult, Runtime, RuntimeSession, VConn, WriteResult};
