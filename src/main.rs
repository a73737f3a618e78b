use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shard_proxy::config::{ConfigKey, ConfigProvider, FileConfigProvider, ProxyConfig};
use shard_proxy::mysql::MysqlServer;
use shard_proxy::runtime::Runtime;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shard_proxy=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_dir = std::env::args()
        .skip_while(|a| a.as_str() != "--config")
        .nth(1)
        .unwrap_or_else(|| "conf".to_string());
    info!(config_dir, "starting shard-proxy");

    let provider = Arc::new(FileConfigProvider::new(&config_dir));
    let config = ProxyConfig::load(provider.as_ref()).await?;
    if config.data_sources.is_empty() {
        write_example_config(provider.as_ref()).await?;
        anyhow::bail!(
            "no data sources configured; example documents written to {}",
            config_dir
        );
    }

    let runtime = Runtime::new(&config).context("invalid configuration")?;

    // config watch: any document update rebuilds and swaps the snapshot
    for key in ConfigKey::ALL {
        let mut watch = provider.watch(key);
        let provider = provider.clone();
        let runtime = runtime.clone();
        tokio::spawn(async move {
            loop {
                match watch.recv().await {
                    Ok(_) => match ProxyConfig::load(provider.as_ref()).await {
                        Ok(updated) => {
                            if let Err(e) = runtime.install(&updated) {
                                error!(key = key.as_str(), error = %e, "rejected config update");
                            } else {
                                info!(key = key.as_str(), "configuration reloaded");
                            }
                        }
                        Err(e) => {
                            error!(key = key.as_str(), error = %e, "failed to reload config")
                        }
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(key = key.as_str(), skipped, "config watcher lagged; re-reading");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let connection_ids = Arc::new(AtomicU32::new(1));
    let mut servers = Vec::new();
    for listener in config.listeners.clone() {
        let server = MysqlServer::new(listener, runtime.clone(), connection_ids.clone());
        servers.push(tokio::spawn(async move {
            if let Err(e) = server.serve().await {
                error!(error = %e, "listener terminated");
            }
        }));
    }
    info!("shard-proxy started");

    tokio::select! {
        _ = futures::future::join_all(servers) => {
            error!("all listeners terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn write_example_config(provider: &FileConfigProvider) -> Result<()> {
    provider
        .save(
            ConfigKey::Listeners,
            br#"[{"host": "0.0.0.0", "port": 13306}]"#,
        )
        .await?;
    provider
        .save(
            ConfigKey::DataSources,
            br#"[
  {"name": "fake_db_0000", "dsn": "root:123456@tcp(127.0.0.1:3306)/fake_db_0000"},
  {"name": "fake_db_0001", "dsn": "root:123456@tcp(127.0.0.1:3306)/fake_db_0001"}
]"#,
        )
        .await?;
    provider
        .save(
            ConfigKey::Users,
            br#"[{"username": "admin", "password": "123456"}]"#,
        )
        .await?;
    provider
        .save(
            ConfigKey::ShardingRule,
            br#"{
  "tables": [
    {
      "logical_table": "student",
      "shard_column": "uid",
      "algorithm": {"type": "modulo", "shards": 2},
      "db_pattern": "fake_db_${0000}",
      "table_pattern": "student"
    }
  ]
}"#,
        )
        .await?;
    Ok(())
}
