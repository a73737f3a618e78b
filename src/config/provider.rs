//! Pluggable configuration metadata providers.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{ProxyError, Result};

use super::ConfigKey;

/// Watch channel capacity. A slow subscriber that falls further behind
/// than this loses the oldest updates (it will observe a lag error and
/// can re-read the full document).
const WATCH_CAPACITY: usize = 16;

/// A metadata store the proxy reads its rules, sources, users and
/// listeners from. `watch` delivers every post-subscription update at
/// least once; updates for distinct keys may arrive in any order.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn get(&self, key: ConfigKey) -> Result<Vec<u8>>;
    async fn save(&self, key: ConfigKey, data: &[u8]) -> Result<()>;
    fn watch(&self, key: ConfigKey) -> broadcast::Receiver<Bytes>;
}

/// File-backed provider: one JSON document per key under a directory.
pub struct FileConfigProvider {
    dir: PathBuf,
    channels: HashMap<ConfigKey, broadcast::Sender<Bytes>>,
}

impl FileConfigProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let channels = ConfigKey::ALL
            .iter()
            .map(|key| (*key, broadcast::channel(WATCH_CAPACITY).0))
            .collect();
        Self {
            dir: dir.into(),
            channels,
        }
    }

    fn path_for(&self, key: ConfigKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.as_str()))
    }
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn get(&self, key: ConfigKey) -> Result<Vec<u8>> {
        tokio::fs::read(self.path_for(key))
            .await
            .map_err(ProxyError::Io)
    }

    async fn save(&self, key: ConfigKey, data: &[u8]) -> Result<()> {
        if let Some(parent) = self.path_for(key).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(self.path_for(key), data).await?;
        debug!(key = key.as_str(), bytes = data.len(), "config document saved");
        // subscribers with no capacity left drop the oldest update and
        // re-read on lag
        let _ = self.channels[&key].send(Bytes::copy_from_slice(data));
        Ok(())
    }

    fn watch(&self, key: ConfigKey) -> broadcast::Receiver<Bytes> {
        self.channels[&key].subscribe()
    }
}
