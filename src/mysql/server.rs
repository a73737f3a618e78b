use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::ListenerConfig;
use crate::error::Result;
use crate::runtime::Runtime;

use super::connection::ClientConnection;

/// TCP acceptor for one configured frontend. Each accepted client runs
/// as its own task.
pub struct MysqlServer {
    listener: ListenerConfig,
    runtime: Arc<Runtime>,
    connection_ids: Arc<AtomicU32>,
}

impl MysqlServer {
    pub fn new(
        listener: ListenerConfig,
        runtime: Arc<Runtime>,
        connection_ids: Arc<AtomicU32>,
    ) -> Self {
        Self {
            listener,
            runtime,
            connection_ids,
        }
    }

    pub async fn serve(self) -> Result<()> {
        let addr = format!("{}:{}", self.listener.host, self.listener.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "listening for MySQL clients");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let connection_id = self.connection_ids.fetch_add(1, Ordering::SeqCst);
                    let runtime = self.runtime.clone();
                    info!(%peer, connection_id, "accepted client");

                    tokio::spawn(async move {
                        let conn = ClientConnection::new(stream, connection_id, runtime);
                        if let Err(e) = conn.handle().await {
                            error!(connection_id, error = %e, "session ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                }
            }
        }
    }
}
