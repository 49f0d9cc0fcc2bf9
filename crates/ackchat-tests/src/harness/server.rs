use ackchat_server::{ClientRegistry, ServerConfig, server};
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;

/// A server running in-process on a random port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<ClientRegistry>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn spawn() -> Result<Self> {
        Self::spawn_with(ServerConfig::default()).await
    }

    /// Spawn with `config`, overriding only the listen address.
    pub async fn spawn_with(mut config: ServerConfig) -> Result<Self> {
        config.listen = "127.0.0.1:0".to_string();
        config.stats_interval_secs = 0;
        let (addr, registry, shutdown_tx) = server::spawn(config).await?;
        Ok(Self {
            addr,
            registry,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn server_addr(&self) -> String {
        self.addr.to_string()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
