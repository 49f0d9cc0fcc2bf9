use crate::config::ServerConfig;
use crate::registry::ClientRegistry;
use crate::worker::ServerWorker;
use ackchat::Connection;
use anyhow::Context;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Bind, serve until ctrl-c.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    let registry = Arc::new(ClientRegistry::new());
    serve(listener, registry, config, async {
        tokio::signal::ctrl_c().await.ok();
        info!("shutting down...");
    })
    .await
}

/// Start a server in the background. Returns the bound address, the shared
/// registry and a shutdown trigger.
pub async fn spawn(
    config: ServerConfig,
) -> anyhow::Result<(SocketAddr, Arc<ClientRegistry>, oneshot::Sender<()>)> {
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    let addr = listener.local_addr()?;
    let registry = Arc::new(ClientRegistry::new());
    let (tx, rx) = oneshot::channel();
    let shared = registry.clone();
    tokio::spawn(async move {
        let shutdown = async {
            let _ = rx.await;
        };
        if let Err(e) = serve(listener, shared, config, shutdown).await {
            error!("server failed: {e:#}");
        }
    });
    Ok((addr, registry, tx))
}

/// Accept connections on `listener` until `shutdown` resolves, one worker task
/// per connection.
pub async fn serve<F>(
    listener: TcpListener,
    registry: Arc<ClientRegistry>,
    config: ServerConfig,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let local_addr = listener.local_addr()?;
    info!(
        addr = %local_addr,
        max_connections = config.max_connections,
        receive_timeout_secs = config.receive_timeout_secs,
        "ackchat server listening"
    );

    let gc = spawn_gc(registry.clone(), &config);
    let stats = spawn_stats(registry.clone(), &config);

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if registry.stats().connections() >= config.max_connections {
                        warn!(%addr, max = config.max_connections, "connection limit reached, refusing");
                        continue;
                    }
                    debug!(%addr, "accepted connection");
                    let connection = Connection::from_tcp(stream, config.outbound_queue);
                    let worker = ServerWorker::new(connection, registry.clone(), config.receive_timeout());
                    let registry = registry.clone();
                    registry.stats().connection_opened();
                    tokio::spawn(async move {
                        worker.run().await;
                        registry.stats().connection_closed();
                    });
                }
                Err(e) => {
                    error!("accept error: {e}");
                }
            }
        }
    }

    gc.abort();
    if let Some(stats) = stats {
        stats.abort();
    }
    info!(addr = %local_addr, "ackchat server stopped");
    Ok(())
}

/// Periodic sweep for finished sessions whose workers are idle.
fn spawn_gc(registry: Arc<ClientRegistry>, config: &ServerConfig) -> tokio::task::JoinHandle<()> {
    let period = config.gc_interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let removed = registry.garbage_collect();
            if !removed.is_empty() {
                info!(?removed, "removed finished sessions");
            }
        }
    })
}

fn spawn_stats(
    registry: Arc<ClientRegistry>,
    config: &ServerConfig,
) -> Option<tokio::task::JoinHandle<()>> {
    let period = config.stats_interval()?;
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            let s = registry.stats().snapshot();
            info!(
                logged_in = s.logged_in,
                connections = s.connections,
                requests = s.requests,
                logouts = s.logouts,
                events_sent = s.events_sent,
                confirms_received = s.confirms_received,
                open_wait_lists = registry.open_wait_lists(),
                "server stats"
            );
        }
    }))
}
