use ackchat_server::{ServerConfig, server};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "ackchat broadcast chat server")]
struct Args {
    /// TOML config file. Defaults to $XDG_CONFIG_HOME/ackchat/server.toml if present.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the listen address.
    #[arg(long)]
    listen: Option<String>,
    /// Override the per-receive timeout in seconds.
    #[arg(long)]
    receive_timeout_secs: Option<u64>,
    #[arg(long)]
    max_connections: Option<usize>,
    /// Statistics log period in seconds, 0 to disable.
    #[arg(long)]
    stats_interval_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ackchat_server=info,ackchat=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(secs) = args.receive_timeout_secs {
        config.receive_timeout_secs = secs;
    }
    if let Some(max) = args.max_connections {
        config.max_connections = max;
    }
    if let Some(secs) = args.stats_interval_secs {
        config.stats_interval_secs = secs;
    }

    server::run(config).await
}
