use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bramble_gateway::config;
use bramble_gateway::config::Configuration;
use bramble_gateway::server;
use bramble_gateway::Gateway;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bramble", about = "A federated GraphQL API gateway")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, short, default_value = "bramble.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let configuration =
        Configuration::load(&args.config).context("invalid gateway configuration")?;
    let host = configuration.host.clone();
    let port = configuration.port;

    let gateway = Arc::new(Gateway::new(configuration));

    let (reload_sender, reload_receiver) = mpsc::channel(4);
    // The watcher must stay alive for the lifetime of the process.
    let _watcher = match config::watch(args.config.clone(), reload_sender) {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            warn!("configuration file watching disabled: {err:#}");
            None
        }
    };

    tokio::spawn(Arc::clone(&gateway).run(reload_receiver));

    server::serve(gateway, &host, port).await
}
