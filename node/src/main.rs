// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use brook_node::broker::Broker;
use brook_node::config::NodeConfig;
use brook_node::server::build_router;
use brook_node::telemetry;
use brook_node::transport::HttpTransport;
use clap::Parser;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "brook-node", version, about = "A partitioned, replicated workflow engine node")]
struct Args {
    /// JSON config file; BROOK_* variables override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    node_id: Option<u64>,

    #[arg(long)]
    bind: Option<SocketAddr>,

    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_telemetry();
    let args = Args::parse();

    let base = match &args.config {
        Some(path) => NodeConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => NodeConfig::default(),
    };
    let mut config = base
        .with_env_overrides(|key| std::env::var(key).ok())
        .context("reading BROOK_* overrides")?;
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    tracing::info!("Starting brook node with config: {:?}", config);

    let transport = HttpTransport::new(config.members.clone(), config.replication_timeout())?;
    let broker = Arc::new(Broker::start(config, Arc::new(transport)).context("starting partitions")?);

    let app = build_router(broker.clone());
    let addr = broker.config().bind_addr;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serving")?;

    broker.shutdown().await;
    Ok(())
}
