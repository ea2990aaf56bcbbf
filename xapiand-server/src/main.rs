use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use xapiand_server::config::Config;
use xapiand_server::context::{LocalShardMastery, ServerContext};
use xapiand_server::discovery::{Discovery, DiscoveryHandler};
use xapiand_server::membership::Membership;
use xapiand_server::pool::DatabasePool;
use xapiand_server::raft::Raft;
use xapiand_server::remote::{replication, RemoteServer};
use xapiand_server::resolver::EndpointResolver;
use xapiand_server::workers::WorkerPools;

#[derive(Debug, Parser)]
#[command(name = "xapiand", about = "Distributed, RESTful search and indexing server")]
struct Cli {
    /// JSON configuration file; flags below override it.
    #[arg(long, env = "XAPIAND_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, env = "XAPIAND_CLUSTER")]
    cluster: Option<String>,
    /// Pinned node name; conflicts shut the node down instead of
    /// renaming it.
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long, env = "XAPIAND_DATA_DIR")]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    http_port: Option<u16>,
    #[arg(long)]
    binary_port: Option<u16>,
    #[arg(long)]
    region: Option<i32>,
    /// Run without discovery or raft (single-node).
    #[arg(long)]
    solo: bool,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<(Config, bool)> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => Config::default(),
        };
        if let Some(cluster) = self.cluster {
            config.cluster_name = cluster;
        }
        if let Some(name) = self.name {
            config.node_name = Some(name);
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(http_port) = self.http_port {
            config.http_port = http_port;
        }
        if let Some(binary_port) = self.binary_port {
            config.binary_port = binary_port;
        }
        if let Some(region) = self.region {
            config.region = region;
        }
        Ok((config, self.solo))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config, solo) = Cli::parse().into_config()?;
    run_server(config, solo).await
}

async fn run_server(config: Config, solo: bool) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    let membership = Arc::new(Membership::new());
    let pool = Arc::new(DatabasePool::new(&config.data_dir, config.pool_options()));
    let (probe_tx, probe_rx) = mpsc::unbounded_channel();
    let resolver = Arc::new(EndpointResolver::new(
        membership.clone(),
        probe_tx,
        config.resolver_options(),
    ));
    let workers = WorkerPools::new(
        config.committer_threads(),
        config.workers.fsynchers,
        config.workers.updaters,
    );
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
    let ctx = Arc::new(ServerContext::new(
        config.clone(),
        membership.clone(),
        pool.clone(),
        resolver.clone(),
        workers,
        shutdown_tx.clone(),
    ));

    let remote = RemoteServer::spawn(ctx.clone()).await?;

    let (replicate_tx, replicate_rx) = mpsc::unbounded_channel();
    let updaters = replication::spawn_updaters(ctx.clone(), replicate_rx);

    if !solo {
        let handler = DiscoveryHandler::new(
            ctx.local_node(),
            config.node_name.is_some(),
            membership.clone(),
            Arc::new(LocalShardMastery::new(pool.clone())),
        );
        let discovery = Arc::new(
            Discovery::spawn(
                config.discovery_options(),
                handler,
                resolver.clone(),
                probe_rx,
                replicate_tx,
                shutdown_tx.clone(),
            )
            .await?,
        );
        ctx.attach_discovery(discovery.clone());
        discovery.enter();
        if let Some(node) = discovery.wait_ready().await {
            ctx.set_local_node(node);
        }

        let raft = Arc::new(
            Raft::spawn(config.raft_options(), ctx.local_node(), membership.clone()).await?,
        );
        ctx.attach_raft(raft);
    }

    tracing::info!(
        node = %ctx.local_node(),
        cluster = %config.cluster_name,
        data_dir = %config.data_dir.display(),
        "xapiand is ready"
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
        }
        _ = shutdown_rx.recv() => {
            tracing::info!("shutdown requested");
        }
    }

    // Drain mode: running requests finish, new ones are rejected,
    // pools flush and close.
    if let Some(discovery) = ctx.discovery() {
        discovery.leave();
    }
    if let Some(raft) = ctx.raft() {
        raft.stop();
    }
    remote.abort();
    updaters.abort();
    for database in ctx.pool.drain_idle() {
        let _ = ctx.workers.fsynchers.spawn(move || {
            if let Err(err) = database.flush() {
                tracing::warn!(%err, "flush on shutdown failed");
            }
        });
    }
    ctx.pool.shutdown();
    ctx.workers.shutdown();
    tracing::info!("bye");
    Ok(())
}
