// Colossus storage node: peer protocol listener and asset HTTP surface.

mod assets;
mod config;
mod keys;
mod transport;

use std::sync::Arc;

use anyhow::Context;
use colossus_core::{PublicKey, RepositoryId, RepositoryPool};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_LOG_FILTER: &str = "colossus_node=info,colossus_core=info";
const USAGE: &str = "usage: colossus-node [--version] [query <addr> <peer-key> <repository> <name>]";

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("colossus-node {}", VERSION);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let cfg = config::load();
    let keypair = Arc::new(keys::load_or_generate(&cfg.key_path())?);

    let rt = tokio::runtime::Runtime::new()?;
    match args.first().map(String::as_str) {
        None => rt.block_on(run(cfg, keypair)),
        Some("query") => rt.block_on(query(&args[1..], cfg, keypair)),
        Some(other) => anyhow::bail!("unknown command {other:?}\n{USAGE}"),
    }
}

async fn run(cfg: config::Config, keypair: Arc<colossus_core::Keypair>) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&cfg.storage_root)
        .await
        .with_context(|| format!("creating {}", cfg.storage_root.display()))?;
    let pool = RepositoryPool::new(&cfg.storage_root, cfg.backend, cfg.pool_capacity).shared();
    tracing::info!(
        version = VERSION,
        root = %cfg.storage_root.display(),
        backend = cfg.backend.as_str(),
        capacity = cfg.pool_capacity,
        "storage node starting"
    );

    let peer_pool = pool.clone();
    let peer_key = keypair.clone();
    let peer_port = cfg.peer_port;
    let max_payload = cfg.max_payload;
    tokio::spawn(async move {
        if let Err(e) = transport::run_transport(peer_port, peer_key, peer_pool, max_payload).await {
            tracing::error!(error = %e, "peer transport stopped");
        }
    });

    let service = Arc::new(assets::AssetService::new(pool, cfg.upload.clone()));
    let http_port = cfg.http_port;
    tokio::spawn(async move {
        if let Err(e) = assets::run_http(http_port, service).await {
            tracing::error!(error = %e, "asset http stopped");
        }
    });

    shutdown_signal().await?;
    tracing::info!("shutting down");
    Ok(())
}

/// `query <addr> <peer-key> <repository> <name>`: ask a node whether it holds an asset.
async fn query(
    args: &[String],
    cfg: config::Config,
    keypair: Arc<colossus_core::Keypair>,
) -> anyhow::Result<()> {
    let [addr, peer, repository, name] = args else {
        anyhow::bail!(USAGE);
    };
    let addr = tokio::net::lookup_host(addr.as_str())
        .await?
        .next()
        .with_context(|| format!("cannot resolve {addr}"))?;
    let peer: PublicKey = peer.parse().context("peer key must be 64 hex characters")?;
    let repository: RepositoryId = repository.parse()?;
    let answer =
        transport::query_peer(addr, keypair, peer, &repository, name, cfg.max_payload).await?;
    match answer {
        colossus_core::Answer::Present { size } => println!("present {size}"),
        colossus_core::Answer::Absent => println!("absent"),
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
