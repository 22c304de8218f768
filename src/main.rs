use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use sc_engine::apps::AppRegistry;
use sc_engine::chain::ProviderChainClient;
use sc_engine::{logging, ChannelSigner, EngineConfig, Store, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "sc-engine", version, about = "Two-party state channel node")]
struct Cli {
    /// TOML configuration file, `SC_` environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch the challenge registry and answer disputes until interrupted.
    Watch,
    /// Write a store snapshot to `store.backup_path`.
    Backup,
    /// Replace the store with the snapshot at `store.backup_path`.
    Restore,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    logging::init(&config.log_filter);

    match cli.command {
        Command::Watch => watch(config).await,
        Command::Backup => {
            let store = Store::open(&config.store)?;
            let snapshot = store.backup()?;
            std::fs::write(&config.store.backup_path, snapshot)
                .with_context(|| format!("writing {}", config.store.backup_path.display()))?;
            info!("backup written to {}", config.store.backup_path.display());
            Ok(())
        }
        Command::Restore => {
            let snapshot = std::fs::read(&config.store.backup_path)
                .with_context(|| format!("reading {}", config.store.backup_path.display()))?;
            let store = Store::open(&config.store)?;
            store.restore_from(&snapshot)?;
            info!("store restored from {}", config.store.backup_path.display());
            Ok(())
        }
    }
}

async fn watch(config: EngineConfig) -> Result<()> {
    let key = config
        .network
        .private_key
        .as_deref()
        .context("network.private_key is required to submit dispute transactions")?;
    let registry = config
        .contract_registry()?
        .address_of("ChallengeRegistry")
        .context("network.contracts.challenge_registry is required to watch disputes")?;
    let signer = ChannelSigner::from_private_key(key)?;
    let store = Arc::new(Store::open(&config.store)?);
    let chain = Arc::new(
        ProviderChainClient::connect(&config.network.rpc_url, &signer)
            .await?
            .with_inclusion_timeout(config.watcher.inclusion_timeout()),
    );
    let apps = Arc::new(AppRegistry::for_network(&config.network.contracts));
    let watcher = Watcher::new(chain, store, config.network.contracts.clone(), apps, config.watcher.clone());

    let mut events = watcher.subscribe();
    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!("{}", json),
                    Err(e) => warn!("unprintable watcher event {:?}: {}", event.kind(), e),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => warn!("{} watcher events dropped", skipped),
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    watcher.start().await?;
    info!("watching challenge registry {:?}", registry);
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    watcher.stop().await;
    reporter.abort();
    Ok(())
}
