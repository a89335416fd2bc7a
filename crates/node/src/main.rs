use anyhow::Context;
use clap::Parser;
use sds_node::config::{default_config_path, load_config, save_config, NodeConfig, SpEndpoint};
use sds_node::identity::load_or_create_keypair;
use sds_node::PpNode;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::oneshot;
use tracing::info;

#[derive(Parser, Debug, Clone)]
#[command(name = "sds-node", version, about = "Resource node for the sds storage network")]
struct Args {
    /// Node config file; created from the resolved settings with --save-config.
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    storage_path: Option<String>,

    #[arg(long)]
    max_gb: Option<u64>,

    #[arg(long)]
    listen: Option<String>,

    #[arg(long)]
    network_address: Option<String>,

    /// Indexing server as `p2p_address@host:port`; repeat for failover order.
    #[arg(long = "sp")]
    sp: Vec<SpEndpoint>,

    #[arg(long)]
    wallet_address: Option<String>,

    #[arg(long)]
    beneficiary_address: Option<String>,

    #[arg(long, default_value_t = false)]
    save_config: bool,

    #[arg(long, default_value_t = false)]
    print_p2p_address: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    let config_path = args
        .config
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    let config = resolve_config(&args, &config_path)?;

    if args.print_p2p_address {
        let keypair = load_or_create_keypair(Path::new(&config.storage_path))?;
        println!("{}", keypair.public().to_peer_id());
        return Ok(());
    }
    if args.save_config {
        save_config(&config_path, &config)?;
        info!(path = %config_path.display(), "Saved node config");
    }

    fs::create_dir_all(&config.storage_path)
        .with_context(|| format!("failed to create storage path {}", config.storage_path))?;
    info!(
        max_gb = config.max_gb,
        path = %config.storage_path,
        sp_count = config.sp_list.len(),
        "Node storage allocation configured"
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(());
    });
    let node = PpNode::start(config).await?;
    node.run_until(shutdown_rx).await;
    Ok(())
}

/// Saved config first, then command-line overrides.
fn resolve_config(args: &Args, config_path: &Path) -> anyhow::Result<NodeConfig> {
    let mut config = match load_config(config_path)? {
        Some(saved) => {
            info!(path = %config_path.display(), "Loaded saved node config");
            saved
        }
        None => NodeConfig::default(),
    };
    if let Some(path) = &args.storage_path {
        config.storage_path = path.clone();
    }
    if let Some(max_gb) = args.max_gb {
        config.max_gb = max_gb;
    }
    if let Some(listen) = &args.listen {
        config.listen = listen.clone();
    }
    if let Some(address) = &args.network_address {
        config.network_address = address.clone();
    }
    if !args.sp.is_empty() {
        config.sp_list = args.sp.clone();
    }
    if let Some(wallet) = &args.wallet_address {
        config.wallet_address = wallet.clone();
    }
    if let Some(beneficiary) = &args.beneficiary_address {
        config.beneficiary_address = beneficiary.clone();
    }
    config.validate()?;
    Ok(config)
}
