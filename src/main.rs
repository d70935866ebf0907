use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::FmtSubscriber;

use tidepool::addr::parse_address;
use tidepool::config_models::cli_args;
use tidepool::models::node::Address;
use tidepool::node_list::MemNodeStore;
use tidepool::NodeKey;
use tidepool::NodePubKey;
use tidepool::Pool;

fn main() -> Result<()> {
    let tokio_runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("Could not create tokio runtime");

    let result = tokio_runtime.block_on(async {
        let args: cli_args::Args = cli_args::Args::parse();

        // RUST_LOG controls verbosity; defaults to info.
        let info_env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(info_env_filter)
            .with_thread_ids(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|_err| eprintln!("Unable to set global default subscriber"))
            .expect("Failed to set trace subscriber");

        run(args).await
    });

    tokio_runtime.shutdown_timeout(tokio::time::Duration::from_secs(10));
    result
}

async fn run(args: cli_args::Args) -> Result<()> {
    let data_dir = match &args.data_dir {
        Some(dir) => dir.clone(),
        None => default_data_dir()?,
    };
    let key_file = args
        .node_key_file
        .clone()
        .unwrap_or_else(|| data_dir.join("node.key"));
    let node_key = NodeKey::load_or_create(&key_file).context("failed to resolve node identity")?;
    info!("Node identity is {} ({})", node_key.pub_key(), node_key.pub_key().alias());

    let config = args.pool_config();
    let default_port = config.port;
    let mut pool = Pool::new(config, node_key, Arc::new(MemNodeStore::default()));
    pool.init().await.context("failed to initialize the peer pool")?;

    for entry in &args.peers {
        match parse_peer_spec(entry, default_port) {
            Ok((pub_key, address)) => {
                if let Err(err) = pool.add_outbound(address, pub_key, false, false).await {
                    warn!("Could not connect to {entry}: {err}");
                }
            }
            Err(err) => warn!("Ignoring malformed --peer {entry}: {err:#}"),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    pool.disconnect().await;
    Ok(())
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(project_dirs) = directories::ProjectDirs::from("org", "tidepool", "tidepool") {
        Ok(project_dirs.data_dir().to_path_buf())
    } else {
        bail!("Could not determine data directory");
    }
}

/// Parse a bootstrap peer entry of the form `pubkey@host:port`.
fn parse_peer_spec(entry: &str, default_port: u16) -> Result<(NodePubKey, Address)> {
    let Some((pub_key, address)) = entry.split_once('@') else {
        bail!("expected pubkey@host:port");
    };
    let pub_key: NodePubKey = pub_key.parse()?;
    let address = parse_address(address, default_port)?;
    Ok((pub_key, address))
}
