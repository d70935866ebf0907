use std::path::PathBuf;

use clap::Parser;

use super::pool_config::PoolConfig;
use crate::DEFAULT_P2P_PORT;

/// Command-line arguments for the daemon.
#[derive(Debug, Parser)]
#[command(name = "tidepool", about = "Peer pool daemon for an overlay trading network")]
pub struct Args {
    /// Do not accept inbound connections.
    #[arg(long)]
    pub no_listen: bool,

    /// Port on which to listen for peer connections. 0 lets the OS pick.
    #[arg(long, default_value_t = DEFAULT_P2P_PORT)]
    pub port: u16,

    /// Address to advertise to peers, host[:port]. May be repeated.
    #[arg(long = "address")]
    pub addresses: Vec<String>,

    /// Detect our external IP at startup and advertise it.
    #[arg(long)]
    pub detect_external_ip: bool,

    /// Allow dialing .onion addresses through a local tor proxy.
    #[arg(long)]
    pub tor: bool,

    /// Port of the local tor SOCKS proxy.
    #[arg(long, default_value_t = 9050)]
    pub tor_port: u16,

    /// Do not ask peers for their peer lists.
    #[arg(long)]
    pub no_discover: bool,

    /// Minutes between periodic discovery sweeps; 0 disables the timer.
    #[arg(long, default_value_t = 720)]
    pub discover_minutes: u32,

    /// Reject peers older than this semver version.
    #[arg(long)]
    pub min_compatible_version: Option<String>,

    /// Ban nodes on a single abusive swap event.
    #[arg(long)]
    pub strict_reputation: bool,

    /// Nodes to connect to at startup, pubkey@host:port. May be repeated.
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    /// Data directory; defaults to the platform data dir.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Path to the node identity key file; defaults to node.key under the
    /// data directory.
    #[arg(long)]
    pub node_key_file: Option<PathBuf>,
}

impl Args {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            listen: !self.no_listen,
            port: self.port,
            addresses: self.addresses.clone(),
            detect_external_ip: self.detect_external_ip,
            tor: self.tor,
            tor_port: self.tor_port,
            discover: !self.no_discover,
            discover_minutes: self.discover_minutes,
            min_compatible_version: self.min_compatible_version.clone(),
            strict_reputation: self.strict_reputation,
            ..PoolConfig::default()
        }
    }
}
