use std::time::Duration;

use crate::DEFAULT_P2P_PORT;

/// Timing knobs for peer sessions. The defaults are the protocol's; tests
/// shrink them to keep scenarios fast.
#[derive(Clone, Copy, Debug)]
pub struct PoolTiming {
    /// Close a peer that has sent nothing for this long. Also the total
    /// handshake deadline and the duplicate-resolution wait window.
    pub stall_interval: Duration,
    /// Send a ping if we have sent nothing else in this interval.
    pub ping_interval: Duration,
    /// A send that cannot flush within this period closes the peer.
    pub send_high_water: Duration,
    /// Per-attempt dial timeout.
    pub connect_timeout: Duration,
    /// First dial-retry backoff delay.
    pub retry_base_delay: Duration,
    /// Backoff delay ceiling.
    pub retry_max_delay: Duration,
    /// Total window after which dial retries give up.
    pub retry_max_period: Duration,
}

impl Default for PoolTiming {
    fn default() -> Self {
        Self {
            stall_interval: Duration::from_secs(30),
            ping_interval: Duration::from_secs(30),
            send_high_water: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            retry_max_period: Duration::from_secs(7 * 60),
        }
    }
}

/// Options recognized by the pool.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Accept inbound connections.
    pub listen: bool,
    /// Port to listen on; 0 lets the OS assign one, and the resolved port
    /// replaces this value during `init`.
    pub port: u16,
    /// Addresses to advertise to peers, `host[:port]`.
    pub addresses: Vec<String>,
    /// Resolve our external IP at startup and advertise it.
    pub detect_external_ip: bool,
    /// Allow dialing `.onion` addresses through a local tor proxy.
    pub tor: bool,
    pub tor_port: u16,
    /// Ask peers for their peer lists.
    pub discover: bool,
    /// Minutes between periodic discovery sweeps; 0 disables the timer.
    pub discover_minutes: u32,
    /// Reject peers older than this semver version.
    pub min_compatible_version: Option<String>,
    /// Ban nodes on a single abusive swap event instead of waiting for the
    /// score threshold.
    pub strict_reputation: bool,
    pub timing: PoolTiming,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            listen: true,
            port: DEFAULT_P2P_PORT,
            addresses: Vec::new(),
            detect_external_ip: false,
            tor: false,
            tor_port: 9050,
            discover: true,
            discover_minutes: 720,
            min_compatible_version: None,
            strict_reputation: false,
            timing: PoolTiming::default(),
        }
    }
}
