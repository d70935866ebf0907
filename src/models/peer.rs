use std::net::SocketAddr;
use std::time::SystemTime;

use super::node::NodePubKey;
use super::node_state::NodeState;
use super::packet::DisconnectionReason;

/// Lifecycle of a single peer session. A peer that fails before `Open` is
/// discarded without ever touching the pool's peer map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerStatus {
    Connecting,
    Handshaking,
    Open,
    Closing,
    Closed,
}

/// One entry in the pool's peer map. Presence in the map implies an admitted,
/// fully handshaked session; the entry is inserted and removed together with
/// the session's active flag.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub pub_key: NodePubKey,
    pub alias: String,
    pub address: SocketAddr,
    pub inbound: bool,
    pub version: String,
    pub connected_at: SystemTime,
    pub node_state: NodeState,
    pub status: PeerStatus,
    /// Distinguishes this session from a replacement session for the same
    /// node, so a dying session never evicts its successor's map entry.
    pub(crate) session_id: u64,
}

impl PeerInfo {
    pub fn new(
        pub_key: NodePubKey,
        address: SocketAddr,
        inbound: bool,
        version: String,
        node_state: NodeState,
    ) -> Self {
        Self {
            pub_key,
            alias: pub_key.alias(),
            address,
            inbound,
            version,
            connected_at: SystemTime::now(),
            node_state,
            status: PeerStatus::Open,
            session_id: rand::random(),
        }
    }

    pub fn is_pair_active(&self, pair_id: &str) -> bool {
        self.node_state.is_pair_active(pair_id)
    }
}

/// Mutable bookkeeping a peer session keeps about its own shutdown, reported
/// back to the pool when the session ends so it can decide on reconnection.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionCloseInfo {
    pub sent_reason: Option<DisconnectionReason>,
    pub recv_reason: Option<DisconnectionReason>,
}
