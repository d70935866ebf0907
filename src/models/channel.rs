use std::net::SocketAddr;

use super::node::NodePubKey;
use super::node::ReputationEvent;
use super::node_state::NodeState;
use super::packet::DisconnectionReason;
use super::packet::NodeConnectInfo;
use super::packet::OrderInvalidationPortion;
use super::packet::OrderPortion;
use super::packet::Packet;

/// Messages from the pool's supervisory loop to every peer task. Targeted
/// variants carry the recipient's pub key; other peer tasks ignore them.
#[derive(Clone, Debug)]
pub enum PoolToPeerTask {
    Send {
        target: NodePubKey,
        packet: Packet,
    },
    BroadcastOrder(OrderPortion),
    BroadcastOrderInvalidation {
        portion: OrderInvalidationPortion,
        exclude: Option<NodePubKey>,
    },
    /// Advertise our own updated node state to all peers.
    NodeStateUpdate(NodeState),
    /// Ask every peer for its peer list.
    MakeDiscoveryRequest,
    Disconnect {
        target: NodePubKey,
        reason: DisconnectionReason,
    },
    DisconnectAll {
        reason: DisconnectionReason,
    },
}

impl PoolToPeerTask {
    pub fn get_type(&self) -> &'static str {
        match self {
            PoolToPeerTask::Send { .. } => "send",
            PoolToPeerTask::BroadcastOrder(_) => "broadcast order",
            PoolToPeerTask::BroadcastOrderInvalidation { .. } => "broadcast order invalidation",
            PoolToPeerTask::NodeStateUpdate(_) => "node state update",
            PoolToPeerTask::MakeDiscoveryRequest => "make discovery request",
            PoolToPeerTask::Disconnect { .. } => "disconnect",
            PoolToPeerTask::DisconnectAll { .. } => "disconnect all",
        }
    }
}

/// Messages from peer tasks back to the pool's supervisory loop.
#[derive(Clone, Debug)]
pub enum PeerTaskToPool {
    /// An admitted peer finished opening; the pool reacts (discovery, events)
    /// and only then announces the peer as active.
    PeerOpened { pub_key: NodePubKey },
    /// A session ended and was removed from the peer map.
    PeerClosed {
        pub_key: NodePubKey,
        address: SocketAddr,
        inbound: bool,
        sent_reason: Option<DisconnectionReason>,
        recv_reason: Option<DisconnectionReason>,
    },
    /// A `Nodes` gossip reply arrived.
    NodesReceived {
        from: NodePubKey,
        nodes: Vec<NodeConnectInfo>,
    },
    /// A peer earned a reputation event.
    Reputation {
        pub_key: NodePubKey,
        event: ReputationEvent,
    },
    /// A peer advertised a fresh node state mid-session.
    NodeStateUpdated {
        pub_key: NodePubKey,
        state: NodeState,
    },
}

impl PeerTaskToPool {
    pub fn get_type(&self) -> &'static str {
        match self {
            PeerTaskToPool::PeerOpened { .. } => "peer opened",
            PeerTaskToPool::PeerClosed { .. } => "peer closed",
            PeerTaskToPool::NodesReceived { .. } => "nodes received",
            PeerTaskToPool::Reputation { .. } => "reputation",
            PeerTaskToPool::NodeStateUpdated { .. } => "node state updated",
        }
    }
}
