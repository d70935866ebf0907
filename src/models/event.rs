use super::node::NodePubKey;
use super::node_state::NodeState;
use super::packet::DisconnectionReason;
use super::packet::OrderInvalidationPortion;
use super::packet::OrderPortion;
use super::packet::SanitySwapInitBody;
use super::packet::SwapAcceptedBody;
use super::packet::SwapFailedBody;
use super::packet::SwapRequestBody;
use uuid::Uuid;

/// Typed events published to external subscribers (order book, swap engine,
/// RPC surface). The pool never interprets the forwarded payloads; it only
/// routes them.
#[derive(Clone, Debug)]
pub enum PoolEvent {
    PacketOrder {
        from: NodePubKey,
        order: OrderPortion,
    },
    PacketOrderInvalidation {
        from: NodePubKey,
        portion: OrderInvalidationPortion,
    },
    PacketGetOrders {
        from: NodePubKey,
        req_id: Uuid,
    },
    PacketSanitySwapInit {
        from: NodePubKey,
        body: SanitySwapInitBody,
    },
    PacketSwapRequest {
        from: NodePubKey,
        body: SwapRequestBody,
    },
    PacketSwapAccepted {
        from: NodePubKey,
        body: SwapAcceptedBody,
    },
    PacketSwapFailed {
        from: NodePubKey,
        body: SwapFailedBody,
    },
    /// A peer completed its handshake and was admitted into the pool.
    PeerActive { pub_key: NodePubKey },
    /// A peer session ended and was removed from the pool.
    PeerClose {
        pub_key: NodePubKey,
        sent_reason: Option<DisconnectionReason>,
        recv_reason: Option<DisconnectionReason>,
    },
    /// A peer's advertised pairs changed; subscribers should re-verify what
    /// they track for it.
    PeerVerifyPairs { pub_key: NodePubKey },
    /// A peer stopped advertising a pair.
    PeerPairDropped {
        pub_key: NodePubKey,
        pair_id: String,
    },
    PeerNodeStateUpdate {
        pub_key: NodePubKey,
        state: NodeState,
    },
    /// A node crossed the ban threshold or was banned explicitly.
    NodeBan { pub_key: NodePubKey },
}
