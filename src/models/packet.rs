use std::fmt::Display;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use super::node::Address;
use super::node::NodePubKey;
use super::node_state::NodeState;

/// Wire-stable packet type discriminants. The framer writes this as the first
/// byte of every frame payload; unknown values are a protocol error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Hello = 1,
    SessionInitAck = 2,
    Ping = 3,
    Pong = 4,
    Disconnecting = 5,
    Order = 6,
    OrderInvalidation = 7,
    GetOrders = 8,
    Orders = 9,
    GetNodes = 10,
    Nodes = 11,
    NodeStateUpdate = 12,
    SanitySwapInit = 13,
    SwapRequest = 14,
    SwapAccepted = 15,
    SwapFailed = 16,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PacketType::Hello),
            2 => Some(PacketType::SessionInitAck),
            3 => Some(PacketType::Ping),
            4 => Some(PacketType::Pong),
            5 => Some(PacketType::Disconnecting),
            6 => Some(PacketType::Order),
            7 => Some(PacketType::OrderInvalidation),
            8 => Some(PacketType::GetOrders),
            9 => Some(PacketType::Orders),
            10 => Some(PacketType::GetNodes),
            11 => Some(PacketType::Nodes),
            12 => Some(PacketType::NodeStateUpdate),
            13 => Some(PacketType::SanitySwapInit),
            14 => Some(PacketType::SwapRequest),
            15 => Some(PacketType::SwapAccepted),
            16 => Some(PacketType::SwapFailed),
            _ => None,
        }
    }
}

/// Reason codes sent in a `Disconnecting` packet immediately before socket
/// close. Wire-stable; absence on the wire is indistinguishable from network
/// failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum DisconnectionReason {
    Shutdown = 1,
    IncompatibleProtocolVersion = 2,
    MalformedVersion = 3,
    Banned = 4,
    AlreadyConnected = 5,
    ConnectedToSelf = 6,
    NotAcceptingConnections = 7,
    ResponseStalling = 8,
    WireProtocolErr = 9,
}

impl From<DisconnectionReason> for u8 {
    fn from(reason: DisconnectionReason) -> u8 {
        reason as u8
    }
}

impl TryFrom<u8> for DisconnectionReason {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(DisconnectionReason::Shutdown),
            2 => Ok(DisconnectionReason::IncompatibleProtocolVersion),
            3 => Ok(DisconnectionReason::MalformedVersion),
            4 => Ok(DisconnectionReason::Banned),
            5 => Ok(DisconnectionReason::AlreadyConnected),
            6 => Ok(DisconnectionReason::ConnectedToSelf),
            7 => Ok(DisconnectionReason::NotAcceptingConnections),
            8 => Ok(DisconnectionReason::ResponseStalling),
            9 => Ok(DisconnectionReason::WireProtocolErr),
            other => Err(format!("unknown disconnection reason {other}")),
        }
    }
}

impl Display for DisconnectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DisconnectionReason::Shutdown => "shutdown",
            DisconnectionReason::IncompatibleProtocolVersion => "incompatible protocol version",
            DisconnectionReason::MalformedVersion => "malformed version",
            DisconnectionReason::Banned => "banned",
            DisconnectionReason::AlreadyConnected => "already connected",
            DisconnectionReason::ConnectedToSelf => "connected to self",
            DisconnectionReason::NotAcceptingConnections => "not accepting connections",
            DisconnectionReason::ResponseStalling => "response stalling",
            DisconnectionReason::WireProtocolErr => "wire protocol error",
        };
        write!(f, "{s}")
    }
}

/// Every packet carries a random id; response packets echo the id of the
/// request they answer in `req_id`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PacketHeader {
    pub id: Uuid,
    pub req_id: Option<Uuid>,
}

impl PacketHeader {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            req_id: None,
        }
    }

    pub fn response_to(req_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            req_id: Some(req_id),
        }
    }
}

impl Default for PacketHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// The opening message of the two-phase handshake. This is the only frame
/// whose layout must be bit-exact across implementations.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HelloBody {
    pub version: String,
    pub node_pub_key: NodePubKey,
    /// Fresh per-session nonce, proven by `signature`.
    pub session_nonce: [u8; 32],
    /// Ed25519 signature by `node_pub_key` over `session_nonce`.
    pub signature: Vec<u8>,
    pub node_state: NodeState,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisconnectingBody {
    pub reason: DisconnectionReason,
    pub payload: Option<String>,
}

/// The portion of an order that gets broadcast to peers trading its pair.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OrderPortion {
    pub id: Uuid,
    pub pair_id: String,
    pub price: f64,
    pub quantity: u64,
    pub is_buy: bool,
}

/// Tells peers that some quantity of a previously broadcast order is gone.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderInvalidationPortion {
    pub order_id: Uuid,
    pub pair_id: String,
    pub quantity: u64,
}

/// A gossip entry: a node identity and the addresses it can be reached at.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConnectInfo {
    pub pub_key: NodePubKey,
    pub addresses: Vec<Address>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SanitySwapInitBody {
    pub currency: String,
    pub r_hash: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SwapRequestBody {
    pub order_id: Uuid,
    pub pair_id: String,
    pub proposed_quantity: u64,
    pub r_hash: String,
    pub takers_cltv_delta: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SwapAcceptedBody {
    pub r_hash: String,
    pub quantity: u64,
    pub makers_cltv_delta: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SwapFailedBody {
    pub r_hash: String,
    pub error_message: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PacketBody {
    Hello(HelloBody),
    SessionInitAck,
    Ping,
    Pong,
    Disconnecting(DisconnectingBody),
    Order(OrderPortion),
    OrderInvalidation(OrderInvalidationPortion),
    GetOrders,
    Orders(Vec<OrderPortion>),
    GetNodes,
    Nodes(Vec<NodeConnectInfo>),
    NodeStateUpdate(NodeState),
    SanitySwapInit(SanitySwapInitBody),
    SwapRequest(SwapRequestBody),
    SwapAccepted(SwapAcceptedBody),
    SwapFailed(SwapFailedBody),
}

/// One decoded frame: header plus typed body.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub header: PacketHeader,
    pub body: PacketBody,
}

impl Packet {
    pub fn new(body: PacketBody) -> Self {
        Self {
            header: PacketHeader::new(),
            body,
        }
    }

    pub fn response(req_id: Uuid, body: PacketBody) -> Self {
        Self {
            header: PacketHeader::response_to(req_id),
            body,
        }
    }

    pub fn ping() -> Self {
        Self::new(PacketBody::Ping)
    }

    pub fn pong(req_id: Uuid) -> Self {
        Self::response(req_id, PacketBody::Pong)
    }

    pub fn disconnecting(reason: DisconnectionReason, payload: Option<String>) -> Self {
        Self::new(PacketBody::Disconnecting(DisconnectingBody {
            reason,
            payload,
        }))
    }

    pub fn packet_type(&self) -> PacketType {
        match self.body {
            PacketBody::Hello(_) => PacketType::Hello,
            PacketBody::SessionInitAck => PacketType::SessionInitAck,
            PacketBody::Ping => PacketType::Ping,
            PacketBody::Pong => PacketType::Pong,
            PacketBody::Disconnecting(_) => PacketType::Disconnecting,
            PacketBody::Order(_) => PacketType::Order,
            PacketBody::OrderInvalidation(_) => PacketType::OrderInvalidation,
            PacketBody::GetOrders => PacketType::GetOrders,
            PacketBody::Orders(_) => PacketType::Orders,
            PacketBody::GetNodes => PacketType::GetNodes,
            PacketBody::Nodes(_) => PacketType::Nodes,
            PacketBody::NodeStateUpdate(_) => PacketType::NodeStateUpdate,
            PacketBody::SanitySwapInit(_) => PacketType::SanitySwapInit,
            PacketBody::SwapRequest(_) => PacketType::SwapRequest,
            PacketBody::SwapAccepted(_) => PacketType::SwapAccepted,
            PacketBody::SwapFailed(_) => PacketType::SwapFailed,
        }
    }

    pub fn get_type(&self) -> &'static str {
        match self.body {
            PacketBody::Hello(_) => "hello",
            PacketBody::SessionInitAck => "session init ack",
            PacketBody::Ping => "ping",
            PacketBody::Pong => "pong",
            PacketBody::Disconnecting(_) => "disconnecting",
            PacketBody::Order(_) => "order",
            PacketBody::OrderInvalidation(_) => "order invalidation",
            PacketBody::GetOrders => "get orders",
            PacketBody::Orders(_) => "orders",
            PacketBody::GetNodes => "get nodes",
            PacketBody::Nodes(_) => "nodes",
            PacketBody::NodeStateUpdate(_) => "node state update",
            PacketBody::SanitySwapInit(_) => "sanity swap init",
            PacketBody::SwapRequest(_) => "swap request",
            PacketBody::SwapAccepted(_) => "swap accepted",
            PacketBody::SwapFailed(_) => "swap failed",
        }
    }
}
