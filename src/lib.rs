//! The peer pool of an overlay trading network daemon.
//!
//! The pool discovers, connects to, authenticates, and tracks remote nodes,
//! exchanges length-prefixed framed packets with them over long-lived TCP
//! sessions, gossips peer lists, keeps a persistent per-node reputation
//! ledger, and surfaces decoded traffic to external subscribers (order book,
//! swap engine, RPC) as typed events. See [`pool::Pool`] for the entry point.

pub mod addr;
pub mod config_models;
pub mod error;
pub mod external_ip;
pub mod framer;
pub mod models;
pub mod node_key;
pub mod node_list;
pub mod pool;

mod connect_to_peers;
mod peer_loop;


pub use error::PoolError;
pub use models::event::PoolEvent;
pub use models::node::Address;
pub use models::node::NodePubKey;
pub use models::node::ReputationEvent;
pub use models::node_state::NodeState;
pub use models::packet::DisconnectionReason;
pub use models::packet::NodeConnectInfo;
pub use models::packet::OrderInvalidationPortion;
pub use models::packet::OrderPortion;
pub use models::packet::Packet;
pub use models::packet::PacketBody;
pub use models::peer::PeerInfo;
pub use node_key::NodeKey;
pub use pool::AuxStateUpdate;
pub use pool::Pool;

/// Version presented in the handshake.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default p2p listening port.
pub const DEFAULT_P2P_PORT: u16 = 9735;

/// Frames larger than this are a protocol error on either side.
pub const MAX_FRAME_LENGTH_IN_BYTES: usize = 32 * 1024 * 1024;

pub(crate) const PEER_CHANNEL_CAPACITY: usize = 1000;
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;
