use std::collections::HashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;

use super::channel::PeerTaskToPool;
use super::channel::PoolToPeerTask;
use super::event::PoolEvent;
use super::node::Address;
use super::node::NodePubKey;
use super::node_state::NodeState;
use super::peer::PeerInfo;
use crate::config_models::pool_config::PoolConfig;
use crate::node_key::NodeKey;
use crate::node_list::NodeList;

/// State shared between the pool's supervisory loop, the accept loop, and
/// every peer task.
///
/// The peer collections are guarded by plain mutexes; they are only ever held
/// for map manipulation, never across an await point. Reads from outside the
/// owning task are snapshots.
pub struct PoolState {
    pub config: PoolConfig,
    pub node_key: NodeKey,
    /// The version we present in handshakes.
    pub version: String,
    pub node_list: NodeList,

    /// Admitted peers, keyed by public key. At most one session per key.
    pub peer_map: Mutex<HashMap<NodePubKey, PeerInfo>>,
    /// Outbound connection attempts in flight, with a revocation signal for
    /// their pending dial retries. Disjoint from `peer_map`.
    pub pending_outbound: Mutex<HashMap<NodePubKey, watch::Sender<bool>>>,
    /// Inbound sockets whose remote identity is not yet known.
    pub pending_inbound: Mutex<HashSet<SocketAddr>>,

    /// The node state we advertise in handshakes and state updates.
    pub our_node_state: Mutex<NodeState>,
    /// Verified reachability per advertised address.
    pub reachability: Mutex<HashMap<Address, bool>>,
    /// Resolved listening port, once the listener is bound.
    pub listen_port: Mutex<Option<u16>>,

    pub connected: AtomicBool,
    pub disconnecting: AtomicBool,

    pub to_peers_tx: broadcast::Sender<PoolToPeerTask>,
    pub to_pool_tx: mpsc::Sender<PeerTaskToPool>,
    pub events_tx: broadcast::Sender<PoolEvent>,
}

pub type SharedPoolState = Arc<PoolState>;

impl PoolState {
    pub fn our_pub_key(&self) -> NodePubKey {
        self.node_key.pub_key()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: PoolEvent) {
        // Nobody listening is fine.
        let _ = self.events_tx.send(event);
    }

    pub fn snapshot_node_state(&self) -> NodeState {
        self.our_node_state.lock().unwrap().clone()
    }

    pub fn peer_count(&self) -> usize {
        self.peer_map.lock().unwrap().len()
    }
}
