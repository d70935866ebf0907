use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config_models::pool_config::PoolConfig;
use crate::connect_to_peers::answer_peer_wrapper;
use crate::connect_to_peers::probe_reachability;
use crate::connect_to_peers::register_outbound;
use crate::connect_to_peers::try_connect_node;
use crate::connect_to_peers::unregister_outbound;
use crate::error::PoolError;
use crate::external_ip;
use crate::models::channel::PeerTaskToPool;
use crate::models::channel::PoolToPeerTask;
use crate::models::event::PoolEvent;
use crate::models::node::Address;
use crate::models::node::Node;
use crate::models::node::NodePubKey;
use crate::models::node::ReputationEvent;
use crate::models::node_state::NodeState;
use crate::models::packet::DisconnectionReason;
use crate::models::packet::NodeConnectInfo;
use crate::models::packet::OrderInvalidationPortion;
use crate::models::packet::OrderPortion;
use crate::models::packet::Packet;
use crate::models::packet::PacketBody;
use crate::models::peer::PeerInfo;
use crate::models::state::PoolState;
use crate::models::state::SharedPoolState;
use crate::node_key::NodeKey;
use crate::node_list::NodeList;
use crate::node_list::NodeStore;
use crate::EVENT_CHANNEL_CAPACITY;
use crate::PEER_CHANNEL_CAPACITY;
use crate::VERSION;

/// How long `disconnect` waits for peer sessions to drain.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_DRAIN_POLL: Duration = Duration::from_millis(25);
/// Placeholder period for a disabled discovery timer.
const TIMER_DISABLED: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A partial update to the auxiliary chain state we advertise.
#[derive(Clone, Debug, Default)]
pub struct AuxStateUpdate {
    pub currency: String,
    pub identifier: Option<String>,
    pub pub_key: Option<String>,
    pub uris: Option<Vec<String>>,
    pub token_identifier: Option<String>,
}

/// The peer pool: the sole gateway between this daemon and remote nodes on
/// the overlay network. Owns the listener, every peer session, discovery,
/// reconnection, broadcast, and the reputation ledger.
pub struct Pool {
    state: SharedPoolState,
    to_pool_rx: Option<mpsc::Receiver<PeerTaskToPool>>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Option<JoinHandle<()>>,
    bootstrap: Option<JoinHandle<()>>,
}

impl Pool {
    pub fn new(config: PoolConfig, node_key: NodeKey, store: Arc<dyn NodeStore>) -> Self {
        Self::with_version(config, node_key, store, VERSION.to_string())
    }

    /// Like [`Pool::new`] with an explicit handshake version. Tests use this
    /// to impersonate old releases.
    pub(crate) fn with_version(
        config: PoolConfig,
        node_key: NodeKey,
        store: Arc<dyn NodeStore>,
        version: String,
    ) -> Self {
        let (to_peers_tx, _) = broadcast::channel(PEER_CHANNEL_CAPACITY);
        let (to_pool_tx, to_pool_rx) = mpsc::channel(PEER_CHANNEL_CAPACITY);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);
        let node_list = NodeList::new(store, config.strict_reputation);

        let state = Arc::new(PoolState {
            config,
            node_key,
            version,
            node_list,
            peer_map: Default::default(),
            pending_outbound: Default::default(),
            pending_inbound: Default::default(),
            our_node_state: Default::default(),
            reachability: Default::default(),
            listen_port: Default::default(),
            connected: Default::default(),
            disconnecting: Default::default(),
            to_peers_tx,
            to_pool_tx,
            events_tx,
        });

        Self {
            state,
            to_pool_rx: Some(to_pool_rx),
            shutdown_tx,
            supervisor: None,
            bootstrap: None,
        }
    }

    pub fn node_pub_key(&self) -> NodePubKey {
        self.state.our_pub_key()
    }

    pub fn alias(&self) -> String {
        self.state.our_pub_key().alias()
    }

    /// The port we are actually listening on, once `init` has bound it.
    pub fn listen_port(&self) -> Option<u16> {
        *self.state.listen_port.lock().unwrap()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.state.events_tx.subscribe()
    }

    pub fn peer_count(&self) -> usize {
        self.state.peer_count()
    }

    pub fn get_peer(&self, pub_key: &NodePubKey) -> Option<PeerInfo> {
        self.state.peer_map.lock().unwrap().get(pub_key).cloned()
    }

    pub fn list_peers(&self) -> Vec<PeerInfo> {
        self.state.peer_map.lock().unwrap().values().cloned().collect()
    }

    pub fn resolve_alias(&self, alias: &str) -> Result<NodePubKey, PoolError> {
        self.state.node_list.get_pub_key_for_alias(alias)
    }

    /// Start the pool: bind the listener, resolve advertised addresses, load
    /// the node catalog, and kick off reconnection and reachability probes.
    /// Returns once listening succeeds; bulk reconnection continues in the
    /// background.
    pub async fn init(&mut self) -> Result<()> {
        let config = self.state.config.clone();
        let mut listener = None;
        let mut resolved_port = config.port;

        if config.listen {
            let bound = TcpListener::bind(("0.0.0.0", config.port))
                .await
                .context("failed to bind p2p listener")?;
            resolved_port = bound.local_addr()?.port();
            *self.state.listen_port.lock().unwrap() = Some(resolved_port);
            info!(
                "Pool {} listening for peers on port {resolved_port}",
                self.alias()
            );
            listener = Some(bound);
        }

        {
            let mut node_state = self.state.our_node_state.lock().unwrap();
            for entry in &config.addresses {
                match crate::addr::parse_address(entry, resolved_port) {
                    Ok(address) => node_state.add_address(address),
                    Err(err) => warn!("Ignoring malformed advertised address {entry}: {err:#}"),
                }
            }
        }

        if config.detect_external_ip {
            match external_ip::detect_external_ip().await {
                Ok(ip) => {
                    info!("Detected external IP {ip}");
                    self.state
                        .our_node_state
                        .lock()
                        .unwrap()
                        .add_address(Address::new(ip.to_string(), resolved_port));
                }
                Err(err) => warn!("External IP detection failed: {err:#}"),
            }
        }

        match self.state.node_list.load() {
            Ok(count) => info!("Loaded {count} known nodes"),
            Err(err) => warn!("Failed to load the node catalog: {err:#}"),
        }

        self.state.connected.store(true, Ordering::SeqCst);

        let to_pool_rx = self
            .to_pool_rx
            .take()
            .context("pool was already initialized")?;
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.supervisor = Some(tokio::spawn(run_supervisor(
            self.state.clone(),
            listener,
            to_pool_rx,
            shutdown_rx,
        )));

        let mut known: Vec<Node> = Vec::new();
        self.state.node_list.for_each(|node| {
            if !node.banned {
                known.push(node.clone());
            }
        });
        let state = self.state.clone();
        self.bootstrap = Some(tokio::spawn(async move {
            let mut attempts = Vec::new();
            for node in known {
                let state = state.clone();
                attempts.push(tokio::spawn(async move {
                    let _ = try_connect_node(&state, node, true).await;
                }));
            }
            for attempt in attempts {
                let _ = attempt.await;
            }
        }));

        for address in self.state.snapshot_node_state().addresses {
            tokio::spawn(probe_reachability(self.state.clone(), address));
        }

        Ok(())
    }

    /// Tear the pool down: cancel retries, await bulk reconnection, stop
    /// listening, and close every session with `Shutdown`.
    pub async fn disconnect(&mut self) {
        if !self.state.is_connected() {
            return;
        }
        self.state.disconnecting.store(true, Ordering::SeqCst);

        {
            let mut pending = self.state.pending_outbound.lock().unwrap();
            for (_, revoke_tx) in pending.drain() {
                let _ = revoke_tx.send(true);
            }
        }

        if let Some(bootstrap) = self.bootstrap.take() {
            let _ = bootstrap.await;
        }

        let _ = self.state.to_peers_tx.send(PoolToPeerTask::DisconnectAll {
            reason: DisconnectionReason::Shutdown,
        });
        let _ = self.shutdown_tx.send(true);

        let deadline = Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        while self.state.peer_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(SHUTDOWN_DRAIN_POLL).await;
        }
        if self.state.peer_count() > 0 {
            warn!("Shutting down with peer sessions still draining");
        }

        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.await;
        }

        self.state.connected.store(false, Ordering::SeqCst);
        self.state.disconnecting.store(false, Ordering::SeqCst);
        info!("Pool {} disconnected", self.alias());
    }

    /// Open an outbound connection to a known identity at a given address.
    /// Returns once the peer is admitted.
    pub async fn add_outbound(
        &self,
        address: Address,
        pub_key: NodePubKey,
        retry: bool,
        revoke_retries: bool,
    ) -> Result<PeerInfo, PoolError> {
        let mut revoked = register_outbound(&self.state, pub_key, revoke_retries)?;
        let result = crate::connect_to_peers::connect_address(
            &self.state,
            &address,
            Some(pub_key),
            retry,
            Some(&mut revoked),
        )
        .await;
        unregister_outbound(&self.state, &pub_key);
        let pub_key = result?;
        self.get_peer(&pub_key).ok_or(PoolError::NotConnected)
    }

    /// Cancel any pending dial retries towards `pub_key`.
    pub fn revoke_connection_retries(&self, pub_key: &NodePubKey) {
        if let Some(revoke_tx) = self.state.pending_outbound.lock().unwrap().get(pub_key) {
            let _ = revoke_tx.send(true);
        }
    }

    pub fn close_peer(
        &self,
        pub_key: &NodePubKey,
        reason: Option<DisconnectionReason>,
    ) -> Result<(), PoolError> {
        if !self.state.peer_map.lock().unwrap().contains_key(pub_key) {
            return Err(PoolError::NotConnected);
        }
        let _ = self.state.to_peers_tx.send(PoolToPeerTask::Disconnect {
            target: *pub_key,
            reason: reason.unwrap_or(DisconnectionReason::Shutdown),
        });
        Ok(())
    }

    /// Durably ban a node and close any session with it.
    pub fn ban_node(&self, pub_key: &NodePubKey) -> Result<(), PoolError> {
        self.state.node_list.ban(pub_key)?;
        ban_side_effects(&self.state, *pub_key);
        Ok(())
    }

    pub async fn unban_node(&self, pub_key: &NodePubKey, reconnect: bool) -> Result<(), PoolError> {
        self.state.node_list.un_ban(pub_key)?;
        if reconnect {
            if let Some(node) = self.state.node_list.get(pub_key) {
                let state = self.state.clone();
                tokio::spawn(async move {
                    let _ = try_connect_node(&state, node, true).await;
                });
            }
        }
        Ok(())
    }

    /// Ask a connected peer for its peer list.
    pub fn discover_nodes(&self, pub_key: &NodePubKey) -> Result<(), PoolError> {
        if !self.state.peer_map.lock().unwrap().contains_key(pub_key) {
            return Err(PoolError::NotConnected);
        }
        let _ = self.state.to_peers_tx.send(PoolToPeerTask::Send {
            target: *pub_key,
            packet: Packet::new(PacketBody::GetNodes),
        });
        Ok(())
    }

    pub fn add_reputation_event(
        &self,
        pub_key: &NodePubKey,
        event: ReputationEvent,
    ) -> Result<(), PoolError> {
        apply_reputation(&self.state, *pub_key, event)
    }

    pub fn send_to_peer(&self, pub_key: &NodePubKey, packet: Packet) -> Result<(), PoolError> {
        if !self.state.peer_map.lock().unwrap().contains_key(pub_key) {
            return Err(PoolError::NotConnected);
        }
        let _ = self.state.to_peers_tx.send(PoolToPeerTask::Send {
            target: *pub_key,
            packet,
        });
        Ok(())
    }

    /// Send an order to every peer trading its pair. Does not await
    /// individual sends; a slow peer is closed by its own send-queue stall
    /// detector instead of blocking the broadcast.
    pub fn broadcast_order(&self, order: OrderPortion) {
        let _ = self
            .state
            .to_peers_tx
            .send(PoolToPeerTask::BroadcastOrder(order));
    }

    pub fn broadcast_order_invalidation(
        &self,
        portion: OrderInvalidationPortion,
        exclude: Option<NodePubKey>,
    ) {
        let _ = self
            .state
            .to_peers_tx
            .send(PoolToPeerTask::BroadcastOrderInvalidation { portion, exclude });
    }

    /// Replace the set of pairs we advertise and notify all peers.
    pub fn update_pairs(&self, pair_ids: Vec<String>) {
        let snapshot = {
            let mut node_state = self.state.our_node_state.lock().unwrap();
            node_state.pairs = pair_ids;
            node_state.clone()
        };
        self.push_node_state(snapshot);
    }

    /// Merge an auxiliary chain update into our advertised state and notify
    /// all peers.
    pub fn update_aux_state(&self, update: AuxStateUpdate) {
        let snapshot = {
            let mut node_state = self.state.our_node_state.lock().unwrap();
            if let Some(identifier) = update.identifier {
                node_state
                    .aux_identifiers
                    .insert(update.currency.clone(), identifier);
            }
            if let Some(pub_key) = update.pub_key {
                node_state
                    .aux_pub_keys
                    .insert(update.currency.clone(), pub_key);
            }
            if let Some(uris) = update.uris {
                node_state.aux_uris.insert(update.currency.clone(), uris);
            }
            if let Some(token_identifier) = update.token_identifier {
                node_state
                    .token_identifiers
                    .insert(update.currency.clone(), token_identifier);
            }
            node_state.clone()
        };
        self.push_node_state(snapshot);
    }

    fn push_node_state(&self, snapshot: NodeState) {
        let _ = self
            .state
            .to_peers_tx
            .send(PoolToPeerTask::NodeStateUpdate(snapshot));
    }
}

/// Apply one reputation event; on crossing the ban threshold, ban and evict.
fn apply_reputation(
    state: &SharedPoolState,
    pub_key: NodePubKey,
    event: ReputationEvent,
) -> Result<(), PoolError> {
    debug!("Reputation event {event} for {}", pub_key.alias());
    let outcome = state.node_list.add_reputation_event(&pub_key, event)?;
    if outcome.banned_now {
        ban_side_effects(state, pub_key);
    }
    Ok(())
}

/// What happens to live connections when a node becomes banned, however it
/// got there.
fn ban_side_effects(state: &SharedPoolState, pub_key: NodePubKey) {
    if let Some(revoke_tx) = state.pending_outbound.lock().unwrap().remove(&pub_key) {
        let _ = revoke_tx.send(true);
    }
    state.emit(PoolEvent::NodeBan { pub_key });
    let _ = state.to_peers_tx.send(PoolToPeerTask::Disconnect {
        target: pub_key,
        reason: DisconnectionReason::Banned,
    });
}

/// Feed gossiped node entries into outbound connection attempts. Only
/// genuinely new attempts are started: connected, pending, banned, and (when
/// `allow_known` is off) already-catalogued nodes are skipped.
pub(crate) fn connect_nodes(
    state: &SharedPoolState,
    nodes: Vec<NodeConnectInfo>,
    allow_known: bool,
    retry: bool,
) {
    let our_key = state.our_pub_key();
    for info in nodes {
        if info.pub_key == our_key || info.addresses.is_empty() {
            continue;
        }
        if state.node_list.is_banned(&info.pub_key) {
            continue;
        }
        if state.peer_map.lock().unwrap().contains_key(&info.pub_key) {
            continue;
        }
        if state
            .pending_outbound
            .lock()
            .unwrap()
            .contains_key(&info.pub_key)
        {
            continue;
        }
        if !allow_known && state.node_list.has(&info.pub_key) {
            continue;
        }

        // Prefer what we already know about the node, topped up with the
        // gossiped addresses.
        let node = match state.node_list.get(&info.pub_key) {
            Some(mut node) => {
                for address in &info.addresses {
                    if !node.addresses.contains(address) {
                        node.addresses.push(address.clone());
                    }
                }
                node
            }
            None => Node::new(info.pub_key, info.addresses, None),
        };

        let state = state.clone();
        tokio::spawn(async move {
            let _ = try_connect_node(&state, node, retry).await;
        });
    }
}

/// The pool's supervisory loop: accepts inbound sockets, reacts to peer task
/// reports, and runs the periodic discovery sweep.
async fn run_supervisor(
    state: SharedPoolState,
    listener: Option<TcpListener>,
    mut to_pool_rx: mpsc::Receiver<PeerTaskToPool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let discover_period = (state.config.discover && state.config.discover_minutes > 0)
        .then(|| Duration::from_secs(u64::from(state.config.discover_minutes) * 60));
    let discover_timer = tokio::time::sleep(discover_period.unwrap_or(TIMER_DISABLED));
    tokio::pin!(discover_timer);

    loop {
        select! {
            _ = shutdown_rx.changed() => {
                debug!("Supervisor received the shutdown signal");
                break;
            }

            accepted = async { listener.as_ref().unwrap().accept().await }, if listener.is_some() => {
                match accepted {
                    Ok((stream, peer_address)) => {
                        if state.is_disconnecting() {
                            continue;
                        }
                        if state.node_list.is_banned_host(&peer_address.ip().to_string()) {
                            info!("Rejecting inbound connection from banned host {peer_address}");
                            continue;
                        }
                        tokio::spawn(answer_peer_wrapper(state.clone(), stream, peer_address));
                    }
                    Err(err) => warn!("Failed to accept an inbound connection: {err}"),
                }
            }

            message = to_pool_rx.recv() => {
                let Some(message) = message else { break };
                handle_peer_task_message(&state, message);
            }

            _ = &mut discover_timer => {
                if let Some(period) = discover_period {
                    debug!("Running the periodic discovery sweep");
                    let _ = state.to_peers_tx.send(PoolToPeerTask::MakeDiscoveryRequest);
                    discover_timer.as_mut().reset(Instant::now() + period);
                }
            }
        }
    }
}

fn handle_peer_task_message(state: &SharedPoolState, message: PeerTaskToPool) {
    match message {
        PeerTaskToPool::PeerOpened { pub_key } => {
            if state.config.discover {
                let _ = state.to_peers_tx.send(PoolToPeerTask::Send {
                    target: pub_key,
                    packet: Packet::new(PacketBody::GetNodes),
                });
            }
            state.emit(PoolEvent::PeerActive { pub_key });
        }

        PeerTaskToPool::PeerClosed {
            pub_key,
            inbound,
            sent_reason,
            recv_reason,
            ..
        } => {
            let sent_ok = matches!(sent_reason, None | Some(DisconnectionReason::ResponseStalling));
            let recv_ok = matches!(
                recv_reason,
                None | Some(
                    DisconnectionReason::ResponseStalling
                        | DisconnectionReason::AlreadyConnected
                        | DisconnectionReason::Shutdown
                )
            );
            let should_reconnect = !inbound
                && sent_ok
                && recv_ok
                && state.is_connected()
                && !state.is_disconnecting();
            if should_reconnect {
                if let Some(node) = state.node_list.get(&pub_key) {
                    if !node.banned && (!node.addresses.is_empty() || node.last_address.is_some()) {
                        info!("Attempting to reconnect to peer {}", pub_key.alias());
                        let state = state.clone();
                        tokio::spawn(async move {
                            let _ = try_connect_node(&state, node, true).await;
                        });
                    }
                }
            }
        }

        PeerTaskToPool::NodesReceived { from, nodes } => {
            debug!("Received {} gossiped nodes from {}", nodes.len(), from.alias());
            connect_nodes(state, nodes, true, false);
        }

        PeerTaskToPool::Reputation { pub_key, event } => {
            if let Err(err) = apply_reputation(state, pub_key, event) {
                debug!("Could not apply reputation event: {err}");
            }
        }

        PeerTaskToPool::NodeStateUpdated { pub_key, state: node_state } => {
            if let Err(err) =
                state
                    .node_list
                    .update_addresses(&pub_key, node_state.addresses, None)
            {
                debug!("Could not refresh addresses for {}: {err}", pub_key.alias());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::shared::wait_until;
    use crate::tests::shared::PoolHarness;
    use crate::tests::shared::TestTiming;
    use tracing_test::traced_test;

    /// Pool A dials its own advertised address; the handshake must end at
    /// the self-connection rejection, prove reachability, and leave the peer
    /// map untouched.
    #[tokio::test]
    #[traced_test]
    async fn self_dial_proves_reachability() {
        let mut a = PoolHarness::builder(0xA1)
            .advertise_loopback()
            .build()
            .await;

        let address = a.advertised_address();
        assert!(
            wait_until(Duration::from_secs(2), || {
                a.pool
                    .state
                    .reachability
                    .lock()
                    .unwrap()
                    .get(&address)
                    .copied()
                    .unwrap_or(false)
            })
            .await,
            "reachability probe must verify our own address"
        );
        assert_eq!(a.pool.peer_count(), 0);

        a.pool.disconnect().await;
    }

    /// Two pools dial each other simultaneously, repeatedly. After every
    /// race exactly one connection survives and both sides agree on it.
    #[tokio::test]
    async fn duplicate_connection_race_converges() {
        for _ in 0..25 {
            let mut a = PoolHarness::builder(0xA1)
                .timing(TestTiming {
                    stall_interval: Duration::from_millis(600),
                    ping_interval: Duration::from_millis(150),
                    ..TestTiming::fast()
                })
                .build()
                .await;
            let mut b = PoolHarness::builder(0xB2)
                .timing(TestTiming {
                    stall_interval: Duration::from_millis(600),
                    ping_interval: Duration::from_millis(150),
                    ..TestTiming::fast()
                })
                .build()
                .await;

            let a_to_b = a.pool.add_outbound(b.listen_address(), b.pub_key(), false, false);
            let b_to_a = b.pool.add_outbound(a.listen_address(), a.pub_key(), false, false);
            // either direction may have lost the tie-break
            let _ = tokio::join!(a_to_b, b_to_a);

            let converged = wait_until(Duration::from_secs(3), || {
                let a_peers = a.pool.list_peers();
                let b_peers = b.pool.list_peers();
                a_peers.len() == 1
                    && b_peers.len() == 1
                    && a_peers[0].pub_key == b.pub_key()
                    && b_peers[0].pub_key == a.pub_key()
            })
            .await;
            assert!(converged, "both sides must settle on exactly one session");

            // and it stays settled
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert_eq!(a.pool.peer_count(), 1);
            assert_eq!(b.pool.peer_count(), 1);

            // the surviving session is usable
            a.pool.send_to_peer(&b.pub_key(), Packet::ping()).unwrap();

            a.pool.disconnect().await;
            b.pool.disconnect().await;
        }
    }

    /// A learns about C from B's `Nodes` gossip reply and connects to it.
    #[tokio::test]
    #[traced_test]
    async fn gossip_propagates_new_nodes() {
        let mut a = PoolHarness::builder(0xA1).build().await;
        let mut b = PoolHarness::builder(0xB2).build().await;
        let mut c = PoolHarness::builder(0xC3).advertise_loopback().build().await;

        b.pool
            .add_outbound(c.listen_address(), c.pub_key(), false, false)
            .await
            .unwrap();
        a.pool
            .add_outbound(b.listen_address(), b.pub_key(), false, false)
            .await
            .unwrap();

        a.pool.discover_nodes(&b.pub_key()).unwrap();

        let discovered = wait_until(Duration::from_secs(2), || {
            a.pool.get_peer(&b.pub_key()).is_some() && a.pool.get_peer(&c.pub_key()).is_some()
        })
        .await;
        assert!(discovered, "A must hold sessions with both B and C");

        a.pool.disconnect().await;
        b.pool.disconnect().await;
        c.pool.disconnect().await;
    }

    /// A peer presenting a version below our floor is turned away during the
    /// handshake and never becomes a node record.
    #[tokio::test]
    #[traced_test]
    async fn version_rejection_surfaces_incompatible_version() {
        let mut gatekeeper = PoolHarness::builder(0xA1)
            .min_compatible_version("2.0.0")
            .version("2.1.0")
            .build()
            .await;
        let mut relic = PoolHarness::builder(0xB2).version("0.1.0").build().await;

        let err = gatekeeper
            .pool
            .add_outbound(relic.listen_address(), relic.pub_key(), false, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INCOMPATIBLE_VERSION");
        assert_eq!(gatekeeper.pool.peer_count(), 0);
        assert!(!gatekeeper.pool.state.node_list.has(&relic.pub_key()));

        gatekeeper.pool.disconnect().await;
        relic.pool.disconnect().await;
    }

    /// Reputation events summing past the threshold ban the node, close its
    /// session with `Banned`, and block future outbound attempts.
    #[tokio::test]
    #[traced_test]
    async fn ban_cascade() {
        let mut a = PoolHarness::builder(0xA1).build().await;
        let mut b = PoolHarness::builder(0xB2).build().await;
        let mut events = a.pool.subscribe();

        a.pool
            .add_outbound(b.listen_address(), b.pub_key(), false, false)
            .await
            .unwrap();

        a.pool
            .add_reputation_event(&b.pub_key(), ReputationEvent::SwapAbuse)
            .unwrap();
        a.pool
            .add_reputation_event(&b.pub_key(), ReputationEvent::InvalidAuth)
            .unwrap();

        let mut saw_node_ban = false;
        let mut saw_banned_close = false;
        let deadline = Instant::now() + Duration::from_secs(2);
        while !(saw_node_ban && saw_banned_close) && Instant::now() < deadline {
            let event = tokio::time::timeout_at(deadline, events.recv()).await;
            match event {
                Ok(Ok(PoolEvent::NodeBan { pub_key })) => {
                    assert_eq!(pub_key, b.pub_key());
                    saw_node_ban = true;
                }
                Ok(Ok(PoolEvent::PeerClose { pub_key, sent_reason, .. })) => {
                    assert_eq!(pub_key, b.pub_key());
                    assert_eq!(sent_reason, Some(DisconnectionReason::Banned));
                    saw_banned_close = true;
                }
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_node_ban, "node.ban must fire");
        assert!(saw_banned_close, "the session must close with Banned");
        assert_eq!(a.pool.peer_count(), 0);

        let err = a
            .pool
            .add_outbound(b.listen_address(), b.pub_key(), false, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NODE_IS_BANNED");

        a.pool.disconnect().await;
        b.pool.disconnect().await;
    }

    /// A stalled outbound session closes with `ResponseStalling` and is
    /// transparently re-established.
    #[tokio::test]
    #[traced_test]
    async fn reconnect_on_stall() {
        // A goes quiet (no pings) and expects traffic quickly; B neither
        // pings nor stalls, so A is guaranteed to hit its stall window.
        let mut a = PoolHarness::builder(0xA1)
            .timing(TestTiming {
                stall_interval: Duration::from_millis(400),
                ping_interval: Duration::from_secs(30),
                ..TestTiming::fast()
            })
            .build()
            .await;
        let mut b = PoolHarness::builder(0xB2)
            .timing(TestTiming {
                stall_interval: Duration::from_secs(30),
                ping_interval: Duration::from_secs(30),
                ..TestTiming::fast()
            })
            .build()
            .await;
        let mut events = a.pool.subscribe();

        a.pool
            .add_outbound(b.listen_address(), b.pub_key(), true, false)
            .await
            .unwrap();

        let mut saw_first_active = false;
        let mut saw_stall_close = false;
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let event = match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(event)) => event,
                _ => panic!("expected active, stall close, and re-active events"),
            };
            match event {
                PoolEvent::PeerActive { pub_key } => {
                    assert_eq!(pub_key, b.pub_key());
                    if saw_stall_close {
                        break; // reconnected
                    }
                    saw_first_active = true;
                }
                PoolEvent::PeerClose { sent_reason, .. } => {
                    assert!(saw_first_active);
                    assert_eq!(sent_reason, Some(DisconnectionReason::ResponseStalling));
                    saw_stall_close = true;
                }
                _ => continue,
            }
        }

        a.pool.disconnect().await;
        b.pool.disconnect().await;
    }

    #[tokio::test]
    async fn add_outbound_rejects_self_and_duplicates() {
        let mut a = PoolHarness::builder(0xA1).build().await;
        let mut b = PoolHarness::builder(0xB2).build().await;

        let err = a
            .pool
            .add_outbound(a.listen_address(), a.pub_key(), false, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ATTEMPTED_CONNECTION_TO_SELF");

        a.pool
            .add_outbound(b.listen_address(), b.pub_key(), false, false)
            .await
            .unwrap();
        let err = a
            .pool
            .add_outbound(b.listen_address(), b.pub_key(), false, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NODE_ALREADY_CONNECTED");

        a.pool.disconnect().await;
        b.pool.disconnect().await;
    }

    /// Feeding the same gossip twice must not start duplicate outbound
    /// attempts.
    #[tokio::test]
    async fn connect_nodes_is_idempotent() {
        let mut a = PoolHarness::builder(0xA1).build().await;

        // a listener that accepts but never handshakes keeps the attempt
        // pending for the full handshake deadline
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let sink = tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });

        let ghost = crate::node_key::NodeKey::from_bytes([0xE5; 32]).pub_key();
        let gossip = vec![NodeConnectInfo {
            pub_key: ghost,
            addresses: vec![Address::new("127.0.0.1", port)],
        }];

        connect_nodes(&a.pool.state, gossip.clone(), true, false);
        connect_nodes(&a.pool.state, gossip, true, false);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            a.pool.state.pending_outbound.lock().unwrap().len(),
            1,
            "only one outbound attempt may be pending"
        );

        sink.abort();
        a.pool.disconnect().await;
    }

    #[tokio::test]
    async fn revoked_retries_abort_promptly() {
        let mut a = PoolHarness::builder(0xA1).build().await;

        // grab a port with no listener behind it
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = dead.local_addr().unwrap().port();
        drop(dead);

        let target = crate::node_key::NodeKey::from_bytes([0xE5; 32]).pub_key();
        let address = Address::new("127.0.0.1", port);

        let pool_state = a.pool.state.clone();
        let attempt = tokio::spawn(async move {
            let mut revoked = register_outbound(&pool_state, target, false).unwrap();
            crate::connect_to_peers::connect_address(
                &pool_state,
                &address,
                Some(target),
                true,
                Some(&mut revoked),
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        a.pool.revoke_connection_retries(&target);

        let result = tokio::time::timeout(Duration::from_secs(2), attempt)
            .await
            .expect("revocation must abort the retry loop")
            .unwrap();
        assert!(result.is_err());

        a.pool.disconnect().await;
    }

    #[tokio::test]
    async fn ban_then_unban_round_trip_allows_reconnect() {
        let mut a = PoolHarness::builder(0xA1).build().await;
        let mut b = PoolHarness::builder(0xB2).build().await;

        a.pool
            .add_outbound(b.listen_address(), b.pub_key(), false, false)
            .await
            .unwrap();

        a.pool.ban_node(&b.pub_key()).unwrap();
        assert!(matches!(
            a.pool.ban_node(&b.pub_key()),
            Err(PoolError::NodeAlreadyBanned(_))
        ));
        assert!(
            wait_until(Duration::from_secs(2), || a.pool.peer_count() == 0).await,
            "banned peer must be evicted"
        );

        a.pool.unban_node(&b.pub_key(), true).await.unwrap();
        assert!(
            wait_until(Duration::from_secs(3), || a.pool.peer_count() == 1).await,
            "unban with reconnect must restore the session"
        );

        a.pool.disconnect().await;
        b.pool.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_closes_sessions_with_shutdown() {
        let mut a = PoolHarness::builder(0xA1).build().await;
        let mut b = PoolHarness::builder(0xB2).build().await;
        let mut b_events = b.pool.subscribe();

        a.pool
            .add_outbound(b.listen_address(), b.pub_key(), false, false)
            .await
            .unwrap();

        a.pool.disconnect().await;
        assert_eq!(a.pool.peer_count(), 0);

        loop {
            match tokio::time::timeout(Duration::from_secs(2), b_events.recv())
                .await
                .expect("B must observe the close")
                .unwrap()
            {
                PoolEvent::PeerClose { recv_reason, .. } => {
                    assert_eq!(recv_reason, Some(DisconnectionReason::Shutdown));
                    break;
                }
                _ => continue,
            }
        }

        // operations on a closed pool fail fast
        let err = a
            .pool
            .add_outbound(b.listen_address(), b.pub_key(), false, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "POOL_CLOSED");

        b.pool.disconnect().await;
    }
}
