use std::net::SocketAddr;
use std::time::Duration;

use futures::SinkExt;
use futures::TryStreamExt;
use rand::RngCore;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::PoolError;
use crate::framer::Framer;
use crate::models::channel::PeerTaskToPool;
use crate::models::node::Address;
use crate::models::node::NodePubKey;
use crate::models::node::ReputationEvent;
use crate::models::packet::DisconnectionReason;
use crate::models::packet::HelloBody;
use crate::models::packet::Packet;
use crate::models::packet::PacketBody;
use crate::models::peer::PeerInfo;
use crate::models::state::SharedPoolState;
use crate::node_key::verify_signature;
use crate::peer_loop::PeerLoopHandler;

/// How long the duplicate-resolution wait polls for the existing session to
/// go away.
const DUPLICATE_WAIT_POLL: Duration = Duration::from_millis(100);

/// How a connection attempt ended when it did not produce an open session.
#[derive(Debug)]
pub(crate) struct HandshakeFailure {
    /// Reason we sent to the remote before giving up, if any.
    pub sent: Option<DisconnectionReason>,
    /// Reason the remote sent us before hanging up, if any.
    pub recv: Option<DisconnectionReason>,
    pub error: PoolError,
}

impl HandshakeFailure {
    fn from_error(error: PoolError) -> Self {
        Self {
            sent: None,
            recv: None,
            error,
        }
    }

    fn sent(reason: DisconnectionReason, error: PoolError) -> Self {
        Self {
            sent: Some(reason),
            recv: None,
            error,
        }
    }

    pub fn involves_self_connection(&self) -> bool {
        self.sent == Some(DisconnectionReason::ConnectedToSelf)
            || self.recv == Some(DisconnectionReason::ConnectedToSelf)
            || matches!(self.error, PoolError::AttemptedConnectionToSelf)
    }
}

fn wire_failure(err: impl std::fmt::Display) -> HandshakeFailure {
    HandshakeFailure::from_error(PoolError::WireProtocol(
        crate::framer::FramerError::MalformedPacket(err.to_string()),
    ))
}

/// Check the remote's version string: it must parse as semver and, when a
/// floor is configured, reach it.
pub(crate) fn validate_version(
    version: &str,
    min_compatible: Option<&str>,
) -> Result<(), (DisconnectionReason, PoolError)> {
    let version_parsed = semver::Version::parse(version).map_err(|_| {
        (
            DisconnectionReason::MalformedVersion,
            PoolError::MalformedVersion(version.to_string()),
        )
    })?;
    if let Some(min) = min_compatible {
        // Our own configuration must parse; a bad floor is a deployment bug.
        let min_parsed = semver::Version::parse(min)
            .unwrap_or_else(|_| panic!("min compatible version must be valid semver, got {min}"));
        if version_parsed < min_parsed {
            return Err((
                DisconnectionReason::IncompatibleProtocolVersion,
                PoolError::IncompatibleVersion(version.to_string(), min.to_string()),
            ));
        }
    }
    Ok(())
}

fn validate_hello(
    state: &SharedPoolState,
    hello: &HelloBody,
    expected: Option<NodePubKey>,
) -> Result<(), (DisconnectionReason, PoolError)> {
    if !verify_signature(&hello.node_pub_key, &hello.session_nonce, &hello.signature) {
        return Err((DisconnectionReason::WireProtocolErr, PoolError::InvalidAuth));
    }

    if hello.node_pub_key == state.our_pub_key() {
        return Err((
            DisconnectionReason::ConnectedToSelf,
            PoolError::AttemptedConnectionToSelf,
        ));
    }

    validate_version(&hello.version, state.config.min_compatible_version.as_deref())?;

    if let Some(expected) = expected {
        if hello.node_pub_key != expected {
            return Err((DisconnectionReason::WireProtocolErr, PoolError::InvalidAuth));
        }
    }

    Ok(())
}

fn build_hello(state: &SharedPoolState) -> HelloBody {
    let mut session_nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut session_nonce);
    let signature = state.node_key.sign(&session_nonce);
    HelloBody {
        version: state.version.clone(),
        node_pub_key: state.our_pub_key(),
        session_nonce,
        signature,
        node_state: state.snapshot_node_state(),
    }
}

async fn send_handshake_packet<S>(peer: &mut S, packet: Packet) -> Result<(), HandshakeFailure>
where
    S: futures::Sink<Packet> + Unpin,
    <S as futures::Sink<Packet>>::Error: std::error::Error + Send + Sync + 'static,
{
    peer.send(packet).await.map_err(wire_failure)
}

async fn next_handshake_packet<S>(peer: &mut S) -> Result<Packet, HandshakeFailure>
where
    S: futures::TryStream<Ok = Packet> + Unpin,
    <S as futures::TryStream>::Error: std::error::Error + Send + Sync + 'static,
{
    match peer.try_next().await {
        Ok(Some(packet)) => Ok(packet),
        Ok(None) => Err(HandshakeFailure::from_error(PoolError::NotConnected)),
        Err(err) => Err(wire_failure(err)),
    }
}

/// Best-effort: tell the remote why we are hanging up.
async fn send_disconnecting<S>(peer: &mut S, reason: DisconnectionReason)
where
    S: futures::Sink<Packet> + Unpin,
    <S as futures::Sink<Packet>>::Error: std::error::Error + Send + Sync + 'static,
{
    let _ = timeout(
        Duration::from_secs(1),
        peer.send(Packet::disconnecting(reason, None)),
    )
    .await;
}

/// Run the two-phase handshake over an established stream. On success the
/// remote has confirmed our session and we theirs; the peer is ready for
/// admission.
pub(crate) async fn exchange_handshake<S>(
    peer: &mut S,
    state: &SharedPoolState,
    expected: Option<NodePubKey>,
    inbound: bool,
) -> Result<HelloBody, HandshakeFailure>
where
    S: futures::Sink<Packet> + futures::TryStream<Ok = Packet> + Unpin,
    <S as futures::Sink<Packet>>::Error: std::error::Error + Send + Sync + 'static,
    <S as futures::TryStream>::Error: std::error::Error + Send + Sync + 'static,
{
    let our_hello = build_hello(state);

    if !inbound {
        send_handshake_packet(peer, Packet::new(PacketBody::Hello(our_hello.clone()))).await?;
    }

    let (their_hello_id, their_hello) = match next_handshake_packet(peer).await? {
        Packet {
            header,
            body: PacketBody::Hello(hello),
        } => (header.id, hello),
        Packet {
            body: PacketBody::Disconnecting(body),
            ..
        } => {
            return Err(HandshakeFailure {
                sent: None,
                recv: Some(body.reason),
                error: PoolError::NotConnected,
            });
        }
        other => {
            send_disconnecting(peer, DisconnectionReason::WireProtocolErr).await;
            return Err(HandshakeFailure::sent(
                DisconnectionReason::WireProtocolErr,
                PoolError::WireProtocol(crate::framer::FramerError::MalformedPacket(format!(
                    "expected hello, got {}",
                    other.get_type()
                ))),
            ));
        }
    };

    if let Err((reason, error)) = validate_hello(state, &their_hello, expected) {
        if matches!(error, PoolError::InvalidAuth) {
            // The claimed identity may be a node we know; let its record pay.
            let _ = state
                .node_list
                .add_reputation_event(&their_hello.node_pub_key, ReputationEvent::InvalidAuth);
        }
        send_disconnecting(peer, reason).await;
        return Err(HandshakeFailure::sent(reason, error));
    }

    if inbound {
        send_handshake_packet(peer, Packet::new(PacketBody::Hello(our_hello))).await?;
    }

    send_handshake_packet(
        peer,
        Packet::response(their_hello_id, PacketBody::SessionInitAck),
    )
    .await?;

    match next_handshake_packet(peer).await? {
        Packet {
            body: PacketBody::SessionInitAck,
            ..
        } => {}
        Packet {
            body: PacketBody::Disconnecting(body),
            ..
        } => {
            return Err(HandshakeFailure {
                sent: None,
                recv: Some(body.reason),
                error: PoolError::NotConnected,
            });
        }
        other => {
            send_disconnecting(peer, DisconnectionReason::WireProtocolErr).await;
            return Err(HandshakeFailure::sent(
                DisconnectionReason::WireProtocolErr,
                PoolError::WireProtocol(crate::framer::FramerError::MalformedPacket(format!(
                    "expected session init ack, got {}",
                    other.get_type()
                ))),
            ));
        }
    }

    Ok(their_hello)
}

/// `exchange_handshake` under the total handshake deadline.
pub(crate) async fn perform_handshake<S>(
    peer: &mut S,
    state: &SharedPoolState,
    expected: Option<NodePubKey>,
    inbound: bool,
) -> Result<HelloBody, HandshakeFailure>
where
    S: futures::Sink<Packet> + futures::TryStream<Ok = Packet> + Unpin,
    <S as futures::Sink<Packet>>::Error: std::error::Error + Send + Sync + 'static,
    <S as futures::TryStream>::Error: std::error::Error + Send + Sync + 'static,
{
    match timeout(
        state.config.timing.stall_interval,
        exchange_handshake(peer, state, expected, inbound),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(HandshakeFailure::from_error(PoolError::Io(
            std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake deadline exceeded"),
        ))),
    }
}

/// Admit a handshaked peer into the pool, applying the admission checks and
/// the duplicate-connection tie-break. Returns the new session's id.
///
/// Duplicate resolution: the connection whose initiator has the higher pub
/// key loses immediately; the lower initiator's connection gets up to the
/// stall interval for the existing session to vacate, then replaces it. Both
/// ends apply the same comparison, so they converge on one surviving socket.
pub(crate) async fn admit_peer(
    state: &SharedPoolState,
    hello: &HelloBody,
    peer_address: SocketAddr,
    inbound: bool,
    dialed_address: Option<Address>,
) -> Result<u64, HandshakeFailure> {
    let pub_key = hello.node_pub_key;

    if pub_key == state.our_pub_key() {
        return Err(HandshakeFailure::sent(
            DisconnectionReason::ConnectedToSelf,
            PoolError::AttemptedConnectionToSelf,
        ));
    }

    if !state.is_connected() || state.is_disconnecting() {
        return Err(HandshakeFailure::sent(
            DisconnectionReason::NotAcceptingConnections,
            PoolError::PoolClosed,
        ));
    }

    if state.node_list.is_banned(&pub_key) {
        return Err(HandshakeFailure::sent(
            DisconnectionReason::Banned,
            PoolError::NodeIsBanned(pub_key),
        ));
    }

    let our_key = state.our_pub_key();
    let initiator = if inbound { pub_key } else { our_key };
    let other = if inbound { our_key } else { pub_key };
    let deadline = Instant::now() + state.config.timing.stall_interval;

    let session_id = loop {
        {
            let mut peers = state.peer_map.lock().unwrap();
            if !peers.contains_key(&pub_key) {
                let info = PeerInfo::new(
                    pub_key,
                    peer_address,
                    inbound,
                    hello.version.clone(),
                    hello.node_state.clone(),
                );
                let session_id = info.session_id;
                state.pending_outbound.lock().unwrap().remove(&pub_key);
                peers.insert(pub_key, info);
                break session_id;
            }
            if initiator > other {
                return Err(HandshakeFailure::sent(
                    DisconnectionReason::AlreadyConnected,
                    PoolError::NodeAlreadyConnected(pub_key),
                ));
            }
        }
        if Instant::now() >= deadline {
            return Err(HandshakeFailure::sent(
                DisconnectionReason::AlreadyConnected,
                PoolError::NodeAlreadyConnected(pub_key),
            ));
        }
        tokio::time::sleep(DUPLICATE_WAIT_POLL).await;
    };

    state.node_list.record_handshake(
        pub_key,
        hello.node_state.addresses.clone(),
        dialed_address,
    );

    info!(
        "Peer {} ({}) admitted, {} connection from {}",
        pub_key.alias(),
        hello.version,
        if inbound { "inbound" } else { "outbound" },
        peer_address
    );
    Ok(session_id)
}

/// Dial one address once, honoring the per-attempt timeout.
pub(crate) async fn dial(state: &SharedPoolState, address: &Address) -> Result<TcpStream, PoolError> {
    if address.is_onion() && !state.config.tor {
        return Err(PoolError::NodeTorAddress(address.to_string()));
    }
    let connecting = TcpStream::connect((address.host.as_str(), address.port));
    match timeout(state.config.timing.connect_timeout, connecting).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(PoolError::Io(err)),
        Err(_) => Err(PoolError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "dial timed out",
        ))),
    }
}

/// Dial with exponential backoff until the retry window closes or the
/// attempt is revoked.
async fn dial_with_retries(
    state: &SharedPoolState,
    address: &Address,
    revoked: &mut watch::Receiver<bool>,
) -> Result<TcpStream, PoolError> {
    let timing = state.config.timing;
    let started = Instant::now();
    let mut delay = timing.retry_base_delay;

    loop {
        match dial(state, address).await {
            Ok(stream) => return Ok(stream),
            Err(err @ PoolError::NodeTorAddress(_)) => return Err(err),
            Err(err) => {
                debug!("Failed to dial {address}: {err}");
            }
        }

        if started.elapsed() + delay > timing.retry_max_period {
            return Err(PoolError::ConnectionRetriesMaxPeriodExceeded);
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = revoked.changed() => {
                if changed.is_err() || *revoked.borrow() {
                    debug!("Dial retries to {address} revoked");
                    return Err(PoolError::NotConnected);
                }
            }
        }

        delay = std::cmp::min(delay * 2, timing.retry_max_delay);
    }
}

/// Reserve the outbound slot for `pub_key`, enforcing the pre-dial checks.
/// Returns the revocation signal for the attempt's dial retries.
pub(crate) fn register_outbound(
    state: &SharedPoolState,
    pub_key: NodePubKey,
    revoke_existing: bool,
) -> Result<watch::Receiver<bool>, PoolError> {
    if pub_key == state.our_pub_key() {
        return Err(PoolError::AttemptedConnectionToSelf);
    }
    if !state.is_connected() || state.is_disconnecting() {
        return Err(PoolError::PoolClosed);
    }
    if state.node_list.is_banned(&pub_key) {
        return Err(PoolError::NodeIsBanned(pub_key));
    }
    if state.peer_map.lock().unwrap().contains_key(&pub_key) {
        return Err(PoolError::NodeAlreadyConnected(pub_key));
    }

    let mut pending = state.pending_outbound.lock().unwrap();
    if pending.contains_key(&pub_key) {
        if !revoke_existing {
            return Err(PoolError::AlreadyConnecting(pub_key));
        }
        if let Some(existing) = pending.remove(&pub_key) {
            let _ = existing.send(true);
        }
    }
    let (revoke_tx, revoke_rx) = watch::channel(false);
    pending.insert(pub_key, revoke_tx);
    Ok(revoke_rx)
}

pub(crate) fn unregister_outbound(state: &SharedPoolState, pub_key: &NodePubKey) {
    state.pending_outbound.lock().unwrap().remove(pub_key);
}

/// Dial `address`, handshake, admit, and hand the session over to a spawned
/// peer loop. The caller is responsible for the pending-outbound slot.
pub(crate) async fn connect_address(
    state: &SharedPoolState,
    address: &Address,
    expected: Option<NodePubKey>,
    retry: bool,
    revoked: Option<&mut watch::Receiver<bool>>,
) -> Result<NodePubKey, PoolError> {
    let stream = if retry {
        let mut fallback = watch::channel(false).1;
        let revoked = revoked.unwrap_or(&mut fallback);
        dial_with_retries(state, address, revoked).await?
    } else {
        dial(state, address).await?
    };

    let peer_address = stream.peer_addr()?;
    let mut framed = Framed::new(stream, Framer::default());

    let hello = match perform_handshake(&mut framed, state, expected, false).await {
        Ok(hello) => hello,
        Err(failure) => {
            debug!("Outbound handshake with {address} failed: {}", failure.error);
            return Err(failure.error);
        }
    };

    let session_id = match admit_peer(state, &hello, peer_address, false, Some(address.clone())).await
    {
        Ok(session_id) => session_id,
        Err(failure) => {
            if let Some(reason) = failure.sent {
                send_disconnecting(&mut framed, reason).await;
            }
            return Err(failure.error);
        }
    };

    let pub_key = hello.node_pub_key;
    let from_pool_rx = state.to_peers_tx.subscribe();
    let _ = state
        .to_pool_tx
        .send(PeerTaskToPool::PeerOpened { pub_key })
        .await;

    let handler = PeerLoopHandler::new(state.clone(), pub_key, peer_address, false, session_id);
    tokio::spawn(async move {
        handler.run_wrapper(framed, from_pool_rx).await;
    });

    Ok(pub_key)
}

/// Attempt an outbound connection to a known node: its last good address
/// first, then the rest by recency. If everything fails and `retry` is set,
/// fall back to retrying the best address with backoff.
pub(crate) async fn try_connect_node(
    state: &SharedPoolState,
    node: crate::models::node::Node,
    retry: bool,
) -> Result<NodePubKey, PoolError> {
    let pub_key = node.pub_key;
    let mut revoked = register_outbound(state, pub_key, false)?;

    let result = try_connect_node_inner(state, &node, retry, &mut revoked).await;
    unregister_outbound(state, &pub_key);
    if let Err(err) = &result {
        debug!("Could not connect to node {}: {err}", pub_key.alias());
    }
    result
}

async fn try_connect_node_inner(
    state: &SharedPoolState,
    node: &crate::models::node::Node,
    retry: bool,
    revoked: &mut watch::Receiver<bool>,
) -> Result<NodePubKey, PoolError> {
    let pub_key = node.pub_key;

    let mut candidates: Vec<Address> = Vec::new();
    if let Some(last) = &node.last_address {
        candidates.push(last.clone());
    }
    let mut rest = node.addresses.clone();
    crate::addr::sort_by_last_connected(&mut rest);
    for address in rest {
        if !candidates.contains(&address) {
            candidates.push(address);
        }
    }
    if candidates.is_empty() {
        return Err(PoolError::NotConnected);
    }

    for address in &candidates {
        match connect_address(state, address, Some(pub_key), false, None).await {
            Ok(pub_key) => return Ok(pub_key),
            // Another session won; stop trying addresses.
            Err(
                err @ (PoolError::NodeAlreadyConnected(_)
                | PoolError::NodeIsBanned(_)
                | PoolError::PoolClosed
                | PoolError::AttemptedConnectionToSelf),
            ) => return Err(err),
            Err(err) => {
                debug!("Address {address} for {} failed: {err}", pub_key.alias());
            }
        }
    }

    if retry {
        connect_address(state, &candidates[0], Some(pub_key), true, Some(revoked)).await
    } else {
        Err(PoolError::NotConnected)
    }
}

/// Handle one accepted inbound socket: handshake, admit, then run the peer
/// loop until the session ends.
pub(crate) async fn answer_peer_wrapper(
    state: SharedPoolState,
    stream: TcpStream,
    peer_address: SocketAddr,
) {
    state.pending_inbound.lock().unwrap().insert(peer_address);
    if let Err(err) = answer_peer(&state, stream, peer_address).await {
        debug!("Inbound connection from {peer_address} ended: {err}");
    }
    state.pending_inbound.lock().unwrap().remove(&peer_address);
}

async fn answer_peer(
    state: &SharedPoolState,
    stream: TcpStream,
    peer_address: SocketAddr,
) -> Result<(), PoolError> {
    debug!("Established incoming TCP connection with {peer_address}");
    let mut framed = Framed::new(stream, Framer::default());

    let hello = match perform_handshake(&mut framed, state, None, true).await {
        Ok(hello) => hello,
        Err(failure) => return Err(failure.error),
    };

    let session_id = match admit_peer(state, &hello, peer_address, true, None).await {
        Ok(session_id) => session_id,
        Err(failure) => {
            if let Some(reason) = failure.sent {
                send_disconnecting(&mut framed, reason).await;
            }
            return Err(failure.error);
        }
    };

    state.pending_inbound.lock().unwrap().remove(&peer_address);

    let pub_key = hello.node_pub_key;
    let from_pool_rx = state.to_peers_tx.subscribe();
    let _ = state
        .to_pool_tx
        .send(PeerTaskToPool::PeerOpened { pub_key })
        .await;

    let handler = PeerLoopHandler::new(state.clone(), pub_key, peer_address, true, session_id);
    handler.run_wrapper(framed, from_pool_rx).await;
    Ok(())
}

/// Dial one of our own advertised addresses. Reaching the self-connection
/// rejection proves the address routes back to us from the outside.
pub(crate) async fn probe_reachability(state: SharedPoolState, address: Address) {
    let stream = match dial(&state, &address).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!("Advertised address {address} is unreachable: {err}");
            return;
        }
    };
    let mut framed = Framed::new(stream, Framer::default());
    match perform_handshake(&mut framed, &state, None, false).await {
        Err(failure) if failure.involves_self_connection() => {
            info!("Verified reachability of advertised address {address}");
            state.reachability.lock().unwrap().insert(address, true);
        }
        Ok(hello) => {
            warn!(
                "Advertised address {address} answered as foreign node {}",
                hello.node_pub_key.alias()
            );
        }
        Err(failure) => {
            warn!(
                "Could not verify reachability of advertised address {address}: {}",
                failure.error
            );
        }
    }
}
