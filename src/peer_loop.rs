use std::net::SocketAddr;

use anyhow::bail;
use anyhow::Result;
use futures::Sink;
use futures::SinkExt;
use futures::TryStream;
use futures::TryStreamExt;
use tokio::select;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::models::channel::PeerTaskToPool;
use crate::models::channel::PoolToPeerTask;
use crate::models::event::PoolEvent;
use crate::models::node::NodePubKey;
use crate::models::node::ReputationEvent;
use crate::models::packet::DisconnectionReason;
use crate::models::packet::NodeConnectInfo;
use crate::models::packet::Packet;
use crate::models::packet::PacketBody;
use crate::models::peer::SessionCloseInfo;
use crate::models::state::SharedPoolState;

/// Drives one admitted peer session: inbound dispatch, heartbeat, stall
/// detection, and the outbound send queue fed by the pool's broadcast
/// channel.
pub(crate) struct PeerLoopHandler {
    state: SharedPoolState,
    pub_key: NodePubKey,
    peer_address: SocketAddr,
    inbound: bool,
    session_id: u64,
    close_info: SessionCloseInfo,
    last_send: Instant,
    last_activity: Instant,
}

impl PeerLoopHandler {
    pub(crate) fn new(
        state: SharedPoolState,
        pub_key: NodePubKey,
        peer_address: SocketAddr,
        inbound: bool,
        session_id: u64,
    ) -> Self {
        let now = Instant::now();
        Self {
            state,
            pub_key,
            peer_address,
            inbound,
            session_id,
            close_info: SessionCloseInfo::default(),
            last_send: now,
            last_activity: now,
        }
    }

    /// Run the session to completion, then unwind it: flush the socket,
    /// vacate the peer map, and report the close to the pool.
    pub(crate) async fn run_wrapper<S>(
        mut self,
        mut peer: S,
        from_pool_rx: broadcast::Receiver<PoolToPeerTask>,
    ) where
        S: Sink<Packet> + TryStream<Ok = Packet> + Unpin,
        <S as Sink<Packet>>::Error: std::error::Error + Send + Sync + 'static,
        <S as TryStream>::Error: std::error::Error + Send + Sync + 'static,
    {
        if let Err(err) = self.run(&mut peer, from_pool_rx).await {
            debug!(
                "Peer loop for {} ended with error: {err:#}",
                self.pub_key.alias()
            );
        }
        let _ = peer.close().await;
        self.close_callback().await;
    }

    async fn run<S>(
        &mut self,
        peer: &mut S,
        mut from_pool_rx: broadcast::Receiver<PoolToPeerTask>,
    ) -> Result<()>
    where
        S: Sink<Packet> + TryStream<Ok = Packet> + Unpin,
        <S as Sink<Packet>>::Error: std::error::Error + Send + Sync + 'static,
        <S as TryStream>::Error: std::error::Error + Send + Sync + 'static,
    {
        let timing = self.state.config.timing;
        loop {
            // A peer gets the full stall window to answer our latest
            // traffic; silence both ways past the window closes the session.
            let stall_at = self.last_activity + timing.stall_interval;
            let ping_at = self.last_send + timing.ping_interval;

            select! {
                frame = peer.try_next() => {
                    match frame {
                        Ok(Some(packet)) => {
                            self.last_activity = Instant::now();
                            if self.handle_packet(peer, packet).await? {
                                break;
                            }
                        }
                        Ok(None) => {
                            info!("Peer {} closed the connection", self.pub_key.alias());
                            break;
                        }
                        Err(err) => {
                            self.report_reputation(ReputationEvent::WireProtocolErr).await;
                            self.close_gracefully(peer, DisconnectionReason::WireProtocolErr).await;
                            bail!("error receiving from peer {}: {err}", self.pub_key.alias());
                        }
                    }
                }

                task = from_pool_rx.recv() => {
                    match task {
                        Ok(task) => {
                            if self.handle_pool_task(peer, task).await? {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(count)) => {
                            warn!(
                                "Peer task for {} lagged {count} pool messages",
                                self.pub_key.alias()
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            self.close_gracefully(peer, DisconnectionReason::Shutdown).await;
                            break;
                        }
                    }
                }

                _ = tokio::time::sleep_until(ping_at) => {
                    if self.last_send.elapsed() >= timing.ping_interval {
                        self.send_packet(peer, Packet::ping()).await?;
                    }
                }

                _ = tokio::time::sleep_until(stall_at) => {
                    if self.last_activity.elapsed() >= timing.stall_interval {
                        warn!("Peer {} is stalling, closing", self.pub_key.alias());
                        self.close_gracefully(peer, DisconnectionReason::ResponseStalling).await;
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Serialize one frame out, bounded by the send high-water period. A
    /// peer that cannot drain its socket in that window is closed instead of
    /// blocking broadcasters.
    async fn send_packet<S>(&mut self, peer: &mut S, packet: Packet) -> Result<()>
    where
        S: Sink<Packet> + Unpin,
        <S as Sink<Packet>>::Error: std::error::Error + Send + Sync + 'static,
    {
        match timeout(self.state.config.timing.send_high_water, peer.send(packet)).await {
            Ok(Ok(())) => {
                self.last_send = Instant::now();
                self.last_activity = self.last_send;
                Ok(())
            }
            Ok(Err(err)) => bail!("failed to send to peer {}: {err}", self.pub_key.alias()),
            Err(_) => {
                self.close_info
                    .sent_reason
                    .get_or_insert(DisconnectionReason::ResponseStalling);
                bail!(
                    "send to peer {} did not flush within the high-water period",
                    self.pub_key.alias()
                );
            }
        }
    }

    async fn close_gracefully<S>(&mut self, peer: &mut S, reason: DisconnectionReason)
    where
        S: Sink<Packet> + Unpin,
        <S as Sink<Packet>>::Error: std::error::Error + Send + Sync + 'static,
    {
        self.close_info.sent_reason.get_or_insert(reason);
        let _ = timeout(
            std::time::Duration::from_secs(1),
            peer.send(Packet::disconnecting(reason, None)),
        )
        .await;
    }

    /// Returns Ok(true) when the session should end.
    async fn handle_packet<S>(&mut self, peer: &mut S, packet: Packet) -> Result<bool>
    where
        S: Sink<Packet> + Unpin,
        <S as Sink<Packet>>::Error: std::error::Error + Send + Sync + 'static,
    {
        let header = packet.header;
        match packet.body {
            PacketBody::Ping => {
                self.send_packet(peer, Packet::pong(header.id)).await?;
                Ok(false)
            }
            PacketBody::Pong => Ok(false),
            PacketBody::Disconnecting(body) => {
                info!(
                    "Peer {} is disconnecting us: {}",
                    self.pub_key.alias(),
                    body.reason
                );
                self.close_info.recv_reason = Some(body.reason);
                Ok(true)
            }
            PacketBody::GetNodes => {
                let entries: Vec<NodeConnectInfo> = {
                    let peers = self.state.peer_map.lock().unwrap();
                    peers
                        .values()
                        .filter(|p| p.pub_key != self.pub_key)
                        .filter(|p| !p.node_state.addresses.is_empty())
                        .map(|p| NodeConnectInfo {
                            pub_key: p.pub_key,
                            addresses: p.node_state.addresses.clone(),
                        })
                        .collect()
                };
                debug!(
                    "Replying to get nodes from {} with {} entries",
                    self.pub_key.alias(),
                    entries.len()
                );
                self.send_packet(peer, Packet::response(header.id, PacketBody::Nodes(entries)))
                    .await?;
                Ok(false)
            }
            PacketBody::Nodes(nodes) => {
                let _ = self
                    .state
                    .to_pool_tx
                    .send(PeerTaskToPool::NodesReceived {
                        from: self.pub_key,
                        nodes,
                    })
                    .await;
                Ok(false)
            }
            PacketBody::NodeStateUpdate(node_state) => {
                let old_pairs = {
                    let mut peers = self.state.peer_map.lock().unwrap();
                    match peers.get_mut(&self.pub_key) {
                        Some(info) if info.session_id == self.session_id => {
                            let old =
                                std::mem::replace(&mut info.node_state, node_state.clone());
                            Some(old.pairs)
                        }
                        _ => None,
                    }
                };
                if let Some(old_pairs) = old_pairs {
                    for pair_id in old_pairs {
                        if !node_state.is_pair_active(&pair_id) {
                            self.state.emit(PoolEvent::PeerPairDropped {
                                pub_key: self.pub_key,
                                pair_id,
                            });
                        }
                    }
                    self.state.emit(PoolEvent::PeerVerifyPairs {
                        pub_key: self.pub_key,
                    });
                    self.state.emit(PoolEvent::PeerNodeStateUpdate {
                        pub_key: self.pub_key,
                        state: node_state.clone(),
                    });
                    let _ = self
                        .state
                        .to_pool_tx
                        .send(PeerTaskToPool::NodeStateUpdated {
                            pub_key: self.pub_key,
                            state: node_state,
                        })
                        .await;
                }
                Ok(false)
            }
            PacketBody::Order(order) => {
                self.state.emit(PoolEvent::PacketOrder {
                    from: self.pub_key,
                    order,
                });
                Ok(false)
            }
            PacketBody::OrderInvalidation(portion) => {
                self.state.emit(PoolEvent::PacketOrderInvalidation {
                    from: self.pub_key,
                    portion,
                });
                Ok(false)
            }
            PacketBody::GetOrders => {
                self.state.emit(PoolEvent::PacketGetOrders {
                    from: self.pub_key,
                    req_id: header.id,
                });
                Ok(false)
            }
            PacketBody::Orders(orders) => {
                for order in orders {
                    self.state.emit(PoolEvent::PacketOrder {
                        from: self.pub_key,
                        order,
                    });
                }
                Ok(false)
            }
            PacketBody::SanitySwapInit(body) => {
                self.state.emit(PoolEvent::PacketSanitySwapInit {
                    from: self.pub_key,
                    body,
                });
                Ok(false)
            }
            PacketBody::SwapRequest(body) => {
                self.state.emit(PoolEvent::PacketSwapRequest {
                    from: self.pub_key,
                    body,
                });
                Ok(false)
            }
            PacketBody::SwapAccepted(body) => {
                self.state.emit(PoolEvent::PacketSwapAccepted {
                    from: self.pub_key,
                    body,
                });
                Ok(false)
            }
            PacketBody::SwapFailed(body) => {
                self.state.emit(PoolEvent::PacketSwapFailed {
                    from: self.pub_key,
                    body,
                });
                Ok(false)
            }
            PacketBody::Hello(_) | PacketBody::SessionInitAck => {
                self.report_reputation(ReputationEvent::WireProtocolErr).await;
                self.close_gracefully(peer, DisconnectionReason::WireProtocolErr)
                    .await;
                warn!(
                    "Peer {} sent a handshake packet mid-session",
                    self.pub_key.alias()
                );
                Ok(true)
            }
        }
    }

    /// Returns Ok(true) when the session should end.
    async fn handle_pool_task<S>(&mut self, peer: &mut S, task: PoolToPeerTask) -> Result<bool>
    where
        S: Sink<Packet> + Unpin,
        <S as Sink<Packet>>::Error: std::error::Error + Send + Sync + 'static,
    {
        match task {
            PoolToPeerTask::Send { target, packet } => {
                if target == self.pub_key {
                    self.send_packet(peer, packet).await?;
                }
                Ok(false)
            }
            PoolToPeerTask::BroadcastOrder(order) => {
                if self.is_pair_active(&order.pair_id) {
                    self.send_packet(peer, Packet::new(PacketBody::Order(order)))
                        .await?;
                }
                Ok(false)
            }
            PoolToPeerTask::BroadcastOrderInvalidation { portion, exclude } => {
                if exclude != Some(self.pub_key) && self.is_pair_active(&portion.pair_id) {
                    self.send_packet(peer, Packet::new(PacketBody::OrderInvalidation(portion)))
                        .await?;
                }
                Ok(false)
            }
            PoolToPeerTask::NodeStateUpdate(node_state) => {
                self.send_packet(peer, Packet::new(PacketBody::NodeStateUpdate(node_state)))
                    .await?;
                Ok(false)
            }
            PoolToPeerTask::MakeDiscoveryRequest => {
                self.send_packet(peer, Packet::new(PacketBody::GetNodes))
                    .await?;
                Ok(false)
            }
            PoolToPeerTask::Disconnect { target, reason } => {
                if target == self.pub_key {
                    self.close_gracefully(peer, reason).await;
                    return Ok(true);
                }
                Ok(false)
            }
            PoolToPeerTask::DisconnectAll { reason } => {
                self.close_gracefully(peer, reason).await;
                Ok(true)
            }
        }
    }

    fn is_pair_active(&self, pair_id: &str) -> bool {
        self.state
            .peer_map
            .lock()
            .unwrap()
            .get(&self.pub_key)
            .is_some_and(|info| info.is_pair_active(pair_id))
    }

    async fn report_reputation(&self, event: ReputationEvent) {
        let _ = self
            .state
            .to_pool_tx
            .send(PeerTaskToPool::Reputation {
                pub_key: self.pub_key,
                event,
            })
            .await;
    }

    /// Remove this session from the peer map (unless a replacement session
    /// already took the slot) and report the close upstream.
    async fn close_callback(&self) {
        let removed = {
            let mut peers = self.state.peer_map.lock().unwrap();
            let is_ours = peers
                .get(&self.pub_key)
                .is_some_and(|info| info.session_id == self.session_id);
            if is_ours {
                peers.remove(&self.pub_key);
            }
            is_ours
        };

        if removed {
            info!(
                "Peer {} session closed (sent: {:?}, received: {:?})",
                self.pub_key.alias(),
                self.close_info.sent_reason,
                self.close_info.recv_reason,
            );
            self.state.emit(PoolEvent::PeerClose {
                pub_key: self.pub_key,
                sent_reason: self.close_info.sent_reason,
                recv_reason: self.close_info.recv_reason,
            });
            let _ = self
                .state
                .to_pool_tx
                .send(PeerTaskToPool::PeerClosed {
                    pub_key: self.pub_key,
                    address: self.peer_address,
                    inbound: self.inbound,
                    sent_reason: self.close_info.sent_reason,
                    recv_reason: self.close_info.recv_reason,
                })
                .await;
        }
    }
}
