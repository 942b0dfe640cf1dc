use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use std::{net::SocketAddr, time::Duration};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};

use super::types::{GossipEnvelope, GossipMessage, Node, NodeId, NodeState};

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_secs(2);
const SUSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEAD_TIMEOUT: Duration = Duration::from_secs(10);
/// Every Nth gossip round also probes one dead member, so healed partitions reconnect.
const DEAD_PROBE_EVERY: u64 = 4;

pub struct MembershipService {
    pub local_node: Node,
    pub members: Arc<DashMap<NodeId, Node>>,
    group: String,
    socket: Arc<UdpSocket>,
    incarnation: Arc<RwLock<u64>>,
    span: Span,
}

impl MembershipService {
    pub async fn new(
        local_id: NodeId,
        bind_addr: SocketAddr,
        http_addr: SocketAddr,
        seed_nodes: Vec<SocketAddr>,
        group: String,
        span: Span,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let gossip_addr = socket.local_addr()?;
        let incarnation_counter = Arc::new(RwLock::new(1));
        let current_inc = *incarnation_counter.read().await;
        let local_node = Node {
            id: local_id,
            gossip_addr,
            http_addr,
            state: NodeState::Alive,
            incarnation: current_inc,
            joined_at: now_ms(),
            last_seen: Some(Instant::now()),
        };
        let members = Arc::new(DashMap::new());
        members.insert(local_node.id.clone(), local_node.clone());

        let service = Self {
            local_node,
            members,
            group,
            socket: Arc::new(socket),
            incarnation: incarnation_counter,
            span,
        };

        if !seed_nodes.is_empty() {
            tracing::info!(parent: &service.span, "Joining cluster via {} seed node(s)", seed_nodes.len());

            let encoded = service.encode(GossipMessage::Join {
                node: service.local_node.clone(),
            })?;
            for seed_node in seed_nodes.iter() {
                service.socket.send_to(&encoded, seed_node).await?;
                tracing::info!(parent: &service.span, "Sent join request to {}", seed_node);
            }
        }

        Ok(Arc::new(service))
    }

    /// Spawns the gossip, receive and failure-detection loops.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        tracing::info!(parent: &self.span, "Starting membership service...");

        let gossip_handle = {
            let service = self.clone();
            tokio::spawn(async move { service.gossip_loop().await }.instrument(self.span.clone()))
        };

        let receive_handle = {
            let service = self.clone();
            tokio::spawn(async move { service.receive_loop().await }.instrument(self.span.clone()))
        };

        let failure_detection_handle = {
            let service = self.clone();
            tokio::spawn(
                async move { service.failure_detection_loop().await }
                    .instrument(self.span.clone()),
            )
        };

        tracing::info!(parent: &self.span, "All background tasks started");
        vec![gossip_handle, receive_handle, failure_detection_handle]
    }

    pub fn get_alive_members(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| entry.value().state == NodeState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Members that announced a graceful leave.
    pub fn left_members(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .filter(|entry| entry.value().state == NodeState::Left)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn get_member(&self, id: &NodeId) -> Option<Node> {
        self.members.get(id).map(|entry| entry.value().clone())
    }

    /// Alive members ordered oldest first (ties broken by id). The first one
    /// is the coordinator of the resulting view.
    pub fn view_members(&self) -> Vec<NodeId> {
        let mut alive = self.get_alive_members();
        alive.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
        alive.into_iter().map(|node| node.id).collect()
    }

    /// Tells every alive peer that this node is leaving.
    pub async fn leave(&self) {
        tracing::info!(parent: &self.span, "Leaving group '{}'", self.group);
        self.broadcast_message(GossipMessage::Leave {
            node_id: self.local_node.id.clone(),
        })
        .await;
    }

    fn encode(&self, message: GossipMessage) -> Result<Vec<u8>> {
        let envelope = GossipEnvelope {
            group: self.group.clone(),
            message,
        };
        Ok(bincode::serialize(&envelope)?)
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(GOSSIP_INTERVAL);
        let mut round: u64 = 0;

        loop {
            interval.tick().await;
            round += 1;

            let mut targets = Vec::new();
            if let Some(target) = self.random_member(NodeState::Alive) {
                targets.push(target);
            }
            if round % DEAD_PROBE_EVERY == 0
                && let Some(target) = self.random_member(NodeState::Dead)
            {
                tracing::debug!("Probing dead member {:?}", target.id);
                targets.push(target);
            }

            if targets.is_empty() {
                continue;
            }

            let incarnation = *self.incarnation.read().await;
            let msg = GossipMessage::Ping {
                from: self.local_node.id.clone(),
                incarnation,
                http_addr: self.local_node.http_addr,
                joined_at: self.local_node.joined_at,
            };

            match self.encode(msg) {
                Ok(encoded) => {
                    for target in targets {
                        if let Err(e) = self.socket.send_to(&encoded, target.gossip_addr).await {
                            tracing::warn!("Failed to send ping to {:?}: {}", target.id, e);
                        } else {
                            tracing::trace!("Sent ping to {:?}", target.id);
                        }
                    }
                }
                Err(e) => tracing::error!("Failed to serialize GossipMessage::Ping: {}", e),
            }
        }
    }

    fn random_member(&self, state: NodeState) -> Option<Node> {
        let candidates: Vec<Node> = self
            .members
            .iter()
            .filter(|entry| entry.value().id != self.local_node.id && entry.value().state == state)
            .map(|entry| entry.value().clone())
            .collect();

        if candidates.is_empty() {
            return None;
        }

        use rand::Rng;
        let idx = rand::thread_rng().gen_range(0..candidates.len());
        candidates.into_iter().nth(idx)
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<GossipEnvelope>(&buf[..len]) {
                    Ok(envelope) if envelope.group == self.group => {
                        if let Err(e) = self.handle_message(envelope.message, src).await {
                            tracing::error!("Error handling message from {}: {}", src, e);
                        }
                    }
                    Ok(envelope) => {
                        tracing::debug!(
                            "Dropping gossip for foreign group '{}' from {}",
                            envelope.group,
                            src
                        );
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize message from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        match msg {
            GossipMessage::Ping {
                from,
                incarnation,
                http_addr,
                joined_at,
            } => {
                self.handle_ping(from, incarnation, http_addr, joined_at, src)
                    .await?;
            }

            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                self.handle_ack(from, incarnation, members);
            }

            GossipMessage::Join { node } => {
                self.handle_join(node, src).await?;
            }

            GossipMessage::Suspect {
                node_id,
                incarnation,
            } => {
                self.handle_suspect(node_id, incarnation).await;
            }

            GossipMessage::Alive {
                node_id,
                incarnation,
            } => {
                self.handle_alive(node_id, incarnation);
            }

            GossipMessage::Leave { node_id } => {
                self.handle_leave(node_id);
            }
        }

        Ok(())
    }

    async fn handle_ping(
        &self,
        from: NodeId,
        from_incarnation: u64,
        http_addr: SocketAddr,
        joined_at: u64,
        src: SocketAddr,
    ) -> Result<()> {
        tracing::trace!("Received ping from {:?}", from);

        if let Some(mut member) = self.members.get_mut(&from) {
            if member.state == NodeState::Left {
                return Ok(());
            }
            member.last_seen = Some(Instant::now());

            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
            }
            if member.state != NodeState::Alive {
                tracing::info!("Node {:?} at {} is reachable again", from, src);
                member.state = NodeState::Alive;
            }
        } else {
            tracing::info!("Discovered new member via ping: {:?} at {}", from, src);

            let new_node = Node {
                id: from.clone(),
                gossip_addr: src,
                http_addr,
                state: NodeState::Alive,
                incarnation: from_incarnation,
                joined_at,
                last_seen: Some(Instant::now()),
            };

            self.members.insert(new_node.id.clone(), new_node);
        }

        let all_members: Vec<Node> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let my_incarnation = *self.incarnation.read().await;
        let reply = self.encode(GossipMessage::Ack {
            from: self.local_node.id.clone(),
            incarnation: my_incarnation,
            members: all_members,
        })?;

        self.socket.send_to(&reply, src).await?;

        tracing::trace!("Sent ack to {:?} with {} members", from, self.members.len());

        Ok(())
    }

    fn handle_ack(&self, from: NodeId, from_incarnation: u64, members: Vec<Node>) {
        tracing::trace!(
            "Received ack from {:?} (inc={}) with {} members",
            from,
            from_incarnation,
            members.len()
        );

        if let Some(mut member) = self.members.get_mut(&from)
            && member.state != NodeState::Left
        {
            member.last_seen = Some(Instant::now());
            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
            }
            if member.state != NodeState::Alive {
                tracing::info!("Node {:?} answered again, marking alive", from);
                member.state = NodeState::Alive;
            }
        }

        for member in members {
            self.merge_member(member);
        }
    }

    fn merge_member(&self, new_member: Node) {
        if new_member.id == self.local_node.id {
            return;
        }

        match self.members.get_mut(&new_member.id) {
            Some(mut existing) => {
                if existing.state == NodeState::Left {
                    return;
                }
                if new_member.state == NodeState::Left {
                    tracing::info!("{:?} left the group", new_member.id);
                    existing.state = NodeState::Left;
                } else if new_member.incarnation > existing.incarnation {
                    tracing::debug!(
                        "Updating {:?}: inc {} -> {}",
                        new_member.id,
                        existing.incarnation,
                        new_member.incarnation,
                    );

                    existing.state = new_member.state;
                    existing.incarnation = new_member.incarnation;
                    existing.last_seen = Some(Instant::now());
                } else if new_member.incarnation == existing.incarnation
                    && new_member.state == NodeState::Alive
                    && existing.state == NodeState::Suspect
                {
                    tracing::info!("{:?} refuted suspicion", new_member.id);
                    existing.state = NodeState::Alive;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                if new_member.state == NodeState::Left {
                    return;
                }
                tracing::info!(
                    "Discovered new member: {:?} at {}",
                    new_member.id,
                    new_member.gossip_addr
                );

                let mut member_with_timestamp = new_member;
                member_with_timestamp.last_seen = Some(Instant::now());

                self.members
                    .insert(member_with_timestamp.id.clone(), member_with_timestamp);
            }
        }
    }

    async fn handle_suspect(&self, node_id: NodeId, incarnation: u64) {
        if node_id == self.local_node.id {
            let my_incarnation = {
                let mut inc = self.incarnation.write().await;
                if incarnation < *inc {
                    return;
                }
                *inc = incarnation + 1;
                *inc
            };
            tracing::info!("Refuting suspicion about ourselves (inc={})", my_incarnation);

            if let Some(mut me) = self.members.get_mut(&node_id) {
                me.incarnation = my_incarnation;
                me.state = NodeState::Alive;
                me.last_seen = Some(Instant::now());
            }

            self.broadcast_message(GossipMessage::Alive {
                node_id,
                incarnation: my_incarnation,
            })
            .await;
            return;
        }

        match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                if incarnation >= existing.incarnation && existing.state == NodeState::Alive {
                    tracing::info!("Node {:?} at {} suspected", existing.id, existing.gossip_addr);
                    existing.state = NodeState::Suspect;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                tracing::debug!("Suspected node {:?} doesn't exist", node_id);
            }
        }
    }

    fn handle_alive(&self, node_id: NodeId, incarnation: u64) {
        match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                if existing.state == NodeState::Left {
                    return;
                }
                if incarnation > existing.incarnation {
                    tracing::info!(
                        "Node {:?} at {} is now Alive (inc={})",
                        existing.id,
                        existing.gossip_addr,
                        incarnation
                    );
                    existing.state = NodeState::Alive;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                } else if incarnation == existing.incarnation
                    && existing.state == NodeState::Suspect
                {
                    tracing::info!(
                        "Node {:?} at {} successfully refuted suspicion",
                        existing.id,
                        existing.gossip_addr,
                    );
                    existing.state = NodeState::Alive;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                tracing::debug!("Alive message for unknown node {:?}", node_id);
            }
        }
    }

    async fn handle_join(&self, mut node: Node, src: SocketAddr) -> Result<()> {
        tracing::info!("Node {:?} joining cluster at {}", node.id, src);

        node.gossip_addr = src;
        node.state = NodeState::Alive;
        node.last_seen = Some(Instant::now());

        self.members.insert(node.id.clone(), node);

        tracing::info!("Cluster size now: {}", self.get_alive_members().len());

        // Answer right away so the joiner learns the membership before its first view.
        let all_members: Vec<Node> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let my_incarnation = *self.incarnation.read().await;
        let reply = self.encode(GossipMessage::Ack {
            from: self.local_node.id.clone(),
            incarnation: my_incarnation,
            members: all_members,
        })?;
        self.socket.send_to(&reply, src).await?;

        Ok(())
    }

    fn handle_leave(&self, node_id: NodeId) {
        if let Some(mut member) = self.members.get_mut(&node_id) {
            tracing::info!("Node {:?} at {} left the group", member.id, member.gossip_addr);
            member.state = NodeState::Left;
        }
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FAILURE_DETECTION_INTERVAL);

        loop {
            interval.tick().await;
            let now = Instant::now();

            let mut messages_to_broadcast = Vec::new();
            let mut declared_dead = 0usize;

            for mut entry in self.members.iter_mut() {
                let member = entry.value_mut();

                if member.id == self.local_node.id {
                    continue;
                }

                if let Some(last_seen) = member.last_seen {
                    let elapsed = now.duration_since(last_seen);

                    match member.state {
                        NodeState::Alive => {
                            if elapsed > SUSPECT_TIMEOUT {
                                tracing::warn!(
                                    "Node {:?} suspected (no contact for {:?})",
                                    member.id,
                                    elapsed
                                );

                                member.state = NodeState::Suspect;

                                messages_to_broadcast.push(GossipMessage::Suspect {
                                    node_id: member.id.clone(),
                                    incarnation: member.incarnation,
                                });
                            }
                        }

                        NodeState::Suspect => {
                            if elapsed > DEAD_TIMEOUT {
                                tracing::info!(
                                    "Node {:?} declared DEAD (no contact for {:?})",
                                    member.id,
                                    elapsed
                                );

                                member.state = NodeState::Dead;
                                declared_dead += 1;
                            }
                        }

                        NodeState::Dead | NodeState::Left => {}
                    }
                } else {
                    member.last_seen = Some(now);
                }
            }

            if declared_dead > 0 {
                tracing::info!(
                    "Cluster size now: {} alive nodes",
                    self.get_alive_members().len()
                );
            }

            for msg in messages_to_broadcast {
                self.broadcast_message(msg).await;
            }
        }
    }

    async fn broadcast_message(&self, msg: GossipMessage) {
        let encoded = match self.encode(msg) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!(parent: &self.span, "Failed to serialize gossip message: {}", e);
                return;
            }
        };

        let targets: Vec<Node> = self
            .members
            .iter()
            .filter(|entry| {
                entry.value().id != self.local_node.id && entry.value().state == NodeState::Alive
            })
            .map(|entry| entry.value().clone())
            .collect();

        for member in targets {
            if let Err(e) = self.socket.send_to(&encoded, member.gossip_addr).await {
                tracing::warn!(parent: &self.span, "Failed to broadcast to {:?}: {}", member.id, e);
            }
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
