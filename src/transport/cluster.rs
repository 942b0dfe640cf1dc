//! Cluster Transport
//!
//! The networked [`GroupTransport`]: membership comes from the UDP gossip
//! service, broadcasts and state transfer go over HTTP.
//!
//! ## Responsibilities
//! - **Views**: a background task turns gossip membership into installed views.
//! - **Broadcast**: frames are queued and sent by one task, one frame at a time,
//!   to every other alive member. This keeps per-sender order and never blocks
//!   the caller. Failures are logged per peer and not retried.
//! - **State transfer**: a single `GET` with the caller's timeout.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};

use super::handlers::{self, Endpoint, ReceiverSlot};
use super::protocol::{DeliveryEnvelope, ENDPOINT_DELIVER, ENDPOINT_STATE, HTTP_PORT_OFFSET};
use super::{GroupReceiver, GroupTransport, deliver_frame};
use crate::error::TransportError;
use crate::membership::service::MembershipService;
use crate::membership::types::NodeId;
use crate::membership::view::ViewTracker;
use crate::storage::codec;
use crate::storage::types::{MutationMessage, Snapshot};

const VIEW_CHECK_INTERVAL: Duration = Duration::from_millis(500);
const DELIVERY_TIMEOUT: Duration = Duration::from_millis(500);
const SEED_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Gossip (UDP) address. HTTP listens on the same IP, port + 1000.
    pub bind: SocketAddr,
    pub seeds: Vec<SocketAddr>,
    /// How long `connect` waits for a seed before installing a founder view.
    pub join_timeout: Duration,
    /// Whether our own broadcasts are kept from looping back to us.
    pub discard_own_messages: bool,
}

impl ClusterConfig {
    pub fn new(bind: SocketAddr, seeds: Vec<SocketAddr>) -> Self {
        Self {
            bind,
            seeds,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            discard_own_messages: true,
        }
    }

    /// HTTP address derived from the gossip address. Port 0 stays 0.
    pub fn http_addr(&self) -> Result<SocketAddr, TransportError> {
        let port = match self.bind.port() {
            0 => 0,
            port => port.checked_add(HTTP_PORT_OFFSET).ok_or_else(|| {
                TransportError::Setup(format!("no HTTP port above gossip port {}", port))
            })?,
        };
        Ok(SocketAddr::new(self.bind.ip(), port))
    }
}

struct Connection {
    group: String,
    membership: Arc<MembershipService>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct ClusterTransport {
    local_id: NodeId,
    config: ClusterConfig,
    http_client: reqwest::Client,
    receiver: ReceiverSlot,
    connection: Mutex<Option<Arc<Connection>>>,
    span: Span,
}

impl ClusterTransport {
    pub fn new(config: ClusterConfig, span: Span) -> Arc<Self> {
        Arc::new(Self {
            local_id: NodeId::new(),
            config,
            http_client: reqwest::Client::new(),
            receiver: Arc::new(RwLock::new(None)),
            connection: Mutex::new(None),
            span,
        })
    }

    /// Alive members as the gossip layer currently sees them.
    pub fn alive_members(&self) -> Vec<NodeId> {
        self.connection()
            .map(|connection| connection.membership.view_members())
            .unwrap_or_default()
    }

    /// Bound gossip address, once connected.
    pub fn gossip_addr(&self) -> Option<SocketAddr> {
        self.connection()
            .ok()
            .map(|connection| connection.membership.local_node.gossip_addr)
    }

    fn connection(&self) -> Result<Arc<Connection>, TransportError> {
        self.connection
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    async fn await_seeds(&self, membership: &MembershipService) {
        if self.config.seeds.is_empty() {
            tracing::info!(parent: &self.span, "No seeds configured, founding the group");
            return;
        }

        let deadline = tokio::time::Instant::now() + self.config.join_timeout;
        loop {
            let alive = membership.get_alive_members().len();
            if alive > 1 {
                tracing::info!(parent: &self.span, "Reached the group ({} alive members)", alive);
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    parent: &self.span,
                    "No seed answered within {:?}, installing a view of our own",
                    self.config.join_timeout
                );
                return;
            }
            tokio::time::sleep(SEED_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl GroupTransport for ClusterTransport {
    fn local_address(&self) -> NodeId {
        self.local_id.clone()
    }

    fn set_receiver(&self, receiver: Arc<dyn GroupReceiver>) {
        *self.receiver.write() = Some(receiver);
    }

    async fn connect(&self, group: &str) -> Result<(), TransportError> {
        if let Some(connection) = self.connection.lock().as_ref() {
            return Err(TransportError::AlreadyConnected(connection.group.clone()));
        }
        let receiver = self
            .receiver
            .read()
            .clone()
            .ok_or_else(|| TransportError::Setup("no receiver registered".to_string()))?;

        let setup = |e: &dyn std::fmt::Display| TransportError::Setup(e.to_string());

        let listener = TcpListener::bind(self.config.http_addr()?)
            .await
            .map_err(|e| setup(&e))?;
        let http_addr = listener.local_addr().map_err(|e| setup(&e))?;

        let membership = MembershipService::new(
            self.local_id.clone(),
            self.config.bind,
            http_addr,
            self.config.seeds.clone(),
            group.to_string(),
            self.span.clone(),
        )
        .await
        .map_err(|e| setup(&e))?;

        let mut tasks = Vec::new();

        let app = handlers::router(Arc::new(Endpoint {
            group: group.to_string(),
            receiver: self.receiver.clone(),
            span: self.span.clone(),
        }));
        let server_span = self.span.clone();
        tasks.push(tokio::spawn(
            async move {
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!("HTTP server stopped: {}", e);
                }
            }
            .instrument(server_span),
        ));
        tracing::info!(parent: &self.span, "HTTP server listening on {}", http_addr);

        tasks.extend(membership.start());

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let sender = Sender {
            local_id: self.local_id.clone(),
            group: group.to_string(),
            membership: membership.clone(),
            http_client: self.http_client.clone(),
            receiver: self.receiver.clone(),
            discard_own_messages: self.config.discard_own_messages,
            span: self.span.clone(),
        };
        tasks.push(tokio::spawn(
            sender.run(outbound_rx).instrument(self.span.clone()),
        ));

        let connection = Arc::new(Connection {
            group: group.to_string(),
            membership: membership.clone(),
            outbound,
            tasks: Mutex::new(tasks),
        });
        *self.connection.lock() = Some(connection.clone());

        self.await_seeds(&membership).await;

        let mut tracker = ViewTracker::new();
        if let Some(view) = tracker.observe(membership.view_members()) {
            receiver.view_accepted(view);
        }

        let view_task = tokio::spawn(
            view_loop(membership, tracker, self.receiver.clone()).instrument(self.span.clone()),
        );
        connection.tasks.lock().push(view_task);

        tracing::info!(parent: &self.span, "Connected to group '{}' as {}", group, self.local_id);
        Ok(())
    }

    fn broadcast(&self, message: &MutationMessage) -> Result<(), TransportError> {
        let connection = self.connection()?;
        let payload = codec::encode_mutation(message)?;
        connection
            .outbound
            .send(payload)
            .map_err(|_| TransportError::Closed)
    }

    async fn request_state(
        &self,
        member: &NodeId,
        timeout: Duration,
    ) -> Result<Snapshot, TransportError> {
        let connection = self.connection()?;
        let node = connection
            .membership
            .get_member(member)
            .ok_or_else(|| TransportError::UnknownMember(member.clone()))?;

        let url = format!("http://{}{}", node.http_addr, ENDPOINT_STATE);
        let request_error = |e: reqwest::Error| {
            if e.is_timeout() {
                TransportError::Timeout(timeout)
            } else {
                TransportError::Request {
                    member: member.clone(),
                    reason: e.to_string(),
                }
            }
        };

        let response = self
            .http_client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(request_error)?;

        if !response.status().is_success() {
            return Err(TransportError::Request {
                member: member.clone(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let bytes = response.bytes().await.map_err(request_error)?;
        Ok(Snapshot::from_bytes(bytes.to_vec()))
    }

    async fn disconnect(&self) {
        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            connection.membership.leave().await;
            for task in connection.tasks.lock().drain(..) {
                task.abort();
            }
            tracing::info!(parent: &self.span, "Disconnected from group '{}'", connection.group);
        }
        *self.receiver.write() = None;
    }
}

async fn view_loop(membership: Arc<MembershipService>, mut tracker: ViewTracker, slot: ReceiverSlot) {
    let mut interval = tokio::time::interval(VIEW_CHECK_INTERVAL);

    loop {
        interval.tick().await;

        for id in membership.left_members() {
            tracker.forget(&id);
        }
        if let Some(view) = tracker.observe(membership.view_members()) {
            let receiver = slot.read().clone();
            match receiver {
                Some(receiver) => receiver.view_accepted(view),
                None => break,
            }
        }
    }
}

/// Drains the outbound queue, one frame at a time.
struct Sender {
    local_id: NodeId,
    group: String,
    membership: Arc<MembershipService>,
    http_client: reqwest::Client,
    receiver: ReceiverSlot,
    discard_own_messages: bool,
    span: Span,
}

impl Sender {
    async fn run(self, mut outbound: mpsc::UnboundedReceiver<Vec<u8>>) {
        while let Some(payload) = outbound.recv().await {
            if !self.discard_own_messages {
                let receiver = self.receiver.read().clone();
                if let Some(receiver) = receiver {
                    let _ = deliver_frame(receiver.as_ref(), &payload, self.local_id.clone(), &self.span);
                }
            }

            let envelope = DeliveryEnvelope {
                group: self.group.clone(),
                sender: self.local_id.clone(),
                payload,
            };
            let body = match bincode::serialize(&envelope) {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!("Failed to serialize delivery envelope: {}", e);
                    continue;
                }
            };

            let peers = self
                .membership
                .get_alive_members()
                .into_iter()
                .filter(|node| node.id != self.local_id);

            for peer in peers {
                let url = format!("http://{}{}", peer.http_addr, ENDPOINT_DELIVER);
                let result = self
                    .http_client
                    .post(url)
                    .body(body.clone())
                    .timeout(DELIVERY_TIMEOUT)
                    .send()
                    .await;

                let failure = match result {
                    Ok(response) if response.status().is_success() => None,
                    Ok(response) => Some(format!("HTTP {}", response.status())),
                    Err(e) => Some(e.to_string()),
                };
                if let Some(reason) = failure {
                    let error = TransportError::Request {
                        member: peer.id.clone(),
                        reason,
                    };
                    tracing::warn!("Broadcast not delivered: {}", error);
                }
            }
        }
    }
}
