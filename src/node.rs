//! Replicated Map Node
//!
//! Wires one [`ReplicaStore`], one [`Reconciler`] and one [`GroupTransport`]
//! into a running group member.
//!
//! ## Core Concepts
//! - **EventDispatcher**: the receiver registered with the transport. Deliveries
//!   go to the store, view changes go to the reconciler and state requests are
//!   answered from the store. Each callback is a plain match on the message
//!   type; nothing here blocks.
//! - **ReplicatedMap**: the handle callers use. Reads and writes go straight
//!   to the local store and never wait on the network.

use std::sync::Arc;
use tracing::Span;

use crate::error::TransportError;
use crate::membership::reconciler::{Reconciler, ReconcilerConfig, ReconcilerState};
use crate::membership::types::{NodeId, ViewChange};
use crate::storage::codec::EncodeError;
use crate::storage::store::ReplicaStore;
use crate::storage::types::{Entry, MutationMessage, Snapshot};
use crate::transport::{GroupReceiver, GroupTransport};

/// Routes transport callbacks to the store and the reconciler.
pub struct EventDispatcher {
    store: Arc<ReplicaStore>,
    reconciler: Arc<Reconciler>,
}

impl EventDispatcher {
    pub fn new(store: Arc<ReplicaStore>, reconciler: Arc<Reconciler>) -> Self {
        Self { store, reconciler }
    }
}

impl GroupReceiver for EventDispatcher {
    fn deliver(&self, message: MutationMessage, sender: NodeId) {
        self.store.apply_remote(message, &sender);
    }

    fn view_accepted(&self, view: ViewChange) {
        self.reconciler.submit(view);
    }

    fn capture_state(&self) -> Result<Snapshot, EncodeError> {
        self.store.capture_snapshot()
    }
}

pub struct ReplicatedMap {
    group: String,
    store: Arc<ReplicaStore>,
    reconciler: Arc<Reconciler>,
    transport: Arc<dyn GroupTransport>,
    span: Span,
}

impl ReplicatedMap {
    /// Joins `group` through `transport`.
    ///
    /// Returns once the transport installed the first view. Recovery from the
    /// coordinator runs in the background; await [`ReplicatedMap::settled`]
    /// to wait for it.
    pub async fn join(
        transport: Arc<dyn GroupTransport>,
        group: &str,
        config: ReconcilerConfig,
        span: Span,
    ) -> Result<Self, TransportError> {
        let store = Arc::new(ReplicaStore::new(transport.clone(), span.clone()));
        let reconciler = Arc::new(Reconciler::spawn(
            store.clone(),
            transport.clone(),
            config,
            span.clone(),
        ));

        transport.set_receiver(Arc::new(EventDispatcher::new(
            store.clone(),
            reconciler.clone(),
        )));

        if let Err(e) = transport.connect(group).await {
            tracing::error!(parent: &span, "Failed to join group '{}': {}", group, e);
            reconciler.shutdown();
            return Err(e);
        }
        tracing::info!(parent: &span, "Joined group '{}' as {}", group, store.local_id());

        Ok(Self {
            group: group.to_string(),
            store,
            reconciler,
            transport,
            span,
        })
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn local_id(&self) -> &NodeId {
        self.store.local_id()
    }

    pub fn get(&self, key: &str) -> Option<i32> {
        self.store.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.store.contains_key(key)
    }

    pub fn put(&self, key: impl Into<String>, value: i32) {
        self.store.put(key, value)
    }

    pub fn remove(&self, key: &str) -> Option<i32> {
        self.store.remove(key)
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.store.entries()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn store(&self) -> &Arc<ReplicaStore> {
        &self.store
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn state(&self) -> ReconcilerState {
        self.reconciler.state()
    }

    /// Waits until every view installed so far has been reconciled.
    pub async fn settled(&self) {
        self.reconciler.settled().await
    }

    /// Leaves the group and stops the reconciliation worker.
    pub async fn leave(&self) {
        self.transport.disconnect().await;
        self.reconciler.shutdown();
        tracing::info!(parent: &self.span, "Left group '{}'", self.group);
    }
}
