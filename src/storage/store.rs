//! Replica Store
//!
//! Owns the local copy of the replicated map. Local writes are applied first
//! and then handed to the transport for broadcast; remote mutations arrive via
//! `apply_remote`. Whole-state transfer goes through `capture_snapshot` and
//! `restore_snapshot`.
//!
//! ## Locking
//! A single reader/writer lock guards the mapping. Reads share it, every
//! mutation takes it exclusively, and snapshot capture holds the read side for
//! the full encode. The lock is always released before the transport is called
//! and before subscribers are notified.
//!
//! A separate outbound lock serializes local writers from the local apply up
//! to the moment the transport has queued the broadcast. Local writes are
//! therefore broadcast in the order they were applied, and peers end on the
//! same value as the writer. Transports queue broadcasts without I/O, so the
//! outbound lock is never held across the network.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::Span;

use super::codec::{self, EncodeError};
use super::types::{Entry, MutationMessage, Origin, Snapshot, StoreEvent};
use crate::error::DecodeError;
use crate::membership::types::NodeId;
use crate::transport::GroupTransport;

/// Callback registered through [`ReplicaStore::subscribe`].
pub type Subscriber = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct ReplicaStore {
    state: RwLock<HashMap<String, i32>>,
    outbound: Mutex<()>,
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber)>>,
    next_subscription: AtomicU64,
    local_id: NodeId,
    transport: Arc<dyn GroupTransport>,
    span: Span,
}

impl ReplicaStore {
    pub fn new(transport: Arc<dyn GroupTransport>, span: Span) -> Self {
        Self::with_entries(transport, span, std::iter::empty())
    }

    /// Creates a store pre-seeded with `entries`. Seeding is not broadcast.
    pub fn with_entries<I>(transport: Arc<dyn GroupTransport>, span: Span, entries: I) -> Self
    where
        I: IntoIterator<Item = (String, i32)>,
    {
        Self {
            state: RwLock::new(entries.into_iter().collect()),
            outbound: Mutex::new(()),
            subscribers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            local_id: transport.local_address(),
            transport,
            span,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn get(&self, key: &str) -> Option<i32> {
        self.state.read().get(key).copied()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.state.read().contains_key(key)
    }

    /// Inserts locally, then broadcasts `Insert`.
    ///
    /// The write is visible to local readers before the broadcast is even
    /// queued. A failed broadcast is logged and the local write is kept.
    pub fn put(&self, key: impl Into<String>, value: i32) {
        let key = key.into();
        {
            let _ordered = self.outbound.lock();
            self.state.write().insert(key.clone(), value);
            tracing::debug!(parent: &self.span, "PUT {} = {}", key, value);

            self.broadcast(MutationMessage::Insert {
                key: key.clone(),
                value,
            });
        }
        self.notify(StoreEvent::Inserted {
            key,
            value,
            origin: Origin::Local,
        });
    }

    /// Removes locally, then broadcasts `Remove`. Returns the previous value.
    ///
    /// An absent key is not an error; the removal is still broadcast so peers
    /// that hold the key drop it too.
    pub fn remove(&self, key: &str) -> Option<i32> {
        let previous = {
            let _ordered = self.outbound.lock();
            let previous = self.state.write().remove(key);
            tracing::debug!(parent: &self.span, "REMOVE {} (previous: {:?})", key, previous);

            self.broadcast(MutationMessage::Remove {
                key: key.to_string(),
            });
            previous
        };
        if previous.is_some() {
            self.notify(StoreEvent::Removed {
                key: key.to_string(),
                origin: Origin::Local,
            });
        }
        previous
    }

    /// Applies a mutation delivered from `sender`.
    ///
    /// Messages carrying the local address are looped-back copies of our own
    /// broadcasts and are dropped. Returns whether the message was applied.
    pub fn apply_remote(&self, message: MutationMessage, sender: &NodeId) -> bool {
        if sender == &self.local_id {
            tracing::debug!(parent: &self.span, "Ignoring self-delivered {:?}", message);
            return false;
        }

        let origin = Origin::Remote(sender.clone());
        let event = match message {
            MutationMessage::Insert { key, value } => {
                self.state.write().insert(key.clone(), value);
                tracing::debug!(
                    parent: &self.span,
                    "Applied remote PUT {} = {} from {}",
                    key,
                    value,
                    sender
                );
                Some(StoreEvent::Inserted { key, value, origin })
            }
            MutationMessage::Remove { key } => {
                let removed = self.state.write().remove(&key);
                tracing::debug!(
                    parent: &self.span,
                    "Applied remote REMOVE {} from {}",
                    key,
                    sender
                );
                removed.map(|_| StoreEvent::Removed { key, origin })
            }
        };

        if let Some(event) = event {
            self.notify(event);
        }
        true
    }

    /// Encodes the whole map while holding the read lock, so no mutation is
    /// interleaved with the encode.
    pub fn capture_snapshot(&self) -> Result<Snapshot, EncodeError> {
        let state = self.state.read();
        codec::encode_snapshot(state.iter())
    }

    /// Replaces the whole map with the snapshot's content.
    ///
    /// The snapshot is decoded before the lock is taken; a malformed snapshot
    /// leaves the current state untouched.
    pub fn restore_snapshot(&self, snapshot: &Snapshot) -> Result<usize, DecodeError> {
        let restored = codec::decode_snapshot(snapshot)?;
        let len = restored.len();
        *self.state.write() = restored;

        tracing::info!(parent: &self.span, "Restored state from snapshot ({} entries)", len);
        self.notify(StoreEvent::Restored { len });
        Ok(len)
    }

    /// All entries, sorted by key.
    pub fn entries(&self) -> Vec<Entry> {
        let mut entries: Vec<Entry> = self
            .state
            .read()
            .iter()
            .map(|(key, value)| Entry::new(key.clone(), *value))
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().is_empty()
    }

    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, Arc::new(subscriber)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    fn broadcast(&self, message: MutationMessage) {
        if let Err(e) = self.transport.broadcast(&message) {
            tracing::warn!(
                parent: &self.span,
                "Broadcast of {:?} failed, local state is ahead of the group: {}",
                message,
                e
            );
        }
    }

    // Fan-out runs on a copy of the registry so subscribers may (un)subscribe.
    fn notify(&self, event: StoreEvent) {
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, subscriber)| subscriber.clone())
            .collect();

        for subscriber in subscribers {
            subscriber(&event);
        }
    }
}
