//! Membership Reconciler
//!
//! Reacts to installed views and decides whether the local map must be
//! replaced by a peer's snapshot.
//!
//! ## States
//! - `Joining`: no view handled yet. The first view sends the node to
//!   `Recovering`, which pulls state from the view's coordinator unless the
//!   node is the coordinator itself.
//! - `Stable`: plain joins and leaves only get logged.
//! - `Reconciling`: a merge view arrived. Subgroup 0 is the primary; members
//!   outside it replace their state with a snapshot from the primary's first
//!   member, dropping whatever they wrote while partitioned.
//!
//! Every path ends in `Stable`, whether the transfer worked or not. Failures
//! are logged and never retried; the next view change is the next chance.
//!
//! A single worker task handles views one at a time. Views are handed over
//! through a `watch` channel, so a view that arrives while an older one is
//! still queued replaces it.
//!
//! ## Limitations
//! - Primary wins: a merge discards writes made outside subgroup 0 while the
//!   group was split. There is no per-key merge.
//! - A restore replaces the whole map. A remote mutation delivered after the
//!   source captured its snapshot but before the local restore runs is lost on
//!   this node, as is any local write made in that window. Deliveries are not
//!   buffered during `Recovering`.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};

use super::types::{NodeId, ViewChange};
use crate::error::StateTransferError;
use crate::storage::store::ReplicaStore;
use crate::transport::GroupTransport;

pub const DEFAULT_STATE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    Joining,
    Recovering,
    Stable,
    Reconciling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerStatus {
    pub state: ReconcilerState,
    /// Sequence number of the last view the worker finished handling.
    pub handled: u64,
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Upper bound for one state request.
    pub state_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            state_timeout: DEFAULT_STATE_TIMEOUT,
        }
    }
}

#[derive(Debug, Default)]
struct RecoveryStats {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

/// Counters of state-transfer attempts made by the reconciler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryCounts {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

/// Decides which member, if any, the local node must pull state from.
///
/// `initial` is true for the first view handled after joining.
pub fn recovery_source(view: &ViewChange, local: &NodeId, initial: bool) -> Option<NodeId> {
    match view {
        ViewChange::Merge(merge) => {
            let primary = merge.primary()?;
            if primary.contains(local) {
                None
            } else {
                primary.first().cloned()
            }
        }
        ViewChange::Regular(view) if initial => {
            view.coordinator().filter(|coordinator| *coordinator != local).cloned()
        }
        ViewChange::Regular(_) => None,
    }
}

pub struct Reconciler {
    views: watch::Sender<Option<(u64, ViewChange)>>,
    submitted: AtomicU64,
    status: watch::Receiver<ReconcilerStatus>,
    stats: Arc<RecoveryStats>,
    worker: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl Reconciler {
    /// Spawns the reconciliation worker. Must be called inside a tokio runtime.
    pub fn spawn(
        store: Arc<ReplicaStore>,
        transport: Arc<dyn GroupTransport>,
        config: ReconcilerConfig,
        span: Span,
    ) -> Self {
        let (views_tx, views_rx) = watch::channel(None);
        let (status_tx, status_rx) = watch::channel(ReconcilerStatus {
            state: ReconcilerState::Joining,
            handled: 0,
        });
        let stats = Arc::new(RecoveryStats::default());

        let worker = Worker {
            store,
            transport,
            config,
            status: status_tx,
            stats: stats.clone(),
            span: span.clone(),
        };
        let handle = tokio::spawn(worker.run(views_rx).instrument(span.clone()));

        Self {
            views: views_tx,
            submitted: AtomicU64::new(0),
            status: status_rx,
            stats,
            worker: Mutex::new(Some(handle)),
            span,
        }
    }

    /// Queues a view for handling and returns immediately.
    pub fn submit(&self, view: ViewChange) {
        let seq = self.submitted.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(parent: &self.span, "Installed {}", view);
        self.views.send_replace(Some((seq, view)));
    }

    pub fn state(&self) -> ReconcilerState {
        self.status.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<ReconcilerStatus> {
        self.status.clone()
    }

    /// Waits until every submitted view has been handled and the worker is `Stable`.
    pub async fn settled(&self) {
        let target = self.submitted.load(Ordering::SeqCst);
        let mut status = self.status.clone();
        let _ = status
            .wait_for(|status| status.state == ReconcilerState::Stable && status.handled >= target)
            .await;
    }

    pub fn stats(&self) -> RecoveryCounts {
        RecoveryCounts {
            attempts: self.stats.attempts.load(Ordering::Relaxed),
            successes: self.stats.successes.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
        }
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    store: Arc<ReplicaStore>,
    transport: Arc<dyn GroupTransport>,
    config: ReconcilerConfig,
    status: watch::Sender<ReconcilerStatus>,
    stats: Arc<RecoveryStats>,
    span: Span,
}

impl Worker {
    async fn run(self, mut views: watch::Receiver<Option<(u64, ViewChange)>>) {
        let mut joined = false;

        while views.changed().await.is_ok() {
            let Some((seq, view)) = views.borrow_and_update().clone() else {
                continue;
            };
            let initial = !joined;
            joined = true;

            self.handle(&view, initial).await;
            self.status.send_replace(ReconcilerStatus {
                state: ReconcilerState::Stable,
                handled: seq,
            });
        }
    }

    async fn handle(&self, view: &ViewChange, initial: bool) {
        let local = self.store.local_id().clone();

        let Some(source) = recovery_source(view, &local, initial) else {
            match view {
                ViewChange::Merge(_) => tracing::info!(
                    "Merge of {}: local node is in the primary subgroup, keeping local state",
                    view
                ),
                ViewChange::Regular(_) if initial => {
                    tracing::info!("Local node coordinates {}, nothing to recover", view)
                }
                ViewChange::Regular(_) => tracing::debug!("Membership changed: {}", view),
            }
            return;
        };

        let state = if view.is_merge() {
            ReconcilerState::Reconciling
        } else {
            ReconcilerState::Recovering
        };
        self.status.send_modify(|status| status.state = state);
        tracing::info!("{:?}: requesting state from {}", state, source);

        match self.recover(&source).await {
            Ok(len) => {
                self.stats.successes.fetch_add(1, Ordering::Relaxed);
                tracing::info!("State transfer from {} complete ({} entries)", source, len);
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    parent: &self.span,
                    "State transfer from {} failed, continuing on local state: {}",
                    source,
                    e
                );
            }
        }
    }

    async fn recover(&self, source: &NodeId) -> Result<usize, StateTransferError> {
        self.stats.attempts.fetch_add(1, Ordering::Relaxed);
        let snapshot = self
            .transport
            .request_state(source, self.config.state_timeout)
            .await?;
        Ok(self.store.restore_snapshot(&snapshot)?)
    }
}
