//! Membership & Reconciliation Module
//!
//! Tracks who is in the group and keeps the local map consistent with it as
//! members come, go, and partitions heal.
//!
//! ## Core Mechanisms
//! - **Gossip Protocol**: Nodes periodically exchange status updates via UDP to maintain a consistent view of the cluster.
//! - **Failure Detection**: Uses a "Suspect" -> "Dead" transition model with timeouts to handle node crashes gracefully.
//!   Dead members keep being probed so a healed partition is noticed.
//! - **Incarnation Numbers**: Solves conflict resolution when node state (Alive/Suspect) is disputed.
//! - **Views**: The alive set, ordered oldest first, is installed as a numbered view. A view that
//!   brings back previously departed members is a merge view.
//! - **Reconciliation**: Joining nodes pull the coordinator's state; after a merge, nodes outside
//!   the primary subgroup replace their state with the primary's.

pub mod reconciler;
pub mod service;
pub mod types;
pub mod view;
