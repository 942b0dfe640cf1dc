//! Replicated Map Library
//!
//! This library crate defines the modules of a replicated in-memory key-value
//! map kept consistent across a dynamic set of nodes. It serves as the
//! foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//!
//! - **`storage`**: The local replica. Holds the map, applies local and remote
//!   mutations, encodes and restores full-state snapshots and notifies subscribers.
//! - **`membership`**: The cluster coordination layer. Uses a UDP-based Gossip protocol
//!   (SWIM-like) for discovery and failure detection, turns it into views, and
//!   reconciles state after joins and healed partitions.
//! - **`transport`**: The group communication seam. A trait for broadcast, views
//!   and state transfer, with an HTTP/gossip implementation and an in-memory one.
//! - **`node`**: Wires store, reconciler and transport into a group member.
//! - **`shell`**: The interactive console driving a node.
//! - **`config`**: Command-line configuration.
//! - **`error`**: Typed errors shared by the modules above.

pub mod config;
pub mod error;
pub mod membership;
pub mod node;
pub mod shell;
pub mod storage;
pub mod transport;
