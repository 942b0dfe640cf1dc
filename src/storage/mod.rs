//! Replicated Storage Module
//!
//! Implements the in-memory key-value map that every node of the group holds
//! a full copy of.
//!
//! ## Core Concepts
//! - **Local-then-broadcast**: `put`/`remove` mutate the local map first, then
//!   hand a `MutationMessage` to the transport. Writers read their own writes
//!   immediately; other members converge once the broadcast is delivered.
//! - **Unconditional apply**: remote `Insert`/`Remove` overwrite or delete
//!   without version checks. Both are idempotent.
//! - **Snapshots**: joining or reconciling nodes replace their whole map with
//!   a peer's snapshot; snapshots are never merged key-by-key.

pub mod codec;
pub mod store;
pub mod types;

#[cfg(test)]
mod tests;
