use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// Address of a group member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
    /// Left the group on purpose. Kept as a tombstone so stale gossip cannot revive it.
    Left,
}

/// Represents a single member in the cluster.
///
/// Contains identity, network addressing, and current lifecycle state.
/// The `incarnation` field is a logical clock used to order updates and resolve conflicts
/// (e.g., refuting a false "Suspect" claim). `joined_at` orders members inside a view:
/// the oldest member is the view's coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub gossip_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub state: NodeState,
    pub incarnation: u64,
    pub joined_at: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

/// The gossip wire protocol.
///
/// - `Ping/Ack`: Used for liveness checks and state synchronization.
/// - `Join`: Sent by new nodes to seed nodes to enter the cluster.
/// - `Suspect/Alive`: Disseminates changes in node health.
/// - `Leave`: Sent by a node shutting down cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        from: NodeId,
        incarnation: u64,
        http_addr: SocketAddr,
        joined_at: u64,
    },

    Ack {
        from: NodeId,
        incarnation: u64,
        members: Vec<Node>,
    },

    Join {
        node: Node,
    },

    Suspect {
        node_id: NodeId,
        incarnation: u64,
    },

    Alive {
        node_id: NodeId,
        incarnation: u64,
    },

    Leave {
        node_id: NodeId,
    },
}

/// Every gossip datagram is scoped to a group; datagrams for other groups are dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipEnvelope {
    pub group: String,
    pub message: GossipMessage,
}

/// An installed membership view. Each view replaces the previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipView {
    pub view_id: u64,
    /// Ordered oldest first; the first member is the coordinator.
    pub members: Vec<NodeId>,
}

impl MembershipView {
    pub fn new(view_id: u64, members: Vec<NodeId>) -> Self {
        Self { view_id, members }
    }

    pub fn coordinator(&self) -> Option<&NodeId> {
        self.members.first()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.contains(id)
    }
}

/// A view installed when previously separated partitions become reachable again.
///
/// `subgroups` lists the sides being merged as seen by the local node;
/// subgroup 0 is the primary and always holds the oldest member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeView {
    pub view_id: u64,
    pub members: Vec<NodeId>,
    pub subgroups: Vec<Vec<NodeId>>,
}

impl MergeView {
    pub fn primary(&self) -> Option<&[NodeId]> {
        self.subgroups.first().map(Vec::as_slice)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewChange {
    Regular(MembershipView),
    Merge(MergeView),
}

impl ViewChange {
    pub fn view_id(&self) -> u64 {
        match self {
            ViewChange::Regular(view) => view.view_id,
            ViewChange::Merge(view) => view.view_id,
        }
    }

    pub fn members(&self) -> &[NodeId] {
        match self {
            ViewChange::Regular(view) => &view.members,
            ViewChange::Merge(view) => &view.members,
        }
    }

    pub fn coordinator(&self) -> Option<&NodeId> {
        self.members().first()
    }

    pub fn is_merge(&self) -> bool {
        matches!(self, ViewChange::Merge(_))
    }
}

impl fmt::Display for ViewChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids = |members: &[NodeId]| {
            members
                .iter()
                .map(|id| id.0.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        match self {
            ViewChange::Regular(view) => write!(f, "view {} [{}]", view.view_id, ids(&view.members)),
            ViewChange::Merge(view) => {
                let subgroups = view
                    .subgroups
                    .iter()
                    .map(|group| format!("[{}]", ids(group)))
                    .collect::<Vec<_>>()
                    .join(" ");
                write!(
                    f,
                    "merge view {} [{}] subgroups {}",
                    view.view_id,
                    ids(&view.members),
                    subgroups
                )
            }
        }
    }
}
