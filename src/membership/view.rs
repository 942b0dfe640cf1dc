//! View Installation
//!
//! Turns successive alive-member lists into installed views. Two situations
//! produce a `MergeView` instead of a plain one:
//! - a member that was part of an earlier view, dropped out, and is seen alive
//!   again (a healed partition);
//! - the new view's coordinator was never part of any view this node installed
//!   (two groups that formed separately found each other, e.g. a joiner whose
//!   seed was unreachable until after its join timeout).
//!
//! Subgroups are computed locally from what this node saw: `[members it kept,
//! members that arrived through the merge]`, ordered so that subgroup 0 holds
//! the oldest member of the merged view. Subgroup 0 therefore means "the side
//! of the oldest member", not an exact pre-merge partition; after a three-way
//! heal a non-primary node may list members of two other partitions together.
//! Every node still pulls from the same source, the oldest member.
//!
//! Ordering relies on `joined_at` timestamps. Heavy clock skew between hosts
//! can make a fresh joiner look older than the group it joins.

use std::collections::HashSet;

use super::types::{MembershipView, MergeView, NodeId, ViewChange};

#[derive(Debug, Default)]
pub struct ViewTracker {
    current: Option<MembershipView>,
    /// Members of earlier views missing from the current one.
    departed: HashSet<NodeId>,
}

impl ViewTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&MembershipView> {
        self.current.as_ref()
    }

    /// Members remembered as having dropped out of an earlier view.
    pub fn departed(&self) -> &HashSet<NodeId> {
        &self.departed
    }

    /// Drops a member that left for good from the departed set.
    pub fn forget(&mut self, id: &NodeId) -> bool {
        self.departed.remove(id)
    }

    /// Feeds the current alive members, ordered oldest first.
    ///
    /// Returns the view to install, or `None` if membership did not change.
    pub fn observe(&mut self, members: Vec<NodeId>) -> Option<ViewChange> {
        if let Some(current) = &self.current
            && current.members == members
        {
            return None;
        }

        let view_id = self.current.as_ref().map_or(1, |view| view.view_id + 1);
        let previous: Vec<NodeId> = self
            .current
            .take()
            .map(|view| view.members)
            .unwrap_or_default();

        let revived: HashSet<NodeId> = members
            .iter()
            .filter(|id| self.departed.contains(*id))
            .cloned()
            .collect();
        let foreign_group = !previous.is_empty()
            && members.first().is_some_and(|coordinator| {
                !previous.contains(coordinator) && !self.departed.contains(coordinator)
            });

        for id in &previous {
            if !members.contains(id) {
                self.departed.insert(id.clone());
            }
        }
        for id in &revived {
            self.departed.remove(id);
        }

        let view = MembershipView::new(view_id, members);
        self.current = Some(view.clone());

        if revived.is_empty() && !foreign_group {
            return Some(ViewChange::Regular(view));
        }

        let (arrived, kept): (Vec<NodeId>, Vec<NodeId>) =
            view.members.iter().cloned().partition(|id| {
                revived.contains(id) || (foreign_group && !previous.contains(id))
            });

        let mut subgroups = vec![kept, arrived];
        subgroups.retain(|group| !group.is_empty());
        if let Some(oldest) = view.members.first() {
            subgroups.sort_by_key(|group| !group.contains(oldest));
        }

        Some(ViewChange::Merge(MergeView {
            view_id,
            members: view.members,
            subgroups,
        }))
    }
}
