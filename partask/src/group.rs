//!
//! Cancellation groups
//!
//! A group is a tree node with an optional parent. Cancelling a group
//! atomically cancels all of its descendants; a group's reported status is
//! the transitive union of its own failures and those of its descendants.
//!
//! Groups live in a `GroupRegistry` arena addressed by `GroupId`, which
//! resolves the cyclic-reference design note in §9: tasks hold a `Group`
//! handle (an `Arc<GroupRegistry>` plus an integer id) rather than a direct
//! reference cycle through parent pointers.
//!

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cell::SyncCell;
use crate::error::PartaskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(u64);

impl GroupId {
    pub const ROOT: GroupId = GroupId(0);
}

#[derive(Debug, Clone)]
pub enum CancelReason {
    Interrupted,
    Failure(PartaskError),
}

impl CancelReason {
    fn into_error(self) -> PartaskError {
        match self {
            CancelReason::Interrupted => PartaskError::Interrupted,
            CancelReason::Failure(e) => e,
        }
    }
}

/// A group's own (non-transitive) state: whether it is alive, and whatever
/// failures were recorded directly against it (not inherited from
/// descendants).
#[derive(Debug, Clone)]
struct GroupState {
    alive: bool,
    own_failures: Vec<PartaskError>,
}

impl GroupState {
    fn alive() -> Self {
        GroupState {
            alive: true,
            own_failures: Vec::new(),
        }
    }
}

struct GroupNode {
    parent: Option<GroupId>,
    children: Vec<GroupId>,
    state: SyncCell<GroupState>,
}

/// The set of groups for one runtime, addressed by id. Protected by a
/// single mutex over the topology (parent/child links); each node's own
/// alive/failure state is a `SyncCell` so readers needn't take the topology
/// lock.
pub struct GroupRegistry {
    nodes: std::sync::Mutex<HashMap<GroupId, GroupNode>>,
    next_id: AtomicU64,
}

impl GroupRegistry {
    pub fn new() -> Arc<Self> {
        let reg = GroupRegistry {
            nodes: std::sync::Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        };
        {
            let mut nodes = reg.nodes.lock().unwrap();
            nodes.insert(
                GroupId::ROOT,
                GroupNode {
                    parent: None,
                    children: Vec::new(),
                    state: SyncCell::new(GroupState::alive()),
                },
            );
        }
        Arc::new(reg)
    }

    pub fn new_group(self: &Arc<Self>, parent: Option<GroupId>) -> GroupId {
        let parent = parent.unwrap_or(GroupId::ROOT);
        let id = GroupId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut nodes = self.nodes.lock().unwrap();
        nodes.insert(
            id,
            GroupNode {
                parent: Some(parent),
                children: Vec::new(),
                state: SyncCell::new(GroupState::alive()),
            },
        );
        if let Some(parent_node) = nodes.get_mut(&parent) {
            parent_node.children.push(id);
        }
        id
    }

    pub fn is_alive(&self, group: GroupId) -> bool {
        let nodes = self.nodes.lock().unwrap();
        match nodes.get(&group) {
            Some(node) => node.state.value().alive,
            None => false,
        }
    }

    /// Cancel `group` and every descendant. Idempotent and monotonic:
    /// already-cancelled groups are left untouched (their first recorded
    /// reason wins). Returns the set of groups that transitioned from alive
    /// to cancelled by this call (possibly empty, if everything in the
    /// subtree was already cancelled).
    pub fn cancel(&self, group: GroupId, reason: CancelReason) -> Vec<GroupId> {
        let mut affected = Vec::new();
        let nodes = self.nodes.lock().unwrap();
        let mut stack = vec![(group, true)];
        // `is_root_of_cancellation` distinguishes the group the reason was
        // raised against (its own_failures gets the reason) from descendants
        // (which only get a bare Interrupted unless they already failed).
        while let Some((id, is_root)) = stack.pop() {
            let Some(node) = nodes.get(&id) else {
                continue;
            };
            let became_cancelled = node.state.guarded_access(|state| {
                if !state.alive {
                    return Some((false, state.clone()));
                }
                let mut next = state.clone();
                next.alive = false;
                if is_root {
                    next.own_failures.push(reason.clone().into_error());
                }
                Some((true, next))
            });
            if became_cancelled {
                affected.push(id);
            }
            for child in &node.children {
                stack.push((*child, false));
            }
        }
        affected
    }

    /// The groups currently known to the registry that are still alive,
    /// cancelling none of them. Used by `Scheduler::cancel_all`.
    pub fn alive_groups(&self) -> Vec<GroupId> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .iter()
            .filter(|(_, node)| node.state.value().alive)
            .map(|(id, _)| *id)
            .collect()
    }

    /// The transitive union of failures recorded against `group` and all of
    /// its descendants, computed on demand (never cached).
    pub fn collected_failures(&self, group: GroupId) -> Vec<PartaskError> {
        let nodes = self.nodes.lock().unwrap();
        let mut out = Vec::new();
        let mut stack = vec![group];
        while let Some(id) = stack.pop() {
            let Some(node) = nodes.get(&id) else {
                continue;
            };
            out.extend(node.state.value().own_failures.iter().cloned());
            stack.extend(node.children.iter().copied());
        }
        out
    }

    /// Number of bookkeeping nodes currently tracked, for tests asserting
    /// that reaping keeps this from growing unboundedly.
    pub(crate) fn node_count(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }

    /// `group`'s parent, if it has one and is still tracked (the root group
    /// has none). Used by the scheduler to walk a chain of now-empty groups
    /// upward after reaping a leaf.
    pub fn parent_of(&self, group: GroupId) -> Option<GroupId> {
        let nodes = self.nodes.lock().unwrap();
        nodes.get(&group)?.parent
    }

    /// Orphan rule: drop a group with no tasks and no live descendants. The
    /// task queue is the authority on "no tasks"; this just removes the
    /// bookkeeping node once the caller has confirmed that.
    pub fn reap(&self, group: GroupId) {
        if group == GroupId::ROOT {
            return;
        }
        let mut nodes = self.nodes.lock().unwrap();
        let Some(node) = nodes.get(&group) else {
            return;
        };
        if !node.children.is_empty() {
            return;
        }
        let parent = node.parent;
        nodes.remove(&group);
        if let Some(parent) = parent {
            if let Some(parent_node) = nodes.get_mut(&parent) {
                parent_node.children.retain(|c| *c != group);
            }
        }
    }
}

/// A cheap-to-clone handle to one group within a registry.
#[derive(Clone)]
pub struct Group {
    registry: Arc<GroupRegistry>,
    id: GroupId,
}

impl Group {
    pub fn root(registry: Arc<GroupRegistry>) -> Self {
        Group {
            registry,
            id: GroupId::ROOT,
        }
    }

    pub(crate) fn from_parts(registry: Arc<GroupRegistry>, id: GroupId) -> Self {
        Group { registry, id }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn registry(&self) -> &Arc<GroupRegistry> {
        &self.registry
    }

    pub fn new_child(&self) -> Group {
        let id = self.registry.new_group(Some(self.id));
        Group {
            registry: self.registry.clone(),
            id,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.registry.is_alive(self.id)
    }

    pub fn cancel(&self, reason: CancelReason) -> Vec<GroupId> {
        self.registry.cancel(self.id, reason)
    }

    pub fn collected_failures(&self) -> Vec<PartaskError> {
        self.registry.collected_failures(self.id)
    }
}
