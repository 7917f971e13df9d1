//! Node registry.
//!
//! Per-invocation concurrent map from instance id to node lifecycle state.
//! Every operation is atomic for a single entry; there is no whole-map
//! snapshot consistency and iteration order is unspecified.

use cirrus_id::{AddressId, InstanceId};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tracing::{debug, warn};

use crate::types::{NodeState, Role};

/// Concurrent store of node states for one orchestration run.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: DashMap<InstanceId, NodeState>,

    /// Floating addresses allocated by this run, bound or not.
    allocated: DashSet<AddressId>,
}

impl NodeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a node.
    ///
    /// The role recorded on first observation is kept; a conflicting role in
    /// `state` is ignored.
    pub fn upsert(&self, mut state: NodeState) {
        match self.nodes.entry(state.instance_id.clone()) {
            Entry::Occupied(mut entry) => {
                let existing_role = entry.get().role;
                if existing_role != state.role {
                    warn!(
                        instance_id = %state.instance_id,
                        existing = %existing_role,
                        ignored = %state.role,
                        "Ignoring role change for known node"
                    );
                    state.role = existing_role;
                }
                entry.insert(state);
            }
            Entry::Vacant(entry) => {
                debug!(
                    instance_id = %state.instance_id,
                    role = %state.role,
                    status = %state.status,
                    "Registered node"
                );
                entry.insert(state);
            }
        }
    }

    /// Get a copy of a node's state.
    pub fn get(&self, id: &InstanceId) -> Option<NodeState> {
        self.nodes.get(id).map(|entry| entry.value().clone())
    }

    /// Mutate a node in place. Returns false if the node is unknown.
    ///
    /// The role is restored after `f` runs.
    pub fn update<F>(&self, id: &InstanceId, f: F) -> bool
    where
        F: FnOnce(&mut NodeState),
    {
        match self.nodes.get_mut(id) {
            Some(mut entry) => {
                let role = entry.role;
                f(entry.value_mut());
                entry.role = role;
                true
            }
            None => false,
        }
    }

    /// Visit every node present when the call starts.
    ///
    /// Each visit sees a consistent copy of one entry. No lock is held while
    /// `visit` runs, so the visitor may call `upsert` or `update`.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&NodeState),
    {
        for id in self.ids() {
            if let Some(state) = self.get(&id) {
                visit(&state);
            }
        }
    }

    /// Copies of all entries.
    pub fn snapshot(&self) -> Vec<NodeState> {
        self.nodes.iter().map(|entry| entry.value().clone()).collect()
    }

    /// All known instance ids.
    pub fn ids(&self) -> Vec<InstanceId> {
        self.nodes.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Ids of nodes with the given role.
    pub fn ids_with_role(&self, role: Role) -> Vec<InstanceId> {
        self.nodes
            .iter()
            .filter(|entry| entry.role == role)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Ids of nodes created by this run.
    pub fn rollback_candidates(&self) -> Vec<InstanceId> {
        let mut ids: Vec<_> = self
            .nodes
            .iter()
            .filter(|entry| entry.rollback_eligible)
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Remember addresses allocated by this run.
    pub fn record_allocation(&self, ids: &[AddressId]) {
        for id in ids {
            self.allocated.insert(id.clone());
        }
    }

    /// Addresses allocated by this run, sorted.
    pub fn allocated_addresses(&self) -> Vec<AddressId> {
        let mut ids: Vec<_> = self.allocated.iter().map(|id| id.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
