//! # Node Registry
//!
//! In-memory table of known peers. The discovery, message and heartbeat
//! loops all write to it concurrently, so every operation takes the
//! internal lock for the shortest possible time and never across an await.
//!
//! ## Invariants
//!
//! - One entry per `NodeId`; re-registration overwrites.
//! - `last_seen` never moves backwards for an entry.
//! - The local node is never entered (the registry holds peers only).
//! - Offline or leaving peers are removed, not flagged.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

use crate::domain::value_objects::{NodeId, NodeStatus, NodeType, RoleSet, Timestamp};

/// Address recorded for peers first seen without one.
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Everything the local node believes about one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDescriptor {
    pub node_id: NodeId,
    pub address: String,
    pub node_type: NodeType,
    pub roles: RoleSet,
    pub last_seen: Timestamp,
    pub status: NodeStatus,
}

/// Partial update applied by `NodeRegistry::upsert`.
///
/// `None` fields keep the current value (or the insert default for new
/// entries).
#[derive(Debug, Clone)]
pub struct NodeUpdate {
    pub seen_at: Timestamp,
    pub address: Option<String>,
    pub node_type: Option<NodeType>,
    pub roles: Option<RoleSet>,
    pub status: Option<NodeStatus>,
}

impl NodeUpdate {
    /// An update that only records contact at `seen_at`.
    pub fn seen(seen_at: Timestamp) -> Self {
        Self {
            seen_at,
            address: None,
            node_type: None,
            roles: None,
            status: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_type(mut self, node_type: NodeType) -> Self {
        self.node_type = Some(node_type);
        self
    }

    pub fn with_roles(mut self, roles: RoleSet) -> Self {
        self.roles = Some(roles);
        self
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The id was the local node's own id.
    RejectedSelf,
}

/// Registry statistics for snapshots and logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total: usize,
    pub coordinators: usize,
    pub workers: usize,
}

/// Thread-safe peer table owned by one node.
#[derive(Debug)]
pub struct NodeRegistry {
    local_id: NodeId,
    nodes: RwLock<HashMap<NodeId, NodeDescriptor>>,
}

impl NodeRegistry {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Insert or update a peer.
    pub fn upsert(&self, id: &NodeId, update: NodeUpdate) -> UpsertOutcome {
        if *id == self.local_id {
            return UpsertOutcome::RejectedSelf;
        }

        let mut nodes = self.nodes.write();
        match nodes.get_mut(id) {
            Some(existing) => {
                existing.last_seen = existing.last_seen.max(update.seen_at);
                if let Some(address) = update.address {
                    existing.address = address;
                }
                if let Some(node_type) = update.node_type {
                    existing.node_type = node_type;
                }
                if let Some(roles) = update.roles {
                    existing.roles = roles;
                }
                if let Some(status) = update.status {
                    existing.status = status;
                }
                UpsertOutcome::Updated
            }
            None => {
                nodes.insert(
                    id.clone(),
                    NodeDescriptor {
                        node_id: id.clone(),
                        address: update
                            .address
                            .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string()),
                        node_type: update.node_type.unwrap_or_default(),
                        roles: update.roles.unwrap_or_default(),
                        last_seen: update.seen_at,
                        status: update.status.unwrap_or(NodeStatus::Active),
                    },
                );
                UpsertOutcome::Inserted
            }
        }
    }

    /// Refresh `last_seen` for a known peer. Returns `false` if unknown.
    pub fn touch(&self, id: &NodeId, seen_at: Timestamp) -> bool {
        let mut nodes = self.nodes.write();
        match nodes.get_mut(id) {
            Some(existing) => {
                existing.last_seen = existing.last_seen.max(seen_at);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &NodeId) -> Option<NodeDescriptor> {
        self.nodes.write().remove(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<NodeDescriptor> {
        self.nodes.read().get(id).cloned()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.read().contains_key(id)
    }

    /// Snapshot of every entry, ordered by id.
    pub fn all(&self) -> Vec<NodeDescriptor> {
        let mut all: Vec<_> = self.nodes.read().values().cloned().collect();
        all.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        all
    }

    /// Ids of every peer except `skip`.
    pub fn ids_except(&self, skip: Option<&NodeId>) -> Vec<NodeId> {
        let mut ids: Vec<_> = self
            .nodes
            .read()
            .keys()
            .filter(|id| Some(*id) != skip)
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Peers not heard from for longer than `threshold` at `now`.
    pub fn stale(&self, now: Timestamp, threshold: Duration) -> Vec<NodeId> {
        let mut stale: Vec<_> = self
            .nodes
            .read()
            .values()
            .filter(|node| now.saturating_since(node.last_seen) > threshold)
            .map(|node| node.node_id.clone())
            .collect();
        stale.sort();
        stale
    }

    pub fn stats(&self) -> RegistryStats {
        let nodes = self.nodes.read();
        let coordinators = nodes
            .values()
            .filter(|n| n.node_type.is_coordinator())
            .count();
        RegistryStats {
            total: nodes.len(),
            coordinators,
            workers: nodes.len() - coordinators,
        }
    }
}
