// src/core/node.rs

//! Identity types for cluster members.
//!
//! A [`NodeId`] is assigned by the cluster driver and identifies one node
//! instance for the lifetime of its membership in the transport group. A
//! [`NodeEntry`] is the storage-layer identity (address, zone, weight) that
//! becomes bound to a `NodeId` once the node's join has been ratified.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Driver-assigned handle for one node instance: address plus process identity,
/// so that a restarted process at the same address is never confused with its
/// predecessor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct NodeId {
    pub addr: u64,
    pub pid: u32,
}

impl NodeId {
    pub fn new(addr: u64, pid: u32) -> Self {
        Self { addr, pid }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}/{}", self.addr, self.pid)
    }
}

/// The storage-layer identity of a node: network address, zone id used for
/// replica placement diversity, and a virtual-node weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct NodeEntry {
    pub host: String,
    pub port: u16,
    /// Replica-placement diversity domain; replicas of the same object avoid
    /// sharing a zone where possible.
    pub zone: u32,
    /// Virtual-node count: a weight-granularity replica placement token count.
    pub vnodes: u16,
}

impl NodeEntry {
    pub fn new(host: impl Into<String>, port: u16, zone: u32, vnodes: u16) -> Self {
        Self {
            host: host.into(),
            port,
            zone,
            vnodes,
        }
    }
}

/// Total order on `(host, port)`, used to sort the storage roster
/// deterministically on every node so that mastership never needs
/// negotiation (invariant 2 of the membership design).
impl Ord for NodeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.host, self.port).cmp(&(&other.host, other.port))
    }
}

impl PartialOrd for NodeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A ratified roster member: its driver identity paired with its storage
/// identity. Ordered by `NodeEntry` alone (ties broken by `NodeId` to keep a
/// total order even for pathological duplicate-address configurations).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct StorageNode {
    pub id: NodeId,
    pub entry: NodeEntry,
}

impl Ord for StorageNode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.entry
            .cmp(&other.entry)
            .then_with(|| self.id.addr.cmp(&other.id.addr))
            .then_with(|| self.id.pid.cmp(&other.id.pid))
    }
}

impl PartialOrd for StorageNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A weight-granularity replica placement token derived from a `NodeEntry`.
/// The placement layer (out of scope here) consumes the ordered vnode list
/// produced by [`crate::core::membership::MembershipState::ordered_vnode_list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualNode {
    pub hash: u64,
    pub owner: NodeId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_entry_orders_by_host_then_port() {
        let a = NodeEntry::new("10.0.0.1", 7000, 0, 128);
        let b = NodeEntry::new("10.0.0.1", 7001, 0, 128);
        let c = NodeEntry::new("10.0.0.2", 7000, 0, 128);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn storage_node_tie_breaks_on_node_id() {
        let entry = NodeEntry::new("10.0.0.1", 7000, 0, 128);
        let low = StorageNode {
            id: NodeId::new(1, 0),
            entry: entry.clone(),
        };
        let high = StorageNode {
            id: NodeId::new(2, 0),
            entry,
        };
        assert!(low < high);
    }
}
