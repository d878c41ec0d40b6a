// src/core/membership.rs

//! In-memory node rosters, cluster status, and current epoch -- the shared
//! structure mutated only by the event serializer's single worker (see
//! [`crate::core::serializer`]) and read through cheap owned snapshots from
//! the I/O path.

use crate::core::node::{NodeEntry, NodeId, StorageNode, VirtualNode};
use indexmap::IndexMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

/// Maximum number of VDIs this core tracks use-bits for. The VDI semantic
/// layer itself is out of scope (`spec.md` SS1); this core only mirrors the
/// in-use bit so it can gate VDI-op broadcasts.
pub const MAX_VDIS: usize = 4096;

/// Cluster-wide formatting/serving state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    /// No cluster has ever been formatted; waiting for an explicit `Format` op.
    WaitForFormat,
    /// The cluster previously existed but not all previously-known nodes
    /// have rejoined yet.
    WaitForJoin,
    /// Quorum achieved and serving.
    Ok,
    /// Serving suspended (administrative).
    Halt,
    /// Terminal.
    Shutdown,
    /// The local node was rejected by the master; it runs only as a
    /// stateless gateway from here on.
    JoinFailed,
}

impl ClusterStatus {
    /// Whether the epoch may advance while the cluster is in this status
    /// (the membership set changes only matter while serving).
    pub fn accepts_epoch_bump(self) -> bool {
        matches!(self, Self::Ok | Self::Halt)
    }
}

/// A node the driver says is in the group, including ones still
/// handshaking (not yet ratified into the storage roster).
#[derive(Debug, Clone)]
pub struct TransportEntry {
    pub id: NodeId,
    pub entry: Option<NodeEntry>,
    pub joined_at: Instant,
}

/// The shared container for all cluster membership information on this node.
#[derive(Debug)]
pub struct MembershipState {
    pub my_id: NodeId,
    pub my_entry: NodeEntry,

    /// Nodes the driver says are in the group, ordered by arrival.
    transport: IndexMap<NodeId, TransportEntry>,
    /// Ratified subset of the transport roster, sorted by the deterministic
    /// `(address, port)` total order on `NodeEntry` -- invariant 1 and 2.
    storage: BTreeSet<StorageNode>,
    /// Nodes known to an earlier epoch but not currently in the storage
    /// roster.
    leave_list: BTreeSet<StorageNode>,

    status: ClusterStatus,
    epoch: AtomicU32,
    /// Set once this node's own join protocol round has completed, whatever
    /// the outcome.
    join_finished: AtomicBool,

    vnode_cache: Vec<VirtualNode>,
    vdi_in_use: Vec<bool>,

    /// Formatting time stamped by `make-fs`, echoed in every `Join/Init` so
    /// the master can reject a joiner formatted under a different run.
    ctime: AtomicU64,
    /// Replication-factor hint recorded at `make-fs` time.
    replication_factor: AtomicU32,
}

impl MembershipState {
    pub fn new(my_id: NodeId, my_entry: NodeEntry) -> Self {
        let mut transport = IndexMap::new();
        transport.insert(
            my_id,
            TransportEntry {
                id: my_id,
                entry: Some(my_entry.clone()),
                joined_at: Instant::now(),
            },
        );
        Self {
            my_id,
            my_entry,
            transport,
            storage: BTreeSet::new(),
            leave_list: BTreeSet::new(),
            status: ClusterStatus::WaitForFormat,
            epoch: AtomicU32::new(0),
            join_finished: AtomicBool::new(false),
            vnode_cache: Vec::new(),
            vdi_in_use: vec![false; MAX_VDIS],
            ctime: AtomicU64::new(0),
            replication_factor: AtomicU32::new(0),
        }
    }

    pub fn ctime(&self) -> u64 {
        self.ctime.load(Ordering::Acquire)
    }

    pub fn set_ctime(&self, ctime: u64) {
        self.ctime.store(ctime, Ordering::Release);
    }

    pub fn replication_factor(&self) -> u32 {
        self.replication_factor.load(Ordering::Acquire)
    }

    pub fn set_replication_factor(&self, factor: u32) {
        self.replication_factor.store(factor, Ordering::Release);
    }

    // --- status / epoch ---

    pub fn status(&self) -> ClusterStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ClusterStatus) {
        self.status = status;
    }

    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn set_epoch(&self, epoch: u32) {
        self.epoch.store(epoch, Ordering::Release);
    }

    /// Bumps the epoch by one iff the current status permits membership
    /// changes to version the cluster (`ClusterStatus ∈ {Ok, Halt}`).
    /// Returns the new epoch if it was bumped.
    pub fn bump_epoch_if_serving(&self) -> Option<u32> {
        if !self.status.accepts_epoch_bump() {
            return None;
        }
        let new_epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        Some(new_epoch)
    }

    pub fn join_finished(&self) -> bool {
        self.join_finished.load(Ordering::Acquire)
    }

    pub fn set_join_finished(&self, value: bool) {
        self.join_finished.store(value, Ordering::Release);
    }

    // --- transport roster ---

    pub fn transport_insert(&mut self, id: NodeId, entry: Option<NodeEntry>) {
        self.transport.entry(id).or_insert(TransportEntry {
            id,
            entry,
            joined_at: Instant::now(),
        });
    }

    pub fn transport_remove(&mut self, id: &NodeId) -> Option<TransportEntry> {
        self.storage.retain(|n| &n.id != id);
        self.transport.shift_remove(id)
    }

    pub fn transport_contains(&self, id: &NodeId) -> bool {
        self.transport.contains_key(id)
    }

    pub fn transport_len(&self) -> usize {
        self.transport.len()
    }

    // --- storage roster ---

    /// Migrates a node from the transport roster to the ratified storage
    /// roster (invariant 1: storage ⊆ transport).
    pub fn ratify(&mut self, id: NodeId, entry: NodeEntry) {
        self.transport_insert(id, Some(entry.clone()));
        if let Some(t) = self.transport.get_mut(&id) {
            t.entry = Some(entry.clone());
        }
        self.leave_list.retain(|n| n.id != id);
        self.storage.insert(StorageNode { id, entry });
        self.recompute_vnode_cache();
    }

    pub fn storage_remove(&mut self, id: &NodeId) -> Option<StorageNode> {
        let removed = self.storage.iter().find(|n| &n.id == id).cloned();
        if let Some(ref node) = removed {
            self.storage.remove(node);
            self.recompute_vnode_cache();
        }
        removed
    }

    pub fn storage_contains(&self, id: &NodeId) -> bool {
        self.storage.iter().any(|n| &n.id == id)
    }

    pub fn storage_len(&self) -> usize {
        self.storage.len()
    }

    /// The storage-roster head under the roster's deterministic total order
    /// -- the master, by definition. `None` only when the storage roster is
    /// empty (before this node's own join has been ratified).
    pub fn master(&self) -> Option<&StorageNode> {
        self.storage.iter().next()
    }

    pub fn is_master(&self) -> bool {
        self.master().is_some_and(|m| m.id == self.my_id)
    }

    /// Snapshot of the storage roster in deterministic order. Owned clone,
    /// safe to call from I/O worker threads; callers must tolerate it aging
    /// by one event.
    pub fn ordered_node_list(&self) -> Vec<NodeEntry> {
        self.storage.iter().map(|n| n.entry.clone()).collect()
    }

    pub fn ordered_storage_nodes(&self) -> Vec<StorageNode> {
        self.storage.iter().cloned().collect()
    }

    pub fn ordered_vnode_list(&self) -> Vec<VirtualNode> {
        self.vnode_cache.clone()
    }

    fn recompute_vnode_cache(&mut self) {
        // A stable, content-derived hash per (owner, replica index) pair so
        // the cache is reproducible across nodes without extra state.
        let mut vnodes = Vec::new();
        for node in &self.storage {
            for replica in 0..node.entry.vnodes {
                let mut h = std::collections::hash_map::DefaultHasher::new();
                use std::hash::{Hash, Hasher};
                node.entry.host.hash(&mut h);
                node.entry.port.hash(&mut h);
                replica.hash(&mut h);
                vnodes.push(VirtualNode {
                    hash: h.finish(),
                    owner: node.id,
                });
            }
        }
        vnodes.sort_by_key(|v| v.hash);
        self.vnode_cache = vnodes;
    }

    // --- leave list ---

    pub fn leave_list_insert(&mut self, node: StorageNode) {
        self.leave_list.insert(node);
    }

    pub fn leave_list_clear(&mut self) {
        self.leave_list.clear();
    }

    pub fn leave_list(&self) -> Vec<StorageNode> {
        self.leave_list.iter().cloned().collect()
    }

    pub fn leave_list_len(&self) -> usize {
        self.leave_list.len()
    }

    /// Invariant 5: while `status = WaitForJoin`, `storage ∪ leave_list`
    /// must equal the epoch log's committed node list for the current
    /// epoch; status advances to `Ok` the first time that equality holds.
    pub fn quorum_matches_known(&self, known: &[NodeEntry]) -> bool {
        let mut present: Vec<NodeEntry> = self
            .storage
            .iter()
            .map(|n| n.entry.clone())
            .chain(self.leave_list.iter().map(|n| n.entry.clone()))
            .collect();
        let mut known = known.to_vec();
        present.sort();
        known.sort();
        present == known
    }

    // --- VDI-in-use bitmap mirror ---

    pub fn vdi_in_use(&self, vdi_id: u32) -> bool {
        self.vdi_in_use
            .get(vdi_id as usize)
            .copied()
            .unwrap_or(false)
    }

    pub fn set_vdi_in_use(&mut self, vdi_id: u32, in_use: bool) {
        if let Some(slot) = self.vdi_in_use.get_mut(vdi_id as usize) {
            *slot = in_use;
        }
    }
}
