// src/core/protocol/leave.rs

//! The leave/partition protocol (`spec.md` SS4.E.4): the majority check
//! that self-fences a minority partition, storage-roster removal, and the
//! voluntary `Leave/Fin` a departing node broadcasts before closing.

use crate::core::epoch_log::EpochLog;
use crate::core::membership::{ClusterStatus, MembershipState};
use crate::core::node::{NodeEntry, NodeId};
use crate::core::protocol::message::LeavePayload;

/// Majority check run against a driver view-leave, before any roster
/// mutation. `storage_len_before_removal` is `|storage_roster|` prior to
/// removing the departed node(s); `reachable` is how many *other* storage
/// members this node could still TCP-connect to.
///
/// Returns `true` when this node must self-fence (abort). Per spec.md
/// SS4.E.4, the check only applies once the roster is large enough for a
/// majority to be meaningful (`n >= 3`); smaller rosters never self-fence
/// since remaining alone is often the expected outcome of a two-node
/// teardown.
pub fn should_self_fence(storage_len_before_removal: usize, reachable: usize) -> bool {
    let n = storage_len_before_removal;
    if n < 3 {
        return false;
    }
    let m = n / 2 + 1;
    reachable < m.saturating_sub(1)
}

/// Removes a departed node from the storage roster and, if the cluster was
/// serving, bumps and persists the epoch. Returns the new epoch if it was
/// bumped.
pub fn apply_leave(
    membership: &mut MembershipState,
    epoch_log: &EpochLog,
    left: NodeId,
) -> Option<u32> {
    membership.storage_remove(&left);
    membership.transport_remove(&left);
    let bumped = membership.bump_epoch_if_serving();
    if let Some(epoch) = bumped {
        epoch_log.write(epoch, &membership.ordered_node_list());
    }
    bumped
}

/// Builds the `Leave/Fin` payload a voluntarily-departing node broadcasts
/// before closing its connection, carrying its last-known epoch so peers
/// can tell a clean departure from a crash.
pub fn build_leave_fin(membership: &MembershipState) -> LeavePayload {
    LeavePayload {
        epoch: membership.epoch(),
    }
}

/// Applies an observed `Leave/Fin`: while the cluster is `WaitForJoin`,
/// a clean departure is recorded on the leave list so the quorum formula
/// (`spec.md` SS4.E.2) can account for it, instead of waiting for that node
/// to rejoin. Since adding to the leave list can itself be what closes
/// quorum (invariant 5: `storage ∪ leave == epoch_log[epoch]`), the
/// equality is rechecked right here, exactly as the join protocol's
/// "known-dead" branch would: a match bumps and persists the epoch (the
/// current epoch's committed roster no longer reflects the departed peer)
/// and advances status to `Ok`. Returns the resulting `ClusterStatus`.
pub fn apply_leave_fin(
    membership: &mut MembershipState,
    epoch_log: &EpochLog,
    left: NodeId,
    left_entry: NodeEntry,
) -> ClusterStatus {
    if membership.status() != ClusterStatus::WaitForJoin {
        return membership.status();
    }

    membership.leave_list_insert(crate::core::node::StorageNode {
        id: left,
        entry: left_entry,
    });

    let known = epoch_log.read(membership.epoch()).unwrap_or_default();
    if !known.is_empty() && membership.quorum_matches_known(&known) {
        let new_epoch = membership.epoch() + 1;
        membership.set_epoch(new_epoch);
        epoch_log.write(new_epoch, &membership.ordered_node_list());
        membership.set_status(ClusterStatus::Ok);
    }

    membership.status()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::NodeEntry;

    fn entry(host: &str) -> NodeEntry {
        NodeEntry::new(host, 7000, 0, 128)
    }

    #[test]
    fn small_rosters_never_self_fence() {
        assert!(!should_self_fence(2, 0));
    }

    #[test]
    fn minority_partition_self_fences() {
        // n = 5, m = 3; a node reaching only 1 other storage peer (< m-1=2) fences.
        assert!(should_self_fence(5, 1));
    }

    #[test]
    fn majority_partition_does_not_self_fence() {
        // n = 5, m = 3; reaching 2 other peers meets m-1.
        assert!(!should_self_fence(5, 2));
    }

    #[test]
    fn apply_leave_removes_and_bumps_epoch_while_serving() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        let my_id = NodeId::new(1, 0);
        let mut membership = MembershipState::new(my_id, entry("10.0.0.1"));
        membership.ratify(my_id, entry("10.0.0.1"));
        let other = NodeId::new(2, 0);
        membership.ratify(other, entry("10.0.0.2"));
        membership.set_status(ClusterStatus::Ok);

        let bumped = apply_leave(&mut membership, &log, other);
        assert_eq!(bumped, Some(1));
        assert!(!membership.storage_contains(&other));
        assert_eq!(log.latest(), 1);
    }

    #[test]
    fn apply_leave_fin_adds_to_leave_list_only_while_wait_for_join() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        let my_id = NodeId::new(1, 0);
        let mut membership = MembershipState::new(my_id, entry("10.0.0.1"));
        membership.set_status(ClusterStatus::WaitForJoin);
        let left = NodeId::new(2, 0);
        apply_leave_fin(&mut membership, &log, left, entry("10.0.0.2"));
        assert_eq!(membership.leave_list_len(), 1);

        membership.set_status(ClusterStatus::Ok);
        let other = NodeId::new(3, 0);
        apply_leave_fin(&mut membership, &log, other, entry("10.0.0.3"));
        assert_eq!(membership.leave_list_len(), 1);
    }

    #[test]
    fn apply_leave_fin_closes_quorum_and_bumps_epoch_when_known_dead_peer_completes_it() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        let my_id = NodeId::new(1, 0);
        let mut membership = MembershipState::new(my_id, entry("10.0.0.1"));
        membership.ratify(my_id, entry("10.0.0.1"));
        let other = NodeId::new(2, 0);
        membership.ratify(other, entry("10.0.0.2"));
        membership.set_status(ClusterStatus::WaitForJoin);
        membership.set_epoch(3);
        log.write(3, &[entry("10.0.0.1"), entry("10.0.0.2"), entry("10.0.0.3")]);

        let left = NodeId::new(3, 0);
        let status = apply_leave_fin(&mut membership, &log, left, entry("10.0.0.3"));
        assert_eq!(status, ClusterStatus::Ok);
        assert_eq!(membership.epoch(), 4);
        assert_eq!(log.read(4), Some(vec![entry("10.0.0.1"), entry("10.0.0.2")]));
    }

    #[test]
    fn apply_leave_fin_leaves_quorum_open_when_peers_still_missing() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        let my_id = NodeId::new(1, 0);
        let mut membership = MembershipState::new(my_id, entry("10.0.0.1"));
        membership.ratify(my_id, entry("10.0.0.1"));
        membership.set_status(ClusterStatus::WaitForJoin);
        membership.set_epoch(3);
        log.write(
            3,
            &[entry("10.0.0.1"), entry("10.0.0.2"), entry("10.0.0.3")],
        );

        let left = NodeId::new(3, 0);
        let status = apply_leave_fin(&mut membership, &log, left, entry("10.0.0.3"));
        assert_eq!(status, ClusterStatus::WaitForJoin);
        assert_eq!(membership.epoch(), 3);
    }
}
