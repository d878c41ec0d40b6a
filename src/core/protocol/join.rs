// src/core/protocol/join.rs

//! The join protocol (`spec.md` SS4.E.2): first-node bootstrap, the
//! joiner's `Join/Init` broadcast, the master's cluster-sanity check, and
//! the deterministic `Join/Fin` application run by every node including
//! the joiner itself.

use crate::core::epoch_log::EpochLog;
use crate::core::membership::{ClusterStatus, MembershipState};
use crate::core::node::{NodeEntry, NodeId};
use crate::core::protocol::message::JoinPayload;
use crate::core::status::ClusterStatusCode;

/// Decision reached when this node observes a driver view-join whose
/// membership is exactly `{self}` -- it is first to arrive.
pub struct Bootstrap {
    pub status: ClusterStatus,
    pub epoch: u32,
}

/// Runs the `on_view_join(self, {self})` bootstrap check. A node that finds
/// a committed epoch log resumes at `WaitForJoin`, waiting for its former
/// peers; an empty log starts fresh at `WaitForFormat`. Either way this node
/// becomes master by definition: it is the sole entry of a one-element
/// storage roster (invariant 2).
pub fn bootstrap(epoch_log: &EpochLog) -> Bootstrap {
    let latest = epoch_log.latest();
    if latest == 0 {
        Bootstrap {
            status: ClusterStatus::WaitForFormat,
            epoch: 0,
        }
    } else {
        Bootstrap {
            status: ClusterStatus::WaitForJoin,
            epoch: latest,
        }
    }
}

/// Builds the `Join/Init` payload a joining node broadcasts: its locally
/// known epoch, ctime, replication-factor hint, and the node list read back
/// from its own epoch log (empty if it has none).
pub fn build_init(
    epoch_log: &EpochLog,
    epoch: u32,
    ctime: u64,
    replication_factor_hint: u32,
    joiner_id: NodeId,
    joiner_entry: NodeEntry,
) -> JoinPayload {
    let nodes = epoch_log
        .read(epoch)
        .unwrap_or_default()
        .into_iter()
        .map(|entry| (NodeId::new(0, 0), entry))
        .collect();
    JoinPayload {
        joiner_id,
        joiner_entry,
        nr_sobjs: replication_factor_hint,
        cluster_status: 0,
        epoch,
        ctime,
        result: ClusterStatusCode::Success,
        inc_epoch: false,
        nodes,
        leave_nodes: Vec::new(),
    }
}

/// The master's cluster-sanity verdict on an incoming `Join/Init`, ready to
/// broadcast as `Join/Fin`.
pub struct SanityOutcome {
    pub response: JoinPayload,
    /// Set when the joiner reported a higher epoch than the master's own --
    /// the master must transfer mastership and exit rather than admit.
    pub transfer_mastership: bool,
}

/// Runs cluster sanity against an inbound `Join/Init`, following the table
/// in `spec.md` SS4.E.2. Only called on the current master.
pub fn handle_init(
    membership: &MembershipState,
    epoch_log: &EpochLog,
    local_ctime: u64,
    joiner_id: NodeId,
    joiner_entry: NodeEntry,
    joiner: &JoinPayload,
) -> SanityOutcome {
    let epoch = membership.epoch();
    let mut response = joiner.clone();
    response.inc_epoch = false;

    match membership.status() {
        ClusterStatus::WaitForFormat => {
            if joiner.nr_nodes() > 0 {
                response.result = ClusterStatusCode::NotFormatted;
            } else {
                response.result = ClusterStatusCode::Success;
            }
            return SanityOutcome {
                response,
                transfer_mastership: false,
            };
        }
        ClusterStatus::Shutdown => {
            response.result = ClusterStatusCode::Shutdown;
            return SanityOutcome {
                response,
                transfer_mastership: false,
            };
        }
        ClusterStatus::WaitForJoin => {
            if joiner.ctime != local_ctime {
                response.result = ClusterStatusCode::InvalidCtime;
                return SanityOutcome {
                    response,
                    transfer_mastership: false,
                };
            }
            if joiner.epoch != epoch {
                let transfer = joiner.epoch > epoch;
                response.result = if transfer {
                    ClusterStatusCode::NewNodeVer
                } else {
                    ClusterStatusCode::OldNodeVer
                };
                return SanityOutcome {
                    response,
                    transfer_mastership: transfer,
                };
            }
            let known = epoch_log.read(epoch).unwrap_or_default();
            let mut joiner_nodes: Vec<NodeEntry> =
                joiner.nodes.iter().map(|(_, e)| e.clone()).collect();
            let mut known_sorted = known.clone();
            joiner_nodes.sort();
            known_sorted.sort();
            if joiner_nodes != known_sorted {
                response.result = ClusterStatusCode::InvalidEpoch;
                return SanityOutcome {
                    response,
                    transfer_mastership: false,
                };
            }

            let nr_known = known.len() as u32;
            let nr_present = membership.storage_len() as u32 + 1;
            let nr_leave = membership.leave_list_len() as u32;

            response.result = ClusterStatusCode::Success;
            response.nodes = membership
                .ordered_storage_nodes()
                .into_iter()
                .map(|n| (n.id, n.entry))
                .chain(std::iter::once((joiner_id, joiner_entry)))
                .collect();

            if nr_known == nr_present {
                response.cluster_status = ClusterStatusCode::Success as u32;
                response.inc_epoch = false;
            } else if nr_known == nr_present + nr_leave {
                response.cluster_status = ClusterStatusCode::Success as u32;
                response.inc_epoch = true;
            } else {
                // Quorum is not yet met: `nr_known` previously-known nodes
                // are not all accounted for by `storage ∪ leave_list` even
                // after admitting this joiner. Stamp `cluster_status` with
                // the still-waiting verdict explicitly -- it must not be
                // left at the joiner's echoed default, which happens to
                // share `Success`'s zero discriminant.
                response.cluster_status = ClusterStatusCode::WaitForJoin as u32;
                response.leave_nodes = membership
                    .leave_list()
                    .into_iter()
                    .map(|n| (n.id, n.entry))
                    .collect();
            }
            SanityOutcome {
                response,
                transfer_mastership: false,
            }
        }
        ClusterStatus::Ok | ClusterStatus::Halt => {
            if joiner.ctime != local_ctime || joiner.epoch != epoch {
                let transfer = joiner.epoch > epoch;
                response.result = if transfer {
                    ClusterStatusCode::NewNodeVer
                } else {
                    ClusterStatusCode::OldNodeVer
                };
                return SanityOutcome {
                    response,
                    transfer_mastership: transfer,
                };
            }
            response.result = ClusterStatusCode::Success;
            response.cluster_status = ClusterStatusCode::Success as u32;
            response.inc_epoch = true;
            response.nodes = membership
                .ordered_storage_nodes()
                .into_iter()
                .map(|n| (n.id, n.entry))
                .chain(std::iter::once((joiner_id, joiner_entry)))
                .collect();
            SanityOutcome {
                response,
                transfer_mastership: false,
            }
        }
        ClusterStatus::JoinFailed => SanityOutcome {
            response: {
                response.result = ClusterStatusCode::JoinFailed;
                response
            },
            transfer_mastership: false,
        },
    }
}

/// Applies a `Join/Fin` on every node, including the joiner: migrates the
/// joiner into the storage roster, folds in any leave-list entries the
/// response carried, and bumps/persists the epoch if `inc_epoch` was set.
/// Returns the new `ClusterStatus` for the caller to apply.
pub fn apply_fin(
    membership: &mut MembershipState,
    epoch_log: &EpochLog,
    response: &JoinPayload,
) -> ClusterStatus {
    if response.result != ClusterStatusCode::Success {
        return membership.status();
    }

    membership.ratify(response.joiner_id, response.joiner_entry.clone());
    for (id, entry) in &response.leave_nodes {
        membership.leave_list_insert(crate::core::node::StorageNode {
            id: *id,
            entry: entry.clone(),
        });
    }

    // `response.nodes` is always overwritten by the master to
    // `storage_roster + joiner`, never the true `epoch_log[epoch]` count
    // (see `handle_init`), so quorum cannot be re-derived from the
    // post-ratify roster size here -- that reduces to a tautology that
    // closes `WaitForJoin` after any single admission. The master already
    // computed the real verdict against `epoch_log[epoch]`'s count in
    // `handle_init`; it is carried through in `cluster_status` and must be
    // read back here instead of recomputed.
    let quorum_reached = response.cluster_status == ClusterStatusCode::Success as u32;

    if response.inc_epoch {
        if let Some(new_epoch) = membership.bump_epoch_if_serving() {
            epoch_log.write(new_epoch, &membership.ordered_node_list());
        } else {
            let new_epoch = membership.epoch() + 1;
            membership.set_epoch(new_epoch);
            epoch_log.write(new_epoch, &membership.ordered_node_list());
        }
    }

    let next_status = match membership.status() {
        ClusterStatus::WaitForJoin if quorum_reached => ClusterStatus::Ok,
        other => other,
    };
    membership.set_status(next_status);
    membership.set_join_finished(true);

    // A freshly admitted node has no local epoch log of its own to learn
    // ctime/replication-factor from; it must learn both here, from the
    // response the master already validated against its own copy.
    if matches!(next_status, ClusterStatus::Ok | ClusterStatus::Halt) {
        membership.set_ctime(response.ctime);
        membership.set_replication_factor(response.nr_sobjs);
        epoch_log.write_format_info(response.ctime, response.nr_sobjs);
    }

    next_status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::StorageNode;

    fn entry(host: &str) -> NodeEntry {
        NodeEntry::new(host, 7000, 0, 128)
    }

    #[test]
    fn bootstrap_with_empty_log_waits_for_format() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        let b = bootstrap(&log);
        assert_eq!(b.status, ClusterStatus::WaitForFormat);
        assert_eq!(b.epoch, 0);
    }

    #[test]
    fn bootstrap_with_prior_epoch_waits_for_join() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        log.write(5, &[entry("10.0.0.1")]);
        let b = bootstrap(&log);
        assert_eq!(b.status, ClusterStatus::WaitForJoin);
        assert_eq!(b.epoch, 5);
    }

    #[test]
    fn wait_for_format_rejects_nonempty_joiner() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        let my_id = NodeId::new(1, 0);
        let membership = MembershipState::new(my_id, entry("10.0.0.1"));

        let joiner = JoinPayload {
            joiner_id: NodeId::new(2, 0),
            joiner_entry: entry("10.0.0.2"),
            nr_sobjs: 3,
            cluster_status: 0,
            epoch: 0,
            ctime: 100,
            result: ClusterStatusCode::Success,
            inc_epoch: false,
            nodes: vec![(NodeId::new(2, 0), entry("10.0.0.2"))],
            leave_nodes: vec![],
        };
        let outcome = handle_init(
            &membership,
            &log,
            100,
            NodeId::new(2, 0),
            entry("10.0.0.2"),
            &joiner,
        );
        assert_eq!(outcome.response.result, ClusterStatusCode::NotFormatted);
    }

    #[test]
    fn fin_migrates_joiner_and_bumps_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        let my_id = NodeId::new(1, 0);
        let mut membership = MembershipState::new(my_id, entry("10.0.0.1"));
        membership.ratify(my_id, entry("10.0.0.1"));
        membership.set_status(ClusterStatus::Ok);

        let joiner_id = NodeId::new(2, 0);
        let response = JoinPayload {
            joiner_id,
            joiner_entry: entry("10.0.0.2"),
            nr_sobjs: 3,
            cluster_status: 0,
            epoch: 1,
            ctime: 100,
            result: ClusterStatusCode::Success,
            inc_epoch: true,
            nodes: vec![
                (my_id, entry("10.0.0.1")),
                (joiner_id, entry("10.0.0.2")),
            ],
            leave_nodes: vec![],
        };
        apply_fin(&mut membership, &log, &response);
        assert!(membership.storage_contains(&joiner_id));
        assert_eq!(membership.epoch(), 1);
        assert_eq!(log.latest(), 1);
    }

    #[test]
    fn fin_learns_ctime_and_replication_factor_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        let my_id = NodeId::new(1, 0);
        let mut membership = MembershipState::new(my_id, entry("10.0.0.1"));
        membership.set_status(ClusterStatus::Ok);
        assert_eq!(membership.ctime(), 0);
        assert_eq!(membership.replication_factor(), 0);

        let joiner_id = NodeId::new(2, 0);
        let response = JoinPayload {
            joiner_id,
            joiner_entry: entry("10.0.0.2"),
            nr_sobjs: 3,
            cluster_status: 0,
            epoch: 0,
            ctime: 555,
            result: ClusterStatusCode::Success,
            inc_epoch: false,
            nodes: vec![(joiner_id, entry("10.0.0.2"))],
            leave_nodes: vec![],
        };
        let status = apply_fin(&mut membership, &log, &response);
        assert_eq!(status, ClusterStatus::Ok);
        assert_eq!(membership.ctime(), 555);
        assert_eq!(membership.replication_factor(), 3);

        // A restart must see the same values, read back from the epoch
        // log's persisted format info rather than relearned from a peer.
        let reopened = EpochLog::open(dir.path()).unwrap();
        assert_eq!(reopened.read_format_info(), Some((555, 3)));
    }

    #[test]
    fn fin_with_failure_result_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        let my_id = NodeId::new(1, 0);
        let mut membership = MembershipState::new(my_id, entry("10.0.0.1"));
        let joiner_id = NodeId::new(2, 0);

        let response = JoinPayload {
            joiner_id,
            joiner_entry: entry("10.0.0.2"),
            nr_sobjs: 0,
            cluster_status: 0,
            epoch: 0,
            ctime: 0,
            result: ClusterStatusCode::NotFormatted,
            inc_epoch: false,
            nodes: vec![],
            leave_nodes: vec![],
        };
        apply_fin(&mut membership, &log, &response);
        assert!(!membership.storage_contains(&joiner_id));
    }

    #[test]
    fn ok_status_rejects_higher_epoch_joiner_and_transfers_mastership() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        let my_id = NodeId::new(1, 0);
        let mut membership = MembershipState::new(my_id, entry("10.0.0.1"));
        membership.ratify(my_id, entry("10.0.0.1"));
        membership.set_status(ClusterStatus::Ok);
        membership.set_epoch(5);

        let joiner = JoinPayload {
            joiner_id: NodeId::new(2, 0),
            joiner_entry: entry("10.0.0.2"),
            nr_sobjs: 3,
            cluster_status: 0,
            epoch: 7,
            ctime: 0,
            result: ClusterStatusCode::Success,
            inc_epoch: false,
            nodes: vec![],
            leave_nodes: vec![],
        };
        let outcome = handle_init(
            &membership,
            &log,
            membership.ctime(),
            NodeId::new(2, 0),
            entry("10.0.0.2"),
            &joiner,
        );
        assert_eq!(outcome.response.result, ClusterStatusCode::NewNodeVer);
        assert!(outcome.transfer_mastership);
    }

    #[test]
    fn ok_status_rejects_lower_epoch_joiner_without_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        let my_id = NodeId::new(1, 0);
        let mut membership = MembershipState::new(my_id, entry("10.0.0.1"));
        membership.ratify(my_id, entry("10.0.0.1"));
        membership.set_status(ClusterStatus::Ok);
        membership.set_epoch(5);

        let joiner = JoinPayload {
            joiner_id: NodeId::new(2, 0),
            joiner_entry: entry("10.0.0.2"),
            nr_sobjs: 3,
            cluster_status: 0,
            epoch: 2,
            ctime: 0,
            result: ClusterStatusCode::Success,
            inc_epoch: false,
            nodes: vec![],
            leave_nodes: vec![],
        };
        let outcome = handle_init(
            &membership,
            &log,
            membership.ctime(),
            NodeId::new(2, 0),
            entry("10.0.0.2"),
            &joiner,
        );
        assert_eq!(outcome.response.result, ClusterStatusCode::OldNodeVer);
        assert!(!outcome.transfer_mastership);
    }

    #[test]
    fn wait_for_join_rejects_ctime_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        let my_id = NodeId::new(1, 0);
        let mut membership = MembershipState::new(my_id, entry("10.0.0.1"));
        membership.set_status(ClusterStatus::WaitForJoin);
        membership.set_epoch(5);

        let joiner = JoinPayload {
            joiner_id: NodeId::new(2, 0),
            joiner_entry: entry("10.0.0.2"),
            nr_sobjs: 3,
            cluster_status: 0,
            epoch: 5,
            ctime: 999,
            result: ClusterStatusCode::Success,
            inc_epoch: false,
            nodes: vec![],
            leave_nodes: vec![],
        };
        let outcome = handle_init(&membership, &log, 100, NodeId::new(2, 0), entry("10.0.0.2"), &joiner);
        assert_eq!(outcome.response.result, ClusterStatusCode::InvalidCtime);
    }

    #[test]
    fn wait_for_join_quorum_closes_exactly_when_all_known_nodes_are_present() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        let my_id = NodeId::new(1, 0);
        let mut membership = MembershipState::new(my_id, entry("10.0.0.1"));
        membership.ratify(my_id, entry("10.0.0.1"));
        membership.set_status(ClusterStatus::WaitForJoin);
        membership.set_epoch(5);
        log.write(5, &[entry("10.0.0.1"), entry("10.0.0.2")]);

        let joiner_id = NodeId::new(2, 0);
        let joiner = JoinPayload {
            joiner_id,
            joiner_entry: entry("10.0.0.2"),
            nr_sobjs: 3,
            cluster_status: 0,
            epoch: 5,
            ctime: 0,
            result: ClusterStatusCode::Success,
            inc_epoch: false,
            nodes: vec![(my_id, entry("10.0.0.1")), (joiner_id, entry("10.0.0.2"))],
            leave_nodes: vec![],
        };
        let outcome = handle_init(&membership, &log, 0, joiner_id, entry("10.0.0.2"), &joiner);
        assert_eq!(outcome.response.result, ClusterStatusCode::Success);
        assert!(!outcome.response.inc_epoch);
    }

    #[test]
    fn wait_for_join_quorum_closes_with_known_dead_peer_and_bumps_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        let my_id = NodeId::new(1, 0);
        let mut membership = MembershipState::new(my_id, entry("10.0.0.1"));
        membership.ratify(my_id, entry("10.0.0.1"));
        membership.set_status(ClusterStatus::WaitForJoin);
        membership.set_epoch(5);
        membership.leave_list_insert(StorageNode {
            id: NodeId::new(3, 0),
            entry: entry("10.0.0.3"),
        });
        log.write(5, &[entry("10.0.0.1"), entry("10.0.0.2"), entry("10.0.0.3")]);

        let joiner_id = NodeId::new(2, 0);
        let joiner = JoinPayload {
            joiner_id,
            joiner_entry: entry("10.0.0.2"),
            nr_sobjs: 3,
            cluster_status: 0,
            epoch: 5,
            ctime: 0,
            result: ClusterStatusCode::Success,
            inc_epoch: false,
            nodes: vec![
                (my_id, entry("10.0.0.1")),
                (entry_id(), entry("10.0.0.3")),
                (joiner_id, entry("10.0.0.2")),
            ],
            leave_nodes: vec![],
        };
        let outcome = handle_init(&membership, &log, 0, joiner_id, entry("10.0.0.2"), &joiner);
        assert_eq!(outcome.response.result, ClusterStatusCode::Success);
        assert!(outcome.response.inc_epoch);
    }

    fn entry_id() -> NodeId {
        NodeId::new(3, 0)
    }

    #[test]
    fn storage_node_helper_orders_as_expected() {
        let a = StorageNode {
            id: NodeId::new(1, 0),
            entry: entry("10.0.0.1"),
        };
        let b = StorageNode {
            id: NodeId::new(2, 0),
            entry: entry("10.0.0.2"),
        };
        assert!(a < b);
    }
}
