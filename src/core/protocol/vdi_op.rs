// src/core/protocol/vdi_op.rs

//! The VDI-op broadcast protocol (`spec.md` SS4.E.3): control operations
//! the gateway never executes locally, only ever broadcasts as
//! `VdiOp/Init`; the master runs them against the VDI semantic layer and
//! rebroadcasts `VdiOp/Fin`, which every node applies for its local
//! side-effects.

use crate::core::collaborators::VdiLayer;
use crate::core::epoch_log::EpochLog;
use crate::core::membership::{ClusterStatus, MembershipState};
use crate::core::protocol::message::{VdiOpKind, VdiOpPayload};
use dashmap::DashMap;
use tokio::sync::oneshot;

/// A `make-fs` request body: the only VDI op this core's membership layer
/// reads rather than treating as wholly opaque, since formatting is what
/// seeds `ctime` and the replication-factor hint (`spec.md` SS4.E.3).
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, bincode::Encode, bincode::Decode)]
pub struct MakeFsRequest {
    pub ctime: u64,
    pub copies: u32,
}

/// A create/delete/lock/release request body: carries the target VDI id.
/// Other op kinds (`GetVdiInfo`, `GetVdiAttr`) have no roster-visible
/// side effect and are passed through to the VDI layer untouched.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, bincode::Encode, bincode::Decode)]
pub struct VdiIdRequest {
    pub vdi_id: u32,
}

fn decode<T: bincode::Decode<()>>(body: &[u8]) -> Option<T> {
    bincode::decode_from_slice(body, bincode::config::standard())
        .ok()
        .map(|(v, _)| v)
}

/// Tracks pending originator requests by request id rather than assuming
/// the head of a per-node list is always the match -- the double-response
/// hazard noted as an open question in `spec.md` SS9 only matters if two
/// ops from the same originator can overlap; keying by id is correct either
/// way and costs nothing extra. A `DashMap` lets the request-issuing side
/// register a waiter concurrently with the single cluster worker completing
/// others, without a dedicated mutex around the table.
#[derive(Debug, Default)]
pub struct PendingVdiOps {
    waiters: DashMap<u64, oneshot::Sender<VdiOpPayload>>,
}

impl PendingVdiOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: u64, reply: oneshot::Sender<VdiOpPayload>) {
        self.waiters.insert(request_id, reply);
    }

    /// Completes the matching pending request, if this node originated it.
    /// Returns `true` if a waiter was found and notified.
    pub fn complete(&self, response: &VdiOpPayload) -> bool {
        if let Some((_, reply)) = self.waiters.remove(&response.request_id) {
            let _ = reply.send(response.clone());
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// Runs a `VdiOp/Init` against the VDI semantic layer. Only the current
/// master does this; every other node only applies the resulting `Fin`.
pub async fn handle_init(vdi_layer: &dyn VdiLayer, op: &VdiOpPayload) -> VdiOpPayload {
    vdi_layer.apply(op).await
}

/// Applies a `VdiOp/Fin` on every node: mirrors the VDI-in-use bit, records
/// formatting state on `make-fs`, and transitions to `Shutdown` on a
/// shutdown op. Returns the epoch this call wrote, if any (`make-fs` always
/// commits epoch 1). The `make-fs` stamp is also persisted to `epoch_log`
/// so a restarted process can rebuild its own `Join/Init` without having
/// observed this `Fin` in the current run.
pub fn apply_fin(
    membership: &mut MembershipState,
    epoch_log: &EpochLog,
    op: &VdiOpPayload,
) -> Option<u32> {
    if op.result != crate::core::status::ClusterStatusCode::Success {
        return None;
    }

    match op.kind {
        VdiOpKind::CreateVdi | VdiOpKind::LockVdi => {
            if let Some(req) = decode::<VdiIdRequest>(&op.request_body) {
                membership.set_vdi_in_use(req.vdi_id, true);
            }
            None
        }
        VdiOpKind::DeleteVdi | VdiOpKind::ReleaseVdi => {
            if let Some(req) = decode::<VdiIdRequest>(&op.request_body) {
                membership.set_vdi_in_use(req.vdi_id, false);
            }
            None
        }
        VdiOpKind::MakeFs => {
            if let Some(req) = decode::<MakeFsRequest>(&op.request_body) {
                membership.set_ctime(req.ctime);
                membership.set_replication_factor(req.copies);
                epoch_log.write_format_info(req.ctime, req.copies);
            }
            membership.set_epoch(1);
            membership.set_status(ClusterStatus::Ok);
            Some(1)
        }
        VdiOpKind::Shutdown => {
            membership.set_status(ClusterStatus::Shutdown);
            None
        }
        VdiOpKind::GetVdiInfo | VdiOpKind::GetVdiAttr => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::{NodeEntry, NodeId};
    use crate::core::status::ClusterStatusCode;

    fn membership() -> MembershipState {
        MembershipState::new(NodeId::new(1, 0), NodeEntry::new("10.0.0.1", 7000, 0, 128))
    }

    fn epoch_log() -> (tempfile::TempDir, EpochLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        (dir, log)
    }

    fn encode<T: bincode::Encode>(v: &T) -> Vec<u8> {
        bincode::encode_to_vec(v, bincode::config::standard()).unwrap()
    }

    #[test]
    fn make_fs_commits_epoch_one_and_records_ctime() {
        let mut state = membership();
        let (_dir, log) = epoch_log();
        let op = VdiOpPayload {
            kind: VdiOpKind::MakeFs,
            request_id: 1,
            request_body: encode(&MakeFsRequest { ctime: 42, copies: 3 }),
            result: ClusterStatusCode::Success,
            response_body: vec![],
        };
        let epoch = apply_fin(&mut state, &log, &op);
        assert_eq!(epoch, Some(1));
        assert_eq!(state.epoch(), 1);
        assert_eq!(state.ctime(), 42);
        assert_eq!(state.replication_factor(), 3);
        assert_eq!(state.status(), ClusterStatus::Ok);
        assert_eq!(log.read_format_info(), Some((42, 3)));
    }

    #[test]
    fn create_then_delete_toggles_in_use_bit() {
        let mut state = membership();
        let (_dir, log) = epoch_log();
        let create = VdiOpPayload {
            kind: VdiOpKind::CreateVdi,
            request_id: 1,
            request_body: encode(&VdiIdRequest { vdi_id: 7 }),
            result: ClusterStatusCode::Success,
            response_body: vec![],
        };
        apply_fin(&mut state, &log, &create);
        assert!(state.vdi_in_use(7));

        let delete = VdiOpPayload {
            kind: VdiOpKind::DeleteVdi,
            request_id: 2,
            request_body: encode(&VdiIdRequest { vdi_id: 7 }),
            result: ClusterStatusCode::Success,
            response_body: vec![],
        };
        apply_fin(&mut state, &log, &delete);
        assert!(!state.vdi_in_use(7));
    }

    #[test]
    fn failed_op_has_no_side_effect() {
        let mut state = membership();
        let (_dir, log) = epoch_log();
        let op = VdiOpPayload {
            kind: VdiOpKind::CreateVdi,
            request_id: 1,
            request_body: encode(&VdiIdRequest { vdi_id: 9 }),
            result: ClusterStatusCode::NoMem,
            response_body: vec![],
        };
        assert_eq!(apply_fin(&mut state, &log, &op), None);
        assert!(!state.vdi_in_use(9));
    }

    #[tokio::test]
    async fn pending_ops_complete_by_request_id_even_out_of_order() {
        let pending = PendingVdiOps::new();
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        pending.register(1, tx_a);
        pending.register(2, tx_b);

        let response_b = VdiOpPayload {
            kind: VdiOpKind::GetVdiInfo,
            request_id: 2,
            request_body: vec![],
            result: ClusterStatusCode::Success,
            response_body: vec![],
        };
        assert!(pending.complete(&response_b));
        assert_eq!(rx_b.await.unwrap().request_id, 2);
        assert_eq!(pending.len(), 1);

        let response_a = VdiOpPayload {
            kind: VdiOpKind::GetVdiInfo,
            request_id: 1,
            request_body: vec![],
            result: ClusterStatusCode::Success,
            response_body: vec![],
        };
        assert!(pending.complete(&response_a));
        assert_eq!(rx_a.await.unwrap().request_id, 1);
        assert!(pending.is_empty());
    }
}
