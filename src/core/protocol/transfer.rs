// src/core/protocol/transfer.rs

//! Mastership transfer (`spec.md` SS4.E.2, final paragraph): triggered when
//! a master's join-sanity check rejects a joiner reporting a higher epoch
//! than its own. The master broadcasts `MasterTransfer/Fin` and exits;
//! mastership itself needs no negotiation because it is a pure function of
//! the storage roster's deterministic order (invariant 2) -- the next node
//! in that order simply observes itself as master on its next event.

use crate::core::membership::MembershipState;
use crate::core::protocol::message::MasterTransferPayload;

/// Builds the `MasterTransfer/Fin` payload, carrying the epoch the
/// rejected joiner reported so peers can log why the transfer happened.
pub fn build_transfer(joiner_epoch: u32) -> MasterTransferPayload {
    MasterTransferPayload { joiner_epoch }
}

/// Applies an observed `MasterTransfer/Fin`. There is no roster mutation:
/// mastership is re-derived from the storage roster on every read. Returns
/// whether the local node *was* master before this transfer was triggered
/// -- the caller uses that to decide whether to exit.
pub fn was_master_before_transfer(membership: &MembershipState) -> bool {
    membership.is_master()
}
