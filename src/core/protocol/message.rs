// src/core/protocol/message.rs

//! The wire envelope every broadcast carries, and the payloads of the four
//! control-plane message kinds (`spec.md` SS6). Every node decodes the
//! header first to dispatch on `op`/`state` before decoding the payload.

use crate::core::node::{NodeEntry, NodeId};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u8 = 1;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum Opcode {
    Join = 1,
    VdiOp = 2,
    MasterChanged = 3,
    Leave = 4,
    MasterTransfer = 5,
}

/// Drives the two-phase request/response pattern over the totally-ordered
/// bus: the originator sends `Init`, the current master fills in a response
/// and rebroadcasts `Fin`, and every node -- including the originator --
/// applies the `Fin` deterministically.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum MsgState {
    Init = 1,
    Cont = 2,
    Fin = 3,
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct MessageHeader {
    pub proto_ver: u8,
    pub op: Opcode,
    pub state: MsgState,
    pub from_id: NodeId,
    pub from_entry: NodeEntry,
}

/// A fully decoded broadcast: header plus typed payload. The serializer
/// tags inbound driver notifications with this before pushing them onto
/// the FIFO as `Event::Notify`.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct WireMessage {
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl WireMessage {
    pub fn encode(&self) -> Result<Vec<u8>, crate::core::errors::ClusterError> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, crate::core::errors::ClusterError> {
        let (msg, _) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(msg)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum MessageBody {
    Join(JoinPayload),
    VdiOp(VdiOpPayload),
    Leave(LeavePayload),
    MasterTransfer(MasterTransferPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct JoinPayload {
    /// The node this Init/Fin round is about. Carried explicitly rather
    /// than inferred from the wire header's `from_id`/`from_entry`, since
    /// the master's `Fin` rebroadcast is sent under the master's own
    /// driver identity, not the joiner's.
    pub joiner_id: NodeId,
    pub joiner_entry: NodeEntry,
    pub nr_sobjs: u32,
    pub cluster_status: u32,
    pub epoch: u32,
    pub ctime: u64,
    pub result: crate::core::status::ClusterStatusCode,
    pub inc_epoch: bool,
    /// The joiner's known node list (echoing its local epoch log); the
    /// master's `Fin` response overwrites this with the ratified roster.
    pub nodes: Vec<(NodeId, NodeEntry)>,
    /// Present only on `Fin` responses while the cluster stays
    /// `WaitForJoin`: the current leave list, so every node can append any
    /// entries it is still missing.
    pub leave_nodes: Vec<(NodeId, NodeEntry)>,
}

impl JoinPayload {
    pub fn nr_nodes(&self) -> u32 {
        self.nodes.len() as u32
    }

    pub fn nr_leave_nodes(&self) -> u32 {
        self.leave_nodes.len() as u32
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct LeavePayload {
    pub epoch: u32,
}

/// The control operations the VDI semantic layer (out of scope here)
/// exposes through the broadcast bus. The request/response bodies
/// themselves are opaque bytes owned by that collaborator.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
    strum_macros::Display,
)]
pub enum VdiOpKind {
    CreateVdi,
    DeleteVdi,
    LockVdi,
    GetVdiInfo,
    GetVdiAttr,
    ReleaseVdi,
    MakeFs,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct VdiOpPayload {
    pub kind: VdiOpKind,
    pub request_id: u64,
    pub request_body: Vec<u8>,
    pub result: crate::core::status::ClusterStatusCode,
    pub response_body: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct MasterTransferPayload {
    /// The epoch the rejected joiner reported, which triggered the
    /// transfer.
    pub joiner_epoch: u32,
}
