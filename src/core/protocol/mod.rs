// src/core/protocol/mod.rs

//! The control-plane protocols: join, leave/partition, VDI-op broadcast,
//! and mastership transfer (`spec.md` SS4.E). Each protocol exposes an
//! `on_init`/`on_fin`-shaped pair consumed by the event serializer's phase
//! functions (see [`crate::core::serializer`]).

pub mod join;
pub mod leave;
pub mod message;
pub mod transfer;
pub mod vdi_op;

pub use message::{MessageBody, MessageHeader, MsgState, Opcode, WireMessage};
