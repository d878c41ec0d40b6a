// src/core/driver/mod.rs

//! Abstracts the underlying group-communication driver: totally-ordered
//! broadcast plus view-change callbacks (`spec.md` SS4.A).
//!
//! The source spec describes a pollable file descriptor plus a `dispatch()`
//! call that invokes `on_view_join`/`on_view_leave`/`on_notify` callbacks.
//! This is rendered here as an async `recv()` that yields the next
//! [`DriverEvent`] -- the idiomatic-async equivalent of polling a readable
//! fd and draining it, without a callback-registration step.

pub mod simulated;
pub mod tcp;

use crate::core::errors::ClusterError;
use crate::core::node::{NodeEntry, NodeId};
use crate::core::protocol::{MessageBody, MsgState, WireMessage};
use async_trait::async_trait;

/// One event delivered by the driver, in global delivery order.
///
/// Contract (spec.md SS4.A): total order across all `Notify` deliveries;
/// view-changes and notifies interleave in one global order, identical on
/// every node that stays connected; self-broadcasts are redelivered to the
/// sender through `Notify`.
#[derive(Debug)]
pub enum DriverEvent {
    /// `members` is the full current transport view after the join.
    ViewJoin { members: Vec<NodeId> },
    /// `members` is the full current transport view after the departure.
    ViewLeave { left: NodeId, members: Vec<NodeId> },
    Notify(WireMessage),
}

/// All methods take `&self`: the engine calls `broadcast` from its cluster
/// worker and `recv` from a separate pump task concurrently, so
/// implementations hold any mutable channel state behind interior
/// mutability (a `tokio::sync::Mutex` around a receiver, an atomic-backed
/// write half) rather than requiring exclusive ownership.
#[async_trait]
pub trait ClusterDriver: Send + Sync {
    /// Opens the group and returns this node's driver-assigned identity.
    async fn init(&self) -> Result<NodeId, ClusterError>;

    /// Requests admission to the transport group.
    async fn join(&self) -> Result<(), ClusterError>;

    /// Totally-ordered broadcast to all current members, including self.
    async fn broadcast(
        &self,
        op: crate::core::protocol::Opcode,
        state: MsgState,
        body: MessageBody,
        from_entry: NodeEntry,
    ) -> Result<(), ClusterError>;

    /// Awaits the next driver event. Returns `Err(ClusterError::DriverDisconnected)`
    /// on a fatal driver disconnect (the EPOLLHUP-equivalent condition);
    /// the core exits with a nonzero status on that error (spec.md SS4.A).
    async fn recv(&self) -> Result<DriverEvent, ClusterError>;

    /// Fetches a peer's epoch log entry for a recovery query. The real RPC
    /// transport is a collaborator outside this core's scope; drivers that
    /// cannot answer this return `None`.
    async fn read_remote_epoch(&self, _epoch: u32, _peer: NodeId) -> Option<Vec<NodeEntry>> {
        None
    }
}
