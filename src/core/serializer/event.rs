// src/core/serializer/event.rs

//! The event FIFO's tagged union. The four event kinds share a scheduling
//! discipline but carry disjoint payloads -- a sum type in place of the
//! source's `container_of` pattern (spec.md SS9).

use crate::core::node::NodeId;
use crate::core::protocol::WireMessage;
use crate::core::status::ClusterStatusCode;
use tokio::sync::oneshot;

/// A client I/O request entering the same FIFO as a fourth event kind so it
/// is serialized against membership transitions.
#[derive(Debug)]
pub struct RequestEvent {
    pub request_id: u64,
    pub oid: u64,
    pub epoch: u32,
    /// `true` if flagged to execute locally without gateway forwarding --
    /// subject to the epoch-gate fast-fail during joins.
    pub direct: bool,
    pub reply: oneshot::Sender<ClusterStatusCode>,
}

impl RequestEvent {
    pub fn fail(self, status: ClusterStatusCode) {
        let _ = self.reply.send(status);
    }
}

#[derive(Debug)]
pub struct ViewJoinEvent {
    /// The full current transport view, per the driver's view-change
    /// delivery. `members == [self]` marks this node as the first in the
    /// group.
    pub members: Vec<NodeId>,
}

#[derive(Debug)]
pub struct ViewLeaveEvent {
    pub left: NodeId,
    pub members: Vec<NodeId>,
}

#[derive(Debug)]
pub struct NotifyEvent {
    pub message: WireMessage,
}

#[derive(Debug)]
pub enum Event {
    ViewJoin(ViewJoinEvent),
    ViewLeave(ViewLeaveEvent),
    Notify(NotifyEvent),
    Request(RequestEvent),
}

impl Event {
    /// Whether this event participates in the membership-vs-I/O ordering
    /// rules (everything except `Request`).
    pub fn is_membership_change(&self) -> bool {
        !matches!(self, Event::Request(_))
    }
}
