// src/core/collaborators.rs

//! Trait boundaries for the external collaborators this core drives but
//! does not implement (`spec.md` SS1, SS6): the object-store backend, the
//! VDI semantic layer, and the gateway/I/O worker pools. Only their
//! interfaces live here; a real deployment wires in its own
//! implementations. The in-memory stand-ins below exist so the core is
//! independently testable and runnable without those subsystems.

use crate::core::protocol::message::VdiOpPayload;
use crate::core::status::ClusterStatusCode;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use tokio::sync::oneshot;
use tracing::debug;

/// The object-store backend that reads/writes replicated objects.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Kicks off recovery for the membership set committed at `epoch`.
    /// Invoked whenever a `Join/Fin` or `Leave/Fin` has been applied and
    /// status is `Ok`/`Halt` (spec.md SS4.E.5).
    async fn start_recovery(&self, epoch: u32);

    /// Whether object `oid` is currently being recovered -- consulted by
    /// the serializer's request-gating rule (SS4.D).
    fn is_recovering(&self, oid: u64) -> bool;
}

/// The VDI semantic layer (snapshot/backup/restore logic), called by the
/// master while handling `VdiOp/Init`.
#[async_trait]
pub trait VdiLayer: Send + Sync {
    async fn apply(&self, op: &VdiOpPayload) -> VdiOpPayload;
}

/// Executes a forwarded (gateway) or local (direct) VDI-op / I/O request
/// once the serializer has cleared it through the epoch gate. The
/// implementation owns `reply` until the underlying I/O actually finishes
/// and must eventually send on it; the stand-in below answers immediately,
/// a real worker pool holds it until disk/replica I/O completes.
pub trait RequestExecutor: Send + Sync {
    fn forward(&self, request_id: u64, reply: oneshot::Sender<ClusterStatusCode>);
    fn execute(&self, request_id: u64, reply: oneshot::Sender<ClusterStatusCode>);
}

/// An `ObjectStore` stand-in with no real recovery machinery: recovery
/// "completes" instantly and nothing is ever reported as mid-recovery.
/// Suitable for tests and for running this core ahead of a wired-in
/// storage backend.
#[derive(Debug, Default)]
pub struct NullObjectStore {
    recovering: Mutex<HashSet<u64>>,
}

#[async_trait]
impl ObjectStore for NullObjectStore {
    async fn start_recovery(&self, epoch: u32) {
        debug!("null object store: recovery requested for epoch {}", epoch);
        self.recovering.lock().clear();
    }

    fn is_recovering(&self, oid: u64) -> bool {
        self.recovering.lock().contains(&oid)
    }
}

/// A `VdiLayer` stand-in that always succeeds with an empty response body.
#[derive(Debug, Default)]
pub struct NullVdiLayer;

#[async_trait]
impl VdiLayer for NullVdiLayer {
    async fn apply(&self, op: &VdiOpPayload) -> VdiOpPayload {
        let mut response = op.clone();
        response.result = crate::core::status::ClusterStatusCode::Success;
        response
    }
}

/// A `RequestExecutor` stand-in that logs and drops; a real deployment
/// wires this to the gateway forwarder and the object I/O worker pool.
#[derive(Debug, Default)]
pub struct NullRequestExecutor;

impl RequestExecutor for NullRequestExecutor {
    fn forward(&self, request_id: u64, reply: oneshot::Sender<ClusterStatusCode>) {
        debug!("null executor: would forward request {}", request_id);
        let _ = reply.send(ClusterStatusCode::Success);
    }

    fn execute(&self, request_id: u64, reply: oneshot::Sender<ClusterStatusCode>) {
        debug!("null executor: would execute request {}", request_id);
        let _ = reply.send(ClusterStatusCode::Success);
    }
}
