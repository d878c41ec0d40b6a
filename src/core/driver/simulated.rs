// src/core/driver/simulated.rs

//! An in-process driver used by tests to deliver identical ordered event
//! sequences to multiple simulated node cores in one process, without real
//! sockets. A [`SimulatedCluster`] is the shared bus; each attached node
//! gets its own [`SimulatedDriver`] handle, analogous to how production
//! nodes each hold their own connection to the real group-communication
//! service.

use crate::core::driver::{ClusterDriver, DriverEvent};
use crate::core::errors::ClusterError;
use crate::core::node::{NodeEntry, NodeId};
use crate::core::protocol::{MessageBody, MessageHeader, MsgState, Opcode, WireMessage};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

#[derive(Clone, Debug)]
enum BusEvent {
    ViewJoin { members: Vec<NodeId> },
    ViewLeave { left: NodeId, members: Vec<NodeId> },
    Notify(WireMessage),
}

struct Inner {
    members: Mutex<Vec<NodeId>>,
    bus: broadcast::Sender<BusEvent>,
    next_addr: AtomicU64,
}

/// Shared bus for a simulated cluster. Create one per test scenario and
/// call [`SimulatedCluster::attach`] once per simulated node.
#[derive(Clone)]
pub struct SimulatedCluster {
    inner: Arc<Inner>,
}

impl SimulatedCluster {
    pub fn new() -> Self {
        let (bus, _rx) = broadcast::channel(4096);
        Self {
            inner: Arc::new(Inner {
                members: Mutex::new(Vec::new()),
                bus,
                next_addr: AtomicU64::new(1),
            }),
        }
    }

    /// Attaches a new simulated node to the bus and delivers the
    /// corresponding view-join to every existing member plus this one,
    /// mirroring a real driver admitting a new transport member.
    pub async fn attach(&self, entry: NodeEntry) -> SimulatedDriver {
        let addr = self.inner.next_addr.fetch_add(1, Ordering::SeqCst);
        let id = NodeId::new(addr, 0);
        let rx = self.inner.bus.subscribe();

        let members = {
            let mut members = self.inner.members.lock().await;
            members.push(id);
            members.clone()
        };
        // Ignore send errors: a fresh bus with zero other subscribers at
        // test setup time is expected and harmless.
        let _ = self.inner.bus.send(BusEvent::ViewJoin { members });

        SimulatedDriver {
            id,
            entry,
            cluster: self.inner.clone(),
            rx: Mutex::new(rx),
        }
    }
}

impl Default for SimulatedCluster {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SimulatedDriver {
    id: NodeId,
    entry: NodeEntry,
    cluster: Arc<Inner>,
    rx: Mutex<broadcast::Receiver<BusEvent>>,
}

impl SimulatedDriver {
    /// Simulates this node leaving the group (a clean departure, as
    /// opposed to the silent disappearance a real crash would produce).
    pub async fn leave(&self) {
        let members = {
            let mut members = self.cluster.members.lock().await;
            members.retain(|m| *m != self.id);
            members.clone()
        };
        let _ = self.cluster.bus.send(BusEvent::ViewLeave {
            left: self.id,
            members,
        });
    }

    /// Simulates a hard partition: `left` vanishes without a clean
    /// `Leave/Fin`, exactly like a crash.
    pub async fn simulate_crash_of(&self, left: NodeId) {
        let members = {
            let mut members = self.cluster.members.lock().await;
            members.retain(|m| *m != left);
            members.clone()
        };
        let _ = self.cluster.bus.send(BusEvent::ViewLeave { left, members });
    }

    /// Test-only: injects a `Notify` carrying an arbitrary `from_id`/
    /// `from_entry`, bypassing the stamping `broadcast` always does with
    /// this handle's own identity. Exists so a test can play the role of
    /// a third party relaying a peer's last-known `Leave/Fin` on its behalf
    /// (`spec.md` SS8 scenario 4's "N2 first sends Leave/Fin for N3
    /// (simulated)") without needing a second live connection for N3.
    pub fn inject(&self, header: MessageHeader, body: MessageBody) {
        let _ = self
            .cluster
            .bus
            .send(BusEvent::Notify(WireMessage { header, body }));
    }
}

#[async_trait]
impl ClusterDriver for SimulatedDriver {
    async fn init(&self) -> Result<NodeId, ClusterError> {
        Ok(self.id)
    }

    async fn join(&self) -> Result<(), ClusterError> {
        // Admission happened at `attach` time in the simulated bus.
        Ok(())
    }

    async fn broadcast(
        &self,
        op: Opcode,
        state: MsgState,
        body: MessageBody,
        from_entry: NodeEntry,
    ) -> Result<(), ClusterError> {
        let header = MessageHeader {
            proto_ver: crate::core::protocol::message::PROTOCOL_VERSION,
            op,
            state,
            from_id: self.id,
            from_entry,
        };
        let message = WireMessage { header, body };
        self.cluster
            .bus
            .send(BusEvent::Notify(message))
            .map_err(|_| ClusterError::DriverDisconnected)?;
        Ok(())
    }

    async fn recv(&self) -> Result<DriverEvent, ClusterError> {
        loop {
            let received = self.rx.lock().await.recv().await;
            match received {
                Ok(BusEvent::ViewJoin { members }) => {
                    return Ok(DriverEvent::ViewJoin { members })
                }
                Ok(BusEvent::ViewLeave { left, members }) => {
                    return Ok(DriverEvent::ViewLeave { left, members })
                }
                Ok(BusEvent::Notify(message)) => return Ok(DriverEvent::Notify(message)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ClusterError::DriverDisconnected)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn attach_delivers_a_view_join_to_self() {
        let cluster = SimulatedCluster::new();
        let mut driver = cluster.attach(NodeEntry::new("10.0.0.1", 7000, 0, 128)).await;
        let event = driver.recv().await.unwrap();
        match event {
            DriverEvent::ViewJoin { members } => assert_eq!(members.len(), 1),
            other => panic!("expected ViewJoin, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_attach_is_observed_by_the_first() {
        let cluster = SimulatedCluster::new();
        let mut a = cluster.attach(NodeEntry::new("10.0.0.1", 7000, 0, 128)).await;
        let _first_view = a.recv().await.unwrap();

        let _b = cluster.attach(NodeEntry::new("10.0.0.2", 7000, 0, 128)).await;
        let event = a.recv().await.unwrap();
        match event {
            DriverEvent::ViewJoin { members } => assert_eq!(members.len(), 2),
            other => panic!("expected ViewJoin, got {other:?}"),
        }
    }
}
