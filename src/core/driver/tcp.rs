// src/core/driver/tcp.rs

//! A minimal total-order broadcast driver built on a single elected
//! sequencer connection, in the same task-loop shape as the gossip worker
//! this design is descended from: a `tokio::select!` loop over a shutdown
//! signal, an inbound-message task, and an outbound queue.
//!
//! One node in the configured seed list is the sequencer. Every node
//! (including the sequencer, for itself) connects to it; the sequencer
//! relays every frame it receives, in arrival order, to all connections --
//! that single relay point is what gives every node the same total order.
//! Membership view-changes are derived from TCP connects/disconnects at the
//! sequencer.

use crate::core::driver::{ClusterDriver, DriverEvent};
use crate::core::errors::ClusterError;
use crate::core::node::{NodeEntry, NodeId};
use crate::core::protocol::{MessageBody, MessageHeader, MsgState, Opcode, WireMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
enum BusFrame {
    /// Carries the connecting node's own `NodeId` so the sequencer's
    /// view-change membership lists use the same identity space every
    /// other driver event, protocol payload, and the storage roster itself
    /// key on -- the sequencer must never mint its own id for a peer.
    Hello { id: NodeId, entry: NodeEntry },
    Notify(WireMessage),
}

async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(
    stream: &mut W,
    frame: &BusFrame,
) -> std::io::Result<()> {
    let bytes = bincode::encode_to_vec(frame, bincode::config::standard())
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    Ok(())
}

async fn read_frame<R: tokio::io::AsyncRead + Unpin>(stream: &mut R) -> std::io::Result<BusFrame> {
    let len = stream.read_u32().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    bincode::decode_from_slice(&buf, bincode::config::standard())
        .map(|(frame, _)| frame)
        .map_err(|e| std::io::Error::other(e.to_string()))
}

/// Configuration for one node's TCP driver connection.
pub struct TcpDriverConfig {
    /// This node's own cluster-bus listen address.
    pub bus_addr: SocketAddr,
    /// The sequencer's bus address. If it equals `bus_addr`, this node is
    /// the sequencer.
    pub sequencer_addr: SocketAddr,
    pub entry: NodeEntry,
}

pub struct TcpClusterDriver {
    config: TcpDriverConfig,
    id: NodeId,
    to_sequencer: Mutex<Option<tokio::net::tcp::OwnedWriteHalf>>,
    events_rx: Mutex<mpsc::Receiver<DriverEvent>>,
    events_tx: mpsc::Sender<DriverEvent>,
}

impl TcpClusterDriver {
    pub fn new(config: TcpDriverConfig) -> Self {
        let mut hasher_addr = std::collections::hash_map::DefaultHasher::new();
        use std::hash::{Hash, Hasher};
        config.bus_addr.hash(&mut hasher_addr);
        let id = NodeId::new(hasher_addr.finish(), std::process::id());
        let (events_tx, events_rx) = mpsc::channel(1024);
        Self {
            config,
            id,
            to_sequencer: Mutex::new(None),
            events_rx: Mutex::new(events_rx),
            events_tx,
        }
    }

    fn is_sequencer(&self) -> bool {
        self.config.bus_addr == self.config.sequencer_addr
    }
}

#[async_trait]
impl ClusterDriver for TcpClusterDriver {
    async fn init(&self) -> Result<NodeId, ClusterError> {
        if self.is_sequencer() {
            let listener = TcpListener::bind(self.config.bus_addr).await?;
            info!("cluster bus sequencer listening on {}", self.config.bus_addr);
            spawn_sequencer(listener, self.events_tx.clone());
        }
        Ok(self.id)
    }

    async fn join(&self) -> Result<(), ClusterError> {
        let mut stream = TcpStream::connect(self.config.sequencer_addr).await?;
        write_frame(
            &mut stream,
            &BusFrame::Hello {
                id: self.id,
                entry: self.config.entry.clone(),
            },
        )
        .await?;
        let (mut read_half, write_half) = stream.into_split();

        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(BusFrame::Notify(message)) => {
                        if events_tx.send(DriverEvent::Notify(message)).await.is_err() {
                            return;
                        }
                    }
                    Ok(BusFrame::Hello { .. }) => {
                        debug!("unexpected Hello frame from sequencer stream; ignoring");
                    }
                    Err(e) => {
                        error!("cluster bus connection to sequencer lost: {}", e);
                        return;
                    }
                }
            }
        });

        *self.to_sequencer.lock().await = Some(write_half);
        Ok(())
    }

    async fn broadcast(
        &self,
        op: Opcode,
        state: MsgState,
        body: MessageBody,
        from_entry: NodeEntry,
    ) -> Result<(), ClusterError> {
        let mut guard = self.to_sequencer.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(ClusterError::Internal(
                "broadcast before join() established a sequencer connection".into(),
            ));
        };
        let header = MessageHeader {
            proto_ver: crate::core::protocol::message::PROTOCOL_VERSION,
            op,
            state,
            from_id: self.id,
            from_entry,
        };
        write_frame(stream, &BusFrame::Notify(WireMessage { header, body })).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<DriverEvent, ClusterError> {
        self.events_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(ClusterError::DriverDisconnected)
    }
}

/// Runs the sequencer side: accepts connections, derives view-changes from
/// connect/disconnect, and relays every inbound `Notify` frame to every
/// connected peer (including its sender) in the order it was received --
/// the single serialization point that gives the bus total order.
fn spawn_sequencer(listener: TcpListener, local_events_tx: mpsc::Sender<DriverEvent>) {
    tokio::spawn(async move {
        let peers: Arc<Mutex<HashMap<NodeId, mpsc::Sender<BusFrame>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let members: Arc<Mutex<Vec<NodeId>>> = Arc::new(Mutex::new(Vec::new()));
        let (relay_tx, mut relay_rx) = mpsc::channel::<BusFrame>(4096);

        // The single relay task is what establishes total order: every
        // inbound Notify, from any connection, funnels through here before
        // fan-out.
        let relay_peers = peers.clone();
        tokio::spawn(async move {
            while let Some(frame) = relay_rx.recv().await {
                let peers = relay_peers.lock().await;
                for sender in peers.values() {
                    let _ = sender.send(frame.clone()).await;
                }
            }
        });

        loop {
            let (mut stream, addr) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    error!("cluster bus sequencer accept failed: {}", e);
                    continue;
                }
            };

            let id = match read_frame(&mut stream).await {
                Ok(BusFrame::Hello { id, .. }) => id,
                _ => {
                    warn!("peer {} did not send a Hello frame; dropping", addr);
                    continue;
                }
            };

            let (peer_tx, mut peer_rx) = mpsc::channel::<BusFrame>(1024);
            peers.lock().await.insert(id, peer_tx);

            let updated_members = {
                let mut members = members.lock().await;
                members.push(id);
                members.clone()
            };
            let _ = local_events_tx
                .send(DriverEvent::ViewJoin {
                    members: updated_members,
                })
                .await;

            let (mut read_half, mut write_half) = stream.into_split();

            let relay_tx_for_reader = relay_tx.clone();
            tokio::spawn(async move {
                loop {
                    match read_frame(&mut read_half).await {
                        Ok(frame @ BusFrame::Notify(_)) => {
                            if relay_tx_for_reader.send(frame).await.is_err() {
                                return;
                            }
                        }
                        Ok(BusFrame::Hello { .. }) => {}
                        Err(_) => return,
                    }
                }
            });

            let peers_for_writer = peers.clone();
            let members_for_writer = members.clone();
            let events_tx_for_writer = local_events_tx.clone();
            tokio::spawn(async move {
                while let Some(frame) = peer_rx.recv().await {
                    if write_frame(&mut write_half, &frame).await.is_err() {
                        break;
                    }
                }
                peers_for_writer.lock().await.remove(&id);
                let updated_members = {
                    let mut members = members_for_writer.lock().await;
                    members.retain(|m| *m != id);
                    members.clone()
                };
                let _ = events_tx_for_writer
                    .send(DriverEvent::ViewLeave {
                        left: id,
                        members: updated_members,
                    })
                    .await;
            });
        }
    });
}
