// src/core/engine.rs

//! Wires membership state, the epoch log, the cluster driver, the
//! collaborators, and the event serializer into one running core
//! (`spec.md` SS9's replacement for the source's global `sys` struct).
//!
//! [`Core::run`] spawns exactly two tasks: a driver-event pump that tags
//! every [`DriverEvent`] and pushes it onto the serializer's FIFO, and the
//! cluster worker, which loops [`EventSerializer::next_ready`] and
//! dispatches each decision to the matching protocol module. All
//! membership mutation happens on the cluster-worker task; everything
//! else only ever takes a read lock or talks to the serializer.

use crate::core::collaborators::{ObjectStore, RequestExecutor, VdiLayer};
use crate::core::driver::{ClusterDriver, DriverEvent};
use crate::core::epoch_log::EpochLog;
use crate::core::errors::ClusterError;
use crate::core::membership::{ClusterStatus, MembershipState};
use crate::core::metrics::{Metrics, MetricsSnapshot};
use crate::core::node::{NodeEntry, NodeId};
use crate::core::protocol::message::{MessageBody, Opcode, VdiOpPayload};
use crate::core::protocol::vdi_op::PendingVdiOps;
use crate::core::protocol::{join, leave, transfer, vdi_op, MsgState, WireMessage};
use crate::core::serializer::event::{Event, NotifyEvent, RequestEvent, ViewJoinEvent, ViewLeaveEvent};
use crate::core::serializer::gate::Gate;
use crate::core::serializer::{EventSerializer, ReadyWork};
use crate::core::status::ClusterStatusCode;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// One running node's coordination core.
pub struct Core {
    my_id: NodeId,
    my_entry: NodeEntry,
    membership: RwLock<MembershipState>,
    epoch_log: EpochLog,
    object_store: Arc<dyn ObjectStore>,
    vdi_layer: Arc<dyn VdiLayer>,
    executor: Arc<dyn RequestExecutor>,
    serializer: EventSerializer,
    pending_vdi_ops: PendingVdiOps,
    metrics: Metrics,
    /// Default replication-factor hint a fresh joiner reports before it has
    /// learned the cluster's real one from a `make-fs`/`Join/Fin`.
    replication_factor_hint: u32,
    /// Guards against broadcasting our own `Join/Init` more than once.
    join_init_sent: AtomicBool,
}

impl Core {
    pub fn new(
        my_id: NodeId,
        my_entry: NodeEntry,
        epoch_log: EpochLog,
        object_store: Arc<dyn ObjectStore>,
        vdi_layer: Arc<dyn VdiLayer>,
        executor: Arc<dyn RequestExecutor>,
        replication_factor_hint: u32,
    ) -> Arc<Self> {
        let membership = MembershipState::new(my_id, my_entry.clone());
        if let Some((ctime, factor)) = epoch_log.read_format_info() {
            membership.set_ctime(ctime);
            membership.set_replication_factor(factor);
        }
        Arc::new(Self {
            my_id,
            my_entry,
            membership: RwLock::new(membership),
            epoch_log,
            object_store,
            vdi_layer,
            executor,
            serializer: EventSerializer::new(),
            pending_vdi_ops: PendingVdiOps::new(),
            metrics: Metrics::new(),
            replication_factor_hint,
            join_init_sent: AtomicBool::new(false),
        })
    }

    pub fn my_id(&self) -> NodeId {
        self.my_id
    }

    pub fn epoch(&self) -> u32 {
        self.membership.read().epoch()
    }

    pub fn status(&self) -> ClusterStatus {
        self.membership.read().status()
    }

    pub fn is_master(&self) -> bool {
        self.membership.read().is_master()
    }

    pub fn ordered_node_list(&self) -> Vec<NodeEntry> {
        self.membership.read().ordered_node_list()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Submits a client I/O request into the same FIFO as membership
    /// events (`spec.md` SS2's "fourth event kind"), and awaits its
    /// completion status.
    pub async fn submit_request(&self, request_id: u64, oid: u64, direct: bool) -> ClusterStatusCode {
        let (tx, rx) = oneshot::channel();
        let epoch = self.epoch();
        self.serializer
            .push(Event::Request(RequestEvent {
                request_id,
                oid,
                epoch,
                direct,
                reply: tx,
            }))
            .await;
        rx.await.unwrap_or(ClusterStatusCode::SystemError)
    }

    /// Submits a VDI-op as this node's own client request: broadcasts
    /// `VdiOp/Init` and awaits the matching `VdiOp/Fin`, keyed by request
    /// id in [`PendingVdiOps`] so overlapping requests from this node
    /// never cross-deliver each other's responses.
    pub async fn submit_vdi_op(
        &self,
        driver: &dyn ClusterDriver,
        op: VdiOpPayload,
    ) -> Result<VdiOpPayload, ClusterError> {
        let (tx, rx) = oneshot::channel();
        self.pending_vdi_ops.register(op.request_id, tx);
        driver
            .broadcast(
                Opcode::VdiOp,
                MsgState::Init,
                MessageBody::VdiOp(op),
                self.my_entry.clone(),
            )
            .await?;
        rx.await.map_err(|_| ClusterError::SerializerClosed)
    }

    /// Broadcasts this node's `Leave/Fin`, the voluntary announcement a
    /// departing node sends before closing its driver connection, so peers
    /// can tell a clean departure from a crash (`spec.md` SS4.E.4). The
    /// caller is responsible for actually closing the connection afterward.
    pub async fn announce_leave(&self, driver: &dyn ClusterDriver) -> Result<(), ClusterError> {
        let payload = leave::build_leave_fin(&self.membership.read());
        driver
            .broadcast(
                Opcode::Leave,
                MsgState::Fin,
                MessageBody::Leave(payload),
                self.my_entry.clone(),
            )
            .await
    }

    /// Runs the core to completion: the driver-event pump and the
    /// cluster-worker loop. Returns only if the driver's pump task sees a
    /// fatal disconnect -- a real deployment treats that as a reason to
    /// restart the process (`spec.md` SS4.A).
    ///
    /// The caller is expected to have already called `driver.init()` (it
    /// has to, in order to learn this node's `NodeId` before constructing
    /// `Core` in the first place); calling it again here would rebind the
    /// TCP driver's sequencer listener a second time.
    pub async fn run(self: &Arc<Self>, driver: Arc<dyn ClusterDriver>) -> Result<(), ClusterError> {
        driver.join().await?;

        let pump_core = Arc::clone(self);
        let pump_driver = Arc::clone(&driver);
        let pump = tokio::spawn(async move {
            loop {
                match pump_driver.recv().await {
                    Ok(event) => pump_core.ingest_driver_event(event).await,
                    Err(e) => {
                        error!("cluster driver disconnected: {}", e);
                        return;
                    }
                }
            }
        });

        self.worker_loop(driver.as_ref()).await;
        pump.abort();
        Ok(())
    }

    async fn ingest_driver_event(&self, event: DriverEvent) {
        match event {
            DriverEvent::ViewJoin { members } => {
                self.serializer
                    .push(Event::ViewJoin(ViewJoinEvent { members }))
                    .await;
            }
            DriverEvent::ViewLeave { left, members } => {
                self.serializer
                    .push(Event::ViewLeave(ViewLeaveEvent { left, members }))
                    .await;
            }
            DriverEvent::Notify(message) => {
                self.serializer.push(Event::Notify(NotifyEvent { message })).await;
            }
        }
    }

    async fn worker_loop(&self, driver: &dyn ClusterDriver) {
        loop {
            let epoch = self.epoch();
            match self.serializer.next_ready(self.object_store.as_ref(), epoch).await {
                ReadyWork::Wait => continue,
                ReadyWork::FastFailJoining(req) => {
                    self.metrics.record_fast_fail();
                    req.fail(ClusterStatusCode::NewNodeVer);
                }
                ReadyWork::Dispatch(req) => {
                    self.metrics.record_dispatch();
                    let RequestEvent {
                        request_id, oid, direct, reply, ..
                    } = req;
                    if direct {
                        self.executor.execute(request_id, reply);
                    } else {
                        self.executor.forward(request_id, reply);
                    }
                    self.serializer.finish_io(oid);
                    self.serializer.requeue_object(oid).await;
                }
                ReadyWork::RunEvent(event) => {
                    self.handle_event(event, driver).await;
                    self.serializer.finish_running();
                }
            }
        }
    }

    async fn handle_event(&self, event: Event, driver: &dyn ClusterDriver) {
        match event {
            Event::ViewJoin(ViewJoinEvent { members }) => self.handle_view_join(members, driver).await,
            Event::ViewLeave(ViewLeaveEvent { left, members }) => {
                self.handle_view_leave(left, members)
            }
            Event::Notify(NotifyEvent { message }) => self.handle_notify(message, driver).await,
            Event::Request(_) => unreachable!("requests are handled in the dispatch branch"),
        }
        self.metrics.set_epoch(self.epoch());
        self.metrics
            .set_storage_roster_size(self.membership.read().storage_len() as u32);
    }

    async fn handle_view_join(&self, members: Vec<NodeId>, driver: &dyn ClusterDriver) {
        self.metrics.record_view_join();
        {
            let mut membership = self.membership.write();
            for id in &members {
                if !membership.transport_contains(id) {
                    membership.transport_insert(*id, None);
                }
            }
        }

        let is_bootstrap = members == [self.my_id] && self.membership.read().storage_len() == 0;
        if is_bootstrap {
            let decision = join::bootstrap(&self.epoch_log);
            let mut membership = self.membership.write();
            membership.set_status(decision.status);
            membership.set_epoch(decision.epoch);
            membership.ratify(self.my_id, self.my_entry.clone());
            membership.set_join_finished(true);
            info!(
                "first node in the transport view; became master at epoch {} ({:?})",
                decision.epoch, decision.status
            );
            return;
        }

        if !self.membership.read().join_finished() && !self.join_init_sent.swap(true, Ordering::AcqRel) {
            self.serializer.set_gate(Gate::Joining);
            let payload = {
                let membership = self.membership.read();
                join::build_init(
                    &self.epoch_log,
                    membership.epoch(),
                    membership.ctime(),
                    self.replication_factor_hint,
                    self.my_id,
                    self.my_entry.clone(),
                )
            };
            info!("broadcasting our own Join/Init");
            if let Err(e) = driver
                .broadcast(Opcode::Join, MsgState::Init, MessageBody::Join(payload), self.my_entry.clone())
                .await
            {
                error!("failed to broadcast Join/Init: {}", e);
            }
        }
    }

    fn handle_view_leave(&self, left: NodeId, members: Vec<NodeId>) {
        self.metrics.record_view_leave();
        let mut membership = self.membership.write();
        let storage_len_before = membership.storage_len();
        let reachable = membership
            .ordered_storage_nodes()
            .iter()
            .filter(|n| n.id != self.my_id && n.id != left && members.contains(&n.id))
            .count();

        if leave::should_self_fence(storage_len_before, reachable) {
            self.metrics.record_self_fence();
            error!(
                "lost contact with a majority of the storage roster ({} of {} reachable); self-fencing",
                reachable, storage_len_before
            );
            std::process::exit(1);
        }

        leave::apply_leave(&mut membership, &self.epoch_log, left);
    }

    async fn handle_notify(&self, message: WireMessage, driver: &dyn ClusterDriver) {
        self.metrics.record_notify();
        let header = message.header;
        match (header.op, header.state, message.body) {
            (Opcode::Join, MsgState::Init, MessageBody::Join(payload)) => {
                if !self.is_master() {
                    return;
                }
                let outcome = {
                    let membership = self.membership.read();
                    join::handle_init(
                        &membership,
                        &self.epoch_log,
                        membership.ctime(),
                        payload.joiner_id,
                        payload.joiner_entry.clone(),
                        &payload,
                    )
                };
                if let Err(e) = driver
                    .broadcast(
                        Opcode::Join,
                        MsgState::Fin,
                        MessageBody::Join(outcome.response.clone()),
                        self.my_entry.clone(),
                    )
                    .await
                {
                    error!("failed to broadcast Join/Fin: {}", e);
                }
                if outcome.transfer_mastership {
                    let transfer_payload = transfer::build_transfer(payload.epoch);
                    let _ = driver
                        .broadcast(
                            Opcode::MasterTransfer,
                            MsgState::Fin,
                            MessageBody::MasterTransfer(transfer_payload),
                            self.my_entry.clone(),
                        )
                        .await;
                    error!("our epoch is stale relative to a joiner's; transferring mastership and exiting");
                    std::process::exit(1);
                }
            }
            (Opcode::Join, MsgState::Fin, MessageBody::Join(response)) => {
                let next_status = {
                    let mut membership = self.membership.write();
                    join::apply_fin(&mut membership, &self.epoch_log, &response)
                };
                if response.joiner_id == self.my_id {
                    self.serializer.set_gate(Gate::Idle);
                    self.membership.read().set_join_finished(true);
                    if response.result != ClusterStatusCode::Success {
                        self.membership.write().set_status(ClusterStatus::JoinFailed);
                        error!(
                            "our Join/Init was rejected ({:?}); downgrading to gateway-only and exiting",
                            response.result
                        );
                        std::process::exit(1);
                    }
                }
                if matches!(next_status, ClusterStatus::Ok | ClusterStatus::Halt) {
                    let epoch = self.epoch();
                    self.object_store.start_recovery(epoch).await;
                    self.membership.write().leave_list_clear();
                }
            }
            (Opcode::Leave, MsgState::Fin, MessageBody::Leave(_)) => {
                let next_status = leave::apply_leave_fin(
                    &mut self.membership.write(),
                    &self.epoch_log,
                    header.from_id,
                    header.from_entry,
                );
                if matches!(next_status, ClusterStatus::Ok | ClusterStatus::Halt) {
                    let epoch = self.epoch();
                    self.object_store.start_recovery(epoch).await;
                    self.membership.write().leave_list_clear();
                }
            }
            (Opcode::VdiOp, MsgState::Init, MessageBody::VdiOp(op)) => {
                if !self.is_master() {
                    return;
                }
                let response = vdi_op::handle_init(self.vdi_layer.as_ref(), &op).await;
                if let Err(e) = driver
                    .broadcast(
                        Opcode::VdiOp,
                        MsgState::Fin,
                        MessageBody::VdiOp(response),
                        self.my_entry.clone(),
                    )
                    .await
                {
                    error!("failed to broadcast VdiOp/Fin: {}", e);
                }
            }
            (Opcode::VdiOp, MsgState::Fin, MessageBody::VdiOp(response)) => {
                let next_status = {
                    let mut membership = self.membership.write();
                    let committed = vdi_op::apply_fin(&mut membership, &self.epoch_log, &response);
                    if let Some(epoch) = committed {
                        self.epoch_log.write(epoch, &membership.ordered_node_list());
                    }
                    membership.status()
                };
                self.pending_vdi_ops.complete(&response);
                if matches!(next_status, ClusterStatus::Ok | ClusterStatus::Halt) {
                    let epoch = self.epoch();
                    self.object_store.start_recovery(epoch).await;
                }
            }
            (Opcode::MasterTransfer, MsgState::Fin, MessageBody::MasterTransfer(_)) => {
                if transfer::was_master_before_transfer(&self.membership.read()) {
                    error!("observed a MasterTransfer/Fin while still believing ourselves master; exiting");
                    std::process::exit(1);
                }
            }
            (Opcode::MasterChanged, _, _) => {
                // Observability-only: mastership is a pure function of the
                // storage roster's deterministic order and needs no action.
            }
            (op, state, _) => {
                warn!("unexpected message body for op {:?} state {:?}; ignoring", op, state);
            }
        }
    }
}
