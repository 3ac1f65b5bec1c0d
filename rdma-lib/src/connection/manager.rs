use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    api::{AccessFlags, ConnectionHandle, RegisteredRegion, TransferKind, TransferRequest, WrId},
    config::ConnectionConfig,
    connection::state::{ConnectionState, StateCell},
    error::{RdmaLibError, Result},
    mem_registry::MemoryRegistry,
    meta::{META_MESSAGE_BYTES, MetaMessage},
    poller::{CompletionPoller, PollerHandle},
    provider::{
        CompletionOpcode, QpInitAttr, RdmaProvider, RecvWr, RemoteTarget, SendOpcode, SendWr,
        Sge, WorkCompletion,
    },
    table::{CompletionSink, ConnectionTable},
    utils::{defer::Defer, memory::AlignedBuffer},
};

/// Correlation id used by meta send and receive work requests.
pub const META_CORRELATION: u32 = u32::MAX;

pub type CompletionCallback = Box<dyn Fn(&WorkCompletion) + Send + Sync>;

/// Snapshot of the completions a connection has processed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompletionStats {
    pub meta_sent: u64,
    pub meta_received: u64,
    pub rdma_writes: u64,
    pub rdma_reads: u64,
    pub imm_received: u64,
    pub errors: u64,
}

#[derive(Default)]
struct CompletionCounters {
    meta_sent: AtomicU64,
    meta_received: AtomicU64,
    rdma_writes: AtomicU64,
    rdma_reads: AtomicU64,
    imm_received: AtomicU64,
    errors: AtomicU64,
}

impl CompletionCounters {
    fn snapshot(&self) -> CompletionStats {
        CompletionStats {
            meta_sent: self.meta_sent.load(Ordering::Relaxed),
            meta_received: self.meta_received.load(Ordering::Relaxed),
            rdma_writes: self.rdma_writes.load(Ordering::Relaxed),
            rdma_reads: self.rdma_reads.load(Ordering::Relaxed),
            imm_received: self.imm_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// The fixed-size meta send and receive buffers with their registrations.
///
/// The send buffer is registered without remote access, the receive buffer
/// with local write. Every receive work request targets the same buffer.
struct MetaBuffers<P: RdmaProvider> {
    provider: P,
    send: AlignedBuffer,
    recv: AlignedBuffer,
    send_region: RegisteredRegion,
    recv_region: RegisteredRegion,
    mrs: Option<(P::Mr, P::Mr)>,
}

impl<P: RdmaProvider> MetaBuffers<P> {
    fn register(provider: P, pd: P::Pd, alignment: usize) -> Result<Self> {
        let send = AlignedBuffer::new(META_MESSAGE_BYTES, alignment)?;
        let recv = AlignedBuffer::new(META_MESSAGE_BYTES, alignment)?;
        let (send_mr, send_region) =
            unsafe { provider.reg_mr(pd, send.ptr(), send.len(), AccessFlags::NONE)? };
        let registered =
            unsafe { provider.reg_mr(pd, recv.ptr(), recv.len(), AccessFlags::LOCAL_WRITE) };
        let (recv_mr, recv_region) = match registered {
            Ok(v) => v,
            Err(e) => {
                let _ = provider.dereg_mr(send_mr);
                return Err(e);
            }
        };
        Ok(Self {
            provider,
            send,
            recv,
            send_region,
            recv_region,
            mrs: Some((send_mr, recv_mr)),
        })
    }

    fn stage(&self, msg: &MetaMessage) -> Result<()> {
        self.send.write_at(0, &msg.encode())
    }

    fn received(&self) -> Result<MetaMessage> {
        let mut wire = [0u8; META_MESSAGE_BYTES];
        self.recv.read_at(0, &mut wire)?;
        MetaMessage::decode(&wire)
    }

    fn deregister(&mut self) -> Result<()> {
        let Some((send_mr, recv_mr)) = self.mrs.take() else {
            return Ok(());
        };
        let send = self.provider.dereg_mr(send_mr);
        let recv = self.provider.dereg_mr(recv_mr);
        send.and(recv)
    }
}

impl<P: RdmaProvider> Drop for MetaBuffers<P> {
    fn drop(&mut self) {
        if let Err(e) = self.deregister() {
            warn!(error = %e, "Failed to deregister meta buffers");
        }
    }
}

struct ConnectionResources<P: RdmaProvider> {
    cm_id: P::CmId,
    pd: P::Pd,
    comp_channel: P::CompChannel,
    cq: P::Cq,
    qp: P::Qp,
    meta: MetaBuffers<P>,
    memory: Option<Arc<MemoryRegistry<P>>>,
    poller: PollerHandle,
}

/// The resources the completion poller works on. Released only after the
/// poller has stopped.
struct CompletionResources<P: RdmaProvider> {
    provider: P,
    handle: ConnectionHandle,
    pd: P::Pd,
    comp_channel: P::CompChannel,
    cq: P::Cq,
    memory: Option<Arc<MemoryRegistry<P>>>,
}

impl<P: RdmaProvider> CompletionResources<P> {
    /// Pinned memory, CQ, completion channel, then PD. Returns the first error.
    fn release(self) -> Result<()> {
        let Self { provider, handle, pd, comp_channel, cq, memory } = self;
        if let Some(memory) = memory
            && Arc::try_unwrap(memory).is_err()
        {
            warn!(connection = ?handle, "Pinned memory is still shared and stays registered");
        }
        let cq_ret = provider.destroy_cq(cq);
        let channel_ret = provider.destroy_comp_channel(comp_channel);
        for (ret, what) in [
            (&cq_ret, "destroy completion queue"),
            (&channel_ret, "destroy completion channel"),
        ] {
            if let Err(e) = ret {
                warn!(connection = ?handle, error = %e, "Failed to {what}");
            }
        }
        if let Err(e) = provider.dealloc_pd(pd) {
            warn!(connection = ?handle, error = %e, "Protection domain left allocated");
        }
        cq_ret.and(channel_ret)
    }
}

/// Owns one connection's fabric resources and the operations on them.
///
/// Shared between the connection's event loop, the application and, through
/// the [`ConnectionTable`], its completion poller.
pub struct ConnectionManager<P: RdmaProvider> {
    provider: P,
    config: ConnectionConfig,
    alignment: usize,
    table: Arc<ConnectionTable>,
    handle: ConnectionHandle,
    state: StateCell,
    context: Mutex<Option<P::Context>>,
    /// Serialises build and teardown.
    lifecycle: Mutex<()>,
    resources: RwLock<Option<ConnectionResources<P>>>,
    counters: CompletionCounters,
    meta_tx: Sender<MetaMessage>,
    meta_rx: Receiver<MetaMessage>,
    callback: RwLock<Option<Arc<dyn Fn(&WorkCompletion) + Send + Sync>>>,
}

impl<P: RdmaProvider> ConnectionManager<P> {
    pub fn new(provider: P, config: ConnectionConfig, alignment: usize) -> Result<Arc<Self>> {
        Self::with_table(provider, config, alignment, ConnectionTable::global())
    }

    pub fn with_table(
        provider: P,
        config: ConnectionConfig,
        alignment: usize,
        table: Arc<ConnectionTable>,
    ) -> Result<Arc<Self>> {
        let handle = table.reserve()?;
        let (meta_tx, meta_rx) = crossbeam_channel::unbounded();
        let manager = Arc::new(Self {
            provider,
            config,
            alignment,
            table: table.clone(),
            handle,
            state: StateCell::new(ConnectionState::Uninitialized),
            context: Mutex::new(None),
            lifecycle: Mutex::new(()),
            resources: RwLock::new(None),
            counters: CompletionCounters::default(),
            meta_tx,
            meta_rx,
            callback: RwLock::new(None),
        });
        let sink: Arc<dyn CompletionSink> = manager.clone();
        table.attach(handle, Arc::downgrade(&sink));
        Ok(manager)
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    pub fn is_connected(&self) -> bool {
        self.state.load() == ConnectionState::Connected
    }

    pub fn stats(&self) -> CompletionStats {
        self.counters.snapshot()
    }

    pub fn cm_id(&self) -> Option<P::CmId> {
        self.resources.read().as_ref().map(|r| r.cm_id)
    }

    pub fn protection_domain(&self) -> Option<P::Pd> {
        self.resources.read().as_ref().map(|r| r.pd)
    }

    pub fn completion_queue(&self) -> Option<P::Cq> {
        self.resources.read().as_ref().map(|r| r.cq)
    }

    /// Pinned blocks exposed to the peer, present once built with `exposed_blocks > 0`.
    pub fn memory(&self) -> Option<Arc<MemoryRegistry<P>>> {
        self.resources.read().as_ref().and_then(|r| r.memory.clone())
    }

    pub fn set_completion_callback(&self, callback: CompletionCallback) {
        *self.callback.write() = Some(Arc::from(callback));
    }

    /// Binds the connection to a device. Fails if already bound to another one.
    pub fn bind_context(&self, context: P::Context) -> Result<()> {
        let mut bound = self.context.lock();
        match *bound {
            Some(existing) if existing != context => Err(RdmaLibError::ContextMismatch),
            Some(_) => Ok(()),
            None => {
                *bound = Some(context);
                Ok(())
            }
        }
    }

    /// Allocates the PD, completion channel, CQ, poller, QP and meta buffers
    /// for `id`, then pre-posts `queue_depth` meta receives.
    pub fn build_connection(&self, id: P::CmId) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        if self.state.load() != ConnectionState::Uninitialized {
            return Err(RdmaLibError::InvalidState("connection resources already built"));
        }
        let context = self
            .provider
            .cm_context(id)
            .ok_or(RdmaLibError::InvalidState("cm id is not bound to a device"))?;
        self.bind_context(context)?;

        let provider = &self.provider;
        let depth = self.config.queue_depth;
        debug!(connection = ?self.handle, ?id, depth, "Building connection");

        let pd = provider.alloc_pd(context)?;
        let mut defer_pd = Defer::new(move || {
            let _ = provider.dealloc_pd(pd);
        });
        let comp_channel = provider.create_comp_channel(context)?;
        let mut defer_comp_channel = Defer::new(move || {
            let _ = provider.destroy_comp_channel(comp_channel);
        });
        let cq = provider.create_cq(context, depth, comp_channel)?;
        let mut defer_cq = Defer::new(move || {
            let _ = provider.destroy_cq(cq);
        });
        provider.req_notify_cq(cq)?;

        let poller = CompletionPoller {
            provider: provider.clone(),
            channel: comp_channel,
            cq,
            table: self.table.clone(),
            wait_interval: self.config.event_poll_interval(),
            pin_cpu: self.config.pin_poller_cpu,
        }
        .spawn(format!("rdma_cq_poller_{}", self.handle.slot))?;

        let (qp, meta, memory) = match self.build_queue_pair(id, pd, cq) {
            Ok(built) => built,
            Err(e) => {
                if let Err(poller_err) = poller.join() {
                    warn!(connection = ?self.handle, error = %poller_err, "Poller failed during build");
                }
                return Err(e);
            }
        };

        defer_pd.cancel();
        defer_comp_channel.cancel();
        defer_cq.cancel();

        *self.resources.write() = Some(ConnectionResources {
            cm_id: id,
            pd,
            comp_channel,
            cq,
            qp,
            meta,
            memory,
            poller,
        });
        self.state.store(ConnectionState::ResourcesBuilt);
        info!(connection = ?self.handle, ?id, "Connection resources built");
        Ok(())
    }

    fn build_queue_pair(
        &self,
        id: P::CmId,
        pd: P::Pd,
        cq: P::Cq,
    ) -> Result<(P::Qp, MetaBuffers<P>, Option<Arc<MemoryRegistry<P>>>)> {
        let provider = &self.provider;
        let depth = self.config.queue_depth;
        let qp = provider.create_qp(id, pd, &QpInitAttr::rc(cq, depth))?;
        let mut defer_qp = Defer::new(move || provider.destroy_qp(id));

        let meta = MetaBuffers::register(provider.clone(), pd, self.alignment)?;

        let memory = if self.config.exposed_blocks > 0 {
            let registry = MemoryRegistry::new(
                provider.clone(),
                pd,
                self.config.block_length,
                self.config.max_memory,
                self.alignment,
            )?;
            let access =
                AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE;
            for _ in 0..self.config.exposed_blocks {
                registry.allocate_next_block(access)?;
            }
            Some(Arc::new(registry))
        } else {
            None
        };

        let initial = memory
            .as_ref()
            .and_then(|m| m.get_pinned_mr(0, m.block_length(), true))
            .map(|region| MetaMessage::MemoryRegion(region.descriptor()))
            .unwrap_or(MetaMessage::Scalar(depth as u64));
        meta.stage(&initial)?;

        for _ in 0..depth {
            self.post_recv_on(qp, &meta)?;
        }

        defer_qp.cancel();
        Ok((qp, meta, memory))
    }

    /// `ResourcesBuilt -> Connected`. Sends are refused before this.
    pub fn mark_connected(&self) -> Result<()> {
        self.state
            .transition(ConnectionState::ResourcesBuilt, ConnectionState::Connected)
            .map_err(|_| RdmaLibError::InvalidState("connection resources are not built"))
    }

    /// Replaces the message the next meta send carries.
    pub fn stage_meta(&self, msg: MetaMessage) -> Result<()> {
        let resources = self.resources.read();
        let res = resources.as_ref().ok_or(RdmaLibError::InvalidState("connection not built"))?;
        res.meta.stage(&msg)
    }

    /// Receives a decoded meta message from the peer.
    pub fn recv_meta(&self, timeout: Duration) -> Option<MetaMessage> {
        self.meta_rx.recv_timeout(timeout).ok()
    }

    fn post_recv_on(&self, qp: P::Qp, meta: &MetaBuffers<P>) -> Result<()> {
        let wr = RecvWr {
            wr_id: WrId::new(self.handle, META_CORRELATION),
            sge: Sge {
                addr: meta.recv_region.addr,
                length: META_MESSAGE_BYTES as u32,
                lkey: meta.recv_region.lkey,
            },
        };
        self.provider.post_recv(qp, &wr)
    }

    pub fn post_meta_recv_wr(&self) -> Result<()> {
        let resources = self.resources.read();
        let res = resources.as_ref().ok_or(RdmaLibError::InvalidState("connection not built"))?;
        self.post_recv_on(res.qp, &res.meta)
    }

    /// Sends the staged meta message. Always signaled.
    pub fn post_meta_send_wr(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(RdmaLibError::NotConnected);
        }
        let resources = self.resources.read();
        let res = resources.as_ref().ok_or(RdmaLibError::NotConnected)?;
        let wr = SendWr {
            wr_id: WrId::new(self.handle, META_CORRELATION),
            sge: Sge {
                addr: res.meta.send_region.addr,
                length: META_MESSAGE_BYTES as u32,
                lkey: res.meta.send_region.lkey,
            },
            opcode: SendOpcode::Send,
            signaled: true,
            remote: None,
        };
        self.provider.post_send(res.qp, &wr)
    }

    /// Posts an RDMA write, with immediate if the request carries one.
    pub fn rdma_write(&self, req: &TransferRequest) -> Result<()> {
        let opcode = match req.kind {
            TransferKind::Write => SendOpcode::RdmaWrite,
            TransferKind::WriteWithImm(imm) => SendOpcode::RdmaWriteWithImm(imm),
            TransferKind::Read => {
                return Err(RdmaLibError::InvalidState("rdma_write given a read request"));
            }
        };
        self.post_transfer(req, opcode)
    }

    pub fn rdma_read(&self, req: &TransferRequest) -> Result<()> {
        if req.kind != TransferKind::Read {
            return Err(RdmaLibError::InvalidState("rdma_read given a write request"));
        }
        self.post_transfer(req, SendOpcode::RdmaRead)
    }

    fn post_transfer(&self, req: &TransferRequest, opcode: SendOpcode) -> Result<()> {
        if !self.is_connected() {
            return Err(RdmaLibError::NotConnected);
        }
        req.validate()?;
        let resources = self.resources.read();
        let res = resources.as_ref().ok_or(RdmaLibError::NotConnected)?;
        let wr = SendWr {
            wr_id: WrId::new(self.handle, req.correlation),
            sge: Sge { addr: req.local_addr, length: req.length, lkey: req.src.lkey },
            opcode,
            signaled: true,
            remote: Some(RemoteTarget { addr: req.remote_addr(), rkey: req.dst.rkey }),
        };
        debug!(
            connection = ?self.handle,
            ?opcode,
            remote_addr = req.remote_addr(),
            length = req.length,
            "Posting rdma transfer"
        );
        self.provider.post_send(res.qp, &wr)
    }

    /// Issues a CM disconnect. Both sides then see `Disconnected`.
    pub fn disconnect(&self) -> Result<()> {
        match self.cm_id() {
            Some(id) => self.provider.disconnect(id),
            None => Ok(()),
        }
    }

    /// Releases every resource in dependency order: QP, meta registrations,
    /// meta buffers, CM id, then poller, pinned memory, CQ, completion
    /// channel and PD. Idempotent.
    pub fn destroy_connection(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let resources = self.resources.write().take();
        self.state.store(ConnectionState::TornDown);
        let Some(res) = resources else {
            return Ok(());
        };
        let ConnectionResources { cm_id, pd, comp_channel, cq, qp: _, mut meta, memory, poller } =
            res;
        let provider = &self.provider;
        debug!(connection = ?self.handle, ?cm_id, "Destroying connection");

        let mut first_error: Option<RdmaLibError> = None;
        let mut record = |ret: Result<()>, what: &'static str| {
            if let Err(e) = ret {
                warn!(connection = ?self.handle, error = %e, "Failed to {what}");
                first_error.get_or_insert(e);
            }
        };

        provider.destroy_qp(cm_id);
        record(meta.deregister(), "deregister meta buffers");
        drop(meta);
        record(provider.destroy_id(cm_id), "destroy cm id");

        let completion = CompletionResources {
            provider: provider.clone(),
            handle: self.handle,
            pd,
            comp_channel,
            cq,
            memory,
        };
        if poller.is_current() {
            // Torn down from inside a dispatch. The poller is still draining
            // this CQ, so it releases the queue itself once its loop exits.
            debug!(connection = ?self.handle, "Deferring completion queue release to the poller");
            poller.release_on_exit(move || {
                let _ = completion.release();
            });
        } else {
            record(poller.join(), "run completion poller");
            if let Err(e) = completion.release() {
                first_error.get_or_insert(e);
            }
        }

        info!(connection = ?self.handle, "Connection torn down");
        first_error.map_or(Ok(()), Err)
    }

    fn handle_completion(&self, wc: &WorkCompletion) {
        if !wc.status.is_success() {
            bump(&self.counters.errors);
            warn!(
                connection = ?self.handle,
                wr_id = wc.wr_id.0,
                status = ?wc.status,
                opcode = ?wc.opcode,
                "Work completion failed"
            );
        } else {
            match wc.opcode {
                CompletionOpcode::Recv => {
                    let decoded = self.resources.read().as_ref().map(|r| r.meta.received());
                    match decoded {
                        Some(Ok(msg)) => {
                            bump(&self.counters.meta_received);
                            debug!(connection = ?self.handle, ?msg, "Received meta message");
                            let _ = self.meta_tx.send(msg);
                        }
                        Some(Err(e)) => {
                            warn!(connection = ?self.handle, error = %e, "Dropping malformed meta message");
                        }
                        None => debug!(connection = ?self.handle, "Meta receive after teardown"),
                    }
                }
                CompletionOpcode::RecvRdmaWithImm => {
                    bump(&self.counters.imm_received);
                    debug!(connection = ?self.handle, imm = ?wc.imm_data, "Received write with immediate");
                    // The write consumed a meta receive.
                    if let Err(e) = self.post_meta_recv_wr() {
                        warn!(connection = ?self.handle, error = %e, "Failed to replenish receive");
                    }
                }
                CompletionOpcode::RdmaRead => {
                    bump(&self.counters.rdma_reads);
                    debug!(connection = ?self.handle, wr_id = wc.wr_id.0, "Remote read completed");
                }
                CompletionOpcode::RdmaWrite => bump(&self.counters.rdma_writes),
                CompletionOpcode::Send => bump(&self.counters.meta_sent),
                CompletionOpcode::Other(opcode) => {
                    warn!(connection = ?self.handle, opcode, "Unprocessed completion opcode");
                }
            }
        }

        // Called without the lock so the callback may replace itself.
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(wc);
        }
    }
}

impl<P: RdmaProvider> CompletionSink for ConnectionManager<P> {
    fn on_completion(&self, wc: &WorkCompletion) {
        self.handle_completion(wc);
    }
}

impl<P: RdmaProvider> Drop for ConnectionManager<P> {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_connection() {
            warn!(connection = ?self.handle, error = %e, "Teardown on drop failed");
        }
        self.table.remove(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::{
        api::MemoryRegionDescriptor,
        loopback::{FabricOp, LoopbackFabric},
        provider::{CmEventKind, CompletionStatus},
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            queue_depth: 16,
            event_poll_interval_ms: 10,
            block_length: 4096,
            max_memory: 4 * 4096,
            ..Default::default()
        }
    }

    /// An id that resolved its address on the default loopback device.
    fn resolved_id(fabric: &LoopbackFabric) -> crate::loopback::LoopbackCmId {
        let channel = fabric.create_event_channel().unwrap();
        let id = fabric.create_id(channel).unwrap();
        fabric
            .resolve_addr(id, None, "127.0.0.1:1".parse().unwrap(), Duration::from_millis(1))
            .unwrap();
        let event = fabric.get_cm_event(channel, WAIT).unwrap().unwrap();
        assert_eq!(event.kind, CmEventKind::AddrResolved);
        id
    }

    fn inject_write_completion(
        fabric: &LoopbackFabric,
        cq: crate::loopback::LoopbackCq,
        handle: ConnectionHandle,
        correlation: u32,
    ) {
        let wc = WorkCompletion {
            wr_id: WrId::new(handle, correlation),
            status: CompletionStatus::Success,
            opcode: CompletionOpcode::RdmaWrite,
            byte_len: 8,
            imm_data: None,
            qp_num: 0,
        };
        fabric.inject_completion(cq, wc);
    }

    #[test]
    fn test_build_and_teardown_order() {
        let fabric = LoopbackFabric::new();
        let table = Arc::new(ConnectionTable::new());
        let manager = ConnectionManager::with_table(fabric.clone(), config(), 64, table).unwrap();
        let id = resolved_id(&fabric);

        manager.build_connection(id).unwrap();
        assert_eq!(manager.state(), ConnectionState::ResourcesBuilt);
        assert!(manager.protection_domain().is_some());
        assert!(matches!(
            manager.build_connection(id),
            Err(RdmaLibError::InvalidState(_))
        ));

        manager.destroy_connection().unwrap();
        assert_eq!(manager.state(), ConnectionState::TornDown);
        assert_eq!(fabric.live_mrs(), 0);
        assert_eq!(fabric.live_qps(), 0);

        let journal = fabric.journal();
        let teardown: Vec<_> = journal
            .iter()
            .skip_while(|op| !matches!(op, FabricOp::DestroyQp(_)))
            .copied()
            .collect();
        assert!(matches!(
            teardown.as_slice(),
            [
                FabricOp::DestroyQp(_),
                FabricOp::DeregMr(_),
                FabricOp::DeregMr(_),
                FabricOp::DestroyId(destroyed),
                FabricOp::DestroyCq(_),
                FabricOp::DestroyCompChannel(_),
                FabricOp::DeallocPd(_),
            ] if *destroyed == id
        ));

        // Teardown is idempotent.
        manager.destroy_connection().unwrap();
    }

    #[test]
    fn test_context_mismatch() {
        let fabric = LoopbackFabric::new();
        let table = Arc::new(ConnectionTable::new());
        let manager = ConnectionManager::with_table(fabric.clone(), config(), 64, table).unwrap();
        manager.bind_context(fabric.open_device("lo1")).unwrap();
        let id = resolved_id(&fabric);
        assert!(matches!(manager.build_connection(id), Err(RdmaLibError::ContextMismatch)));
        assert_eq!(manager.state(), ConnectionState::Uninitialized);
        assert!(manager.protection_domain().is_none());
    }

    #[test]
    fn test_unresolved_id_is_rejected() {
        let fabric = LoopbackFabric::new();
        let table = Arc::new(ConnectionTable::new());
        let manager = ConnectionManager::with_table(fabric.clone(), config(), 64, table).unwrap();
        let channel = fabric.create_event_channel().unwrap();
        let id = fabric.create_id(channel).unwrap();
        assert!(matches!(manager.build_connection(id), Err(RdmaLibError::InvalidState(_))));
    }

    #[test]
    fn test_sends_require_connected() {
        let fabric = LoopbackFabric::new();
        let table = Arc::new(ConnectionTable::new());
        let manager = ConnectionManager::with_table(fabric.clone(), config(), 64, table).unwrap();
        assert!(matches!(manager.post_meta_send_wr(), Err(RdmaLibError::NotConnected)));

        let id = resolved_id(&fabric);
        manager.build_connection(id).unwrap();
        assert!(matches!(manager.post_meta_send_wr(), Err(RdmaLibError::NotConnected)));

        let src = RegisteredRegion { addr: 0, length: 0, lkey: 0, rkey: 0 };
        let req = TransferRequest {
            dst: MemoryRegionDescriptor { addr: 0, length: 0, rkey: 0 },
            dst_offset: 0,
            src,
            local_addr: 0,
            length: 0,
            kind: TransferKind::Write,
            correlation: 1,
        };
        assert!(matches!(manager.rdma_write(&req), Err(RdmaLibError::NotConnected)));
        manager.mark_connected().unwrap();
        assert!(matches!(manager.rdma_read(&req), Err(RdmaLibError::InvalidState(_))));
    }

    #[test]
    fn test_exposed_memory_is_staged() {
        let fabric = LoopbackFabric::new();
        let table = Arc::new(ConnectionTable::new());
        let config = ConnectionConfig { exposed_blocks: 2, ..config() };
        let manager = ConnectionManager::with_table(fabric.clone(), config, 64, table).unwrap();
        let id = resolved_id(&fabric);
        manager.build_connection(id).unwrap();

        let memory = manager.memory().unwrap();
        assert_eq!(memory.allocated_blocks(), 2);
        // 2 meta buffers + 2 blocks
        assert_eq!(fabric.live_mrs(), 4);
        drop(memory);

        manager.destroy_connection().unwrap();
        assert_eq!(fabric.live_mrs(), 0);
        assert!(fabric.journal().iter().any(|op| matches!(op, FabricOp::DeallocPd(_))));
    }

    #[test]
    fn test_drop_inside_completion_callback() {
        let fabric = LoopbackFabric::new();
        let table = Arc::new(ConnectionTable::new());
        let manager = ConnectionManager::with_table(fabric.clone(), config(), 64, table).unwrap();
        manager.build_connection(resolved_id(&fabric)).unwrap();

        let cq = manager.completion_queue().unwrap();
        let handle = manager.handle();

        let owner: Arc<Mutex<Option<Arc<ConnectionManager<LoopbackFabric>>>>> = Arc::default();
        let (called_tx, called_rx) = crossbeam_channel::bounded(1);
        let owner_in_callback = owner.clone();
        manager.set_completion_callback(Box::new(move |_| {
            // Releases the last application reference. Only the dispatch
            // itself keeps the manager alive past this point.
            drop(owner_in_callback.lock().take());
            let _ = called_tx.send(());
        }));
        *owner.lock() = Some(manager);
        inject_write_completion(&fabric, cq, handle, 5);
        called_rx.recv_timeout(WAIT).unwrap();

        let released = || fabric.journal().iter().any(|op| matches!(op, FabricOp::DeallocPd(_)));
        let deadline = Instant::now() + WAIT;
        while !released() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(released());
        assert_eq!(fabric.stale_cq_uses(), 0);
        assert_eq!(fabric.live_mrs(), 0);
        assert_eq!(fabric.live_qps(), 0);
    }

    #[test]
    fn test_callback_can_replace_itself() {
        let fabric = LoopbackFabric::new();
        let table = Arc::new(ConnectionTable::new());
        let manager = ConnectionManager::with_table(fabric.clone(), config(), 64, table).unwrap();
        manager.build_connection(resolved_id(&fabric)).unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        let weak = Arc::downgrade(&manager);
        manager.set_completion_callback(Box::new(move |wc| {
            let _ = tx.send(("first", wc.wr_id.correlation()));
            let tx = tx.clone();
            if let Some(manager) = weak.upgrade() {
                manager.set_completion_callback(Box::new(move |wc| {
                    let _ = tx.send(("second", wc.wr_id.correlation()));
                }));
            }
        }));

        let cq = manager.completion_queue().unwrap();
        inject_write_completion(&fabric, cq, manager.handle(), 1);
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), ("first", 1));
        inject_write_completion(&fabric, cq, manager.handle(), 2);
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), ("second", 2));
        manager.destroy_connection().unwrap();
    }
}
