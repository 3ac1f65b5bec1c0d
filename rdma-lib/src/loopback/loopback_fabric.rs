use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    ptr::NonNull,
    sync::Arc,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    api::{AccessFlags, RegisteredRegion},
    error::{RdmaLibError, Result, VerbsError},
    provider::{
        CmEvent, CmEventKind, ConnParam, QpInitAttr, RdmaProvider, RecvWr, SendWr,
        WorkCompletion,
    },
};

use super::loopback_qp::{CqEntry, MrEntry, QpEntry};

macro_rules! loopback_handle {
    ($($name:ident),* $(,)?) => {
        $(
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(u32);

            impl $name {
                pub fn key(self) -> u32 {
                    self.0
                }
            }
        )*
    };
}

loopback_handle!(
    LoopbackEventChannel,
    LoopbackCmId,
    LoopbackContext,
    LoopbackPd,
    LoopbackCompChannel,
    LoopbackCq,
    LoopbackQp,
    LoopbackMr,
);

/// Resource and connection-manager calls in the order the fabric saw them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FabricOp {
    CreateId(LoopbackCmId),
    DestroyId(LoopbackCmId),
    ResolveAddr(LoopbackCmId),
    ResolveRoute(LoopbackCmId),
    Connect(LoopbackCmId),
    Accept(LoopbackCmId),
    Disconnect(LoopbackCmId),
    AllocPd(LoopbackPd),
    DeallocPd(LoopbackPd),
    CreateCompChannel(LoopbackCompChannel),
    DestroyCompChannel(LoopbackCompChannel),
    CreateCq(LoopbackCq),
    DestroyCq(LoopbackCq),
    CreateQp(LoopbackQp),
    DestroyQp(LoopbackQp),
    RegMr(LoopbackMr),
    DeregMr(LoopbackMr),
}

pub(super) struct Queue<T> {
    pub tx: Sender<T>,
    pub rx: Receiver<T>,
}

impl<T> Queue<T> {
    fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }
}

#[derive(Default)]
struct CmIdEntry {
    channel: Option<LoopbackEventChannel>,
    context: Option<LoopbackContext>,
    bound: Option<SocketAddr>,
    dst: Option<SocketAddr>,
    addr_resolved: bool,
    route_resolved: bool,
    qp: Option<LoopbackQp>,
    peer: Option<LoopbackCmId>,
    connected: bool,
}

pub(super) struct FabricState {
    next_handle: u32,
    devices: HashMap<String, LoopbackContext>,
    default_device: LoopbackContext,
    event_channels: HashMap<LoopbackEventChannel, Queue<CmEvent<LoopbackCmId>>>,
    cm_ids: HashMap<LoopbackCmId, CmIdEntry>,
    listeners: HashMap<SocketAddr, LoopbackCmId>,
    pds: HashMap<LoopbackPd, LoopbackContext>,
    pub(super) comp_channels: HashMap<LoopbackCompChannel, Queue<LoopbackCq>>,
    pub(super) cqs: HashMap<LoopbackCq, CqEntry>,
    pub(super) qps: HashMap<LoopbackQp, QpEntry>,
    pub(super) mrs: HashMap<LoopbackMr, MrEntry>,
    addr_errors: u32,
    route_errors: u32,
    /// Polls and re-arms of completion queues that were already destroyed.
    stale_cq_uses: usize,
    journal: Vec<FabricOp>,
}

impl FabricState {
    fn next_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn emit(&self, id: LoopbackCmId, kind: CmEventKind, listen_id: Option<LoopbackCmId>, status: i32) {
        let channel = self.cm_ids.get(&id).and_then(|entry| entry.channel);
        match channel.and_then(|c| self.event_channels.get(&c)) {
            Some(queue) => {
                trace!(?id, ?kind, "loopback cm event");
                let _ = queue.tx.send(CmEvent { kind, id, listen_id, status });
            }
            None => debug!(?id, ?kind, "Dropping cm event for id without channel"),
        }
    }

    fn cm_id(&mut self, id: LoopbackCmId, context: &'static str) -> Result<&mut CmIdEntry> {
        self.cm_ids.get_mut(&id).ok_or_else(|| einval(context))
    }

    fn find_listener(&self, dst: SocketAddr) -> Option<LoopbackCmId> {
        self.listeners.get(&dst).copied().or_else(|| {
            self.listeners
                .iter()
                .find(|(addr, _)| addr.ip().is_unspecified() && addr.port() == dst.port())
                .map(|(_, id)| *id)
        })
    }

    fn unpair(&mut self, id: LoopbackCmId) -> Option<LoopbackCmId> {
        let entry = self.cm_ids.get_mut(&id)?;
        let was_connected = std::mem::take(&mut entry.connected);
        let peer = entry.peer.take();
        let qp = entry.qp;
        if let Some(qp) = qp.and_then(|qp| self.qps.get_mut(&qp)) {
            qp.peer = None;
        }
        if let Some(peer) = peer.and_then(|p| self.cm_ids.get_mut(&p)) {
            peer.connected = false;
            peer.peer = None;
            if let Some(qp) = peer.qp.and_then(|qp| self.qps.get_mut(&qp)) {
                qp.peer = None;
            }
        }
        if was_connected { peer } else { None }
    }
}

fn einval(context: &'static str) -> RdmaLibError {
    VerbsError::with_code(libc::EINVAL, context).into()
}

fn ebusy(context: &'static str) -> RdmaLibError {
    VerbsError::with_code(libc::EBUSY, context).into()
}

/// A software fabric living inside the process.
///
/// Every clone refers to the same fabric, so a server and a client built from
/// clones can connect to each other. Data movement is a memcpy between
/// registered regions, executed when the work request is posted.
#[derive(Clone)]
pub struct LoopbackFabric {
    state: Arc<Mutex<FabricState>>,
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackFabric {
    pub const DEFAULT_DEVICE: &'static str = "lo0";

    pub fn new() -> Self {
        let default_device = LoopbackContext(1);
        let mut devices = HashMap::new();
        devices.insert(Self::DEFAULT_DEVICE.to_string(), default_device);
        let state = FabricState {
            next_handle: 1,
            devices,
            default_device,
            event_channels: HashMap::new(),
            cm_ids: HashMap::new(),
            listeners: HashMap::new(),
            pds: HashMap::new(),
            comp_channels: HashMap::new(),
            cqs: HashMap::new(),
            qps: HashMap::new(),
            mrs: HashMap::new(),
            addr_errors: 0,
            route_errors: 0,
            stale_cq_uses: 0,
            journal: Vec::new(),
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    /// Returns the context of the named device, creating it on first use.
    pub fn open_device(&self, name: &str) -> LoopbackContext {
        let mut state = self.state.lock();
        if let Some(ctx) = state.devices.get(name) {
            return *ctx;
        }
        let ctx = LoopbackContext(state.next_handle());
        state.devices.insert(name.to_string(), ctx);
        ctx
    }

    /// The next `count` address resolutions fail with `AddrError`.
    pub fn inject_addr_errors(&self, count: u32) {
        self.state.lock().addr_errors = count;
    }

    /// The next `count` route resolutions fail with `RouteError`.
    pub fn inject_route_errors(&self, count: u32) {
        self.state.lock().route_errors = count;
    }

    /// Queues `wc` on `cq` as if the hardware had produced it.
    pub fn inject_completion(&self, cq: LoopbackCq, wc: WorkCompletion) {
        self.state.lock().push_completion(cq, wc);
    }

    pub fn is_listening(&self, addr: SocketAddr) -> bool {
        self.state.lock().find_listener(addr).is_some()
    }

    pub fn journal(&self) -> Vec<FabricOp> {
        self.state.lock().journal.clone()
    }

    pub fn live_mrs(&self) -> usize {
        self.state.lock().mrs.len()
    }

    pub fn live_qps(&self) -> usize {
        self.state.lock().qps.len()
    }

    pub fn live_cm_ids(&self) -> usize {
        self.state.lock().cm_ids.len()
    }

    pub fn stale_cq_uses(&self) -> usize {
        self.state.lock().stale_cq_uses
    }
}

impl RdmaProvider for LoopbackFabric {
    type EventChannel = LoopbackEventChannel;
    type CmId = LoopbackCmId;
    type Context = LoopbackContext;
    type Pd = LoopbackPd;
    type CompChannel = LoopbackCompChannel;
    type Cq = LoopbackCq;
    type Qp = LoopbackQp;
    type Mr = LoopbackMr;

    fn create_event_channel(&self) -> Result<LoopbackEventChannel> {
        let mut state = self.state.lock();
        let channel = LoopbackEventChannel(state.next_handle());
        state.event_channels.insert(channel, Queue::new());
        Ok(channel)
    }

    fn destroy_event_channel(&self, channel: LoopbackEventChannel) {
        self.state.lock().event_channels.remove(&channel);
    }

    fn create_id(&self, channel: LoopbackEventChannel) -> Result<LoopbackCmId> {
        let mut state = self.state.lock();
        if !state.event_channels.contains_key(&channel) {
            return Err(einval("rdma_create_id: unknown event channel"));
        }
        let id = LoopbackCmId(state.next_handle());
        state.cm_ids.insert(id, CmIdEntry { channel: Some(channel), ..Default::default() });
        state.journal.push(FabricOp::CreateId(id));
        Ok(id)
    }

    fn destroy_id(&self, id: LoopbackCmId) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(peer) = state.unpair(id) {
            state.emit(peer, CmEventKind::Disconnected, None, 0);
        }
        let entry = state.cm_ids.remove(&id).ok_or_else(|| einval("rdma_destroy_id"))?;
        if let Some(addr) = entry.bound
            && state.listeners.get(&addr) == Some(&id)
        {
            state.listeners.remove(&addr);
        }
        state.journal.push(FabricOp::DestroyId(id));
        Ok(())
    }

    fn bind_addr(&self, id: LoopbackCmId, addr: SocketAddr) -> Result<()> {
        let mut state = self.state.lock();
        if state.listeners.contains_key(&addr) {
            return Err(VerbsError::with_code(libc::EADDRINUSE, "rdma_bind_addr").into());
        }
        let device = state.default_device;
        let entry = state.cm_id(id, "rdma_bind_addr")?;
        entry.bound = Some(addr);
        entry.context = Some(device);
        Ok(())
    }

    fn listen(&self, id: LoopbackCmId, _backlog: i32) -> Result<()> {
        let mut state = self.state.lock();
        let addr = state
            .cm_id(id, "rdma_listen")?
            .bound
            .ok_or_else(|| einval("rdma_listen: id is not bound"))?;
        state.listeners.insert(addr, id);
        Ok(())
    }

    fn resolve_addr(
        &self,
        id: LoopbackCmId,
        _src: Option<SocketAddr>,
        dst: SocketAddr,
        _timeout: Duration,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let device = state.default_device;
        state.cm_id(id, "rdma_resolve_addr")?;
        state.journal.push(FabricOp::ResolveAddr(id));
        if state.addr_errors > 0 {
            state.addr_errors -= 1;
            state.emit(id, CmEventKind::AddrError, None, -libc::ETIMEDOUT);
            return Ok(());
        }
        let entry = state.cm_id(id, "rdma_resolve_addr")?;
        entry.context = Some(device);
        entry.dst = Some(dst);
        entry.addr_resolved = true;
        state.emit(id, CmEventKind::AddrResolved, None, 0);
        Ok(())
    }

    fn resolve_route(&self, id: LoopbackCmId, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock();
        if !state.cm_id(id, "rdma_resolve_route")?.addr_resolved {
            return Err(einval("rdma_resolve_route: address not resolved"));
        }
        state.journal.push(FabricOp::ResolveRoute(id));
        if state.route_errors > 0 {
            state.route_errors -= 1;
            state.emit(id, CmEventKind::RouteError, None, -libc::ETIMEDOUT);
            return Ok(());
        }
        state.cm_id(id, "rdma_resolve_route")?.route_resolved = true;
        state.emit(id, CmEventKind::RouteResolved, None, 0);
        Ok(())
    }

    fn connect(&self, id: LoopbackCmId, _param: &ConnParam) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state.cm_id(id, "rdma_connect")?;
        if !entry.route_resolved || entry.qp.is_none() {
            return Err(einval("rdma_connect: route not resolved or no qp"));
        }
        let dst = entry.dst.ok_or_else(|| einval("rdma_connect: no destination"))?;
        state.journal.push(FabricOp::Connect(id));
        let Some(listener) = state.find_listener(dst) else {
            state.emit(id, CmEventKind::Rejected, None, libc::ECONNREFUSED);
            return Ok(());
        };
        let (channel, context) = {
            let listen_entry = state.cm_id(listener, "rdma_connect: listener")?;
            (listen_entry.channel, listen_entry.context)
        };
        let child = LoopbackCmId(state.next_handle());
        state.cm_ids.insert(
            child,
            CmIdEntry { channel, context, peer: Some(id), ..Default::default() },
        );
        state.cm_id(id, "rdma_connect")?.peer = Some(child);
        state.emit(child, CmEventKind::ConnectRequest, Some(listener), 0);
        Ok(())
    }

    fn accept(&self, id: LoopbackCmId, _param: &ConnParam) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state.cm_id(id, "rdma_accept")?;
        let (qp, peer) = match (entry.qp, entry.peer) {
            (Some(qp), Some(peer)) => (qp, peer),
            _ => return Err(einval("rdma_accept: no qp or no pending request")),
        };
        let peer_qp = state
            .cm_ids
            .get(&peer)
            .and_then(|p| p.qp)
            .ok_or_else(|| einval("rdma_accept: initiator has no qp"))?;
        for (local, remote) in [(qp, peer_qp), (peer_qp, qp)] {
            if let Some(entry) = state.qps.get_mut(&local) {
                entry.peer = Some(remote);
            }
        }
        for side in [id, peer] {
            state.cm_id(side, "rdma_accept")?.connected = true;
        }
        state.journal.push(FabricOp::Accept(id));
        state.emit(peer, CmEventKind::Established, None, 0);
        state.emit(id, CmEventKind::Established, None, 0);
        Ok(())
    }

    fn disconnect(&self, id: LoopbackCmId) -> Result<()> {
        let mut state = self.state.lock();
        state.cm_id(id, "rdma_disconnect")?;
        state.journal.push(FabricOp::Disconnect(id));
        if let Some(peer) = state.unpair(id) {
            state.emit(id, CmEventKind::Disconnected, None, 0);
            state.emit(peer, CmEventKind::Disconnected, None, 0);
        }
        Ok(())
    }

    fn get_cm_event(
        &self,
        channel: LoopbackEventChannel,
        timeout: Duration,
    ) -> Result<Option<CmEvent<LoopbackCmId>>> {
        let rx = self
            .state
            .lock()
            .event_channels
            .get(&channel)
            .map(|q| q.rx.clone())
            .ok_or_else(|| einval("rdma_get_cm_event: unknown channel"))?;
        match rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(einval("rdma_get_cm_event: channel closed")),
        }
    }

    fn cm_context(&self, id: LoopbackCmId) -> Option<LoopbackContext> {
        self.state.lock().cm_ids.get(&id).and_then(|entry| entry.context)
    }

    fn create_qp(
        &self,
        id: LoopbackCmId,
        pd: LoopbackPd,
        attr: &QpInitAttr<LoopbackCq>,
    ) -> Result<LoopbackQp> {
        let mut state = self.state.lock();
        let pd_context =
            *state.pds.get(&pd).ok_or_else(|| einval("rdma_create_qp: unknown pd"))?;
        let entry = state.cm_id(id, "rdma_create_qp")?;
        if entry.qp.is_some() || entry.context != Some(pd_context) {
            return Err(einval("rdma_create_qp: id has a qp or pd is on another device"));
        }
        if !state.cqs.contains_key(&attr.send_cq) || !state.cqs.contains_key(&attr.recv_cq) {
            return Err(einval("rdma_create_qp: unknown cq"));
        }
        let handle = state.next_handle();
        let qp = LoopbackQp(handle);
        state.qps.insert(
            qp,
            QpEntry {
                pd,
                send_cq: attr.send_cq,
                recv_cq: attr.recv_cq,
                qp_num: handle,
                max_send_wr: attr.max_send_wr,
                max_recv_wr: attr.max_recv_wr,
                outstanding_sends: 0,
                recv_queue: VecDeque::new(),
                peer: None,
            },
        );
        state.cm_id(id, "rdma_create_qp")?.qp = Some(qp);
        state.journal.push(FabricOp::CreateQp(qp));
        Ok(qp)
    }

    fn destroy_qp(&self, id: LoopbackCmId) {
        let mut state = self.state.lock();
        let Some(qp) = state.cm_ids.get_mut(&id).and_then(|entry| entry.qp.take()) else {
            return;
        };
        if let Some(entry) = state.qps.remove(&qp)
            && let Some(peer) = entry.peer.and_then(|p| state.qps.get_mut(&p))
        {
            peer.peer = None;
        }
        state.journal.push(FabricOp::DestroyQp(qp));
    }

    fn alloc_pd(&self, context: LoopbackContext) -> Result<LoopbackPd> {
        let mut state = self.state.lock();
        if !state.devices.values().any(|ctx| *ctx == context) {
            return Err(einval("ibv_alloc_pd: unknown device"));
        }
        let pd = LoopbackPd(state.next_handle());
        state.pds.insert(pd, context);
        state.journal.push(FabricOp::AllocPd(pd));
        Ok(pd)
    }

    fn dealloc_pd(&self, pd: LoopbackPd) -> Result<()> {
        let mut state = self.state.lock();
        if state.mrs.values().any(|mr| mr.pd == pd) || state.qps.values().any(|qp| qp.pd == pd)
        {
            return Err(ebusy("ibv_dealloc_pd"));
        }
        state.pds.remove(&pd).ok_or_else(|| einval("ibv_dealloc_pd"))?;
        state.journal.push(FabricOp::DeallocPd(pd));
        Ok(())
    }

    fn create_comp_channel(&self, _context: LoopbackContext) -> Result<LoopbackCompChannel> {
        let mut state = self.state.lock();
        let channel = LoopbackCompChannel(state.next_handle());
        state.comp_channels.insert(channel, Queue::new());
        state.journal.push(FabricOp::CreateCompChannel(channel));
        Ok(channel)
    }

    fn destroy_comp_channel(&self, channel: LoopbackCompChannel) -> Result<()> {
        let mut state = self.state.lock();
        if state.cqs.values().any(|cq| cq.channel == channel) {
            return Err(ebusy("ibv_destroy_comp_channel"));
        }
        state
            .comp_channels
            .remove(&channel)
            .ok_or_else(|| einval("ibv_destroy_comp_channel"))?;
        state.journal.push(FabricOp::DestroyCompChannel(channel));
        Ok(())
    }

    fn create_cq(
        &self,
        _context: LoopbackContext,
        depth: u32,
        channel: LoopbackCompChannel,
    ) -> Result<LoopbackCq> {
        let mut state = self.state.lock();
        if !state.comp_channels.contains_key(&channel) {
            return Err(einval("ibv_create_cq: unknown channel"));
        }
        let cq = LoopbackCq(state.next_handle());
        state.cqs.insert(
            cq,
            CqEntry { channel, depth, entries: VecDeque::new(), armed: false },
        );
        state.journal.push(FabricOp::CreateCq(cq));
        Ok(cq)
    }

    fn destroy_cq(&self, cq: LoopbackCq) -> Result<()> {
        let mut state = self.state.lock();
        if state.qps.values().any(|qp| qp.send_cq == cq || qp.recv_cq == cq) {
            return Err(ebusy("ibv_destroy_cq"));
        }
        state.cqs.remove(&cq).ok_or_else(|| einval("ibv_destroy_cq"))?;
        state.journal.push(FabricOp::DestroyCq(cq));
        Ok(())
    }

    fn req_notify_cq(&self, cq: LoopbackCq) -> Result<()> {
        let mut state = self.state.lock();
        match state.cqs.get_mut(&cq) {
            Some(entry) => {
                entry.armed = true;
                Ok(())
            }
            None => {
                state.stale_cq_uses += 1;
                Err(einval("ibv_req_notify_cq"))
            }
        }
    }

    fn get_cq_event(
        &self,
        channel: LoopbackCompChannel,
        timeout: Duration,
    ) -> Result<Option<LoopbackCq>> {
        let rx = self
            .state
            .lock()
            .comp_channels
            .get(&channel)
            .map(|q| q.rx.clone())
            .ok_or_else(|| einval("ibv_get_cq_event: unknown channel"))?;
        match rx.recv_timeout(timeout) {
            Ok(cq) => Ok(Some(cq)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(einval("ibv_get_cq_event: channel closed")),
        }
    }

    fn ack_cq_events(&self, _cq: LoopbackCq, _count: u32) {}

    fn poll_cq(&self, cq: LoopbackCq) -> Result<Option<WorkCompletion>> {
        let mut state = self.state.lock();
        if !state.cqs.contains_key(&cq) {
            state.stale_cq_uses += 1;
            return Err(einval("ibv_poll_cq: unknown cq"));
        }
        Ok(state.pop_completion(cq))
    }

    unsafe fn reg_mr(
        &self,
        pd: LoopbackPd,
        ptr: NonNull<u8>,
        len: usize,
        access: AccessFlags,
    ) -> Result<(LoopbackMr, RegisteredRegion)> {
        let mut state = self.state.lock();
        if !state.pds.contains_key(&pd) {
            return Err(einval("ibv_reg_mr: unknown pd"));
        }
        let mr = LoopbackMr(state.next_handle());
        let addr = ptr.as_ptr() as u64;
        state.mrs.insert(mr, MrEntry { pd, addr, length: len as u64, access });
        state.journal.push(FabricOp::RegMr(mr));
        let region = RegisteredRegion { addr, length: len as u64, lkey: mr.0, rkey: mr.0 };
        Ok((mr, region))
    }

    fn dereg_mr(&self, mr: LoopbackMr) -> Result<()> {
        let mut state = self.state.lock();
        state.mrs.remove(&mr).ok_or_else(|| einval("ibv_dereg_mr"))?;
        state.journal.push(FabricOp::DeregMr(mr));
        Ok(())
    }

    fn post_send(&self, qp: LoopbackQp, wr: &SendWr) -> Result<()> {
        self.state
            .lock()
            .execute_send(qp, wr)
            .map_err(|(code, context)| VerbsError::with_code(code, context).into())
    }

    fn post_recv(&self, qp: LoopbackQp, wr: &RecvWr) -> Result<()> {
        self.state
            .lock()
            .enqueue_recv(qp, wr)
            .map_err(|(code, context)| VerbsError::with_code(code, context).into())
    }
}
