use std::{fmt::Debug, hash::Hash, net::SocketAddr, ptr::NonNull, time::Duration};

use crate::{
    api::{AccessFlags, RegisteredRegion, WrId},
    error::Result,
};

/// Connection manager event types, one per `rdma_cm_event_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmEventKind {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    MulticastJoin,
    MulticastError,
    AddrChange,
    TimewaitExit,
    Unknown(u32),
}

impl From<u32> for CmEventKind {
    fn from(value: u32) -> Self {
        match value {
            0 => CmEventKind::AddrResolved,
            1 => CmEventKind::AddrError,
            2 => CmEventKind::RouteResolved,
            3 => CmEventKind::RouteError,
            4 => CmEventKind::ConnectRequest,
            5 => CmEventKind::ConnectResponse,
            6 => CmEventKind::ConnectError,
            7 => CmEventKind::Unreachable,
            8 => CmEventKind::Rejected,
            9 => CmEventKind::Established,
            10 => CmEventKind::Disconnected,
            11 => CmEventKind::DeviceRemoval,
            12 => CmEventKind::MulticastJoin,
            13 => CmEventKind::MulticastError,
            14 => CmEventKind::AddrChange,
            15 => CmEventKind::TimewaitExit,
            other => CmEventKind::Unknown(other),
        }
    }
}

/// A CM event, already acknowledged by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmEvent<Id> {
    pub kind: CmEventKind,
    /// The id the event is about. For `ConnectRequest` this is the new child id.
    pub id: Id,
    pub listen_id: Option<Id>,
    pub status: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnParam {
    pub initiator_depth: u8,
    pub responder_resources: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
}

impl ConnParam {
    /// Accept side: one outstanding read each way, infinite RNR retry.
    pub const fn accept() -> Self {
        Self { initiator_depth: 1, responder_resources: 1, retry_count: 0, rnr_retry_count: 7 }
    }

    pub const fn connect() -> Self {
        Self { initiator_depth: 1, responder_resources: 1, retry_count: 7, rnr_retry_count: 7 }
    }
}

/// Attributes of an RC queue pair sharing one completion queue for both directions.
#[derive(Debug, Clone, Copy)]
pub struct QpInitAttr<Cq> {
    pub send_cq: Cq,
    pub recv_cq: Cq,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub sq_sig_all: bool,
}

impl<Cq: Copy> QpInitAttr<Cq> {
    pub fn rc(cq: Cq, depth: u32) -> Self {
        Self {
            send_cq: cq,
            recv_cq: cq,
            max_send_wr: depth,
            max_recv_wr: depth,
            max_send_sge: 1,
            max_recv_sge: 1,
            sq_sig_all: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOpcode {
    Send,
    RdmaWrite,
    RdmaWriteWithImm(u32),
    RdmaRead,
}

#[derive(Debug, Clone, Copy)]
pub struct RemoteTarget {
    pub addr: u64,
    pub rkey: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct SendWr {
    pub wr_id: WrId,
    pub sge: Sge,
    pub opcode: SendOpcode,
    pub signaled: bool,
    /// Required for RDMA opcodes.
    pub remote: Option<RemoteTarget>,
}

#[derive(Debug, Clone, Copy)]
pub struct RecvWr {
    pub wr_id: WrId,
    pub sge: Sge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    LocalLengthError,
    LocalProtectionError,
    WrFlushError,
    RemoteAccessError,
    RemoteOperationError,
    RetryExceeded,
    RnrRetryExceeded,
    /// Any other `ibv_wc_status` value.
    Other(u32),
}

impl CompletionStatus {
    pub fn is_success(self) -> bool {
        self == CompletionStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    Recv,
    RecvRdmaWithImm,
    Other(u32),
}

/// A single completion queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: WrId,
    pub status: CompletionStatus,
    pub opcode: CompletionOpcode,
    pub byte_len: u32,
    pub imm_data: Option<u32>,
    pub qp_num: u32,
}

/// The rdma_cm and verbs calls the connection layer is built on.
///
/// Handles are plain copyable values. Ownership of the underlying resources
/// stays with the connection that created them and is released through the
/// matching destroy call.
pub trait RdmaProvider: Clone + Send + Sync + 'static {
    type EventChannel: Copy + Send + Sync + Debug;
    type CmId: Copy + Send + Sync + Eq + Hash + Debug;
    type Context: Copy + Send + Sync + Eq + Debug;
    type Pd: Copy + Send + Sync + Debug;
    type CompChannel: Copy + Send + Sync + Debug;
    type Cq: Copy + Send + Sync + Eq + Debug;
    type Qp: Copy + Send + Sync + Debug;
    type Mr: Copy + Send + Sync + Debug;

    fn create_event_channel(&self) -> Result<Self::EventChannel>;
    fn destroy_event_channel(&self, channel: Self::EventChannel);
    fn create_id(&self, channel: Self::EventChannel) -> Result<Self::CmId>;
    fn destroy_id(&self, id: Self::CmId) -> Result<()>;
    fn bind_addr(&self, id: Self::CmId, addr: SocketAddr) -> Result<()>;
    fn listen(&self, id: Self::CmId, backlog: i32) -> Result<()>;
    fn resolve_addr(
        &self,
        id: Self::CmId,
        src: Option<SocketAddr>,
        dst: SocketAddr,
        timeout: Duration,
    ) -> Result<()>;
    fn resolve_route(&self, id: Self::CmId, timeout: Duration) -> Result<()>;
    fn connect(&self, id: Self::CmId, param: &ConnParam) -> Result<()>;
    fn accept(&self, id: Self::CmId, param: &ConnParam) -> Result<()>;
    fn disconnect(&self, id: Self::CmId) -> Result<()>;
    /// Waits up to `timeout` for the next event. `Ok(None)` on timeout.
    fn get_cm_event(
        &self,
        channel: Self::EventChannel,
        timeout: Duration,
    ) -> Result<Option<CmEvent<Self::CmId>>>;
    /// Device context the id is bound to after address resolution or a connect request.
    fn cm_context(&self, id: Self::CmId) -> Option<Self::Context>;
    fn create_qp(
        &self,
        id: Self::CmId,
        pd: Self::Pd,
        attr: &QpInitAttr<Self::Cq>,
    ) -> Result<Self::Qp>;
    fn destroy_qp(&self, id: Self::CmId);

    fn alloc_pd(&self, context: Self::Context) -> Result<Self::Pd>;
    fn dealloc_pd(&self, pd: Self::Pd) -> Result<()>;
    fn create_comp_channel(&self, context: Self::Context) -> Result<Self::CompChannel>;
    fn destroy_comp_channel(&self, channel: Self::CompChannel) -> Result<()>;
    fn create_cq(
        &self,
        context: Self::Context,
        depth: u32,
        channel: Self::CompChannel,
    ) -> Result<Self::Cq>;
    fn destroy_cq(&self, cq: Self::Cq) -> Result<()>;
    fn req_notify_cq(&self, cq: Self::Cq) -> Result<()>;
    /// Waits up to `timeout` for a completion notification. `Ok(None)` on timeout.
    fn get_cq_event(
        &self,
        channel: Self::CompChannel,
        timeout: Duration,
    ) -> Result<Option<Self::Cq>>;
    fn ack_cq_events(&self, cq: Self::Cq, count: u32);
    /// Pops at most one completion.
    fn poll_cq(&self, cq: Self::Cq) -> Result<Option<WorkCompletion>>;

    /// # Safety
    ///
    /// `ptr..ptr+len` must stay valid and must not move until the region is
    /// deregistered with [`RdmaProvider::dereg_mr`].
    unsafe fn reg_mr(
        &self,
        pd: Self::Pd,
        ptr: NonNull<u8>,
        len: usize,
        access: AccessFlags,
    ) -> Result<(Self::Mr, RegisteredRegion)>;
    fn dereg_mr(&self, mr: Self::Mr) -> Result<()>;
    fn post_send(&self, qp: Self::Qp, wr: &SendWr) -> Result<()>;
    fn post_recv(&self, qp: Self::Qp, wr: &RecvWr) -> Result<()>;
}
