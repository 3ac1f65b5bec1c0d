use std::{
    mem::MaybeUninit,
    net::SocketAddr,
    ptr::{NonNull, null_mut},
    time::Duration,
};

use libibverbs_sys::{
    IBV_QPT_RC, IBV_SEND_SIGNALED, IBV_WC_WITH_IMM, IBV_WR_RDMA_READ, IBV_WR_RDMA_WRITE,
    IBV_WR_RDMA_WRITE_WITH_IMM, IBV_WR_SEND, RDMA_PS_TCP, ibv_ack_cq_events, ibv_alloc_pd,
    ibv_comp_channel, ibv_context, ibv_cq, ibv_create_comp_channel, ibv_create_cq,
    ibv_dealloc_pd, ibv_dereg_mr, ibv_destroy_comp_channel, ibv_destroy_cq, ibv_get_cq_event,
    ibv_mr, ibv_pd, ibv_poll_cq, ibv_post_recv, ibv_post_send, ibv_qp, ibv_qp_cap,
    ibv_qp_init_attr, ibv_recv_wr, ibv_reg_mr, ibv_req_notify_cq, ibv_send_wr, ibv_sge, ibv_wc,
    rdma_accept, rdma_ack_cm_event, rdma_bind_addr, rdma_cm_event, rdma_cm_id, rdma_conn_param,
    rdma_connect, rdma_create_event_channel, rdma_create_id, rdma_create_qp,
    rdma_destroy_event_channel, rdma_destroy_id, rdma_destroy_qp, rdma_disconnect,
    rdma_event_channel, rdma_get_cm_event, rdma_listen, rdma_resolve_addr, rdma_resolve_route,
    sockaddr,
};
use tracing::trace;

use crate::{
    api::{AccessFlags, RegisteredRegion, WrId},
    error::{Result, VerbsError},
    provider::{
        CmEvent, CmEventKind, ConnParam, QpInitAttr, RdmaProvider, RecvWr, SendOpcode, SendWr,
        WorkCompletion,
    },
    verbs::verbs_util::{
        completion_opcode, completion_status, ibv_access, set_nonblocking, to_sockaddr,
        wait_readable,
    },
};

macro_rules! verbs_handle {
    ($($name:ident => $raw:ty),* $(,)?) => {
        $(
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct $name(NonNull<$raw>);

            // Handles are plain pointers; libibverbs and librdmacm calls are thread safe.
            unsafe impl Send for $name {}
            unsafe impl Sync for $name {}

            impl $name {
                pub fn as_ptr(self) -> *mut $raw {
                    self.0.as_ptr()
                }
            }
        )*
    };
}

verbs_handle!(
    VerbsEventChannel => rdma_event_channel,
    VerbsCmId => rdma_cm_id,
    VerbsContext => ibv_context,
    VerbsPd => ibv_pd,
    VerbsCompChannel => ibv_comp_channel,
    VerbsCq => ibv_cq,
    VerbsQp => ibv_qp,
    VerbsMr => ibv_mr,
);

fn check(ec: i32, context: &'static str) -> Result<()> {
    if ec != 0 {
        // librdmacm returns -1 and sets errno, libibverbs returns the errno.
        return Err(if ec < 0 {
            VerbsError::with_last_os_error(context)
        } else {
            VerbsError::with_code(ec, context)
        }
        .into());
    }
    Ok(())
}

fn non_null<T>(ptr: *mut T, context: &'static str) -> Result<NonNull<T>> {
    NonNull::new(ptr).ok_or_else(|| VerbsError::with_last_os_error(context).into())
}

fn conn_param(param: &ConnParam) -> rdma_conn_param {
    rdma_conn_param {
        initiator_depth: param.initiator_depth,
        responder_resources: param.responder_resources,
        retry_count: param.retry_count,
        rnr_retry_count: param.rnr_retry_count,
        ..Default::default()
    }
}

/// `RdmaProvider` over librdmacm and libibverbs.
///
/// Event and completion channels are switched to non-blocking mode so that
/// waits honour their timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerbsProvider;

impl RdmaProvider for VerbsProvider {
    type EventChannel = VerbsEventChannel;
    type CmId = VerbsCmId;
    type Context = VerbsContext;
    type Pd = VerbsPd;
    type CompChannel = VerbsCompChannel;
    type Cq = VerbsCq;
    type Qp = VerbsQp;
    type Mr = VerbsMr;

    fn create_event_channel(&self) -> Result<VerbsEventChannel> {
        let channel = non_null(
            unsafe { rdma_create_event_channel() },
            "rdma_create_event_channel",
        )?;
        let fd = unsafe { channel.as_ref() }.fd;
        if let Err(e) = set_nonblocking(fd, "fcntl: rdma event channel") {
            unsafe { rdma_destroy_event_channel(channel.as_ptr()) };
            return Err(e);
        }
        Ok(VerbsEventChannel(channel))
    }

    fn destroy_event_channel(&self, channel: VerbsEventChannel) {
        unsafe { rdma_destroy_event_channel(channel.as_ptr()) };
    }

    fn create_id(&self, channel: VerbsEventChannel) -> Result<VerbsCmId> {
        let mut id: *mut rdma_cm_id = null_mut();
        let ec = unsafe { rdma_create_id(channel.as_ptr(), &raw mut id, null_mut(), RDMA_PS_TCP) };
        check(ec, "rdma_create_id")?;
        Ok(VerbsCmId(non_null(id, "rdma_create_id")?))
    }

    fn destroy_id(&self, id: VerbsCmId) -> Result<()> {
        check(unsafe { rdma_destroy_id(id.as_ptr()) }, "rdma_destroy_id")
    }

    fn bind_addr(&self, id: VerbsCmId, addr: SocketAddr) -> Result<()> {
        let mut storage = to_sockaddr(&addr);
        let ec = unsafe { rdma_bind_addr(id.as_ptr(), &raw mut storage as *mut sockaddr) };
        check(ec, "rdma_bind_addr")
    }

    fn listen(&self, id: VerbsCmId, backlog: i32) -> Result<()> {
        check(unsafe { rdma_listen(id.as_ptr(), backlog) }, "rdma_listen")
    }

    fn resolve_addr(
        &self,
        id: VerbsCmId,
        src: Option<SocketAddr>,
        dst: SocketAddr,
        timeout: Duration,
    ) -> Result<()> {
        let mut src_storage = src.as_ref().map(to_sockaddr);
        let src_ptr = src_storage
            .as_mut()
            .map_or(null_mut(), |s| s as *mut libc::sockaddr_storage as *mut sockaddr);
        let mut dst_storage = to_sockaddr(&dst);
        let ec = unsafe {
            rdma_resolve_addr(
                id.as_ptr(),
                src_ptr,
                &raw mut dst_storage as *mut sockaddr,
                timeout.as_millis() as i32,
            )
        };
        check(ec, "rdma_resolve_addr")
    }

    fn resolve_route(&self, id: VerbsCmId, timeout: Duration) -> Result<()> {
        let ec = unsafe { rdma_resolve_route(id.as_ptr(), timeout.as_millis() as i32) };
        check(ec, "rdma_resolve_route")
    }

    fn connect(&self, id: VerbsCmId, param: &ConnParam) -> Result<()> {
        let mut param = conn_param(param);
        check(unsafe { rdma_connect(id.as_ptr(), &raw mut param) }, "rdma_connect")
    }

    fn accept(&self, id: VerbsCmId, param: &ConnParam) -> Result<()> {
        let mut param = conn_param(param);
        check(unsafe { rdma_accept(id.as_ptr(), &raw mut param) }, "rdma_accept")
    }

    fn disconnect(&self, id: VerbsCmId) -> Result<()> {
        check(unsafe { rdma_disconnect(id.as_ptr()) }, "rdma_disconnect")
    }

    fn get_cm_event(
        &self,
        channel: VerbsEventChannel,
        timeout: Duration,
    ) -> Result<Option<CmEvent<VerbsCmId>>> {
        let fd = unsafe { (*channel.as_ptr()).fd };
        if !wait_readable(fd, timeout, "poll: rdma event channel")? {
            return Ok(None);
        }
        let mut event: *mut rdma_cm_event = null_mut();
        if unsafe { rdma_get_cm_event(channel.as_ptr(), &raw mut event) } != 0 {
            let err = VerbsError::with_last_os_error("rdma_get_cm_event");
            if err.code.into_raw() == libc::EAGAIN {
                return Ok(None);
            }
            return Err(err.into());
        }

        // Copy out what the caller needs; the event is freed by the ack.
        let (kind, id, listen_id, status) = {
            let raw = unsafe { &*event };
            (
                CmEventKind::from(raw.event as u32),
                NonNull::new(raw.id).map(VerbsCmId),
                NonNull::new(raw.listen_id).map(VerbsCmId),
                raw.status,
            )
        };
        check(unsafe { rdma_ack_cm_event(event) }, "rdma_ack_cm_event")?;
        trace!(?kind, ?id, status, "rdma cm event");
        let id = id.ok_or_else(|| VerbsError::with_code(libc::EINVAL, "rdma cm event without id"))?;
        Ok(Some(CmEvent { kind, id, listen_id, status }))
    }

    fn cm_context(&self, id: VerbsCmId) -> Option<VerbsContext> {
        NonNull::new(unsafe { (*id.as_ptr()).verbs }).map(VerbsContext)
    }

    fn create_qp(&self, id: VerbsCmId, pd: VerbsPd, attr: &QpInitAttr<VerbsCq>) -> Result<VerbsQp> {
        let mut init_attr = ibv_qp_init_attr {
            send_cq: attr.send_cq.as_ptr(),
            recv_cq: attr.recv_cq.as_ptr(),
            cap: ibv_qp_cap {
                max_send_wr: attr.max_send_wr,
                max_recv_wr: attr.max_recv_wr,
                max_send_sge: attr.max_send_sge,
                max_recv_sge: attr.max_recv_sge,
                ..Default::default()
            },
            qp_type: IBV_QPT_RC,
            sq_sig_all: attr.sq_sig_all as i32,
            ..Default::default()
        };
        let ec = unsafe { rdma_create_qp(id.as_ptr(), pd.as_ptr(), &raw mut init_attr) };
        check(ec, "rdma_create_qp")?;
        Ok(VerbsQp(non_null(unsafe { (*id.as_ptr()).qp }, "rdma_create_qp")?))
    }

    fn destroy_qp(&self, id: VerbsCmId) {
        unsafe { rdma_destroy_qp(id.as_ptr()) };
    }

    fn alloc_pd(&self, context: VerbsContext) -> Result<VerbsPd> {
        Ok(VerbsPd(non_null(unsafe { ibv_alloc_pd(context.as_ptr()) }, "ibv_alloc_pd")?))
    }

    fn dealloc_pd(&self, pd: VerbsPd) -> Result<()> {
        check(unsafe { ibv_dealloc_pd(pd.as_ptr()) }, "ibv_dealloc_pd")
    }

    fn create_comp_channel(&self, context: VerbsContext) -> Result<VerbsCompChannel> {
        let channel = non_null(
            unsafe { ibv_create_comp_channel(context.as_ptr()) },
            "ibv_create_comp_channel",
        )?;
        let fd = unsafe { channel.as_ref() }.fd;
        if let Err(e) = set_nonblocking(fd, "fcntl: completion channel") {
            unsafe { ibv_destroy_comp_channel(channel.as_ptr()) };
            return Err(e);
        }
        Ok(VerbsCompChannel(channel))
    }

    fn destroy_comp_channel(&self, channel: VerbsCompChannel) -> Result<()> {
        check(unsafe { ibv_destroy_comp_channel(channel.as_ptr()) }, "ibv_destroy_comp_channel")
    }

    fn create_cq(
        &self,
        context: VerbsContext,
        depth: u32,
        channel: VerbsCompChannel,
    ) -> Result<VerbsCq> {
        let cq = unsafe {
            ibv_create_cq(context.as_ptr(), depth as i32, null_mut(), channel.as_ptr(), 0)
        };
        Ok(VerbsCq(non_null(cq, "ibv_create_cq")?))
    }

    fn destroy_cq(&self, cq: VerbsCq) -> Result<()> {
        check(unsafe { ibv_destroy_cq(cq.as_ptr()) }, "ibv_destroy_cq")
    }

    fn req_notify_cq(&self, cq: VerbsCq) -> Result<()> {
        check(unsafe { ibv_req_notify_cq(cq.as_ptr(), 0) }, "ibv_req_notify_cq")
    }

    fn get_cq_event(&self, channel: VerbsCompChannel, timeout: Duration) -> Result<Option<VerbsCq>> {
        let fd = unsafe { (*channel.as_ptr()).fd };
        if !wait_readable(fd, timeout, "poll: completion channel")? {
            return Ok(None);
        }
        let mut cq: *mut ibv_cq = null_mut();
        let mut cq_context = null_mut();
        let ec = unsafe { ibv_get_cq_event(channel.as_ptr(), &raw mut cq, &raw mut cq_context) };
        if ec != 0 {
            let err = VerbsError::with_last_os_error("ibv_get_cq_event");
            if err.code.into_raw() == libc::EAGAIN {
                return Ok(None);
            }
            return Err(err.into());
        }
        Ok(NonNull::new(cq).map(VerbsCq))
    }

    fn ack_cq_events(&self, cq: VerbsCq, count: u32) {
        unsafe { ibv_ack_cq_events(cq.as_ptr(), count) };
    }

    fn poll_cq(&self, cq: VerbsCq) -> Result<Option<WorkCompletion>> {
        let mut wc = MaybeUninit::<ibv_wc>::zeroed();
        let ret = unsafe { ibv_poll_cq(cq.as_ptr(), 1, wc.as_mut_ptr()) };
        if ret < 0 {
            return Err(VerbsError::with_code(-ret, "ibv_poll_cq").into());
        }
        if ret == 0 {
            return Ok(None);
        }
        let wc = unsafe { wc.assume_init() };
        let imm_data = (wc.wc_flags & IBV_WC_WITH_IMM != 0)
            .then(|| u32::from_be(unsafe { wc.__bindgen_anon_1.imm_data }));
        Ok(Some(WorkCompletion {
            wr_id: WrId(wc.wr_id),
            status: completion_status(wc.status),
            opcode: completion_opcode(wc.opcode),
            byte_len: wc.byte_len,
            imm_data,
            qp_num: wc.qp_num,
        }))
    }

    unsafe fn reg_mr(
        &self,
        pd: VerbsPd,
        ptr: NonNull<u8>,
        len: usize,
        access: AccessFlags,
    ) -> Result<(VerbsMr, RegisteredRegion)> {
        let mr = unsafe { ibv_reg_mr(pd.as_ptr(), ptr.as_ptr().cast(), len, ibv_access(access)) };
        let mr = non_null(mr, "ibv_reg_mr")?;
        let raw = unsafe { mr.as_ref() };
        let region = RegisteredRegion {
            addr: ptr.as_ptr() as u64,
            length: len as u64,
            lkey: raw.lkey,
            rkey: raw.rkey,
        };
        Ok((VerbsMr(mr), region))
    }

    fn dereg_mr(&self, mr: VerbsMr) -> Result<()> {
        check(unsafe { ibv_dereg_mr(mr.as_ptr()) }, "ibv_dereg_mr")
    }

    fn post_send(&self, qp: VerbsQp, wr: &SendWr) -> Result<()> {
        let mut sge = ibv_sge { addr: wr.sge.addr, length: wr.sge.length, lkey: wr.sge.lkey };
        let (opcode, imm) = match wr.opcode {
            SendOpcode::Send => (IBV_WR_SEND, 0),
            SendOpcode::RdmaWrite => (IBV_WR_RDMA_WRITE, 0),
            SendOpcode::RdmaWriteWithImm(imm) => (IBV_WR_RDMA_WRITE_WITH_IMM, imm.to_be()),
            SendOpcode::RdmaRead => (IBV_WR_RDMA_READ, 0),
        };
        let mut send_wr = ibv_send_wr {
            wr_id: wr.wr_id.0,
            next: null_mut(),
            sg_list: &raw mut sge,
            num_sge: 1,
            opcode,
            send_flags: if wr.signaled { IBV_SEND_SIGNALED } else { 0 },
            ..Default::default()
        };
        send_wr.__bindgen_anon_1.imm_data = imm;
        if let Some(remote) = wr.remote {
            send_wr.wr.rdma.remote_addr = remote.addr;
            send_wr.wr.rdma.rkey = remote.rkey;
        }
        let mut bad_wr = null_mut();
        let ec = unsafe { ibv_post_send(qp.as_ptr(), &raw mut send_wr, &raw mut bad_wr) };
        check(ec, "ibv_post_send")
    }

    fn post_recv(&self, qp: VerbsQp, wr: &RecvWr) -> Result<()> {
        let mut sge = ibv_sge { addr: wr.sge.addr, length: wr.sge.length, lkey: wr.sge.lkey };
        let mut recv_wr =
            ibv_recv_wr { wr_id: wr.wr_id.0, next: null_mut(), sg_list: &raw mut sge, num_sge: 1 };
        let mut bad_wr = null_mut();
        let ec = unsafe { ibv_post_recv(qp.as_ptr(), &raw mut recv_wr, &raw mut bad_wr) };
        check(ec, "ibv_post_recv")
    }
}
