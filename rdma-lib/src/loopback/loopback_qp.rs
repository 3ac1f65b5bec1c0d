use std::collections::VecDeque;

use tracing::{debug, error};

use crate::{
    api::AccessFlags,
    provider::{
        CompletionOpcode, CompletionStatus, RecvWr, RemoteTarget, SendOpcode, SendWr, Sge,
        WorkCompletion,
    },
};

use super::loopback_fabric::{FabricState, LoopbackCompChannel, LoopbackCq, LoopbackPd, LoopbackQp};

pub(super) struct QpEntry {
    pub pd: LoopbackPd,
    pub send_cq: LoopbackCq,
    pub recv_cq: LoopbackCq,
    pub qp_num: u32,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub outstanding_sends: u32,
    pub recv_queue: VecDeque<RecvWr>,
    pub peer: Option<LoopbackQp>,
}

pub(super) struct CqEntry {
    pub channel: LoopbackCompChannel,
    pub depth: u32,
    pub entries: VecDeque<WorkCompletion>,
    pub armed: bool,
}

pub(super) struct MrEntry {
    pub pd: LoopbackPd,
    pub addr: u64,
    pub length: u64,
    pub access: AccessFlags,
}

impl MrEntry {
    fn covers(&self, addr: u64, length: u64) -> bool {
        addr >= self.addr
            && addr.checked_add(length).is_some_and(|end| end <= self.addr + self.length)
    }
}

/// What a send work request does on the responder side.
struct RemoteEffect {
    peer_qp: LoopbackQp,
    completion: Option<(RecvWr, CompletionOpcode, Option<u32>)>,
}

impl FabricState {
    fn local_region_ok(&self, pd: LoopbackPd, sge: &Sge, need: AccessFlags) -> bool {
        self.mrs.iter().any(|(mr, entry)| {
            mr.key() == sge.lkey
                && entry.pd == pd
                && entry.access.contains(need)
                && entry.covers(sge.addr, sge.length as u64)
        })
    }

    fn remote_region_ok(
        &self,
        pd: LoopbackPd,
        addr: u64,
        length: u64,
        rkey: u32,
        need: AccessFlags,
    ) -> bool {
        self.mrs.iter().any(|(mr, entry)| {
            mr.key() == rkey
                && entry.pd == pd
                && entry.access.contains(need)
                && entry.covers(addr, length)
        })
    }

    /// Executes `wr` synchronously and queues the resulting completions.
    ///
    /// Returns `Err(reason)` when the post itself is rejected.
    pub(super) fn execute_send(
        &mut self,
        qp: LoopbackQp,
        wr: &SendWr,
    ) -> Result<(), (i32, &'static str)> {
        let entry = self.qps.get(&qp).ok_or((libc::EINVAL, "post_send: unknown qp"))?;
        let peer_qp = entry.peer.ok_or((libc::EINVAL, "post_send: qp not connected"))?;
        if entry.outstanding_sends >= entry.max_send_wr {
            return Err((libc::ENOMEM, "post_send: send queue full"));
        }
        let (pd, send_cq, qp_num) = (entry.pd, entry.send_cq, entry.qp_num);
        let peer = self.qps.get(&peer_qp).ok_or((libc::EINVAL, "post_send: peer qp gone"))?;
        let peer_pd = peer.pd;
        let peer_next_recv = peer.recv_queue.front().copied();
        let length = wr.sge.length as u64;

        let (local_opcode, status, effect) = match wr.opcode {
            SendOpcode::Send => {
                let status = if !self.local_region_ok(pd, &wr.sge, AccessFlags::NONE) {
                    CompletionStatus::LocalProtectionError
                } else {
                    match peer_next_recv {
                        None => CompletionStatus::RnrRetryExceeded,
                        Some(recv)
                            if recv.sge.length < wr.sge.length
                                || !self.local_region_ok(
                                    peer_pd,
                                    &recv.sge,
                                    AccessFlags::LOCAL_WRITE,
                                ) =>
                        {
                            CompletionStatus::RemoteOperationError
                        }
                        Some(recv) => {
                            unsafe { copy(wr.sge.addr, recv.sge.addr, length) };
                            CompletionStatus::Success
                        }
                    }
                };
                let completion = status
                    .is_success()
                    .then(|| peer_next_recv.map(|r| (r, CompletionOpcode::Recv, None)))
                    .flatten();
                (CompletionOpcode::Send, status, RemoteEffect { peer_qp, completion })
            }
            SendOpcode::RdmaWrite | SendOpcode::RdmaWriteWithImm(_) => {
                let remote = rdma_target(wr)?;
                let imm = match wr.opcode {
                    SendOpcode::RdmaWriteWithImm(imm) => Some(imm),
                    _ => None,
                };
                let status = if !self.local_region_ok(pd, &wr.sge, AccessFlags::NONE) {
                    CompletionStatus::LocalProtectionError
                } else if !self.remote_region_ok(
                    peer_pd,
                    remote.addr,
                    length,
                    remote.rkey,
                    AccessFlags::REMOTE_WRITE,
                ) {
                    CompletionStatus::RemoteAccessError
                } else if imm.is_some() && peer_next_recv.is_none() {
                    CompletionStatus::RnrRetryExceeded
                } else {
                    unsafe { copy(wr.sge.addr, remote.addr, length) };
                    CompletionStatus::Success
                };
                let completion = match (status.is_success(), imm, peer_next_recv) {
                    (true, Some(imm), Some(recv)) => {
                        Some((recv, CompletionOpcode::RecvRdmaWithImm, Some(imm)))
                    }
                    _ => None,
                };
                (CompletionOpcode::RdmaWrite, status, RemoteEffect { peer_qp, completion })
            }
            SendOpcode::RdmaRead => {
                let remote = rdma_target(wr)?;
                let status = if !self.local_region_ok(pd, &wr.sge, AccessFlags::LOCAL_WRITE) {
                    CompletionStatus::LocalProtectionError
                } else if !self.remote_region_ok(
                    peer_pd,
                    remote.addr,
                    length,
                    remote.rkey,
                    AccessFlags::REMOTE_READ,
                ) {
                    CompletionStatus::RemoteAccessError
                } else {
                    unsafe { copy(remote.addr, wr.sge.addr, length) };
                    CompletionStatus::Success
                };
                (CompletionOpcode::RdmaRead, status, RemoteEffect { peer_qp, completion: None })
            }
        };

        if let Some((recv, opcode, imm_data)) = effect.completion
            && let Some(peer) = self.qps.get_mut(&effect.peer_qp)
        {
            peer.recv_queue.pop_front();
            let (recv_cq, peer_qp_num) = (peer.recv_cq, peer.qp_num);
            self.push_completion(
                recv_cq,
                WorkCompletion {
                    wr_id: recv.wr_id,
                    status: CompletionStatus::Success,
                    opcode,
                    byte_len: wr.sge.length,
                    imm_data,
                    qp_num: peer_qp_num,
                },
            );
        }

        // Failed requests always complete, successful ones only when signaled.
        if wr.signaled || !status.is_success() {
            if let Some(entry) = self.qps.get_mut(&qp) {
                entry.outstanding_sends += 1;
            }
            self.push_completion(
                send_cq,
                WorkCompletion {
                    wr_id: wr.wr_id,
                    status,
                    opcode: local_opcode,
                    byte_len: wr.sge.length,
                    imm_data: None,
                    qp_num,
                },
            );
        }
        debug!(?qp, wr_id = wr.wr_id.0, opcode = ?wr.opcode, ?status, "loopback post_send");
        Ok(())
    }

    pub(super) fn push_completion(&mut self, cq: LoopbackCq, wc: WorkCompletion) {
        let Some(entry) = self.cqs.get_mut(&cq) else {
            error!(?cq, wr_id = wc.wr_id.0, "Completion for destroyed cq dropped");
            return;
        };
        if entry.entries.len() >= entry.depth as usize {
            error!(?cq, wr_id = wc.wr_id.0, "Completion queue overrun");
            return;
        }
        entry.entries.push_back(wc);
        if entry.armed {
            entry.armed = false;
            if let Some(channel) = self.comp_channels.get(&entry.channel) {
                let _ = channel.tx.send(cq);
            }
        }
    }

    pub(super) fn pop_completion(&mut self, cq: LoopbackCq) -> Option<WorkCompletion> {
        let wc = self.cqs.get_mut(&cq)?.entries.pop_front()?;
        if matches!(
            wc.opcode,
            CompletionOpcode::Send | CompletionOpcode::RdmaWrite | CompletionOpcode::RdmaRead
        ) && let Some(qp) = self.qps.values_mut().find(|qp| qp.qp_num == wc.qp_num)
        {
            qp.outstanding_sends = qp.outstanding_sends.saturating_sub(1);
        }
        Some(wc)
    }

    pub(super) fn enqueue_recv(
        &mut self,
        qp: LoopbackQp,
        wr: &RecvWr,
    ) -> Result<(), (i32, &'static str)> {
        let entry = self.qps.get_mut(&qp).ok_or((libc::EINVAL, "post_recv: unknown qp"))?;
        if entry.recv_queue.len() >= entry.max_recv_wr as usize {
            return Err((libc::ENOMEM, "post_recv: receive queue full"));
        }
        entry.recv_queue.push_back(*wr);
        Ok(())
    }
}

fn rdma_target(wr: &SendWr) -> Result<RemoteTarget, (i32, &'static str)> {
    wr.remote.ok_or((libc::EINVAL, "post_send: rdma opcode without remote target"))
}

/// # Safety
///
/// Both ranges must lie inside live registered regions.
unsafe fn copy(src: u64, dst: u64, len: u64) {
    unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, len as usize) };
}
