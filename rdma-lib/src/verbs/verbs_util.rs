use std::{net::SocketAddr, os::fd::RawFd, time::Duration};

use libibverbs_sys::{
    IBV_ACCESS_LOCAL_WRITE, IBV_ACCESS_REMOTE_READ, IBV_ACCESS_REMOTE_WRITE, IBV_WC_LOC_LEN_ERR,
    IBV_WC_LOC_PROT_ERR, IBV_WC_RDMA_READ, IBV_WC_RDMA_WRITE, IBV_WC_RECV,
    IBV_WC_RECV_RDMA_WITH_IMM, IBV_WC_REM_ACCESS_ERR, IBV_WC_REM_OP_ERR, IBV_WC_RETRY_EXC_ERR,
    IBV_WC_RNR_RETRY_EXC_ERR, IBV_WC_SEND, IBV_WC_SUCCESS, IBV_WC_WR_FLUSH_ERR,
};

use crate::{
    api::AccessFlags,
    error::{Result, VerbsError},
    provider::{CompletionOpcode, CompletionStatus},
};

pub fn to_sockaddr(addr: &SocketAddr) -> libc::sockaddr_storage {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) },
                sin_zero: [0; 8],
            };
            unsafe { std::ptr::write(&raw mut storage as *mut libc::sockaddr_in, sin) };
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe { std::ptr::write(&raw mut storage as *mut libc::sockaddr_in6, sin6) };
        }
    }
    storage
}

pub fn set_nonblocking(fd: RawFd, context: &'static str) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(VerbsError::with_last_os_error(context).into());
    }
    Ok(())
}

/// Waits up to `timeout` for `fd` to become readable. Interrupts count as a timeout.
pub fn wait_readable(fd: RawFd, timeout: Duration, context: &'static str) -> Result<bool> {
    let mut pollfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    let ret = unsafe { libc::poll(&raw mut pollfd, 1, timeout_ms) };
    if ret < 0 {
        let err = VerbsError::with_last_os_error(context);
        if err.code.into_raw() == libc::EINTR {
            return Ok(false);
        }
        return Err(err.into());
    }
    Ok(ret > 0 && pollfd.revents & libc::POLLIN != 0)
}

pub fn ibv_access(access: AccessFlags) -> i32 {
    let mut flags = 0;
    if access.contains(AccessFlags::LOCAL_WRITE) {
        flags |= IBV_ACCESS_LOCAL_WRITE;
    }
    if access.contains(AccessFlags::REMOTE_WRITE) {
        flags |= IBV_ACCESS_REMOTE_WRITE;
    }
    if access.contains(AccessFlags::REMOTE_READ) {
        flags |= IBV_ACCESS_REMOTE_READ;
    }
    flags as i32
}

pub fn completion_status(status: u32) -> CompletionStatus {
    match status {
        IBV_WC_SUCCESS => CompletionStatus::Success,
        IBV_WC_LOC_LEN_ERR => CompletionStatus::LocalLengthError,
        IBV_WC_LOC_PROT_ERR => CompletionStatus::LocalProtectionError,
        IBV_WC_WR_FLUSH_ERR => CompletionStatus::WrFlushError,
        IBV_WC_REM_ACCESS_ERR => CompletionStatus::RemoteAccessError,
        IBV_WC_REM_OP_ERR => CompletionStatus::RemoteOperationError,
        IBV_WC_RETRY_EXC_ERR => CompletionStatus::RetryExceeded,
        IBV_WC_RNR_RETRY_EXC_ERR => CompletionStatus::RnrRetryExceeded,
        other => CompletionStatus::Other(other),
    }
}

pub fn completion_opcode(opcode: u32) -> CompletionOpcode {
    match opcode {
        IBV_WC_SEND => CompletionOpcode::Send,
        IBV_WC_RDMA_WRITE => CompletionOpcode::RdmaWrite,
        IBV_WC_RDMA_READ => CompletionOpcode::RdmaRead,
        IBV_WC_RECV => CompletionOpcode::Recv,
        IBV_WC_RECV_RDMA_WITH_IMM => CompletionOpcode::RecvRdmaWithImm,
        other => CompletionOpcode::Other(other),
    }
}
