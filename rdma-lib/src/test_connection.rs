use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{
    ClientState, Connection, ConnectionConfig, ConnectionManager, ConnectionStopper,
    EnvironmentParams, MetaMessage, RdmaLibError, ResolveStage, Result, RoleState, ServerState,
    api::{MemoryRegionDescriptor, RegisteredRegion, TransferKind, TransferRequest},
    loopback::{FabricOp, LoopbackFabric},
    provider::{CmEventKind, CompletionOpcode, CompletionStatus},
};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const WAIT: Duration = Duration::from_secs(5);
const BLOCK: u64 = 64 << 10;

type Manager = Arc<ConnectionManager<LoopbackFabric>>;
type Finished = JoinHandle<(Result<()>, RoleState)>;

fn config() -> ConnectionConfig {
    ConnectionConfig {
        queue_depth: 16,
        resolve_timeout_ms: 10,
        event_poll_interval_ms: 10,
        block_length: BLOCK,
        max_memory: 1 << 20,
        exposed_blocks: 1,
        ..Default::default()
    }
}

fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn spawn(mut conn: Connection<LoopbackFabric>) -> Finished {
    std::thread::spawn(move || {
        let ret = conn.run();
        (ret, conn.role_state())
    })
}

fn server(fabric: &LoopbackFabric, port: u16) -> Connection<LoopbackFabric> {
    Connection::new(fabric.clone(), EnvironmentParams::server(port), config()).unwrap()
}

fn client(fabric: &LoopbackFabric, port: u16) -> Connection<LoopbackFabric> {
    Connection::new(fabric.clone(), EnvironmentParams::client(LOCALHOST, port), config()).unwrap()
}

struct Peer {
    manager: Manager,
    stopper: ConnectionStopper<LoopbackFabric>,
    thread: Finished,
}

impl Peer {
    fn start(conn: Connection<LoopbackFabric>) -> Self {
        Peer { manager: conn.manager(), stopper: conn.stopper(), thread: spawn(conn) }
    }

    fn finish(self) -> (Result<()>, RoleState) {
        self.thread.join().unwrap()
    }

    fn block(&self) -> RegisteredRegion {
        self.manager.memory().unwrap().get_pinned_mr(0, BLOCK, true).unwrap()
    }

    fn peer_block(&self) -> MemoryRegionDescriptor {
        match self.manager.recv_meta(WAIT) {
            Some(MetaMessage::MemoryRegion(desc)) => desc,
            other => panic!("expected a memory region descriptor, got {other:?}"),
        }
    }
}

fn connect_pair(fabric: &LoopbackFabric, port: u16) -> (Peer, Peer) {
    let server = Peer::start(server(fabric, port));
    assert!(wait_until(|| fabric.is_listening(SocketAddr::new(LOCALHOST, port))));
    let client = Peer::start(client(fabric, port));
    assert!(wait_until(|| server.manager.is_connected() && client.manager.is_connected()));
    (server, client)
}

fn assert_released(fabric: &LoopbackFabric) {
    assert_eq!(fabric.live_mrs(), 0);
    assert_eq!(fabric.live_qps(), 0);
    assert_eq!(fabric.live_cm_ids(), 0);
}

fn count(fabric: &LoopbackFabric, pred: impl Fn(&FabricOp) -> bool) -> usize {
    fabric.journal().iter().filter(|op| pred(op)).count()
}

#[test]
fn test_handshake_exchanges_memory_descriptors() {
    let fabric = LoopbackFabric::new();
    let (server, client) = connect_pair(&fabric, 7000);

    assert_eq!(client.peer_block(), server.block().descriptor());
    assert_eq!(server.peer_block(), client.block().descriptor());
    assert!(wait_until(|| server.manager.stats().meta_sent == 1));
    assert!(wait_until(|| client.manager.stats().meta_sent == 1));
    assert_eq!(server.manager.stats().meta_received, 1);
    assert_eq!(client.manager.stats().meta_received, 1);
    assert_eq!(server.manager.stats().errors, 0);

    client.stopper.stop().unwrap();
    let (ret, state) = client.finish();
    ret.unwrap();
    assert_eq!(state, RoleState::Client(ClientState::Disconnected));
    let (ret, state) = server.finish();
    ret.unwrap();
    assert_eq!(state, RoleState::Server(ServerState::Disconnected));
    assert_released(&fabric);
}

#[test]
fn test_rdma_write_read_and_immediate() {
    let fabric = LoopbackFabric::new();
    let (server, client) = connect_pair(&fabric, 7001);
    let remote = client.peer_block();
    let local = client.block();
    let server_memory = server.manager.memory().unwrap();
    let client_memory = client.manager.memory().unwrap();

    let (imm_tx, imm_rx) = crossbeam_channel::unbounded();
    server.manager.set_completion_callback(Box::new(move |wc| {
        if wc.opcode == CompletionOpcode::RecvRdmaWithImm {
            let _ = imm_tx.send(wc.imm_data);
        }
    }));

    client_memory.write_block(0, 0, b"hello rdma").unwrap();
    let write = TransferRequest {
        dst: remote,
        dst_offset: 128,
        src: local,
        local_addr: local.addr,
        length: 10,
        kind: TransferKind::Write,
        correlation: 7,
    };
    client.manager.rdma_write(&write).unwrap();
    assert!(wait_until(|| client.manager.stats().rdma_writes == 1));
    assert_eq!(server_memory.read_block(0, 128, 10).unwrap(), b"hello rdma");

    server_memory.write_block(0, 4096, b"from server").unwrap();
    let read = TransferRequest {
        dst_offset: 4096,
        local_addr: local.addr + 1024,
        length: 11,
        kind: TransferKind::Read,
        correlation: 8,
        ..write
    };
    client.manager.rdma_read(&read).unwrap();
    assert!(wait_until(|| client.manager.stats().rdma_reads == 1));
    assert_eq!(client_memory.read_block(0, 1024, 11).unwrap(), b"from server");

    let with_imm = TransferRequest { kind: TransferKind::WriteWithImm(0xfeed), ..write };
    client.manager.rdma_write(&with_imm).unwrap();
    assert_eq!(imm_rx.recv_timeout(WAIT).unwrap(), Some(0xfeed));
    assert!(wait_until(|| server.manager.stats().imm_received == 1));

    drop((server_memory, client_memory));
    server.stopper.stop().unwrap();
    server.finish().0.unwrap();
    client.finish().0.unwrap();
    assert_released(&fabric);
}

#[test]
fn test_out_of_bounds_transfer_is_rejected() {
    let fabric = LoopbackFabric::new();
    let (server, client) = connect_pair(&fabric, 7002);
    let remote = client.peer_block();
    let local = client.block();

    let req = TransferRequest {
        dst: remote,
        dst_offset: BLOCK - 4,
        src: local,
        local_addr: local.addr,
        length: 8,
        kind: TransferKind::Write,
        correlation: 1,
    };
    assert!(matches!(
        client.manager.rdma_write(&req),
        Err(RdmaLibError::OutOfBounds { offset, length: 8, .. }) if offset == BLOCK - 4
    ));
    assert_eq!(client.manager.stats().rdma_writes, 0);

    client.stopper.stop().unwrap();
    client.finish().0.unwrap();
    server.finish().0.unwrap();
}

#[test]
fn test_address_retries_exhausted() {
    let fabric = LoopbackFabric::new();
    fabric.inject_addr_errors(5);
    let mut conn = client(&fabric, 7003);

    let ret = conn.run();
    assert!(matches!(
        ret,
        Err(RdmaLibError::ResolveRetriesExhausted { stage: ResolveStage::Address, attempts: 5 })
    ));
    assert_eq!(conn.role_state(), RoleState::Client(ClientState::AddressResolving));
    assert_eq!(count(&fabric, |op| matches!(op, FabricOp::ResolveAddr(_))), 5);
    assert_eq!(count(&fabric, |op| matches!(op, FabricOp::ResolveRoute(_))), 0);
    assert_eq!(count(&fabric, |op| matches!(op, FabricOp::AllocPd(_))), 0);
    assert_released(&fabric);
}

#[test]
fn test_route_retries_exhausted_releases_resources() {
    let fabric = LoopbackFabric::new();
    fabric.inject_route_errors(5);
    let mut conn = client(&fabric, 7004);

    let ret = conn.run();
    assert!(matches!(
        ret,
        Err(RdmaLibError::ResolveRetriesExhausted { stage: ResolveStage::Route, .. })
    ));
    assert_eq!(count(&fabric, |op| matches!(op, FabricOp::ResolveRoute(_))), 5);
    assert_eq!(count(&fabric, |op| matches!(op, FabricOp::DeallocPd(_))), 1);
    assert_released(&fabric);
}

#[test]
fn test_transient_resolution_errors_share_budget() {
    let fabric = LoopbackFabric::new();
    fabric.inject_addr_errors(2);
    fabric.inject_route_errors(2);
    let (server, client) = connect_pair(&fabric, 7005);
    assert_eq!(count(&fabric, |op| matches!(op, FabricOp::ResolveAddr(_))), 3);
    assert_eq!(count(&fabric, |op| matches!(op, FabricOp::ResolveRoute(_))), 3);

    client.stopper.stop().unwrap();
    client.finish().0.unwrap();
    server.finish().0.unwrap();
}

#[test]
fn test_connect_without_listener_fails() {
    let fabric = LoopbackFabric::new();
    let mut conn = client(&fabric, 7006);

    let ret = conn.run();
    assert!(matches!(
        ret,
        Err(RdmaLibError::UnexpectedEvent { kind: CmEventKind::Rejected, .. })
    ));
    assert_eq!(conn.role_state(), RoleState::Client(ClientState::RouteResolved));
    assert_released(&fabric);
}

#[test]
fn test_cancel_listening_server() {
    let fabric = LoopbackFabric::new();
    let addr = SocketAddr::new(LOCALHOST, 7007);
    let server = Peer::start(server(&fabric, 7007));
    assert!(wait_until(|| fabric.is_listening(addr)));

    server.stopper.cancel();
    let (ret, state) = server.finish();
    ret.unwrap();
    assert_eq!(state, RoleState::Server(ServerState::Listening));
    assert!(!fabric.is_listening(addr));
    assert_released(&fabric);
}

#[test]
fn test_second_listener_on_port_fails() {
    let fabric = LoopbackFabric::new();
    let first = Peer::start(server(&fabric, 7008));
    assert!(wait_until(|| fabric.is_listening(SocketAddr::new(LOCALHOST, 7008))));

    let mut second = server(&fabric, 7008);
    assert!(matches!(second.run(), Err(RdmaLibError::Verbs(_))));

    first.stopper.cancel();
    first.finish().0.unwrap();
    assert_released(&fabric);
}

#[test]
fn test_full_send_queue_rejects_post() {
    let fabric = LoopbackFabric::new();
    let (server, client) = connect_pair(&fabric, 7009);
    let remote = client.peer_block();
    let local = client.block();
    assert!(wait_until(|| client.manager.stats().meta_sent == 1));

    // Park the poller on the first write so later completions stay queued.
    let (parked_tx, parked_rx) = crossbeam_channel::bounded(1);
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
    client.manager.set_completion_callback(Box::new(move |wc| {
        if wc.wr_id.correlation() == 0 {
            let _ = parked_tx.send(());
            let _ = release_rx.recv_timeout(WAIT);
        }
    }));

    let write = TransferRequest {
        dst: remote,
        dst_offset: 0,
        src: local,
        local_addr: local.addr,
        length: 64,
        kind: TransferKind::Write,
        correlation: 0,
    };
    client.manager.rdma_write(&write).unwrap();
    parked_rx.recv_timeout(WAIT).unwrap();

    let depth = config().queue_depth;
    for correlation in 1..=depth {
        client.manager.rdma_write(&TransferRequest { correlation, ..write }).unwrap();
    }
    let ret = client.manager.rdma_write(&TransferRequest { correlation: depth + 1, ..write });
    assert!(matches!(
        ret,
        Err(RdmaLibError::Verbs(ref e)) if e.code.into_raw() == libc::ENOMEM
    ));
    let read = TransferRequest { kind: TransferKind::Read, correlation: depth + 2, ..write };
    assert!(matches!(
        client.manager.rdma_read(&read),
        Err(RdmaLibError::Verbs(ref e)) if e.code.into_raw() == libc::ENOMEM
    ));

    release_tx.send(()).unwrap();
    let posted = u64::from(depth) + 1;
    assert!(wait_until(|| client.manager.stats().rdma_writes == posted));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(client.manager.stats().rdma_writes, posted);
    assert_eq!(client.manager.stats().rdma_reads, 0);
    assert_eq!(client.manager.stats().errors, 0);
    assert!(client.manager.is_connected());

    client.stopper.stop().unwrap();
    client.finish().0.unwrap();
    server.finish().0.unwrap();
    assert_released(&fabric);
}

#[test]
fn test_failed_completion_keeps_connection() {
    let fabric = LoopbackFabric::new();
    let (server, client) = connect_pair(&fabric, 7010);
    let remote = client.peer_block();
    let local = client.block();

    let (status_tx, status_rx) = crossbeam_channel::unbounded();
    client.manager.set_completion_callback(Box::new(move |wc| {
        if wc.opcode == CompletionOpcode::RdmaWrite {
            let _ = status_tx.send((wc.wr_id.correlation(), wc.status));
        }
    }));

    let bad = TransferRequest {
        dst: MemoryRegionDescriptor { rkey: remote.rkey.wrapping_add(1), ..remote },
        dst_offset: 0,
        src: local,
        local_addr: local.addr,
        length: 32,
        kind: TransferKind::Write,
        correlation: 1,
    };
    client.manager.rdma_write(&bad).unwrap();
    assert_eq!(
        status_rx.recv_timeout(WAIT).unwrap(),
        (1, CompletionStatus::RemoteAccessError)
    );
    assert!(wait_until(|| client.manager.stats().errors == 1));
    assert_eq!(client.manager.stats().rdma_writes, 0);
    assert!(client.manager.is_connected());
    assert!(server.manager.is_connected());

    let good = TransferRequest { dst: remote, correlation: 2, ..bad };
    client.manager.rdma_write(&good).unwrap();
    assert_eq!(status_rx.recv_timeout(WAIT).unwrap(), (2, CompletionStatus::Success));
    assert!(wait_until(|| client.manager.stats().rdma_writes == 1));
    assert_eq!(client.manager.stats().errors, 1);

    client.stopper.stop().unwrap();
    client.finish().0.unwrap();
    server.finish().0.unwrap();
    assert_released(&fabric);
}
