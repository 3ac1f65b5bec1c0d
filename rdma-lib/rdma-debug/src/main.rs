use std::{
    net::IpAddr,
    sync::mpsc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{Context, anyhow, bail, ensure};
use clap::Parser;
use logging_lib::LoggingOpts;
use rdma_lib::{
    CompletionStatus, Connection, ConnectionConfig, ConnectionManager, DEFAULT_PORT,
    DEFAULT_QUEUE_DEPTH, EnvironmentParams, MetaMessage, RdmaProvider, Role,
    api::{TransferKind, TransferRequest},
};
use tracing::info;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(10);
const PATTERN_LEN: u64 = 4096;

#[derive(Debug, Parser)]
#[command(about = "Connect two RDMA endpoints and verify reads and writes between them")]
struct Cli {
    /// RDMA device, e.g. mlx5_0. The connection manager picks one when unset.
    #[arg(long = "ib-dev")]
    ib_dev: Option<String>,

    #[arg(long = "ib-port", default_value_t = 1)]
    ib_port: u8,

    /// Server address. Required for the client.
    #[arg(long = "dest-ip")]
    dest_ip: Option<IpAddr>,

    #[arg(long = "source-ip")]
    source_ip: Option<IpAddr>,

    #[arg(long = "dest-port", default_value_t = DEFAULT_PORT)]
    dest_port: u16,

    #[arg(long, conflicts_with = "client")]
    server: bool,

    #[arg(long)]
    client: bool,

    #[arg(long, default_value_t = DEFAULT_QUEUE_DEPTH)]
    queue_depth: u32,

    /// Pinned blocks each side exposes for remote access.
    #[arg(long, default_value_t = 1)]
    exposed_blocks: usize,

    /// Run both roles on the in-process loopback fabric instead of a device.
    #[arg(long)]
    loopback: bool,

    #[command(flatten)]
    logging: LoggingOpts,
}

impl Cli {
    fn role(&self) -> Role {
        if self.client || (!self.server && self.dest_ip.is_some()) {
            Role::Client
        } else {
            Role::Server
        }
    }

    fn params(&self, role: Role) -> anyhow::Result<EnvironmentParams> {
        let mut params = match role {
            Role::Server => EnvironmentParams::server(self.dest_port),
            Role::Client => EnvironmentParams::client(
                self.dest_ip.context("--dest-ip is required for the client")?,
                self.dest_port,
            ),
        };
        params.device_name = self.ib_dev.clone();
        params.ib_port = self.ib_port;
        params.source_addr = self.source_ip;
        params.validate()?;
        Ok(params)
    }

    fn config(&self) -> ConnectionConfig {
        ConnectionConfig {
            queue_depth: self.queue_depth,
            exposed_blocks: self.exposed_blocks,
            ..Default::default()
        }
    }
}

fn wait_for_completion(
    rx: &mpsc::Receiver<(u32, CompletionStatus)>,
    correlation: u32,
) -> anyhow::Result<()> {
    loop {
        let (seen, status) = rx
            .recv_timeout(COMPLETION_TIMEOUT)
            .map_err(|_| anyhow!("no completion for request {correlation}"))?;
        if seen != correlation {
            continue;
        }
        ensure!(status.is_success(), "request {correlation} failed: {status:?}");
        return Ok(());
    }
}

/// Writes a pattern into the peer's first block, reads it back and checks it,
/// then rings the peer with a write-with-immediate.
fn exercise<P: RdmaProvider>(manager: &ConnectionManager<P>) -> anyhow::Result<()> {
    let remote = match manager.recv_meta(CONNECT_TIMEOUT) {
        Some(MetaMessage::MemoryRegion(desc)) => desc,
        Some(other) => bail!("peer exposes no memory, sent {other:?}"),
        None => bail!("no meta message from peer"),
    };
    let memory = manager.memory().context("this side exposes no memory")?;
    let local = memory
        .get_pinned_mr(0, memory.block_length(), true)
        .context("local block 0 is not pinned")?;
    let len = PATTERN_LEN.min(remote.length).min(local.length / 2);
    info!(?remote, ?local, len, "Peer memory");

    let pattern: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    memory.write_block(0, 0, &pattern)?;

    let (tx, rx) = mpsc::channel();
    manager.set_completion_callback(Box::new(move |wc| {
        let _ = tx.send((wc.wr_id.correlation(), wc.status));
    }));

    let start = Instant::now();
    let write = TransferRequest {
        dst: remote,
        dst_offset: 0,
        src: local,
        local_addr: local.addr,
        length: len as u32,
        kind: TransferKind::Write,
        correlation: 1,
    };
    manager.rdma_write(&write)?;
    wait_for_completion(&rx, 1)?;

    let read = TransferRequest {
        local_addr: local.addr + len,
        kind: TransferKind::Read,
        correlation: 2,
        ..write
    };
    manager.rdma_read(&read)?;
    wait_for_completion(&rx, 2)?;
    let echoed = memory.read_block(0, len as usize, len as usize)?;
    ensure!(echoed == pattern, "data read back differs from data written");

    let ring =
        TransferRequest { kind: TransferKind::WriteWithImm(0xc0ffee), correlation: 3, ..write };
    manager.rdma_write(&ring)?;
    wait_for_completion(&rx, 3)?;

    info!(bytes = len, elapsed = ?start.elapsed(), stats = ?manager.stats(), "Transfers verified");
    Ok(())
}

fn spawn_connection<P: RdmaProvider>(
    name: &str,
    mut conn: Connection<P>,
) -> anyhow::Result<JoinHandle<rdma_lib::Result<()>>> {
    Ok(thread::Builder::new().name(name.into()).spawn(move || conn.run())?)
}

fn join(name: &str, handle: JoinHandle<rdma_lib::Result<()>>) -> anyhow::Result<()> {
    handle.join().map_err(|_| anyhow!("{name} thread panicked"))??;
    Ok(())
}

/// Connects, runs [`exercise`], then disconnects.
fn run_client<P: RdmaProvider>(conn: Connection<P>) -> anyhow::Result<()> {
    let manager = conn.manager();
    let stopper = conn.stopper();
    let handle = spawn_connection("rdma-client", conn)?;

    let deadline = Instant::now() + CONNECT_TIMEOUT;
    while !manager.is_connected() {
        if handle.is_finished() {
            join("client", handle)?;
            bail!("client finished before connecting");
        }
        if Instant::now() > deadline {
            stopper.cancel();
            join("client", handle)?;
            bail!("timed out connecting");
        }
        thread::sleep(Duration::from_millis(10));
    }

    let ret = exercise(&manager);
    stopper.stop()?;
    join("client", handle)?;
    ret
}

/// Server and client on an in-process fabric.
fn run_loopback(cli: &Cli) -> anyhow::Result<()> {
    use rdma_lib::loopback::LoopbackFabric;

    let fabric = LoopbackFabric::new();
    let mut params = cli.params(Role::Server)?;
    params.source_addr = None;
    let server = Connection::new(fabric.clone(), params.clone(), cli.config())?;
    let server_manager = server.manager();
    let server = spawn_connection("rdma-server", server)?;

    let listen_addr = std::net::SocketAddr::new([127, 0, 0, 1].into(), cli.dest_port);
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    while !fabric.is_listening(listen_addr) {
        ensure!(Instant::now() < deadline && !server.is_finished(), "server did not start");
        thread::sleep(Duration::from_millis(1));
    }

    params.role = Role::Client;
    params.server_addr = Some(listen_addr.ip());
    let client = Connection::new(fabric, params, cli.config())?;
    run_client(client)?;
    join("server", server)?;

    info!(stats = ?server_manager.stats(), "Server finished");
    Ok(())
}

#[cfg(feature = "verbs")]
fn run_verbs(cli: &Cli) -> anyhow::Result<()> {
    use rdma_lib::verbs::{VerbsDeviceList, VerbsProvider};

    let devices = VerbsDeviceList::get_all_devices()?;
    info!(devices = ?devices.names(), "RDMA devices");
    if let Some(name) = &cli.ib_dev {
        ensure!(devices.find(name).is_some(), "RDMA device {name} not found");
    }

    let role = cli.role();
    let conn = Connection::new(VerbsProvider, cli.params(role)?, cli.config())?;
    match role {
        Role::Client => run_client(conn),
        Role::Server => {
            let manager = conn.manager();
            join("server", spawn_connection("rdma-server", conn)?)?;
            while let Some(msg) = manager.recv_meta(Duration::ZERO) {
                info!(?msg, "Peer meta message");
            }
            info!(stats = ?manager.stats(), "Server finished");
            Ok(())
        }
    }
}

#[cfg(not(feature = "verbs"))]
fn run_verbs(_cli: &Cli) -> anyhow::Result<()> {
    bail!("built without the `verbs` feature, use --loopback")
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging_lib::init(&cli.logging)?;

    if cli.loopback || !cfg!(feature = "verbs") {
        info!(role = ?cli.role(), "Running both roles on the loopback fabric");
        run_loopback(&cli)
    } else {
        run_verbs(&cli)
    }
}
