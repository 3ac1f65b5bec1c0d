//! Connection parameters and tunables.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{RdmaLibError, Result};

/// Work requests per queue and completion queue entries.
pub const DEFAULT_QUEUE_DEPTH: u32 = 128;
/// Address and route resolution timeout.
pub const DEFAULT_RESOLVE_TIMEOUT_MS: u64 = 1000;
/// Resolution attempts shared by the address and route phases.
pub const DEFAULT_RESOLVE_RETRIES: u32 = 5;
pub const DEFAULT_EVENT_POLL_INTERVAL_MS: u64 = 100;
/// Size of one pinned block.
pub const DEFAULT_BLOCK_LENGTH: u64 = 1 << 20;
/// Upper bound of the pinned pool.
pub const DEFAULT_MAX_MEMORY: u64 = 16 << 30;
pub const DEFAULT_CACHE_LINE_SIZE: usize = 64;
pub const DEFAULT_PORT: u16 = 18515;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Server,
    Client,
}

/// Only reliable-connected queue pairs are supported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    #[default]
    ReliableConnected,
}

/// The validated process-level parameters a connection is created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentParams {
    pub device_name: Option<String>,
    pub ib_port: u8,
    pub role: Role,
    pub server_addr: Option<IpAddr>,
    pub server_port: u16,
    pub source_addr: Option<IpAddr>,
    pub connection_type: ConnectionType,
    /// Alignment of pinned allocations.
    pub cache_line_size: usize,
}

impl EnvironmentParams {
    pub fn server(port: u16) -> Self {
        Self {
            device_name: None,
            ib_port: 1,
            role: Role::Server,
            server_addr: None,
            server_port: port,
            source_addr: None,
            connection_type: ConnectionType::ReliableConnected,
            cache_line_size: DEFAULT_CACHE_LINE_SIZE,
        }
    }

    pub fn client(server_addr: IpAddr, port: u16) -> Self {
        Self {
            role: Role::Client,
            server_addr: Some(server_addr),
            ..Self::server(port)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ib_port == 0 {
            return Err(RdmaLibError::Custom("ib port numbers start at 1"));
        }
        if self.server_port == 0 {
            return Err(RdmaLibError::Custom("server port must be non-zero"));
        }
        if !self.cache_line_size.is_power_of_two() {
            return Err(RdmaLibError::Custom("cache line size must be a power of two"));
        }
        if self.role == Role::Client && self.server_addr.is_none() {
            return Err(RdmaLibError::Custom("client requires a server address"));
        }
        Ok(())
    }

    /// Address the server listens on.
    pub fn listen_addr(&self) -> SocketAddr {
        let ip = self.source_addr.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, self.server_port)
    }

    /// Address the client resolves and connects to.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.server_addr.map(|ip| SocketAddr::new(ip, self.server_port))
    }

    /// Optional local address the client binds during resolution.
    pub fn source_socket_addr(&self) -> Option<SocketAddr> {
        self.source_addr.map(|ip| SocketAddr::new(ip, 0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub queue_depth: u32,
    pub resolve_timeout_ms: u64,
    pub resolve_retries: u32,
    /// Bound on every blocking CM/completion wait so that stop flags are observed.
    pub event_poll_interval_ms: u64,
    pub block_length: u64,
    pub max_memory: u64,
    /// Pinned blocks registered for remote access when the connection is built.
    pub exposed_blocks: usize,
    pub listen_backlog: i32,
    pub pin_poller_cpu: Option<u16>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            resolve_timeout_ms: DEFAULT_RESOLVE_TIMEOUT_MS,
            resolve_retries: DEFAULT_RESOLVE_RETRIES,
            event_poll_interval_ms: DEFAULT_EVENT_POLL_INTERVAL_MS,
            block_length: DEFAULT_BLOCK_LENGTH,
            max_memory: DEFAULT_MAX_MEMORY,
            exposed_blocks: 0,
            listen_backlog: 1,
            pin_poller_cpu: None,
        }
    }
}

impl ConnectionConfig {
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.queue_depth, 128);
        assert_eq!(config.resolve_timeout(), Duration::from_millis(1000));
        assert_eq!(config.block_length, 1 << 20);
        assert_eq!(config.max_memory / config.block_length, 16384);
    }

    #[test]
    fn test_validate() {
        let server = EnvironmentParams::server(7471);
        server.validate().unwrap();
        assert_eq!(server.listen_addr(), "0.0.0.0:7471".parse().unwrap());

        let client = EnvironmentParams::client("10.0.0.2".parse().unwrap(), 7471);
        client.validate().unwrap();
        assert_eq!(client.peer_addr(), Some("10.0.0.2:7471".parse().unwrap()));

        let orphan = EnvironmentParams { server_addr: None, ..client.clone() };
        assert!(orphan.validate().is_err());

        let no_port = EnvironmentParams { server_port: 0, ..client.clone() };
        assert!(no_port.validate().is_err());

        let odd_line = EnvironmentParams { cache_line_size: 48, ..client };
        assert!(odd_line.validate().is_err());
    }
}
