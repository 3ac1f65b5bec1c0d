pub mod api;
mod config;
mod connection;
mod error;
mod frame;
mod link_buf;
pub mod loopback;
mod mem_registry;
mod meta;
mod poller;
mod provider;
mod table;
mod utils;
#[cfg(feature = "verbs")]
pub mod verbs;

#[cfg(test)]
mod test_connection;

pub use config::*;
pub use connection::{
    ClientState, CompletionCallback, CompletionStats, Connection, ConnectionManager,
    ConnectionState, ConnectionStopper, META_CORRELATION, RoleState, ServerState, StateCell,
};
pub use error::*;
pub use frame::{
    FRAME_OVERHEAD, RDMA_MESSAGE_MAGIC, decode_frame, encode_frame, encode_frame_into, frame_len,
};
pub use link_buf::{LinkBuffer, LinkPosition};
pub use mem_registry::{MemoryRegistry, PinnedBlock};
pub use meta::{META_MESSAGE_BYTES, MetaMessage};
pub use poller::{CompletionPoller, PollerHandle};
pub use provider::*;
pub use table::{CompletionSink, ConnectionTable};
pub use utils::memory::AlignedBuffer;
