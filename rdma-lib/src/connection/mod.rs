//! Connection-manager event loop and the server/client role machines.

mod client;
mod manager;
mod server;
mod state;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tracing::{debug, info, trace, warn};

pub use client::ClientState;
pub use manager::{CompletionCallback, CompletionStats, ConnectionManager, META_CORRELATION};
pub use server::ServerState;
pub use state::{ConnectionState, StateCell};

use crate::{
    config::{ConnectionConfig, EnvironmentParams, Role},
    error::{RdmaLibError, Result},
    provider::{CmEvent, RdmaProvider},
    table::ConnectionTable,
};

/// Where a connection's role machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleState {
    /// Event loop not started yet.
    Idle,
    Server(ServerState),
    Client(ClientState),
}

pub(crate) enum Flow {
    Continue,
    Finished,
}

/// Drives one connection through its role's CM event sequence.
///
/// [`Connection::run`] blocks until the connection is disconnected, fails or
/// is cancelled through a [`ConnectionStopper`]. Every resource it created is
/// released before it returns.
pub struct Connection<P: RdmaProvider> {
    provider: P,
    params: EnvironmentParams,
    manager: Arc<ConnectionManager<P>>,
    role: RoleState,
    channel: Option<P::EventChannel>,
    listen_id: Option<P::CmId>,
    cm_id: Option<P::CmId>,
    retries_left: u32,
    cancel: Arc<AtomicBool>,
}

/// Stops a running [`Connection`] from another thread.
pub struct ConnectionStopper<P: RdmaProvider> {
    manager: Arc<ConnectionManager<P>>,
    cancel: Arc<AtomicBool>,
}

impl<P: RdmaProvider> Clone for ConnectionStopper<P> {
    fn clone(&self) -> Self {
        Self { manager: self.manager.clone(), cancel: self.cancel.clone() }
    }
}

impl<P: RdmaProvider> ConnectionStopper<P> {
    /// Disconnects. Both peers observe `Disconnected` and finish normally.
    pub fn stop(&self) -> Result<()> {
        self.manager.disconnect()
    }

    /// Makes the event loop exit at its next wakeup and tear down locally.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }
}

impl<P: RdmaProvider> Connection<P> {
    pub fn new(provider: P, params: EnvironmentParams, config: ConnectionConfig) -> Result<Self> {
        Self::with_table(provider, params, config, ConnectionTable::global())
    }

    pub fn with_table(
        provider: P,
        params: EnvironmentParams,
        config: ConnectionConfig,
        table: Arc<ConnectionTable>,
    ) -> Result<Self> {
        params.validate()?;
        let manager =
            ConnectionManager::with_table(provider.clone(), config, params.cache_line_size, table)?;
        Ok(Self {
            provider,
            params,
            manager,
            role: RoleState::Idle,
            channel: None,
            listen_id: None,
            cm_id: None,
            retries_left: 0,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn manager(&self) -> Arc<ConnectionManager<P>> {
        self.manager.clone()
    }

    pub fn params(&self) -> &EnvironmentParams {
        &self.params
    }

    pub fn role_state(&self) -> RoleState {
        self.role
    }

    pub fn stopper(&self) -> ConnectionStopper<P> {
        ConnectionStopper { manager: self.manager.clone(), cancel: self.cancel.clone() }
    }

    /// Runs the role's event loop to completion. A cancelled run returns `Ok`.
    pub fn run(&mut self) -> Result<()> {
        let ret = self.start().and_then(|()| self.event_loop());
        self.finish(ret)
    }

    fn start(&mut self) -> Result<()> {
        if self.role != RoleState::Idle {
            return Err(RdmaLibError::InvalidState("connection already ran"));
        }
        let channel = self.provider.create_event_channel()?;
        self.channel = Some(channel);
        match self.params.role {
            Role::Server => self.start_server(channel),
            Role::Client => self.start_client(channel),
        }
    }

    fn event_loop(&mut self) -> Result<()> {
        let channel = self
            .channel
            .ok_or(RdmaLibError::InvalidState("event channel not created"))?;
        let interval = self.manager.config().event_poll_interval();
        loop {
            if self.cancel.load(Ordering::Acquire) {
                info!(state = ?self.role, "Connection cancelled");
                return Ok(());
            }
            let Some(event) = self.provider.get_cm_event(channel, interval)? else {
                continue;
            };
            trace!(kind = ?event.kind, id = ?event.id, status = event.status, "CM event");
            if let Flow::Finished = self.transition(&event)? {
                return Ok(());
            }
        }
    }

    fn transition(&mut self, event: &CmEvent<P::CmId>) -> Result<Flow> {
        match self.role {
            RoleState::Server(state) => self.server_transition(state, event),
            RoleState::Client(state) => self.client_transition(state, event),
            RoleState::Idle => Err(RdmaLibError::UnexpectedEvent {
                kind: event.kind,
                during: "idle",
            }),
        }
    }

    /// Shared by both roles once the CM reports `Established`.
    fn on_established(&self) -> Result<()> {
        self.manager.mark_connected()?;
        self.manager.post_meta_send_wr()?;
        info!(connection = ?self.manager.handle(), "Connection established");
        Ok(())
    }

    fn finish(&mut self, ret: Result<()>) -> Result<()> {
        if self.manager.state() == ConnectionState::Uninitialized {
            // The manager never took ownership of the active id.
            if let Some(id) = self.cm_id.take()
                && let Err(e) = self.provider.destroy_id(id)
            {
                warn!(error = %e, "Failed to destroy cm id");
            }
        }
        let teardown = self.manager.destroy_connection();
        self.cm_id = None;

        if let Some(listen_id) = self.listen_id.take()
            && let Err(e) = self.provider.destroy_id(listen_id)
        {
            warn!(error = %e, "Failed to destroy listening id");
        }
        if let Some(channel) = self.channel.take() {
            self.provider.destroy_event_channel(channel);
        }

        match (ret, teardown) {
            (Err(e), teardown) => {
                if let Err(teardown_err) = teardown {
                    warn!(error = %teardown_err, "Teardown after failure also failed");
                }
                warn!(state = ?self.role, error = %e, "Connection failed");
                Err(e)
            }
            (Ok(()), teardown) => {
                debug!(state = ?self.role, "Connection finished");
                teardown
            }
        }
    }
}
