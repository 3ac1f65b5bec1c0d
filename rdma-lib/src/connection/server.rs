use tracing::{debug, info};

use super::{Connection, Flow, RoleState};
use crate::{
    error::{RdmaLibError, Result},
    provider::{CmEvent, CmEventKind, ConnParam, RdmaProvider},
};

/// Passive side: listen, accept one connection, run until disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Listening,
    ConnectRequested,
    Established,
    Disconnected,
}

impl ServerState {
    fn as_str(self) -> &'static str {
        match self {
            ServerState::Listening => "listening",
            ServerState::ConnectRequested => "connect requested",
            ServerState::Established => "established",
            ServerState::Disconnected => "disconnected",
        }
    }
}

impl<P: RdmaProvider> Connection<P> {
    pub(super) fn start_server(&mut self, channel: P::EventChannel) -> Result<()> {
        let listen_id = self.provider.create_id(channel)?;
        self.listen_id = Some(listen_id);
        let addr = self.params.listen_addr();
        self.provider.bind_addr(listen_id, addr)?;
        self.provider.listen(listen_id, self.manager.config().listen_backlog)?;
        self.role = RoleState::Server(ServerState::Listening);
        info!(%addr, "Listening for connections");
        Ok(())
    }

    pub(super) fn server_transition(
        &mut self,
        state: ServerState,
        event: &CmEvent<P::CmId>,
    ) -> Result<Flow> {
        let (next, flow) = match (state, event.kind) {
            (ServerState::Listening, CmEventKind::ConnectRequest) => {
                debug!(id = ?event.id, listen_id = ?event.listen_id, "Connect request");
                self.cm_id = Some(event.id);
                self.role = RoleState::Server(ServerState::ConnectRequested);
                self.manager.build_connection(event.id)?;
                self.provider.accept(event.id, &ConnParam::accept())?;
                (ServerState::ConnectRequested, Flow::Continue)
            }
            (ServerState::ConnectRequested, CmEventKind::Established) => {
                self.on_established()?;
                (ServerState::Established, Flow::Continue)
            }
            (
                ServerState::ConnectRequested | ServerState::Established,
                CmEventKind::Disconnected,
            ) => {
                info!(connection = ?self.manager.handle(), "Peer disconnected");
                self.manager.destroy_connection()?;
                (ServerState::Disconnected, Flow::Finished)
            }
            (state, kind) => {
                return Err(RdmaLibError::UnexpectedEvent { kind, during: state.as_str() });
            }
        };
        self.role = RoleState::Server(next);
        Ok(flow)
    }
}
