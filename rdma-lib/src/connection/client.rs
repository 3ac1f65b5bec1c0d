use tracing::{debug, info, warn};

use super::{Connection, Flow, RoleState};
use crate::{
    error::{RdmaLibError, ResolveStage, Result},
    provider::{CmEvent, CmEventKind, ConnParam, RdmaProvider},
};

/// Active side: resolve address and route, connect, run until disconnected.
///
/// Address and route resolution share one retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    AddressResolving,
    AddressResolved,
    RouteResolving,
    RouteResolved,
    Established,
    Disconnected,
}

impl ClientState {
    fn as_str(self) -> &'static str {
        match self {
            ClientState::AddressResolving => "address resolving",
            ClientState::AddressResolved => "address resolved",
            ClientState::RouteResolving => "route resolving",
            ClientState::RouteResolved => "route resolved",
            ClientState::Established => "established",
            ClientState::Disconnected => "disconnected",
        }
    }
}

impl<P: RdmaProvider> Connection<P> {
    pub(super) fn start_client(&mut self, channel: P::EventChannel) -> Result<()> {
        let id = self.provider.create_id(channel)?;
        self.cm_id = Some(id);
        self.retries_left = self.manager.config().resolve_retries;
        self.role = RoleState::Client(ClientState::AddressResolving);
        self.resolve_addr(id)
    }

    fn resolve_addr(&self, id: P::CmId) -> Result<()> {
        let peer = self
            .params
            .peer_addr()
            .ok_or(RdmaLibError::Custom("client requires a server address"))?;
        debug!(%peer, "Resolving address");
        self.provider.resolve_addr(
            id,
            self.params.source_socket_addr(),
            peer,
            self.manager.config().resolve_timeout(),
        )
    }

    fn resolve_route(&self, id: P::CmId) -> Result<()> {
        self.provider.resolve_route(id, self.manager.config().resolve_timeout())
    }

    /// Spends one attempt of the shared budget. Errors once it is exhausted.
    fn spend_retry(&mut self, stage: ResolveStage, status: i32) -> Result<()> {
        self.retries_left = self.retries_left.saturating_sub(1);
        warn!(%stage, status, retries_left = self.retries_left, "Resolution failed");
        if self.retries_left == 0 {
            return Err(RdmaLibError::ResolveRetriesExhausted {
                stage,
                attempts: self.manager.config().resolve_retries,
            });
        }
        Ok(())
    }

    pub(super) fn client_transition(
        &mut self,
        state: ClientState,
        event: &CmEvent<P::CmId>,
    ) -> Result<Flow> {
        let (next, flow) = match (state, event.kind) {
            (ClientState::AddressResolving, CmEventKind::AddrError) => {
                self.spend_retry(ResolveStage::Address, event.status)?;
                self.resolve_addr(event.id)?;
                (ClientState::AddressResolving, Flow::Continue)
            }
            (ClientState::AddressResolving, CmEventKind::AddrResolved) => {
                self.role = RoleState::Client(ClientState::AddressResolved);
                self.manager.build_connection(event.id)?;
                self.resolve_route(event.id)?;
                (ClientState::RouteResolving, Flow::Continue)
            }
            (ClientState::RouteResolving, CmEventKind::RouteError) => {
                self.spend_retry(ResolveStage::Route, event.status)?;
                self.resolve_route(event.id)?;
                (ClientState::RouteResolving, Flow::Continue)
            }
            (ClientState::RouteResolving, CmEventKind::RouteResolved) => {
                self.provider.connect(event.id, &ConnParam::connect())?;
                (ClientState::RouteResolved, Flow::Continue)
            }
            (ClientState::RouteResolved, CmEventKind::Established) => {
                self.on_established()?;
                (ClientState::Established, Flow::Continue)
            }
            (
                ClientState::RouteResolved | ClientState::Established,
                CmEventKind::Disconnected,
            ) => {
                info!(connection = ?self.manager.handle(), "Disconnected");
                self.manager.destroy_connection()?;
                (ClientState::Disconnected, Flow::Finished)
            }
            (state, kind) => {
                return Err(RdmaLibError::UnexpectedEvent { kind, during: state.as_str() });
            }
        };
        self.role = RoleState::Client(next);
        Ok(flow)
    }
}
