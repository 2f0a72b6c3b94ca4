//! Forwarding service bound to one session

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use portfwd_auth::{AuthorizationGate, Principal};
use portfwd_proto::{
    ChannelId, ChannelOpenMessage, ChannelOpenReply, SessionReply, SessionRequestMessage,
};

use crate::allocator::ListenerFactory;
use crate::config::ForwardingConfig;
use crate::session::{ChannelOrigin, SessionHandler, SessionLink};
use crate::tracker::{ForwardObserver, ForwardingStateTracker};

/// Handles forwarding requests and channel opens for a single session
///
/// Request handling lives in `dispatcher`, channel negotiation in
/// `negotiator`; both mutate forwarding state only through the tracker.
pub struct ForwardingService {
    pub(crate) session: Arc<dyn SessionLink>,
    pub(crate) listeners: Arc<dyn ListenerFactory>,
    pub(crate) gate: AuthorizationGate,
    pub(crate) config: ForwardingConfig,
    pub(crate) tracker: ForwardingStateTracker,
}

impl ForwardingService {
    pub fn new(session: Arc<dyn SessionLink>, listeners: Arc<dyn ListenerFactory>) -> Self {
        Self {
            session,
            listeners,
            gate: AuthorizationGate::default(),
            config: ForwardingConfig::default(),
            tracker: ForwardingStateTracker::new(),
        }
    }

    pub fn with_gate(mut self, gate: AuthorizationGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_config(mut self, config: ForwardingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ForwardObserver>) -> Self {
        self.tracker = std::mem::take(&mut self.tracker).with_observer(observer);
        self
    }

    pub fn tracker(&self) -> &ForwardingStateTracker {
        &self.tracker
    }

    pub fn config(&self) -> &ForwardingConfig {
        &self.config
    }

    /// Close every grant, sever its channels and release its listener
    pub fn shutdown(&mut self) {
        let session = &self.session;
        let closed = self
            .tracker
            .close_all(|channel| session.close_channel(channel));

        for grant in &closed {
            self.listeners.release(&grant.bind_address, grant.bound_port);
        }

        if !closed.is_empty() {
            info!("Released {} forward(s) on session teardown", closed.len());
        }
    }
}

#[async_trait]
impl SessionHandler for ForwardingService {
    async fn handle_session_request(
        &mut self,
        request: SessionRequestMessage,
        principal: &Principal,
        cancel: &CancellationToken,
    ) -> SessionReply {
        self.handle_request(request, principal, cancel).await
    }

    async fn handle_channel_opening(
        &mut self,
        channel: ChannelId,
        message: &ChannelOpenMessage,
        origin: ChannelOrigin,
    ) -> ChannelOpenReply {
        self.handle_channel_open_message(channel, message, origin).await
    }

    fn handle_channel_closed(&mut self, channel: ChannelId) {
        self.tracker.detach_channel(channel);
    }

    async fn handle_session_closed(&mut self) {
        self.shutdown();
    }
}
