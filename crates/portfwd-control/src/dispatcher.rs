//! Session request dispatch for `start-forward` and `cancel-forward`

use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use portfwd_auth::Principal;
use portfwd_proto::{
    decode_forward_request, SessionReply, SessionRequestMessage, CANCEL_FORWARD_REQUEST,
    START_FORWARD_REQUEST,
};

use crate::error::{AllocationError, ConflictError, ForwardError};
use crate::handler::ForwardingService;
use crate::tracker::{ForwardGrant, ForwardKey};

/// Forwarding session request kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Start,
    Cancel,
}

impl RequestKind {
    /// Map a wire request type, None for anything that is not forwarding
    pub fn from_request_type(request_type: &str) -> Option<Self> {
        match request_type {
            START_FORWARD_REQUEST => Some(RequestKind::Start),
            CANCEL_FORWARD_REQUEST => Some(RequestKind::Cancel),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Start => START_FORWARD_REQUEST,
            RequestKind::Cancel => CANCEL_FORWARD_REQUEST,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ForwardingService {
    /// Handle one session request and queue its reply
    ///
    /// Never fails: every error becomes a failure reply. For a successful
    /// `start-forward` the reply is queued before the grant is registered, so
    /// no channel can be negotiated against a grant the peer has not been
    /// told about.
    pub async fn handle_request(
        &mut self,
        request: SessionRequestMessage,
        principal: &Principal,
        cancel: &CancellationToken,
    ) -> SessionReply {
        let Some(kind) = RequestKind::from_request_type(&request.request_type) else {
            debug!(
                request_type = %request.request_type,
                "Passing session request to generic handler"
            );
            let reply = self.session.fallback_request(&request).await;
            if request.want_reply {
                if let Err(e) = self.send_reply(reply).await {
                    error!("Failed to queue reply to {}: {}", request.request_type, e);
                }
            }
            return reply;
        };

        let (reply, pending) = match kind {
            RequestKind::Start => match self.start_forward(&request, principal, cancel).await {
                Ok(grant) => (SessionReply::with_port(grant.bound_port), Some(grant)),
                Err(e) => {
                    log_rejection(kind, principal, &e);
                    (SessionReply::Failure, None)
                }
            },
            RequestKind::Cancel => match self.cancel_forward(&request, principal) {
                Ok(()) => (SessionReply::success(), None),
                Err(e) => {
                    log_rejection(kind, principal, &e);
                    (SessionReply::Failure, None)
                }
            },
        };

        if request.want_reply {
            if let Err(e) = self.send_reply(reply).await {
                error!("Failed to queue {} reply: {}", kind, e);
                let Some(grant) = pending else {
                    // Nothing was held back for the reply, so the outcome stands
                    if reply.is_success() {
                        warn!("{} already applied but the peer was not told", kind);
                    }
                    return reply;
                };
                self.listeners.release(&grant.bind_address, grant.bound_port);
                debug!(
                    bind_address = %grant.bind_address,
                    port = grant.bound_port,
                    "Released listener of unacknowledged forward"
                );
                return SessionReply::Failure;
            }
        }

        if let Some(grant) = pending {
            let key = grant.key();
            if let Err(e) = self.tracker.register(grant) {
                // The key was checked after allocation and nothing else runs
                // on this session in between
                error!("Lost forward {} after replying: {}", key, e);
                return SessionReply::Failure;
            }
        }

        reply
    }

    async fn send_reply(&self, reply: SessionReply) -> Result<(), ForwardError> {
        self.session.queue_reply(reply).await?;
        Ok(())
    }

    /// Allocate a listener for a `start-forward` request
    ///
    /// Returns the grant to register once the reply is queued.
    async fn start_forward(
        &mut self,
        request: &SessionRequestMessage,
        principal: &Principal,
        cancel: &CancellationToken,
    ) -> Result<ForwardGrant, ForwardError> {
        let forward = decode_forward_request(request)?;
        self.gate
            .check(principal, &forward.bind_address, forward.port)?;

        let max_grants = self.config.max_grants;
        if max_grants != 0 && self.tracker.len() >= max_grants {
            return Err(ForwardError::LimitReached(max_grants));
        }

        if !forward.wants_any_port()
            && self
                .tracker
                .lookup(&forward.bind_address, forward.port)
                .is_some()
        {
            return Err(ConflictError {
                bind_address: forward.bind_address,
                port: forward.port,
            }
            .into());
        }

        let timeout = self.config.allocation_timeout;
        let allocation = tokio::time::timeout(
            timeout,
            self.listeners.allocate(&forward.bind_address, forward.port),
        );

        let bound_port = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                return Err(AllocationError::Cancelled.into());
            }
            result = allocation => match result {
                Ok(port) => port?,
                Err(_) => return Err(AllocationError::TimedOut(timeout).into()),
            },
        };

        if bound_port == 0 {
            return Err(AllocationError::NoPortAssigned.into());
        }

        // A port-0 request can land on a key that is already forwarded. The
        // port belongs to the live grant, so it is not released here.
        if self
            .tracker
            .lookup(&forward.bind_address, bound_port)
            .is_some()
        {
            return Err(ConflictError {
                bind_address: forward.bind_address,
                port: bound_port,
            }
            .into());
        }

        info!(
            principal = %principal.id,
            bind_address = %forward.bind_address,
            port = bound_port,
            "Forward listener allocated"
        );

        Ok(ForwardGrant::new(&forward, bound_port))
    }

    /// Close the grant named by a `cancel-forward` request
    fn cancel_forward(
        &mut self,
        request: &SessionRequestMessage,
        principal: &Principal,
    ) -> Result<(), ForwardError> {
        let forward = decode_forward_request(request)?;
        self.gate
            .check(principal, &forward.bind_address, forward.port)?;

        let not_found = || ForwardError::NotFound {
            bind_address: forward.bind_address.clone(),
            port: forward.port,
        };

        if self
            .tracker
            .lookup(&forward.bind_address, forward.port)
            .is_none()
        {
            return Err(not_found());
        }

        let key = ForwardKey::new(forward.bind_address.clone(), forward.port);
        let session = &self.session;
        let grant = self
            .tracker
            .close(&key, |channel| session.close_channel(channel))
            .ok_or_else(not_found)?;

        self.listeners.release(&grant.bind_address, grant.bound_port);
        info!(principal = %principal.id, forward = %key, "Forward cancelled");

        Ok(())
    }
}

fn log_rejection(kind: RequestKind, principal: &Principal, err: &ForwardError) {
    match err {
        ForwardError::Allocation(AllocationError::Cancelled) => {
            info!(principal = %principal.id, "{} cancelled before allocation finished", kind);
        }
        ForwardError::Allocation(_) | ForwardError::Transport(_) => {
            error!(principal = %principal.id, "{} failed: {}", kind, err);
        }
        _ => {
            warn!(principal = %principal.id, "{} rejected: {}", kind, err);
        }
    }
}
