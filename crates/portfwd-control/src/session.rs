//! Seams between the forwarding core and the session that carries it
//!
//! The session layer owns framing, encryption and channel bookkeeping. It is
//! consumed through [`SessionLink`] and it drives the core through
//! [`SessionHandler`]. [`SessionDriver`] feeds one session's events to its
//! handler strictly one at a time.

use async_trait::async_trait;
use portfwd_auth::Principal;
use portfwd_proto::{
    ChannelId, ChannelOpenAttempt, ChannelOpenMessage, ChannelOpenReply, SessionReply,
    SessionRequestMessage,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ChannelOpenError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Session transport closed")]
    Closed,

    #[error("Failed to send message: {0}")]
    SendFailed(String),
}

/// The underlying session as seen by the forwarding core
#[async_trait]
pub trait SessionLink: Send + Sync {
    /// Queue a reply to the session request currently being handled
    async fn queue_reply(&self, reply: SessionReply) -> Result<(), TransportError>;

    /// Ask the peer to open a channel
    async fn open_channel(&self, message: ChannelOpenMessage)
        -> Result<ChannelId, ChannelOpenError>;

    /// Start the close sequence of a channel
    fn close_channel(&self, channel: ChannelId);

    /// Generic channel-open validation, run after the forwarding checks pass
    async fn check_channel_open(&self, _attempt: &ChannelOpenAttempt) -> ChannelOpenReply {
        ChannelOpenReply::Confirmation
    }

    /// Generic handling for session requests that are not forwarding requests
    async fn fallback_request(&self, _request: &SessionRequestMessage) -> SessionReply {
        SessionReply::Failure
    }
}

/// Which side asked for a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrigin {
    Local,
    Remote,
}

impl ChannelOrigin {
    pub fn is_remote(self) -> bool {
        matches!(self, ChannelOrigin::Remote)
    }
}

/// Session callbacks implemented by the forwarding core
#[async_trait]
pub trait SessionHandler: Send {
    /// Handle a session request
    ///
    /// When the request wants a reply it has already been queued on the
    /// session by the time this returns; the value is handed back for the
    /// caller's own bookkeeping.
    async fn handle_session_request(
        &mut self,
        request: SessionRequestMessage,
        principal: &Principal,
        cancel: &CancellationToken,
    ) -> SessionReply;

    async fn handle_channel_opening(
        &mut self,
        channel: ChannelId,
        message: &ChannelOpenMessage,
        origin: ChannelOrigin,
    ) -> ChannelOpenReply;

    fn handle_channel_closed(&mut self, channel: ChannelId);

    async fn handle_session_closed(&mut self);
}

/// Event delivered by the session layer
#[derive(Debug)]
pub enum SessionEvent {
    Request(SessionRequestMessage),
    ChannelOpening {
        channel: ChannelId,
        message: ChannelOpenMessage,
        origin: ChannelOrigin,
        reply: oneshot::Sender<ChannelOpenReply>,
    },
    ChannelClosed(ChannelId),
    Closed,
}

/// Serializes the events of one session onto its handler
pub struct SessionDriver<H> {
    handler: H,
    principal: Principal,
    events: mpsc::Receiver<SessionEvent>,
    shutdown: CancellationToken,
}

impl<H: SessionHandler> SessionDriver<H> {
    pub fn new(handler: H, principal: Principal, events: mpsc::Receiver<SessionEvent>) -> Self {
        Self {
            handler,
            principal,
            events,
            shutdown: CancellationToken::new(),
        }
    }

    /// Use an externally owned shutdown token
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until the session closes or shutdown is requested
    ///
    /// Teardown always runs on the way out. The handler is returned so the
    /// owner can inspect its final state.
    pub async fn run(mut self) -> H {
        info!(principal = %self.principal.id, "Session driver started");

        loop {
            let event = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    debug!(principal = %self.principal.id, "Session shutdown requested");
                    break;
                }
                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => {
                        debug!(principal = %self.principal.id, "Session event channel closed");
                        break;
                    }
                },
            };

            match event {
                SessionEvent::Request(request) => {
                    // Shutdown aborts a pending allocation through the child token
                    let cancel = self.shutdown.child_token();
                    let reply = self
                        .handler
                        .handle_session_request(request, &self.principal, &cancel)
                        .await;
                    debug!(success = reply.is_success(), "Session request handled");
                }
                SessionEvent::ChannelOpening {
                    channel,
                    message,
                    origin,
                    reply,
                } => {
                    let verdict = self
                        .handler
                        .handle_channel_opening(channel, &message, origin)
                        .await;
                    if let Err(verdict) = reply.send(verdict) {
                        debug!(channel, "Channel opening abandoned by session");
                        // The channel was never opened, so it must not stay
                        // attached to a grant
                        if verdict.is_confirmation() {
                            self.handler.handle_channel_closed(channel);
                        }
                    }
                }
                SessionEvent::ChannelClosed(channel) => {
                    self.handler.handle_channel_closed(channel);
                }
                SessionEvent::Closed => {
                    debug!(principal = %self.principal.id, "Session closed");
                    break;
                }
            }
        }

        self.handler.handle_session_closed().await;
        info!(principal = %self.principal.id, "Session driver stopped");
        self.handler
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingHandler {
        requests: usize,
        closed_channels: Vec<ChannelId>,
        torn_down: bool,
    }

    #[async_trait]
    impl SessionHandler for CountingHandler {
        async fn handle_session_request(
            &mut self,
            _request: SessionRequestMessage,
            _principal: &Principal,
            _cancel: &CancellationToken,
        ) -> SessionReply {
            self.requests += 1;
            SessionReply::success()
        }

        async fn handle_channel_opening(
            &mut self,
            _channel: ChannelId,
            _message: &ChannelOpenMessage,
            origin: ChannelOrigin,
        ) -> ChannelOpenReply {
            if origin.is_remote() {
                ChannelOpenReply::failure(
                    portfwd_proto::FailureReason::AdministrativelyProhibited,
                    "remote",
                )
            } else {
                ChannelOpenReply::Confirmation
            }
        }

        fn handle_channel_closed(&mut self, channel: ChannelId) {
            self.closed_channels.push(channel);
        }

        async fn handle_session_closed(&mut self) {
            self.torn_down = true;
        }
    }

    fn request() -> SessionRequestMessage {
        SessionRequestMessage {
            request_type: "noop".to_string(),
            want_reply: true,
            payload: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_driver_runs_events_in_order() {
        let (tx, rx) = mpsc::channel(8);
        let driver = SessionDriver::new(CountingHandler::default(), Principal::new("alice"), rx);
        let task = tokio::spawn(driver.run());

        tx.send(SessionEvent::Request(request())).await.unwrap();
        tx.send(SessionEvent::Request(request())).await.unwrap();

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(SessionEvent::ChannelOpening {
            channel: 1,
            message: ChannelOpenMessage {
                channel_type: "forward".to_string(),
                payload: Vec::new(),
            },
            origin: ChannelOrigin::Remote,
            reply: reply_tx,
        })
        .await
        .unwrap();
        assert_eq!(
            reply_rx.await.unwrap().reason(),
            portfwd_proto::FailureReason::AdministrativelyProhibited
        );

        tx.send(SessionEvent::ChannelClosed(1)).await.unwrap();
        tx.send(SessionEvent::Closed).await.unwrap();

        let handler = task.await.unwrap();
        assert_eq!(handler.requests, 2);
        assert_eq!(handler.closed_channels, vec![1]);
        assert!(handler.torn_down);
    }

    #[tokio::test]
    async fn test_driver_detaches_abandoned_confirmed_open() {
        let (tx, rx) = mpsc::channel(8);
        let driver = SessionDriver::new(CountingHandler::default(), Principal::new("dave"), rx);
        let task = tokio::spawn(driver.run());

        for (channel, origin) in [(7, ChannelOrigin::Local), (8, ChannelOrigin::Remote)] {
            let (reply_tx, reply_rx) = oneshot::channel();
            drop(reply_rx);
            tx.send(SessionEvent::ChannelOpening {
                channel,
                message: ChannelOpenMessage {
                    channel_type: "forward".to_string(),
                    payload: Vec::new(),
                },
                origin,
                reply: reply_tx,
            })
            .await
            .unwrap();
        }
        tx.send(SessionEvent::Closed).await.unwrap();

        // Only the confirmed open had anything to detach
        let handler = task.await.unwrap();
        assert_eq!(handler.closed_channels, vec![7]);
    }

    #[tokio::test]
    async fn test_driver_tears_down_on_shutdown() {
        let (_tx, rx) = mpsc::channel(1);
        let driver = SessionDriver::new(CountingHandler::default(), Principal::new("bob"), rx);
        let shutdown = driver.shutdown_token();

        let task = tokio::spawn(driver.run());
        shutdown.cancel();

        let handler = task.await.unwrap();
        assert_eq!(handler.requests, 0);
        assert!(handler.torn_down);
    }

    #[tokio::test]
    async fn test_driver_tears_down_when_events_end() {
        let (tx, rx) = mpsc::channel(1);
        let driver = SessionDriver::new(CountingHandler::default(), Principal::new("carol"), rx);
        drop(tx);

        let handler = driver.run().await;
        assert!(handler.torn_down);
    }
}
