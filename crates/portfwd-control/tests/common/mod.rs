//! Shared test doubles for forwarding integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use portfwd_control::{
    AllocationError, ChannelOpenError, ForwardGrant, ForwardKey, ForwardObserver,
    ListenerFactory, SessionLink, TransportError,
};
use portfwd_proto::{
    encode_channel_open, encode_forward_request, ChannelId, ChannelOpenAttempt,
    ChannelOpenMessage, ChannelOpenReply, ForwardRequest, SessionReply, SessionRequestMessage,
    CANCEL_FORWARD_REQUEST, FORWARD_CHANNEL_TYPE, START_FORWARD_REQUEST,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Everything the session and the tracker observer saw, in order
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Reply(SessionReply),
    GrantRegistered(ForwardKey),
    GrantClosed(ForwardKey, Vec<ChannelId>),
    ChannelClosed(ChannelId),
    ChannelOpened(ChannelId, ChannelOpenMessage),
}

/// Session double recording replies, channel closes and grant changes on
/// a single timeline
pub struct RecordingSession {
    log: Mutex<Vec<Recorded>>,
    transport_closed: AtomicBool,
    next_channel: AtomicU32,
    open_failure: Mutex<Option<ChannelOpenError>>,
    generic_verdict: Mutex<ChannelOpenReply>,
}

impl RecordingSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(Vec::new()),
            transport_closed: AtomicBool::new(false),
            next_channel: AtomicU32::new(100),
            open_failure: Mutex::new(None),
            generic_verdict: Mutex::new(ChannelOpenReply::Confirmation),
        })
    }

    pub fn log(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }

    pub fn replies(&self) -> Vec<SessionReply> {
        self.log()
            .into_iter()
            .filter_map(|entry| match entry {
                Recorded::Reply(reply) => Some(reply),
                _ => None,
            })
            .collect()
    }

    pub fn closed_channels(&self) -> Vec<ChannelId> {
        self.log()
            .into_iter()
            .filter_map(|entry| match entry {
                Recorded::ChannelClosed(channel) => Some(channel),
                _ => None,
            })
            .collect()
    }

    pub fn close_transport(&self) {
        self.transport_closed.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_open(&self, error: ChannelOpenError) {
        *self.open_failure.lock().unwrap() = Some(error);
    }

    pub fn set_generic_verdict(&self, verdict: ChannelOpenReply) {
        *self.generic_verdict.lock().unwrap() = verdict;
    }

    fn record(&self, entry: Recorded) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl SessionLink for RecordingSession {
    async fn queue_reply(&self, reply: SessionReply) -> Result<(), TransportError> {
        if self.transport_closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.record(Recorded::Reply(reply));
        Ok(())
    }

    async fn open_channel(
        &self,
        message: ChannelOpenMessage,
    ) -> Result<ChannelId, ChannelOpenError> {
        if let Some(error) = self.open_failure.lock().unwrap().take() {
            return Err(error);
        }
        let channel = self.next_channel.fetch_add(1, Ordering::SeqCst);
        self.record(Recorded::ChannelOpened(channel, message));
        Ok(channel)
    }

    fn close_channel(&self, channel: ChannelId) {
        self.record(Recorded::ChannelClosed(channel));
    }

    async fn check_channel_open(&self, _attempt: &ChannelOpenAttempt) -> ChannelOpenReply {
        self.generic_verdict.lock().unwrap().clone()
    }
}

impl ForwardObserver for RecordingSession {
    fn grant_registered(&self, grant: &ForwardGrant) {
        self.record(Recorded::GrantRegistered(grant.key()));
    }

    fn grant_closed(&self, grant: &ForwardGrant, severed: &[ChannelId]) {
        self.record(Recorded::GrantClosed(grant.key(), severed.to_vec()));
    }
}

/// Factory that always hands out the same port
pub struct FixedPortFactory {
    port: u16,
    pub released: Mutex<Vec<(String, u16)>>,
}

impl FixedPortFactory {
    pub fn new(port: u16) -> Arc<Self> {
        Arc::new(Self {
            port,
            released: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ListenerFactory for FixedPortFactory {
    async fn allocate(&self, _address: &str, desired_port: u16) -> Result<u16, AllocationError> {
        Ok(if desired_port == 0 { self.port } else { desired_port })
    }

    fn release(&self, address: &str, port: u16) {
        self.released
            .lock()
            .unwrap()
            .push((address.to_string(), port));
    }
}

/// Factory whose allocations never complete
#[derive(Default)]
pub struct StalledFactory {
    pub started: AtomicU32,
}

#[async_trait]
impl ListenerFactory for StalledFactory {
    async fn allocate(&self, _address: &str, _desired_port: u16) -> Result<u16, AllocationError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<Result<u16, AllocationError>>().await
    }

    fn release(&self, _address: &str, _port: u16) {}
}

/// Factory that always fails to bind
pub struct FailingFactory;

#[async_trait]
impl ListenerFactory for FailingFactory {
    async fn allocate(&self, address: &str, desired_port: u16) -> Result<u16, AllocationError> {
        Err(AllocationError::BindFailed {
            address: address.to_string(),
            port: desired_port,
            reason: "Address already in use".to_string(),
        })
    }

    fn release(&self, _address: &str, _port: u16) {}
}

pub fn start_request(bind_address: &str, port: u16) -> SessionRequestMessage {
    encode_forward_request(
        START_FORWARD_REQUEST,
        &ForwardRequest::new(bind_address, port),
        true,
    )
    .unwrap()
}

pub fn cancel_request(bind_address: &str, port: u16) -> SessionRequestMessage {
    encode_forward_request(
        CANCEL_FORWARD_REQUEST,
        &ForwardRequest::new(bind_address, port),
        true,
    )
    .unwrap()
}

pub fn forward_attempt(host: &str, port: u16, origin_is_remote: bool) -> ChannelOpenAttempt {
    ChannelOpenAttempt {
        channel_type: FORWARD_CHANNEL_TYPE.to_string(),
        origin_is_remote,
        originator_address: Some("203.0.113.7".to_string()),
        originator_port: Some(49152),
        target_host: host.to_string(),
        target_port: port,
    }
}

pub fn forward_channel(host: &str, port: u16) -> ChannelOpenMessage {
    encode_channel_open(&forward_attempt(host, port, false)).unwrap()
}
