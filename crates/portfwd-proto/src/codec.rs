//! Conversion between wire envelopes and typed forwarding fields
//!
//! Payloads are bincode-encoded with fixed-width integers. Decoding rejects
//! trailing bytes and validates ranges so callers only ever see ports that
//! fit in a `u16`.

use bincode::Options;
use thiserror::Error;
use tracing::trace;

use crate::messages::{
    ChannelOpenMessage, ForwardChannelPayload, ForwardRequestPayload, SessionRequestMessage,
};

/// Errors raised while decoding a request or channel-open payload
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Port {0} is outside 0..=65535")]
    PortOutOfRange(u32),

    #[error("Unknown failure reason code: {0}")]
    UnknownFailureCode(u32),
}

/// A decoded `start-forward` / `cancel-forward` request
///
/// `port == 0` asks the listener factory to pick any free port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardRequest {
    pub bind_address: String,
    pub port: u16,
}

impl ForwardRequest {
    pub fn new(bind_address: impl Into<String>, port: u16) -> Self {
        Self {
            bind_address: bind_address.into(),
            port,
        }
    }

    pub fn wants_any_port(&self) -> bool {
        self.port == 0
    }
}

/// One inbound or outbound channel-open, decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenAttempt {
    pub channel_type: String,
    /// The peer, not this side, initiated the channel
    pub origin_is_remote: bool,
    pub originator_address: Option<String>,
    pub originator_port: Option<u16>,
    pub target_host: String,
    pub target_port: u16,
}

fn payload_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

fn port_from_wire(port: u32) -> Result<u16, DecodeError> {
    u16::try_from(port).map_err(|_| DecodeError::PortOutOfRange(port))
}

/// Decode the payload of a forwarding session request
pub fn decode_forward_request(
    message: &SessionRequestMessage,
) -> Result<ForwardRequest, DecodeError> {
    let payload: ForwardRequestPayload = payload_options()
        .deserialize(&message.payload)
        .map_err(|e| DecodeError::MalformedPayload(e.to_string()))?;

    if payload.bind_address.is_empty() {
        return Err(DecodeError::MissingField("bind_address"));
    }
    let port = port_from_wire(payload.port)?;

    trace!(
        request_type = %message.request_type,
        bind_address = %payload.bind_address,
        port,
        "Decoded forward request"
    );

    Ok(ForwardRequest {
        bind_address: payload.bind_address,
        port,
    })
}

/// Build a session request envelope for the given forwarding request
pub fn encode_forward_request(
    request_type: &str,
    request: &ForwardRequest,
    want_reply: bool,
) -> Result<SessionRequestMessage, bincode::Error> {
    let payload = payload_options().serialize(&ForwardRequestPayload {
        bind_address: request.bind_address.clone(),
        port: u32::from(request.port),
    })?;

    Ok(SessionRequestMessage {
        request_type: request_type.to_string(),
        want_reply,
        payload,
    })
}

/// Decode a channel-open envelope into an attempt
///
/// `origin_is_remote` is supplied by the session layer, it is not part of the
/// wire payload.
pub fn decode_channel_open(
    message: &ChannelOpenMessage,
    origin_is_remote: bool,
) -> Result<ChannelOpenAttempt, DecodeError> {
    let payload: ForwardChannelPayload = payload_options()
        .deserialize(&message.payload)
        .map_err(|e| DecodeError::MalformedPayload(e.to_string()))?;

    if payload.host.is_empty() {
        return Err(DecodeError::MissingField("host"));
    }
    let target_port = port_from_wire(payload.port)?;
    let originator_port = payload.originator_port.map(port_from_wire).transpose()?;

    Ok(ChannelOpenAttempt {
        channel_type: message.channel_type.clone(),
        origin_is_remote,
        originator_address: payload.originator_address,
        originator_port,
        target_host: payload.host,
        target_port,
    })
}

/// Build a channel-open envelope from an attempt
pub fn encode_channel_open(
    attempt: &ChannelOpenAttempt,
) -> Result<ChannelOpenMessage, bincode::Error> {
    let payload = payload_options().serialize(&ForwardChannelPayload {
        originator_address: attempt.originator_address.clone(),
        originator_port: attempt.originator_port.map(u32::from),
        host: attempt.target_host.clone(),
        port: u32::from(attempt.target_port),
    })?;

    Ok(ChannelOpenMessage {
        channel_type: attempt.channel_type.clone(),
        payload,
    })
}
