//! Forwarding Protocol Definitions
//!
//! Wire envelopes, reply messages and the codec that turns the generic
//! session-request / channel-open envelopes into typed forwarding fields.

pub mod codec;
pub mod messages;

pub use codec::{
    decode_channel_open, decode_forward_request, encode_channel_open, encode_forward_request,
    ChannelOpenAttempt, DecodeError, ForwardRequest,
};
pub use messages::*;

/// Session request asking the peer to start listening on a forwarded port
pub const START_FORWARD_REQUEST: &str = "start-forward";

/// Session request asking the peer to stop a previously started forward
pub const CANCEL_FORWARD_REQUEST: &str = "cancel-forward";

/// The single channel type recognized for forwarded connections
pub const FORWARD_CHANNEL_TYPE: &str = "forward";
