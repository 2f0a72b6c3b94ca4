//! Protocol message types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::DecodeError;

/// Identifier the session layer assigns to a channel
pub type ChannelId = u32;

/// Generic out-of-band session request envelope
///
/// The payload is opaque at this level; the codec decodes it according
/// to `request_type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRequestMessage {
    pub request_type: String,
    pub want_reply: bool,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Reply to a session request
///
/// Failures carry no reason on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionReply {
    /// `allocated_port` is only present in replies to `start-forward`
    Success { allocated_port: Option<u32> },
    Failure,
}

impl SessionReply {
    pub fn success() -> Self {
        SessionReply::Success {
            allocated_port: None,
        }
    }

    pub fn with_port(port: u16) -> Self {
        SessionReply::Success {
            allocated_port: Some(u32::from(port)),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SessionReply::Success { .. })
    }

    pub fn allocated_port(&self) -> Option<u32> {
        match self {
            SessionReply::Success { allocated_port } => *allocated_port,
            SessionReply::Failure => None,
        }
    }
}

/// Generic channel-open envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelOpenMessage {
    pub channel_type: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Answer to a channel-open message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelOpenReply {
    Confirmation,
    Failure {
        reason: FailureReason,
        description: Option<String>,
    },
}

impl ChannelOpenReply {
    pub fn failure(reason: FailureReason, description: impl Into<String>) -> Self {
        ChannelOpenReply::Failure {
            reason,
            description: Some(description.into()),
        }
    }

    pub fn is_confirmation(&self) -> bool {
        matches!(self, ChannelOpenReply::Confirmation)
    }

    /// `FailureReason::None` for a confirmation
    pub fn reason(&self) -> FailureReason {
        match self {
            ChannelOpenReply::Confirmation => FailureReason::None,
            ChannelOpenReply::Failure { reason, .. } => *reason,
        }
    }
}

/// Reason code attached to a rejected channel-open
///
/// Serialized as its numeric wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum FailureReason {
    /// Accepted
    #[default]
    None,
    AdministrativelyProhibited,
    ConnectFailed,
    UnknownChannelType,
}

impl FailureReason {
    pub fn code(self) -> u32 {
        match self {
            FailureReason::None => 0,
            FailureReason::AdministrativelyProhibited => 1,
            FailureReason::ConnectFailed => 2,
            FailureReason::UnknownChannelType => 3,
        }
    }

    pub fn is_rejection(self) -> bool {
        self != FailureReason::None
    }
}

impl From<FailureReason> for u32 {
    fn from(reason: FailureReason) -> Self {
        reason.code()
    }
}

impl TryFrom<u32> for FailureReason {
    type Error = DecodeError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(FailureReason::None),
            1 => Ok(FailureReason::AdministrativelyProhibited),
            2 => Ok(FailureReason::ConnectFailed),
            3 => Ok(FailureReason::UnknownChannelType),
            other => Err(DecodeError::UnknownFailureCode(other)),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::None => write!(f, "none"),
            FailureReason::AdministrativelyProhibited => write!(f, "administratively prohibited"),
            FailureReason::ConnectFailed => write!(f, "connect failed"),
            FailureReason::UnknownChannelType => write!(f, "unknown channel type"),
        }
    }
}

/// Payload of `start-forward` / `cancel-forward`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForwardRequestPayload {
    pub bind_address: String,
    pub port: u32,
}

/// Payload of a `forward` channel-open
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForwardChannelPayload {
    pub originator_address: Option<String>,
    pub originator_port: Option<u32>,
    pub host: String,
    pub port: u32,
}

// Payload bytes are written as a single length-prefixed blob
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_codes() {
        assert_eq!(FailureReason::None.code(), 0);
        assert_eq!(FailureReason::AdministrativelyProhibited.code(), 1);
        assert_eq!(FailureReason::ConnectFailed.code(), 2);
        assert_eq!(FailureReason::UnknownChannelType.code(), 3);

        assert_eq!(
            FailureReason::try_from(3).unwrap(),
            FailureReason::UnknownChannelType
        );
        assert_eq!(
            FailureReason::try_from(9),
            Err(DecodeError::UnknownFailureCode(9))
        );
    }

    #[test]
    fn test_failure_reason_serialized_as_code() {
        let json = serde_json::to_string(&FailureReason::AdministrativelyProhibited).unwrap();
        assert_eq!(json, "1");

        let parsed: FailureReason = serde_json::from_str("2").unwrap();
        assert_eq!(parsed, FailureReason::ConnectFailed);

        assert!(serde_json::from_str::<FailureReason>("42").is_err());
    }

    #[test]
    fn test_channel_open_failure_wire_format() {
        let reply = ChannelOpenReply::failure(
            FailureReason::AdministrativelyProhibited,
            "remote forwarding disabled",
        );

        let serialized = bincode::serialize(&reply).unwrap();
        let deserialized: ChannelOpenReply = bincode::deserialize(&serialized).unwrap();

        assert_eq!(deserialized.reason(), FailureReason::AdministrativelyProhibited);
        if let ChannelOpenReply::Failure { description, .. } = deserialized {
            assert_eq!(description.as_deref(), Some("remote forwarding disabled"));
        } else {
            panic!("Expected Failure reply");
        }
    }

    #[test]
    fn test_session_reply_helpers() {
        let reply = SessionReply::with_port(5001);
        assert!(reply.is_success());
        assert_eq!(reply.allocated_port(), Some(5001));

        assert_eq!(SessionReply::success().allocated_port(), None);
        assert!(!SessionReply::Failure.is_success());
        assert_eq!(SessionReply::Failure.allocated_port(), None);
    }
}
