//! Error types for forwarding control

use portfwd_auth::AuthorizationError;
use portfwd_proto::{DecodeError, FailureReason};
use std::time::Duration;
use thiserror::Error;

use crate::session::TransportError;

/// Listener factory failures
///
/// Logged locally, surfaced to the peer as a bare failure reply.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("Failed to bind to {address}:{port}: {reason}")]
    BindFailed {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Port {port} is already allocated on {address}")]
    PortInUse { address: String, port: u16 },

    #[error("Port allocator exhausted: no free port in {start}..={end}")]
    Exhausted { start: u16, end: u16 },

    #[error("Listener factory returned port 0")]
    NoPortAssigned,

    #[error("Allocation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Allocation cancelled")]
    Cancelled,
}

/// A grant already exists for the key
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Forward {bind_address}:{port} already exists")]
pub struct ConflictError {
    pub bind_address: String,
    pub port: u16,
}

/// Channel-open rejection, the only error whose detail crosses the wire
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Channel open failed ({reason}): {}", .description.as_deref().unwrap_or("no description"))]
pub struct ChannelOpenError {
    pub reason: FailureReason,
    pub description: Option<String>,
}

impl ChannelOpenError {
    pub fn new(reason: FailureReason, description: impl Into<String>) -> Self {
        Self {
            reason,
            description: Some(description.into()),
        }
    }
}

/// Everything that can turn a session request into a failure reply
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("No active forward for {bind_address}:{port}")]
    NotFound { bind_address: String, port: u16 },

    #[error("Forward limit of {0} reached")]
    LimitReached(usize),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
