//! Control plane for port forwarding sessions
//!
//! A [`ForwardingService`] owns the forwarding state of one session. It
//! answers `start-forward` / `cancel-forward` session requests and negotiates
//! `forward` channel opens against the grants those requests created.
pub mod allocator;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod negotiator;
pub mod session;
pub mod tracker;

pub use allocator::{ListenerFactory, RangePortAllocator, TcpListenerFactory};
pub use config::ForwardingConfig;
pub use dispatcher::RequestKind;
pub use error::{AllocationError, ChannelOpenError, ConflictError, ForwardError};
pub use handler::ForwardingService;
pub use session::{
    ChannelOrigin, SessionDriver, SessionEvent, SessionHandler, SessionLink, TransportError,
};
pub use tracker::{
    ForwardGrant, ForwardKey, ForwardObserver, ForwardingStateTracker, TrackerSnapshot,
};
