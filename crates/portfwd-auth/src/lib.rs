//! Authorization for forwarding requests
//!
//! A principal carries the identity the session authenticated and, when the
//! session was opened with a token, the forwarding claims from that token.
//! The [`AuthorizationGate`] asks a pluggable [`ForwardPolicy`] whether the
//! principal may act on a given bind address and port.

pub mod gate;
pub mod jwt;

pub use gate::{
    AllowAll, AuthorizationError, AuthorizationGate, ClaimsPolicy, DenyAll, ForwardPolicy,
    ForwardResource, Principal,
};
pub use jwt::{ForwardClaims, JwtError, JwtValidator};

// Re-export useful types
pub use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Validation};
