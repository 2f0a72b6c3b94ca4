//! Authorization gate consulted before any forwarding action

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::jwt::ForwardClaims;

/// The authenticated identity behind a session
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    pub id: String,
    /// Present when the session authenticated with a forwarding token
    pub claims: Option<ForwardClaims>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            claims: None,
        }
    }

    pub fn with_claims(claims: ForwardClaims) -> Self {
        Self {
            id: claims.sub.clone(),
            claims: Some(claims),
        }
    }
}

/// The (bind address, port) pair an action targets
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardResource {
    pub bind_address: String,
    pub port: u16,
}

impl ForwardResource {
    pub fn new(bind_address: impl Into<String>, port: u16) -> Self {
        Self {
            bind_address: bind_address.into(),
            port,
        }
    }
}

impl fmt::Display for ForwardResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bind_address, self.port)
    }
}

/// Pluggable authorization decision
pub trait ForwardPolicy: Send + Sync {
    fn is_authorized(&self, principal: &Principal, resource: &ForwardResource) -> bool;
}

/// Permits every request
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ForwardPolicy for AllowAll {
    fn is_authorized(&self, _principal: &Principal, _resource: &ForwardResource) -> bool {
        true
    }
}

/// Rejects every request
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl ForwardPolicy for DenyAll {
    fn is_authorized(&self, _principal: &Principal, _resource: &ForwardResource) -> bool {
        false
    }
}

/// Decides from the principal's token claims
///
/// Principals that did not authenticate with a token are denied.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClaimsPolicy;

impl ForwardPolicy for ClaimsPolicy {
    fn is_authorized(&self, principal: &Principal, resource: &ForwardResource) -> bool {
        let Some(ref claims) = principal.claims else {
            debug!(principal = %principal.id, "Principal has no forwarding claims");
            return false;
        };

        if claims.is_expired() {
            debug!(principal = %principal.id, "Forwarding claims expired");
            return false;
        }

        match claims.validate_forward_access(&resource.bind_address, resource.port) {
            Ok(()) => true,
            Err(reason) => {
                debug!(principal = %principal.id, %resource, "{}", reason);
                false
            }
        }
    }
}

/// Authorization denial
///
/// Only ever logged locally; the peer sees a bare failure reply.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Principal '{principal}' is not authorized to forward {resource}")]
pub struct AuthorizationError {
    pub principal: String,
    pub resource: ForwardResource,
}

/// Runs the configured policy before a forwarding action
#[derive(Clone)]
pub struct AuthorizationGate {
    policy: Arc<dyn ForwardPolicy>,
}

impl AuthorizationGate {
    pub fn new(policy: Arc<dyn ForwardPolicy>) -> Self {
        Self { policy }
    }

    pub fn allow_all() -> Self {
        Self::new(Arc::new(AllowAll))
    }

    pub fn check(
        &self,
        principal: &Principal,
        bind_address: &str,
        port: u16,
    ) -> Result<(), AuthorizationError> {
        let resource = ForwardResource::new(bind_address, port);

        if self.policy.is_authorized(principal, &resource) {
            debug!(principal = %principal.id, %resource, "Forward authorized");
            Ok(())
        } else {
            warn!(principal = %principal.id, %resource, "Forward not authorized");
            Err(AuthorizationError {
                principal: principal.id.clone(),
                resource,
            })
        }
    }
}

impl Default for AuthorizationGate {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl fmt::Debug for AuthorizationGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationGate").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token_principal(claims: ForwardClaims) -> Principal {
        Principal::with_claims(claims)
    }

    fn claims() -> ForwardClaims {
        ForwardClaims::new(
            "alice".to_string(),
            "issuer".to_string(),
            "audience".to_string(),
            Duration::hours(1),
        )
    }

    #[test]
    fn test_allow_all_gate() {
        let gate = AuthorizationGate::allow_all();
        assert!(gate.check(&Principal::new("anyone"), "0.0.0.0", 0).is_ok());
    }

    #[test]
    fn test_deny_all_gate_reports_resource() {
        let gate = AuthorizationGate::new(Arc::new(DenyAll));
        let err = gate.check(&Principal::new("mallory"), "0.0.0.0", 22).unwrap_err();

        assert_eq!(err.principal, "mallory");
        assert_eq!(err.resource, ForwardResource::new("0.0.0.0", 22));
        assert_eq!(
            err.to_string(),
            "Principal 'mallory' is not authorized to forward 0.0.0.0:22"
        );
    }

    #[test]
    fn test_claims_policy_requires_claims() {
        let gate = AuthorizationGate::new(Arc::new(ClaimsPolicy));
        assert!(gate.check(&Principal::new("anonymous"), "0.0.0.0", 8080).is_err());
    }

    #[test]
    fn test_claims_policy_applies_restrictions() {
        let gate = AuthorizationGate::new(Arc::new(ClaimsPolicy));
        let principal = token_principal(
            claims()
                .with_allowed_bind_addresses(vec!["127.0.0.1".to_string()])
                .with_allowed_ports(vec![8080]),
        );

        assert_eq!(principal.id, "alice");
        assert!(gate.check(&principal, "127.0.0.1", 8080).is_ok());
        assert!(gate.check(&principal, "127.0.0.1", 8081).is_err());
        assert!(gate.check(&principal, "0.0.0.0", 8080).is_err());
    }

    #[test]
    fn test_claims_policy_rejects_expired_claims() {
        let mut expired = claims();
        expired.exp = chrono::Utc::now().timestamp() - 60;

        let gate = AuthorizationGate::new(Arc::new(ClaimsPolicy));
        assert!(gate.check(&token_principal(expired), "0.0.0.0", 8080).is_err());
    }

    #[test]
    fn test_custom_policy_hook() {
        struct LoopbackOnly;
        impl ForwardPolicy for LoopbackOnly {
            fn is_authorized(&self, _principal: &Principal, resource: &ForwardResource) -> bool {
                resource.bind_address == "127.0.0.1" || resource.bind_address == "localhost"
            }
        }

        let gate = AuthorizationGate::new(Arc::new(LoopbackOnly));
        assert!(gate.check(&Principal::new("bob"), "localhost", 0).is_ok());
        assert!(gate.check(&Principal::new("bob"), "0.0.0.0", 0).is_err());
    }
}
