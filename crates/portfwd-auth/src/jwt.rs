//! JWT (JSON Web Token) handling

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gate::Principal;

/// JWT claims for forwarding authorization
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForwardClaims {
    /// Subject (principal ID)
    pub sub: String,
    /// Issued at (timestamp)
    pub iat: i64,
    /// Expiration time (timestamp)
    pub exp: i64,
    /// Issuer
    pub iss: String,
    /// Audience
    pub aud: String,
    /// Custom: whether the holder may request forwards at all
    /// Default: None (assume allowed if not specified)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarding: Option<bool>,
    /// Custom: bind addresses the holder may listen on
    /// If None or empty, all addresses are allowed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_bind_addresses: Option<Vec<String>>,
    /// Custom: ports the holder may listen on
    /// If None or empty, all ports (including "assign any") are allowed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_ports: Option<Vec<u16>>,
}

impl ForwardClaims {
    pub fn new(subject: String, issuer: String, audience: String, validity: Duration) -> Self {
        let now = Utc::now();
        let exp = now + validity;

        Self {
            sub: subject,
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: issuer,
            aud: audience,
            forwarding: None,
            allowed_bind_addresses: None,
            allowed_ports: None,
        }
    }

    pub fn with_forwarding(mut self, enabled: bool) -> Self {
        self.forwarding = Some(enabled);
        self
    }

    /// An empty list lifts the restriction
    pub fn with_allowed_bind_addresses(mut self, addresses: Vec<String>) -> Self {
        self.allowed_bind_addresses = if addresses.is_empty() {
            None
        } else {
            Some(addresses)
        };
        self
    }

    /// An empty list lifts the restriction
    pub fn with_allowed_ports(mut self, ports: Vec<u16>) -> Self {
        self.allowed_ports = if ports.is_empty() { None } else { Some(ports) };
        self
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }

    /// Validate forwarding access for a bind address and port
    ///
    /// Returns Ok(()) if access is allowed, Err(String) with the reason otherwise.
    /// The reason is for local logs only and must not be sent to the peer.
    ///
    /// A port restriction never admits port 0: a holder limited to specific
    /// ports cannot ask the listener factory for an arbitrary one.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use portfwd_auth::ForwardClaims;
    /// use chrono::Duration;
    ///
    /// let claims = ForwardClaims::new(
    ///     "alice".to_string(),
    ///     "issuer".to_string(),
    ///     "audience".to_string(),
    ///     Duration::hours(1),
    /// )
    /// .with_allowed_bind_addresses(vec!["127.0.0.1".to_string()])
    /// .with_allowed_ports(vec![8080]);
    ///
    /// assert!(claims.validate_forward_access("127.0.0.1", 8080).is_ok());
    /// assert!(claims.validate_forward_access("0.0.0.0", 8080).is_err());
    /// assert!(claims.validate_forward_access("127.0.0.1", 0).is_err());
    /// ```
    pub fn validate_forward_access(&self, bind_address: &str, port: u16) -> Result<(), String> {
        if let Some(false) = self.forwarding {
            return Err("Forwarding is not allowed for this token".to_string());
        }

        if let Some(ref addresses) = self.allowed_bind_addresses {
            if !addresses.is_empty() && !addresses.iter().any(|a| a == bind_address) {
                return Err(format!(
                    "Access denied: bind address '{}' is not in allowed list",
                    bind_address
                ));
            }
        }

        if let Some(ref ports) = self.allowed_ports {
            if !ports.is_empty() && !ports.contains(&port) {
                return Err(format!(
                    "Access denied: port {} is not in allowed list",
                    port
                ));
            }
        }

        Ok(())
    }
}

/// JWT errors
#[derive(Debug, Error)]
pub enum JwtError {
    #[error("JWT encoding error: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),

    #[error("Token expired")]
    TokenExpired,
}

/// JWT validator
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    /// Create a new JWT validator using HMAC-SHA256 (symmetric secret)
    ///
    /// Validates signature and expiration only, unless issuer or audience
    /// are set with the builder methods.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn with_audience(mut self, audience: String) -> Self {
        self.validation.set_audience(&[audience]);
        self
    }

    pub fn with_issuer(mut self, issuer: String) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    pub fn validate(&self, token: &str) -> Result<ForwardClaims, JwtError> {
        let token_data = decode::<ForwardClaims>(token, &self.decoding_key, &self.validation)?;

        // jsonwebtoken applies a leeway; expiry is enforced exactly here
        if token_data.claims.is_expired() {
            return Err(JwtError::TokenExpired);
        }

        Ok(token_data.claims)
    }

    /// Validate a token and turn its claims into a principal
    pub fn principal(&self, token: &str) -> Result<Principal, JwtError> {
        let claims = self.validate(token)?;
        Ok(Principal::with_claims(claims))
    }

    /// Encode JWT using HMAC-SHA256 (symmetric secret)
    pub fn encode(secret: &[u8], claims: &ForwardClaims) -> Result<String, JwtError> {
        let header = Header::new(Algorithm::HS256);
        let encoding_key = EncodingKey::from_secret(secret);

        Ok(encode(&header, claims, &encoding_key)?)
    }
}
