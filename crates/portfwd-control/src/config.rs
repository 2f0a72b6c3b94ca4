//! Per-session forwarding configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Forwarding configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardingConfig {
    /// Accept `forward` channels initiated by the peer
    pub allow_remote_channels: bool,
    /// Upper bound on a single listener allocation
    #[serde(rename = "allocation_timeout_secs", with = "duration_secs")]
    pub allocation_timeout: Duration,
    /// Maximum concurrent grants per session (0 = unlimited)
    pub max_grants: usize,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            allow_remote_channels: true,
            allocation_timeout: Duration::from_secs(10),
            max_grants: 64,
        }
    }
}

impl ForwardingConfig {
    /// Parse a JSON document; absent fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_remote_channels(mut self, allowed: bool) -> Self {
        self.allow_remote_channels = allowed;
        self
    }

    pub fn with_allocation_timeout(mut self, timeout: Duration) -> Self {
        self.allocation_timeout = timeout;
        self
    }

    pub fn with_max_grants(mut self, max_grants: usize) -> Self {
        self.max_grants = max_grants;
        self
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
