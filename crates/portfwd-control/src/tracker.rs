//! Forwarding state tracking
//!
//! The tracker is the single owner of the grant table of one session and of
//! the association between grants and the channels opened against them.
//! Everything else reads and mutates forwarding state through it.

use portfwd_proto::{ChannelId, ForwardRequest};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::ConflictError;

/// Key identifying a grant: the bind address and the port actually bound
///
/// Requests for port 0 never conflict with each other, since each one is
/// keyed by whatever port the listener factory handed out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForwardKey {
    pub bind_address: String,
    pub port: u16,
}

impl ForwardKey {
    pub fn new(bind_address: impl Into<String>, port: u16) -> Self {
        Self {
            bind_address: bind_address.into(),
            port,
        }
    }
}

impl fmt::Display for ForwardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bind_address, self.port)
    }
}

/// Authoritative record of a live forwarding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardGrant {
    pub bind_address: String,
    pub bound_port: u16,
    /// None when the request asked for any port
    pub requested_port: Option<u16>,
    pub active: bool,
}

impl ForwardGrant {
    pub fn new(request: &ForwardRequest, bound_port: u16) -> Self {
        Self {
            bind_address: request.bind_address.clone(),
            bound_port,
            requested_port: (!request.wants_any_port()).then_some(request.port),
            active: true,
        }
    }

    pub fn key(&self) -> ForwardKey {
        ForwardKey::new(self.bind_address.clone(), self.bound_port)
    }
}

/// Notified when grants appear or disappear
pub trait ForwardObserver: Send + Sync {
    fn grant_registered(&self, _grant: &ForwardGrant) {}

    fn grant_closed(&self, _grant: &ForwardGrant, _severed: &[ChannelId]) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct GrantEntry {
    grant: ForwardGrant,
    channels: Vec<ChannelId>,
}

/// Point-in-time copy of the tracker contents, ordered by key
pub type TrackerSnapshot = BTreeMap<ForwardKey, (ForwardGrant, Vec<ChannelId>)>;

/// Owns the grants of one session and their channels
#[derive(Default)]
pub struct ForwardingStateTracker {
    grants: HashMap<ForwardKey, GrantEntry>,
    channels: HashMap<ChannelId, ForwardKey>,
    observer: Option<Arc<dyn ForwardObserver>>,
}

impl ForwardingStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(mut self, observer: Arc<dyn ForwardObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Register a new grant (fails if the key already has one)
    ///
    /// Duplicates are rejected rather than merged; callers wanting idempotent
    /// behaviour look the key up first.
    pub fn register(&mut self, mut grant: ForwardGrant) -> Result<(), ConflictError> {
        let key = grant.key();

        if self.grants.contains_key(&key) {
            warn!(forward = %key, "Rejected duplicate forward grant");
            return Err(ConflictError {
                bind_address: key.bind_address,
                port: key.port,
            });
        }

        grant.active = true;
        info!(
            forward = %key,
            requested_port = ?grant.requested_port,
            "Registered forward grant"
        );

        if let Some(ref observer) = self.observer {
            observer.grant_registered(&grant);
        }
        self.grants.insert(
            key,
            GrantEntry {
                grant,
                channels: Vec::new(),
            },
        );
        Ok(())
    }

    /// Look up the active grant for a bind address and port
    pub fn lookup(&self, bind_address: &str, port: u16) -> Option<&ForwardGrant> {
        self.grants
            .get(&ForwardKey::new(bind_address, port))
            .map(|entry| &entry.grant)
            .filter(|grant| grant.active)
    }

    /// Associate an accepted channel with a grant
    ///
    /// A channel belongs to at most one grant; attaching it elsewhere moves
    /// it. Returns false when the key has no active grant.
    pub fn attach_channel(&mut self, key: &ForwardKey, channel: ChannelId) -> bool {
        if !matches!(self.grants.get(key), Some(entry) if entry.grant.active) {
            return false;
        }

        if let Some(previous) = self.channels.insert(channel, key.clone()) {
            if previous != *key {
                if let Some(entry) = self.grants.get_mut(&previous) {
                    entry.channels.retain(|c| *c != channel);
                }
                warn!(
                    channel,
                    from = %previous,
                    to = %key,
                    "Channel moved between forwards"
                );
            }
        }

        if let Some(entry) = self.grants.get_mut(key) {
            if !entry.channels.contains(&channel) {
                entry.channels.push(channel);
            }
        }
        debug!(forward = %key, channel, "Attached channel to forward");
        true
    }

    /// Forget a channel the peer already closed
    pub fn detach_channel(&mut self, channel: ChannelId) -> Option<ForwardKey> {
        let key = self.channels.remove(&channel)?;
        if let Some(entry) = self.grants.get_mut(&key) {
            entry.channels.retain(|c| *c != channel);
        }
        debug!(forward = %key, channel, "Detached channel from forward");
        Some(key)
    }

    /// Close a grant and every channel opened against it
    ///
    /// The grant is marked inactive first so lookups made while channels are
    /// being severed already miss it; it is removed from the table last.
    pub fn close(
        &mut self,
        key: &ForwardKey,
        mut sever: impl FnMut(ChannelId),
    ) -> Option<ForwardGrant> {
        let channels = {
            let entry = self.grants.get_mut(key)?;
            entry.grant.active = false;
            std::mem::take(&mut entry.channels)
        };

        for channel in &channels {
            self.channels.remove(channel);
            sever(*channel);
        }

        let entry = self.grants.remove(key)?;
        info!(
            forward = %key,
            severed = channels.len(),
            "Closed forward grant"
        );

        if let Some(ref observer) = self.observer {
            observer.grant_closed(&entry.grant, &channels);
        }
        Some(entry.grant)
    }

    /// Close every grant, as on session teardown
    pub fn close_all(&mut self, mut sever: impl FnMut(ChannelId)) -> Vec<ForwardGrant> {
        let mut keys: Vec<ForwardKey> = self.grants.keys().cloned().collect();
        keys.sort();

        keys.iter()
            .filter_map(|key| self.close(key, &mut sever))
            .collect()
    }

    /// Channels currently associated with a grant
    pub fn channels_for(&self, key: &ForwardKey) -> &[ChannelId] {
        self.grants
            .get(key)
            .map(|entry| entry.channels.as_slice())
            .unwrap_or(&[])
    }

    pub fn grant_for_channel(&self, channel: ChannelId) -> Option<&ForwardKey> {
        self.channels.get(&channel)
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        self.grants
            .iter()
            .map(|(key, entry)| {
                (
                    key.clone(),
                    (entry.grant.clone(), entry.channels.clone()),
                )
            })
            .collect()
    }
}

impl fmt::Debug for ForwardingStateTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardingStateTracker")
            .field("grants", &self.grants)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}
