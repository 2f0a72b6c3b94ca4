//! Listener factories used to back a forwarding grant with a port

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::error::AllocationError;

/// Allocates the port a forward listens on
#[async_trait]
pub trait ListenerFactory: Send + Sync {
    /// Allocate a port on `address`
    /// If desired_port is 0, allocate any available port
    /// Otherwise try exactly that port and fail if it is unavailable
    async fn allocate(&self, address: &str, desired_port: u16) -> Result<u16, AllocationError>;

    /// Give a previously allocated port back
    fn release(&self, address: &str, port: u16);
}

/// In-memory allocator handing out ports from a fixed range
///
/// Nothing is bound; the caller is expected to listen on the port itself.
/// An explicit desired port is honoured even outside the range as long as it
/// is not already allocated on the same address.
pub struct RangePortAllocator {
    start: u16,
    end: u16,
    state: Mutex<RangeState>,
}

struct RangeState {
    allocated: HashSet<(String, u16)>,
    next_port: u16,
}

impl RangePortAllocator {
    /// Create a new allocator for `start..=end`
    pub fn with_range(start: u16, end: u16) -> Self {
        let start = start.max(1);
        let end = end.max(start);

        Self {
            start,
            end,
            state: Mutex::new(RangeState {
                allocated: HashSet::new(),
                next_port: start,
            }),
        }
    }

    pub fn is_allocated(&self, address: &str, port: u16) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.allocated.contains(&(address.to_string(), port))
    }

    pub fn allocated_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.allocated.len()
    }
}

#[async_trait]
impl ListenerFactory for RangePortAllocator {
    async fn allocate(&self, address: &str, desired_port: u16) -> Result<u16, AllocationError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if desired_port != 0 {
            if !state.allocated.insert((address.to_string(), desired_port)) {
                return Err(AllocationError::PortInUse {
                    address: address.to_string(),
                    port: desired_port,
                });
            }
            debug!("Allocated requested port {} on {}", desired_port, address);
            return Ok(desired_port);
        }

        // Walk the range once, starting after the last handed-out port
        let span = u32::from(self.end - self.start) + 1;
        for _ in 0..span {
            let port = state.next_port;
            state.next_port = if port >= self.end { self.start } else { port + 1 };

            if state.allocated.insert((address.to_string(), port)) {
                debug!("Auto-allocated port {} on {}", port, address);
                return Ok(port);
            }
        }

        Err(AllocationError::Exhausted {
            start: self.start,
            end: self.end,
        })
    }

    fn release(&self, address: &str, port: u16) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.allocated.remove(&(address.to_string(), port)) {
            warn!("Released port {} on {} that was not allocated", port, address);
        }
    }
}

/// Binds real TCP listeners and keeps them open until released
///
/// Port 0 lets the operating system choose. The relay that serves a forward
/// takes the bound listener with [`TcpListenerFactory::take_listener`].
#[derive(Default)]
pub struct TcpListenerFactory {
    listeners: DashMap<(String, u16), TcpListener>,
}

impl TcpListenerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand the bound listener over to whoever relays the forward
    pub fn take_listener(&self, address: &str, port: u16) -> Option<TcpListener> {
        self.listeners
            .remove(&(address.to_string(), port))
            .map(|(_, listener)| listener)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

#[async_trait]
impl ListenerFactory for TcpListenerFactory {
    async fn allocate(&self, address: &str, desired_port: u16) -> Result<u16, AllocationError> {
        let bind_error = |reason: String| AllocationError::BindFailed {
            address: address.to_string(),
            port: desired_port,
            reason,
        };

        let listener = TcpListener::bind((address, desired_port))
            .await
            .map_err(|e| bind_error(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| bind_error(e.to_string()))?
            .port();

        info!("Listening for forwarded connections on {}:{}", address, port);
        self.listeners.insert((address.to_string(), port), listener);
        Ok(port)
    }

    fn release(&self, address: &str, port: u16) {
        if self.listeners.remove(&(address.to_string(), port)).is_some() {
            info!("Closed forwarded listener {}:{}", address, port);
        } else {
            debug!("No listener held for {}:{} (already taken or released)", address, port);
        }
    }
}
