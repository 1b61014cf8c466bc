//! Host port allocation for container port mappings.

use std::collections::BTreeSet;
use tokio::net::TcpListener;
use tracing::debug;

use crate::error::{ExecError, Result};

// Bind attempts per requested port before giving up.
const BINDS_PER_PORT: usize = 16;

#[derive(Clone, Debug)]
pub struct PortAllocator {
    bind_host: String,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new("0.0.0.0")
    }
}

impl PortAllocator {
    pub fn new(bind_host: impl Into<String>) -> Self {
        Self {
            bind_host: bind_host.into(),
        }
    }

    /// Returns `count` distinct ports that could be bound when checked.
    ///
    /// The ports are released before returning, so another process may grab
    /// one before the container does; callers treat that as a retryable start
    /// failure.
    pub async fn allocate(&self, count: usize) -> Result<Vec<u16>> {
        let budget = count.max(1) * BINDS_PER_PORT;
        let mut held = Vec::with_capacity(count);
        let mut ports = BTreeSet::new();
        let mut tries = 0;
        while ports.len() < count {
            if tries == budget {
                return Err(ExecError::PortExhausted { attempts: tries });
            }
            tries += 1;
            let listener = match TcpListener::bind((self.bind_host.as_str(), 0)).await {
                Ok(l) => l,
                Err(e) => {
                    debug!("port bind failed: {}", e);
                    continue;
                }
            };
            let port = listener.local_addr()?.port();
            if ports.insert(port) {
                // keep it bound so the OS cannot hand it out twice
                held.push(listener);
            }
        }
        drop(held);
        debug!(?ports, "allocated host ports");
        Ok(ports.into_iter().collect())
    }
}
