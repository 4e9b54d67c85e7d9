/*! In-process directory table.
*/

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use tokio::sync::RwLock;

use onion_packet::{NodeDescriptor, NodeId, Role};

use crate::directory::{DirectoryError, NodeDirectory};
use crate::time::*;

/// Nodes not re-registered within this window are hidden from listings.
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug)]
struct Entry {
    descriptor: NodeDescriptor,
    registered: Instant,
}

/** Directory that keeps descriptors in memory.

Stale descriptors are never deleted, only filtered out of listings, so a node
that comes back by registering again is immediately visible.
*/
#[derive(Clone)]
pub struct MemoryDirectory {
    nodes: Arc<RwLock<HashMap<NodeId, Entry>>>,
    freshness: Duration,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        MemoryDirectory::new(FRESHNESS_WINDOW)
    }
}

impl MemoryDirectory {
    /// Create an empty directory with the given freshness window.
    pub fn new(freshness: Duration) -> MemoryDirectory {
        MemoryDirectory {
            nodes: Arc::new(RwLock::new(HashMap::new())),
            freshness,
        }
    }

    /// Freshness window of the directory.
    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    /// Number of known descriptors, stale ones included.
    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    /// Check if no node has ever registered.
    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }
}

#[async_trait]
impl NodeDirectory for MemoryDirectory {
    async fn register(&self, mut descriptor: NodeDescriptor) -> Result<(), DirectoryError> {
        descriptor.last_seen = unix_time(SystemTime::now());
        debug!("Registered {} node {} at {}", descriptor.role, descriptor.id, descriptor.address);

        let entry = Entry {
            descriptor,
            registered: clock_now(),
        };
        self.nodes.write().await.insert(entry.descriptor.id, entry);
        Ok(())
    }

    async fn list(&self, role: Option<Role>) -> Result<Vec<NodeDescriptor>, DirectoryError> {
        let nodes = self.nodes.read().await;
        let descriptors = nodes.values()
            .filter(|entry| clock_elapsed(entry.registered) <= self.freshness)
            .filter(|entry| role.map_or(true, |role| entry.descriptor.role == role))
            .map(|entry| entry.descriptor.clone())
            .collect();
        Ok(descriptors)
    }
}
