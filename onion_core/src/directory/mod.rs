/*! Node directory: registration and listing of relay nodes.

The core only consumes the directory through the `NodeDirectory` trait.
`MemoryDirectory` keeps the table in process (the directory server is built on
it), `HttpDirectory` talks to a remote directory server.
*/

mod errors;
mod http;
mod memory;

pub use self::errors::*;
pub use self::http::HttpDirectory;
pub use self::memory::{MemoryDirectory, FRESHNESS_WINDOW};

use async_trait::async_trait;

use onion_packet::{NodeDescriptor, Role};

/// Registry of currently reachable relay nodes.
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    /// Register a node or refresh its registration.
    async fn register(&self, descriptor: NodeDescriptor) -> Result<(), DirectoryError>;

    /// List nodes registered within the freshness window, optionally only
    /// those with the given role. Order is irrelevant.
    async fn list(&self, role: Option<Role>) -> Result<Vec<NodeDescriptor>, DirectoryError>;
}
