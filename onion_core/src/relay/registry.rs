/*! Table of connections accepted by a relay node.
*/

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::RwLock;

use onion_packet::{CircuitId, ConnectionId};

use crate::time::*;

/// Default maximum number of connections a relay node handles at once.
pub const DEFAULT_MAX_CONNECTIONS: usize = 512;

/// Error that can happen when registering a connection.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum RegistryError {
    /// Connection limit is reached.
    #[error("Connection limit of {} is reached", limit)]
    Overloaded {
        /// Maximum number of connections.
        limit: usize,
    },
}

/// Processing stage of an inbound connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, waiting for the first frame.
    Accepted,
    /// Peeling the onion layer.
    Decrypting,
    /// Passing the onion to the next hop.
    Forwarding,
    /// Executing the exit request.
    Terminating,
    /// Waiting for the next hop to answer.
    AwaitingResponse,
    /// Sending the answer to the previous hop.
    RespondingBack,
    /// Finished.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Inbound connection of a relay node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connection {
    /// Node-local identifier.
    pub id: ConnectionId,
    /// Address of the previous hop.
    pub peer: SocketAddr,
    /// Processing stage.
    pub state: ConnectionState,
    /// Circuit id of the inbound link, known after the first frame.
    pub circuit_id: Option<CircuitId>,
    /// Next hop, known after the onion layer is peeled.
    pub next_hop: Option<SocketAddr>,
    /// When the connection was accepted.
    pub opened: Instant,
}

/** Connections currently handled by a relay node.

Cloned registries share the table. Mutations take the write lock, listing
takes the read lock.
*/
#[derive(Clone)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<ConnectionId, Connection>>>,
    limit: usize,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        ConnectionRegistry::new(DEFAULT_MAX_CONNECTIONS)
    }
}

impl ConnectionRegistry {
    /// Create a registry accepting at most `limit` connections.
    pub fn new(limit: usize) -> ConnectionRegistry {
        ConnectionRegistry {
            connections: Arc::new(RwLock::new(HashMap::new())),
            limit,
        }
    }

    /// Maximum number of connections.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Register a new connection in the `Accepted` state.
    pub async fn insert(&self, peer: SocketAddr) -> Result<ConnectionId, RegistryError> {
        let mut connections = self.connections.write().await;
        if connections.len() >= self.limit {
            return Err(RegistryError::Overloaded { limit: self.limit })
        }

        let id = ConnectionId::random();
        connections.insert(id, Connection {
            id,
            peer,
            state: ConnectionState::Accepted,
            circuit_id: None,
            next_hop: None,
            opened: clock_now(),
        });
        Ok(id)
    }

    /// Move a connection to another state. Returns `false` if the connection
    /// is unknown.
    pub async fn set_state(&self, id: ConnectionId, state: ConnectionState) -> bool {
        self.update(id, |connection| connection.state = state).await
    }

    /// Remember the circuit id of the inbound link.
    pub async fn set_circuit(&self, id: ConnectionId, circuit_id: CircuitId) -> bool {
        self.update(id, |connection| connection.circuit_id = Some(circuit_id)).await
    }

    /// Remember the address of the next hop.
    pub async fn set_next_hop(&self, id: ConnectionId, next_hop: SocketAddr) -> bool {
        self.update(id, |connection| connection.next_hop = Some(next_hop)).await
    }

    async fn update<F: FnOnce(&mut Connection)>(&self, id: ConnectionId, f: F) -> bool {
        match self.connections.write().await.get_mut(&id) {
            Some(connection) => {
                f(connection);
                true
            },
            None => false,
        }
    }

    /// Get a connection by its id.
    pub async fn get(&self, id: ConnectionId) -> Option<Connection> {
        self.connections.read().await.get(&id).cloned()
    }

    /// Snapshot of all connections.
    pub async fn list(&self) -> Vec<Connection> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Number of connections.
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Whether there are no connections.
    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Release a connection. Returns its final entry in the `Closed` state.
    pub async fn remove(&self, id: ConnectionId) -> Option<Connection> {
        self.connections.write().await.remove(&id).map(|mut connection| {
            connection.state = ConnectionState::Closed;
            connection
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:12345".parse().unwrap()
    }

    #[tokio::test]
    async fn insert_and_update() {
        let registry = ConnectionRegistry::default();
        let id = registry.insert(peer()).await.unwrap();

        let connection = registry.get(id).await.unwrap();
        assert_eq!(connection.state, ConnectionState::Accepted);
        assert_eq!(connection.peer, peer());
        assert_eq!(connection.circuit_id, None);

        let circuit_id = CircuitId::random();
        let next_hop = "127.0.0.1:2".parse().unwrap();
        assert!(registry.set_state(id, ConnectionState::Forwarding).await);
        assert!(registry.set_circuit(id, circuit_id).await);
        assert!(registry.set_next_hop(id, next_hop).await);

        let connection = registry.get(id).await.unwrap();
        assert_eq!(connection.state, ConnectionState::Forwarding);
        assert_eq!(connection.circuit_id, Some(circuit_id));
        assert_eq!(connection.next_hop, Some(next_hop));
    }

    #[tokio::test]
    async fn update_unknown() {
        let registry = ConnectionRegistry::default();
        assert!(!registry.set_state(ConnectionId::random(), ConnectionState::Closed).await);
        assert!(!registry.set_circuit(ConnectionId::random(), CircuitId::random()).await);
    }

    #[tokio::test]
    async fn overloaded() {
        let registry = ConnectionRegistry::new(2);
        let first = registry.insert(peer()).await.unwrap();
        registry.insert(peer()).await.unwrap();
        assert_eq!(registry.insert(peer()).await, Err(RegistryError::Overloaded { limit: 2 }));

        registry.remove(first).await;
        assert!(registry.insert(peer()).await.is_ok());
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn remove() {
        let registry = ConnectionRegistry::default();
        let id = registry.insert(peer()).await.unwrap();
        let connection = registry.remove(id).await.unwrap();
        assert_eq!(connection.state, ConnectionState::Closed);
        assert!(registry.remove(id).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn list() {
        let registry = ConnectionRegistry::default();
        let first = registry.insert(peer()).await.unwrap();
        let second = registry.clone().insert(peer()).await.unwrap();
        let mut ids = registry.list().await.into_iter().map(|c| c.id).collect::<Vec<_>>();
        ids.sort();
        let mut expected = vec![first, second];
        expected.sort();
        assert_eq!(ids, expected);
    }
}
