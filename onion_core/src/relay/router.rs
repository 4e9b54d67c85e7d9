/*! Reverse path routing of responses.

When a relay forwards an onion it names the outbound link with a fresh
`CircuitId` and remembers which inbound link it came from. The frame coming
back on the outbound link is rewritten to the inbound circuit id and handed to
the writer of the inbound connection.
*/

use std::collections::HashMap;
use std::sync::Arc;

use futures::SinkExt;
use futures::channel::mpsc;
use thiserror::Error;
use tokio::sync::RwLock;

use onion_packet::{CircuitId, ConnectionId, Frame};

/// Error that can happen when routing a frame back.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum RouteError {
    /// The outbound circuit id is already in use.
    #[error("Circuit {} is already registered", id)]
    AlreadyRegistered {
        /// Outbound circuit id.
        id: CircuitId,
    },
    /// No return path is known for the circuit id.
    #[error("No return path for circuit {}", id)]
    NotFound {
        /// Outbound circuit id.
        id: CircuitId,
    },
    /// The inbound connection is gone.
    #[error("Send frame to the previous hop error")]
    SendTo(mpsc::SendError),
}

/// Where a response for an outbound link should go.
#[derive(Clone, Debug)]
pub struct ReturnPath {
    /// Inbound connection the onion came from.
    pub connection: ConnectionId,
    /// Writer of the inbound connection.
    pub tx: mpsc::Sender<Frame>,
    /// Circuit id of the inbound link.
    pub return_id: CircuitId,
}

/// Map of outbound circuit ids to their return paths. Cloned routers share
/// the map.
#[derive(Clone, Default)]
pub struct ReversePathRouter {
    paths: Arc<RwLock<HashMap<CircuitId, ReturnPath>>>,
}

impl ReversePathRouter {
    /// Create an empty router.
    pub fn new() -> ReversePathRouter {
        Default::default()
    }

    /// Remember the return path of an outbound link.
    pub async fn register(&self, id: CircuitId, path: ReturnPath) -> Result<(), RouteError> {
        let mut paths = self.paths.write().await;
        if paths.contains_key(&id) {
            return Err(RouteError::AlreadyRegistered { id })
        }
        paths.insert(id, path);
        Ok(())
    }

    /** Deliver a frame that arrived on the outbound link `id` to the previous
    hop.

    The frame's circuit id is rewritten to the inbound one and the mapping is
    removed: every link carries exactly one response.
    */
    pub async fn route_back(&self, id: CircuitId, frame: Frame) -> Result<(), RouteError> {
        let path = self.paths.write().await.remove(&id)
            .ok_or(RouteError::NotFound { id })?;

        let ReturnPath { mut tx, return_id, .. } = path;
        tx.send(frame.with_circuit_id(return_id)).await
            .map_err(RouteError::SendTo)
    }

    /// Forget the return path of an outbound link.
    pub async fn remove(&self, id: CircuitId) -> Option<ReturnPath> {
        self.paths.write().await.remove(&id)
    }

    /// Forget every return path leading to the connection. Returns the number
    /// of removed paths.
    pub async fn release_connection(&self, connection: ConnectionId) -> usize {
        let mut paths = self.paths.write().await;
        let before = paths.len();
        paths.retain(|_, path| path.connection != connection);
        before - paths.len()
    }

    /// Number of known return paths.
    pub async fn len(&self) -> usize {
        self.paths.read().await.len()
    }

    /// Whether no return path is known.
    pub async fn is_empty(&self) -> bool {
        self.paths.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::StreamExt;

    use onion_packet::ErrorCode;

    #[tokio::test]
    async fn route_back_rewrites_circuit_id() {
        let router = ReversePathRouter::new();
        let (tx, mut rx) = mpsc::channel(1);
        let out_id = CircuitId::random();
        let in_id = CircuitId::random();
        router.register(out_id, ReturnPath {
            connection: ConnectionId::random(),
            tx,
            return_id: in_id,
        }).await.unwrap();

        let frame = Frame::Response { circuit_id: out_id, payload: vec![42; 10] };
        router.route_back(out_id, frame).await.unwrap();

        assert_eq!(rx.next().await.unwrap(), Frame::Response { circuit_id: in_id, payload: vec![42; 10] });
        assert!(router.is_empty().await);
    }

    #[tokio::test]
    async fn route_back_unknown() {
        let router = ReversePathRouter::new();
        let id = CircuitId::random();
        let frame = Frame::error(id, ErrorCode::UpstreamTimeout, "timeout");
        assert_eq!(router.route_back(id, frame).await, Err(RouteError::NotFound { id }));
    }

    #[tokio::test]
    async fn route_back_only_once() {
        let router = ReversePathRouter::new();
        let (tx, _rx) = mpsc::channel(2);
        let id = CircuitId::random();
        router.register(id, ReturnPath { connection: ConnectionId::random(), tx, return_id: CircuitId::random() }).await.unwrap();

        let frame = Frame::Response { circuit_id: id, payload: Vec::new() };
        assert!(router.route_back(id, frame.clone()).await.is_ok());
        assert_eq!(router.route_back(id, frame).await, Err(RouteError::NotFound { id }));
    }

    #[tokio::test]
    async fn route_back_closed_connection() {
        let router = ReversePathRouter::new();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let id = CircuitId::random();
        router.register(id, ReturnPath { connection: ConnectionId::random(), tx, return_id: CircuitId::random() }).await.unwrap();

        let frame = Frame::Response { circuit_id: id, payload: Vec::new() };
        assert!(matches!(router.route_back(id, frame).await, Err(RouteError::SendTo(_))));
    }

    #[tokio::test]
    async fn register_twice() {
        let router = ReversePathRouter::new();
        let (tx, _rx) = mpsc::channel(1);
        let id = CircuitId::random();
        let path = ReturnPath { connection: ConnectionId::random(), tx, return_id: CircuitId::random() };
        router.register(id, path.clone()).await.unwrap();
        assert_eq!(router.register(id, path).await, Err(RouteError::AlreadyRegistered { id }));
    }

    #[tokio::test]
    async fn release_connection() {
        let router = ReversePathRouter::new();
        let (tx, _rx) = mpsc::channel(1);
        let connection = ConnectionId::random();
        for _ in 0..3 {
            router.register(CircuitId::random(), ReturnPath { connection, tx: tx.clone(), return_id: CircuitId::random() }).await.unwrap();
        }
        let other = CircuitId::random();
        router.register(other, ReturnPath { connection: ConnectionId::random(), tx, return_id: CircuitId::random() }).await.unwrap();

        assert_eq!(router.release_connection(connection).await, 3);
        assert_eq!(router.len().await, 1);
        assert!(router.remove(other).await.is_some());
        assert!(router.is_empty().await);
    }
}
