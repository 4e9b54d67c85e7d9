/*! Client side of the overlay.

`OnionClient` builds circuits, sends requests through them and opens the
sealed responses. It is the surface a front end drives.
*/

use std::io::Error as IoError;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use onion_binary_io::*;
use onion_crypto::onion::DecryptLayerError;
use onion_packet::*;

use crate::circuit::*;
use crate::relay::codec::FrameCodec;
use crate::stats::Stats;

/// Default timeout of dialling the guard.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout of waiting for a response. Longer than the timeouts of the
/// hops so their `Error` frames arrive first.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(45);

/// Error that can happen when sending a request through a circuit.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum SendError {
    /// No circuit with this id.
    #[error("Circuit {} is not found", id)]
    CircuitNotFound {
        /// Requested circuit id.
        id: CircuitId,
    },
    /// The request can't be wrapped for the circuit.
    #[error("Onion encryption error")]
    Encrypt,
    /// The guard or a later hop can't be reached.
    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),
    /// No answer in time.
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),
    /// The exit failed to execute the request.
    #[error("External operation failure: {0}")]
    ExternalOperationFailure(String),
    /// Some hop failed to peel its layer, or the response can't be opened.
    #[error("Decryption failure: {0}")]
    DecryptionFailure(String),
    /// Some hop or the client got a frame it can't parse.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
    /// A hop has too many connections.
    #[error("Relay overloaded: {0}")]
    Overloaded(String),
    /// A hop got an instruction that doesn't fit its role.
    #[error("Unexpected instruction: {0}")]
    UnexpectedInstruction(String),
}

impl SendError {
    fn from_error_frame(code: ErrorCode, message: String) -> SendError {
        match code {
            ErrorCode::MalformedPacket => SendError::MalformedPacket(message),
            ErrorCode::DecryptionFailure => SendError::DecryptionFailure(message),
            ErrorCode::UpstreamUnreachable => SendError::UpstreamUnreachable(message),
            ErrorCode::UpstreamTimeout => SendError::UpstreamTimeout(message),
            ErrorCode::ExternalOperationFailure => SendError::ExternalOperationFailure(message),
            ErrorCode::UnexpectedInstruction => SendError::UnexpectedInstruction(message),
            ErrorCode::Overloaded => SendError::Overloaded(message),
        }
    }

    fn unreachable(error: IoError) -> SendError {
        SendError::UpstreamUnreachable(error.to_string())
    }
}

impl From<DecryptLayerError> for SendError {
    fn from(error: DecryptLayerError) -> SendError {
        SendError::DecryptionFailure(error.to_string())
    }
}

/** Client of the overlay.

Circuits survive failed requests: it's up to the caller to destroy a circuit
that keeps failing and to create a new one.
*/
#[derive(Clone)]
pub struct OnionClient {
    builder: CircuitBuilder,
    dial_timeout: Duration,
    response_timeout: Duration,
    stats: Stats,
}

impl OnionClient {
    /// Create a client building circuits with `builder`.
    pub fn new(builder: CircuitBuilder) -> OnionClient {
        OnionClient {
            builder,
            dial_timeout: DIAL_TIMEOUT,
            response_timeout: RESPONSE_TIMEOUT,
            stats: Stats::new(),
        }
    }

    /// Set the timeout of dialling the guard.
    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> OnionClient {
        self.dial_timeout = dial_timeout;
        self
    }

    /// Set the timeout of waiting for a response.
    pub fn with_response_timeout(mut self, response_timeout: Duration) -> OnionClient {
        self.response_timeout = response_timeout;
        self
    }

    /// Frame counters of the client.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Build a new circuit.
    pub async fn create_circuit(&self) -> Result<Circuit, CreateCircuitError> {
        self.builder.create_circuit().await
    }

    /// All circuits of the client.
    pub async fn list_circuits(&self) -> Vec<Circuit> {
        self.builder.list_circuits().await
    }

    /// Get a circuit by its id.
    pub async fn get_circuit(&self, id: CircuitId) -> Option<Circuit> {
        self.builder.get_circuit(id).await
    }

    /// Destroy a circuit. Destroying an unknown circuit does nothing.
    pub async fn destroy_circuit(&self, id: CircuitId) -> bool {
        self.builder.destroy_circuit(id).await
    }

    /** Send `request` through the circuit and wait for the response.

    The onion goes to the guard on a new connection named by a fresh link
    circuit id, and exactly one frame is expected back.
    */
    pub async fn send(&self, id: CircuitId, request: ExitRequest) -> Result<ExitResponse, SendError> {
        let circuit = self.builder.get_circuit(id).await
            .ok_or(SendError::CircuitNotFound { id })?;
        let guard = circuit.guard()
            .ok_or(SendError::CircuitNotFound { id })?
            .clone();

        let (onion, key) = circuit.seal_request(&request)
            .map_err(|e| {
                debug!("Failed to seal request for circuit {}: {}", id, e);
                SendError::Encrypt
            })?;

        let stream = timeout(self.dial_timeout, TcpStream::connect(guard.address)).await
            .map_err(|_| SendError::UpstreamUnreachable(format!("dial {} timed out", guard.address)))?
            .map_err(SendError::unreachable)?;

        let link_id = CircuitId::random();
        let mut link = Framed::new(stream, FrameCodec::new(self.stats.clone()));
        link.send(Frame::Forward { circuit_id: link_id, onion: onion.into_bytes() }).await
            .map_err(|e| SendError::UpstreamUnreachable(e.to_string()))?;

        trace!("Sent {} through circuit {} as {}", request, id, link_id);

        let frame = timeout(self.response_timeout, link.next()).await
            .map_err(|_| SendError::UpstreamTimeout("no response from the circuit".to_owned()))?
            .ok_or_else(|| SendError::UpstreamUnreachable("guard closed the connection".to_owned()))?
            .map_err(|e| SendError::MalformedPacket(e.to_string()))?;

        let payload = match frame {
            Frame::Response { circuit_id, payload } if circuit_id == link_id => payload,
            Frame::Error { circuit_id, code, message } if circuit_id == link_id =>
                return Err(SendError::from_error_frame(code, message)),
            frame => return Err(SendError::MalformedPacket(format!("unexpected frame {:?}", frame.circuit_id()))),
        };

        let bytes = key.open(&payload)?;
        let (_, response) = ExitResponse::from_bytes(&bytes)
            .map_err(|e| SendError::MalformedPacket(e.to_string()))?;

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use tokio::net::TcpListener;

    use onion_crypto::gen_keypair;

    use crate::directory::*;

    async fn client_with_exit(address: std::net::SocketAddr) -> (OnionClient, Circuit) {
        let directory = MemoryDirectory::default();
        let (pk, _sk) = gen_keypair();
        directory.register(NodeDescriptor::new(NodeId::random(), Role::Exit, address, pk)).await.unwrap();
        let client = OnionClient::new(CircuitBuilder::new(Arc::new(directory)).with_path_length(1));
        let circuit = client.create_circuit().await.unwrap();
        (client, circuit)
    }

    #[tokio::test]
    async fn send_unknown_circuit() {
        let client = OnionClient::new(CircuitBuilder::new(Arc::new(MemoryDirectory::default())));
        let id = CircuitId::random();
        assert_eq!(
            client.send(id, ExitRequest::new("GET", "/")).await,
            Err(SendError::CircuitNotFound { id })
        );
    }

    #[tokio::test]
    async fn send_guard_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let (client, circuit) = client_with_exit(address).await;
        let res = client.send(circuit.id, ExitRequest::new("GET", "/")).await;
        assert!(matches!(res, Err(SendError::UpstreamUnreachable(_))));
        // a failed circuit stays until destroyed
        assert!(client.get_circuit(circuit.id).await.is_some());
    }

    #[tokio::test]
    async fn send_error_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut link = Framed::new(stream, FrameCodec::new(Stats::new()));
            let frame = link.next().await.unwrap().unwrap();
            let error = Frame::error(frame.circuit_id(), ErrorCode::ExternalOperationFailure, "connection refused");
            link.send(error).await.unwrap();
        });

        let (client, circuit) = client_with_exit(address).await;
        let res = client.send(circuit.id, ExitRequest::new("GET", "/")).await;
        assert_eq!(res, Err(SendError::ExternalOperationFailure("connection refused".to_owned())));
    }

    #[tokio::test]
    async fn send_response_with_wrong_key() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut link = Framed::new(stream, FrameCodec::new(Stats::new()));
            let frame = link.next().await.unwrap().unwrap();
            let response = Frame::Response { circuit_id: frame.circuit_id(), payload: vec![42; 64] };
            link.send(response).await.unwrap();
        });

        let (client, circuit) = client_with_exit(address).await;
        let res = client.send(circuit.id, ExitRequest::new("GET", "/")).await;
        assert!(matches!(res, Err(SendError::DecryptionFailure(_))));
    }

    #[tokio::test]
    async fn send_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut link = Framed::new(stream, FrameCodec::new(Stats::new()));
            let _frame = link.next().await;
            futures::future::pending::<()>().await;
        });

        let (client, circuit) = client_with_exit(address).await;
        let client = client.with_response_timeout(Duration::from_millis(50));
        let res = client.send(circuit.id, ExitRequest::new("GET", "/")).await;
        assert!(matches!(res, Err(SendError::UpstreamTimeout(_))));
    }

    #[test]
    fn error_codes() {
        assert_eq!(
            SendError::from_error_frame(ErrorCode::Overloaded, "busy".to_owned()),
            SendError::Overloaded("busy".to_owned())
        );
        assert_eq!(
            SendError::from_error_frame(ErrorCode::DecryptionFailure, String::new()),
            SendError::DecryptionFailure(String::new())
        );
    }
}
