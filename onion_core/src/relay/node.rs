/*! Relay node: accepts onions, peels one layer and forwards or executes them.

Every inbound connection carries exactly one onion and gets exactly one frame
back: the response travelling to the client or an `Error` frame synthesized
by the first hop that failed.
*/

use std::io::Error as IoError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crypto_box::{PublicKey, SecretKey};
use futures::{SinkExt, StreamExt};
use futures::channel::mpsc;
use futures::stream::SplitStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Framed;

use onion_binary_io::*;
use onion_crypto::onion::decrypt_onion_layer;
use onion_packet::*;

use crate::relay::behavior::*;
use crate::relay::codec::FrameCodec;
use crate::relay::errors::RelayError;
use crate::relay::registry::*;
use crate::relay::router::*;
use crate::stats::Stats;

/// Buffer size (in frames) of the writer of an inbound connection. Only one
/// frame is ever sent back.
const CONNECTION_CHANNEL_SIZE: usize = 1;

/// Delay before accepting again after a failed accept.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Timeout of waiting for the first frame of a rejected connection.
const REJECT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeouts and limits of a relay node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayConfig {
    /// Timeout of dialling the next hop.
    pub dial_timeout: Duration,
    /// Timeout of waiting for the next hop to answer.
    pub response_timeout: Duration,
    /// Timeout of waiting for the first frame of an inbound connection.
    pub read_timeout: Duration,
    /// Maximum number of inbound connections handled at once.
    pub max_connections: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            dial_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

type FrameStream = SplitStream<Framed<TcpStream, FrameCodec>>;

/** A node of the overlay.

The role specific behaviour is chosen once when the node is created. Cloned
nodes share their connection registry, router and stats.
*/
#[derive(Clone)]
pub struct RelayNode {
    id: NodeId,
    sk: SecretKey,
    behavior: Arc<dyn RelayBehavior>,
    registry: ConnectionRegistry,
    router: ReversePathRouter,
    stats: Stats,
    config: RelayConfig,
}

impl RelayNode {
    /// Create a node with the default config.
    pub fn new(id: NodeId, sk: SecretKey, behavior: Box<dyn RelayBehavior>) -> RelayNode {
        let config = RelayConfig::default();
        RelayNode {
            id,
            sk,
            behavior: Arc::from(behavior),
            registry: ConnectionRegistry::new(config.max_connections),
            router: ReversePathRouter::new(),
            stats: Stats::new(),
            config,
        }
    }

    /// Replace timeouts and limits.
    pub fn with_config(mut self, config: RelayConfig) -> RelayNode {
        self.registry = ConnectionRegistry::new(config.max_connections);
        self.config = config;
        self
    }

    /// Use the given stats for all links of the node.
    pub fn with_stats(mut self, stats: Stats) -> RelayNode {
        self.stats = stats;
        self
    }

    /// Identifier of the node.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Role of the node.
    pub fn role(&self) -> Role {
        self.behavior.role()
    }

    /// Key onion layers for this node are wrapped to.
    pub fn public_key(&self) -> PublicKey {
        self.sk.public_key()
    }

    /// Descriptor advertising the node at `address`.
    pub fn descriptor(&self, address: SocketAddr) -> NodeDescriptor {
        NodeDescriptor::new(self.id, self.role(), address, self.public_key())
    }

    /// Inbound connections currently handled.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Return paths of onions currently forwarded.
    pub fn router(&self) -> &ReversePathRouter {
        &self.router
    }

    /// Frame counters of the node.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /** Accept connections until the task is cancelled.

    Every connection is handled by its own task, so a failing connection
    never affects the others or the accept loop.
    */
    pub async fn run(&self, listener: TcpListener) -> Result<(), IoError> {
        info!("{} node {} is listening on {}", self.role(), self.id, listener.local_addr()?);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                    continue
                },
            };

            let node = self.clone();
            tokio::spawn(async move {
                if let Err(e) = node.handle_connection(stream, peer).await {
                    debug!("Connection from {} failed: {}", peer, e);
                }
            });
        }
    }

    /// Handle a single inbound connection until its response is sent.
    pub async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), RelayError> {
        let connection = match self.registry.insert(peer).await {
            Ok(connection) => connection,
            Err(e) => return self.reject(stream, e).await,
        };

        trace!("Accepted connection {} from {}", connection, peer);

        let result = self.serve(connection, stream).await;

        let released = self.router.release_connection(connection).await;
        if released > 0 {
            debug!("Released {} return paths of connection {}", released, connection);
        }
        self.registry.remove(connection).await;

        result
    }

    /// Answer the first frame with `Overloaded` and close the connection.
    async fn reject(&self, stream: TcpStream, error: RegistryError) -> Result<(), RelayError> {
        warn!("Rejecting connection: {}", error);

        let mut link = Framed::new(stream, FrameCodec::new(self.stats.clone()));
        let read_timeout = self.config.read_timeout.min(REJECT_READ_TIMEOUT);
        if let Ok(Some(Ok(frame))) = timeout(read_timeout, link.next()).await {
            let error_frame = Frame::error(frame.circuit_id(), ErrorCode::Overloaded, &error.to_string());
            link.send(error_frame).await
                .map_err(RelayError::Write)?;
        }

        Err(RelayError::Overloaded(error))
    }

    async fn serve(&self, connection: ConnectionId, stream: TcpStream) -> Result<(), RelayError> {
        let (mut to_peer, from_peer) = Framed::new(stream, FrameCodec::new(self.stats.clone())).split();
        let (tx, rx) = mpsc::channel(CONNECTION_CHANNEL_SIZE);

        let mut rx = rx.map(Ok);
        let writer = async move {
            to_peer.send_all(&mut rx).await
                .map_err(RelayError::Write)
        };

        let relay = async move {
            let result = self.relay(connection, from_peer, tx).await;
            // the writer finishes once every sender is dropped
            self.router.release_connection(connection).await;
            result
        };

        let (relay_result, writer_result) = futures::join!(relay, writer);
        relay_result.and(writer_result)
    }

    async fn relay(&self, connection: ConnectionId, mut from_peer: FrameStream, mut tx: mpsc::Sender<Frame>) -> Result<(), RelayError> {
        let frame = match timeout(self.config.read_timeout, from_peer.next()).await {
            Err(_) => return Err(RelayError::ReadTimeout),
            Ok(None) => return Err(RelayError::Closed),
            Ok(Some(Err(e))) => return Err(RelayError::Read(e)),
            Ok(Some(Ok(frame))) => frame,
        };

        let (in_id, onion) = match frame {
            Frame::Forward { circuit_id, onion } => (circuit_id, onion),
            frame => {
                let error = RelayError::UnexpectedFrame;
                tx.send(Frame::error(frame.circuit_id(), error.code(), "expected an onion")).await
                    .map_err(RelayError::SendTo)?;
                return Err(error)
            },
        };

        self.registry.set_circuit(connection, in_id).await;

        match self.relay_onion(connection, in_id, onion, &tx).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!("Failed to relay onion of circuit {}: {}", in_id, e);
                self.registry.set_state(connection, ConnectionState::RespondingBack).await;
                tx.send(Frame::error(in_id, e.code(), &e.to_string())).await
                    .map_err(RelayError::SendTo)?;
                Err(e)
            },
        }
    }

    /// Peel the layer and act on the revealed instruction. Errors returned
    /// from here are reported to the previous hop on the inbound link.
    async fn relay_onion(&self, connection: ConnectionId, in_id: CircuitId, onion: Vec<u8>, tx: &mpsc::Sender<Frame>) -> Result<(), RelayError> {
        self.registry.set_state(connection, ConnectionState::Decrypting).await;

        let (payload, key) = decrypt_onion_layer(&onion, &self.sk)
            .map_err(RelayError::Decrypt)?;
        let (_, instruction) = RelayInstruction::from_bytes(&payload)
            .map_err(|_| RelayError::Malformed)?;

        let state = match instruction {
            RelayInstruction::Forward(_) => ConnectionState::Forwarding,
            RelayInstruction::Exit(_) => ConnectionState::Terminating,
        };
        self.registry.set_state(connection, state).await;

        match self.behavior.route(instruction, &key).await? {
            Route::Respond(payload) => {
                self.registry.set_state(connection, ConnectionState::RespondingBack).await;
                tx.clone().send(Frame::Response { circuit_id: in_id, payload }).await
                    .map_err(RelayError::SendTo)
            },
            Route::Forward(forward) => self.forward(connection, in_id, forward, tx).await,
        }
    }

    /** Pass the onion to the next hop on a new link and route its answer back.

    Failures of the next hop become an `Error` frame on the outbound link, so
    they travel back the same way a response does.
    */
    async fn forward(&self, connection: ConnectionId, in_id: CircuitId, forward: ForwardInstruction, tx: &mpsc::Sender<Frame>) -> Result<(), RelayError> {
        self.registry.set_next_hop(connection, forward.address).await;

        let out_id = CircuitId::random();
        self.router.register(out_id, ReturnPath {
            connection,
            tx: tx.clone(),
            return_id: in_id,
        }).await.map_err(RelayError::Route)?;

        trace!("Forwarding circuit {} to {} as {}", in_id, forward.next_hop, out_id);

        let frame = match self.exchange(connection, out_id, forward).await {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Next hop of circuit {} failed: {}", in_id, e);
                Frame::error(out_id, e.code(), &e.to_string())
            },
        };

        self.registry.set_state(connection, ConnectionState::RespondingBack).await;
        self.router.route_back(out_id, frame).await
            .map_err(RelayError::Route)
    }

    /// Send the onion to the next hop and wait for its single answer.
    async fn exchange(&self, connection: ConnectionId, out_id: CircuitId, forward: ForwardInstruction) -> Result<Frame, RelayError> {
        let stream = timeout(self.config.dial_timeout, TcpStream::connect(forward.address)).await
            .map_err(|_| RelayError::DialTimeout)?
            .map_err(RelayError::UpstreamUnreachable)?;

        let mut upstream = Framed::new(stream, FrameCodec::new(self.stats.clone()));
        upstream.send(Frame::Forward { circuit_id: out_id, onion: forward.onion }).await
            .map_err(RelayError::UpstreamWrite)?;

        self.registry.set_state(connection, ConnectionState::AwaitingResponse).await;

        let frame = timeout(self.config.response_timeout, upstream.next()).await
            .map_err(|_| RelayError::UpstreamTimeout)?
            .ok_or(RelayError::UpstreamClosed)?
            .map_err(RelayError::UpstreamRead)?;

        match frame {
            Frame::Forward { .. } => Err(RelayError::UnexpectedFrame),
            frame if frame.circuit_id() != out_id => Err(RelayError::UnexpectedFrame),
            frame => Ok(frame),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use futures::future;
    use rand::thread_rng;

    use onion_crypto::gen_keypair;
    use onion_crypto::onion::{encrypt_layer, LayerKey};

    use crate::relay::exit::*;

    struct Echo;

    #[async_trait]
    impl ExternalOperation for Echo {
        async fn execute(&self, request: &ExitRequest) -> Result<ExitResponse, ExternalOperationError> {
            Ok(ExitResponse { status: 200, body: format!("RESPONSE: {}", request).into_bytes() })
        }
    }

    struct Hanging;

    #[async_trait]
    impl ExternalOperation for Hanging {
        async fn execute(&self, _request: &ExitRequest) -> Result<ExitResponse, ExternalOperationError> {
            future::pending().await
        }
    }

    async fn spawn_node(node: RelayNode) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { node.run(listener).await });
        addr
    }

    fn layer(instruction: &RelayInstruction, pk: &PublicKey) -> (Vec<u8>, LayerKey) {
        let payload = to_vec(instruction, instruction.size()).unwrap();
        encrypt_layer(&mut thread_rng(), &payload, pk).unwrap()
    }

    async fn exchange(addr: SocketAddr, frame: Frame) -> Option<Frame> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut link = Framed::new(stream, FrameCodec::new(Stats::new()));
        link.send(frame).await.unwrap();
        link.next().await.map(|frame| frame.unwrap())
    }

    async fn unused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn exit_responds() {
        let (pk, sk) = gen_keypair();
        let node = RelayNode::new(NodeId::random(), sk, Box::new(ExitRelay::new(Box::new(Echo))));
        let addr = spawn_node(node.clone()).await;

        let instruction = RelayInstruction::Exit(ExitRequest::new("GET", "/resource"));
        let (onion, key) = layer(&instruction, &pk);
        let circuit_id = CircuitId::random();

        let frame = exchange(addr, Frame::Forward { circuit_id, onion }).await.unwrap();
        let payload = match frame {
            Frame::Response { circuit_id: id, payload } if id == circuit_id => payload,
            frame => panic!("Unexpected frame: {:?}", frame),
        };
        let (_, response) = ExitResponse::from_bytes(&key.open(&payload).unwrap()).unwrap();
        assert_eq!(response.body, b"RESPONSE: GET /resource".to_vec());
    }

    #[tokio::test]
    async fn middle_forwards_and_routes_back() {
        let (exit_pk, exit_sk) = gen_keypair();
        let exit = RelayNode::new(NodeId::random(), exit_sk, Box::new(ExitRelay::new(Box::new(Echo))));
        let exit_addr = spawn_node(exit.clone()).await;

        let (middle_pk, middle_sk) = gen_keypair();
        let middle = RelayNode::new(NodeId::random(), middle_sk, Box::new(MiddleRelay));
        let middle_addr = spawn_node(middle.clone()).await;

        let (exit_onion, key) = layer(&RelayInstruction::Exit(ExitRequest::new("GET", "/")), &exit_pk);
        let (onion, _) = layer(&RelayInstruction::Forward(ForwardInstruction {
            next_hop: exit.id(),
            address: exit_addr,
            onion: exit_onion,
        }), &middle_pk);
        let circuit_id = CircuitId::random();

        let frame = exchange(middle_addr, Frame::Forward { circuit_id, onion }).await.unwrap();
        let payload = match frame {
            Frame::Response { circuit_id: id, payload } if id == circuit_id => payload,
            frame => panic!("Unexpected frame: {:?}", frame),
        };
        assert!(key.open(&payload).is_ok());
        assert!(middle.router().is_empty().await);
    }

    #[tokio::test]
    async fn wrong_key() {
        let (_pk, sk) = gen_keypair();
        let (other_pk, _other_sk) = gen_keypair();
        let node = RelayNode::new(NodeId::random(), sk, Box::new(GuardRelay));
        let addr = spawn_node(node).await;

        let (onion, _) = layer(&RelayInstruction::Exit(ExitRequest::new("GET", "/")), &other_pk);
        let circuit_id = CircuitId::random();
        let frame = exchange(addr, Frame::Forward { circuit_id, onion }).await.unwrap();
        assert!(matches!(frame, Frame::Error { circuit_id: id, code: ErrorCode::DecryptionFailure, .. } if id == circuit_id));
    }

    #[tokio::test]
    async fn short_onion() {
        let (_pk, sk) = gen_keypair();
        let node = RelayNode::new(NodeId::random(), sk, Box::new(GuardRelay));
        let addr = spawn_node(node).await;

        let frame = exchange(addr, Frame::Forward { circuit_id: CircuitId::random(), onion: vec![42; 10] }).await.unwrap();
        assert!(matches!(frame, Frame::Error { code: ErrorCode::MalformedPacket, .. }));
    }

    #[tokio::test]
    async fn guard_rejects_exit_instruction() {
        let (pk, sk) = gen_keypair();
        let node = RelayNode::new(NodeId::random(), sk, Box::new(GuardRelay));
        let addr = spawn_node(node).await;

        let (onion, _) = layer(&RelayInstruction::Exit(ExitRequest::new("GET", "/")), &pk);
        let frame = exchange(addr, Frame::Forward { circuit_id: CircuitId::random(), onion }).await.unwrap();
        assert!(matches!(frame, Frame::Error { code: ErrorCode::UnexpectedInstruction, .. }));
    }

    #[tokio::test]
    async fn next_hop_unreachable() {
        let (pk, sk) = gen_keypair();
        let node = RelayNode::new(NodeId::random(), sk, Box::new(GuardRelay));
        let addr = spawn_node(node.clone()).await;

        let (onion, _) = layer(&RelayInstruction::Forward(ForwardInstruction {
            next_hop: NodeId::random(),
            address: unused_addr().await,
            onion: vec![42; 200],
        }), &pk);
        let circuit_id = CircuitId::random();
        let frame = exchange(addr, Frame::Forward { circuit_id, onion }).await.unwrap();
        assert!(matches!(frame, Frame::Error { circuit_id: id, code: ErrorCode::UpstreamUnreachable, .. } if id == circuit_id));
        assert!(node.router().is_empty().await);
    }

    #[tokio::test]
    async fn exit_timeout_is_reported() {
        let (pk, sk) = gen_keypair();
        let exit = ExitRelay::new(Box::new(Hanging)).with_timeout(Duration::from_millis(50));
        let node = RelayNode::new(NodeId::random(), sk, Box::new(exit));
        let addr = spawn_node(node).await;

        let (onion, _) = layer(&RelayInstruction::Exit(ExitRequest::new("GET", "/")), &pk);
        let frame = exchange(addr, Frame::Forward { circuit_id: CircuitId::random(), onion }).await.unwrap();
        assert!(matches!(frame, Frame::Error { code: ErrorCode::UpstreamTimeout, .. }));
    }

    #[tokio::test]
    async fn next_hop_never_answers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut link = Framed::new(stream, FrameCodec::new(Stats::new()));
            let _onion = link.next().await;
            future::pending::<()>().await;
        });

        let (pk, sk) = gen_keypair();
        let config = RelayConfig { response_timeout: Duration::from_millis(50), ..RelayConfig::default() };
        let node = RelayNode::new(NodeId::random(), sk, Box::new(MiddleRelay)).with_config(config);
        let addr = spawn_node(node.clone()).await;

        let (onion, _) = layer(&RelayInstruction::Forward(ForwardInstruction {
            next_hop: NodeId::random(),
            address: silent_addr,
            onion: vec![42; 200],
        }), &pk);
        let circuit_id = CircuitId::random();
        let frame = exchange(addr, Frame::Forward { circuit_id, onion }).await.unwrap();
        assert!(matches!(frame, Frame::Error { circuit_id: id, code: ErrorCode::UpstreamTimeout, .. } if id == circuit_id));
        assert!(node.router().is_empty().await);
    }

    #[tokio::test]
    async fn response_as_first_frame() {
        let (_pk, sk) = gen_keypair();
        let node = RelayNode::new(NodeId::random(), sk, Box::new(MiddleRelay));
        let addr = spawn_node(node).await;

        let circuit_id = CircuitId::random();
        let frame = exchange(addr, Frame::Response { circuit_id, payload: vec![1, 2, 3] }).await.unwrap();
        assert!(matches!(frame, Frame::Error { circuit_id: id, code: ErrorCode::MalformedPacket, .. } if id == circuit_id));
    }

    #[tokio::test]
    async fn overloaded() {
        let (pk, sk) = gen_keypair();
        let config = RelayConfig { max_connections: 0, ..RelayConfig::default() };
        let node = RelayNode::new(NodeId::random(), sk, Box::new(GuardRelay)).with_config(config);
        let addr = spawn_node(node).await;

        let (onion, _) = layer(&RelayInstruction::Exit(ExitRequest::new("GET", "/")), &pk);
        let frame = exchange(addr, Frame::Forward { circuit_id: CircuitId::random(), onion }).await.unwrap();
        assert!(matches!(frame, Frame::Error { code: ErrorCode::Overloaded, .. }));
    }

    #[tokio::test]
    async fn overloaded_silent_connection() {
        let (_pk, sk) = gen_keypair();
        let config = RelayConfig { max_connections: 0, read_timeout: Duration::from_secs(60), ..RelayConfig::default() };
        let node = RelayNode::new(NodeId::random(), sk, Box::new(GuardRelay)).with_config(config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        let res = timeout(REJECT_READ_TIMEOUT * 5, node.handle_connection(stream, peer)).await
            .expect("rejected connection should be closed quickly");
        assert!(matches!(res, Err(RelayError::Overloaded(_))));
    }

    #[tokio::test]
    async fn registry_is_released() {
        let (pk, sk) = gen_keypair();
        let node = RelayNode::new(NodeId::random(), sk, Box::new(ExitRelay::new(Box::new(Echo))));
        let addr = spawn_node(node.clone()).await;

        let (onion, _) = layer(&RelayInstruction::Exit(ExitRequest::new("GET", "/")), &pk);
        exchange(addr, Frame::Forward { circuit_id: CircuitId::random(), onion }).await.unwrap();

        // the response is sent before the entry is removed
        for _ in 0..100 {
            if node.registry().is_empty().await {
                break
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(node.registry().is_empty().await);
        assert_eq!(node.stats().counters.incoming(), 1);
        assert_eq!(node.stats().counters.outgoing(), 1);
    }

    #[tokio::test]
    async fn closed_before_first_frame() {
        let (_pk, sk) = gen_keypair();
        let node = RelayNode::new(NodeId::random(), sk, Box::new(GuardRelay));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        drop(client);

        let res = node.handle_connection(stream, peer).await;
        assert!(matches!(res, Err(RelayError::Closed)));
        assert!(node.registry().is_empty().await);
    }

    #[test]
    fn descriptor() {
        let (pk, sk) = gen_keypair();
        let node = RelayNode::new(NodeId::random(), sk, Box::new(MiddleRelay));
        let addr = "127.0.0.1:9001".parse().unwrap();
        let descriptor = node.descriptor(addr);
        assert_eq!(descriptor.id, node.id());
        assert_eq!(descriptor.role, Role::Middle);
        assert_eq!(descriptor.address, addr);
        assert_eq!(descriptor.public_key, pk);
    }
}
