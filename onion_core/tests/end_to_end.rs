//! Circuits of real relay nodes talking over loopback TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crypto_box::SecretKey;
use tokio::net::TcpListener;

use onion_core::circuit::*;
use onion_core::client::*;
use onion_core::directory::*;
use onion_core::relay::*;
use onion_crypto::gen_keypair;
use onion_crypto::onion::decrypt_onion_layer;
use onion_binary_io::FromBytes;
use onion_packet::*;

struct Resource;

#[async_trait]
impl ExternalOperation for Resource {
    async fn execute(&self, request: &ExitRequest) -> Result<ExitResponse, ExternalOperationError> {
        match (request.method.as_str(), request.target.as_str()) {
            ("GET", "/resource") => Ok(ExitResponse { status: 200, body: b"resource content".to_vec() }),
            ("GET", "/broken") => Err(ExternalOperationError::Request("connection reset".to_owned())),
            _ => Ok(ExitResponse { status: 404, body: Vec::new() }),
        }
    }
}

async fn spawn_node(directory: &MemoryDirectory, behavior: Box<dyn RelayBehavior>) -> (RelayNode, SecretKey, SocketAddr) {
    let (_pk, sk) = gen_keypair();
    let node = RelayNode::new(NodeId::random(), sk.clone(), behavior);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    directory.register(node.descriptor(addr)).await.unwrap();

    let node_c = node.clone();
    tokio::spawn(async move { node_c.run(listener).await });

    (node, sk, addr)
}

struct Overlay {
    client: OnionClient,
    guard: (RelayNode, SecretKey),
    middle: (RelayNode, SecretKey),
    exit: (RelayNode, SecretKey),
}

async fn overlay() -> Overlay {
    let directory = MemoryDirectory::default();
    let (guard, guard_sk, _) = spawn_node(&directory, Box::new(GuardRelay)).await;
    let (middle, middle_sk, _) = spawn_node(&directory, Box::new(MiddleRelay)).await;
    let (exit, exit_sk, _) = spawn_node(&directory, Box::new(ExitRelay::new(Box::new(Resource)))).await;

    let builder = CircuitBuilder::new(Arc::new(directory)).with_strategy(FirstCandidate);
    Overlay {
        client: OnionClient::new(builder),
        guard: (guard, guard_sk),
        middle: (middle, middle_sk),
        exit: (exit, exit_sk),
    }
}

#[tokio::test]
async fn request_through_three_hops() {
    let overlay = overlay().await;

    let circuit = overlay.client.create_circuit().await.unwrap();
    let roles = circuit.nodes.iter().map(|node| node.role).collect::<Vec<_>>();
    assert_eq!(roles, vec![Role::Guard, Role::Middle, Role::Exit]);

    let request = "GET /resource".parse::<ExitRequest>().unwrap();
    let response = overlay.client.send(circuit.id, request).await.unwrap();
    assert_eq!(response, ExitResponse { status: 200, body: b"resource content".to_vec() });

    for node in [&overlay.guard.0, &overlay.middle.0, &overlay.exit.0] {
        assert_eq!(node.stats().counters.incoming(), if node.role() == Role::Exit { 1 } else { 2 });
    }
}

#[tokio::test]
async fn layers_peel_in_hop_order() {
    let overlay = overlay().await;
    let circuit = overlay.client.create_circuit().await.unwrap();
    let request = ExitRequest::new("GET", "/resource");
    let (onion, _key) = circuit.seal_request(&request).unwrap();

    let (guard_sk, middle_sk, exit_sk) = (&overlay.guard.1, &overlay.middle.1, &overlay.exit.1);

    let (payload, _) = decrypt_onion_layer(onion.as_bytes(), guard_sk).unwrap();
    let inner = match RelayInstruction::from_bytes(&payload).unwrap().1 {
        RelayInstruction::Forward(forward) => forward.onion,
        instruction => panic!("Unexpected instruction: {:?}", instruction),
    };
    // still opaque for a party holding only the exit's key
    assert!(decrypt_onion_layer(&inner, exit_sk).is_err());

    let (payload, _) = decrypt_onion_layer(&inner, middle_sk).unwrap();
    let inner = match RelayInstruction::from_bytes(&payload).unwrap().1 {
        RelayInstruction::Forward(forward) => forward.onion,
        instruction => panic!("Unexpected instruction: {:?}", instruction),
    };

    let (payload, _) = decrypt_onion_layer(&inner, exit_sk).unwrap();
    let (_, instruction) = RelayInstruction::from_bytes(&payload).unwrap();
    match instruction {
        RelayInstruction::Exit(request) => assert_eq!(request.to_string(), "GET /resource"),
        instruction => panic!("Unexpected instruction: {:?}", instruction),
    }
}

#[tokio::test]
async fn exit_failure_travels_back() {
    let overlay = overlay().await;
    let circuit = overlay.client.create_circuit().await.unwrap();

    let res = overlay.client.send(circuit.id, ExitRequest::new("GET", "/broken")).await;
    assert!(matches!(res, Err(SendError::ExternalOperationFailure(_))));

    // the circuit is still usable
    let response = overlay.client.send(circuit.id, ExitRequest::new("GET", "/missing")).await.unwrap();
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn dead_middle_is_reported() {
    let directory = MemoryDirectory::default();
    spawn_node(&directory, Box::new(GuardRelay)).await;
    spawn_node(&directory, Box::new(ExitRelay::new(Box::new(Resource)))).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = listener.local_addr().unwrap();
    drop(listener);
    let (pk, _sk) = gen_keypair();
    directory.register(NodeDescriptor::new(NodeId::random(), Role::Middle, dead_addr, pk)).await.unwrap();

    let client = OnionClient::new(CircuitBuilder::new(Arc::new(directory)));
    let circuit = client.create_circuit().await.unwrap();

    let res = client.send(circuit.id, ExitRequest::new("GET", "/resource")).await;
    assert!(matches!(res, Err(SendError::UpstreamUnreachable(_))));
}

#[tokio::test]
async fn concurrent_requests() {
    let overlay = overlay().await;
    let first = overlay.client.create_circuit().await.unwrap();
    let second = overlay.client.create_circuit().await.unwrap();
    assert_ne!(first.id, second.id);

    let (a, b) = futures::join!(
        overlay.client.send(first.id, ExitRequest::new("GET", "/resource")),
        overlay.client.send(second.id, ExitRequest::new("GET", "/resource")),
    );
    assert_eq!(a.unwrap().status, 200);
    assert_eq!(b.unwrap().status, 200);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(overlay.middle.0.router().is_empty().await);
}

#[tokio::test]
async fn destroy_circuit() {
    let overlay = overlay().await;
    let circuit = overlay.client.create_circuit().await.unwrap();
    assert_eq!(overlay.client.list_circuits().await.len(), 1);

    assert!(overlay.client.destroy_circuit(circuit.id).await);
    assert!(!overlay.client.destroy_circuit(circuit.id).await);
    assert!(!overlay.client.destroy_circuit(CircuitId::random()).await);
    assert!(overlay.client.list_circuits().await.is_empty());

    let res = overlay.client.send(circuit.id, ExitRequest::new("GET", "/resource")).await;
    assert_eq!(res, Err(SendError::CircuitNotFound { id: circuit.id }));
}
