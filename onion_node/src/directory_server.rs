/*! HTTP front end of a `MemoryDirectory`.

- `POST /register` with a JSON `NodeDescriptor` registers the node
- `GET /nodes` lists fresh descriptors, `GET /nodes?role=exit` and
  `GET /nodes/exit` list the fresh descriptors of one role
*/

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;

use anyhow::Error;
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use hyper::body::HttpBody;
use hyper::service::{make_service_fn, service_fn};

use onion::core::directory::{MemoryDirectory, NodeDirectory};
use onion::packet::{NodeDescriptor, Role};

/// Maximum size of a registration body.
const MAX_BODY_SIZE: usize = 64 * 1024;

fn response(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

fn json_response(descriptors: &[NodeDescriptor]) -> Response<Body> {
    match serde_json::to_vec(descriptors) {
        Ok(json) => {
            let mut response = response(StatusCode::OK, json);
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            response
        },
        Err(e) => response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Role requested by the `role` query parameter.
fn role_from_query(query: Option<&str>) -> Result<Option<Role>, String> {
    let role = query
        .into_iter()
        .flat_map(|query| url::form_urlencoded::parse(query.as_bytes()))
        .find(|(key, _)| key == "role")
        .map(|(_, value)| value);

    match role {
        Some(role) => role.parse().map(Some).map_err(|e| format!("{}", e)),
        None => Ok(None),
    }
}

/// Read the whole body unless it is longer than `limit`. Returns `None` for
/// longer bodies without reading past the limit.
async fn read_body(mut body: Body, limit: usize) -> Result<Option<Vec<u8>>, hyper::Error> {
    if body.size_hint().lower() > limit as u64 {
        return Ok(None)
    }

    let mut data = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        if data.len() + chunk.len() > limit {
            return Ok(None)
        }
        data.extend_from_slice(&chunk);
    }
    Ok(Some(data))
}

async fn register(req: Request<Body>, directory: &MemoryDirectory) -> Response<Body> {
    let body = match read_body(req.into_body(), MAX_BODY_SIZE).await {
        Ok(Some(body)) => body,
        Ok(None) => return response(StatusCode::PAYLOAD_TOO_LARGE, "Descriptor is too big"),
        Err(e) => return response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let descriptor: NodeDescriptor = match serde_json::from_slice(&body) {
        Ok(descriptor) => descriptor,
        Err(e) => return response(StatusCode::BAD_REQUEST, format!("Invalid descriptor: {}", e)),
    };

    match directory.register(descriptor).await {
        Ok(()) => response(StatusCode::OK, "OK"),
        Err(e) => response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

async fn list(role: Result<Option<Role>, String>, directory: &MemoryDirectory) -> Response<Body> {
    let role = match role {
        Ok(role) => role,
        Err(e) => return response(StatusCode::BAD_REQUEST, e),
    };

    match directory.list(role).await {
        Ok(descriptors) => json_response(&descriptors),
        Err(e) => response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

async fn handle_request(req: Request<Body>, directory: MemoryDirectory) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    trace!("Directory request {} {}", method, path);

    let response = match (&method, path.as_str()) {
        (&Method::POST, "/register") => register(req, &directory).await,
        (&Method::GET, "/nodes") => list(role_from_query(req.uri().query()), &directory).await,
        (&Method::GET, path) if path.starts_with("/nodes/") => {
            let role = path["/nodes/".len()..].parse::<Role>()
                .map(Some)
                .map_err(|e| e.to_string());
            list(role, &directory).await
        },
        (_, "/register") | (_, "/nodes") => response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"),
        _ => response(StatusCode::NOT_FOUND, "Not found"),
    };

    Ok(response)
}

/// Bind the directory server to `addr`. Returns the bound address and the
/// future serving requests until it fails.
pub fn bind(addr: &SocketAddr, directory: MemoryDirectory) -> Result<(SocketAddr, impl Future<Output = Result<(), Error>>), Error> {
    let make_svc = make_service_fn(move |_conn| {
        let directory = directory.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle_request(req, directory.clone())))
        }
    });

    let server = Server::try_bind(addr)?.serve(make_svc);
    let local_addr = server.local_addr();

    Ok((local_addr, async move { server.await.map_err(Error::from) }))
}

/// Run the directory server on `addr`.
pub async fn run(addr: SocketAddr, directory: MemoryDirectory) -> Result<(), Error> {
    let (local_addr, server) = bind(&addr, directory)?;
    info!("Running directory server on {}", local_addr);
    server.await
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use onion::core::directory::HttpDirectory;
    use onion::crypto::gen_keypair;
    use onion::packet::NodeId;

    fn descriptor(role: Role, port: u16) -> NodeDescriptor {
        let (pk, _sk) = gen_keypair();
        NodeDescriptor::new(NodeId::random(), role, SocketAddr::from(([127, 0, 0, 1], port)), pk)
    }

    async fn spawn_server() -> (SocketAddr, MemoryDirectory) {
        let directory = MemoryDirectory::new(Duration::from_secs(60));
        let (addr, server) = bind(&"127.0.0.1:0".parse().unwrap(), directory.clone()).unwrap();
        tokio::spawn(server);
        (addr, directory)
    }

    async fn get(url: &str) -> (StatusCode, Vec<u8>) {
        let client = hyper::Client::new();
        let response = client.get(url.parse().unwrap()).await.unwrap();
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, body.to_vec())
    }

    async fn post(url: &str, body: impl Into<Body>) -> StatusCode {
        let client = hyper::Client::new();
        let request = Request::builder()
            .method(Method::POST)
            .uri(url)
            .body(body.into())
            .unwrap();
        client.request(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn register_and_list_over_http() {
        let (addr, directory) = spawn_server().await;
        let client = HttpDirectory::new(&format!("http://{}", addr)).unwrap();

        let guard = descriptor(Role::Guard, 9001);
        let exit = descriptor(Role::Exit, 9003);
        client.register(guard.clone()).await.unwrap();
        client.register(exit.clone()).await.unwrap();

        assert_eq!(directory.len().await, 2);

        let all = client.list(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let exits = client.list(Some(Role::Exit)).await.unwrap();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].id, exit.id);
        assert_eq!(exits[0].public_key, exit.public_key);
        assert!(exits[0].last_seen > 0);

        assert!(client.list(Some(Role::Middle)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_by_path() {
        let (addr, directory) = spawn_server().await;
        let middle = descriptor(Role::Middle, 9002);
        directory.register(middle.clone()).await.unwrap();

        let (status, body) = get(&format!("http://{}/nodes/middle", addr)).await;
        assert_eq!(status, StatusCode::OK);
        let listed: Vec<NodeDescriptor> = serde_json::from_slice(&body).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, middle.id);

        let (status, body) = get(&format!("http://{}/nodes/guard", addr)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"[]");
    }

    #[tokio::test]
    async fn unknown_role() {
        let (addr, _directory) = spawn_server().await;
        let (status, _) = get(&format!("http://{}/nodes/bridge", addr)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = get(&format!("http://{}/nodes?role=bridge", addr)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn invalid_descriptor() {
        let (addr, directory) = spawn_server().await;
        let status = post(&format!("http://{}/register", addr), "{\"id\": 42}").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(directory.is_empty().await);
    }

    #[tokio::test]
    async fn descriptor_too_big() {
        let (addr, directory) = spawn_server().await;
        let status = post(&format!("http://{}/register", addr), vec![b' '; MAX_BODY_SIZE + 1]).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(directory.is_empty().await);
    }

    #[tokio::test]
    async fn read_body_limit() {
        let body = read_body(Body::from(vec![42; 10]), 10).await.unwrap();
        assert_eq!(body, Some(vec![42; 10]));

        let body = read_body(Body::from(vec![42; 11]), 10).await.unwrap();
        assert_eq!(body, None);

        // chunked body without a known length
        let chunks: Vec<Result<_, std::io::Error>> = vec![Ok(vec![1; 6]), Ok(vec![2; 6]), Ok(vec![3; 6])];
        let body = read_body(Body::wrap_stream(futures::stream::iter(chunks)), 10).await.unwrap();
        assert_eq!(body, None);
    }

    #[tokio::test]
    async fn wrong_method_and_path() {
        let (addr, _directory) = spawn_server().await;
        let (status, _) = get(&format!("http://{}/register", addr)).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        let status = post(&format!("http://{}/nodes", addr), "").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        let (status, _) = get(&format!("http://{}/unknown", addr)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn parse_role_query() {
        assert_eq!(role_from_query(None), Ok(None));
        assert_eq!(role_from_query(Some("foo=bar")), Ok(None));
        assert_eq!(role_from_query(Some("foo=bar&role=exit")), Ok(Some(Role::Exit)));
        assert_eq!(role_from_query(Some("role=%65xit")), Ok(Some(Role::Exit)));
        assert!(role_from_query(Some("role=bridge")).is_err());
    }
}
