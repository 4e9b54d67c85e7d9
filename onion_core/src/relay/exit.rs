/*! External operation executed by the exit node.
*/

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use thiserror::Error;

use onion_packet::{ExitRequest, ExitResponse, MAX_FRAME_SIZE};

/// Maximum length of a response body relayed back to the client. Longer
/// bodies are truncated so the sealed response fits into a frame.
pub const MAX_RESPONSE_BODY_SIZE: usize = MAX_FRAME_SIZE - 1024;

/// Error that can happen when executing an exit request.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ExternalOperationError {
    /// The request method is not supported.
    #[error("Invalid request method: {0}")]
    InvalidMethod(String),
    /// The target can't be parsed.
    #[error("Invalid request target: {0}")]
    InvalidTarget(String),
    /// The target scheme is not supported.
    #[error("Unsupported target scheme: {0}")]
    UnsupportedScheme(String),
    /// The request failed.
    #[error("Request error: {0}")]
    Request(String),
}

/// Terminal step of a circuit: performs the request on behalf of the client.
/// Timeouts are enforced by the caller.
#[async_trait]
pub trait ExternalOperation: Send + Sync {
    /// Execute the request.
    async fn execute(&self, request: &ExitRequest) -> Result<ExitResponse, ExternalOperationError>;
}

/// Executes exit requests as HTTP requests.
#[derive(Clone, Debug)]
pub struct HttpOperation {
    client: Client,
}

impl HttpOperation {
    /// Create an operation with its own HTTP client.
    pub fn new() -> Result<HttpOperation, ExternalOperationError> {
        let client = Client::builder()
            .build()
            .map_err(|e| ExternalOperationError::Request(e.to_string()))?;
        Ok(HttpOperation { client })
    }

    fn prepare(request: &ExitRequest) -> Result<(Method, Url), ExternalOperationError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ExternalOperationError::InvalidMethod(request.method.clone()))?;
        let url = Url::parse(&request.target)
            .map_err(|e| ExternalOperationError::InvalidTarget(format!("{}: {}", request.target, e)))?;
        match url.scheme() {
            "http" | "https" => Ok((method, url)),
            scheme => Err(ExternalOperationError::UnsupportedScheme(scheme.to_owned())),
        }
    }
}

/// Append `chunk` to `body` keeping at most `limit` bytes. Returns `false`
/// once the limit is reached.
fn append_limited(body: &mut Vec<u8>, chunk: &[u8], limit: usize) -> bool {
    let rest = limit - body.len();
    if chunk.len() >= rest {
        body.extend_from_slice(&chunk[..rest]);
        false
    } else {
        body.extend_from_slice(chunk);
        true
    }
}

#[async_trait]
impl ExternalOperation for HttpOperation {
    async fn execute(&self, request: &ExitRequest) -> Result<ExitResponse, ExternalOperationError> {
        let (method, url) = HttpOperation::prepare(request)?;

        debug!("Executing exit request {}", request);

        let mut response = self.client
            .request(method, url)
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| ExternalOperationError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk()
            .await
            .map_err(|e| ExternalOperationError::Request(e.to_string()))?
        {
            if !append_limited(&mut body, &chunk, MAX_RESPONSE_BODY_SIZE) {
                debug!("Truncating response body to {} bytes", MAX_RESPONSE_BODY_SIZE);
                break
            }
        }

        Ok(ExitResponse { status, body })
    }
}
