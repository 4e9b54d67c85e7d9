/*! Client of a remote directory server.

The directory protocol is plain HTTP with JSON bodies:

- `POST {base}/register` with a `NodeDescriptor` registers a node
- `GET {base}/nodes[?role=guard|middle|exit]` returns fresh descriptors
*/

use std::time::Duration;

use async_trait::async_trait;

use onion_packet::{NodeDescriptor, Role};

use crate::directory::{DirectoryError, NodeDirectory};

/// Timeout of a single request to the directory.
pub const DIRECTORY_TIMEOUT: Duration = Duration::from_secs(10);

/// `NodeDirectory` backed by a directory server.
#[derive(Clone, Debug)]
pub struct HttpDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDirectory {
    /// Create a client for the directory at `base_url`, e.g.
    /// `http://127.0.0.1:8080`.
    pub fn new(base_url: &str) -> Result<HttpDirectory, DirectoryError> {
        let client = reqwest::Client::builder()
            .timeout(DIRECTORY_TIMEOUT)
            .build()
            .map_err(DirectoryError::unavailable)?;

        Ok(HttpDirectory {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    /// Base URL of the directory server.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl NodeDirectory for HttpDirectory {
    async fn register(&self, descriptor: NodeDescriptor) -> Result<(), DirectoryError> {
        let response = self.client
            .post(format!("{}/register", self.base_url))
            .json(&descriptor)
            .send()
            .await
            .map_err(DirectoryError::unavailable)?;

        if !response.status().is_success() {
            return Err(DirectoryError::unavailable(format!("HTTP error: {}", response.status())));
        }

        Ok(())
    }

    async fn list(&self, role: Option<Role>) -> Result<Vec<NodeDescriptor>, DirectoryError> {
        let mut request = self.client.get(format!("{}/nodes", self.base_url));
        if let Some(role) = role {
            request = request.query(&[("role", role.as_str())]);
        }

        let response = request
            .send()
            .await
            .map_err(DirectoryError::unavailable)?;

        if !response.status().is_success() {
            return Err(DirectoryError::unavailable(format!("HTTP error: {}", response.status())));
        }

        let descriptors: Vec<NodeDescriptor> = response.json()
            .await
            .map_err(|e| DirectoryError::InvalidResponse { reason: e.to_string() })?;

        trace!("Directory returned {} descriptors for role {:?}", descriptors.len(), role);

        Ok(descriptors)
    }
}
