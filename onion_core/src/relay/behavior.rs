/*! Role specific part of a relay node.

Every node peels its layer the same way. What it does with the revealed
instruction depends on its role, which is fixed when the node is built.
*/

use std::time::Duration;

use async_trait::async_trait;
use rand::thread_rng;
use tokio::time::timeout;

use onion_binary_io::*;
use onion_crypto::onion::LayerKey;
use onion_packet::*;

use crate::relay::errors::RelayError;
use crate::relay::exit::ExternalOperation;

/// Default timeout of the external operation of an exit node.
pub const EXIT_TIMEOUT: Duration = Duration::from_secs(10);

/// What the node does after handling an instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// Pass the onion to the next hop.
    Forward(ForwardInstruction),
    /// Answer the previous hop with a response sealed for the client.
    Respond(Vec<u8>),
}

/// Decides how a node of some role handles a peeled instruction.
#[async_trait]
pub trait RelayBehavior: Send + Sync {
    /// Role of the node.
    fn role(&self) -> Role;

    /// Handle the instruction revealed by the node's layer. `key` is the
    /// key of that layer.
    async fn route(&self, instruction: RelayInstruction, key: &LayerKey) -> Result<Route, RelayError>;
}

/// First hop of a circuit, accepts connections from clients.
#[derive(Clone, Copy, Debug, Default)]
pub struct GuardRelay;

#[async_trait]
impl RelayBehavior for GuardRelay {
    fn role(&self) -> Role {
        Role::Guard
    }

    async fn route(&self, instruction: RelayInstruction, _key: &LayerKey) -> Result<Route, RelayError> {
        match instruction {
            RelayInstruction::Forward(forward) => Ok(Route::Forward(forward)),
            RelayInstruction::Exit(_) => Err(RelayError::UnexpectedInstruction { role: self.role() }),
        }
    }
}

/// Intermediate hop of a circuit.
#[derive(Clone, Copy, Debug, Default)]
pub struct MiddleRelay;

#[async_trait]
impl RelayBehavior for MiddleRelay {
    fn role(&self) -> Role {
        Role::Middle
    }

    async fn route(&self, instruction: RelayInstruction, _key: &LayerKey) -> Result<Route, RelayError> {
        match instruction {
            RelayInstruction::Forward(forward) => Ok(Route::Forward(forward)),
            RelayInstruction::Exit(_) => Err(RelayError::UnexpectedInstruction { role: self.role() }),
        }
    }
}

/** Terminal hop of a circuit.

Executes the request and seals the response with the key of its own layer, so
only the client can read it on the way back.
*/
pub struct ExitRelay {
    operation: Box<dyn ExternalOperation>,
    timeout: Duration,
}

impl ExitRelay {
    /// Create an exit executing requests with `operation`.
    pub fn new(operation: Box<dyn ExternalOperation>) -> ExitRelay {
        ExitRelay {
            operation,
            timeout: EXIT_TIMEOUT,
        }
    }

    /// Set the timeout of the external operation.
    pub fn with_timeout(mut self, timeout: Duration) -> ExitRelay {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl RelayBehavior for ExitRelay {
    fn role(&self) -> Role {
        Role::Exit
    }

    async fn route(&self, instruction: RelayInstruction, key: &LayerKey) -> Result<Route, RelayError> {
        let request = match instruction {
            RelayInstruction::Exit(request) => request,
            RelayInstruction::Forward(_) => return Err(RelayError::UnexpectedInstruction { role: self.role() }),
        };

        let response = timeout(self.timeout, self.operation.execute(&request)).await
            .map_err(|_| RelayError::ExternalTimeout)?
            .map_err(RelayError::ExternalOperation)?;

        trace!("Exit request {} finished with status {}", request, response.status);

        let bytes = to_vec(&response, response.size())
            .map_err(|_| RelayError::Malformed)?;
        let sealed = key.seal(&mut thread_rng(), &bytes)
            .map_err(RelayError::Seal)?;

        Ok(Route::Respond(sealed))
    }
}
