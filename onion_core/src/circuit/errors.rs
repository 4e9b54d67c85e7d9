/*! Errors enum for circuit construction.
*/

use thiserror::Error;

use onion_crypto::onion::EncryptOnionError;
use onion_binary_io::GenError;
use onion_packet::Role;

use crate::directory::DirectoryError;

/// Error that can happen when creating a circuit.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum CreateCircuitError {
    /// Candidates for some role couldn't be fetched.
    #[error("Directory is unavailable")]
    DirectoryUnavailable(DirectoryError),
    /// No fresh candidate is left for the role.
    #[error("Not enough fresh nodes with role {role}")]
    InsufficientNodes {
        /// Role without candidates.
        role: Role,
    },
}

/// Error that can happen when sealing a request for a circuit.
#[derive(Debug, Error)]
pub enum SealRequestError {
    /// Layer encryption failed.
    #[error("Onion encryption error")]
    Encrypt(EncryptOnionError),
    /// Relay instruction can't be serialized.
    #[error("Serialize relay instruction error: {:?}", error)]
    Serialize {
        /// Serialization error.
        error: GenError,
    },
}
