/*! Errors enum for the node directory.
*/

use thiserror::Error;

/// Error that can happen when talking to the directory.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum DirectoryError {
    /// The directory can't be reached or answered with an error.
    #[error("Directory is unavailable: {reason}")]
    Unavailable {
        /// Description of the failure.
        reason: String,
    },
    /// The directory answered with something that isn't a descriptor list.
    #[error("Invalid directory response: {reason}")]
    InvalidResponse {
        /// Description of the failure.
        reason: String,
    },
}

impl DirectoryError {
    pub(crate) fn unavailable<E: ToString>(error: E) -> DirectoryError {
        DirectoryError::Unavailable { reason: error.to_string() }
    }
}
