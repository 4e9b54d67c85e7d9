/*! Errors enum for the relay engine.
*/

use std::io::Error as IoError;

use futures::channel::mpsc::SendError;
use thiserror::Error;

use onion_crypto::onion::{DecryptLayerError, EncryptOnionError};
use onion_packet::{ErrorCode, Role};

use crate::relay::codec::{DecodeError, EncodeError};
use crate::relay::exit::ExternalOperationError;
use crate::relay::registry::RegistryError;
use crate::relay::router::RouteError;

/// Error that can happen when relaying an onion.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The peeled layer doesn't contain a valid instruction.
    #[error("Malformed relay instruction")]
    Malformed,
    /// The onion layer can't be peeled.
    #[error("Onion layer decryption error")]
    Decrypt(DecryptLayerError),
    /// The instruction doesn't fit the role of the node.
    #[error("Instruction is unexpected for a {} node", role)]
    UnexpectedInstruction {
        /// Role of the node.
        role: Role,
    },
    /// A frame of an unexpected kind or circuit arrived.
    #[error("Unexpected frame")]
    UnexpectedFrame,
    /// The previous hop didn't send an onion in time.
    #[error("Timed out waiting for the first frame")]
    ReadTimeout,
    /// The previous hop closed the link before sending an onion.
    #[error("Previous hop closed the link")]
    Closed,
    /// The next hop can't be dialled.
    #[error("Next hop is unreachable: {0}")]
    UpstreamUnreachable(IoError),
    /// Dialling the next hop took too long.
    #[error("Next hop dial timed out")]
    DialTimeout,
    /// Write frame to the next hop error.
    #[error("Write frame to the next hop error")]
    UpstreamWrite(EncodeError),
    /// Read frame from the next hop error.
    #[error("Read frame from the next hop error")]
    UpstreamRead(DecodeError),
    /// The next hop closed the link without an answer.
    #[error("Next hop closed the link")]
    UpstreamClosed,
    /// The next hop didn't answer in time.
    #[error("Next hop timed out")]
    UpstreamTimeout,
    /// The exit request failed.
    #[error("External operation error: {0}")]
    ExternalOperation(ExternalOperationError),
    /// The exit request didn't finish in time.
    #[error("External operation timed out")]
    ExternalTimeout,
    /// The response can't be sealed for the client.
    #[error("Seal response error")]
    Seal(EncryptOnionError),
    /// Too many connections.
    #[error("Relay is overloaded")]
    Overloaded(RegistryError),
    /// Return path can't be registered or used.
    #[error("Reverse path routing error")]
    Route(RouteError),
    /// Read frame from a link error.
    #[error("Read frame error")]
    Read(DecodeError),
    /// Write frame to the previous hop error.
    #[error("Write frame error")]
    Write(EncodeError),
    /// The writer of the previous hop is gone.
    #[error("Send frame to the writer error")]
    SendTo(SendError),
}

impl RelayError {
    /// Code reported to the previous hop for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::Malformed
            | RelayError::UnexpectedFrame
            | RelayError::ReadTimeout
            | RelayError::Closed
            | RelayError::UpstreamRead(_)
            | RelayError::Read(_)
            | RelayError::Write(_)
            | RelayError::SendTo(_)
            | RelayError::Route(_) => ErrorCode::MalformedPacket,
            RelayError::Decrypt(DecryptLayerError::MalformedPacket { .. }) => ErrorCode::MalformedPacket,
            RelayError::Decrypt(DecryptLayerError::DecryptionFailure) => ErrorCode::DecryptionFailure,
            RelayError::UnexpectedInstruction { .. } => ErrorCode::UnexpectedInstruction,
            RelayError::UpstreamUnreachable(_)
            | RelayError::DialTimeout
            | RelayError::UpstreamWrite(_)
            | RelayError::UpstreamClosed => ErrorCode::UpstreamUnreachable,
            RelayError::UpstreamTimeout | RelayError::ExternalTimeout => ErrorCode::UpstreamTimeout,
            RelayError::ExternalOperation(_) | RelayError::Seal(_) => ErrorCode::ExternalOperationFailure,
            RelayError::Overloaded(_) => ErrorCode::Overloaded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn codes() {
        assert_eq!(RelayError::Malformed.code(), ErrorCode::MalformedPacket);
        assert_eq!(RelayError::Decrypt(DecryptLayerError::MalformedPacket { len: 3 }).code(), ErrorCode::MalformedPacket);
        assert_eq!(RelayError::Decrypt(DecryptLayerError::DecryptionFailure).code(), ErrorCode::DecryptionFailure);
        assert_eq!(RelayError::UnexpectedInstruction { role: Role::Guard }.code(), ErrorCode::UnexpectedInstruction);
        assert_eq!(RelayError::UpstreamUnreachable(IoError::from(ErrorKind::ConnectionRefused)).code(), ErrorCode::UpstreamUnreachable);
        assert_eq!(RelayError::DialTimeout.code(), ErrorCode::UpstreamUnreachable);
        assert_eq!(RelayError::UpstreamClosed.code(), ErrorCode::UpstreamUnreachable);
        assert_eq!(RelayError::UpstreamTimeout.code(), ErrorCode::UpstreamTimeout);
        assert_eq!(RelayError::ExternalTimeout.code(), ErrorCode::UpstreamTimeout);
        assert_eq!(
            RelayError::ExternalOperation(ExternalOperationError::Request("refused".to_owned())).code(),
            ErrorCode::ExternalOperationFailure
        );
        assert_eq!(RelayError::Overloaded(RegistryError::Overloaded { limit: 1 }).code(), ErrorCode::Overloaded);
    }
}
