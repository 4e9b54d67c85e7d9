/*! Random identifiers of nodes, circuits and connections.
*/

use std::fmt;
use std::str::FromStr;

use cookie_factory::{do_gen, gen_slice};
use nom::combinator::map;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use onion_binary_io::*;
use onion_crypto::random_bytes;

/// Number of bytes in every identifier.
pub const ID_SIZE: usize = 16;

/// Error that can happen when parsing an identifier from its hex form.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ParseIdError {
    /// The string is not valid hex.
    #[error("Identifier is not valid hex: {0}")]
    Hex(hex::FromHexError),
    /// The string decodes to a wrong number of bytes.
    #[error("Identifier should be {} bytes: {} bytes", ID_SIZE, len)]
    Length {
        /// Number of decoded bytes.
        len: usize,
    },
}

macro_rules! random_id (
    ($(#[$meta:meta])* $name:ident) => (
        $(#[$meta])*
        #[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; ID_SIZE]);

        impl $name {
            /// Generate a new identifier from the thread-local CSPRNG.
            pub fn random() -> $name {
                $name(random_bytes())
            }

            /// Raw bytes of the identifier.
            pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<$name, ParseIdError> {
                let bytes = hex::decode(s).map_err(ParseIdError::Hex)?;
                let len = bytes.len();
                let array = <[u8; ID_SIZE]>::try_from(bytes)
                    .map_err(|_| ParseIdError::Length { len })?;
                Ok($name(array))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<$name, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }

        impl FromBytes for $name {
            fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
                map(<[u8; ID_SIZE]>::from_bytes, $name)(input)
            }
        }

        impl ToBytes for $name {
            fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
                do_gen!(buf, gen_slice!(self.0))
            }
        }
    )
);

random_id!(
    /// Identifier of a relay node, advertised in its descriptor.
    NodeId
);

random_id!(
    /** Identifier of a circuit.

    The client names its circuit with it, and every link of the circuit carries
    its own `CircuitId` on the wire so a hop never sees the id used on another
    link.
    */
    CircuitId
);

random_id!(
    /// Node-local identifier of an accepted connection.
    ConnectionId
);
