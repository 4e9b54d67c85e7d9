/*! Node descriptor exchanged with the directory.
*/

use std::net::SocketAddr;

use crypto_box::{PublicKey, KEY_SIZE};
use serde::{Deserialize, Serialize};

use crate::ids::NodeId;
use crate::role::Role;

/** Everything a client needs to route through a relay node.

The directory serializes descriptors as JSON; the public key travels as
lowercase hex. `last_seen` is filled in by the directory on registration, a
value sent by the node itself is ignored.
*/
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Identifier of the node.
    pub id: NodeId,
    /// Position the node takes in circuits.
    pub role: Role,
    /// Address the relay engine listens on.
    pub address: SocketAddr,
    /// Long-term key onion layers for this node are wrapped to.
    #[serde(with = "hex_public_key")]
    pub public_key: PublicKey,
    /// Relative selection weight, `0` is never selected.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Unix time in seconds of the last registration.
    #[serde(default)]
    pub last_seen: u64,
}

fn default_weight() -> u32 {
    1
}

impl NodeDescriptor {
    /// Create a descriptor with the default weight.
    pub fn new(id: NodeId, role: Role, address: SocketAddr, public_key: PublicKey) -> NodeDescriptor {
        NodeDescriptor {
            id,
            role,
            address,
            public_key,
            weight: default_weight(),
            last_seen: 0,
        }
    }
}

mod hex_public_key {
    use super::*;

    use serde::{Deserializer, Serializer};
    use serde::de::Error;

    pub fn serialize<S: Serializer>(pk: &PublicKey, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(pk.as_bytes()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PublicKey, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s).map_err(D::Error::custom)?;
        let bytes = <[u8; KEY_SIZE]>::try_from(bytes)
            .map_err(|bytes| D::Error::custom(format!("public key should be {} bytes: {} bytes", KEY_SIZE, bytes.len())))?;
        Ok(PublicKey::from(bytes))
    }
}
