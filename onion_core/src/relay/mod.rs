/*! Relay engine of a node.

`RelayNode` accepts onions on a TCP listener, peels its layer with the node's
`SecretKey` and lets the role specific `RelayBehavior` decide whether the
onion goes to the next hop or the request is executed. Responses follow the
reverse path kept by `ReversePathRouter`.
*/

pub mod behavior;
pub mod codec;
pub mod errors;
pub mod exit;
pub mod node;
pub mod registry;
pub mod router;

pub use self::behavior::*;
pub use self::codec::FrameCodec;
pub use self::errors::*;
pub use self::exit::*;
pub use self::node::*;
pub use self::registry::*;
pub use self::router::*;
