/*! Wire types of the onion relay protocol.

Binary types are parsed with `nom` and generated with `cookie_factory`
through the `FromBytes`/`ToBytes` traits of `onion_binary_io`. Directory
types are serialized as JSON with `serde`.
*/

#![forbid(unsafe_code)]

pub mod descriptor;
pub mod exit;
pub mod frame;
pub mod ids;
pub mod instruction;
pub mod role;

pub use self::descriptor::NodeDescriptor;
pub use self::exit::{ExitRequest, ExitResponse, ParseExitRequestError};
pub use self::frame::{ErrorCode, Frame, MAX_FRAME_SIZE};
pub use self::ids::{CircuitId, ConnectionId, NodeId, ParseIdError, ID_SIZE};
pub use self::instruction::{ForwardInstruction, RelayInstruction};
pub use self::role::{ParseRoleError, Role};
