/*! Position a relay node takes in a circuit.
*/

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/** Role of a relay node.

Roles are ordered the way they appear in a circuit: a guard is contacted
first, an exit is always the last hop.
*/
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// First hop, the only one that sees the client's address.
    Guard,
    /// Intermediate hop.
    Middle,
    /// Terminal hop that executes the request.
    Exit,
}

impl Role {
    /// Lowercase name used in the directory protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Guard => "guard",
            Role::Middle => "middle",
            Role::Exit => "exit",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error that can happen when parsing a `Role`.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("Unknown role: {0}")]
pub struct ParseRoleError(pub String);

impl FromStr for Role {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Role, ParseRoleError> {
        match s.to_ascii_lowercase().as_str() {
            "guard" => Ok(Role::Guard),
            "middle" => Ok(Role::Middle),
            "exit" => Ok(Role::Exit),
            _ => Err(ParseRoleError(s.to_owned())),
        }
    }
}
