/*! Plaintext revealed to a hop after it peels its onion layer.
*/

use std::net::SocketAddr;

use cookie_factory::{do_gen, gen_be_u8, gen_call, gen_slice};
use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::combinator::{map, rest};

use onion_binary_io::*;

use crate::exit::ExitRequest;
use crate::ids::{NodeId, ID_SIZE};

/** Instruction for a hop to pass the rest of the onion to the next hop.

The client resolves `address` from its circuit by `next_hop` when it builds
the onion, so relays never look up topology themselves.

Serialized form:

Length   | Content
-------- | ------
`1`      | `0x01`
`16`     | `NodeId` of the next hop
`7` or `19` | `SocketAddr` of the next hop
variable | Onion for the next hop

*/
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardInstruction {
    /// Identifier of the next hop.
    pub next_hop: NodeId,
    /// Address the next hop listens on.
    pub address: SocketAddr,
    /// Remaining onion, still encrypted for the next hop.
    pub onion: Vec<u8>,
}

impl ForwardInstruction {
    /// Length of the serialized instruction.
    pub fn size(&self) -> usize {
        let address_len = match self.address {
            SocketAddr::V4(_) => 1 + 4 + 2,
            SocketAddr::V6(_) => 1 + 16 + 2,
        };
        1 + ID_SIZE + address_len + self.onion.len()
    }
}

impl FromBytes for ForwardInstruction {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag("\x01")(input)?;
        let (input, next_hop) = NodeId::from_bytes(input)?;
        let (input, address) = SocketAddr::from_bytes(input)?;
        let (input, onion) = rest(input)?;
        Ok((input, ForwardInstruction {
            next_hop,
            address,
            onion: onion.to_vec(),
        }))
    }
}

impl ToBytes for ForwardInstruction {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(0x01) >>
            gen_call!(|buf, id| NodeId::to_bytes(id, buf), &self.next_hop) >>
            gen_call!(|buf, addr| SocketAddr::to_bytes(addr, buf), &self.address) >>
            gen_slice!(self.onion.as_slice())
        )
    }
}

/** Plaintext of a single onion layer.

Serialized form:

Length   | Content
-------- | ------
`1`      | `0x01` for `Forward`, `0x02` for `Exit`
variable | Instruction

*/
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayInstruction {
    /// Pass the remaining onion to the next hop.
    Forward(ForwardInstruction),
    /// Execute the request, this hop is the terminal one.
    Exit(ExitRequest),
}

impl RelayInstruction {
    /// Length of the serialized instruction.
    pub fn size(&self) -> usize {
        match *self {
            RelayInstruction::Forward(ref p) => p.size(),
            RelayInstruction::Exit(ref p) => 1 + p.size(),
        }
    }
}

impl FromBytes for RelayInstruction {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        alt((
            map(ForwardInstruction::from_bytes, RelayInstruction::Forward),
            map(parse_exit, RelayInstruction::Exit),
        ))(input)
    }
}

fn parse_exit(input: &[u8]) -> IResult<&[u8], ExitRequest> {
    let (input, _) = tag("\x02")(input)?;
    ExitRequest::from_bytes(input)
}

impl ToBytes for RelayInstruction {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        match *self {
            RelayInstruction::Forward(ref p) => p.to_bytes(buf),
            RelayInstruction::Exit(ref p) => do_gen!(buf,
                gen_be_u8!(0x02) >>
                gen_call!(|buf, p| ExitRequest::to_bytes(p, buf), p)
            ),
        }
    }
}
