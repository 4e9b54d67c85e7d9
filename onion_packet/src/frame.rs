/*! Frames exchanged between neighbouring hops.

Every message on a link is a `Frame`. Its kind is decoded before the payload
is interpreted, so a response can never be mistaken for an onion.
*/

use std::fmt;

use cookie_factory::{do_gen, gen_be_u16, gen_be_u8, gen_call, gen_cond, gen_slice};
use nom::branch::alt;
use nom::bytes::complete::{tag, take};
use nom::combinator::{map_opt, map_res, rest};
use nom::number::complete::{be_u16, u8 as parse_u8};

use onion_binary_io::*;

use crate::ids::{CircuitId, ID_SIZE};

/// Maximum size of a serialized frame. Length prefixes above this are rejected.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Maximum length of the message carried by an `Error` frame.
pub const MAX_ERROR_MESSAGE_LEN: usize = 1024;

/// Reason a hop failed to relay a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Packet is too short to contain an onion layer or can't be parsed.
    MalformedPacket = 1,
    /// Onion layer can't be decrypted with the hop's key.
    DecryptionFailure = 2,
    /// The next hop can't be dialled.
    UpstreamUnreachable = 3,
    /// The next hop or the external operation didn't answer in time.
    UpstreamTimeout = 4,
    /// The exit node failed to execute the request.
    ExternalOperationFailure = 5,
    /// The instruction doesn't fit the role of the hop.
    UnexpectedInstruction = 6,
    /// The hop has too many open connections.
    Overloaded = 7,
}

impl ErrorCode {
    /// Convert a raw code into an `ErrorCode`.
    pub fn from_u8(code: u8) -> Option<ErrorCode> {
        match code {
            1 => Some(ErrorCode::MalformedPacket),
            2 => Some(ErrorCode::DecryptionFailure),
            3 => Some(ErrorCode::UpstreamUnreachable),
            4 => Some(ErrorCode::UpstreamTimeout),
            5 => Some(ErrorCode::ExternalOperationFailure),
            6 => Some(ErrorCode::UnexpectedInstruction),
            7 => Some(ErrorCode::Overloaded),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorCode::MalformedPacket => "malformed packet",
            ErrorCode::DecryptionFailure => "decryption failure",
            ErrorCode::UpstreamUnreachable => "upstream unreachable",
            ErrorCode::UpstreamTimeout => "upstream timeout",
            ErrorCode::ExternalOperationFailure => "external operation failure",
            ErrorCode::UnexpectedInstruction => "unexpected instruction",
            ErrorCode::Overloaded => "overloaded",
        };
        f.write_str(s)
    }
}

/** Frame sent over a link between two hops.

Serialized form:

Length   | Content
-------- | ------
`1`      | Kind: `0x00` Forward, `0x01` Response, `0x02` Error
`16`     | `CircuitId` of the link
variable | Kind-specific data

`Forward` carries the onion, `Response` the response sealed by the exit node.
`Error` carries a one byte `ErrorCode`, a BigEndian `u16` message length and
the UTF-8 message.
*/
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Onion travelling towards the exit.
    Forward {
        /// Circuit id of the link the frame is sent on.
        circuit_id: CircuitId,
        /// Onion addressed to the receiving hop.
        onion: Vec<u8>,
    },
    /// Response travelling back towards the client.
    Response {
        /// Circuit id of the link the frame is sent on.
        circuit_id: CircuitId,
        /// Response sealed for the client, opaque to relays.
        payload: Vec<u8>,
    },
    /// Failure synthesized by some hop, travelling back towards the client.
    Error {
        /// Circuit id of the link the frame is sent on.
        circuit_id: CircuitId,
        /// Reason of the failure.
        code: ErrorCode,
        /// Human readable description.
        message: String,
    },
}

impl Frame {
    /// Circuit id of the link the frame belongs to.
    pub fn circuit_id(&self) -> CircuitId {
        match *self {
            Frame::Forward { circuit_id, .. } => circuit_id,
            Frame::Response { circuit_id, .. } => circuit_id,
            Frame::Error { circuit_id, .. } => circuit_id,
        }
    }

    /// Same frame addressed to another link.
    pub fn with_circuit_id(self, id: CircuitId) -> Frame {
        match self {
            Frame::Forward { onion, .. } => Frame::Forward { circuit_id: id, onion },
            Frame::Response { payload, .. } => Frame::Response { circuit_id: id, payload },
            Frame::Error { code, message, .. } => Frame::Error { circuit_id: id, code, message },
        }
    }

    /// Length of the serialized frame.
    pub fn size(&self) -> usize {
        let data_len = match *self {
            Frame::Forward { ref onion, .. } => onion.len(),
            Frame::Response { ref payload, .. } => payload.len(),
            Frame::Error { ref message, .. } => 1 + 2 + message.len(),
        };
        1 + ID_SIZE + data_len
    }

    /// Create an `Error` frame, truncating the message to fit the wire format.
    pub fn error(circuit_id: CircuitId, code: ErrorCode, message: &str) -> Frame {
        let mut end = message.len().min(MAX_ERROR_MESSAGE_LEN);
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        Frame::Error {
            circuit_id,
            code,
            message: message[..end].to_owned(),
        }
    }
}

fn parse_forward(input: &[u8]) -> IResult<&[u8], Frame> {
    let (input, _) = tag("\x00")(input)?;
    let (input, circuit_id) = CircuitId::from_bytes(input)?;
    let (input, onion) = rest(input)?;
    Ok((input, Frame::Forward { circuit_id, onion: onion.to_vec() }))
}

fn parse_response(input: &[u8]) -> IResult<&[u8], Frame> {
    let (input, _) = tag("\x01")(input)?;
    let (input, circuit_id) = CircuitId::from_bytes(input)?;
    let (input, payload) = rest(input)?;
    Ok((input, Frame::Response { circuit_id, payload: payload.to_vec() }))
}

fn parse_error(input: &[u8]) -> IResult<&[u8], Frame> {
    let (input, _) = tag("\x02")(input)?;
    let (input, circuit_id) = CircuitId::from_bytes(input)?;
    let (input, code) = map_opt(parse_u8, ErrorCode::from_u8)(input)?;
    let (input, len) = be_u16(input)?;
    let (input, message) = map_res(take(len), |bytes: &[u8]| String::from_utf8(bytes.to_vec()))(input)?;
    Ok((input, Frame::Error { circuit_id, code, message }))
}

impl FromBytes for Frame {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        alt((parse_forward, parse_response, parse_error))(input)
    }
}

impl ToBytes for Frame {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        match *self {
            Frame::Forward { ref circuit_id, ref onion } => do_gen!(buf,
                gen_be_u8!(0x00) >>
                gen_call!(|buf, id| CircuitId::to_bytes(id, buf), circuit_id) >>
                gen_slice!(onion.as_slice()) >>
                gen_len_limit(MAX_FRAME_SIZE)
            ),
            Frame::Response { ref circuit_id, ref payload } => do_gen!(buf,
                gen_be_u8!(0x01) >>
                gen_call!(|buf, id| CircuitId::to_bytes(id, buf), circuit_id) >>
                gen_slice!(payload.as_slice()) >>
                gen_len_limit(MAX_FRAME_SIZE)
            ),
            Frame::Error { ref circuit_id, code, ref message } => do_gen!(buf,
                gen_cond!(message.len() > u16::MAX as usize, |buf| gen_error(buf, 0)) >>
                gen_be_u8!(0x02) >>
                gen_call!(|buf, id| CircuitId::to_bytes(id, buf), circuit_id) >>
                gen_be_u8!(code as u8) >>
                gen_be_u16!(message.len() as u16) >>
                gen_slice!(message.as_bytes()) >>
                gen_len_limit(MAX_FRAME_SIZE)
            ),
        }
    }
}
