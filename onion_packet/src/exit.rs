/*! Request executed by the exit node and its response.
*/

use std::fmt;
use std::str::FromStr;

use cookie_factory::{do_gen, gen_be_u16, gen_be_u8, gen_cond, gen_call, gen_slice};
use nom::bytes::complete::take;
use nom::combinator::{map_res, rest};
use nom::number::complete::{be_u16, u8 as parse_u8};
use thiserror::Error;

use onion_binary_io::*;

/// Maximum length of a request method.
pub const MAX_METHOD_LEN: usize = u8::MAX as usize;
/// Maximum length of a request target.
pub const MAX_TARGET_LEN: usize = u16::MAX as usize;

/// Error that can happen when parsing an `ExitRequest` from text.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ParseExitRequestError {
    /// No method or no target was given.
    #[error("Request should look like \"METHOD target\"")]
    MissingPart,
    /// Method is not an ASCII word.
    #[error("Invalid request method: {0}")]
    InvalidMethod(String),
    /// Method or target is too long for the wire format.
    #[error("Request part is too long")]
    TooLong,
}

/** Operation the exit node performs on behalf of the client.

Serialized form:

Length   | Content
-------- | ------
`1`      | Method length
variable | Method (UTF-8)
`2`      | Target length in BigEndian
variable | Target (UTF-8)
variable | Body

*/
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitRequest {
    /// Request method, e.g. `GET`.
    pub method: String,
    /// Target resource, usually a URL.
    pub target: String,
    /// Request body.
    pub body: Vec<u8>,
}

impl ExitRequest {
    /// Create a request without a body.
    pub fn new(method: &str, target: &str) -> ExitRequest {
        ExitRequest {
            method: method.to_owned(),
            target: target.to_owned(),
            body: Vec::new(),
        }
    }

    /// Length of the serialized request.
    pub fn size(&self) -> usize {
        1 + self.method.len() + 2 + self.target.len() + self.body.len()
    }
}

impl fmt::Display for ExitRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.method, self.target)
    }
}

impl FromStr for ExitRequest {
    type Err = ParseExitRequestError;

    /// Parse the textual form `"METHOD target"`. The method is uppercased.
    fn from_str(s: &str) -> Result<ExitRequest, ParseExitRequestError> {
        let mut parts = s.split_whitespace();
        let (method, target) = match (parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(target), None) => (method, target),
            _ => return Err(ParseExitRequestError::MissingPart),
        };
        if !method.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ParseExitRequestError::InvalidMethod(method.to_owned()))
        }
        if method.len() > MAX_METHOD_LEN || target.len() > MAX_TARGET_LEN {
            return Err(ParseExitRequestError::TooLong)
        }
        Ok(ExitRequest::new(&method.to_ascii_uppercase(), target))
    }
}

fn parse_string(input: &[u8], len: usize) -> IResult<&[u8], String> {
    map_res(take(len), |bytes: &[u8]| String::from_utf8(bytes.to_vec()))(input)
}

impl FromBytes for ExitRequest {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, method_len) = parse_u8(input)?;
        let (input, method) = parse_string(input, method_len as usize)?;
        let (input, target_len) = be_u16(input)?;
        let (input, target) = parse_string(input, target_len as usize)?;
        let (input, body) = rest(input)?;
        Ok((input, ExitRequest {
            method,
            target,
            body: body.to_vec(),
        }))
    }
}

impl ToBytes for ExitRequest {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_cond!(self.method.len() > MAX_METHOD_LEN, |buf| gen_error(buf, 0)) >>
            gen_cond!(self.target.len() > MAX_TARGET_LEN, |buf| gen_error(buf, 0)) >>
            gen_be_u8!(self.method.len() as u8) >>
            gen_slice!(self.method.as_bytes()) >>
            gen_be_u16!(self.target.len() as u16) >>
            gen_slice!(self.target.as_bytes()) >>
            gen_slice!(self.body.as_slice())
        )
    }
}

/** Result of an `ExitRequest`, sealed by the exit node for the client.

Serialized form:

Length   | Content
-------- | ------
`2`      | Status in BigEndian
variable | Body

*/
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitResponse {
    /// Status code of the operation.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl ExitResponse {
    /// Length of the serialized response.
    pub fn size(&self) -> usize {
        2 + self.body.len()
    }
}

impl FromBytes for ExitResponse {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, status) = be_u16(input)?;
        let (input, body) = rest(input)?;
        Ok((input, ExitResponse {
            status,
            body: body.to_vec(),
        }))
    }
}

impl ToBytes for ExitResponse {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u16!(self.status) >>
            gen_slice!(self.body.as_slice())
        )
    }
}
