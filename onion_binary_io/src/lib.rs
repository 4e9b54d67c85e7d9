/*! Traits and helpers to (de)serialize wire types.

Parsers are written with `nom`, generators with `cookie_factory`.
*/

#![forbid(unsafe_code)]

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub use nom::IResult;
pub use cookie_factory::GenError;

use nom::bytes::streaming::take;
use nom::combinator::map;
use nom::number::streaming::{be_u16, u8 as parse_u8};
use nom::error::{Error as NomError, ErrorKind as NomErrorKind};

use cookie_factory::{do_gen, gen_be_u8, gen_be_u16, gen_slice};

#[cfg(feature = "crypto")]
mod crypto;

/// Tag of IPv4 `SocketAddr` on the wire.
pub const SOCKET_ADDR_V4: u8 = 4;
/// Tag of IPv6 `SocketAddr` on the wire.
pub const SOCKET_ADDR_V6: u8 = 6;
/// Maximum serialized size of `SocketAddr`: tag, IPv6 address, port.
pub const MAX_SOCKET_ADDR_SIZE: usize = 1 + 16 + 2;

/// The trait provides method to deserialize struct from raw bytes.
pub trait FromBytes: Sized {
    /// Deserialize struct using `nom` from raw bytes.
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self>;
}

/// The trait provides method to serialize struct into raw bytes.
pub trait ToBytes: Sized {
    /// Serialize struct into raw bytes using `cookie_factory`.
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError>;
}

/// Generator that returns an error with the given code.
pub fn gen_error(_buf: (&mut [u8], usize), error: u32) -> Result<(&mut [u8], usize), GenError> {
    Err(GenError::CustomError(error))
}

/// Generator that fails when the serialized length exceeds `limit`.
pub fn gen_len_limit(buf: (&mut [u8], usize), limit: usize) -> Result<(&mut [u8], usize), GenError> {
    if buf.1 <= limit {
        Ok(buf)
    } else {
        Err(GenError::BufferTooBig(buf.1))
    }
}

/// Serialize a value into a freshly allocated vector of at most `limit` bytes.
pub fn to_vec<T: ToBytes>(value: &T, limit: usize) -> Result<Vec<u8>, GenError> {
    let mut buf = vec![0; limit];
    let (_, size) = value.to_bytes((&mut buf, 0))?;
    buf.truncate(size);
    Ok(buf)
}

/// Parser that fails unless the whole input was consumed.
pub fn all_consumed(input: &[u8]) -> IResult<&[u8], ()> {
    if input.is_empty() {
        Ok((input, ()))
    } else {
        Err(nom::Err::Error(NomError::new(input, NomErrorKind::Eof)))
    }
}

impl<const N: usize> FromBytes for [u8; N] {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, bytes) = take(N)(input)?;
        let mut array = [0; N];
        array.copy_from_slice(bytes);
        Ok((input, array))
    }
}

impl FromBytes for Ipv4Addr {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        map(<[u8; 4]>::from_bytes, Ipv4Addr::from)(input)
    }
}

impl FromBytes for Ipv6Addr {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        map(<[u8; 16]>::from_bytes, Ipv6Addr::from)(input)
    }
}

impl FromBytes for SocketAddr {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, tag) = parse_u8(input)?;
        let (input, ip) = match tag {
            SOCKET_ADDR_V4 => map(Ipv4Addr::from_bytes, IpAddr::V4)(input)?,
            SOCKET_ADDR_V6 => map(Ipv6Addr::from_bytes, IpAddr::V6)(input)?,
            _ => return Err(nom::Err::Error(NomError::new(input, NomErrorKind::Switch))),
        };
        let (input, port) = be_u16(input)?;
        Ok((input, SocketAddr::new(ip, port)))
    }
}

impl ToBytes for SocketAddr {
    #[rustfmt::skip]
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        match self.ip() {
            IpAddr::V4(ip) => do_gen!(buf,
                gen_be_u8!(SOCKET_ADDR_V4) >>
                gen_slice!(ip.octets()) >>
                gen_be_u16!(self.port())
            ),
            IpAddr::V6(ip) => do_gen!(buf,
                gen_be_u8!(SOCKET_ADDR_V6) >>
                gen_slice!(ip.octets()) >>
                gen_be_u16!(self.port())
            ),
        }
    }
}

/// Generate a test that serializes a value and checks that parsing the bytes
/// back yields the same value.
#[macro_export]
macro_rules! encode_decode_test (
    ($test:ident, $value:expr) => (
        #[test]
        fn $test() {
            use $crate::{FromBytes, ToBytes};

            let value = $value;
            let mut buf = vec![0; 1024 * 1024];
            let (_, size) = value.to_bytes((&mut buf, 0)).unwrap();
            let (rest, decoded_value) = FromBytes::from_bytes(&buf[..size]).unwrap();
            // helps the compiler to infer the type of decoded_value
            fn infer<T>(_: &T, _: &T) {}
            infer(&decoded_value, &value);
            assert_eq!(decoded_value, value);
            assert!(rest.is_empty());
        }
    )
);
