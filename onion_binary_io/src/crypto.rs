use nom::IResult;
use nom::combinator::map;

use crypto_box::{PublicKey, KEY_SIZE};

use cookie_factory::{do_gen, gen_slice};

use super::{FromBytes, ToBytes, GenError};

impl FromBytes for PublicKey {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        map(<[u8; KEY_SIZE]>::from_bytes, PublicKey::from)(input)
    }
}

impl ToBytes for PublicKey {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf, gen_slice!(self.as_bytes()))
    }
}
