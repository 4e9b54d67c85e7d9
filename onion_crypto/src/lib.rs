//! Functions for the core crypto.

#![forbid(unsafe_code)]

use rand::{CryptoRng, RngCore, thread_rng};

pub use crypto_box::{PublicKey, SecretKey, KEY_SIZE};

pub mod onion;

/// Fill an array of `N` bytes from the given cryptographically secure
/// generator.
pub fn random_bytes_from<R: RngCore + CryptoRng, const N: usize>(rng: &mut R) -> [u8; N] {
    let mut bytes = [0; N];
    rng.fill_bytes(&mut bytes);
    bytes
}

/// Generate `N` random bytes using the thread-local CSPRNG.
///
/// Used for every circuit, node and connection identifier: identifiers must
/// not be predictable by other parties.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    random_bytes_from(&mut thread_rng())
}

/// Generate a new key pair.
pub fn gen_keypair() -> (PublicKey, SecretKey) {
    let sk = SecretKey::generate(&mut thread_rng());
    (sk.public_key(), sk)
}
