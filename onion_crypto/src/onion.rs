/*! Layered onion encryption.

Every layer is addressed to exactly one hop. A layer has the form

Length   | Content
-------- | ------
`104`    | Layer key wrapped to the hop's `PublicKey`
`24`     | Nonce of the payload
variable | Payload encrypted with the layer key, with `16` bytes tag

The wrapped key is

Length   | Content
-------- | ------
`32`     | Ephemeral `PublicKey` of the sender
`24`     | Nonce of the wrapped key
`48`     | Layer key encrypted with `SalsaBox`, with `16` bytes tag

Peeling a layer with the hop's `SecretKey` yields either the next layer or,
when the hop is the last one, the plaintext. The codec doesn't know which.
*/

use std::fmt;

use crypto_box::SalsaBox;
use crypto_box::aead::generic_array::GenericArray;
use rand::{CryptoRng, Rng};
use thiserror::Error;
use xsalsa20poly1305::{Key, Nonce, XSalsa20Poly1305};
use xsalsa20poly1305::aead::{Aead, KeyInit};

use crate::*;

/// Size of the symmetric layer key.
pub const LAYER_KEY_SIZE: usize = 32;
/// Size of the nonce used to encrypt a layer payload.
pub const LAYER_NONCE_SIZE: usize = 24;
/// Size of the authentication tag.
pub const MAC_SIZE: usize = 16;
/// Size of the nonce used to wrap a layer key.
pub const BOX_NONCE_SIZE: usize = 24;
/// Fixed size of a layer key wrapped to a hop's `PublicKey`.
pub const WRAPPED_KEY_SIZE: usize = KEY_SIZE + BOX_NONCE_SIZE + LAYER_KEY_SIZE + MAC_SIZE;
/// Number of bytes a single layer adds to its payload.
pub const LAYER_OVERHEAD: usize = WRAPPED_KEY_SIZE + LAYER_NONCE_SIZE + MAC_SIZE;
/// A layer is malformed if it can't even hold the wrapped key and the nonce.
pub const MIN_LAYER_SIZE: usize = WRAPPED_KEY_SIZE + LAYER_NONCE_SIZE;

/// Error that can happen when building an onion.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum EncryptOnionError {
    /// There are no hops to encrypt for.
    #[error("Hop list is empty")]
    EmptyHopList,
    /// The AEAD refused to encrypt the payload.
    #[error("Failed to encrypt onion layer")]
    Encryption,
}

/// Error that can happen when peeling an onion layer.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum DecryptLayerError {
    /// Packet is shorter than the fixed wrapped key and nonce.
    #[error("Onion layer should be at least {} bytes: {} bytes", MIN_LAYER_SIZE, len)]
    MalformedPacket {
        /// Length of received packet.
        len: usize,
    },
    /// Key unwrap or tag check failed: wrong key or tampered packet.
    #[error("Failed to decrypt onion layer")]
    DecryptionFailure,
}

/// Symmetric key of a single onion layer.
#[derive(Clone, PartialEq, Eq)]
pub struct LayerKey([u8; LAYER_KEY_SIZE]);

impl fmt::Debug for LayerKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("LayerKey(..)")
    }
}

impl LayerKey {
    /// Generate a fresh random key.
    pub fn generate<R: Rng + CryptoRng>(rng: &mut R) -> LayerKey {
        LayerKey(random_bytes_from(rng))
    }

    fn cipher(&self) -> XSalsa20Poly1305 {
        XSalsa20Poly1305::new(Key::from_slice(&self.0))
    }

    /// Encrypt `plaintext` with a fresh nonce. Result is `nonce || ciphertext`.
    pub fn seal<R: Rng + CryptoRng>(&self, rng: &mut R, plaintext: &[u8]) -> Result<Vec<u8>, EncryptOnionError> {
        let nonce: [u8; LAYER_NONCE_SIZE] = random_bytes_from(rng);
        let encrypted = self.cipher().encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| EncryptOnionError::Encryption)?;

        let mut sealed = Vec::with_capacity(LAYER_NONCE_SIZE + encrypted.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&encrypted);
        Ok(sealed)
    }

    /// Decrypt data produced by `seal`.
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>, DecryptLayerError> {
        if data.len() < LAYER_NONCE_SIZE {
            return Err(DecryptLayerError::MalformedPacket { len: data.len() })
        }
        let (nonce, encrypted) = data.split_at(LAYER_NONCE_SIZE);
        self.cipher().decrypt(Nonce::from_slice(nonce), encrypted)
            .map_err(|_| DecryptLayerError::DecryptionFailure)
    }
}

/// Nested ciphertext. The outer layer belongs to the first hop.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OnionPacket(Vec<u8>);

impl OnionPacket {
    /// Wrap raw bytes received from the network.
    pub fn from_bytes(bytes: Vec<u8>) -> OnionPacket {
        OnionPacket(bytes)
    }

    /// Serialized packet.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume the packet returning serialized bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// Single-use layer: a fresh symmetric key and the hop it is addressed to.
/// Sealing consumes the layer so a key never encrypts two payloads.
pub struct OnionLayer {
    key: LayerKey,
    hop_pk: PublicKey,
}

impl OnionLayer {
    /// Create a layer for the hop with a freshly generated key.
    pub fn new<R: Rng + CryptoRng>(rng: &mut R, hop_pk: PublicKey) -> OnionLayer {
        OnionLayer {
            key: LayerKey::generate(rng),
            hop_pk,
        }
    }

    fn wrap_key<R: Rng + CryptoRng>(&self, rng: &mut R) -> Result<Vec<u8>, EncryptOnionError> {
        let ephemeral_sk = SecretKey::generate(rng);
        let salsa_box = SalsaBox::new(&self.hop_pk, &ephemeral_sk);
        let nonce: [u8; BOX_NONCE_SIZE] = random_bytes_from(rng);
        let encrypted = salsa_box.encrypt(GenericArray::from_slice(&nonce), &self.key.0[..])
            .map_err(|_| EncryptOnionError::Encryption)?;

        let mut wrapped = Vec::with_capacity(WRAPPED_KEY_SIZE);
        wrapped.extend_from_slice(ephemeral_sk.public_key().as_bytes());
        wrapped.extend_from_slice(&nonce);
        wrapped.extend_from_slice(&encrypted);
        Ok(wrapped)
    }

    /// Encrypt `payload` for the hop. Returns the layer and its key.
    pub fn seal<R: Rng + CryptoRng>(self, rng: &mut R, payload: &[u8]) -> Result<(Vec<u8>, LayerKey), EncryptOnionError> {
        let mut layer = self.wrap_key(rng)?;
        layer.extend_from_slice(&self.key.seal(rng, payload)?);
        Ok((layer, self.key))
    }
}

fn unwrap_key(wrapped: &[u8], sk: &SecretKey) -> Result<LayerKey, DecryptLayerError> {
    let (ephemeral_pk, rest) = wrapped.split_at(KEY_SIZE);
    let (nonce, encrypted) = rest.split_at(BOX_NONCE_SIZE);

    // X25519 ignores the top bit of a public key, a set bit would make the
    // wrapped key malleable
    if ephemeral_pk[KEY_SIZE - 1] & 0x80 != 0 {
        return Err(DecryptLayerError::DecryptionFailure)
    }

    let mut ephemeral_pk_bytes = [0; KEY_SIZE];
    ephemeral_pk_bytes.copy_from_slice(ephemeral_pk);
    let salsa_box = SalsaBox::new(&PublicKey::from(ephemeral_pk_bytes), sk);

    let key = salsa_box.decrypt(GenericArray::from_slice(nonce), encrypted)
        .map_err(|_| DecryptLayerError::DecryptionFailure)?;
    if key.len() != LAYER_KEY_SIZE {
        return Err(DecryptLayerError::DecryptionFailure)
    }

    let mut key_bytes = [0; LAYER_KEY_SIZE];
    key_bytes.copy_from_slice(&key);
    Ok(LayerKey(key_bytes))
}

/// Encrypt a single layer of `payload` for the hop with `hop_pk`.
pub fn encrypt_layer<R: Rng + CryptoRng>(rng: &mut R, payload: &[u8], hop_pk: &PublicKey) -> Result<(Vec<u8>, LayerKey), EncryptOnionError> {
    OnionLayer::new(rng, hop_pk.clone()).seal(rng, payload)
}

/** Wrap `payload` in one layer per hop.

Layers are built from the last hop backward, so the outer layer of the result
belongs to `hops[0]`. Every layer gets its own fresh key and nonces.
*/
pub fn encrypt_onion<R: Rng + CryptoRng>(rng: &mut R, payload: &[u8], hops: &[PublicKey]) -> Result<OnionPacket, EncryptOnionError> {
    if hops.is_empty() {
        return Err(EncryptOnionError::EmptyHopList)
    }

    let mut payload = payload.to_vec();
    for hop_pk in hops.iter().rev() {
        let (layer, _key) = encrypt_layer(rng, &payload, hop_pk)?;
        payload = layer;
    }

    Ok(OnionPacket(payload))
}

/** Peel exactly one layer using the hop's `SecretKey`.

Returns the remaining payload together with the layer key that was used.

Returns `Error` in case of failure:

- packet is shorter than the wrapped key and nonce
- key unwrap fails
- payload tag check fails
*/
pub fn decrypt_onion_layer(packet: &[u8], sk: &SecretKey) -> Result<(Vec<u8>, LayerKey), DecryptLayerError> {
    if packet.len() < MIN_LAYER_SIZE {
        return Err(DecryptLayerError::MalformedPacket { len: packet.len() })
    }

    let (wrapped, sealed) = packet.split_at(WRAPPED_KEY_SIZE);
    let key = unwrap_key(wrapped, sk)?;
    let payload = key.open(sealed)?;

    Ok((payload, key))
}
