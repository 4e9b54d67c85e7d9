//! Long-term keys of the node.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};

use anyhow::{bail, Context, Error};
use hex::FromHex;
use rand::thread_rng;

use onion::crypto::{PublicKey, SecretKey};
use onion::packet::{NodeId, ID_SIZE};

/// Parse a secret key from its hex form.
pub fn parse_secret_key(s: &str) -> Result<SecretKey, Error> {
    let sk_bytes: [u8; crypto_box::KEY_SIZE] = FromHex::from_hex(s)
        .context("Invalid secret key")?;
    Ok(SecretKey::from(sk_bytes))
}

/// Node id derived from the public key, so it survives restarts.
pub fn node_id(pk: &PublicKey) -> NodeId {
    let mut id = [0; ID_SIZE];
    id.copy_from_slice(&pk.as_bytes()[..ID_SIZE]);
    NodeId(id)
}

/// Save keys to a binary file: public key followed by secret key.
pub fn save_keys(keys_file: &str, pk: &PublicKey, sk: &SecretKey) -> Result<(), Error> {
    #[cfg(unix)]
    use std::os::unix::fs::OpenOptionsExt;

    #[cfg(not(unix))]
    let mut file = File::create(keys_file)
        .context("Failed to create the keys file")?;

    #[cfg(unix)]
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .mode(0o600)
        .open(keys_file)
        .context("Failed to create the keys file")?;

    file.write_all(pk.as_bytes()).context("Failed to save public key to the keys file")?;
    file.write_all(sk.as_bytes()).context("Failed to save secret key to the keys file")?;
    Ok(())
}

/// Load keys from a binary file.
pub fn load_keys(mut file: File) -> Result<(PublicKey, SecretKey), Error> {
    let mut buf = [0; crypto_box::KEY_SIZE * 2];
    file.read_exact(&mut buf).context("Failed to read keys from the keys file")?;
    let (pk_bytes, sk_bytes) = buf.split_at(crypto_box::KEY_SIZE);
    let pk_bytes: [u8; crypto_box::KEY_SIZE] = pk_bytes.try_into()?;
    let sk_bytes: [u8; crypto_box::KEY_SIZE] = sk_bytes.try_into()?;
    let pk = PublicKey::from(pk_bytes);
    let sk = SecretKey::from(sk_bytes);
    if pk != sk.public_key() {
        bail!("The loaded public key does not correspond to the loaded secret key");
    }
    Ok((pk, sk))
}

/// Load keys from a binary file or generate and save them if the file does
/// not exist.
pub fn load_or_gen_keys(keys_file: &str) -> Result<(PublicKey, SecretKey), Error> {
    match File::open(keys_file) {
        Ok(file) => load_keys(file),
        Err(ref e) if e.kind() == ErrorKind::NotFound => {
            info!("Generating new keys and storing them to '{}'", keys_file);
            let sk = SecretKey::generate(&mut thread_rng());
            let pk = sk.public_key();
            save_keys(keys_file, &pk, &sk)?;
            Ok((pk, sk))
        },
        Err(e) => Err(Error::new(e).context("Failed to read the keys file")),
    }
}
