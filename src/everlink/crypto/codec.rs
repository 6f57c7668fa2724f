use std::fmt;

use chacha20::cipher::{NewCipher, StreamCipher};
use chacha20::ChaCha20Legacy;

use crate::everlink::common::{Error, Result};

pub const KEY_BYTES: usize = 32;

/// Nonce prefix for bytes flowing client -> server.
pub const CLIENT_TO_SERVER_NONCE: u64 = 0x4354_4f53_0000_0001;
/// Nonce prefix for bytes flowing server -> client. Distinct from the
/// client->server prefix so reflected ciphertext can never be decrypted by
/// its originator.
pub const SERVER_TO_CLIENT_NONCE: u64 = 0x5354_4f43_0000_0002;

/// The pre-shared 32-byte symmetric key.
#[derive(Clone)]
pub struct Key([u8; KEY_BYTES]);

impl Key {
    pub fn new(bytes: &[u8]) -> Result<Key> {
        if bytes.len() != KEY_BYTES {
            return Err(Error::new(format!(
                "encryption key must be {} bytes, got {}",
                KEY_BYTES,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_BYTES];
        key.copy_from_slice(bytes);
        Ok(Key(key))
    }

    pub fn from_hex(s: &str) -> Result<Key> {
        let bytes = hex::decode(s).map_err(Error::new)?;
        Key::new(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // never log key material
        f.write_str("Key(..)")
    }
}

/// One direction of the encrypted stream. The keystream position advances in
/// lockstep with bytes processed, so the codec has no frame boundaries: a
/// byte encrypted at stream offset N always decrypts at stream offset N, no
/// matter how the resilient layer chunks it or how many reconnects happen in
/// between. encrypt and decrypt both preserve length exactly.
pub struct CryptoCodec {
    cipher: ChaCha20Legacy,
    position: u64,
}

impl CryptoCodec {
    pub fn new(key: &Key, direction_nonce: u64) -> CryptoCodec {
        let nonce = direction_nonce.to_le_bytes();
        CryptoCodec {
            cipher: ChaCha20Legacy::new(key.as_bytes().into(), (&nonce).into()),
            position: 0,
        }
    }

    pub fn encrypt(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
        self.position += data.len() as u64;
    }

    /// ChaCha20 is a stream cipher, so decryption is the same keystream xor.
    /// Kept as a separate method so call sites read correctly.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
        self.position += data.len() as u64;
    }

    /// Count of bytes this codec has processed since construction.
    pub fn position(&self) -> u64 {
        self.position
    }
}
