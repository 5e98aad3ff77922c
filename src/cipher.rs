//! Payload encryption keys and shared-secret authentication
//!
//! The publisher rotates a pair of AES-CBC key sets (even slot 0, odd slot 1)
//! and flags each data packet with the slot it used. Both slots stay valid
//! while a rotation is in flight, so late packets under the previous key can
//! still be read.
//!
//! Rotation swaps the whole [`CipherKeySet`]. Decoders take one snapshot per
//! packet via [`CipherKeyManager::snapshot`].

use aes::{Aes128, Aes192, Aes256};
use arc_swap::ArcSwapOption;
use bytes::{BufMut, Bytes, BytesMut};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

use crate::types::OperationalEncoding;
use crate::wire::{PacketReader, text};
use crate::{Result, SubscriberError};

/// Length of the random salt prepended to the authentication id.
pub const AUTHENTICATION_SALT_LENGTH: usize = 16;

const IV_LENGTH: usize = 16;

/// One {key, IV} pair.
#[derive(Clone, PartialEq, Eq)]
pub struct CipherKey {
    key: Vec<u8>,
    iv: Vec<u8>,
}

impl CipherKey {
    pub fn new(key: Vec<u8>, iv: Vec<u8>) -> Result<Self> {
        if !matches!(key.len(), 16 | 24 | 32) {
            return Err(SubscriberError::crypto_error(format!(
                "unsupported key length {}",
                key.len()
            )));
        }
        if iv.len() != IV_LENGTH {
            return Err(SubscriberError::crypto_error(format!(
                "unsupported IV length {}",
                iv.len()
            )));
        }
        Ok(Self { key, iv })
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        cbc_decrypt(&self.key, &self.iv, ciphertext)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        cbc_encrypt(&self.key, &self.iv, plaintext)
    }
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherKey").field("key_bits", &(self.key.len() * 8)).finish_non_exhaustive()
    }
}

/// Even and odd key slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherKeySet {
    slots: [CipherKey; 2],
}

impl CipherKeySet {
    pub fn new(even: CipherKey, odd: CipherKey) -> Self {
        Self { slots: [even, odd] }
    }

    /// Reads four length-prefixed arrays: even key, even IV, odd key, odd IV.
    pub fn parse(buffer: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(buffer, "cipher keys");
        let mut next = || reader.read_sized_bytes().map(<[u8]>::to_vec);

        let even_key = next()?;
        let even_iv = next()?;
        let odd_key = next()?;
        let odd_iv = next()?;

        Ok(Self::new(CipherKey::new(even_key, even_iv)?, CipherKey::new(odd_key, odd_iv)?))
    }

    /// Serializes in the order [`parse`](Self::parse) expects.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for slot in &self.slots {
            for part in [&slot.key, &slot.iv] {
                buf.put_i32(part.len() as i32);
                buf.put_slice(part);
            }
        }
        buf.to_vec()
    }

    pub fn slot(&self, cipher_index: usize) -> Result<&CipherKey> {
        self.slots
            .get(cipher_index)
            .ok_or_else(|| {
                SubscriberError::crypto_error(format!("cipher index {cipher_index} out of range"))
            })
    }

    pub fn decrypt(&self, payload: &[u8], cipher_index: usize) -> Result<Vec<u8>> {
        self.slot(cipher_index)?.decrypt(payload)
    }

    pub fn encrypt(&self, payload: &[u8], cipher_index: usize) -> Result<Vec<u8>> {
        self.slot(cipher_index)?.encrypt(payload)
    }
}

/// Holds the active key set and swaps it atomically on rotation.
#[derive(Debug, Default)]
pub struct CipherKeyManager {
    current: ArcSwapOption<CipherKeySet>,
}

impl CipherKeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the key set carried by an `UpdateCipherKeys` response.
    ///
    /// On failure the previous key set stays active.
    pub fn rotate(&self, buffer: &[u8]) -> Result<()> {
        let keys = CipherKeySet::parse(buffer)?;
        self.install(keys);
        Ok(())
    }

    pub fn install(&self, keys: CipherKeySet) {
        self.current.store(Some(Arc::new(keys)));
    }

    /// Snapshot to use for one decode.
    pub fn snapshot(&self) -> Option<Arc<CipherKeySet>> {
        self.current.load_full()
    }

    pub fn clear(&self) {
        self.current.store(None);
    }

    pub fn is_active(&self) -> bool {
        self.current.load().is_some()
    }
}

/// AES-256 key material derived from the gateway shared secret.
#[derive(Clone)]
pub struct SharedSecret {
    key: [u8; 32],
    iv: [u8; IV_LENGTH],
}

impl SharedSecret {
    /// Key = SHA-256(secret), IV = first 16 bytes of SHA-256(key ‖ secret).
    pub fn new(secret: &str) -> Self {
        let key: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(secret.as_bytes());
        let digest = hasher.finalize();

        let mut iv = [0u8; IV_LENGTH];
        iv.copy_from_slice(&digest[..IV_LENGTH]);
        Self { key, iv }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        cbc_encrypt(&self.key, &self.iv, plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        cbc_decrypt(&self.key, &self.iv, ciphertext)
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Builds the `Authenticate` payload: 4-byte length then the ciphertext of
/// a random salt followed by the encoded authentication id.
pub fn authentication_payload(
    secret: &SharedSecret,
    authentication_id: &str,
    encoding: OperationalEncoding,
) -> Result<Bytes> {
    if authentication_id.is_empty() {
        return Err(SubscriberError::misuse("authentication id must not be empty"));
    }

    let mut plaintext = vec![0u8; AUTHENTICATION_SALT_LENGTH];
    rand::thread_rng().fill_bytes(&mut plaintext);
    plaintext.extend_from_slice(&text::encode(authentication_id, encoding));

    let ciphertext = secret.encrypt(&plaintext)?;
    let mut buf = BytesMut::with_capacity(4 + ciphertext.len());
    buf.put_u32(ciphertext.len() as u32);
    buf.put_slice(&ciphertext);
    Ok(buf.freeze())
}

fn cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let result = match key.len() {
        16 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(invalid_length)?
            .decrypt_padded_vec_mut::<Pkcs7>(data),
        24 => cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(invalid_length)?
            .decrypt_padded_vec_mut::<Pkcs7>(data),
        32 => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(invalid_length)?
            .decrypt_padded_vec_mut::<Pkcs7>(data),
        other => return Err(unsupported_key_length(other)),
    };
    result.map_err(|_| {
        SubscriberError::crypto_error("payload decryption failed: bad padding or key")
    })
}

fn unsupported_key_length(length: usize) -> SubscriberError {
    SubscriberError::crypto_error(format!("unsupported key length {length}"))
}

fn cbc_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let ciphertext = match key.len() {
        16 => cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(invalid_length)?
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        24 => cbc::Encryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(invalid_length)?
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        32 => cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(invalid_length)?
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        other => return Err(unsupported_key_length(other)),
    };
    Ok(ciphertext)
}

fn invalid_length(_: cbc::cipher::InvalidLength) -> SubscriberError {
    SubscriberError::crypto_error("invalid key or IV length")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_set(seed: u8) -> CipherKeySet {
        CipherKeySet::new(
            CipherKey::new(vec![seed; 32], vec![seed.wrapping_add(1); 16]).unwrap(),
            CipherKey::new(vec![seed.wrapping_add(2); 32], vec![seed.wrapping_add(3); 16]).unwrap(),
        )
    }

    #[test]
    fn rotation_parses_four_length_prefixed_arrays() {
        let manager = CipherKeyManager::new();
        assert!(!manager.is_active());

        let keys = key_set(7);
        manager.rotate(&keys.encode()).unwrap();
        assert_eq!(*manager.snapshot().unwrap(), keys);
    }

    #[test]
    fn slots_decrypt_independently() {
        let keys = key_set(1);
        let even = keys.encrypt(b"even payload", 0).unwrap();
        let odd = keys.encrypt(b"odd payload", 1).unwrap();
        assert_eq!(keys.decrypt(&even, 0).unwrap(), b"even payload");
        assert_eq!(keys.decrypt(&odd, 1).unwrap(), b"odd payload");
        assert!(keys.decrypt(&even, 1).map(|p| p != b"even payload").unwrap_or(true));
        assert!(keys.slot(2).is_err());
    }

    #[test]
    fn snapshot_taken_before_rotation_keeps_old_keys() {
        let manager = CipherKeyManager::new();
        manager.install(key_set(1));
        let in_flight = manager.snapshot().unwrap();
        let ciphertext = in_flight.encrypt(b"late packet", 0).unwrap();

        manager.rotate(&key_set(50).encode()).unwrap();

        assert_eq!(in_flight.decrypt(&ciphertext, 0).unwrap(), b"late packet");
        assert_ne!(*manager.snapshot().unwrap(), *in_flight);
    }

    #[test]
    fn failed_rotation_keeps_previous_keys() {
        let manager = CipherKeyManager::new();
        manager.install(key_set(1));

        let mut bad = key_set(2).encode();
        bad.truncate(bad.len() - 3);
        assert!(manager.rotate(&bad).is_err());
        assert_eq!(*manager.snapshot().unwrap(), key_set(1));

        let mut wrong_key_size = BytesMut::new();
        for part in [&[0u8; 5][..], &[0u8; 16], &[0u8; 32], &[0u8; 16]] {
            wrong_key_size.put_i32(part.len() as i32);
            wrong_key_size.put_slice(part);
        }
        assert!(matches!(manager.rotate(&wrong_key_size), Err(SubscriberError::Crypto { .. })));
    }

    #[test]
    fn shared_secret_round_trips_and_rejects_wrong_secret() {
        let secret = SharedSecret::new("s3cret");
        let ciphertext = secret.encrypt(b"cipher keys").unwrap();
        assert_eq!(secret.decrypt(&ciphertext).unwrap(), b"cipher keys");

        let other = SharedSecret::new("different");
        assert!(other.decrypt(&ciphertext).map(|p| p != b"cipher keys").unwrap_or(true));
    }

    #[test]
    fn authentication_payload_carries_salted_id() {
        let secret = SharedSecret::new("s3cret");
        let payload =
            authentication_payload(&secret, "subscriber-1", OperationalEncoding::Utf8).unwrap();

        let len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
        assert_eq!(len, payload.len() - 4);

        let plaintext = secret.decrypt(&payload[4..]).unwrap();
        assert_eq!(&plaintext[AUTHENTICATION_SALT_LENGTH..], b"subscriber-1");
    }

    #[test]
    fn empty_authentication_id_fails_fast() {
        let secret = SharedSecret::new("s3cret");
        assert!(matches!(
            authentication_payload(&secret, "", OperationalEncoding::Utf8),
            Err(SubscriberError::Misuse { .. })
        ));
    }
}
