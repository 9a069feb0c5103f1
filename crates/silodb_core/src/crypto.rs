//! Key management and record-level encryption.
//!
//! silodb uses a two-tier key scheme:
//!
//! - the **KEK** (key-encryption key) is derived from a user passphrase via
//!   HKDF-SHA256 and lives only inside the [`Database`](crate::Database)
//!   handle;
//! - the **DEK** (data-encryption key) is a random 32-byte key generated per
//!   table, stored in table metadata wrapped (encrypted) under the KEK, and
//!   unwrapped on demand for a single operation.
//!
//! Values are encrypted with AES-256-GCM. An encrypted blob is
//! `nonce (12) || ciphertext || tag (16)`, base64-encoded wherever it is
//! stored in a JSON document. The cipher name is recorded in database
//! metadata so readers can dispatch on it.
//!
//! Keys are zeroized on drop and redacted from `Debug` output.

use crate::error::{CoreError, CoreResult};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use serde_json::Value;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of an AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Cipher identifier recorded in database metadata.
pub const CIPHER_NAME: &str = "aes-256-gcm";

/// A 32-byte symmetric key (KEK or DEK).
///
/// The key material is zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; KEY_SIZE],
}

impl SecretKey {
    /// Generates a new random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CryptoFailed`] if the slice is not exactly 32
    /// bytes.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CoreError::crypto_failed(format!(
                "invalid key size: expected {KEY_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    /// Derives a KEK from a user passphrase using HKDF-SHA256.
    ///
    /// The derivation is deterministic: the same passphrase always yields
    /// the same key, which is what lets a store be reopened. HKDF is a key
    /// derivation function, not a password hash; passphrases should carry
    /// real entropy.
    #[must_use]
    pub fn derive_from_passphrase(passphrase: &str) -> Self {
        use hkdf::Hkdf;
        use sha2::Sha256;

        let hk = Hkdf::<Sha256>::new(None, passphrase.as_bytes());
        let mut bytes = [0u8; KEY_SIZE];
        // Expanding to KEY_SIZE cannot fail for SHA-256 output lengths.
        hk.expand(b"silodb-kek-v1", &mut bytes)
            .unwrap_or_else(|_| unreachable!("HKDF expand to 32 bytes"));
        Self { bytes }
    }

    /// Returns the raw key bytes.
    ///
    /// Don't log or serialize the result.
    #[must_use]
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Encrypts raw bytes, returning `nonce || ciphertext || tag`.
pub(crate) fn encrypt_bytes(key: &SecretKey, plaintext: &[u8]) -> CoreResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CoreError::crypto_failed("encryption error"))?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend(ciphertext);
    Ok(blob)
}

/// Decrypts a `nonce || ciphertext || tag` blob.
///
/// Authentication happens inside the AEAD open before any plaintext is
/// produced; a wrong key or a tampered byte fails here.
pub(crate) fn decrypt_bytes(key: &SecretKey, blob: &[u8]) -> CoreResult<Vec<u8>> {
    if blob.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CoreError::crypto_failed("ciphertext too short"));
    }

    let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
    let nonce = Nonce::from_slice(&blob[..NONCE_SIZE]);

    cipher
        .decrypt(nonce, &blob[NONCE_SIZE..])
        .map_err(|_| CoreError::crypto_failed("decryption failed"))
}

/// Encrypts a JSON value to a base64 blob string.
pub fn encrypt_value(key: &SecretKey, value: &Value) -> CoreResult<String> {
    let plaintext = serde_json::to_vec(value)?;
    let blob = encrypt_bytes(key, &plaintext)?;
    Ok(BASE64.encode(blob))
}

/// Decrypts a base64 blob string back to a JSON value.
///
/// # Errors
///
/// Returns [`CoreError::CryptoFailed`] on malformed base64, authentication
/// failure or undecodable plaintext.
pub fn decrypt_value(key: &SecretKey, blob: &str) -> CoreResult<Value> {
    let bytes = BASE64
        .decode(blob.as_bytes())
        .map_err(|_| CoreError::crypto_failed("invalid base64 blob"))?;
    let plaintext = decrypt_bytes(key, &bytes)?;
    serde_json::from_slice(&plaintext)
        .map_err(|_| CoreError::crypto_failed("decrypted payload is not valid JSON"))
}

/// Returns `nbytes` random bytes, hex-encoded (`2 * nbytes` chars).
#[must_use]
pub fn random_id(nbytes: usize) -> String {
    let mut bytes = vec![0u8; nbytes];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generates a fresh table DEK and wraps it under the KEK.
///
/// Returns the DEK itself plus the wrapped base64 blob stored in table
/// metadata.
pub fn generate_dek(kek: &SecretKey) -> CoreResult<(SecretKey, String)> {
    let dek = SecretKey::generate();
    let blob = encrypt_bytes(kek, dek.as_bytes())?;
    Ok((dek, BASE64.encode(blob)))
}

/// Unwraps a table DEK with the KEK.
///
/// # Errors
///
/// Returns [`CoreError::CryptoFailed`] if the KEK does not authenticate the
/// wrapped blob.
pub fn unwrap_dek(kek: &SecretKey, wrapped: &str) -> CoreResult<SecretKey> {
    let blob = BASE64
        .decode(wrapped.as_bytes())
        .map_err(|_| CoreError::crypto_failed("invalid wrapped DEK"))?;
    let mut bytes = decrypt_bytes(kek, &blob)?;
    let key = SecretKey::from_bytes(&bytes);
    bytes.zeroize();
    key
}
