use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

/// PBKDF2 rounds used when the caller does not configure a count.
pub const DEFAULT_ITERATIONS: u32 = 100_000;
/// Upper bound accepted from stored or imported envelopes.
pub const MAX_ITERATIONS: u32 = 10_000_000;
/// Salt length in bytes for fresh envelopes.
pub const DEFAULT_SALT_LEN: usize = 16;
/// AES-GCM nonce length in bytes.
pub const IV_LEN: usize = 12;
/// 256-bit symmetric key.
pub const KEY_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Cryptographic primitives cannot be used with the given parameters.
    #[error("crypto configuration error: {0}")]
    Configuration(String),
    /// Wrong password, tampered ciphertext or malformed envelope.
    #[error("authentication failed: wrong password or corrupted data")]
    Authentication,
    /// Envelope does not have the expected structure.
    #[error("malformed envelope: {0}")]
    Malformed(String),
    /// Payload could not be (de)serialized.
    #[error("payload serialization failed: {0}")]
    Serialization(String),
}

/// Key material derived from a password. Wiped from memory when dropped.
pub struct DerivedKey {
    bytes: Zeroizing<[u8; KEY_LEN]>,
}

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &*self.bytes
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never log key bytes
        f.write_str("DerivedKey(..)")
    }
}

/// Cryptographically secure random salt.
pub fn generate_salt(len: usize) -> Result<Vec<u8>, CryptoError> {
    random_bytes(len)
}

/// Cryptographically secure random IV.
pub fn generate_iv(len: usize) -> Result<Vec<u8>, CryptoError> {
    random_bytes(len)
}

fn random_bytes(len: usize) -> Result<Vec<u8>, CryptoError> {
    if len == 0 {
        return Err(CryptoError::Configuration(
            "random length must be non-zero".to_string(),
        ));
    }
    let mut bytes = vec![0u8; len];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CryptoError::Configuration(format!("os rng unavailable: {e}")))?;
    Ok(bytes)
}

/// PBKDF2-HMAC-SHA-256. Same `(password, salt, iterations)` always yields the same key.
pub fn derive_key(password: &str, salt: &[u8], iterations: u32) -> Result<DerivedKey, CryptoError> {
    if iterations == 0 {
        return Err(CryptoError::Configuration(
            "iteration count must be non-zero".to_string(),
        ));
    }
    if salt.is_empty() {
        return Err(CryptoError::Configuration("salt must not be empty".to_string()));
    }

    let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut bytes[..]);
    Ok(DerivedKey { bytes })
}
