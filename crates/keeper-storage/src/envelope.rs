//! Versioned, self-contained encryption envelopes.
//!
//! Every payload is serialized to JSON and sealed with AES-256-GCM under a key
//! derived from the password and a fresh salt. Salt and IV are generated per
//! call, so no two envelopes share key material even for identical inputs.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use keeper_core::records::{Doctor, Patient};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::kdf::{self, CryptoError, DEFAULT_ITERATIONS, DEFAULT_SALT_LEN, IV_LEN, MAX_ITERATIONS};

/// Algorithm tag written into every envelope.
pub const ALGORITHM: &str = "AES-GCM";
/// Format version of the at-rest store document.
pub const STORE_VERSION: &str = "1.0";

/// Encrypted representation of one payload. Binary fields are base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    ciphertext: String,
    iv: String,
    salt: String,
    algorithm: String,
    /// Only present when the envelope was sealed with a non-default round count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iterations: Option<u32>,
}

impl Envelope {
    pub fn ciphertext(&self) -> &str {
        &self.ciphertext
    }

    pub fn iv(&self) -> &str {
        &self.iv
    }

    pub fn salt(&self) -> &str {
        &self.salt
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn iterations(&self) -> u32 {
        self.iterations.unwrap_or(DEFAULT_ITERATIONS)
    }

    pub fn to_json(&self) -> Result<String, CryptoError> {
        serde_json::to_string(self).map_err(|e| CryptoError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, CryptoError> {
        let envelope: Envelope =
            serde_json::from_str(json).map_err(|e| CryptoError::Malformed(e.to_string()))?;
        envelope.validate_shape()?;
        Ok(envelope)
    }

    /// Structural validation without a password: tag, encodings and lengths.
    pub fn validate_shape(&self) -> Result<(), CryptoError> {
        if self.algorithm != ALGORITHM {
            return Err(CryptoError::Malformed(format!(
                "unsupported algorithm {:?}",
                self.algorithm
            )));
        }
        match self.iterations {
            Some(0) => {
                return Err(CryptoError::Malformed("iteration count is zero".to_string()));
            }
            Some(n) if n > MAX_ITERATIONS => {
                return Err(CryptoError::Malformed(format!(
                    "iteration count {n} exceeds {MAX_ITERATIONS}"
                )));
            }
            _ => {}
        }
        let iv = decode_field("iv", &self.iv)?;
        if iv.len() != IV_LEN {
            return Err(CryptoError::Malformed(format!(
                "iv must be {IV_LEN} bytes, got {}",
                iv.len()
            )));
        }
        if decode_field("salt", &self.salt)?.is_empty() {
            return Err(CryptoError::Malformed("salt is empty".to_string()));
        }
        if decode_field("ciphertext", &self.ciphertext)?.is_empty() {
            return Err(CryptoError::Malformed("ciphertext is empty".to_string()));
        }
        Ok(())
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD
        .decode(value)
        .map_err(|e| CryptoError::Malformed(format!("{name} is not base64: {e}")))
}

/// The persisted at-rest representation of both collections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedStore {
    /// Stringified patients envelope.
    patients: String,
    /// Stringified doctors envelope.
    doctors: String,
    /// Epoch milliseconds of the save that produced this store.
    timestamp: i64,
    version: String,
}

impl EncryptedStore {
    pub fn new(patients: &Envelope, doctors: &Envelope) -> Result<Self, CryptoError> {
        Ok(Self {
            patients: patients.to_json()?,
            doctors: doctors.to_json()?,
            timestamp: Utc::now().timestamp_millis(),
            version: STORE_VERSION.to_string(),
        })
    }

    pub(crate) fn from_parts(patients: String, doctors: String, timestamp: i64, version: String) -> Self {
        Self {
            patients,
            doctors,
            timestamp,
            version,
        }
    }

    pub fn patients_json(&self) -> &str {
        &self.patients
    }

    pub fn doctors_json(&self) -> &str {
        &self.doctors
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn patients_envelope(&self) -> Result<Envelope, CryptoError> {
        Envelope::from_json(&self.patients)
    }

    pub fn doctors_envelope(&self) -> Result<Envelope, CryptoError> {
        Envelope::from_json(&self.doctors)
    }
}

/// Plaintext contents of a store or backup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreContents {
    pub patients: Vec<Patient>,
    pub doctors: Vec<Doctor>,
}

/// Per-call encryption parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptOptions {
    pub iterations: u32,
    pub salt_len: usize,
}

impl Default for EncryptOptions {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
            salt_len: DEFAULT_SALT_LEN,
        }
    }
}

/// Encrypts/decrypts JSON-serializable payloads into versioned envelopes.
#[derive(Debug, Clone, Default)]
pub struct EncryptionEngine {
    options: EncryptOptions,
}

impl EncryptionEngine {
    pub fn new(options: EncryptOptions) -> Self {
        Self { options }
    }

    pub fn with_iterations(iterations: u32) -> Self {
        Self::new(EncryptOptions {
            iterations: iterations.min(MAX_ITERATIONS),
            ..EncryptOptions::default()
        })
    }

    pub fn options(&self) -> EncryptOptions {
        self.options
    }

    pub fn encrypt<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        password: &str,
    ) -> Result<Envelope, CryptoError> {
        self.encrypt_with(payload, password, self.options)
    }

    pub fn encrypt_with<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        password: &str,
        options: EncryptOptions,
    ) -> Result<Envelope, CryptoError> {
        let plaintext = Zeroizing::new(
            serde_json::to_vec(payload).map_err(|e| CryptoError::Serialization(e.to_string()))?,
        );
        let salt = kdf::generate_salt(options.salt_len)?;
        let iv = kdf::generate_iv(IV_LEN)?;
        let key = kdf::derive_key(password, &salt, options.iterations)?;

        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::Configuration(format!("cipher init failed: {e}")))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_slice())
            .map_err(|e| CryptoError::Configuration(format!("encrypt failed: {e}")))?;

        Ok(Envelope {
            ciphertext: STANDARD.encode(ciphertext),
            iv: STANDARD.encode(&iv),
            salt: STANDARD.encode(&salt),
            algorithm: ALGORITHM.to_string(),
            iterations: (options.iterations != DEFAULT_ITERATIONS).then_some(options.iterations),
        })
    }

    /// Fails with `Authentication` on a wrong password or a malformed envelope.
    pub fn decrypt<T: DeserializeOwned>(
        &self,
        envelope: &Envelope,
        password: &str,
    ) -> Result<T, CryptoError> {
        let plaintext = self.open(envelope, password)?;
        // serde_json messages quote the offending input; keep only its position
        serde_json::from_slice(&plaintext).map_err(|e| {
            CryptoError::Serialization(format!(
                "decrypted payload has an unexpected shape ({:?} error at line {} column {})",
                e.classify(),
                e.line(),
                e.column()
            ))
        })
    }

    fn open(&self, envelope: &Envelope, password: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        envelope
            .validate_shape()
            .map_err(|_| CryptoError::Authentication)?;
        let salt = STANDARD
            .decode(&envelope.salt)
            .map_err(|_| CryptoError::Authentication)?;
        let iv = STANDARD
            .decode(&envelope.iv)
            .map_err(|_| CryptoError::Authentication)?;
        let ciphertext = STANDARD
            .decode(&envelope.ciphertext)
            .map_err(|_| CryptoError::Authentication)?;

        let key = kdf::derive_key(password, &salt, envelope.iterations())?;
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::Configuration(format!("cipher init failed: {e}")))?;
        cipher
            .decrypt(Nonce::from_slice(&iv), ciphertext.as_ref())
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::Authentication)
    }

    /// Seal both collections as two independent envelopes under one password.
    pub fn encrypt_store(
        &self,
        contents: &StoreContents,
        password: &str,
    ) -> Result<EncryptedStore, CryptoError> {
        let patients = self.encrypt(&contents.patients, password)?;
        let doctors = self.encrypt(&contents.doctors, password)?;
        EncryptedStore::new(&patients, &doctors)
    }

    pub fn decrypt_store(
        &self,
        store: &EncryptedStore,
        password: &str,
    ) -> Result<StoreContents, CryptoError> {
        let patients_envelope = store
            .patients_envelope()
            .map_err(|_| CryptoError::Authentication)?;
        let doctors_envelope = store
            .doctors_envelope()
            .map_err(|_| CryptoError::Authentication)?;
        Ok(StoreContents {
            patients: self.decrypt(&patients_envelope, password)?,
            doctors: self.decrypt(&doctors_envelope, password)?,
        })
    }

    /// Re-seal `store` under `new_password`. The input is never modified; on a
    /// wrong `old_password` nothing new is produced.
    pub fn change_password(
        &self,
        store: &EncryptedStore,
        old_password: &str,
        new_password: &str,
    ) -> Result<EncryptedStore, CryptoError> {
        let contents = self.decrypt_store(store, old_password)?;
        self.encrypt_store(&contents, new_password)
    }

    /// True when either collection envelope opens with `password`. Never errors.
    pub fn verify_password(&self, store: &EncryptedStore, password: &str) -> bool {
        [store.patients_envelope(), store.doctors_envelope()]
            .into_iter()
            .flatten()
            .any(|envelope| self.open(&envelope, password).is_ok())
    }
}
