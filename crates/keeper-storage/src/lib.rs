//! Encrypted local persistence: key derivation, envelopes, the file-backed
//! cache, sessions with lockout, the audit trail and backups.

pub mod audit;
pub mod backup;
pub mod envelope;
pub mod file_cache;
pub mod kdf;
pub mod secure_store;
pub mod session;

pub use backup::{BackupConfig, BackupService, BackupTrigger};
pub use envelope::{EncryptedStore, EncryptionEngine, Envelope, StoreContents};
pub use file_cache::FileCache;
pub use secure_store::{SecureStore, SecurityConfig, StoreError};
