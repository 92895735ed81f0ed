//! Core abstractions for Health Keeper: household health records and the
//! persistent cache contract shared by the encrypted store and the sync queue.
//! This crate is intentionally small to keep dependency surface minimal.

pub mod cache;
pub mod records;
