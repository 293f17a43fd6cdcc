//! # parley-shared
//!
//! Types shared by every Parley crate: the instance keypair, the compact
//! signed-token codec used for challenges and bearer tokens, the trust-state
//! enums, and the JSON payloads exchanged between federated instances.

pub mod constants;
pub mod error;
pub mod keys;
pub mod protocol;
pub mod token;
pub mod types;
