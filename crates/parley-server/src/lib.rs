//! # parley-server
//!
//! Federation service for a Parley chat instance.
//!
//! It provides:
//! - **Instance trust**: a signed, reverse-verified handshake between peer
//!   domains, with local approval and blocking
//! - **Identity**: an Ed25519 instance key, short-lived challenges and
//!   audience-bound bearer tokens for remote users
//! - **Shadow users**: local records for remote users, kept in sync with
//!   their home instance
//! - **Relays**: signed friend actions, direct messages and reports between
//!   instances
//! - **REST API** (axum) for peers, plus an admin API for the local backend

pub mod api;
pub mod config;
pub mod cors;
pub mod error;
pub mod events;
pub mod federation;
pub mod file_store;
pub mod ssrf;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;
