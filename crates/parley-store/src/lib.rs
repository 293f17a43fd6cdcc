//! # parley-store
//!
//! SQLite storage for a Parley instance.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for every record the
//! federation subsystem touches: peer instances, local and shadow users,
//! stored files, the instance keypair, settings, and the friend / DM / report
//! records that relays create.

pub mod database;
pub mod files;
pub mod instances;
pub mod keys;
pub mod migrations;
pub mod models;
pub mod servers;
pub mod settings;
pub mod social;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
