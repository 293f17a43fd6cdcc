//! Instance-to-instance trust, identity and relays.

pub mod admin;
pub mod handlers;
pub mod keys;
pub mod registry;
pub mod relay;
pub mod resolver;
pub mod tokens;
