//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use parley_shared::constants::{APP_NAME, MAX_FEDERATION_BODY};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Public domain of this instance (host, optionally with port). Used as
    /// token issuer and expected audience.
    /// Env: `FEDERATION_DOMAIN`
    /// Default: `localhost:8080`
    pub domain: String,

    /// Human-readable name advertised to peers.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Parley Node"`
    pub instance_name: String,

    /// Env: `DATABASE_PATH`
    /// Default: `./parley.db`
    pub database_path: PathBuf,

    /// Directory holding stored files (avatars, banners).
    /// Env: `FILE_STORAGE_PATH`
    /// Default: `./files`
    pub file_storage_path: PathBuf,

    /// Maximum stored file size in bytes, including downloads from peers.
    /// Env: `MAX_FILE_SIZE`
    /// Default: 10 MiB
    pub max_file_size: usize,

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Maximum accepted body on federation endpoints.
    /// Env: `FEDERATION_BODY_LIMIT`
    pub body_limit: usize,

    /// Total timeout of every outbound call to a peer.
    /// Env: `HTTP_TIMEOUT_SECS`
    pub http_timeout: Duration,

    /// Env: `HTTP_CONNECT_TIMEOUT_SECS`
    pub http_connect_timeout: Duration,

    /// Minimum time between two profile syncs of one shadow user.
    /// Env: `PROFILE_SYNC_DEBOUNCE_SECS`
    pub profile_sync_debounce: Duration,

    /// Delay before the single retry of an accept notice.
    /// Env: `ACCEPT_RETRY_DELAY_SECS`
    pub accept_retry_delay: Duration,

    /// Skip the private-address check on outbound downloads. Development
    /// and tests only.
    /// Env: `ALLOW_PRIVATE_FETCH` (true/false)
    pub allow_private_fetch: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            domain: "localhost:8080".to_string(),
            instance_name: format!("{APP_NAME} Node"),
            database_path: PathBuf::from("./parley.db"),
            file_storage_path: PathBuf::from("./files"),
            max_file_size: 10 * 1024 * 1024, // 10 MiB
            admin_token: None,
            body_limit: MAX_FEDERATION_BODY,
            http_timeout: Duration::from_secs(10),
            http_connect_timeout: Duration::from_secs(5),
            profile_sync_debounce: Duration::from_secs(5 * 60),
            accept_retry_delay: Duration::from_secs(5),
            allow_private_fetch: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        parse_into(&lookup, "HTTP_ADDR", &mut config.http_addr);

        if let Some(domain) = lookup("FEDERATION_DOMAIN") {
            let domain = domain.trim().trim_end_matches('/').to_string();
            if domain.is_empty() || domain.contains('/') {
                tracing::warn!(value = %domain, "Invalid FEDERATION_DOMAIN, using default");
            } else {
                config.domain = domain;
            }
        }

        if let Some(name) = lookup("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(path) = lookup("FILE_STORAGE_PATH") {
            config.file_storage_path = PathBuf::from(path);
        }

        parse_into(&lookup, "MAX_FILE_SIZE", &mut config.max_file_size);

        if let Some(token) = lookup("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        parse_into(&lookup, "FEDERATION_BODY_LIMIT", &mut config.body_limit);
        parse_secs_into(&lookup, "HTTP_TIMEOUT_SECS", &mut config.http_timeout);
        parse_secs_into(
            &lookup,
            "HTTP_CONNECT_TIMEOUT_SECS",
            &mut config.http_connect_timeout,
        );
        parse_secs_into(
            &lookup,
            "PROFILE_SYNC_DEBOUNCE_SECS",
            &mut config.profile_sync_debounce,
        );
        parse_secs_into(
            &lookup,
            "ACCEPT_RETRY_DELAY_SECS",
            &mut config.accept_retry_delay,
        );

        if let Some(val) = lookup("ALLOW_PRIVATE_FETCH") {
            config.allow_private_fetch = val == "true" || val == "1";
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_into<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(key, value = %raw, "Invalid value, using default"),
        }
    }
}

fn parse_secs_into<F>(lookup: &F, key: &str, slot: &mut Duration)
where
    F: Fn(&str) -> Option<String>,
{
    let mut secs = slot.as_secs();
    parse_into(lookup, key, &mut secs);
    *slot = Duration::from_secs(secs);
}
