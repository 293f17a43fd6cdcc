/// Version string advertised by `GET /federation/info`
pub const PROTOCOL_VERSION: &str = "parley-federation/1";

/// Application name
pub const APP_NAME: &str = "Parley";

/// Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Ed25519 secret key size in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Bearer tokens are valid for 24 hours
pub const BEARER_TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

/// Challenges only prove key possession, so they live for 5 minutes
pub const CHALLENGE_TTL_SECS: i64 = 5 * 60;

/// Allowed clock skew when checking `iat`
pub const TOKEN_CLOCK_LEEWAY_SECS: i64 = 60;

/// Prefix for locally stored files that were downloaded from a peer
pub const FEDERATED_FILE_PREFIX: &str = "fed_";

/// Default maximum federation request body (256 KiB)
pub const MAX_FEDERATION_BODY: usize = 256 * 1024;

/// Key derivation context for synthetic shadow-user handles (BLAKE3)
pub const KDF_CONTEXT_SHADOW_HANDLE: &str = "parley-shadow-handle-v1";

/// Pub/sub topic carrying instance trust changes
pub const TOPIC_INSTANCES: &str = "federation:instances";
