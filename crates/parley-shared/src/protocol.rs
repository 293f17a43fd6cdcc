//! JSON payloads exchanged between federated instances.
//!
//! Relay payloads are sent inside a signed envelope: the sender serialises
//! the payload, signs it as a challenge, then adds `fromDomain` and
//! `signature` next to the payload fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Direction, InstanceStatus};

/// HTTP paths of the federation surface.
pub mod paths {
    pub const INFO: &str = "/federation/info";
    pub const REQUEST: &str = "/federation/request";
    pub const ACCEPT: &str = "/federation/accept";
    pub const SERVERS: &str = "/federation/servers";
    pub const USER_INFO: &str = "/federation/user-info";
    pub const FRIEND_REQUEST: &str = "/federation/friend-request";
    pub const FRIEND_ACCEPT: &str = "/federation/friend-accept";
    pub const FRIEND_REMOVE: &str = "/federation/friend-remove";
    pub const DM_RELAY: &str = "/federation/dm-relay";
    pub const REPORT_USER: &str = "/federation/report-user";
    pub const AUTH: &str = "/federation/auth";
    pub const FILES: &str = "/files";
}

/// Envelope field naming the sending instance.
pub const FROM_DOMAIN_FIELD: &str = "fromDomain";

/// Envelope field carrying the challenge signature.
pub const SIGNATURE_FIELD: &str = "signature";

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    pub domain: String,
    pub name: String,
    pub version: String,
    pub public_key: Option<String>,
    pub federation_enabled: bool,
}

/// Body of `POST /federation/request`. Every field is required; they are
/// optional here so a missing one maps to 400 rather than a decode error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub domain: Option<String>,
    pub name: Option<String>,
    pub public_key: Option<String>,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub success: bool,
    pub status: InstanceStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptRequest {
    pub domain: Option<String>,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

impl SuccessResponse {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

/// An instance as shown to local administrators. Key material is omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub domain: String,
    pub name: Option<String>,
    pub status: InstanceStatus,
    pub direction: Direction,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Discovery and profiles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederatedServer {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServersResponse {
    pub servers: Vec<FederatedServer>,
}

/// Looks a user up by public id, or by legacy numeric id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfoRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
}

/// Public profile of a local user. `avatar` and `banner` are file names
/// served under `/files/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfoResponse {
    pub id: i64,
    pub public_id: String,
    pub name: String,
    pub bio: Option<String>,
    pub banner_color: Option<String>,
    pub avatar: Option<String>,
    pub banner: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Relays
// ---------------------------------------------------------------------------

/// Friend-graph action: request, accept, or remove.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendActionPayload {
    pub sender_public_id: Option<String>,
    /// Sender's numeric id on its home instance (`0` when unknown).
    #[serde(default)]
    pub sender_id: i64,
    #[serde(default)]
    pub sender_name: String,
    pub receiver_public_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DmRelayPayload {
    pub sender_public_id: Option<String>,
    #[serde(default)]
    pub sender_id: i64,
    #[serde(default)]
    pub sender_name: String,
    pub receiver_public_id: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPayload {
    pub reporter_public_id: Option<String>,
    pub reported_public_id: Option<String>,
    #[serde(default)]
    pub reason: String,
}

/// Answer to a bearer-token exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthExchangeResponse {
    pub user_id: i64,
    pub public_id: String,
    pub handle: String,
}
