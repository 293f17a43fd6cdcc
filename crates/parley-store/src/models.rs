//! Domain model structs persisted in the instance database.

use chrono::{DateTime, Utc};
use parley_shared::types::{Direction, InstanceStatus, TrustState};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// A peer instance, keyed by its domain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    pub id: i64,
    /// Case-sensitive domain (host, optionally with port). The trust key.
    pub domain: String,
    pub name: Option<String>,
    /// Hex-encoded Ed25519 public key, present once trust begins.
    pub public_key: Option<String>,
    pub trust: TrustState,
    /// Local admin that added the instance, if any.
    pub added_by: Option<i64>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn status(&self) -> InstanceStatus {
        self.trust.status
    }

    pub fn direction(&self) -> Direction {
        self.trust.direction
    }
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A local user, or a shadow of a user living on a peer instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    /// This instance's stable identity for the user.
    pub public_id: String,
    pub handle: String,
    pub name: String,
    pub bio: Option<String>,
    pub banner_color: Option<String>,
    pub avatar_id: Option<i64>,
    pub banner_id: Option<i64>,
    pub is_federated: bool,
    pub federated_instance_id: Option<i64>,
    /// Legacy numeric id on the home instance, string-encoded.
    pub federated_username: Option<String>,
    /// Stable identity on the home instance.
    pub federated_public_id: Option<String>,
    pub profile_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Link from a shadow user to its home instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowLink {
    pub instance_id: i64,
    pub federated_username: Option<String>,
    pub federated_public_id: Option<String>,
}

/// Insert form of [`User`].
#[derive(Debug, Clone)]
pub struct NewUser {
    pub public_id: String,
    pub handle: String,
    pub name: String,
    pub shadow: Option<ShadowLink>,
}

impl NewUser {
    pub fn local(handle: &str, name: &str) -> Self {
        Self {
            public_id: Uuid::new_v4().to_string(),
            handle: handle.to_string(),
            name: name.to_string(),
            shadow: None,
        }
    }

    pub fn shadow(handle: &str, name: &str, link: ShadowLink) -> Self {
        Self {
            public_id: Uuid::new_v4().to_string(),
            handle: handle.to_string(),
            name: name.to_string(),
            shadow: Some(link),
        }
    }
}

// ---------------------------------------------------------------------------
// File
// ---------------------------------------------------------------------------

/// Metadata of a stored file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub id: i64,
    /// Generated name under which the bytes are stored.
    pub name: String,
    /// For federation-sourced files, the name the peer reported.
    pub source_name: Option<String>,
    pub content_type: Option<String>,
    pub size: i64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Key material
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub id: i64,
    pub public_key: String,
    pub secret_key: String,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("id", &self.id)
            .field("public_key", &self.public_key)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Server (room)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Whether peers may discover this room.
    pub federated: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Social graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FriendshipStatus {
    Pending,
    Accepted,
}

impl FriendshipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Friendship {
    pub id: i64,
    pub requester_id: i64,
    pub addressee_id: i64,
    pub status: FriendshipStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A one-to-one conversation. `user_a < user_b` always holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DmChannel {
    pub id: i64,
    pub user_a: i64,
    pub user_b: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectMessage {
    pub id: Uuid,
    pub channel_id: i64,
    pub author_id: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// An abuse report received from a peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Report {
    pub id: i64,
    pub from_domain: String,
    pub reporter_public_id: Option<String>,
    pub reported_user_id: i64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}
