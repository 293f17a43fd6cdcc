use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Trust status of a peer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Active,
    Blocked,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Blocked => "blocked",
        }
    }
}

/// Who initiated trust with a peer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// The peer contacted us first.
    Incoming,
    /// We contacted the peer first.
    Outgoing,
    /// Both sides have confirmed.
    Mutual,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
            Self::Mutual => "mutual",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrustStateError {
    #[error("unknown instance status: {0}")]
    UnknownStatus(String),

    #[error("unknown direction: {0}")]
    UnknownDirection(String),

    #[error("a pending instance cannot be mutual")]
    PendingMutual,
}

impl FromStr for InstanceStatus {
    type Err = TrustStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "blocked" => Ok(Self::Blocked),
            other => Err(TrustStateError::UnknownStatus(other.to_string())),
        }
    }
}

impl FromStr for Direction {
    type Err = TrustStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incoming" => Ok(Self::Incoming),
            "outgoing" => Ok(Self::Outgoing),
            "mutual" => Ok(Self::Mutual),
            other => Err(TrustStateError::UnknownDirection(other.to_string())),
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated `(status, direction)` pair.
///
/// `Blocked` keeps whatever direction it had before the block; `Pending`
/// is only ever `Incoming` or `Outgoing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrustState {
    pub status: InstanceStatus,
    pub direction: Direction,
}

impl TrustState {
    pub const PENDING_INCOMING: Self = Self {
        status: InstanceStatus::Pending,
        direction: Direction::Incoming,
    };

    pub const PENDING_OUTGOING: Self = Self {
        status: InstanceStatus::Pending,
        direction: Direction::Outgoing,
    };

    pub const ACTIVE_MUTUAL: Self = Self {
        status: InstanceStatus::Active,
        direction: Direction::Mutual,
    };

    pub fn new(status: InstanceStatus, direction: Direction) -> Result<Self, TrustStateError> {
        if status == InstanceStatus::Pending && direction == Direction::Mutual {
            return Err(TrustStateError::PendingMutual);
        }
        Ok(Self { status, direction })
    }

    pub fn parse(status: &str, direction: &str) -> Result<Self, TrustStateError> {
        Self::new(status.parse()?, direction.parse()?)
    }

    /// The same direction, blocked.
    pub fn blocked(self) -> Self {
        Self {
            status: InstanceStatus::Blocked,
            direction: self.direction,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.status == InstanceStatus::Blocked
    }

    pub fn is_active(&self) -> bool {
        self.status == InstanceStatus::Active
    }

    /// An approval we have not made ourselves yet.
    pub fn awaits_local_approval(&self) -> bool {
        *self == Self::PENDING_INCOMING
    }
}
