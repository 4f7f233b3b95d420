//! Space requests and their status graph.
//!
//! A request walks a single forward path `pending -> approved -> active ->
//! completed`, with an early exit from `pending` to either `rejected` (owner
//! declines) or `cancelled` (requester withdraws). Nothing ever moves backwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::access::Role;

/// Sender identity used for machine-generated notices.
///
/// Human identities come from the external auth layer and are never allowed
/// to take this value.
pub const SYSTEM_SENDER: &str = "plotshare:system";

/// Identity of a person, as asserted by the external auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// The reserved identity that system notices are posted under.
    pub fn system() -> Self {
        Self(SYSTEM_SENDER.to_string())
    }

    /// True for the system identity (and anything in its namespace).
    pub fn is_reserved(&self) -> bool {
        self.0.starts_with("plotshare:")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

uuid_id!(
    /// Identifier of a space request.
    RequestId
);
uuid_id!(
    /// Identifier of a space (the shared plot).
    SpaceId
);

/// Lifecycle status of a space request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Initial state: the requester has asked, the owner has not answered.
    Pending,
    /// The owner accepted; the requester may start occupying.
    Approved,
    /// The requester occupies the space. At most one per space.
    Active,
    /// Occupancy is over. Terminal.
    Completed,
    /// The owner declined a pending request. Terminal.
    Rejected,
    /// The requester withdrew a pending request. Terminal.
    Cancelled,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 6] = [
        RequestStatus::Pending,
        RequestStatus::Approved,
        RequestStatus::Active,
        RequestStatus::Completed,
        RequestStatus::Rejected,
        RequestStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    /// Statuses reachable from `self` in one step.
    pub fn successors(self) -> &'static [RequestStatus] {
        match self {
            Self::Pending => &[Self::Approved, Self::Rejected, Self::Cancelled],
            Self::Approved => &[Self::Active],
            Self::Active => &[Self::Completed],
            Self::Completed | Self::Rejected | Self::Cancelled => &[],
        }
    }

    pub fn can_advance_to(self, target: RequestStatus) -> bool {
        self.successors().contains(&target)
    }

    pub fn is_terminal(self) -> bool {
        self.successors().is_empty()
    }

    /// `pending`, `approved` or `active`: the request still holds its
    /// (space, gardener) slot.
    pub fn is_open(self) -> bool {
        !self.is_terminal()
    }

    /// Position along the forward path. Every successor has a strictly
    /// greater depth than its predecessor.
    pub fn depth(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Approved | Self::Rejected | Self::Cancelled => 1,
            Self::Active => 2,
            Self::Completed => 3,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a [`RequestStatus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown request status '{}'", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for RequestStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// A shared plot. Only the fields the request lifecycle needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub id: SpaceId,
    pub owner_id: UserId,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// A negotiated occupancy of a space by a requester ("gardener").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceRequest {
    pub id: RequestId,
    pub space_id: SpaceId,
    pub gardener_id: UserId,
    /// Owner of the space, resolved when the request was created.
    pub owner_id: UserId,
    pub status: RequestStatus,
    /// Free-text note attached at creation. Not part of the chat log.
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set on entry to `active`.
    pub started_at: Option<DateTime<Utc>>,
    /// Set on entry to `completed`.
    pub finished_at: Option<DateTime<Utc>>,
}

impl SpaceRequest {
    /// Role that `user` holds on this request, if any.
    pub fn role_of(&self, user: &UserId) -> Option<Role> {
        if user.is_reserved() {
            None
        } else if *user == self.owner_id {
            Some(Role::Owner)
        } else if *user == self.gardener_id {
            Some(Role::Requester)
        } else {
            None
        }
    }

    /// A copy of this request after entering `status` at `at`.
    ///
    /// Only the timestamp belonging to the entered status is touched.
    pub fn advanced(&self, status: RequestStatus, at: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.status = status;
        match status {
            RequestStatus::Active => next.started_at = Some(at),
            RequestStatus::Completed => next.finished_at = Some(at),
            _ => {}
        }
        next
    }
}
