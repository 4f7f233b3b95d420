//! Chat messages bound to a space request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::request::{RequestId, RequestStatus, UserId};

uuid_id!(
    /// Identifier of a chat message.
    MessageId
);

/// Whether a message was typed by a person or generated by a transition.
///
/// Stored explicitly on every record, so a person typing a notice phrase
/// still produces a `Human` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Human,
    System,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "human" => Some(Self::Human),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// The fixed notices a lifecycle transition can post into the chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    OccupancyStarted,
    OccupancyCompleted,
}

impl NoticeKind {
    /// The reserved literal body of this notice.
    pub const fn body(self) -> &'static str {
        match self {
            Self::OccupancyStarted => "🌱 Occupancy of the space has officially started",
            Self::OccupancyCompleted => "🏁 The project is complete and the space has been handed back",
        }
    }

    /// Notice owed for entering `status`, if any.
    ///
    /// Only the occupancy transitions produce one.
    pub fn for_status(status: RequestStatus) -> Option<Self> {
        match status {
            RequestStatus::Active => Some(Self::OccupancyStarted),
            RequestStatus::Completed => Some(Self::OccupancyCompleted),
            _ => None,
        }
    }

    pub fn from_body(body: &str) -> Option<Self> {
        [Self::OccupancyStarted, Self::OccupancyCompleted]
            .into_iter()
            .find(|kind| kind.body() == body)
    }
}

/// An immutable entry in a request's chat log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub request_id: RequestId,
    pub sender_id: UserId,
    pub body: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    /// Storage insertion sequence, the tiebreak after `created_at`.
    pub seq: i64,
}

impl ChatMessage {
    pub fn is_system(&self) -> bool {
        self.kind == MessageKind::System
    }

    /// The notice this message carries. Human messages never carry one,
    /// whatever their body says.
    pub fn notice(&self) -> Option<NoticeKind> {
        if self.is_system() {
            NoticeKind::from_body(&self.body)
        } else {
            None
        }
    }

    /// Delivery order key.
    pub fn order_key(&self) -> (DateTime<Utc>, i64) {
        (self.created_at, self.seq)
    }
}
