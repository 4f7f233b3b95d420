//! Repository abstraction for spaces, requests and chat messages.
//!
//! This module defines the `SpaceRepository` trait the lifecycle manager and
//! the chat channel persist through. Implementations can provide different
//! backends (in-memory, SQLite).
//!
//! Two invariants are enforced at this layer as well as above it, so that a
//! racing writer can never commit a violation:
//! - at most one `active` request per space
//! - at most one open (`pending | approved | active`) request per (space, gardener)

mod memory;
mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use plotshare_core::{
    ChatMessage, MessageKind, RequestId, RequestStatus, Space, SpaceId, SpaceRequest, UserId,
};
use thiserror::Error;

/// Why a conditional write was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// The request was no longer in the expected status.
    StatusChanged {
        expected: RequestStatus,
        actual: RequestStatus,
    },
    /// Another request on the same space is already `active`.
    SpaceOccupied,
    /// The gardener already holds an open request on this space.
    OpenRequestExists,
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage failure during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    #[error("corrupt {what} in storage")]
    Corruption { what: &'static str },

    #[error("{what} not found")]
    NotFound { what: &'static str },

    #[error("write conflict: {0:?}")]
    Conflict(Conflict),
}

impl RepositoryError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
        }
    }

    pub fn corruption(what: &'static str) -> Self {
        Self::Corruption { what }
    }
}

/// Timestamps are kept to the millisecond in every backend.
pub fn truncate_to_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(3)
}

/// The current time at storage precision.
pub fn timestamp_now() -> DateTime<Utc> {
    truncate_to_millis(Utc::now())
}

/// Fields supplied when a request is created; the store assigns the rest.
#[derive(Debug, Clone)]
pub struct NewSpaceRequest {
    pub space_id: SpaceId,
    pub gardener_id: UserId,
    pub owner_id: UserId,
    pub message: Option<String>,
}

/// A status write that only applies if the request is still in `expected`.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub request_id: RequestId,
    pub expected: RequestStatus,
    pub status: RequestStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    /// Build the write that turns the stored `expected` record into `next`.
    pub fn to(next: &SpaceRequest, expected: RequestStatus) -> Self {
        Self {
            request_id: next.id,
            expected,
            status: next.status,
            started_at: next.started_at,
            finished_at: next.finished_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewChatMessage {
    pub request_id: RequestId,
    pub sender_id: UserId,
    pub body: String,
    pub kind: MessageKind,
}

/// Persistence gateway for the request lifecycle and its chat log.
#[async_trait]
pub trait SpaceRepository: Send + Sync {
    /// Store a space (upsert semantics) and return it as stored. An update
    /// keeps the original `created_at`.
    async fn put_space(&self, space: Space) -> Result<Space, RepositoryError>;

    async fn get_space(&self, id: &SpaceId) -> Result<Option<Space>, RepositoryError>;

    /// Spaces owned by `owner`, oldest first.
    async fn list_spaces_for_owner(&self, owner: &UserId) -> Result<Vec<Space>, RepositoryError>;

    async fn get_request(&self, id: &RequestId) -> Result<Option<SpaceRequest>, RepositoryError>;

    /// Insert a new `pending` request.
    ///
    /// Fails with `Conflict::OpenRequestExists` if the gardener already holds
    /// an open request on the space.
    async fn create_request(&self, new: NewSpaceRequest) -> Result<SpaceRequest, RepositoryError>;

    /// Conditionally write a new status and its timestamps.
    ///
    /// Fails with `Conflict::StatusChanged` if the stored status is no longer
    /// `update.expected`, and with `Conflict::SpaceOccupied` if the write would
    /// leave two active requests on one space.
    async fn update_status(&self, update: StatusUpdate) -> Result<SpaceRequest, RepositoryError>;

    /// Number of requests for `space_id` currently in `active`. Always read
    /// from committed state.
    async fn count_active_for_space(&self, space_id: &SpaceId) -> Result<usize, RepositoryError>;

    async fn count_pending_for_space(&self, space_id: &SpaceId) -> Result<usize, RepositoryError>;

    /// Requests made by `gardener`, newest first.
    async fn list_requests_for_gardener(
        &self,
        gardener: &UserId,
    ) -> Result<Vec<SpaceRequest>, RepositoryError>;

    /// Requests made on `space_id`, newest first.
    async fn list_requests_for_space(
        &self,
        space_id: &SpaceId,
    ) -> Result<Vec<SpaceRequest>, RepositoryError>;

    /// Append a message to a request's log.
    ///
    /// `created_at` is never earlier than the previous message on the same
    /// request, and `seq` increases with every append.
    async fn append_message(&self, new: NewChatMessage) -> Result<ChatMessage, RepositoryError>;

    /// All messages for a request, ordered by `(created_at, seq)`.
    async fn list_messages(&self, request_id: &RequestId)
        -> Result<Vec<ChatMessage>, RepositoryError>;
}
