//! Error types surfaced by the lifecycle manager, the chat channel and the
//! service facade.
//!
//! Every failure a caller can see maps onto one [`ErrorKind`], and every kind
//! has a short user-facing message. Raw storage errors never reach a caller
//! untranslated.

use plotshare_core::{RequestId, RequestStatus, SpaceId};
use serde::Serialize;
use thiserror::Error;

use crate::repository::RepositoryError;

/// The failure taxonomy shown to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthorized,
    InvalidTransition,
    SpaceOccupied,
    DuplicateRequest,
    EmptyMessage,
    /// A malformed or blank field other than a chat message body.
    InvalidInput,
    NotFound,
    PersistenceFailure,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::InvalidTransition => "invalid_transition",
            Self::SpaceOccupied => "space_occupied",
            Self::DuplicateRequest => "duplicate_request",
            Self::EmptyMessage => "empty_message",
            Self::InvalidInput => "invalid_input",
            Self::NotFound => "not_found",
            Self::PersistenceFailure => "persistence_failure",
        }
    }

    pub fn user_message(self) -> &'static str {
        match self {
            Self::Unauthorized => "not allowed",
            Self::InvalidTransition => "invalid status change",
            Self::SpaceOccupied => "already occupied",
            Self::DuplicateRequest => "you already have an open request for this space",
            Self::EmptyMessage => "cannot be empty",
            Self::InvalidInput => "invalid input",
            Self::NotFound => "not found",
            Self::PersistenceFailure => "storage unavailable, try again later",
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("actor is not allowed to perform this action")]
    Unauthorized,

    #[error("cannot move request from {from} to {to}")]
    InvalidTransition {
        from: RequestStatus,
        to: RequestStatus,
    },

    #[error("space {space_id} already has an active request")]
    SpaceOccupied { space_id: SpaceId },

    #[error("request {request_id} not found")]
    NotFound { request_id: RequestId },

    #[error("space {space_id} not found")]
    UnknownSpace { space_id: SpaceId },

    #[error("an open request already exists for this space and gardener")]
    DuplicateRequest,

    #[error("space title is empty")]
    EmptyTitle,

    #[error(transparent)]
    Persistence(#[from] RepositoryError),
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::SpaceOccupied { .. } => ErrorKind::SpaceOccupied,
            Self::NotFound { .. } | Self::UnknownSpace { .. } => ErrorKind::NotFound,
            Self::DuplicateRequest => ErrorKind::DuplicateRequest,
            Self::EmptyTitle => ErrorKind::InvalidInput,
            Self::Persistence(_) => ErrorKind::PersistenceFailure,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("actor may not use this channel")]
    Unauthorized,

    #[error("message body is empty")]
    EmptyMessage,

    #[error("request {request_id} not found")]
    NotFound { request_id: RequestId },

    #[error(transparent)]
    Persistence(#[from] RepositoryError),
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::EmptyMessage => ErrorKind::EmptyMessage,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Persistence(_) => ErrorKind::PersistenceFailure,
        }
    }
}

/// Error returned by the public service operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Chat(#[from] ChatError),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Lifecycle(e) => e.kind(),
            Self::Chat(e) => e.kind(),
        }
    }

    pub fn user_message(&self) -> &'static str {
        self.kind().user_message()
    }
}

impl From<RepositoryError> for ServiceError {
    fn from(err: RepositoryError) -> Self {
        Self::Lifecycle(LifecycleError::Persistence(err))
    }
}
