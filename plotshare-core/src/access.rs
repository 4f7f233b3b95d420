//! Who may see, post to, and move a space request.
//!
//! All checks are pure functions of an [`Actor`] and a [`SpaceRequest`]; the
//! caller turns a `false` into its own error and must not apply any change.

use serde::{Deserialize, Serialize};

use crate::request::{RequestStatus, SpaceRequest, UserId};

/// Role an identity holds relative to one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Owns the space the request is for.
    Owner,
    /// Asked to use the space.
    Requester,
}

/// An identity together with its role on a particular request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: UserId,
    pub role: Option<Role>,
}

impl Actor {
    pub fn resolve(id: UserId, request: &SpaceRequest) -> Self {
        let role = request.role_of(&id);
        Self { id, role }
    }

    pub fn is_participant(&self) -> bool {
        self.role.is_some()
    }
}

pub fn can_view(actor: &Actor, _request: &SpaceRequest) -> bool {
    actor.is_participant()
}

/// Participants may chat until the request is completed.
pub fn can_post(actor: &Actor, request: &SpaceRequest) -> bool {
    can_view(actor, request) && request.status != RequestStatus::Completed
}

/// Whether `actor` may move `request` to `target`.
///
/// Transitions outside the table below are refused regardless of role:
///
/// | from     | to        | who              |
/// |----------|-----------|------------------|
/// | pending  | approved  | owner            |
/// | pending  | rejected  | owner            |
/// | pending  | cancelled | requester        |
/// | approved | active    | requester        |
/// | active   | completed | owner, requester |
pub fn can_transition(actor: &Actor, request: &SpaceRequest, target: RequestStatus) -> bool {
    use RequestStatus::*;

    let Some(role) = actor.role else {
        return false;
    };
    match (request.status, target) {
        (Pending, Approved) | (Pending, Rejected) => role == Role::Owner,
        (Pending, Cancelled) => role == Role::Requester,
        (Approved, Active) => role == Role::Requester,
        (Active, Completed) => true,
        _ => false,
    }
}
