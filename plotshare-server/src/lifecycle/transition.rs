//! Pure transition checks.
//!
//! The graph is consulted before the policy: a move that can never happen is
//! `InvalidTransition` whoever asks, and only a legal move can be refused as
//! `Unauthorized`.

use plotshare_core::{can_transition, Actor, RequestStatus, SpaceRequest};

use crate::error::LifecycleError;

pub fn check_transition(
    actor: &Actor,
    request: &SpaceRequest,
    target: RequestStatus,
) -> Result<(), LifecycleError> {
    if !request.status.can_advance_to(target) {
        return Err(LifecycleError::InvalidTransition {
            from: request.status,
            to: target,
        });
    }
    if !can_transition(actor, request, target) {
        return Err(LifecycleError::Unauthorized);
    }
    Ok(())
}
