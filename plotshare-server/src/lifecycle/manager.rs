//! Request lifecycle manager.
//!
//! The only writer of `status`, `started_at` and `finished_at`. A transition
//! runs these steps in order and stops at the first failure:
//!
//! 1. load the request (`NotFound`)
//! 2. check the status graph (`InvalidTransition`) then the access policy
//!    (`Unauthorized`)
//! 3. for `active`, reserve the space (`SpaceOccupied`)
//! 4. conditionally write the new status against the status that was loaded
//! 5. post the system notice, if one is owed
//! 6. on a terminal status, drop the request's chat channel
//!
//! Steps 1-4 are all-or-nothing. Step 5 is best effort: its failure is
//! reported in the outcome and never undoes the committed status.

use std::sync::Arc;

use plotshare_core::{Actor, ChatMessage, RequestId, RequestStatus, SpaceId, SpaceRequest, UserId};
use serde::Serialize;
use tracing::{error, info, warn};

use super::occupancy::OccupancyGuard;
use super::transition::check_transition;
use crate::chat::{ChatHub, SystemNoticeEmitter};
use crate::error::LifecycleError;
use crate::repository::{
    timestamp_now, Conflict, NewSpaceRequest, RepositoryError, SpaceRepository, StatusUpdate,
};

/// What happened to the system notice of a committed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NoticeOutcome {
    /// The entered status carries no notice.
    NotRequired,
    Posted { message: ChatMessage },
    /// The status change stands; only the notice is missing.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionOutcome {
    pub request: SpaceRequest,
    pub notice: NoticeOutcome,
}

pub struct RequestLifecycleManager {
    repository: Arc<dyn SpaceRepository>,
    occupancy: OccupancyGuard,
    notices: SystemNoticeEmitter,
    hub: Arc<ChatHub>,
}

impl RequestLifecycleManager {
    pub fn new(repository: Arc<dyn SpaceRepository>, hub: Arc<ChatHub>) -> Self {
        Self {
            occupancy: OccupancyGuard::new(repository.clone()),
            notices: SystemNoticeEmitter::new(hub.clone()),
            repository,
            hub,
        }
    }

    /// Open a new `pending` request by `gardener` on `space_id`.
    ///
    /// The note is trimmed and a blank note is dropped.
    pub async fn create_request(
        &self,
        gardener: &UserId,
        space_id: &SpaceId,
        note: Option<&str>,
    ) -> Result<SpaceRequest, LifecycleError> {
        let space = self
            .repository
            .get_space(space_id)
            .await?
            .ok_or(LifecycleError::UnknownSpace {
                space_id: *space_id,
            })?;

        if gardener.is_reserved() || space.owner_id == *gardener {
            warn!(
                "Refused request by {} on space {} owned by {}",
                gardener, space_id, space.owner_id
            );
            return Err(LifecycleError::Unauthorized);
        }

        let message = note
            .map(str::trim)
            .filter(|note| !note.is_empty())
            .map(str::to_string);

        let created = self
            .repository
            .create_request(NewSpaceRequest {
                space_id: space.id,
                gardener_id: gardener.clone(),
                owner_id: space.owner_id,
                message,
            })
            .await
            .map_err(|e| match e {
                RepositoryError::Conflict(Conflict::OpenRequestExists) => {
                    LifecycleError::DuplicateRequest
                }
                RepositoryError::NotFound { .. } => LifecycleError::UnknownSpace {
                    space_id: *space_id,
                },
                other => LifecycleError::Persistence(other),
            })?;

        info!(
            "Request {} created by {} on space {}",
            created.id, gardener, space_id
        );
        Ok(created)
    }

    /// Move a request to `target` on behalf of `actor_id`.
    pub async fn transition(
        &self,
        actor_id: &UserId,
        request_id: &RequestId,
        target: RequestStatus,
    ) -> Result<TransitionOutcome, LifecycleError> {
        let request = self
            .repository
            .get_request(request_id)
            .await?
            .ok_or(LifecycleError::NotFound {
                request_id: *request_id,
            })?;

        let actor = Actor::resolve(actor_id.clone(), &request);
        if let Err(e) = check_transition(&actor, &request, target) {
            info!(
                "Rejected transition of request {} from {} to {} by {}: {}",
                request_id, request.status, target, actor_id, e
            );
            return Err(e);
        }

        // Held across the status write so the occupancy check and the write
        // are one step for every activation on this space.
        let reservation = if target == RequestStatus::Active {
            match self
                .occupancy
                .try_reserve(request.space_id, request.id)
                .await?
            {
                Some(reservation) => Some(reservation),
                None => {
                    warn!(
                        "Space {} is occupied, request {} stays {}",
                        request.space_id, request_id, request.status
                    );
                    return Err(LifecycleError::SpaceOccupied {
                        space_id: request.space_id,
                    });
                }
            }
        } else {
            None
        };

        let next = request.advanced(target, timestamp_now());
        let result = self
            .repository
            .update_status(StatusUpdate::to(&next, request.status))
            .await;
        drop(reservation);

        let updated = result.map_err(|e| {
            let err = conflict_to_lifecycle(e, &request, target);
            match &err {
                LifecycleError::Persistence(cause) => error!(
                    "Failed to persist transition of request {} to {}: {}",
                    request_id, target, cause
                ),
                other => info!(
                    "Transition of request {} to {} lost a race: {}",
                    request_id, target, other
                ),
            }
            err
        })?;

        info!(
            "Request {} moved from {} to {} by {}",
            request_id, request.status, updated.status, actor_id
        );

        let notice = self.emit_notice(&updated).await;

        match updated.status {
            RequestStatus::Completed => self.hub.close(&updated.id).await,
            RequestStatus::Rejected | RequestStatus::Cancelled => {
                self.hub.release(&updated.id).await
            }
            _ => {}
        }

        Ok(TransitionOutcome {
            request: updated,
            notice,
        })
    }

    async fn emit_notice(&self, request: &SpaceRequest) -> NoticeOutcome {
        match self.notices.emit(request).await {
            Ok(Some(message)) => NoticeOutcome::Posted { message },
            Ok(None) => NoticeOutcome::NotRequired,
            Err(e) => {
                warn!(
                    "Request {} is {} but its notice could not be posted: {}",
                    request.id, request.status, e
                );
                NoticeOutcome::Failed {
                    reason: e.kind().user_message().to_string(),
                }
            }
        }
    }

    /// Whether the space currently has an active request. Display only.
    pub async fn is_space_occupied(&self, space_id: &SpaceId) -> Result<bool, LifecycleError> {
        Ok(self.occupancy.is_occupied(space_id).await?)
    }
}

/// Translate a refused conditional write into the error the caller sees.
fn conflict_to_lifecycle(
    err: RepositoryError,
    request: &SpaceRequest,
    target: RequestStatus,
) -> LifecycleError {
    match err {
        RepositoryError::Conflict(Conflict::SpaceOccupied) => LifecycleError::SpaceOccupied {
            space_id: request.space_id,
        },
        // Someone else moved the request first; judge the attempt against
        // where it actually is now.
        RepositoryError::Conflict(Conflict::StatusChanged { actual, .. }) => {
            LifecycleError::InvalidTransition {
                from: actual,
                to: target,
            }
        }
        RepositoryError::NotFound { .. } => LifecycleError::NotFound {
            request_id: request.id,
        },
        other => LifecycleError::Persistence(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;
    use chrono::Utc;
    use plotshare_core::{NoticeKind, Space};

    struct Fixture {
        repo: Arc<InMemoryRepository>,
        hub: Arc<ChatHub>,
        manager: RequestLifecycleManager,
        space: Space,
    }

    async fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryRepository::new());
        let hub = Arc::new(ChatHub::new(repo.clone(), 16));
        let manager = RequestLifecycleManager::new(repo.clone(), hub.clone());
        let space = Space {
            id: SpaceId::new(),
            owner_id: UserId::from("olive"),
            title: "South bed".to_string(),
            created_at: Utc::now(),
        };
        repo.put_space(space.clone()).await.unwrap();
        Fixture {
            repo,
            hub,
            manager,
            space,
        }
    }

    fn olive() -> UserId {
        UserId::from("olive")
    }

    fn gus() -> UserId {
        UserId::from("gus")
    }

    #[tokio::test]
    async fn test_create_request_trims_note() {
        let f = fixture().await;
        let created = f
            .manager
            .create_request(&gus(), &f.space.id, Some("  tomatoes  "))
            .await
            .unwrap();
        assert_eq!(created.message.as_deref(), Some("tomatoes"));
        assert_eq!(created.owner_id, olive());

        let blank = f
            .manager
            .create_request(&UserId::from("hana"), &f.space.id, Some("   "))
            .await
            .unwrap();
        assert_eq!(blank.message, None);
    }

    #[tokio::test]
    async fn test_create_request_refusals() {
        let f = fixture().await;
        assert!(matches!(
            f.manager.create_request(&gus(), &SpaceId::new(), None).await,
            Err(LifecycleError::UnknownSpace { .. })
        ));
        assert!(matches!(
            f.manager.create_request(&olive(), &f.space.id, None).await,
            Err(LifecycleError::Unauthorized)
        ));
        assert!(matches!(
            f.manager
                .create_request(&UserId::system(), &f.space.id, None)
                .await,
            Err(LifecycleError::Unauthorized)
        ));

        f.manager
            .create_request(&gus(), &f.space.id, None)
            .await
            .unwrap();
        assert!(matches!(
            f.manager.create_request(&gus(), &f.space.id, None).await,
            Err(LifecycleError::DuplicateRequest)
        ));
    }

    #[tokio::test]
    async fn test_full_walk_with_notices() {
        let f = fixture().await;
        let request = f
            .manager
            .create_request(&gus(), &f.space.id, None)
            .await
            .unwrap();

        let approved = f
            .manager
            .transition(&olive(), &request.id, RequestStatus::Approved)
            .await
            .unwrap();
        assert_eq!(approved.request.status, RequestStatus::Approved);
        assert_eq!(approved.notice, NoticeOutcome::NotRequired);

        let active = f
            .manager
            .transition(&gus(), &request.id, RequestStatus::Active)
            .await
            .unwrap();
        assert!(active.request.started_at.is_some());
        assert!(matches!(
            &active.notice,
            NoticeOutcome::Posted { message } if message.notice() == Some(NoticeKind::OccupancyStarted)
        ));
        assert!(f.manager.is_space_occupied(&f.space.id).await.unwrap());

        let completed = f
            .manager
            .transition(&olive(), &request.id, RequestStatus::Completed)
            .await
            .unwrap();
        assert!(completed.request.finished_at.is_some());
        assert_eq!(completed.request.started_at, active.request.started_at);
        assert!(!f.manager.is_space_occupied(&f.space.id).await.unwrap());

        let history = f.hub.history(&request.id).await.unwrap();
        let notices: Vec<_> = history.iter().filter_map(|m| m.notice()).collect();
        assert_eq!(
            notices,
            [NoticeKind::OccupancyStarted, NoticeKind::OccupancyCompleted]
        );
    }

    #[tokio::test]
    async fn test_invalid_and_unauthorized_leave_state_alone() {
        let f = fixture().await;
        let request = f
            .manager
            .create_request(&gus(), &f.space.id, None)
            .await
            .unwrap();

        assert!(matches!(
            f.manager
                .transition(&gus(), &request.id, RequestStatus::Active)
                .await,
            Err(LifecycleError::InvalidTransition {
                from: RequestStatus::Pending,
                to: RequestStatus::Active,
            })
        ));
        assert!(matches!(
            f.manager
                .transition(&gus(), &request.id, RequestStatus::Approved)
                .await,
            Err(LifecycleError::Unauthorized)
        ));
        assert!(matches!(
            f.manager
                .transition(&UserId::from("mallory"), &request.id, RequestStatus::Approved)
                .await,
            Err(LifecycleError::Unauthorized)
        ));

        let stored = f.repo.get_request(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Pending);
        assert!(f.hub.history(&request.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_request() {
        let f = fixture().await;
        assert!(matches!(
            f.manager
                .transition(&olive(), &RequestId::new(), RequestStatus::Approved)
                .await,
            Err(LifecycleError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_withdraw_frees_the_slot() {
        let f = fixture().await;
        let request = f
            .manager
            .create_request(&gus(), &f.space.id, None)
            .await
            .unwrap();

        let cancelled = f
            .manager
            .transition(&gus(), &request.id, RequestStatus::Cancelled)
            .await
            .unwrap();
        assert_eq!(cancelled.request.status, RequestStatus::Cancelled);
        assert_eq!(cancelled.notice, NoticeOutcome::NotRequired);

        f.manager
            .create_request(&gus(), &f.space.id, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_terminal_transitions_drop_idle_channels() {
        let f = fixture().await;

        let done = f
            .manager
            .create_request(&gus(), &f.space.id, None)
            .await
            .unwrap();
        for (actor, status) in [
            (olive(), RequestStatus::Approved),
            (gus(), RequestStatus::Active),
        ] {
            f.manager.transition(&actor, &done.id, status).await.unwrap();
        }
        assert_eq!(f.hub.channel_count().await, 1);
        f.manager
            .transition(&olive(), &done.id, RequestStatus::Completed)
            .await
            .unwrap();
        assert_eq!(f.hub.channel_count().await, 0);
        assert!(!f.hub.subscribe(&done.id).await.unwrap().is_active());

        let declined = f
            .manager
            .create_request(&UserId::from("hana"), &f.space.id, None)
            .await
            .unwrap();
        f.hub
            .post(&UserId::from("hana"), &declined.id, "Could I use the corner?")
            .await
            .unwrap();
        assert_eq!(f.hub.channel_count().await, 1);
        f.manager
            .transition(&olive(), &declined.id, RequestStatus::Rejected)
            .await
            .unwrap();
        assert_eq!(f.hub.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_rejected_channel_with_listener_keeps_delivering() {
        let f = fixture().await;
        let request = f
            .manager
            .create_request(&gus(), &f.space.id, None)
            .await
            .unwrap();
        let (_, mut live) = f.hub.open(&request.id).await.unwrap();

        f.manager
            .transition(&olive(), &request.id, RequestStatus::Rejected)
            .await
            .unwrap();
        assert_eq!(f.hub.channel_count().await, 1);

        let sent = f
            .hub
            .post(&gus(), &request.id, "No worries, thanks anyway")
            .await
            .unwrap();
        assert_eq!(live.recv().await, Ok(Some(sent)));
    }

    #[tokio::test]
    async fn test_stale_snapshot_maps_to_invalid_transition() {
        let f = fixture().await;
        let request = f
            .manager
            .create_request(&gus(), &f.space.id, None)
            .await
            .unwrap();
        f.manager
            .transition(&olive(), &request.id, RequestStatus::Rejected)
            .await
            .unwrap();

        let err = conflict_to_lifecycle(
            RepositoryError::Conflict(Conflict::StatusChanged {
                expected: RequestStatus::Pending,
                actual: RequestStatus::Rejected,
            }),
            &request,
            RequestStatus::Approved,
        );
        assert!(matches!(
            err,
            LifecycleError::InvalidTransition {
                from: RequestStatus::Rejected,
                to: RequestStatus::Approved,
            }
        ));
    }
}
