//! The operations exposed to surrounding application code.
//!
//! `PlotShareService` wires the lifecycle manager and the chat hub over one
//! repository and translates every failure into a [`ServiceError`].

use std::sync::Arc;

use plotshare_core::{
    can_view, Actor, ChatMessage, RequestId, RequestStatus, Space, SpaceId, SpaceRequest, UserId,
};
use serde::Serialize;
use tracing::info;

use crate::chat::{ChatHub, Subscription};
use crate::error::{ChatError, LifecycleError, ServiceError};
use crate::lifecycle::{RequestLifecycleManager, TransitionOutcome};
use crate::repository::{timestamp_now, SpaceRepository};

/// A joined channel: the history so far and the live feed after it.
///
/// Close the channel with `live.unsubscribe()` or by dropping it.
#[derive(Debug)]
pub struct OpenChannel {
    pub history: Vec<ChatMessage>,
    pub live: Subscription,
}

/// Number of `pending` requests on one of an owner's spaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingCount {
    pub space_id: SpaceId,
    pub title: String,
    pub pending: usize,
}

pub struct PlotShareService {
    repository: Arc<dyn SpaceRepository>,
    lifecycle: RequestLifecycleManager,
    chat: Arc<ChatHub>,
}

impl PlotShareService {
    pub fn new(repository: Arc<dyn SpaceRepository>, channel_capacity: usize) -> Self {
        let chat = Arc::new(ChatHub::new(repository.clone(), channel_capacity));
        let lifecycle = RequestLifecycleManager::new(repository.clone(), chat.clone());
        Self {
            repository,
            lifecycle,
            chat,
        }
    }

    /// Register a space owned by `owner`.
    pub async fn register_space(&self, owner: &UserId, title: &str) -> Result<Space, ServiceError> {
        if owner.is_reserved() {
            return Err(LifecycleError::Unauthorized.into());
        }
        let title = title.trim();
        if title.is_empty() {
            return Err(LifecycleError::EmptyTitle.into());
        }

        let space = Space {
            id: SpaceId::new(),
            owner_id: owner.clone(),
            title: title.to_string(),
            created_at: timestamp_now(),
        };
        let space = self.repository.put_space(space).await?;
        info!("Space {} registered by {}", space.id, owner);
        Ok(space)
    }

    pub async fn create_request(
        &self,
        gardener: &UserId,
        space_id: &SpaceId,
        note: Option<&str>,
    ) -> Result<SpaceRequest, ServiceError> {
        Ok(self
            .lifecycle
            .create_request(gardener, space_id, note)
            .await?)
    }

    /// Fetch a request the actor takes part in.
    pub async fn get_request(
        &self,
        actor_id: &UserId,
        request_id: &RequestId,
    ) -> Result<SpaceRequest, ServiceError> {
        let request = self
            .repository
            .get_request(request_id)
            .await?
            .ok_or(LifecycleError::NotFound {
                request_id: *request_id,
            })?;
        if !can_view(&Actor::resolve(actor_id.clone(), &request), &request) {
            return Err(LifecycleError::Unauthorized.into());
        }
        Ok(request)
    }

    pub async fn request_transition(
        &self,
        actor_id: &UserId,
        request_id: &RequestId,
        target: RequestStatus,
    ) -> Result<TransitionOutcome, ServiceError> {
        Ok(self
            .lifecycle
            .transition(actor_id, request_id, target)
            .await?)
    }

    pub async fn send_message(
        &self,
        actor_id: &UserId,
        request_id: &RequestId,
        body: &str,
    ) -> Result<ChatMessage, ServiceError> {
        Ok(self.chat.post(actor_id, request_id, body).await?)
    }

    /// Ordered chat history, for participants only.
    pub async fn history(
        &self,
        actor_id: &UserId,
        request_id: &RequestId,
    ) -> Result<Vec<ChatMessage>, ServiceError> {
        self.ensure_viewer(actor_id, request_id).await?;
        Ok(self.chat.history(request_id).await?)
    }

    /// Join a request's chat: history plus a live feed with no gap or
    /// overlap between the two.
    pub async fn open_channel(
        &self,
        actor_id: &UserId,
        request_id: &RequestId,
    ) -> Result<OpenChannel, ServiceError> {
        let request = self.ensure_viewer(actor_id, request_id).await?;
        let (history, live) = self.chat.open(request_id).await?;
        info!(
            "{} opened chat for request {} ({}, {} messages)",
            actor_id,
            request_id,
            request.status,
            history.len()
        );
        Ok(OpenChannel { history, live })
    }

    async fn ensure_viewer(
        &self,
        actor_id: &UserId,
        request_id: &RequestId,
    ) -> Result<SpaceRequest, ChatError> {
        let request = self
            .repository
            .get_request(request_id)
            .await?
            .ok_or(ChatError::NotFound {
                request_id: *request_id,
            })?;
        if !can_view(&Actor::resolve(actor_id.clone(), &request), &request) {
            return Err(ChatError::Unauthorized);
        }
        Ok(request)
    }

    pub async fn is_space_occupied(&self, space_id: &SpaceId) -> Result<bool, ServiceError> {
        if self.repository.get_space(space_id).await?.is_none() {
            return Err(LifecycleError::UnknownSpace {
                space_id: *space_id,
            }
            .into());
        }
        Ok(self.lifecycle.is_space_occupied(space_id).await?)
    }

    /// The gardener's own requests, newest first.
    pub async fn requests_for_gardener(
        &self,
        gardener: &UserId,
    ) -> Result<Vec<SpaceRequest>, ServiceError> {
        Ok(self.repository.list_requests_for_gardener(gardener).await?)
    }

    /// Every request on a space, for its owner only.
    pub async fn requests_for_space(
        &self,
        owner: &UserId,
        space_id: &SpaceId,
    ) -> Result<Vec<SpaceRequest>, ServiceError> {
        let space = self
            .repository
            .get_space(space_id)
            .await?
            .ok_or(LifecycleError::UnknownSpace {
                space_id: *space_id,
            })?;
        if space.owner_id != *owner {
            return Err(LifecycleError::Unauthorized.into());
        }
        Ok(self.repository.list_requests_for_space(space_id).await?)
    }

    /// Pending request count for each space `owner` owns, oldest space first.
    pub async fn pending_request_counts(
        &self,
        owner: &UserId,
    ) -> Result<Vec<PendingCount>, ServiceError> {
        let spaces = self.repository.list_spaces_for_owner(owner).await?;
        let mut counts = Vec::with_capacity(spaces.len());
        for space in spaces {
            let pending = self.repository.count_pending_for_space(&space.id).await?;
            counts.push(PendingCount {
                space_id: space.id,
                title: space.title,
                pending,
            });
        }
        Ok(counts)
    }
}
