//! Per-request chat channels.
//!
//! Every message is appended to the repository and broadcast to live
//! subscribers while the channel's commit lock is held. Opening a channel
//! reads history and subscribes under the same lock, so a message is either
//! in the replayed history or delivered live, never both and never neither.
//!
//! A channel exists only while it is useful: it is created for a request that
//! exists and is not completed, and an idle one (no subscribers, nothing in
//! flight) is swept the next time any channel is created.

use std::collections::HashMap;
use std::sync::Arc;

use plotshare_core::{
    can_post, Actor, ChatMessage, MessageKind, NoticeKind, RequestId, RequestStatus, UserId,
};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};

use crate::error::ChatError;
use crate::repository::{NewChatMessage, SpaceRepository};

struct ChannelState {
    sender: broadcast::Sender<ChatMessage>,
    commit: Arc<Mutex<()>>,
}

impl ChannelState {
    fn is_idle(&self) -> bool {
        self.sender.receiver_count() == 0 && self.commit.try_lock().is_ok()
    }
}

/// Owns the live fan-out for every request's chat channel.
pub struct ChatHub {
    repository: Arc<dyn SpaceRepository>,
    channels: RwLock<HashMap<RequestId, Arc<ChannelState>>>,
    capacity: usize,
}

impl ChatHub {
    /// `capacity` is the number of messages a slow subscriber may fall behind
    /// before it is dropped with `Lagged`.
    pub fn new(repository: Arc<dyn SpaceRepository>, capacity: usize) -> Self {
        Self {
            repository,
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// The live channel for a request, or `None` once it is completed.
    async fn channel(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<Arc<ChannelState>>, ChatError> {
        if let Some(state) = self.channels.read().await.get(request_id) {
            return Ok(Some(state.clone()));
        }

        let mut channels = self.channels.write().await;
        if let Some(state) = channels.get(request_id) {
            return Ok(Some(state.clone()));
        }

        // Read under the write lock. `close` runs after the completed status
        // is stored, so a completed request never gets a fresh channel.
        let request = self
            .repository
            .get_request(request_id)
            .await?
            .ok_or(ChatError::NotFound {
                request_id: *request_id,
            })?;
        if request.status == RequestStatus::Completed {
            return Ok(None);
        }

        let before = channels.len();
        channels.retain(|_, state| !state.is_idle());
        if channels.len() < before {
            debug!("Swept {} idle chat channels", before - channels.len());
        }

        let (sender, _) = broadcast::channel(self.capacity);
        let state = Arc::new(ChannelState {
            sender,
            commit: Arc::new(Mutex::new(())),
        });
        channels.insert(*request_id, state.clone());
        Ok(Some(state))
    }

    /// The live channel with its commit lock held, or `None` once the request
    /// is completed.
    async fn lock_channel(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<(Arc<ChannelState>, OwnedMutexGuard<()>)>, ChatError> {
        loop {
            let Some(state) = self.channel(request_id).await? else {
                return Ok(None);
            };
            let guard = state.commit.clone().lock_owned().await;
            let current = self
                .channels
                .read()
                .await
                .get(request_id)
                .is_some_and(|live| Arc::ptr_eq(live, &state));
            if current {
                return Ok(Some((state, guard)));
            }
            // Swept or closed while we waited for the lock.
        }
    }

    /// All messages for the request in delivery order.
    pub async fn history(&self, request_id: &RequestId) -> Result<Vec<ChatMessage>, ChatError> {
        Ok(self.repository.list_messages(request_id).await?)
    }

    /// Post a message typed by `actor_id`.
    ///
    /// The body is trimmed; a blank body is refused before anything else is
    /// looked at.
    pub async fn post(
        &self,
        actor_id: &UserId,
        request_id: &RequestId,
        body: &str,
    ) -> Result<ChatMessage, ChatError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        self.authorize_post(actor_id, request_id).await?;
        let Some((state, _commit)) = self.lock_channel(request_id).await? else {
            return Err(ChatError::Unauthorized);
        };

        // Checked again under the commit lock so a post cannot slip in after
        // the completion notice.
        let actor = self.authorize_post(actor_id, request_id).await?;
        let message = self
            .commit(
                Some(&state),
                NewChatMessage {
                    request_id: *request_id,
                    sender_id: actor.id,
                    body: body.to_string(),
                    kind: MessageKind::Human,
                },
            )
            .await?;
        info!(
            "Message {} posted by {} on request {}",
            message.id, message.sender_id, request_id
        );
        Ok(message)
    }

    async fn authorize_post(
        &self,
        actor_id: &UserId,
        request_id: &RequestId,
    ) -> Result<Actor, ChatError> {
        let request = self
            .repository
            .get_request(request_id)
            .await?
            .ok_or(ChatError::NotFound {
                request_id: *request_id,
            })?;
        let actor = Actor::resolve(actor_id.clone(), &request);
        if !can_post(&actor, &request) {
            debug!(
                "Refused post by {} on request {} in status {}",
                actor_id, request_id, request.status
            );
            return Err(ChatError::Unauthorized);
        }
        Ok(actor)
    }

    /// Post a system notice. Notices bypass the posting policy: the completion
    /// notice is written after the request has already left `active`.
    pub async fn post_notice(
        &self,
        request_id: &RequestId,
        notice: NoticeKind,
    ) -> Result<ChatMessage, ChatError> {
        let new = NewChatMessage {
            request_id: *request_id,
            sender_id: UserId::system(),
            body: notice.body().to_string(),
            kind: MessageKind::System,
        };
        match self.lock_channel(request_id).await? {
            Some((state, _commit)) => self.commit(Some(&state), new).await,
            None => self.commit(None, new).await,
        }
    }

    /// Persist then broadcast. Caller holds the channel's commit lock.
    async fn commit(
        &self,
        state: Option<&ChannelState>,
        new: NewChatMessage,
    ) -> Result<ChatMessage, ChatError> {
        let message = self.repository.append_message(new).await?;
        if let Some(state) = state {
            // No receivers is fine; history still has the message.
            let _ = state.sender.send(message.clone());
        }
        Ok(message)
    }

    /// Live messages from now on. Not retroactive; use [`ChatHub::open`] for a
    /// gap-free history plus subscription.
    pub async fn subscribe(&self, request_id: &RequestId) -> Result<Subscription, ChatError> {
        Ok(match self.lock_channel(request_id).await? {
            Some((state, _commit)) => Subscription::new(*request_id, state.sender.subscribe()),
            None => Subscription::closed(*request_id),
        })
    }

    /// History up to now together with a subscription for everything after.
    pub async fn open(
        &self,
        request_id: &RequestId,
    ) -> Result<(Vec<ChatMessage>, Subscription), ChatError> {
        let Some((state, _commit)) = self.lock_channel(request_id).await? else {
            let history = self.history(request_id).await?;
            return Ok((history, Subscription::closed(*request_id)));
        };

        let history = self.repository.list_messages(request_id).await?;
        let receiver = state.sender.subscribe();
        debug!(
            "Opened channel for request {} with {} messages of history",
            request_id,
            history.len()
        );
        Ok((history, Subscription::new(*request_id, receiver)))
    }

    /// Tear down live delivery for a completed request. Current subscribers
    /// see the end of their stream once any in-flight message has been
    /// delivered; later subscriptions are closed from the start.
    pub async fn close(&self, request_id: &RequestId) {
        if self.channels.write().await.remove(request_id).is_some() {
            info!("Closed chat channel for request {}", request_id);
        }
    }

    /// Drop a request's channel if nobody is listening. Participants of a
    /// rejected or cancelled request may still post, so a channel with
    /// subscribers stays.
    pub async fn release(&self, request_id: &RequestId) {
        let mut channels = self.channels.write().await;
        if channels
            .get(request_id)
            .is_some_and(|state| state.is_idle())
        {
            channels.remove(request_id);
            debug!("Released idle chat channel for request {}", request_id);
        }
    }

    /// Number of live subscribers on a request's channel.
    pub async fn subscriber_count(&self, request_id: &RequestId) -> usize {
        let channels = self.channels.read().await;
        channels
            .get(request_id)
            .map_or(0, |state| state.sender.receiver_count())
    }

    /// Number of channels currently held in memory.
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    /// The subscriber fell behind and messages were dropped. Re-open the
    /// channel and reconcile against history.
    #[error("subscriber lagged behind and missed {missed} messages")]
    Lagged { missed: u64 },
}

/// Handle to a live message feed.
///
/// Dropping the handle unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    request_id: RequestId,
    receiver: Option<broadcast::Receiver<ChatMessage>>,
}

impl Subscription {
    fn new(request_id: RequestId, receiver: broadcast::Receiver<ChatMessage>) -> Self {
        Self {
            request_id,
            receiver: Some(receiver),
        }
    }

    fn closed(request_id: RequestId) -> Self {
        Self {
            request_id,
            receiver: None,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn is_active(&self) -> bool {
        self.receiver.is_some()
    }

    /// Next live message. `Ok(None)` once the channel is closed or this handle
    /// has been unsubscribed.
    pub async fn recv(&mut self) -> Result<Option<ChatMessage>, SubscriptionError> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Ok(None);
        };
        match receiver.recv().await {
            Ok(message) => Ok(Some(message)),
            Err(RecvError::Closed) => {
                self.receiver = None;
                Ok(None)
            }
            Err(RecvError::Lagged(missed)) => {
                self.receiver = None;
                Err(SubscriptionError::Lagged { missed })
            }
        }
    }

    /// Stop delivery. Safe to call more than once, and after the channel has
    /// been closed.
    pub fn unsubscribe(&mut self) {
        if self.receiver.take().is_some() {
            debug!("Unsubscribed from request {}", self.request_id);
        }
    }
}
