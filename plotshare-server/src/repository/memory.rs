//! In-memory implementation of `SpaceRepository`.
//!
//! All state is held in `HashMap`s behind `RwLock`s and lost on restart.
//! Conditional writes are checked and applied under a single write lock, so
//! they are atomic with respect to each other.

use std::collections::HashMap;

use async_trait::async_trait;
use plotshare_core::{
    ChatMessage, MessageId, RequestId, RequestStatus, Space, SpaceId, SpaceRequest, UserId,
};
use tokio::sync::RwLock;

use super::{
    timestamp_now, truncate_to_millis, Conflict, NewChatMessage, NewSpaceRequest,
    RepositoryError, SpaceRepository, StatusUpdate,
};

#[derive(Default)]
struct MessageLog {
    by_request: HashMap<RequestId, Vec<ChatMessage>>,
    last_seq: i64,
}

/// In-memory space repository.
pub struct InMemoryRepository {
    /// Each space with its insertion index, the tie-break for equal timestamps.
    spaces: RwLock<HashMap<SpaceId, (usize, Space)>>,
    requests: RwLock<HashMap<RequestId, SpaceRequest>>,
    messages: RwLock<MessageLog>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            spaces: RwLock::new(HashMap::new()),
            requests: RwLock::new(HashMap::new()),
            messages: RwLock::new(MessageLog::default()),
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn newest_first(mut requests: Vec<SpaceRequest>) -> Vec<SpaceRequest> {
    requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    requests
}

#[async_trait]
impl SpaceRepository for InMemoryRepository {
    async fn put_space(&self, space: Space) -> Result<Space, RepositoryError> {
        let mut spaces = self.spaces.write().await;
        let (index, created_at) = spaces.get(&space.id).map_or(
            (spaces.len(), truncate_to_millis(space.created_at)),
            |(index, existing)| (*index, existing.created_at),
        );
        let stored = Space { created_at, ..space };
        spaces.insert(stored.id, (index, stored.clone()));
        Ok(stored)
    }

    async fn get_space(&self, id: &SpaceId) -> Result<Option<Space>, RepositoryError> {
        let spaces = self.spaces.read().await;
        Ok(spaces.get(id).map(|(_, space)| space.clone()))
    }

    async fn list_spaces_for_owner(&self, owner: &UserId) -> Result<Vec<Space>, RepositoryError> {
        let spaces = self.spaces.read().await;
        let mut owned: Vec<&(usize, Space)> = spaces
            .values()
            .filter(|(_, space)| space.owner_id == *owner)
            .collect();
        owned.sort_by_key(|(index, space)| (space.created_at, *index));
        Ok(owned.into_iter().map(|(_, space)| space.clone()).collect())
    }

    async fn get_request(&self, id: &RequestId) -> Result<Option<SpaceRequest>, RepositoryError> {
        let requests = self.requests.read().await;
        Ok(requests.get(id).cloned())
    }

    async fn create_request(&self, new: NewSpaceRequest) -> Result<SpaceRequest, RepositoryError> {
        let mut requests = self.requests.write().await;

        let duplicate = requests.values().any(|existing| {
            existing.space_id == new.space_id
                && existing.gardener_id == new.gardener_id
                && existing.status.is_open()
        });
        if duplicate {
            return Err(RepositoryError::Conflict(Conflict::OpenRequestExists));
        }

        let request = SpaceRequest {
            id: RequestId::new(),
            space_id: new.space_id,
            gardener_id: new.gardener_id,
            owner_id: new.owner_id,
            status: RequestStatus::Pending,
            message: new.message,
            created_at: timestamp_now(),
            started_at: None,
            finished_at: None,
        };
        requests.insert(request.id, request.clone());
        Ok(request)
    }

    async fn update_status(&self, update: StatusUpdate) -> Result<SpaceRequest, RepositoryError> {
        let mut requests = self.requests.write().await;

        let current = requests
            .get(&update.request_id)
            .ok_or(RepositoryError::NotFound {
                what: "space request",
            })?;
        if current.status != update.expected {
            return Err(RepositoryError::Conflict(Conflict::StatusChanged {
                expected: update.expected,
                actual: current.status,
            }));
        }

        if update.status == RequestStatus::Active {
            let space_id = current.space_id;
            let occupied = requests.values().any(|other| {
                other.id != update.request_id
                    && other.space_id == space_id
                    && other.status == RequestStatus::Active
            });
            if occupied {
                return Err(RepositoryError::Conflict(Conflict::SpaceOccupied));
            }
        }

        let Some(stored) = requests.get_mut(&update.request_id) else {
            return Err(RepositoryError::NotFound {
                what: "space request",
            });
        };
        stored.status = update.status;
        if update.started_at.is_some() {
            stored.started_at = update.started_at;
        }
        if update.finished_at.is_some() {
            stored.finished_at = update.finished_at;
        }
        Ok(stored.clone())
    }

    async fn count_active_for_space(&self, space_id: &SpaceId) -> Result<usize, RepositoryError> {
        let requests = self.requests.read().await;
        Ok(requests
            .values()
            .filter(|r| r.space_id == *space_id && r.status == RequestStatus::Active)
            .count())
    }

    async fn count_pending_for_space(&self, space_id: &SpaceId) -> Result<usize, RepositoryError> {
        let requests = self.requests.read().await;
        Ok(requests
            .values()
            .filter(|r| r.space_id == *space_id && r.status == RequestStatus::Pending)
            .count())
    }

    async fn list_requests_for_gardener(
        &self,
        gardener: &UserId,
    ) -> Result<Vec<SpaceRequest>, RepositoryError> {
        let requests = self.requests.read().await;
        Ok(newest_first(
            requests
                .values()
                .filter(|r| r.gardener_id == *gardener)
                .cloned()
                .collect(),
        ))
    }

    async fn list_requests_for_space(
        &self,
        space_id: &SpaceId,
    ) -> Result<Vec<SpaceRequest>, RepositoryError> {
        let requests = self.requests.read().await;
        Ok(newest_first(
            requests
                .values()
                .filter(|r| r.space_id == *space_id)
                .cloned()
                .collect(),
        ))
    }

    async fn append_message(&self, new: NewChatMessage) -> Result<ChatMessage, RepositoryError> {
        let mut log = self.messages.write().await;
        log.last_seq += 1;
        let seq = log.last_seq;

        let entries = log.by_request.entry(new.request_id).or_default();
        let now = timestamp_now();
        let created_at = match entries.last() {
            Some(previous) if previous.created_at > now => previous.created_at,
            _ => now,
        };

        let message = ChatMessage {
            id: MessageId::new(),
            request_id: new.request_id,
            sender_id: new.sender_id,
            body: new.body,
            kind: new.kind,
            created_at,
            seq,
        };
        entries.push(message.clone());
        Ok(message)
    }

    async fn list_messages(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        let log = self.messages.read().await;
        Ok(log.by_request.get(request_id).cloned().unwrap_or_default())
    }
}
