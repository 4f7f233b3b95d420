//! Occupancy guard: at most one `active` request per space.
//!
//! The guard serializes activation attempts per space with an in-process lock
//! and reads the live active count from the repository while holding it. The
//! repository's conditional write is the second line: a store shared with
//! another process still refuses a second active row.

use std::collections::HashMap;
use std::sync::Arc;

use plotshare_core::{RequestId, SpaceId};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use crate::repository::{RepositoryError, SpaceRepository};

/// Permission to write `active` for one request on one space.
///
/// Holds the space's activation lock until dropped, so the status write must
/// happen before the reservation goes out of scope.
#[derive(Debug)]
pub struct Reservation {
    pub space_id: SpaceId,
    pub request_id: RequestId,
    _guard: OwnedMutexGuard<()>,
}

pub struct OccupancyGuard {
    repository: Arc<dyn SpaceRepository>,
    space_locks: RwLock<HashMap<SpaceId, Arc<Mutex<()>>>>,
}

impl OccupancyGuard {
    pub fn new(repository: Arc<dyn SpaceRepository>) -> Self {
        Self {
            repository,
            space_locks: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the activation lock for a space.
    async fn get_or_create_space_lock(&self, space_id: &SpaceId) -> Arc<Mutex<()>> {
        {
            let locks = self.space_locks.read().await;
            if let Some(lock) = locks.get(space_id) {
                return lock.clone();
            }
        }

        let mut locks = self.space_locks.write().await;
        locks
            .entry(*space_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Reserve `space_id` for `request_id` if nothing else is active on it.
    ///
    /// Returns `None` when the space is occupied. There is no release call:
    /// once the holder leaves `active`, the live count lets the next
    /// reservation through.
    pub async fn try_reserve(
        &self,
        space_id: SpaceId,
        request_id: RequestId,
    ) -> Result<Option<Reservation>, RepositoryError> {
        let lock = self.get_or_create_space_lock(&space_id).await;
        let guard = lock.lock_owned().await;

        let active = self.repository.count_active_for_space(&space_id).await?;
        if active > 0 {
            debug!(
                "Space {} already has {} active request(s), refusing {}",
                space_id, active, request_id
            );
            return Ok(None);
        }

        Ok(Some(Reservation {
            space_id,
            request_id,
            _guard: guard,
        }))
    }

    /// Whether the space currently has an active request. For display only;
    /// transition decisions go through `try_reserve`.
    pub async fn is_occupied(&self, space_id: &SpaceId) -> Result<bool, RepositoryError> {
        Ok(self.repository.count_active_for_space(space_id).await? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{InMemoryRepository, NewSpaceRequest, StatusUpdate};
    use chrono::Utc;
    use plotshare_core::{RequestStatus, SpaceRequest, UserId};
    use std::time::Duration;

    async fn approved(repo: &InMemoryRepository, space_id: SpaceId, gardener: &str) -> SpaceRequest {
        let request = repo
            .create_request(NewSpaceRequest {
                space_id,
                gardener_id: UserId::from(gardener),
                owner_id: UserId::from("olive"),
                message: None,
            })
            .await
            .unwrap();
        let next = request.advanced(RequestStatus::Approved, Utc::now());
        repo.update_status(StatusUpdate::to(&next, RequestStatus::Pending))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_reserve_free_space() {
        let repo = Arc::new(InMemoryRepository::new());
        let guard = OccupancyGuard::new(repo.clone());
        let space_id = SpaceId::new();
        let request = approved(&repo, space_id, "gus").await;

        let reservation = guard.try_reserve(space_id, request.id).await.unwrap();
        assert!(reservation.is_some());
        assert!(!guard.is_occupied(&space_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_occupied_space_is_refused_until_completed() {
        let repo = Arc::new(InMemoryRepository::new());
        let guard = OccupancyGuard::new(repo.clone());
        let space_id = SpaceId::new();
        let first = approved(&repo, space_id, "gus").await;
        let second = approved(&repo, space_id, "hana").await;

        let active = {
            let _reservation = guard.try_reserve(space_id, first.id).await.unwrap().unwrap();
            let next = first.advanced(RequestStatus::Active, Utc::now());
            repo.update_status(StatusUpdate::to(&next, RequestStatus::Approved))
                .await
                .unwrap()
        };
        assert!(guard.is_occupied(&space_id).await.unwrap());
        assert!(guard.try_reserve(space_id, second.id).await.unwrap().is_none());

        let done = active.advanced(RequestStatus::Completed, Utc::now());
        repo.update_status(StatusUpdate::to(&done, RequestStatus::Active))
            .await
            .unwrap();
        assert!(guard.try_reserve(space_id, second.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reservation_blocks_same_space_only() {
        let repo = Arc::new(InMemoryRepository::new());
        let guard = Arc::new(OccupancyGuard::new(repo.clone()));
        let space_a = SpaceId::new();
        let space_b = SpaceId::new();

        let held = guard.try_reserve(space_a, RequestId::new()).await.unwrap();
        assert!(held.is_some());

        // A different space is not blocked.
        let other = tokio::time::timeout(
            Duration::from_secs(1),
            guard.try_reserve(space_b, RequestId::new()),
        )
        .await;
        assert!(matches!(other, Ok(Ok(Some(_)))));

        // The same space waits for the holder.
        let same = tokio::time::timeout(
            Duration::from_millis(50),
            guard.try_reserve(space_a, RequestId::new()),
        )
        .await;
        assert!(same.is_err());

        drop(held);
        let after = guard.try_reserve(space_a, RequestId::new()).await.unwrap();
        assert!(after.is_some());
    }
}
