//! End-to-end behaviour of the service facade over both storage backends.

use std::sync::Arc;
use std::time::Duration;

use plotshare_core::{NoticeKind, RequestStatus, Space, SpaceRequest, UserId};
use plotshare_server::lifecycle::NoticeOutcome;
use plotshare_server::repository::{InMemoryRepository, SpaceRepository, SqliteRepository};
use plotshare_server::{ErrorKind, OpenChannel, PlotShareService};

fn olive() -> UserId {
    UserId::from("olive")
}

fn gus() -> UserId {
    UserId::from("gus")
}

fn hana() -> UserId {
    UserId::from("hana")
}

fn backends() -> Vec<(&'static str, Arc<dyn SpaceRepository>)> {
    vec![
        ("memory", Arc::new(InMemoryRepository::new())),
        ("sqlite", Arc::new(SqliteRepository::new_in_memory().unwrap())),
    ]
}

async fn space(service: &PlotShareService) -> Space {
    service
        .register_space(&olive(), "Raised beds by the fence")
        .await
        .unwrap()
}

async fn approved(service: &PlotShareService, space: &Space, gardener: &UserId) -> SpaceRequest {
    let request = service
        .create_request(gardener, &space.id, Some("Can I grow squash?"))
        .await
        .unwrap();
    service
        .request_transition(&olive(), &request.id, RequestStatus::Approved)
        .await
        .unwrap()
        .request
}

#[tokio::test]
async fn scenario_a_approve_then_activate_posts_notice_last() {
    for (backend, repo) in backends() {
        let service = PlotShareService::new(repo, 64);
        let plot = space(&service).await;
        let request = service
            .create_request(&gus(), &plot.id, None)
            .await
            .unwrap();
        assert_eq!(request.status, RequestStatus::Pending, "{backend}");

        let outcome = service
            .request_transition(&olive(), &request.id, RequestStatus::Approved)
            .await
            .unwrap();
        assert_eq!(outcome.request.status, RequestStatus::Approved, "{backend}");

        service
            .send_message(&gus(), &request.id, "Thanks! Starting Monday")
            .await
            .unwrap();
        service
            .send_message(&olive(), &request.id, "Gate code is on the shed")
            .await
            .unwrap();

        let outcome = service
            .request_transition(&gus(), &request.id, RequestStatus::Active)
            .await
            .unwrap();
        assert_eq!(outcome.request.status, RequestStatus::Active, "{backend}");
        assert!(outcome.request.started_at.is_some(), "{backend}");
        assert!(outcome.request.finished_at.is_none(), "{backend}");

        let history = service.history(&olive(), &request.id).await.unwrap();
        assert_eq!(history.len(), 3, "{backend}");
        let last = history.last().unwrap();
        assert!(last.is_system(), "{backend}");
        assert_eq!(last.sender_id, UserId::system());
        assert_eq!(last.notice(), Some(NoticeKind::OccupancyStarted));
        assert!(history[..2].iter().all(|m| !m.is_system()), "{backend}");
        assert!(matches!(
            outcome.notice,
            NoticeOutcome::Posted { ref message } if message == last
        ));
    }
}

#[tokio::test]
async fn scenario_b_second_activation_on_occupied_space_fails() {
    for (backend, repo) in backends() {
        let service = PlotShareService::new(repo, 64);
        let plot = space(&service).await;

        let first = approved(&service, &plot, &gus()).await;
        service
            .request_transition(&gus(), &first.id, RequestStatus::Active)
            .await
            .unwrap();

        // A request on an occupied space can still be made and approved.
        let second = approved(&service, &plot, &hana()).await;
        let err = service
            .request_transition(&hana(), &second.id, RequestStatus::Active)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SpaceOccupied, "{backend}");
        assert_eq!(err.user_message(), "already occupied");

        let stored = service.get_request(&hana(), &second.id).await.unwrap();
        assert_eq!(stored.status, RequestStatus::Approved, "{backend}");
        assert!(stored.started_at.is_none(), "{backend}");
        assert!(service
            .history(&hana(), &second.id)
            .await
            .unwrap()
            .is_empty());

        // Once the first is completed the space frees up.
        service
            .request_transition(&olive(), &first.id, RequestStatus::Completed)
            .await
            .unwrap();
        let outcome = service
            .request_transition(&hana(), &second.id, RequestStatus::Active)
            .await
            .unwrap();
        assert_eq!(outcome.request.status, RequestStatus::Active, "{backend}");
    }
}

#[tokio::test]
async fn scenario_c_message_before_approval_precedes_notice() {
    for (backend, repo) in backends() {
        let service = PlotShareService::new(repo, 64);
        let plot = space(&service).await;
        let request = service
            .create_request(&gus(), &plot.id, None)
            .await
            .unwrap();

        let hello = service
            .send_message(&gus(), &request.id, "Hello")
            .await
            .unwrap();
        assert_eq!(hello.sender_id, gus());

        service
            .request_transition(&olive(), &request.id, RequestStatus::Approved)
            .await
            .unwrap();
        service
            .request_transition(&gus(), &request.id, RequestStatus::Active)
            .await
            .unwrap();

        let history = service.history(&gus(), &request.id).await.unwrap();
        let bodies: Vec<_> = history.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(
            bodies,
            ["Hello", NoticeKind::OccupancyStarted.body()],
            "{backend}"
        );
        assert!(history[0].order_key() < history[1].order_key());
    }
}

#[tokio::test]
async fn scenario_d_completed_request_is_frozen() {
    for (backend, repo) in backends() {
        let service = PlotShareService::new(repo, 64);
        let plot = space(&service).await;
        let request = approved(&service, &plot, &gus()).await;
        service
            .request_transition(&gus(), &request.id, RequestStatus::Active)
            .await
            .unwrap();
        let done = service
            .request_transition(&gus(), &request.id, RequestStatus::Completed)
            .await
            .unwrap();
        assert!(done.request.finished_at.is_some(), "{backend}");
        assert!(matches!(
            &done.notice,
            NoticeOutcome::Posted { message } if message.notice() == Some(NoticeKind::OccupancyCompleted)
        ));

        for actor in [gus(), olive()] {
            let err = service
                .send_message(&actor, &request.id, "one more thing")
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Unauthorized, "{backend}");

            for target in RequestStatus::ALL {
                let err = service
                    .request_transition(&actor, &request.id, target)
                    .await
                    .unwrap_err();
                assert_eq!(err.kind(), ErrorKind::InvalidTransition, "{backend}");
            }
        }

        // The log is still readable.
        let history = service.history(&olive(), &request.id).await.unwrap();
        assert_eq!(history.len(), 2, "{backend}");
    }
}

#[tokio::test]
async fn empty_messages_are_never_stored() {
    for (backend, repo) in backends() {
        let service = PlotShareService::new(repo, 64);
        let plot = space(&service).await;
        let request = service
            .create_request(&gus(), &plot.id, None)
            .await
            .unwrap();

        for body in ["", " ", "\n\n", "\t \r\n"] {
            let err = service
                .send_message(&gus(), &request.id, body)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::EmptyMessage, "{backend}");
            assert_eq!(err.user_message(), "cannot be empty");
        }
        assert!(service
            .history(&gus(), &request.id)
            .await
            .unwrap()
            .is_empty());
    }
}

#[tokio::test]
async fn decline_and_withdraw_are_terminal_and_silent() {
    for (backend, repo) in backends() {
        let service = PlotShareService::new(repo, 64);
        let plot = space(&service).await;

        let declined = service
            .create_request(&gus(), &plot.id, None)
            .await
            .unwrap();
        let outcome = service
            .request_transition(&olive(), &declined.id, RequestStatus::Rejected)
            .await
            .unwrap();
        assert_eq!(outcome.notice, NoticeOutcome::NotRequired, "{backend}");

        let withdrawn = service
            .create_request(&gus(), &plot.id, None)
            .await
            .unwrap();
        let err = service
            .request_transition(&olive(), &withdrawn.id, RequestStatus::Cancelled)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized, "{backend}");
        service
            .request_transition(&gus(), &withdrawn.id, RequestStatus::Cancelled)
            .await
            .unwrap();

        for id in [declined.id, withdrawn.id] {
            let err = service
                .request_transition(&olive(), &id, RequestStatus::Approved)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidTransition, "{backend}");
            assert!(service.history(&gus(), &id).await.unwrap().is_empty());
        }

        let mine = service.requests_for_gardener(&gus()).await.unwrap();
        assert_eq!(mine.len(), 2, "{backend}");
    }
}

/// Two requesters race to activate the same space: exactly one wins.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_activation_has_one_winner() {
    for (backend, repo) in backends() {
        for _ in 0..10 {
            let service = Arc::new(PlotShareService::new(repo.clone(), 64));
            let plot = space(&service).await;
            let first = approved(&service, &plot, &gus()).await;
            let second = approved(&service, &plot, &hana()).await;

            let a = {
                let service = service.clone();
                tokio::spawn(async move {
                    service
                        .request_transition(&gus(), &first.id, RequestStatus::Active)
                        .await
                })
            };
            let b = {
                let service = service.clone();
                tokio::spawn(async move {
                    service
                        .request_transition(&hana(), &second.id, RequestStatus::Active)
                        .await
                })
            };
            let results = [a.await.unwrap(), b.await.unwrap()];

            let winners = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(winners, 1, "{backend}");
            for result in &results {
                if let Err(e) = result {
                    assert_eq!(e.kind(), ErrorKind::SpaceOccupied, "{backend}");
                }
            }
            assert!(service.is_space_occupied(&plot.id).await.unwrap());
            assert_eq!(repo.count_active_for_space(&plot.id).await.unwrap(), 1);
        }
    }
}

/// Two service instances over one store share no in-process lock; the
/// store's conditional write still admits only one activation.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_activation_across_service_instances() {
    for (backend, repo) in backends() {
        let left = Arc::new(PlotShareService::new(repo.clone(), 64));
        let right = Arc::new(PlotShareService::new(repo.clone(), 64));
        let plot = space(&left).await;
        let first = approved(&left, &plot, &gus()).await;
        let second = approved(&right, &plot, &hana()).await;

        let a = tokio::spawn(async move {
            left.request_transition(&gus(), &first.id, RequestStatus::Active)
                .await
        });
        let b = tokio::spawn(async move {
            right
                .request_transition(&hana(), &second.id, RequestStatus::Active)
                .await
        });
        let results = [a.await.unwrap(), b.await.unwrap()];

        assert_eq!(
            results.iter().filter(|r| r.is_ok()).count(),
            1,
            "{backend}"
        );
        assert_eq!(repo.count_active_for_space(&plot.id).await.unwrap(), 1);
    }
}

/// Replay plus live delivery covers every message exactly once, even with
/// writers running while the channel is opened.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn open_channel_has_no_gaps_or_duplicates() {
    for (backend, repo) in backends() {
        let service = Arc::new(PlotShareService::new(repo, 256));
        let plot = space(&service).await;
        let request = approved(&service, &plot, &gus()).await;

        for i in 0..5 {
            service
                .send_message(&gus(), &request.id, &format!("early {i}"))
                .await
                .unwrap();
        }

        let writers: Vec<_> = [gus(), olive()]
            .into_iter()
            .map(|author| {
                let service = service.clone();
                let request_id = request.id;
                tokio::spawn(async move {
                    for i in 0..25 {
                        service
                            .send_message(&author, &request_id, &format!("{author} {i}"))
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();

        let OpenChannel { history, mut live } =
            service.open_channel(&olive(), &request.id).await.unwrap();
        for writer in writers {
            writer.await.unwrap();
        }

        let mut seen = history;
        while seen.len() < 55 {
            let next = tokio::time::timeout(Duration::from_secs(5), live.recv())
                .await
                .expect("live delivery stalled")
                .unwrap()
                .expect("channel closed early");
            seen.push(next);
        }
        live.unsubscribe();
        live.unsubscribe();

        let stored = service.history(&olive(), &request.id).await.unwrap();
        assert_eq!(seen, stored, "{backend}");
        assert!(
            seen.windows(2).all(|w| w[0].order_key() < w[1].order_key()),
            "{backend}"
        );
    }
}

#[tokio::test]
async fn completion_ends_live_streams() {
    for (backend, repo) in backends() {
        let service = PlotShareService::new(repo, 64);
        let plot = space(&service).await;
        let request = approved(&service, &plot, &gus()).await;
        service
            .request_transition(&gus(), &request.id, RequestStatus::Active)
            .await
            .unwrap();

        let OpenChannel { history, mut live } =
            service.open_channel(&gus(), &request.id).await.unwrap();
        assert_eq!(history.len(), 1, "{backend}");

        service
            .request_transition(&olive(), &request.id, RequestStatus::Completed)
            .await
            .unwrap();

        let last = live.recv().await.unwrap().unwrap();
        assert_eq!(last.notice(), Some(NoticeKind::OccupancyCompleted));
        assert_eq!(live.recv().await, Ok(None), "{backend}");

        // Re-opening after completion replays the full log with nothing live.
        let OpenChannel { history, live } =
            service.open_channel(&olive(), &request.id).await.unwrap();
        assert_eq!(history.len(), 2, "{backend}");
        assert!(!live.is_active());
    }
}

#[tokio::test]
async fn duplicate_open_request_is_refused() {
    for (backend, repo) in backends() {
        let service = PlotShareService::new(repo, 64);
        let plot = space(&service).await;
        approved(&service, &plot, &gus()).await;

        let err = service
            .create_request(&gus(), &plot.id, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateRequest, "{backend}");

        let err = service
            .create_request(&olive(), &plot.id, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized, "{backend}");
    }
}

#[tokio::test]
async fn returned_snapshots_match_later_reads() {
    for (backend, repo) in backends() {
        let service = PlotShareService::new(repo.clone(), 16);

        let plot = space(&service).await;
        let stored = repo.get_space(&plot.id).await.unwrap();
        assert_eq!(stored, Some(plot.clone()), "{backend}");

        let created = service
            .create_request(&gus(), &plot.id, Some("Herbs only"))
            .await
            .unwrap();
        let fetched = service.get_request(&gus(), &created.id).await.unwrap();
        assert_eq!(fetched, created, "{backend}");

        let outcome = service
            .request_transition(&olive(), &created.id, RequestStatus::Approved)
            .await
            .unwrap();
        let fetched = service.get_request(&olive(), &created.id).await.unwrap();
        assert_eq!(fetched, outcome.request, "{backend}");

        let sent = service
            .send_message(&gus(), &created.id, "Thank you!")
            .await
            .unwrap();
        let history = service.history(&olive(), &created.id).await.unwrap();
        assert_eq!(history, vec![sent], "{backend}");
    }
}
