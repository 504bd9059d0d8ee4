//! Delivery queue state machine against a real spool directory
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use feedcast_common::time;
use feedcast_delivery::{
    DeliveryError, DeliveryQueue, DestinationFlags, DestinationInfo, Hop, RedirectCache,
    SnapshotHandle, Timers,
};
use feedcast_spool::{PublishId, SpoolStore};
use support::{deposit, deposit_received, place, redirects, routed_snapshot, scenario_timers, snapshot};
use tempfile::TempDir;

const BASE: &str = "https://sub.example.com/in";

struct Fixture {
    _dir: TempDir,
    queue: DeliveryQueue,
    redirects: Arc<RedirectCache>,
}

impl Fixture {
    fn new(destination: DestinationInfo, timers: Timers) -> Self {
        Self::with_snapshot(&destination.name.clone(), snapshot(vec![destination], timers))
    }

    fn with_snapshot(name: &str, snapshot: SnapshotHandle) -> Self {
        let dir = TempDir::new().unwrap();
        let spool = SpoolStore::open(dir.path()).unwrap();
        let redirects = redirects();
        let queue = DeliveryQueue::new(name, spool, snapshot, Arc::clone(&redirects));
        Self {
            _dir: dir,
            queue,
            redirects,
        }
    }

    fn spool(&self) -> &SpoolStore {
        self.queue.spool()
    }
}

fn d1() -> DestinationInfo {
    DestinationInfo::subscriber("d1", "42", BASE)
}

fn unavailable() -> DeliveryError {
    DeliveryError::from_status(503)
}

#[tokio::test]
async fn test_oldest_entry_first() {
    let fixture = Fixture::new(d1(), Timers::default());
    place(fixture.spool().path(), "00002.pub2", "pub2");
    place(fixture.spool().path(), "00001.pub1", "pub1");

    let now = SystemTime::now();
    let peeked = fixture.queue.peek_next(now).await.unwrap();
    assert_eq!(peeked.file_name(), "00001.pub1");

    let first = fixture.queue.get_next(now).await.unwrap();
    assert_eq!(first.publish_id().as_str(), "pub1");
    assert_eq!(first.target_url(), format!("{BASE}/pub1"));
    assert_eq!(first.attempt(), 1);

    // pub1 is in flight, so pub2 is next
    let second = fixture.queue.get_next(now).await.unwrap();
    assert_eq!(second.publish_id().as_str(), "pub2");
    assert!(fixture.queue.get_next(now).await.is_none());
}

#[tokio::test]
async fn test_empty_spool_yields_nothing() {
    let fixture = Fixture::new(d1(), Timers::default());
    let now = SystemTime::now();

    assert!(fixture.queue.peek_next(now).await.is_none());
    assert!(fixture.queue.get_next(now).await.is_none());
}

#[tokio::test]
async fn test_success_removes_entry() {
    let fixture = Fixture::new(d1(), Timers::default());
    deposit(fixture.spool(), "pub1").await;
    deposit(fixture.spool(), "pub2").await;

    let now = SystemTime::now();
    let task = fixture.queue.get_next(now).await.unwrap();
    assert!(
        fixture
            .queue
            .record_success(&task, 204, Duration::from_millis(5))
            .await
    );

    let status = fixture.queue.status(now).await;
    assert_eq!(status.pending, 1);
    assert_eq!(status.in_flight, 0);
    assert!(!status.failed);

    let next = fixture.queue.get_next(now).await.unwrap();
    assert_eq!(next.publish_id().as_str(), "pub2");
}

#[tokio::test]
async fn test_three_failures_back_off_10_20_40_seconds() {
    let fixture = Fixture::new(d1(), scenario_timers());
    deposit(fixture.spool(), "pub1").await;

    let mut now = SystemTime::now();
    let mut delays = Vec::new();

    for attempt in 1..=3 {
        let task = fixture.queue.get_next(now).await.unwrap();
        assert_eq!(task.attempt(), attempt);
        assert!(fixture.queue.record_failure(&task, &unavailable(), now).await);

        let status = fixture.queue.status(now).await;
        assert!(status.failed);
        assert!(status.backing_off);
        assert_eq!(status.failures, attempt);
        assert_eq!(status.pending, 1);

        let resume_at = status.resume_at.unwrap();
        delays.push(time::millis_between(now, resume_at));

        // Nothing is handed out until the pause is over
        let almost = resume_at - Duration::from_millis(1);
        assert!(fixture.queue.peek_next(almost).await.is_none());
        assert!(fixture.queue.get_next(almost).await.is_none());

        now = resume_at;
    }

    assert_eq!(delays, [10_000, 20_000, 40_000]);
}

#[tokio::test]
async fn test_backoff_is_capped() {
    let fixture = Fixture::new(d1(), scenario_timers());
    deposit(fixture.spool(), "pub1").await;

    let mut now = SystemTime::now();
    let mut previous = 0;
    for _ in 0..8 {
        let task = fixture.queue.get_next(now).await.unwrap();
        fixture.queue.record_failure(&task, &unavailable(), now).await;

        let resume_at = fixture.queue.status(now).await.resume_at.unwrap();
        let delay = time::millis_between(now, resume_at);
        assert!(delay >= previous);
        assert!(delay <= 150_000);
        previous = delay;
        now = resume_at;
    }

    assert_eq!(previous, 150_000);
}

#[tokio::test]
async fn test_success_after_failures_resets_backoff() {
    let fixture = Fixture::new(d1(), scenario_timers());
    deposit(fixture.spool(), "pub1").await;
    deposit(fixture.spool(), "pub2").await;

    let now = SystemTime::now();
    let task = fixture.queue.get_next(now).await.unwrap();
    fixture.queue.record_failure(&task, &unavailable(), now).await;

    // Redelivery keeps the entry's place at the head of the queue
    let later = now + Duration::from_secs(10);
    let task = fixture.queue.get_next(later).await.unwrap();
    assert_eq!(task.publish_id().as_str(), "pub1");
    assert_eq!(task.attempt(), 2);
    fixture
        .queue
        .record_success(&task, 201, Duration::from_millis(1))
        .await;

    let status = fixture.queue.status(later).await;
    assert!(!status.failed);
    assert_eq!(status.failures, 0);
    assert_eq!(status.resume_at, None);

    let task = fixture.queue.get_next(later).await.unwrap();
    assert_eq!(task.attempt(), 1);
    fixture.queue.record_failure(&task, &unavailable(), later).await;
    let resume_at = fixture.queue.status(later).await.resume_at.unwrap();
    assert_eq!(time::millis_between(later, resume_at), 10_000);
}

#[tokio::test]
async fn test_expired_entries_are_dropped() {
    let timers = Timers {
        expiration_timer_ms: 60_000,
        ..Timers::default()
    };
    let fixture = Fixture::new(d1(), timers);

    let now = SystemTime::now();
    let stale = time::to_millis(now) - 120_000;
    deposit_received(fixture.spool(), "old", stale).await;
    deposit(fixture.spool(), "fresh").await;

    let task = fixture.queue.get_next(now).await.unwrap();
    assert_eq!(task.publish_id().as_str(), "fresh");

    let remaining = fixture.spool().list_pending().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].publish_id().as_str(), "fresh");
}

#[tokio::test]
async fn test_non_retryable_rejection_drops_entry() {
    let fixture = Fixture::new(d1().non_retryable(), scenario_timers());
    deposit(fixture.spool(), "pub1").await;
    deposit(fixture.spool(), "pub2").await;

    let now = SystemTime::now();
    let task = fixture.queue.get_next(now).await.unwrap();
    assert!(
        fixture
            .queue
            .record_failure(&task, &DeliveryError::from_status(404), now)
            .await
    );

    let status = fixture.queue.status(now).await;
    assert_eq!(status.pending, 1);
    assert!(!status.failed);

    // A transient failure still backs off
    let task = fixture.queue.get_next(now).await.unwrap();
    assert_eq!(task.publish_id().as_str(), "pub2");
    fixture.queue.record_failure(&task, &unavailable(), now).await;
    let status = fixture.queue.status(now).await;
    assert_eq!(status.pending, 1);
    assert!(status.backing_off);
}

#[tokio::test]
async fn test_retryable_rejection_backs_off() {
    let fixture = Fixture::new(d1(), scenario_timers());
    deposit(fixture.spool(), "pub1").await;

    let now = SystemTime::now();
    let task = fixture.queue.get_next(now).await.unwrap();
    fixture
        .queue
        .record_failure(&task, &DeliveryError::from_status(403), now)
        .await;

    let status = fixture.queue.status(now).await;
    assert_eq!(status.pending, 1);
    assert!(status.backing_off);
    assert!(status.last_error.unwrap().contains("403"));
}

#[tokio::test]
async fn test_cancel_pending_entry() {
    let fixture = Fixture::new(d1(), Timers::default());
    deposit(fixture.spool(), "pub1").await;
    deposit(fixture.spool(), "pub2").await;

    let removed = fixture
        .queue
        .cancel_task(&PublishId::new("pub1").unwrap())
        .await;
    assert_eq!(removed, 1);

    let missing = fixture
        .queue
        .cancel_task(&PublishId::new("nope").unwrap())
        .await;
    assert_eq!(missing, 0);

    let task = fixture.queue.get_next(SystemTime::now()).await.unwrap();
    assert_eq!(task.publish_id().as_str(), "pub2");
}

#[tokio::test]
async fn test_outcome_after_cancel_is_ignored() {
    let fixture = Fixture::new(d1(), scenario_timers());
    deposit(fixture.spool(), "pub1").await;

    let now = SystemTime::now();
    let task = fixture.queue.get_next(now).await.unwrap();
    assert_eq!(fixture.queue.cancel_task(task.publish_id()).await, 1);

    assert!(!fixture.queue.record_failure(&task, &unavailable(), now).await);
    assert!(
        !fixture
            .queue
            .record_success(&task, 204, Duration::ZERO)
            .await
    );

    let status = fixture.queue.status(now).await;
    assert!(!status.failed);
    assert_eq!(status.pending, 0);
    assert_eq!(status.in_flight, 0);
}

#[tokio::test]
async fn test_reset_clears_backoff() {
    let fixture = Fixture::new(d1(), scenario_timers());
    deposit(fixture.spool(), "pub1").await;

    let now = SystemTime::now();
    let task = fixture.queue.get_next(now).await.unwrap();
    fixture.queue.record_failure(&task, &unavailable(), now).await;
    assert!(fixture.queue.is_backing_off(now));

    fixture.queue.reset_queue();
    assert!(!fixture.queue.is_backing_off(now));
    assert!(fixture.queue.get_next(now).await.is_some());
}

#[tokio::test]
async fn test_abandoned_task_is_handed_out_again() {
    let fixture = Fixture::new(d1(), Timers::default());
    deposit(fixture.spool(), "pub1").await;

    let now = SystemTime::now();
    let task = fixture.queue.get_next(now).await.unwrap();
    fixture.queue.abandon(&task);

    let again = fixture.queue.get_next(now).await.unwrap();
    assert_eq!(again, task);
}

#[tokio::test]
async fn test_unreadable_metadata_is_skipped() {
    let fixture = Fixture::new(d1(), Timers::default());
    let dir = fixture.spool().path().to_path_buf();
    std::fs::write(dir.join("00001.broken"), b"payload").unwrap();
    std::fs::write(dir.join("00001.broken.M"), [0xff, 0xff, 0xff]).unwrap();
    place(&dir, "00002.pub2", "pub2");

    let task = fixture.queue.get_next(SystemTime::now()).await.unwrap();
    assert_eq!(task.publish_id().as_str(), "pub2");
}

#[tokio::test]
async fn test_redirect_is_learned_and_reused() {
    let destination = d1().with_flags(DestinationFlags {
        follow_redirects: true,
        ..DestinationFlags::default()
    });
    let fixture = Fixture::new(destination, Timers::default());
    deposit(fixture.spool(), "pub1").await;
    deposit(fixture.spool(), "pub2").await;

    let now = SystemTime::now();
    let task = fixture.queue.get_next(now).await.unwrap();
    let redirected = fixture
        .queue
        .follow_redirect(&task, 301, "https://new.example.com/feed/pub1", 5, now)
        .await
        .unwrap();
    assert_eq!(redirected.target_url(), "https://new.example.com/feed/pub1");
    assert_eq!(fixture.redirects.lookup("42", BASE, now), "https://new.example.com/feed");

    fixture
        .queue
        .record_success(&redirected, 204, Duration::ZERO)
        .await;

    let next = fixture.queue.get_next(now).await.unwrap();
    assert!(next.from_redirect());
    assert_eq!(next.target_url(), "https://new.example.com/feed/pub2");

    // Failing against the learned target forgets it
    fixture.queue.record_failure(&next, &unavailable(), now).await;
    assert_eq!(fixture.redirects.lookup("42", BASE, now), BASE);
}

#[tokio::test]
async fn test_redirect_without_follow_is_a_failure() {
    let fixture = Fixture::new(d1(), Timers::default());
    deposit(fixture.spool(), "pub1").await;

    let now = SystemTime::now();
    let task = fixture.queue.get_next(now).await.unwrap();
    let error = fixture
        .queue
        .follow_redirect(&task, 302, "https://new.example.com/feed/pub1", 5, now)
        .await
        .unwrap_err();
    assert!(error.is_transient());
    assert!(fixture.redirects.is_empty());
}

#[tokio::test]
async fn test_redirect_limits() {
    let destination = d1().with_flags(DestinationFlags {
        follow_redirects: true,
        ..DestinationFlags::default()
    });
    let fixture = Fixture::new(destination, Timers::default());
    deposit(fixture.spool(), "pub1").await;

    let now = SystemTime::now();
    let task = fixture.queue.get_next(now).await.unwrap();

    let unusable = fixture
        .queue
        .follow_redirect(&task, 301, "https://new.example.com/elsewhere", 5, now)
        .await
        .unwrap_err();
    assert!(unusable.to_string().contains("Unusable redirect"));

    let once = fixture
        .queue
        .follow_redirect(&task, 301, "/a/pub1", 1, now)
        .await
        .unwrap();
    let too_many = fixture
        .queue
        .follow_redirect(&once, 301, "/b/pub1", 1, now)
        .await
        .unwrap_err();
    assert!(too_many.to_string().contains("Too many redirects"));
}

#[tokio::test]
async fn test_node_destination_is_relayed() {
    let destination = DestinationInfo::node("n3", "n3", "https://n3:8443/internal/publish");
    let snapshot = routed_snapshot(
        &["n1", "n2", "n3"],
        vec![Hop::new("n1", "n3", "n2")],
        vec![destination],
    );
    let fixture = Fixture::with_snapshot("n3", snapshot);
    deposit(fixture.spool(), "pub1").await;

    let task = fixture.queue.get_next(SystemTime::now()).await.unwrap();
    assert_eq!(task.target_url(), "https://n2:8443/internal/publish/pub1");
    assert!(!task.from_redirect());
}

#[tokio::test]
async fn test_unreachable_node_is_delivered_directly() {
    let destination = DestinationInfo::node("n3", "n3", "https://n3/internal/publish");
    // The hop is invalid (via is unknown), so there is no next hop
    let snapshot = routed_snapshot(
        &["n1", "n3"],
        vec![Hop::new("n1", "n3", "n9")],
        vec![destination],
    );
    let fixture = Fixture::with_snapshot("n3", snapshot);
    deposit(fixture.spool(), "pub1").await;

    let task = fixture.queue.get_next(SystemTime::now()).await.unwrap();
    assert_eq!(task.target_url(), "https://n3/internal/publish/pub1");
}

#[tokio::test]
async fn test_fairness_window() {
    let timers = Timers {
        fair_file_limit: 2,
        ..Timers::default()
    };
    let fixture = Fixture::new(d1(), timers);
    for id in ["pub1", "pub2", "pub3"] {
        deposit(fixture.spool(), id).await;
    }

    let now = SystemTime::now();
    fixture.queue.start_turn(now);
    assert!(!fixture.queue.should_yield(now));

    fixture.queue.get_next(now).await.unwrap();
    assert!(!fixture.queue.should_yield(now));
    fixture.queue.get_next(now).await.unwrap();
    assert!(fixture.queue.should_yield(now));

    fixture.queue.end_turn(7);
    assert_eq!(fixture.queue.last_turn(), 7);
    fixture.queue.start_turn(now);
    assert!(!fixture.queue.should_yield(now));
}

#[tokio::test]
async fn test_removed_destination_yields_nothing() {
    let fixture = Fixture::with_snapshot("gone", snapshot(vec![d1()], Timers::default()));
    deposit(fixture.spool(), "pub1").await;

    let now = SystemTime::now();
    assert!(fixture.queue.peek_next(now).await.is_some());
    assert!(fixture.queue.get_next(now).await.is_none());
}
