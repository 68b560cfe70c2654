//! Integration tests for the progress store against a real Postgres
//! instance. Exercises the invariants that need a database: at-most-one
//! in-flight row per pair, daily cap, follow-count cap, terminal stability,
//! and the exclusion join the target selector relies on.

use chrono::{Duration as ChronoDuration, Utc};
use follow_fleet::errors::FollowOutcome;
use follow_fleet::models::{PoolTag, ProgressMeta};
use follow_fleet::selector::select_targets_for_worker;
use follow_fleet::store::ProgressStore;
use sqlx::PgPool;

async fn insert_worker(pool: &PgPool, handle: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(
        "INSERT INTO workers (handle, auth_cookie, csrf_cookie, user_agent, consumer_key, \
         consumer_secret, bearer_token, access_token, access_secret, proxy_host, proxy_port, \
         proxy_username, proxy_password, is_active) \
         VALUES ($1, 'auth', 'csrf', 'ua', 'ck', 'cs', 'bt', '111-tok', 'as', 'proxy.example.com', \
         8080, 'u', 'p', true) RETURNING id",
    )
    .bind(handle)
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn insert_target(pool: &PgPool, handle: &str, pool_tag: PoolTag) -> i64 {
    sqlx::query_scalar::<_, i64>(
        "INSERT INTO follow_targets (handle, pool) VALUES ($1, $2) RETURNING id",
    )
    .bind(handle)
    .bind(pool_tag)
    .fetch_one(pool)
    .await
    .unwrap()
}

fn fixture_meta() -> ProgressMeta {
    ProgressMeta { group: Some(0), attempt: 0, duration_ms: None, timestamp: Some(Utc::now()) }
}

#[sqlx::test(migrations = "./migrations")]
async fn create_pending_rejects_a_second_concurrent_selection(pool: PgPool) {
    let store = ProgressStore::new(pool.clone());
    let worker_id = insert_worker(&pool, "w1").await;
    let target_id = insert_target(&pool, "target_a", PoolTag::External).await;

    let first = store
        .create_pending(worker_id, target_id, Utc::now(), &fixture_meta())
        .await
        .unwrap();
    let second = store
        .create_pending(worker_id, target_id, Utc::now(), &fixture_meta())
        .await
        .unwrap();

    assert!(first.is_some(), "first selection for an untouched pair must succeed");
    assert!(second.is_none(), "second concurrent selection must not double-pick the target");
}

#[sqlx::test(migrations = "./migrations")]
async fn record_outcome_ok_bumps_counters_exactly_once(pool: PgPool) {
    let store = ProgressStore::new(pool.clone());
    let worker_id = insert_worker(&pool, "w1").await;
    let target_id = insert_target(&pool, "target_a", PoolTag::External).await;

    let progress_id = store
        .create_pending(worker_id, target_id, Utc::now(), &fixture_meta())
        .await
        .unwrap()
        .unwrap();
    store.mark_in_progress(progress_id).await.unwrap();
    store.record_outcome(worker_id, progress_id, &FollowOutcome::Ok).await.unwrap();

    let worker = store.get_worker(worker_id).await.unwrap();
    assert_eq!(worker.daily_follows, 1);
    assert_eq!(worker.following_count, 1);
    assert_eq!(worker.total_follows, 1);
    assert!(worker.last_followed_at.is_some());

    let state: String = sqlx::query_scalar("SELECT state FROM follow_progress WHERE id = $1")
        .bind(progress_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(state, "completed");
}

#[sqlx::test(migrations = "./migrations")]
async fn completed_row_never_transitions_again(pool: PgPool) {
    let store = ProgressStore::new(pool.clone());
    let worker_id = insert_worker(&pool, "w1").await;
    let target_id = insert_target(&pool, "target_a", PoolTag::External).await;

    let progress_id = store
        .create_pending(worker_id, target_id, Utc::now(), &fixture_meta())
        .await
        .unwrap()
        .unwrap();
    store.mark_in_progress(progress_id).await.unwrap();
    store.record_outcome(worker_id, progress_id, &FollowOutcome::Ok).await.unwrap();

    // mark_in_progress only transitions rows still in `pending`; it must be a
    // no-op against an already-completed row.
    store.mark_in_progress(progress_id).await.unwrap();
    let state: String = sqlx::query_scalar("SELECT state FROM follow_progress WHERE id = $1")
        .bind(progress_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(state, "completed");
}

#[sqlx::test(migrations = "./migrations")]
async fn record_outcome_rate_limited_sets_cooldown_and_deactivates(pool: PgPool) {
    let store = ProgressStore::new(pool.clone());
    let worker_id = insert_worker(&pool, "w1").await;
    let target_id = insert_target(&pool, "target_a", PoolTag::External).await;

    let progress_id = store
        .create_pending(worker_id, target_id, Utc::now(), &fixture_meta())
        .await
        .unwrap()
        .unwrap();
    store.mark_in_progress(progress_id).await.unwrap();
    store.record_outcome(worker_id, progress_id, &FollowOutcome::RateLimited).await.unwrap();

    let worker = store.get_worker(worker_id).await.unwrap();
    assert!(!worker.is_active, "rate limit must deactivate the worker until cleared");
    let until = worker.rate_limit_until.expect("rate_limit_until must be set");
    let delta = until - Utc::now();
    assert!(delta > ChronoDuration::minutes(14) && delta <= ChronoDuration::minutes(15));
}

#[sqlx::test(migrations = "./migrations")]
async fn fifth_consecutive_non_rate_limit_failure_deactivates_worker(pool: PgPool) {
    let store = ProgressStore::new(pool.clone());
    let worker_id = insert_worker(&pool, "w1").await;

    for i in 0..5 {
        let target_id = insert_target(&pool, &format!("target_{i}"), PoolTag::External).await;
        let progress_id = store
            .create_pending(worker_id, target_id, Utc::now(), &fixture_meta())
            .await
            .unwrap()
            .unwrap();
        store.mark_in_progress(progress_id).await.unwrap();
        store
            .record_outcome(worker_id, progress_id, &FollowOutcome::ApiError("odd state".into()))
            .await
            .unwrap();

        let worker = store.get_worker(worker_id).await.unwrap();
        if i < 4 {
            assert!(worker.is_active, "must stay active before the 5th failure");
        } else {
            assert!(!worker.is_active, "must deactivate on the 5th consecutive failure");
        }
    }
}

#[sqlx::test(migrations = "./migrations")]
async fn daily_reset_zeroes_active_workers_only(pool: PgPool) {
    let store = ProgressStore::new(pool.clone());
    let active = insert_worker(&pool, "active").await;
    let inactive = insert_worker(&pool, "inactive").await;
    sqlx::query("UPDATE workers SET daily_follows = 3 WHERE id = ANY($1)")
        .bind(&[active, inactive][..])
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("UPDATE workers SET is_active = false WHERE id = $1")
        .bind(inactive)
        .execute(&pool)
        .await
        .unwrap();

    let reset_count = store.daily_reset().await.unwrap();
    assert_eq!(reset_count, 1);

    let active_daily: i32 = sqlx::query_scalar("SELECT daily_follows FROM workers WHERE id = $1")
        .bind(active)
        .fetch_one(&pool)
        .await
        .unwrap();
    let inactive_daily: i32 = sqlx::query_scalar("SELECT daily_follows FROM workers WHERE id = $1")
        .bind(inactive)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(active_daily, 0);
    assert_eq!(inactive_daily, 3, "daily_reset must not touch inactive workers");
}

/// A worker with a completed row against `A` must never be offered `A`
/// again, even when `A` is the only internal-pool candidate.
#[sqlx::test(migrations = "./migrations")]
async fn selector_excludes_previously_attempted_targets(pool: PgPool) {
    let store = ProgressStore::new(pool.clone());
    let worker_id = insert_worker(&pool, "w1").await;
    let target_a = insert_target(&pool, "A", PoolTag::Internal).await;

    let progress_id = store
        .create_pending(worker_id, target_a, Utc::now(), &fixture_meta())
        .await
        .unwrap()
        .unwrap();
    store.mark_in_progress(progress_id).await.unwrap();
    store.record_outcome(worker_id, progress_id, &FollowOutcome::Ok).await.unwrap();

    let mut settings = store.get_settings().await.unwrap();
    settings.max_follows_per_interval = 1;
    settings.internal_ratio = 1.0;
    settings.external_ratio = 0.0;

    let selected = select_targets_for_worker(&store, worker_id, "w1", 0, &settings, 0)
        .await
        .unwrap();
    assert!(
        selected.iter().all(|(t, _)| t.id != target_a),
        "selector must never re-offer an already-completed target"
    );
    assert!(selected.is_empty(), "the only internal candidate is excluded, so nothing is left to offer");
}

#[sqlx::test(migrations = "./migrations")]
async fn candidate_targets_excludes_own_handle(pool: PgPool) {
    let store = ProgressStore::new(pool.clone());
    let worker_id = insert_worker(&pool, "self_handle").await;
    insert_target(&pool, "self_handle", PoolTag::Internal).await;
    let other = insert_target(&pool, "other_handle", PoolTag::Internal).await;

    let candidates = store
        .candidate_targets(worker_id, "self_handle", PoolTag::Internal, 10)
        .await
        .unwrap();

    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].id, other);
}

#[sqlx::test(migrations = "./migrations")]
async fn schedule_future_writes_pending_rows_at_stride_offsets(pool: PgPool) {
    let store = ProgressStore::new(pool.clone());
    let worker_id = insert_worker(&pool, "w1").await;
    let target_a = insert_target(&pool, "A", PoolTag::Internal).await;
    let target_b = insert_target(&pool, "B", PoolTag::External).await;

    let start = Utc::now() + ChronoDuration::minutes(16);
    let stride = ChronoDuration::minutes(16);
    let horizon = Utc::now() + ChronoDuration::hours(24);
    store
        .schedule_future(
            worker_id,
            &[(target_a, PoolTag::Internal), (target_b, PoolTag::External)],
            start,
            stride,
            horizon,
            0,
        )
        .await
        .unwrap();

    let count: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM follow_progress WHERE worker_id = $1 AND state = 'pending'",
    )
    .bind(worker_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(count, 2);
}

#[sqlx::test(migrations = "./migrations")]
async fn schedule_future_stops_at_the_horizon(pool: PgPool) {
    let store = ProgressStore::new(pool.clone());
    let worker_id = insert_worker(&pool, "w1").await;
    let target_a = insert_target(&pool, "A", PoolTag::Internal).await;
    let target_b = insert_target(&pool, "B", PoolTag::External).await;

    let start = Utc::now() + ChronoDuration::minutes(16);
    let stride = ChronoDuration::minutes(16);
    // Horizon falls before the second slot (start + stride), so only one row
    // should be written even though two candidates were supplied.
    let horizon = start + ChronoDuration::minutes(1);
    store
        .schedule_future(
            worker_id,
            &[(target_a, PoolTag::Internal), (target_b, PoolTag::External)],
            start,
            stride,
            horizon,
            0,
        )
        .await
        .unwrap();

    let count: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM follow_progress WHERE worker_id = $1 AND state = 'pending'",
    )
    .bind(worker_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(count, 1);
}
