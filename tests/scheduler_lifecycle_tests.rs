//! Integration tests for the scheduler orchestrator lifecycle against a
//! real Postgres instance: `start`/`stop`/`reconfigure` and the
//! worker-activation side effects they drive.

use std::sync::Arc;

use follow_fleet::metrics::SchedulerMetrics;
use follow_fleet::scheduler::Scheduler;
use follow_fleet::store::ProgressStore;
use sqlx::PgPool;

async fn insert_credentialed_worker(pool: &PgPool, handle: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(
        "INSERT INTO workers (handle, auth_cookie, csrf_cookie, user_agent, consumer_key, \
         consumer_secret, bearer_token, access_token, access_secret, proxy_host, proxy_port, \
         proxy_username, proxy_password, is_active) \
         VALUES ($1, 'auth', 'csrf', 'ua', 'ck', 'cs', 'bt', '111-tok', 'as', 'proxy.example.com', \
         8080, 'u', 'p', false) RETURNING id",
    )
    .bind(handle)
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn set_settings_active(pool: &PgPool, active: bool) {
    sqlx::query("UPDATE follow_settings SET is_active = $1").bind(active).execute(pool).await.unwrap();
}

fn new_scheduler(pool: PgPool) -> Scheduler {
    Scheduler::new(ProgressStore::new(pool), Arc::new(SchedulerMetrics::new().unwrap()))
}

#[sqlx::test(migrations = "./migrations")]
async fn start_refuses_when_settings_inactive(pool: PgPool) {
    set_settings_active(&pool, false).await;
    let scheduler = new_scheduler(pool);

    let result = scheduler.start().await;
    assert!(result.is_err());
    assert!(!scheduler.is_running().await);
}

#[sqlx::test(migrations = "./migrations")]
async fn start_activates_credentialed_workers_and_zeroes_daily_follows(pool: PgPool) {
    set_settings_active(&pool, true).await;
    let worker_id = insert_credentialed_worker(&pool, "w1").await;
    sqlx::query("UPDATE workers SET daily_follows = 7 WHERE id = $1")
        .bind(worker_id)
        .execute(&pool)
        .await
        .unwrap();

    let scheduler = new_scheduler(pool.clone());
    scheduler.start().await.unwrap();

    assert!(scheduler.is_running().await);
    let is_active: bool = sqlx::query_scalar("SELECT is_active FROM workers WHERE id = $1")
        .bind(worker_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    let daily_follows: i32 = sqlx::query_scalar("SELECT daily_follows FROM workers WHERE id = $1")
        .bind(worker_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(is_active);
    assert_eq!(daily_follows, 0);

    scheduler.stop().await.unwrap();
}

/// `start()` followed by `stop()` leaves every worker deactivated and the
/// loop task not running.
#[sqlx::test(migrations = "./migrations")]
async fn start_then_stop_deactivates_all_workers(pool: PgPool) {
    set_settings_active(&pool, true).await;
    insert_credentialed_worker(&pool, "w1").await;
    insert_credentialed_worker(&pool, "w2").await;

    let scheduler = new_scheduler(pool.clone());
    scheduler.start().await.unwrap();
    scheduler.stop().await.unwrap();

    assert!(!scheduler.is_running().await);
    let active_count: i64 = sqlx::query_scalar("SELECT count(*) FROM workers WHERE is_active = true")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(active_count, 0);
}

/// A redundant `start()` on an already-running scheduler must stop first
/// rather than double-spawning the loop task.
#[sqlx::test(migrations = "./migrations")]
async fn redundant_start_stops_before_restarting(pool: PgPool) {
    set_settings_active(&pool, true).await;
    insert_credentialed_worker(&pool, "w1").await;

    let scheduler = new_scheduler(pool.clone());
    scheduler.start().await.unwrap();
    assert!(scheduler.is_running().await);

    scheduler.start().await.unwrap();
    assert!(scheduler.is_running().await);

    scheduler.stop().await.unwrap();
}

/// `reconfigure()` with unchanged settings that keep the scheduler active
/// is a stop/start cycle that ends running again.
#[sqlx::test(migrations = "./migrations")]
async fn reconfigure_restarts_when_settings_remain_active(pool: PgPool) {
    set_settings_active(&pool, true).await;
    insert_credentialed_worker(&pool, "w1").await;

    let scheduler = new_scheduler(pool.clone());
    scheduler.start().await.unwrap();
    scheduler.reconfigure().await.unwrap();

    assert!(scheduler.is_running().await);
    scheduler.stop().await.unwrap();
}

#[sqlx::test(migrations = "./migrations")]
async fn reconfigure_stays_stopped_when_settings_turn_inactive(pool: PgPool) {
    set_settings_active(&pool, true).await;
    insert_credentialed_worker(&pool, "w1").await;

    let scheduler = new_scheduler(pool.clone());
    scheduler.start().await.unwrap();

    set_settings_active(&pool, false).await;
    scheduler.reconfigure().await.unwrap();

    assert!(!scheduler.is_running().await);
}

#[sqlx::test(migrations = "./migrations")]
async fn stop_without_start_is_a_harmless_no_op(pool: PgPool) {
    let scheduler = new_scheduler(pool);
    scheduler.stop().await.unwrap();
    assert!(!scheduler.is_running().await);
}

/// Sanity check that activation assigns the group matching the current
/// rotation formula, not an arbitrary default.
#[sqlx::test(migrations = "./migrations")]
async fn start_assigns_the_currently_active_rotation_group(pool: PgPool) {
    set_settings_active(&pool, true).await;
    sqlx::query("UPDATE follow_settings SET schedule_groups = 1").execute(&pool).await.unwrap();
    let worker_id = insert_credentialed_worker(&pool, "w1").await;

    let scheduler = new_scheduler(pool.clone());
    scheduler.start().await.unwrap();

    let store = ProgressStore::new(pool.clone());
    let worker = store.get_worker(worker_id).await.unwrap();
    assert_eq!(worker.group(), Some(0), "with a single group, every worker is group 0");

    scheduler.stop().await.unwrap();
}
