//! Progress store: persistence of `Worker`/`FollowTarget`/
//! `FollowProgress`/`Settings` over `sqlx::PgPool`. Every mutation that
//! touches a Worker row opens a transaction and takes `SELECT ... FOR
//! UPDATE` on that row first, so concurrent updates to one worker's pacing
//! state serialize.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::{PgPool, Row};

use crate::errors::FollowOutcome;
use crate::models::{FollowProgress, FollowTarget, PoolTag, ProgressMeta, Settings, Worker};

const RATE_LIMIT_COOLDOWN_MINUTES: i64 = 15;
const MAX_FAILED_ATTEMPTS: i32 = 5;

#[derive(Clone)]
pub struct ProgressStore {
    pool: PgPool,
}

impl ProgressStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn get_settings(&self) -> Result<Settings, sqlx::Error> {
        sqlx::query_as::<_, Settings>(
            "SELECT max_follows_per_day, max_follows_per_interval, interval_minutes, \
             min_following, max_following, schedule_groups, schedule_hours, \
             internal_ratio, external_ratio, is_active, last_updated \
             FROM follow_settings LIMIT 1",
        )
        .fetch_one(&self.pool)
        .await
    }

    /// All active, non-deleted workers whose recorded group assignment
    /// matches `group`.
    pub async fn workers_in_group(&self, group: i32) -> Result<Vec<Worker>, sqlx::Error> {
        let all_active = self.active_workers().await?;
        Ok(all_active
            .into_iter()
            .filter(|w| w.group() == Some(group))
            .collect())
    }

    pub async fn active_workers(&self) -> Result<Vec<Worker>, sqlx::Error> {
        sqlx::query_as::<_, Worker>(
            "SELECT * FROM workers WHERE is_active = true AND deleted_at IS NULL",
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn get_worker(&self, worker_id: i64) -> Result<Worker, sqlx::Error> {
        sqlx::query_as::<_, Worker>("SELECT * FROM workers WHERE id = $1")
            .bind(worker_id)
            .fetch_one(&self.pool)
            .await
    }

    /// Targets from one pool excluding the worker's own handle and any
    /// target with an existing progress row for this worker in any state.
    pub async fn candidate_targets(
        &self,
        worker_id: i64,
        own_handle: &str,
        pool: PoolTag,
        limit: i64,
    ) -> Result<Vec<FollowTarget>, sqlx::Error> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        sqlx::query_as::<_, FollowTarget>(
            "SELECT ft.* FROM follow_targets ft \
             WHERE ft.pool = $1 AND ft.handle <> $2 \
             AND NOT EXISTS ( \
                 SELECT 1 FROM follow_progress fp \
                 WHERE fp.worker_id = $3 AND fp.target_id = ft.id \
             ) \
             ORDER BY random() LIMIT $4",
        )
        .bind(pool)
        .bind(own_handle)
        .bind(worker_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    /// Inserts one `pending` row for (worker, target), guarded against a
    /// concurrent selector picking the same target:
    /// the precondition "no non-terminal row exists" is checked and the
    /// insert performed in the same transaction.
    pub async fn create_pending(
        &self,
        worker_id: i64,
        target_id: i64,
        scheduled_for: DateTime<Utc>,
        meta: &ProgressMeta,
    ) -> Result<Option<i64>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT 1 FROM follow_progress \
             WHERE worker_id = $1 AND target_id = $2 \
             AND state IN ('pending', 'in_progress') FOR UPDATE",
        )
        .bind(worker_id)
        .bind(target_id)
        .fetch_optional(&mut *tx)
        .await?;

        if existing.is_some() {
            tx.rollback().await?;
            return Ok(None);
        }

        let meta_json = serde_json::to_value(meta).unwrap_or(serde_json::Value::Null);
        let row = sqlx::query(
            "INSERT INTO follow_progress (worker_id, target_id, state, scheduled_for, meta) \
             VALUES ($1, $2, 'pending', $3, $4) RETURNING id",
        )
        .bind(worker_id)
        .bind(target_id)
        .bind(scheduled_for)
        .bind(meta_json)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(row.get::<i64, _>("id")))
    }

    pub async fn mark_in_progress(&self, progress_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE follow_progress SET state = 'in_progress', started_at = now() \
             WHERE id = $1 AND state = 'pending'",
        )
        .bind(progress_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records a terminal outcome for `progress_id` and updates the owning
    /// worker's pacing counters, all under one row-level lock.
    pub async fn record_outcome(
        &self,
        worker_id: i64,
        progress_id: i64,
        outcome: &FollowOutcome,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT * FROM workers WHERE id = $1 FOR UPDATE")
            .bind(worker_id)
            .fetch_one(&mut *tx)
            .await?;

        match outcome {
            FollowOutcome::Ok => {
                sqlx::query(
                    "UPDATE follow_progress SET state = 'completed', finished_at = now(), \
                     followed_at = now() WHERE id = $1",
                )
                .bind(progress_id)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "UPDATE workers SET daily_follows = daily_follows + 1, \
                     following_count = following_count + 1, total_follows = total_follows + 1, \
                     last_followed_at = now(), failed_follow_attempts = 0 WHERE id = $1",
                )
                .bind(worker_id)
                .execute(&mut *tx)
                .await?;
            }
            FollowOutcome::RateLimited => {
                sqlx::query(
                    "UPDATE follow_progress SET state = 'failed', finished_at = now(), \
                     error = 'rate_limited' WHERE id = $1",
                )
                .bind(progress_id)
                .execute(&mut *tx)
                .await?;

                let cooldown_until = Utc::now() + ChronoDuration::minutes(RATE_LIMIT_COOLDOWN_MINUTES);
                sqlx::query(
                    "UPDATE workers SET rate_limit_until = $2, is_active = false WHERE id = $1",
                )
                .bind(worker_id)
                .bind(cooldown_until)
                .execute(&mut *tx)
                .await?;
            }
            other => {
                sqlx::query(
                    "UPDATE follow_progress SET state = 'failed', finished_at = now(), \
                     error = $2 WHERE id = $1",
                )
                .bind(progress_id)
                .bind(other.to_string())
                .execute(&mut *tx)
                .await?;

                let row = sqlx::query(
                    "UPDATE workers SET failed_follow_attempts = failed_follow_attempts + 1 \
                     WHERE id = $1 RETURNING failed_follow_attempts",
                )
                .bind(worker_id)
                .fetch_one(&mut *tx)
                .await?;
                let failed_attempts: i32 = row.get("failed_follow_attempts");

                if failed_attempts >= MAX_FAILED_ATTEMPTS {
                    sqlx::query("UPDATE workers SET is_active = false WHERE id = $1")
                        .bind(worker_id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await
    }

    /// `daily_follows = 0` for every active worker, invoked once per UTC
    /// hour-0 transition.
    pub async fn daily_reset(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("UPDATE workers SET daily_follows = 0 WHERE is_active = true")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Writes a 24h advisory plan of future pending rows at `start,
    /// start+stride, start+2*stride, ...` until `horizon`, from fresh,
    /// never-attempted `targets` already interleaved by ratio (see
    /// `selector::fetch_horizon_candidates`/`interleave_by_ratio`) — not the
    /// targets this tick's batch just attempted, which already carry a
    /// terminal progress row.
    pub async fn schedule_future(
        &self,
        worker_id: i64,
        targets: &[(i64, PoolTag)],
        start: DateTime<Utc>,
        stride: ChronoDuration,
        horizon: DateTime<Utc>,
        group: i32,
    ) -> Result<(), sqlx::Error> {
        let mut scheduled_for = start;
        for (target_id, _pool) in targets {
            if scheduled_for >= horizon {
                break;
            }
            let meta = ProgressMeta {
                group: Some(group),
                attempt: 0,
                duration_ms: None,
                timestamp: Some(Utc::now()),
            };
            self.create_pending(worker_id, *target_id, scheduled_for, &meta)
                .await?;
            scheduled_for += stride;
        }
        Ok(())
    }

    pub async fn last_completed_followed_at(
        &self,
        worker_id: i64,
    ) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
        let row = sqlx::query_as::<_, FollowProgress>(
            "SELECT * FROM follow_progress \
             WHERE worker_id = $1 AND state = 'completed' \
             ORDER BY followed_at DESC LIMIT 1",
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|r| r.followed_at))
    }

    /// Finds the most recently created pending row for (worker, target), so
    /// the scheduler can advance it to `in_progress` after the selector has
    /// already written it.
    pub async fn find_pending_id(
        &self,
        worker_id: i64,
        target_id: i64,
    ) -> Result<Option<i64>, sqlx::Error> {
        let row = sqlx::query_as::<_, FollowProgress>(
            "SELECT * FROM follow_progress \
             WHERE worker_id = $1 AND target_id = $2 AND state = 'pending' \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(worker_id)
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.id))
    }

    pub async fn earliest_pending_scheduled_for(
        &self,
        worker_id: i64,
    ) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
        let row = sqlx::query_as::<_, FollowProgress>(
            "SELECT * FROM follow_progress \
             WHERE worker_id = $1 AND state = 'pending' \
             ORDER BY scheduled_for ASC LIMIT 1",
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.scheduled_for))
    }

    /// Activates all workers with valid credentials, assigns them to
    /// `group`, and zeroes their daily counter, in one transaction.
    pub async fn activate_all_workers(&self, group: i32) -> Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let assignment = serde_json::json!({ "group": group, "updated_at": now });

        let result = sqlx::query(
            "UPDATE workers SET is_active = true, activated_at = $2, daily_follows = 0, \
             group_assignment = $3 \
             WHERE deleted_at IS NULL AND auth_cookie IS NOT NULL AND csrf_cookie IS NOT NULL \
             AND consumer_key IS NOT NULL AND consumer_secret IS NOT NULL \
             AND access_token IS NOT NULL AND access_secret IS NOT NULL",
        )
        .bind(now)
        .bind(now)
        .bind(assignment)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    /// Deactivates all active workers in one statement.
    pub async fn deactivate_all_workers(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("UPDATE workers SET is_active = false WHERE is_active = true")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Reassigns every active worker's group field to `group`.
    pub async fn reassign_active_workers_to_group(&self, group: i32) -> Result<u64, sqlx::Error> {
        let assignment = serde_json::json!({ "group": group, "updated_at": Utc::now() });
        let result = sqlx::query(
            "UPDATE workers SET group_assignment = $1 WHERE is_active = true AND deleted_at IS NULL",
        )
        .bind(assignment)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
