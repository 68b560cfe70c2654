//! Target selector: internal/external ratio-based target
//! selection with exclusion of already-attempted targets. The ratio math is
//! a pure function (`compute_batch_plan`/`compute_horizon_plan`) kept
//! independent of the store so it is unit-testable without a database.

use chrono::Utc;

use crate::models::{FollowTarget, PoolTag, ProgressMeta, Settings};
use crate::store::ProgressStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    pub internal_count: usize,
    pub external_count: usize,
}

impl BatchPlan {
    pub fn total(&self) -> usize {
        self.internal_count + self.external_count
    }
}

/// Splits `count` targets by `internal_frac`, guaranteeing each side at
/// least 1 once `count` is 2 or more.
fn split_by_ratio(count: i64, internal_frac: f64) -> (i64, i64) {
    if count <= 0 {
        return (0, 0);
    }

    let mut internal_count = (count as f64 * internal_frac).round() as i64;
    let mut external_count = count - internal_count;

    if count >= 2 {
        if internal_count < 1 {
            internal_count = 1;
            external_count = count - 1;
        }
        if external_count < 1 {
            external_count = 1;
            internal_count = count - 1;
        }
    }

    (internal_count.max(0), external_count.max(0))
}

/// Computes how many internal/external targets to pick this tick: cap the
/// batch at the smaller of the per-interval limit and
/// what's left of today's quota, then split by normalized ratio, each side
/// getting at least 1 once the batch is 2 or more.
pub fn compute_batch_plan(settings: &Settings, daily_follows: i32) -> BatchPlan {
    let remaining_today = (settings.max_follows_per_day - daily_follows).max(0);
    let batch = settings.max_follows_per_interval.min(remaining_today).max(0) as i64;

    let (internal_frac, _external_frac) = settings.normalized_ratios();
    let (internal_count, external_count) = split_by_ratio(batch, internal_frac);

    BatchPlan {
        internal_count: internal_count as usize,
        external_count: external_count as usize,
    }
}

/// Computes the internal/external split for the 24h advisory plan
/// (`schedule_future`): unlike `compute_batch_plan`, not capped by
/// `max_follows_per_interval` — only by what remains of the day's quota,
/// mirroring the original's `total_to_schedule = min(remaining quota,
/// available pool size)` before alternating by ratio.
pub fn compute_horizon_plan(settings: &Settings, remaining_today: i32) -> BatchPlan {
    let remaining = remaining_today.max(0) as i64;
    let (internal_frac, _external_frac) = settings.normalized_ratios();
    let (internal_count, external_count) = split_by_ratio(remaining, internal_frac);

    BatchPlan {
        internal_count: internal_count as usize,
        external_count: external_count as usize,
    }
}

/// Weaves `internal` and `external` into one sequence ordered by
/// `internal_frac`, so a 24h advisory plan alternates pools by ratio instead
/// of exhausting one pool before touching the other. At each step, takes
/// from whichever pool is furthest behind its proportional share of the
/// items taken so far (falling back to the other pool once one is
/// exhausted).
pub fn interleave_by_ratio<T>(internal: Vec<T>, external: Vec<T>, internal_frac: f64) -> Vec<T> {
    let mut result = Vec::with_capacity(internal.len() + external.len());
    let mut internal = internal.into_iter().peekable();
    let mut external = external.into_iter().peekable();
    let mut internal_taken = 0usize;
    let mut taken = 0usize;

    loop {
        let have_internal = internal.peek().is_some();
        let have_external = external.peek().is_some();
        if !have_internal && !have_external {
            break;
        }

        let target_internal = ((taken + 1) as f64 * internal_frac).round() as usize;
        let take_internal = if have_internal && have_external {
            internal_taken < target_internal
        } else {
            have_internal
        };

        if take_internal {
            result.push(internal.next().expect("peeked Some"));
            internal_taken += 1;
        } else {
            result.push(external.next().expect("peeked Some"));
        }
        taken += 1;
    }

    result
}

/// Fetches fresh, never-attempted candidates for the 24h advisory plan —
/// unlike `select_targets_for_worker`, does not write pending rows itself;
/// the caller (`schedule_future`) spaces them across the planning horizon.
pub async fn fetch_horizon_candidates(
    store: &ProgressStore,
    worker_id: i64,
    own_handle: &str,
    settings: &Settings,
    plan: BatchPlan,
) -> Result<Vec<(i64, PoolTag)>, sqlx::Error> {
    let internal = store
        .candidate_targets(worker_id, own_handle, PoolTag::Internal, plan.internal_count as i64)
        .await?;
    let external = store
        .candidate_targets(worker_id, own_handle, PoolTag::External, plan.external_count as i64)
        .await?;

    let (internal_frac, _external_frac) = settings.normalized_ratios();
    let internal: Vec<(i64, PoolTag)> = internal.into_iter().map(|t| (t.id, PoolTag::Internal)).collect();
    let external: Vec<(i64, PoolTag)> = external.into_iter().map(|t| (t.id, PoolTag::External)).collect();

    Ok(interleave_by_ratio(internal, external, internal_frac))
}

/// Picks this batch's targets for `worker`, writing one `pending` row per
/// returned target in the same call so a concurrent selection for the same
/// worker cannot double-pick. May return fewer than
/// planned if a pool is exhausted or a race loses the pending-row insert.
pub async fn select_targets_for_worker(
    store: &ProgressStore,
    worker_id: i64,
    own_handle: &str,
    daily_follows: i32,
    settings: &Settings,
    group: i32,
) -> Result<Vec<(FollowTarget, PoolTag)>, sqlx::Error> {
    let plan = compute_batch_plan(settings, daily_follows);
    if plan.total() == 0 {
        return Ok(Vec::new());
    }

    let internal = store
        .candidate_targets(worker_id, own_handle, PoolTag::Internal, plan.internal_count as i64)
        .await?;
    let external = store
        .candidate_targets(worker_id, own_handle, PoolTag::External, plan.external_count as i64)
        .await?;

    let now = Utc::now();
    let meta = ProgressMeta {
        group: Some(group),
        attempt: 0,
        duration_ms: None,
        timestamp: Some(now),
    };

    let mut selected = Vec::new();
    for target in internal.into_iter().chain(external.into_iter()) {
        let pool = target.pool;
        if store
            .create_pending(worker_id, target.id, now, &meta)
            .await?
            .is_some()
        {
            selected.push((target, pool));
        }
    }

    Ok(selected)
}
