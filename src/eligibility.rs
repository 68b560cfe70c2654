//! Eligibility gate: quota, cooldown, and lifecycle checks run
//! before a worker is offered to the selector. The predicate itself is a
//! pure function of a worker snapshot plus two store-derived timestamps, so
//! it is unit-testable without a database; `check` wires it to the store.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::models::{Settings, Worker};
use crate::store::ProgressStore;

const HARD_CODED_GAP_SECS: i64 = 900;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EligibilityFailure {
    Inactive,
    SoftDeleted,
    MissingCredentials,
    RateLimited { until: DateTime<Utc> },
    FollowingCapReached,
    DailyCapReached,
    /// The per-worker gap has not yet elapsed; carries the remaining wait.
    GapNotElapsed { wait: ChronoDuration },
    PendingNotDue { scheduled_for: DateTime<Utc> },
}

impl EligibilityFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            EligibilityFailure::Inactive => "inactive",
            EligibilityFailure::SoftDeleted => "soft_deleted",
            EligibilityFailure::MissingCredentials => "missing_credentials",
            EligibilityFailure::RateLimited { .. } => "rate_limited",
            EligibilityFailure::FollowingCapReached => "following_cap_reached",
            EligibilityFailure::DailyCapReached => "daily_cap_reached",
            EligibilityFailure::GapNotElapsed { .. } => "gap_not_elapsed",
            EligibilityFailure::PendingNotDue { .. } => "pending_not_due",
        }
    }
}

/// The effective per-worker gap: the stricter (larger) of the hard-coded
/// 900s window and the settings-configured interval (open question,
/// resolved in favor of "stricter always dominates").
fn effective_gap(settings: &Settings) -> ChronoDuration {
    let configured = ChronoDuration::minutes(settings.interval_minutes as i64);
    let hard_coded = ChronoDuration::seconds(HARD_CODED_GAP_SECS);
    configured.max(hard_coded)
}

/// Pure eligibility predicate. `last_completed_followed_at` and
/// `earliest_pending_scheduled_for` are the store-derived facts the caller
/// must supply.
pub fn is_eligible(
    worker: &Worker,
    settings: &Settings,
    now: DateTime<Utc>,
    last_completed_followed_at: Option<DateTime<Utc>>,
    earliest_pending_scheduled_for: Option<DateTime<Utc>>,
) -> Result<(), EligibilityFailure> {
    if worker.is_soft_deleted() {
        return Err(EligibilityFailure::SoftDeleted);
    }
    if !worker.is_active {
        return Err(EligibilityFailure::Inactive);
    }
    if !worker.has_session_credentials() || !worker.has_oauth_credentials() {
        return Err(EligibilityFailure::MissingCredentials);
    }
    if let Some(until) = worker.rate_limit_until {
        if until > now {
            return Err(EligibilityFailure::RateLimited { until });
        }
    }
    if worker.following_count >= settings.max_following {
        return Err(EligibilityFailure::FollowingCapReached);
    }
    if worker.daily_follows >= settings.max_follows_per_day {
        return Err(EligibilityFailure::DailyCapReached);
    }
    if let Some(last) = last_completed_followed_at {
        let gap = effective_gap(settings);
        let elapsed = now - last;
        if elapsed < gap {
            return Err(EligibilityFailure::GapNotElapsed { wait: gap - elapsed });
        }
    }
    if let Some(scheduled_for) = earliest_pending_scheduled_for {
        if scheduled_for > now {
            return Err(EligibilityFailure::PendingNotDue { scheduled_for });
        }
    }

    Ok(())
}

/// Wires `is_eligible` to the store for the scheduler loop.
pub async fn check(
    store: &ProgressStore,
    worker: &Worker,
    settings: &Settings,
    now: DateTime<Utc>,
) -> Result<(), EligibilityFailure> {
    let last_completed = store
        .last_completed_followed_at(worker.id)
        .await
        .map_err(|_| EligibilityFailure::MissingCredentials)?;
    let earliest_pending = store
        .earliest_pending_scheduled_for(worker.id)
        .await
        .map_err(|_| EligibilityFailure::MissingCredentials)?;

    is_eligible(worker, settings, now, last_completed, earliest_pending)
}
