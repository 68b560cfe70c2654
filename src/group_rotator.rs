//! Group rotator: time-of-day partitioning of the fleet.
//!
//! The active-group formula is computed two different ways in the original
//! (`current_hour // H` in one place, `round(current_hour / (24/G)) mod G`
//! in another — see Open Questions). We adopt the rounding form
//! consistently, as DESIGN.md records.

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};

use crate::store::ProgressStore;

/// `round(hour / (24/G)) mod G`, the sole active-group formula.
pub fn active_group(hour_utc: u32, schedule_groups: i32) -> i32 {
    let groups = schedule_groups.max(1) as f64;
    let window = 24.0 / groups;
    let raw = (hour_utc as f64 / window).round() as i64;
    (raw.rem_euclid(schedule_groups.max(1) as i64)) as i32
}

/// The UTC instant at which `group` next starts, given `now`.
/// `hours_per_group` is `round(24/G)`.
pub fn next_group_start(now: DateTime<Utc>, group: i32, hours_per_group: i32) -> DateTime<Utc> {
    let start_hour = (group as i64 * hours_per_group as i64).rem_euclid(24) as u32;
    let mut candidate = now
        .date_naive()
        .and_hms_opt(start_hour, 0, 0)
        .expect("valid hour")
        .and_utc();
    if candidate <= now {
        candidate += ChronoDuration::days(1);
    }
    candidate
}

/// Rotator state held by the scheduler loop.
#[derive(Debug, Clone, Copy)]
pub struct RotatorState {
    pub current_group: Option<i32>,
    pub next_group_start: Option<DateTime<Utc>>,
}

impl Default for RotatorState {
    fn default() -> Self {
        Self { current_group: None, next_group_start: None }
    }
}

/// Recomputes the active group for `now` and, on a transition, reassigns
/// every active worker's group field. Returns `true` if a
/// transition occurred.
pub async fn tick(
    state: &mut RotatorState,
    store: &ProgressStore,
    now: DateTime<Utc>,
    schedule_groups: i32,
) -> Result<bool, sqlx::Error> {
    let hours_per_group = (24.0 / schedule_groups.max(1) as f64).round() as i32;
    let g = active_group(now.hour(), schedule_groups);

    if state.current_group == Some(g) {
        return Ok(false);
    }

    state.current_group = Some(g);
    state.next_group_start = Some(next_group_start(now, (g + 1) % schedule_groups.max(1), hours_per_group));
    store.reassign_active_workers_to_group(g).await?;
    Ok(true)
}
