//! Pure scheduling decisions. Nothing in here touches the clock's
//! surroundings or the history file; both decisions are plain functions of
//! their inputs so they can be pinned down in tests with a fixed `now`.

use chrono::{DateTime, Duration, Utc};

/// Seconds of slack applied to the checkin interval, so an external
/// scheduler firing slightly off-beat does not push every checkin a full
/// cadence later.
pub const CHECKIN_TOLERANCE_SECS: i64 = 15;

/// A plugin within this many seconds of its due time counts as due. The
/// invoking scheduler rarely lands exactly on the interval boundary; without
/// the fuzz a plugin due at T would be skipped at T-5s and not seen again
/// until T+interval.
pub const PLUGIN_FUZZ_SECS: i64 = 30;

pub fn should_checkin(
    last_checkin: Option<DateTime<Utc>>,
    interval_minutes: Option<u32>,
    has_new_plan: bool,
    force: bool,
) -> bool {
    should_checkin_at(Utc::now(), last_checkin, interval_minutes, has_new_plan, force)
}

pub fn should_run_plugin(last_run: Option<DateTime<Utc>>, interval_minutes: u32) -> bool {
    should_run_plugin_at(Utc::now(), last_run, interval_minutes)
}

fn should_checkin_at(
    now: DateTime<Utc>,
    last_checkin: Option<DateTime<Utc>>,
    interval_minutes: Option<u32>,
    has_new_plan: bool,
    force: bool,
) -> bool {
    if force || has_new_plan {
        return true;
    }
    let (Some(last), Some(minutes)) = (last_checkin, interval_minutes) else {
        return true;
    };
    // Fail open on arithmetic trouble: a checkin too many beats silently
    // stalling forever.
    let Some(interval) = Duration::try_minutes(i64::from(minutes)) else {
        return true;
    };
    let elapsed = now.signed_duration_since(last).abs();
    elapsed + Duration::seconds(CHECKIN_TOLERANCE_SECS) >= interval
}

fn should_run_plugin_at(
    now: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
    interval_minutes: u32,
) -> bool {
    let Some(last) = last_run else {
        return true;
    };
    let Some(interval) = Duration::try_minutes(i64::from(interval_minutes)) else {
        return true;
    };
    match last.checked_add_signed(interval - Duration::seconds(PLUGIN_FUZZ_SECS)) {
        Some(earliest) => now >= earliest,
        None => true,
    }
}
