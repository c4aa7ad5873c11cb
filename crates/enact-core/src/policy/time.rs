use super::{policy, Policy};
use crate::models::PolicyResult;
use chrono::{Timelike, Utc};

/// Allow runs only while the current UTC hour is in `[start, end)`. A window
/// with `start > end` wraps midnight, e.g. `22..2`.
pub fn within_maintenance_window(start_hour_utc: u32, end_hour_utc: u32) -> Policy {
    policy(move |_| window_check(start_hour_utc, end_hour_utc, Utc::now().hour()))
}

fn window_check(start: u32, end: u32, hour: u32) -> PolicyResult {
    let inside = if start <= end {
        start <= hour && hour < end
    } else {
        hour >= start || hour < end
    };
    PolicyResult::check(
        "within_maintenance_window",
        inside,
        format!(
            "Current hour {hour} UTC is {} window {start:02}:00-{end:02}:00 UTC",
            if inside { "inside" } else { "outside" }
        ),
    )
}
