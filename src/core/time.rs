//! Report timestamps.

use std::time::{SystemTime, UNIX_EPOCH};

/// Environment variable that pins report timestamps for reproducible output.
pub const SOURCE_DATE_EPOCH: &str = "SOURCE_DATE_EPOCH";

/// Returns unix-epoch seconds with `Z` suffix (e.g. `1771220592Z`).
pub fn now_epoch_z() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{}Z", secs)
}

/// `SOURCE_DATE_EPOCH` when set to a valid epoch, otherwise the clock.
pub fn report_timestamp() -> String {
    let pinned = std::env::var(SOURCE_DATE_EPOCH).ok();
    pinned_epoch_z(pinned.as_deref()).unwrap_or_else(now_epoch_z)
}

fn pinned_epoch_z(raw: Option<&str>) -> Option<String> {
    let secs = raw?.trim().parse::<u64>().ok()?;
    Some(format!("{}Z", secs))
}
