//! Shared utility functions.

use std::time::{SystemTime, UNIX_EPOCH};

/// Get current timestamp as seconds since Unix epoch.
///
/// Returns the timestamp as a simple string (e.g., "1705312345").
pub fn current_timestamp() -> String {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    format!("{}", duration.as_secs())
}

/// Name of the user a VM is started for.
///
/// Under `sudo` this is the invoking user, not root.
pub fn current_user() -> String {
    user_from(|key| std::env::var(key).ok())
}

fn user_from(lookup: impl Fn(&str) -> Option<String>) -> String {
    ["SUDO_USER", "USER", "LOGNAME"]
        .iter()
        .filter_map(|key| lookup(key))
        .find(|user| !user.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Whether the effective user is root.
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}
