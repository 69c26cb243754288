//! Small shared helpers.

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Current wall-clock time as Unix milliseconds.
pub(crate) fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
