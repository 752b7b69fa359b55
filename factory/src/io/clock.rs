//! Wall-clock timestamps for records and artifacts.

use chrono::{SecondsFormat, Utc};

/// Current UTC time as RFC 3339 with second precision (`2026-01-01T00:00:00Z`).
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
