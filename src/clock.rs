//! Wall-clock helpers shared across stores and services.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

/// Current time as whole seconds since the UNIX epoch.
#[must_use]
pub fn utc_now_epoch() -> i64 {
    Utc::now().timestamp()
}

/// Current time as an RFC 3339 UTC timestamp with millisecond precision.
#[must_use]
pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Render an epoch-seconds value as an RFC 3339 UTC timestamp.
///
/// Out-of-range values collapse to the epoch origin rather than panicking;
/// stored timestamps are always produced by [`utc_now_epoch`] so this path
/// is unreachable in practice.
#[must_use]
pub fn iso_from_epoch(epoch_seconds: i64) -> String {
    let ts: DateTime<Utc> = Utc
        .timestamp_opt(epoch_seconds, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap_or_default());
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
