use crate::model::EventRecord;
use time::OffsetDateTime;

/// Grace window after an event ends during which its chat stays open.
pub const LOCK_GRACE_MS: i64 = 3_600_000;

/// Current wall clock in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// The instant after which a room stops accepting writes and reads return
/// empty. Events without an end time fall back to `starts_at`, narrowing the
/// chat window to one hour past the start.
pub fn lock_boundary(starts_at: i64, ends_at: Option<i64>) -> i64 {
    ends_at.unwrap_or(starts_at) + LOCK_GRACE_MS
}

/// Whether the room for `event` is locked at `now_ms`. Computed from the
/// event time fields on every call, never cached or stored as a flag.
pub fn is_locked(event: &EventRecord, now_ms: i64) -> bool {
    now_ms > lock_boundary(event.starts_at, event.ends_at)
}

/// Remaining lifetime of the room in milliseconds, floored at zero.
pub fn room_ttl_ms(event: &EventRecord, now_ms: i64) -> i64 {
    (lock_boundary(event.starts_at, event.ends_at) - now_ms).max(0)
}
