use crate::error::ChatError;
use crate::model::{ChatMessage, EventRecord};
use crate::policy;
use rand::Rng;
use rusqlite::{params, Connection};

/// Messages a single long-poll response may carry.
pub const MAX_BATCH: usize = 100;

/// Input for an append; `id` and `timestamp` are assigned here.
pub struct NewMessage<'a> {
    pub user_id: &'a str,
    pub user_name: &'a str,
    pub text: &'a str,
}

/// Time-prefixed id with a random suffix. Unique within a room and
/// roughly ordered for display; `timestamp` stays authoritative for order.
fn message_id(now_ms: i64) -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!("{:x}-{:08x}", now_ms, suffix)
}

/// Append a message to the event's room.
///
/// Fails with `ChatError::Locked` past the lock boundary without touching
/// the log. Every successful append refreshes the room's persisted expiry to
/// the boundary computed from the event times read now, so deletion always
/// tracks the current `ends_at` rather than a write-time snapshot.
pub fn append(
    conn: &Connection,
    event: &EventRecord,
    input: &NewMessage<'_>,
    now_ms: i64,
) -> Result<ChatMessage, ChatError> {
    if policy::is_locked(event, now_ms) {
        return Err(ChatError::Locked);
    }
    let id = message_id(now_ms);
    conn.execute(
        "INSERT INTO room_messages (id, event_id, user_id, user_name, text, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, event.id, input.user_id, input.user_name, input.text, now_ms],
    )?;
    conn.execute(
        "INSERT INTO room_expiry (event_id, expires_at) VALUES (?1, ?2) \
         ON CONFLICT(event_id) DO UPDATE SET expires_at = excluded.expires_at",
        params![event.id, policy::lock_boundary(event.starts_at, event.ends_at)],
    )?;
    Ok(ChatMessage {
        id,
        text: input.text.into(),
        user_id: input.user_id.into(),
        user_name: input.user_name.into(),
        timestamp: now_ms,
    })
}

/// Messages with `timestamp > since`, ascending. A locked room reads as
/// empty, not as an error.
pub fn range(
    conn: &Connection,
    event: &EventRecord,
    since_exclusive_ms: i64,
    limit: usize,
    now_ms: i64,
) -> Result<Vec<ChatMessage>, ChatError> {
    if policy::is_locked(event, now_ms) {
        return Ok(Vec::new());
    }
    let limit = limit.min(500);
    let mut stmt = conn.prepare(
        "SELECT id, user_id, user_name, text, created_at FROM room_messages \
         WHERE event_id = ?1 AND created_at > ?2 ORDER BY created_at ASC, id ASC LIMIT ?3",
    )?;
    let iter = stmt.query_map(
        params![event.id, since_exclusive_ms, limit as i64],
        |row| {
            Ok(ChatMessage {
                id: row.get(0)?,
                user_id: row.get(1)?,
                user_name: row.get(2)?,
                text: row.get(3)?,
                timestamp: row.get(4)?,
            })
        },
    )?;
    let mut msgs = Vec::new();
    for m in iter {
        msgs.push(m?);
    }
    Ok(msgs)
}

/// Number of messages currently held for the event's room.
pub fn message_count(conn: &Connection, event_id: &str) -> Result<u32, ChatError> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM room_messages WHERE event_id = ?1",
        [event_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Delete rooms whose persisted expiry has passed. Returns how many rooms
/// were reclaimed. Lock and emptiness semantics never depend on this having
/// run; it only releases storage.
pub fn purge_expired(conn: &Connection, now_ms: i64) -> Result<usize, ChatError> {
    conn.execute(
        "DELETE FROM room_messages WHERE event_id IN \
         (SELECT event_id FROM room_expiry WHERE expires_at <= ?1)",
        [now_ms],
    )?;
    let rooms = conn.execute("DELETE FROM room_expiry WHERE expires_at <= ?1", [now_ms])?;
    Ok(rooms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    const HOUR: i64 = 3_600_000;

    fn event(starts_at: i64, ends_at: Option<i64>) -> EventRecord {
        EventRecord {
            id: "ev1".into(),
            title: "Ev".into(),
            host_id: "h".into(),
            starts_at,
            ends_at,
        }
    }

    fn msg<'a>(user: &'a str, text: &'a str) -> NewMessage<'a> {
        NewMessage {
            user_id: user,
            user_name: user,
            text,
        }
    }

    #[test]
    fn append_then_range_exactly_once() {
        let conn = db::init_db(":memory:").unwrap();
        let ev = event(0, Some(2 * HOUR));
        let m1 = append(&conn, &ev, &msg("u1", "one"), 10).unwrap();
        let m2 = append(&conn, &ev, &msg("u2", "two"), 20).unwrap();
        let all = range(&conn, &ev, 0, 100, 30).unwrap();
        assert_eq!(all, vec![m1.clone(), m2.clone()]);
        // exclusive cursor: nothing at or before `since` comes back
        let after = range(&conn, &ev, m1.timestamp, 100, 30).unwrap();
        assert_eq!(after, vec![m2]);
        assert!(range(&conn, &ev, 20, 100, 30).unwrap().is_empty());
    }

    #[test]
    fn locked_append_fails_without_mutation() {
        let conn = db::init_db(":memory:").unwrap();
        let ev = event(0, Some(2 * HOUR));
        let locked_at = 3 * HOUR + 1;
        assert!(matches!(
            append(&conn, &ev, &msg("u1", "late"), locked_at),
            Err(ChatError::Locked)
        ));
        assert_eq!(message_count(&conn, &ev.id).unwrap(), 0);
    }

    #[test]
    fn locked_range_is_empty_not_an_error() {
        let conn = db::init_db(":memory:").unwrap();
        let ev = event(0, Some(2 * HOUR));
        append(&conn, &ev, &msg("u1", "hi"), 10).unwrap();
        assert!(range(&conn, &ev, 0, 100, 3 * HOUR + 1).unwrap().is_empty());
        // still there before the boundary
        assert_eq!(range(&conn, &ev, 0, 100, 3 * HOUR).unwrap().len(), 1);
    }

    #[test]
    fn chat_window_around_the_boundary() {
        let conn = db::init_db(":memory:").unwrap();
        let t = 1_000_000;
        let ev = event(t, Some(t + 2 * HOUR));
        // at T+2h59m the room is still writable
        append(&conn, &ev, &msg("u1", "almost"), t + 2 * HOUR + 59 * 60_000).unwrap();
        // at T+3h01m writes fail and reads are empty
        let late = t + 3 * HOUR + 60_000;
        assert!(matches!(
            append(&conn, &ev, &msg("u1", "late"), late),
            Err(ChatError::Locked)
        ));
        assert!(range(&conn, &ev, 0, 100, late).unwrap().is_empty());
    }

    #[test]
    fn missing_ends_at_locks_one_hour_after_start() {
        let conn = db::init_db(":memory:").unwrap();
        let t = 1_000_000;
        let ev = event(t, None);
        append(&conn, &ev, &msg("u1", "hi"), t + HOUR).unwrap();
        assert!(matches!(
            append(&conn, &ev, &msg("u1", "late"), t + HOUR + 1),
            Err(ChatError::Locked)
        ));
    }

    #[test]
    fn append_refreshes_persisted_expiry() {
        let conn = db::init_db(":memory:").unwrap();
        let mut ev = event(0, Some(HOUR));
        append(&conn, &ev, &msg("u1", "a"), 10).unwrap();
        let expires: i64 = conn
            .query_row("SELECT expires_at FROM room_expiry WHERE event_id = 'ev1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(expires, 2 * HOUR);
        // the event runs long; the next append tracks the new boundary
        ev.ends_at = Some(3 * HOUR);
        append(&conn, &ev, &msg("u1", "b"), 20).unwrap();
        let expires: i64 = conn
            .query_row("SELECT expires_at FROM room_expiry WHERE event_id = 'ev1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(expires, 4 * HOUR);
    }

    #[test]
    fn purge_reclaims_only_expired_rooms() {
        let conn = db::init_db(":memory:").unwrap();
        let ev1 = event(0, Some(HOUR));
        let mut ev2 = event(0, Some(10 * HOUR));
        ev2.id = "ev2".into();
        append(&conn, &ev1, &msg("u1", "a"), 10).unwrap();
        append(&conn, &ev2, &msg("u1", "b"), 10).unwrap();
        let purged = purge_expired(&conn, 5 * HOUR).unwrap();
        assert_eq!(purged, 1);
        assert_eq!(message_count(&conn, "ev1").unwrap(), 0);
        assert_eq!(message_count(&conn, "ev2").unwrap(), 1);
    }

    #[test]
    fn range_respects_limit_in_order() {
        let conn = db::init_db(":memory:").unwrap();
        let ev = event(0, Some(2 * HOUR));
        for i in 0..5 {
            append(&conn, &ev, &msg("u1", "m"), 10 + i).unwrap();
        }
        let page = range(&conn, &ev, 0, 2, 100).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].timestamp, 10);
        assert_eq!(page[1].timestamp, 11);
    }
}
