use crate::model::EventRecord;
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

/// Mirror an event row from the platform backend. Chat only needs the time
/// fields, title and host; everything else stays upstream.
pub fn upsert_event(conn: &Connection, event: &EventRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO events (id, title, host_id, starts_at, ends_at) VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(id) DO UPDATE SET title = excluded.title, host_id = excluded.host_id, \
         starts_at = excluded.starts_at, ends_at = excluded.ends_at",
        params![
            event.id,
            event.title,
            event.host_id,
            event.starts_at,
            event.ends_at
        ],
    )?;
    Ok(())
}

/// Look up an event by id.
pub fn get_event(conn: &Connection, id: &str) -> Result<Option<EventRecord>> {
    let mut stmt =
        conn.prepare("SELECT id, title, host_id, starts_at, ends_at FROM events WHERE id = ?1")?;
    let event = stmt
        .query_row([id], |row| {
            Ok(EventRecord {
                id: row.get(0)?,
                title: row.get(1)?,
                host_id: row.get(2)?,
                starts_at: row.get(3)?,
                ends_at: row.get(4)?,
            })
        })
        .optional()?;
    Ok(event)
}
