use anyhow::Result;
use std::{collections::HashMap, path::PathBuf};
use tokio::{fs, sync::Mutex};

/// File-backed key-value store for the client: unread counters and the
/// long-poll cursor, both keyed per (event, user) so they survive restarts.
///
/// All mutation happens under one lock as read-modify-write, so a batch
/// increment landing concurrently with a mark-read reset cannot lose
/// updates.
pub struct UnreadStore {
    file: PathBuf,
    data: Mutex<HashMap<String, i64>>,
}

fn unread_key(event_id: &str, user_id: &str) -> String {
    format!("unread:{}:{}", event_id, user_id)
}

fn cursor_key(event_id: &str, user_id: &str) -> String {
    format!("cursor:{}:{}", event_id, user_id)
}

impl UnreadStore {
    /// Open the store backed by `chat_state.json` inside `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        let file = dir.join("chat_state.json");
        let data = if let Ok(bytes) = fs::read(&file).await {
            serde_json::from_slice(&bytes).unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(Self {
            file,
            data: Mutex::new(data),
        })
    }

    async fn persist(&self, data: &HashMap<String, i64>) -> Result<()> {
        let bytes = serde_json::to_vec(data)?;
        fs::write(&self.file, bytes).await?;
        Ok(())
    }

    /// Current unread count for the user in the event's room.
    pub async fn unread(&self, event_id: &str, user_id: &str) -> i64 {
        let data = self.data.lock().await;
        data.get(&unread_key(event_id, user_id)).copied().unwrap_or(0)
    }

    /// Add a whole batch worth of unread messages as one increment.
    pub async fn add_unread(&self, event_id: &str, user_id: &str, n: i64) -> Result<i64> {
        let mut data = self.data.lock().await;
        let entry = data.entry(unread_key(event_id, user_id)).or_insert(0);
        *entry += n;
        let value = *entry;
        self.persist(&data).await?;
        Ok(value)
    }

    /// Reset the counter when the user opens the room.
    pub async fn reset_unread(&self, event_id: &str, user_id: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        data.insert(unread_key(event_id, user_id), 0);
        self.persist(&data).await
    }

    /// Last persisted long-poll cursor, if any.
    pub async fn cursor(&self, event_id: &str, user_id: &str) -> Option<i64> {
        let data = self.data.lock().await;
        data.get(&cursor_key(event_id, user_id)).copied()
    }

    pub async fn set_cursor(&self, event_id: &str, user_id: &str, ts: i64) -> Result<()> {
        let mut data = self.data.lock().await;
        data.insert(cursor_key(event_id, user_id), ts);
        self.persist(&data).await
    }
}
