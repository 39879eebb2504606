use crate::error::{PollError, SendError};
use crate::model::{BackfillPayload, ChatMessage, MessageBody, RealtimePayload, SendRequest};
use crate::unread::UnreadStore;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default client-side request timeout. Must exceed the server's long-poll
/// wait window so a legitimate heartbeat is never read as a stalled
/// connection.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(35);

/// Exponential backoff with a consecutive-failure circuit breaker.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_errors: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(60),
            max_errors: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay after the n-th consecutive failure: `min(base * 2^(n-1), cap)`.
    pub fn delay_for(&self, error_count: u32) -> Duration {
        let exp = error_count.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    /// The circuit opened after repeated failures; the manager will not
    /// self-heal and the caller must resubscribe.
    Disconnected,
}

pub type MessageCallback = Arc<dyn Fn(Vec<ChatMessage>) + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

struct Connection {
    event_id: String,
    user_id: String,
    /// Distinguishes this subscription's loop from a successor's after a
    /// room switch, so a finishing loop never clobbers the new entry.
    gen: u64,
    /// Exclusive lower bound for the next poll.
    last_timestamp: i64,
    error_count: u32,
    is_active: bool,
    is_polling: bool,
    delivered: HashSet<String>,
    cancel: CancellationToken,
    on_messages: MessageCallback,
    on_status: Option<StatusCallback>,
}

/// Read-only view of the connection for UI badges and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub event_id: String,
    pub user_id: String,
    pub last_timestamp: i64,
    pub error_count: u32,
    pub is_active: bool,
    pub is_polling: bool,
}

/// Client connection manager for the event chat.
///
/// Owns at most one live connection: subscribing to a different event tears
/// the current one down (aborting its in-flight long-poll) before the new
/// loop starts. One poll is outstanding at a time; both the request and the
/// backoff sleeps cancel through the connection's token.
#[derive(Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
    request_timeout: Duration,
    unread: Arc<UnreadStore>,
    conn: Arc<Mutex<Option<Connection>>>,
    paused: Arc<AtomicBool>,
    next_gen: Arc<AtomicU64>,
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>, unread: Arc<UnreadStore>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
            retry: RetryPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            unread,
            conn: Arc::new(Mutex::new(None)),
            paused: Arc::new(AtomicBool::new(false)),
            next_gen: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Subscribe to an event's room and start the long-poll loop.
    ///
    /// Subscribing again to the already-polling room only refreshes the
    /// registered callbacks; it never spawns a second loop. Subscribing
    /// after the circuit opened restarts the loop. The cursor resumes from
    /// its persisted value.
    pub async fn subscribe(
        &self,
        event_id: &str,
        user_id: &str,
        on_messages: MessageCallback,
        on_status: Option<StatusCallback>,
    ) {
        let cursor = self.unread.cursor(event_id, user_id).await.unwrap_or(0);
        let start = {
            let mut guard = self.conn.lock();
            let same = guard
                .as_ref()
                .map_or(false, |c| c.event_id == event_id && c.user_id == user_id);
            if same {
                let c = guard.as_mut().unwrap();
                c.on_messages = on_messages;
                c.on_status = on_status;
                if c.is_polling {
                    None
                } else {
                    c.is_active = true;
                    c.error_count = 0;
                    if self.paused.load(Ordering::SeqCst) {
                        None
                    } else {
                        c.cancel = CancellationToken::new();
                        c.is_polling = true;
                        Some((c.gen, c.cancel.clone()))
                    }
                }
            } else {
                if let Some(old) = guard.take() {
                    old.cancel.cancel();
                }
                let gen = self.next_gen.fetch_add(1, Ordering::SeqCst) + 1;
                let cancel = CancellationToken::new();
                let polling = !self.paused.load(Ordering::SeqCst);
                *guard = Some(Connection {
                    event_id: event_id.to_string(),
                    user_id: user_id.to_string(),
                    gen,
                    last_timestamp: cursor,
                    error_count: 0,
                    is_active: true,
                    is_polling: polling,
                    delivered: HashSet::new(),
                    cancel: cancel.clone(),
                    on_messages,
                    on_status,
                });
                polling.then_some((gen, cancel))
            }
        };
        if let Some((gen, cancel)) = start {
            self.spawn_loop(event_id.to_string(), user_id.to_string(), gen, cancel);
        }
    }

    /// Tear down the current connection, aborting any in-flight poll and
    /// dropping its callbacks.
    pub fn unsubscribe(&self) {
        let mut guard = self.conn.lock();
        if let Some(old) = guard.take() {
            old.cancel.cancel();
        }
    }

    /// Stop polling without destroying connection state, e.g. when the app
    /// goes to the background.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        let guard = self.conn.lock();
        if let Some(c) = guard.as_ref() {
            if c.is_polling {
                c.cancel.cancel();
            }
        }
    }

    /// Restart the loop for a connection that is still active but not
    /// currently polling.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        let start = {
            let mut guard = self.conn.lock();
            match guard.as_mut() {
                Some(c) if c.is_active && !c.is_polling => {
                    c.cancel = CancellationToken::new();
                    c.error_count = 0;
                    c.is_polling = true;
                    Some((
                        c.event_id.clone(),
                        c.user_id.clone(),
                        c.gen,
                        c.cancel.clone(),
                    ))
                }
                _ => None,
            }
        };
        if let Some((event_id, user_id, gen, cancel)) = start {
            self.spawn_loop(event_id, user_id, gen, cancel);
        }
    }

    pub fn snapshot(&self) -> Option<ConnectionSnapshot> {
        let guard = self.conn.lock();
        guard.as_ref().map(|c| ConnectionSnapshot {
            event_id: c.event_id.clone(),
            user_id: c.user_id.clone(),
            last_timestamp: c.last_timestamp,
            error_count: c.error_count,
            is_active: c.is_active,
            is_polling: c.is_polling,
        })
    }

    /// Send a message. `Locked` comes back synchronously and is never
    /// retried. The stored id is registered as delivered so the polled copy
    /// of an optimistically echoed message is not delivered twice.
    pub async fn send(
        &self,
        event_id: &str,
        event_title: &str,
        user_id: &str,
        user_name: &str,
        text: &str,
    ) -> Result<ChatMessage, SendError> {
        let req = SendRequest {
            event_id: event_id.to_string(),
            event_title: event_title.to_string(),
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            message: MessageBody {
                text: text.to_string(),
            },
        };
        let resp = self
            .http
            .post(format!("{}/chat/send", self.base_url))
            .json(&req)
            .send()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            let stored: ChatMessage = resp
                .json()
                .await
                .map_err(|e| SendError::Transport(e.to_string()))?;
            let mut guard = self.conn.lock();
            if let Some(c) = guard.as_mut().filter(|c| c.event_id == event_id) {
                c.delivered.insert(stored.id.clone());
            }
            Ok(stored)
        } else {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            match body["error"].as_str() {
                Some("locked") => Err(SendError::Locked),
                other => Err(SendError::Rejected(format!(
                    "{}: {}",
                    status,
                    other.unwrap_or("unknown")
                ))),
            }
        }
    }

    /// Fetch the full room history on chat open. Everything returned counts
    /// as delivered and read; the poll cursor advances past it.
    pub async fn backfill(
        &self,
        event_id: &str,
        user_id: &str,
    ) -> Result<Vec<ChatMessage>, SendError> {
        let resp = self
            .http
            .get(format!("{}/chat/messages", self.base_url))
            .query(&[("eventId", event_id)])
            .send()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SendError::Rejected(format!("status {}", status)));
        }
        let payload: BackfillPayload = resp
            .json()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;
        let max_ts = payload.messages.iter().map(|m| m.timestamp).max();
        {
            let mut guard = self.conn.lock();
            if let Some(c) = guard
                .as_mut()
                .filter(|c| c.event_id == event_id && c.user_id == user_id)
            {
                for m in &payload.messages {
                    c.delivered.insert(m.id.clone());
                }
                if let Some(ts) = max_ts {
                    c.last_timestamp = c.last_timestamp.max(ts + 1);
                }
            }
        }
        if let Some(ts) = max_ts {
            if let Err(e) = self.unread.set_cursor(event_id, user_id, ts + 1).await {
                debug!(error = %e, "cursor persist failed");
            }
        }
        Ok(payload.messages)
    }

    /// Reset the unread counter when the user opens the room.
    pub async fn mark_read(&self, event_id: &str, user_id: &str) -> anyhow::Result<()> {
        self.unread.reset_unread(event_id, user_id).await
    }

    pub async fn unread_count(&self, event_id: &str, user_id: &str) -> i64 {
        self.unread.unread(event_id, user_id).await
    }

    fn spawn_loop(&self, event_id: String, user_id: String, gen: u64, cancel: CancellationToken) {
        let me = self.clone();
        tokio::spawn(async move { me.run_poll_loop(event_id, user_id, gen, cancel).await });
    }

    async fn run_poll_loop(
        self,
        event_id: String,
        user_id: String,
        gen: u64,
        cancel: CancellationToken,
    ) {
        loop {
            if cancel.is_cancelled() || self.paused.load(Ordering::SeqCst) {
                break;
            }
            let cursor = {
                let guard = self.conn.lock();
                match guard.as_ref() {
                    Some(c) if c.gen == gen => c.last_timestamp,
                    _ => break,
                }
            };
            // dropping the request future on cancellation aborts it; a
            // torn-down connection never delivers a stale batch
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.poll_once(&event_id, &user_id, cursor) => r,
            };
            match outcome {
                Ok(RealtimePayload::Heartbeat) => {
                    let mut guard = self.conn.lock();
                    match guard.as_mut().filter(|c| c.gen == gen) {
                        Some(c) => c.error_count = 0,
                        None => break,
                    }
                }
                Ok(RealtimePayload::Messages { messages }) => {
                    if self
                        .deliver(&event_id, &user_id, gen, messages)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) if !e.counts_as_failure() => {
                    // client-side timeout: fresh poll, same cursor, no log
                    debug!(event = %event_id, "poll aborted, re-polling");
                }
                Err(e) => {
                    let n = {
                        let mut guard = self.conn.lock();
                        let Some(c) = guard.as_mut().filter(|c| c.gen == gen) else {
                            break;
                        };
                        c.error_count += 1;
                        c.error_count
                    };
                    warn!(event = %event_id, error = %e, attempt = n, "poll failed");
                    let delay = self.retry.delay_for(n);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    if n >= self.retry.max_errors {
                        let status_cb = {
                            let mut guard = self.conn.lock();
                            let Some(c) = guard.as_mut().filter(|c| c.gen == gen) else {
                                break;
                            };
                            c.is_active = false;
                            c.on_status.clone()
                        };
                        warn!(event = %event_id, "connection dead after repeated failures, resubscribe required");
                        if let Some(cb) = status_cb {
                            cb(ConnectionStatus::Disconnected);
                        }
                        break;
                    }
                }
            }
        }
        let mut guard = self.conn.lock();
        if let Some(c) = guard.as_mut().filter(|c| c.gen == gen) {
            c.is_polling = false;
        }
    }

    async fn poll_once(
        &self,
        event_id: &str,
        user_id: &str,
        cursor: i64,
    ) -> Result<RealtimePayload, PollError> {
        let cursor = cursor.to_string();
        let resp = self
            .http
            .get(format!("{}/chat/realtime", self.base_url))
            .query(&[
                ("eventId", event_id),
                ("userId", user_id),
                ("lastTimestamp", cursor.as_str()),
            ])
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(classify)?;
        if !resp.status().is_success() {
            return Err(PollError::Transport(format!("status {}", resp.status())));
        }
        resp.json::<RealtimePayload>().await.map_err(|e| {
            if e.is_timeout() {
                PollError::Aborted
            } else {
                PollError::Malformed(e.to_string())
            }
        })
    }

    /// Apply a polled batch: advance the cursor past the newest timestamp,
    /// drop ids already delivered, bump the unread counter once for the
    /// whole batch, then hand the fresh messages to the callback.
    async fn deliver(
        &self,
        event_id: &str,
        user_id: &str,
        gen: u64,
        messages: Vec<ChatMessage>,
    ) -> Result<(), ()> {
        let max_ts = messages.iter().map(|m| m.timestamp).max();
        let (fresh, from_others, cb) = {
            let mut guard = self.conn.lock();
            let Some(c) = guard.as_mut().filter(|c| c.gen == gen) else {
                return Err(());
            };
            c.error_count = 0;
            if let Some(ts) = max_ts {
                c.last_timestamp = c.last_timestamp.max(ts + 1);
            }
            let mut fresh = Vec::new();
            let mut from_others = 0i64;
            for m in messages {
                if c.delivered.insert(m.id.clone()) {
                    if m.user_id != c.user_id {
                        from_others += 1;
                    }
                    fresh.push(m);
                }
            }
            (fresh, from_others, c.on_messages.clone())
        };
        if let Some(ts) = max_ts {
            if let Err(e) = self.unread.set_cursor(event_id, user_id, ts + 1).await {
                debug!(error = %e, "cursor persist failed");
            }
        }
        if from_others > 0 {
            if let Err(e) = self.unread.add_unread(event_id, user_id, from_others).await {
                warn!(error = %e, "unread counter update failed");
            }
        }
        if !fresh.is_empty() {
            cb(fresh);
        }
        Ok(())
    }
}

fn classify(e: reqwest::Error) -> PollError {
    if e.is_timeout() {
        PollError::Aborted
    } else {
        PollError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_doubles_to_the_cap() {
        let retry = RetryPolicy::default();
        let secs: Vec<u64> = (1..=7).map(|n| retry.delay_for(n).as_secs()).collect();
        assert_eq!(secs, vec![5, 10, 20, 40, 60, 60, 60]);
    }

    #[test]
    fn backoff_survives_absurd_error_counts() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.delay_for(0), Duration::from_secs(5));
        assert_eq!(retry.delay_for(u32::MAX), Duration::from_secs(60));
    }

    async fn paused_client() -> (ChatClient, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let unread = Arc::new(UnreadStore::open(dir.path()).await.unwrap());
        let client = ChatClient::new("http://127.0.0.1:1", unread);
        // paused so subscribe registers state without touching the network
        client.pause();
        (client, dir)
    }

    fn noop() -> MessageCallback {
        Arc::new(|_| {})
    }

    #[tokio::test]
    async fn one_connection_at_a_time() {
        let (client, _dir) = paused_client().await;
        client.subscribe("ev-a", "u1", noop(), None).await;
        client.subscribe("ev-b", "u1", noop(), None).await;
        let snap = client.snapshot().unwrap();
        assert_eq!(snap.event_id, "ev-b");
        assert!(snap.is_active);
    }

    #[tokio::test]
    async fn resubscribe_same_room_keeps_state() {
        let (client, _dir) = paused_client().await;
        client.subscribe("ev-a", "u1", noop(), None).await;
        let first = client.snapshot().unwrap();
        client.subscribe("ev-a", "u1", noop(), None).await;
        let second = client.snapshot().unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unsubscribe_clears_the_connection() {
        let (client, _dir) = paused_client().await;
        client.subscribe("ev-a", "u1", noop(), None).await;
        client.unsubscribe();
        assert!(client.snapshot().is_none());
    }

    #[tokio::test]
    async fn cursor_resumes_from_persisted_value() {
        let dir = tempfile::tempdir().unwrap();
        let unread = Arc::new(UnreadStore::open(dir.path()).await.unwrap());
        unread.set_cursor("ev-a", "u1", 777).await.unwrap();
        let client = ChatClient::new("http://127.0.0.1:1", unread);
        client.pause();
        client.subscribe("ev-a", "u1", noop(), None).await;
        assert_eq!(client.snapshot().unwrap().last_timestamp, 777);
    }
}
