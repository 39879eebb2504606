use serde::{Deserialize, Serialize};

/// A chat message as stored and as delivered on the wire.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub user_id: String,
    pub user_name: String,
    /// Server-assigned milliseconds since the epoch; the sort key.
    pub timestamp: i64,
}

/// The slice of the platform's event rows this service mirrors. All times
/// are milliseconds since the epoch.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub id: String,
    pub title: String,
    pub host_id: String,
    pub starts_at: i64,
    pub ends_at: Option<i64>,
}

/// Long-poll response: a batch of new messages, or a heartbeat when the
/// server's wait window elapsed with nothing to deliver.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RealtimePayload {
    Messages { messages: Vec<ChatMessage> },
    Heartbeat,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MessageBody {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub event_id: String,
    #[serde(default)]
    pub event_title: String,
    pub user_id: String,
    pub user_name: String,
    pub message: MessageBody,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackfillPayload {
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomStatus {
    pub locked: bool,
    pub lock_boundary: i64,
    pub message_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realtime_payload_wire_shape() {
        let hb = serde_json::to_value(&RealtimePayload::Heartbeat).unwrap();
        assert_eq!(hb, serde_json::json!({"type": "heartbeat"}));

        let msg = RealtimePayload::Messages {
            messages: vec![ChatMessage {
                id: "1-aa".into(),
                text: "hi".into(),
                user_id: "u1".into(),
                user_name: "Ana".into(),
                timestamp: 42,
            }],
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "messages");
        assert_eq!(v["messages"][0]["userId"], "u1");
        assert_eq!(v["messages"][0]["userName"], "Ana");
        assert_eq!(v["messages"][0]["timestamp"], 42);
    }

    #[test]
    fn send_request_accepts_camel_case() {
        let req: SendRequest = serde_json::from_value(serde_json::json!({
            "eventId": "ev1",
            "eventTitle": "Picnic",
            "userId": "u1",
            "userName": "Ana",
            "message": {"text": "hello"}
        }))
        .unwrap();
        assert_eq!(req.event_id, "ev1");
        assert_eq!(req.message.text, "hello");
    }
}
