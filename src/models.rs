//! Wire DTOs and domain value types
//!
//! Gmail REST and Pub/Sub push payloads are deserialized into the `camelCase`
//! DTOs below. [`ParsedEmail`] and [`Attachment`] are the flattened domain
//! values produced by the MIME parser.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::cursor::HistoryCursor;
use crate::errors::{AppError, AppResult};

/// Email header (name-value pair)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Part body: inline data or an out-of-band attachment reference
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePartBody {
    /// Reference for `messages.attachments.get` when the payload is not inline
    pub attachment_id: Option<String>,
    /// Declared payload size in bytes
    #[serde(default)]
    pub size: u64,
    /// URL-safe base64 payload
    pub data: Option<String>,
}

/// One node of the MIME part tree
///
/// The message payload is the root; containers carry `parts`, leaves carry a
/// `body`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    pub part_id: Option<String>,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: MessagePartBody,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

/// Full message from `users.messages.get?format=full`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub label_ids: Vec<String>,
    pub snippet: Option<String>,
    pub history_id: Option<HistoryCursor>,
    #[serde(default)]
    pub payload: MessagePart,
}

/// Reference to a message inside a history record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub label_ids: Vec<String>,
}

/// `messageAdded` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageAdded {
    pub message: MessageRef,
}

/// One entry of the history delta
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: HistoryCursor,
    #[serde(default)]
    pub messages_added: Vec<MessageAdded>,
}

/// Page of `users.history.list`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    #[serde(default)]
    pub history: Vec<HistoryRecord>,
    pub next_page_token: Option<String>,
    pub history_id: Option<HistoryCursor>,
}

/// Body of `users.watch`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchRequest {
    pub topic_name: String,
    pub label_ids: Vec<String>,
    pub label_filter_action: String,
}

impl WatchRequest {
    /// Watch that only reports changes touching `label_ids`
    pub fn include(topic_name: impl Into<String>, label_ids: Vec<String>) -> Self {
        Self {
            topic_name: topic_name.into(),
            label_ids,
            label_filter_action: "include".to_owned(),
        }
    }
}

/// Result of `users.watch`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchResponse {
    pub history_id: HistoryCursor,
    /// Expiration in epoch milliseconds, as a decimal string
    pub expiration: String,
}

impl WatchResponse {
    /// Parse the expiration timestamp
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the provider sent a non-numeric or out-of-range
    /// timestamp.
    pub fn expires_at(&self) -> AppResult<DateTime<Utc>> {
        let millis = self.expiration.trim().parse::<i64>().map_err(|_| {
            AppError::Internal(format!("invalid watch expiration '{}'", self.expiration))
        })?;
        Utc.timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| AppError::Internal(format!("watch expiration out of range: {millis}")))
    }
}

/// Result of `users.messages.attachments.get`
#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentResponse {
    #[serde(default)]
    pub data: String,
}

/// Pub/Sub push envelope delivered to the webhook
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushEnvelope {
    pub message: Option<PushMessage>,
    pub subscription: Option<String>,
}

/// Pub/Sub message wrapper
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    /// Standard base64 JSON payload
    pub data: Option<String>,
    pub message_id: Option<String>,
}

/// Decoded Gmail push payload
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushNotification {
    pub email_address: Option<String>,
    pub history_id: Option<HistoryCursor>,
}

/// Attachment fetched through the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    /// Size declared in the part body
    pub size: u64,
    pub data: Vec<u8>,
}

/// Flattened message content ready for summarization
#[derive(Debug, Clone)]
pub struct ParsedEmail {
    pub id: String,
    pub thread_id: String,
    pub labels: Vec<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub subject: Option<String>,
    pub date: Option<String>,
    pub snippet: Option<String>,
    /// Decoded text of every collected leaf, joined in tree order
    pub content: String,
    /// `text/html` if any collected leaf was HTML, else `text/plain`
    pub content_type: String,
    pub attachments: Vec<Attachment>,
}

impl ParsedEmail {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

#[cfg(test)]
mod tests {
    use super::{GmailMessage, HistoryResponse, PushNotification, WatchResponse};
    use crate::cursor::HistoryCursor;

    #[test]
    fn deserializes_history_page() {
        let raw = r#"{
            "history": [
                {"id": "101", "messages": [{"id": "m1", "threadId": "t1"}],
                 "messagesAdded": [{"message": {"id": "m1", "threadId": "t1", "labelIds": ["INBOX"]}}]},
                {"id": "102"}
            ],
            "historyId": "102"
        }"#;
        let page: HistoryResponse = serde_json::from_str(raw).expect("valid history page");
        assert_eq!(page.history.len(), 2);
        assert_eq!(page.history[0].messages_added[0].message.id, "m1");
        assert!(page.history[1].messages_added.is_empty());
        assert_eq!(page.history_id, Some(HistoryCursor::new(102)));
        assert!(page.next_page_token.is_none());
    }

    #[test]
    fn deserializes_message_with_nested_parts() {
        let raw = r#"{
            "id": "m1",
            "threadId": "t1",
            "labelIds": ["INBOX", "UNREAD"],
            "payload": {
                "mimeType": "multipart/mixed",
                "headers": [{"name": "Subject", "value": "Hi"}],
                "body": {"size": 0},
                "parts": [
                    {"partId": "0", "mimeType": "text/plain", "filename": "", "body": {"size": 2, "data": "aGk"}},
                    {"partId": "1", "mimeType": "application/pdf", "filename": "a.pdf", "body": {"size": 10, "attachmentId": "att-1"}}
                ]
            }
        }"#;
        let msg: GmailMessage = serde_json::from_str(raw).expect("valid message");
        assert_eq!(msg.payload.parts.len(), 2);
        assert_eq!(msg.payload.parts[1].body.attachment_id.as_deref(), Some("att-1"));
        assert!(msg.snippet.is_none());
    }

    #[test]
    fn parses_watch_expiration_millis() {
        let watch: WatchResponse =
            serde_json::from_str(r#"{"historyId": "55", "expiration": "1700000000000"}"#)
                .expect("valid watch response");
        let expires = watch.expires_at().expect("valid timestamp");
        assert_eq!(expires.timestamp(), 1_700_000_000);
        assert_eq!(watch.history_id.value(), 55);
    }

    #[test]
    fn push_payload_without_history_id_is_still_valid_json() {
        let payload: PushNotification =
            serde_json::from_str(r#"{"emailAddress": "me@example.com"}"#).expect("valid");
        assert!(payload.history_id.is_none());
    }
}
