//! Gmail API request/response types used by the relay.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Pub/Sub push envelope.
#[derive(Debug, Deserialize)]
pub struct PubSubPushEnvelope {
    pub message: PubSubMessage,
    #[serde(default)]
    #[allow(dead_code)]
    pub subscription: Option<String>,
}

/// Pub/Sub message wrapper.
#[derive(Debug, Deserialize)]
pub struct PubSubMessage {
    /// Base64 of the Gmail notification JSON
    pub data: String,
    #[serde(rename = "messageId", default)]
    pub message_id: Option<String>,
    #[serde(rename = "publishTime", default)]
    #[allow(dead_code)]
    pub publish_time: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    pub attributes: Option<HashMap<String, String>>,
}

/// `users.history.list` response.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    #[serde(default)]
    pub history: Vec<HistoryRecord>,
    pub history_id: Option<String>,
    #[allow(dead_code)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    #[allow(dead_code)]
    pub id: String,
    #[serde(default)]
    pub messages_added: Vec<HistoryMessageAdded>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryMessageAdded {
    pub message: MessageRef,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
}

/// `users.messages.list` response.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageListResponse {
    #[serde(default)]
    pub messages: Vec<MessageRef>,
    #[allow(dead_code)]
    pub next_page_token: Option<String>,
}

/// Which representation `users.messages.get` should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFormat {
    Full,
    Metadata,
}

impl MessageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageFormat::Full => "full",
            MessageFormat::Metadata => "metadata",
        }
    }
}

/// Headers requested in metadata format.
pub const METADATA_HEADERS: [&str; 4] = ["From", "To", "Subject", "Date"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub label_ids: Vec<String>,
    pub snippet: Option<String>,
    pub payload: Option<MessagePart>,
    pub internal_date: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    pub part_id: Option<String>,
    pub mime_type: Option<String>,
    #[serde(default)]
    pub headers: Vec<MessageHeader>,
    pub body: Option<MessageBody>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageBody {
    /// Base64url body data
    pub data: Option<String>,
    pub size: Option<i64>,
}

impl GmailMessage {
    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.payload
            .as_ref()?
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Plain text body: first text/plain part, else text/html with tags stripped.
    pub fn text_body(&self) -> Option<String> {
        let payload = self.payload.as_ref()?;
        find_part_text(payload, "text/plain")
            .or_else(|| find_part_text(payload, "text/html").map(|html| strip_html(&html)))
            .or_else(|| {
                // Single-part message without a mime type on the root
                if payload.parts.is_empty() && payload.mime_type.is_none() {
                    decode_body(payload)
                } else {
                    None
                }
            })
    }
}

fn find_part_text(part: &MessagePart, mime: &str) -> Option<String> {
    let matches = part
        .mime_type
        .as_deref()
        .map(|m| m.eq_ignore_ascii_case(mime))
        .unwrap_or(false);
    if matches {
        if let Some(text) = decode_body(part) {
            return Some(text);
        }
    }
    part.parts.iter().find_map(|p| find_part_text(p, mime))
}

fn decode_body(part: &MessagePart) -> Option<String> {
    let data = part.body.as_ref()?.data.as_deref()?;
    base64_url_decode(data).ok()
}

/// Gmail uses URL-safe base64, usually unpadded.
pub fn base64_url_decode(input: &str) -> Result<String, String> {
    let trimmed = input.trim().trim_end_matches('=');
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(trimmed)
        .map_err(|e| e.to_string())?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Basic HTML tag stripping
fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;

    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(c),
            _ => {}
        }
    }

    result
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// `users.watch` request body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchRequest {
    pub topic_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub label_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_filter_behavior: Option<String>,
}

/// `users.watch` response. Gmail sends both fields as strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchResponse {
    #[serde(deserialize_with = "gmail_relay_types::deserialize_history_id")]
    pub history_id: String,
    #[serde(deserialize_with = "deserialize_i64_string")]
    pub expiration: i64,
}

fn deserialize_i64_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => s.trim().parse().map_err(D::Error::custom),
        serde_json::Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| D::Error::custom(format!("invalid expiration: {}", n))),
        other => Err(D::Error::custom(format!("invalid expiration: {}", other))),
    }
}

/// Google API error body: `{"error": {"code", "message", "status", "errors": [...]}}`.
#[derive(Debug, Default, Deserialize)]
pub struct GoogleErrorBody {
    pub error: GoogleErrorDetail,
}

#[derive(Debug, Default, Deserialize)]
pub struct GoogleErrorDetail {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub errors: Vec<GoogleErrorItem>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GoogleErrorItem {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(s: &str) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(s)
    }

    #[test]
    fn history_response_collects_messages_added() {
        let json = r#"{
            "history": [
                {"id": "101", "messagesAdded": [{"message": {"id": "m1", "threadId": "t1"}}]},
                {"id": "102"}
            ],
            "historyId": "200"
        }"#;
        let resp: HistoryResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.history.len(), 2);
        assert_eq!(resp.history[0].messages_added[0].message.id, "m1");
        assert!(resp.history[1].messages_added.is_empty());
        assert_eq!(resp.history_id.as_deref(), Some("200"));
    }

    #[test]
    fn empty_history_response_parses() {
        let resp: HistoryResponse = serde_json::from_str(r#"{"historyId":"5"}"#).unwrap();
        assert!(resp.history.is_empty());
    }

    #[test]
    fn text_body_prefers_plain_over_html() {
        let msg = GmailMessage {
            id: "m1".into(),
            payload: Some(MessagePart {
                mime_type: Some("multipart/alternative".into()),
                parts: vec![
                    MessagePart {
                        mime_type: Some("text/html".into()),
                        body: Some(MessageBody { data: Some(b64("<p>Hi <b>there</b></p>")), size: None }),
                        ..Default::default()
                    },
                    MessagePart {
                        mime_type: Some("text/plain".into()),
                        body: Some(MessageBody { data: Some(b64("Hi there")), size: None }),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(msg.text_body().as_deref(), Some("Hi there"));
    }

    #[test]
    fn text_body_falls_back_to_stripped_html() {
        let msg = GmailMessage {
            id: "m1".into(),
            payload: Some(MessagePart {
                mime_type: Some("multipart/mixed".into()),
                parts: vec![MessagePart {
                    mime_type: Some("text/html".into()),
                    body: Some(MessageBody { data: Some(b64("<div>Hello</div>\n<div> world </div>")), size: None }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(msg.text_body().as_deref(), Some("Hello\nworld"));
    }

    #[test]
    fn headers_are_case_insensitive() {
        let msg = GmailMessage {
            payload: Some(MessagePart {
                headers: vec![MessageHeader { name: "subject".into(), value: "Hello".into() }],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(msg.header("Subject"), Some("Hello"));
        assert_eq!(msg.header("From"), None);
    }

    #[test]
    fn watch_response_accepts_string_fields() {
        let resp: WatchResponse =
            serde_json::from_str(r#"{"historyId":"1234","expiration":"1700000000000"}"#).unwrap();
        assert_eq!(resp.history_id, "1234");
        assert_eq!(resp.expiration, 1_700_000_000_000);
    }

    #[test]
    fn padded_base64url_is_accepted() {
        let padded = base64::engine::general_purpose::URL_SAFE.encode("hi");
        assert!(padded.ends_with('='));
        assert_eq!(base64_url_decode(&padded).unwrap(), "hi");
    }
}
