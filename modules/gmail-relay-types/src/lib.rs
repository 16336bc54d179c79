//! Shared types for the Gmail relay service: persisted watch state,
//! inbound push payloads, outbound hook payloads and the RPC envelope.

use serde::{Deserialize, Deserializer, Serialize};

// =====================================================
// Watch State
// =====================================================

/// Durable per-account watch registration and history cursor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchState {
    pub account: String,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    /// Decimal string; never decreases.
    #[serde(default)]
    pub history_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_expiration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renew_after_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<HookSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_delivery_status: Option<DeliveryStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_delivery_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_delivery_note: Option<String>,
    #[serde(default)]
    pub updated_at_ms: i64,
}

impl WatchState {
    /// Numeric form of the stored cursor. Empty or unparsable cursors read as 0.
    pub fn history_cursor(&self) -> u64 {
        parse_history_id(&self.history_id).unwrap_or(0)
    }
}

/// Where and how normalized notifications are forwarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookSettings {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub include_body: bool,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

pub const DEFAULT_MAX_BODY_BYTES: usize = 20_000;

fn default_max_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

/// Outcome of the most recent hook attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Ok,
    Error,
    HttpError,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Ok => "ok",
            DeliveryStatus::Error => "error",
            DeliveryStatus::HttpError => "http_error",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =====================================================
// Push / Hook Wire Types
// =====================================================

/// Decoded Gmail notification carried inside a Pub/Sub message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    pub email_address: String,
    /// Normalized to a decimal string whether it arrived as a string or a number.
    #[serde(deserialize_with = "deserialize_history_id")]
    pub history_id: String,
}

/// Body POSTed to the downstream hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookPayload {
    pub source: String,
    pub account: String,
    pub history_id: String,
    pub messages: Vec<HookMessage>,
}

impl HookPayload {
    pub fn gmail(account: &str, history_id: &str, messages: Vec<HookMessage>) -> Self {
        Self {
            source: "gmail".to_string(),
            account: account.to_string(),
            history_id: history_id.to_string(),
            messages,
        }
    }
}

/// One normalized message in a hook payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookMessage {
    pub id: String,
    pub thread_id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub date: String,
    pub snippet: String,
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub body_truncated: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Parse a decimal history cursor. Rejects empty, signed and non-digit input.
pub fn parse_history_id(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    trimmed.parse().ok()
}

/// Accepts `"12345"` or `12345`, yields `"12345"`.
pub fn deserialize_history_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => parse_history_id(&s)
            .map(|id| id.to_string())
            .ok_or_else(|| D::Error::custom(format!("invalid historyId string: {:?}", s))),
        serde_json::Value::Number(n) => n
            .as_u64()
            .map(|id| id.to_string())
            .ok_or_else(|| D::Error::custom(format!("invalid historyId number: {}", n))),
        other => Err(D::Error::custom(format!(
            "historyId must be a string or number, got {}",
            other
        ))),
    }
}

// =====================================================
// RPC Types
// =====================================================

/// Secret-free view of the watch state for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchStatus {
    pub account: String,
    pub topic: String,
    pub labels: Vec<String>,
    pub history_id: String,
    pub expiration_ms: Option<i64>,
    pub provider_expiration_ms: Option<i64>,
    pub renew_after_ms: Option<i64>,
    pub renew_due: bool,
    pub hook_url: Option<String>,
    pub hook_include_body: bool,
    pub last_delivery_status: Option<DeliveryStatus>,
    pub last_delivery_at_ms: Option<i64>,
    pub last_delivery_note: Option<String>,
    pub updated_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
}

impl WatchStatus {
    pub fn from_state(state: &WatchState, now_ms: i64) -> Self {
        Self {
            account: state.account.clone(),
            topic: state.topic.clone(),
            labels: state.labels.clone(),
            history_id: state.history_id.clone(),
            expiration_ms: state.expiration_ms,
            provider_expiration_ms: state.provider_expiration_ms,
            renew_after_ms: state.renew_after_ms,
            renew_due: state.renew_after_ms.map(|at| now_ms >= at).unwrap_or(false),
            hook_url: state.hook.as_ref().map(|h| h.url.clone()),
            hook_include_body: state.hook.as_ref().map(|h| h.include_body).unwrap_or(false),
            last_delivery_status: state.last_delivery_status,
            last_delivery_at_ms: state.last_delivery_at_ms,
            last_delivery_note: state.last_delivery_note.clone(),
            updated_at_ms: state.updated_at_ms,
            uptime_secs: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> RpcResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}
