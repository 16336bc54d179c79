//! Gmail API collaborator.
//!
//! The relay only talks to Gmail through [`GmailApi`], so the server can be
//! built against a fake in tests. [`GmailClient`] is the reqwest-backed
//! implementation.

use crate::gmail_types::*;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GmailApiError {
    /// HTTP status, `None` for transport failures.
    pub status: Option<u16>,
    /// Machine-readable reason from `error.errors[0].reason` when Gmail sends one.
    pub reason: Option<String>,
    pub message: String,
}

impl GmailApiError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            reason: None,
            message: message.into(),
        }
    }

    pub fn http(status: u16, reason: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            reason: reason.map(|r| r.to_string()),
            message: message.into(),
        }
    }

    /// Build from a non-2xx response body, pulling out the structured reason if present.
    pub fn from_response(status: u16, body: &str) -> Self {
        match serde_json::from_str::<GoogleErrorBody>(body) {
            Ok(parsed) => {
                let reason = parsed
                    .error
                    .errors
                    .iter()
                    .find_map(|e| e.reason.clone())
                    .or(parsed.error.status);
                let message = if parsed.error.message.is_empty() {
                    truncate_error(body)
                } else {
                    parsed.error.message
                };
                Self {
                    status: Some(status),
                    reason,
                    message,
                }
            }
            Err(_) => Self::http(status, None, truncate_error(body)),
        }
    }

    /// Whether the start cursor has rolled off Gmail's history window.
    ///
    /// Structured reasons are checked first. The substring match on the
    /// message is a last resort for responses without a usable reason.
    pub fn is_stale_history(&self) -> bool {
        let status = match self.status {
            Some(s) => s,
            None => return false,
        };
        let message = self.message.to_ascii_lowercase();
        let mentions_history = message.contains("history");

        if let Some(reason) = self.reason.as_deref() {
            let reason = reason.to_ascii_lowercase();
            if status == 404 && (reason == "notfound" || reason == "not_found") {
                return true;
            }
            if status == 400
                && mentions_history
                && (reason == "failedprecondition"
                    || reason == "failed_precondition"
                    || reason == "invalidargument"
                    || reason == "invalid_argument")
            {
                return true;
            }
        }

        (status == 404 || status == 400)
            && mentions_history
            && ["not found", "too old", "expired", "invalid"]
                .iter()
                .any(|needle| message.contains(needle))
    }
}

impl std::fmt::Display for GmailApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.status, &self.reason) {
            (Some(status), Some(reason)) => {
                write!(f, "Gmail API error ({} {}): {}", status, reason, self.message)
            }
            (Some(status), None) => write!(f, "Gmail API error ({}): {}", status, self.message),
            (None, _) => write!(f, "Gmail API request failed: {}", self.message),
        }
    }
}

impl std::error::Error for GmailApiError {}

/// The Gmail operations the relay and the lifecycle verbs need.
#[async_trait]
pub trait GmailApi: Send + Sync {
    /// `users.history.list` restricted to `messageAdded`.
    async fn list_history(
        &self,
        user_id: &str,
        start_history_id: u64,
        max_results: u32,
    ) -> Result<HistoryResponse, GmailApiError>;

    /// `users.messages.list`, most recent first.
    async fn list_messages(
        &self,
        user_id: &str,
        label_ids: &[String],
        max_results: u32,
    ) -> Result<Vec<MessageRef>, GmailApiError>;

    async fn get_message(
        &self,
        user_id: &str,
        message_id: &str,
        format: MessageFormat,
    ) -> Result<GmailMessage, GmailApiError>;

    async fn watch(
        &self,
        user_id: &str,
        topic_name: &str,
        label_ids: &[String],
    ) -> Result<WatchResponse, GmailApiError>;

    async fn stop(&self, user_id: &str) -> Result<(), GmailApiError>;
}

/// Gmail API client
pub struct GmailClient {
    http: Client,
    base_url: String,
    access_token: String,
}

impl GmailClient {
    pub fn new(base_url: &str, access_token: String) -> Result<Self, String> {
        let http = Client::builder()
            .pool_max_idle_per_host(5)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| format!("Failed to build Gmail HTTP client: {}", e))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token,
        })
    }

    fn user_url(&self, user_id: &str, suffix: &str) -> String {
        format!("{}/users/{}/{}", self.base_url, urlencoding::encode(user_id), suffix)
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, GmailApiError> {
        let response = request
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| GmailApiError::transport(format!("Failed to {}: {}", what, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GmailApiError::transport(format!("Failed to read {} response: {}", what, e)))?;

        if !status.is_success() {
            return Err(GmailApiError::from_response(status.as_u16(), &body));
        }

        serde_json::from_str(&body).map_err(|e| {
            GmailApiError::transport(format!("Failed to parse {} response: {}", what, e))
        })
    }
}

#[async_trait]
impl GmailApi for GmailClient {
    async fn list_history(
        &self,
        user_id: &str,
        start_history_id: u64,
        max_results: u32,
    ) -> Result<HistoryResponse, GmailApiError> {
        let request = self.http.get(self.user_url(user_id, "history")).query(&[
            ("startHistoryId", start_history_id.to_string()),
            ("maxResults", max_results.to_string()),
            ("historyTypes", "messageAdded".to_string()),
        ]);
        self.send_json(request, "get history").await
    }

    async fn list_messages(
        &self,
        user_id: &str,
        label_ids: &[String],
        max_results: u32,
    ) -> Result<Vec<MessageRef>, GmailApiError> {
        let mut query: Vec<(&str, String)> = vec![("maxResults", max_results.to_string())];
        for label in label_ids {
            query.push(("labelIds", label.clone()));
        }
        let request = self.http.get(self.user_url(user_id, "messages")).query(&query);
        let list: MessageListResponse = self.send_json(request, "list messages").await?;
        Ok(list.messages)
    }

    async fn get_message(
        &self,
        user_id: &str,
        message_id: &str,
        format: MessageFormat,
    ) -> Result<GmailMessage, GmailApiError> {
        let mut query: Vec<(&str, &str)> = vec![("format", format.as_str())];
        if format == MessageFormat::Metadata {
            for header in METADATA_HEADERS {
                query.push(("metadataHeaders", header));
            }
        }
        let url = self.user_url(user_id, &format!("messages/{}", urlencoding::encode(message_id)));
        let request = self.http.get(url).query(&query);
        self.send_json(request, "get message").await
    }

    async fn watch(
        &self,
        user_id: &str,
        topic_name: &str,
        label_ids: &[String],
    ) -> Result<WatchResponse, GmailApiError> {
        let body = WatchRequest {
            topic_name: topic_name.to_string(),
            label_ids: label_ids.to_vec(),
            label_filter_behavior: if label_ids.is_empty() {
                None
            } else {
                Some("INCLUDE".to_string())
            },
        };
        let request = self.http.post(self.user_url(user_id, "watch")).json(&body);
        self.send_json(request, "setup watch").await
    }

    async fn stop(&self, user_id: &str) -> Result<(), GmailApiError> {
        let response = self
            .http
            .post(self.user_url(user_id, "stop"))
            .bearer_auth(&self.access_token)
            .header("Content-Length", "0")
            .send()
            .await
            .map_err(|e| GmailApiError::transport(format!("Failed to stop watch: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GmailApiError::from_response(status.as_u16(), &body));
        }
        Ok(())
    }
}

fn truncate_error(body: &str) -> String {
    const MAX: usize = 300;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_not_found_is_stale() {
        let body = r#"{"error":{"code":404,"message":"Requested entity was not found.","errors":[{"reason":"notFound","message":"Requested entity was not found."}],"status":"NOT_FOUND"}}"#;
        let err = GmailApiError::from_response(404, body);
        assert_eq!(err.reason.as_deref(), Some("notFound"));
        assert!(err.is_stale_history());
    }

    #[test]
    fn substring_fallback_detects_stale_history() {
        let err = GmailApiError::http(400, None, "Invalid startHistoryId: history is too old");
        assert!(err.is_stale_history());
    }

    #[test]
    fn other_errors_are_not_stale() {
        assert!(!GmailApiError::http(500, None, "backend error").is_stale_history());
        assert!(!GmailApiError::http(403, Some("forbidden"), "history forbidden").is_stale_history());
        assert!(!GmailApiError::http(400, Some("badRequest"), "bad label").is_stale_history());
        assert!(!GmailApiError::transport("connection reset").is_stale_history());
    }

    #[test]
    fn non_json_error_body_is_kept_as_message() {
        let err = GmailApiError::from_response(502, "upstream unavailable");
        assert_eq!(err.status, Some(502));
        assert_eq!(err.message, "upstream unavailable");
        assert!(err.to_string().contains("502"));
    }

    #[test]
    fn user_urls_are_percent_encoded() {
        let client = GmailClient::new("https://gmail.test/gmail/v1/", "token".into()).unwrap();
        assert_eq!(
            client.user_url("a b@c.com", "history"),
            "https://gmail.test/gmail/v1/users/a%20b%40c.com/history"
        );
        assert_eq!(client.user_url("me", "watch"), "https://gmail.test/gmail/v1/users/me/watch");
    }
}
