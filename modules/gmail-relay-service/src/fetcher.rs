//! Resolves message IDs into normalized hook messages.

use crate::gmail_api::{GmailApi, GmailApiError};
use crate::gmail_types::{GmailMessage, MessageFormat};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use gmail_relay_types::HookMessage;
use std::sync::Arc;

/// Concurrent `messages.get` calls per push.
const FETCH_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub include_body: bool,
    pub max_bytes: usize,
}

pub struct MessageFetcher {
    api: Arc<dyn GmailApi>,
    account: String,
}

impl MessageFetcher {
    pub fn new(api: Arc<dyn GmailApi>, account: &str) -> Self {
        Self {
            api,
            account: account.to_string(),
        }
    }

    /// Fetch every message, preserving input order. The first failure aborts the batch.
    pub async fn fetch_all(
        &self,
        ids: &[String],
        options: FetchOptions,
    ) -> Result<Vec<HookMessage>, GmailApiError> {
        let format = if options.include_body {
            MessageFormat::Full
        } else {
            MessageFormat::Metadata
        };

        stream::iter(ids.to_vec())
            .map(|id| {
                let api = self.api.clone();
                let account = self.account.clone();
                async move {
                    let message = api.get_message(&account, &id, format).await?;
                    Ok::<_, GmailApiError>(normalize(message, options))
                }
            })
            .buffered(FETCH_CONCURRENCY)
            .try_collect()
            .await
    }
}

pub fn normalize(message: GmailMessage, options: FetchOptions) -> HookMessage {
    let header = |name: &str| message.header(name).unwrap_or_default().to_string();

    let (body, body_truncated) = if options.include_body {
        let text = message.text_body().unwrap_or_default();
        let (truncated, was_truncated) = truncate_utf8(&text, options.max_bytes);
        (Some(truncated.to_string()), was_truncated)
    } else {
        (None, false)
    };

    HookMessage {
        from: header("From"),
        to: header("To"),
        subject: header("Subject"),
        date: header("Date"),
        snippet: message.snippet.clone().unwrap_or_default(),
        labels: message.label_ids.clone(),
        id: message.id,
        thread_id: message.thread_id,
        body,
        body_truncated,
    }
}

/// Cut `text` to at most `max_bytes` without splitting a code point.
/// The flag is true exactly when the input was longer than the budget.
pub fn truncate_utf8(text: &str, max_bytes: usize) -> (&str, bool) {
    if text.len() <= max_bytes {
        return (text, false);
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    (&text[..end], true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmail_types::*;
    use async_trait::async_trait;
    use base64::Engine;
    use parking_lot::Mutex;

    struct StubApi {
        fail_on: Option<String>,
        formats: Mutex<Vec<MessageFormat>>,
    }

    #[async_trait]
    impl GmailApi for StubApi {
        async fn list_history(&self, _: &str, _: u64, _: u32) -> Result<HistoryResponse, GmailApiError> {
            unreachable!()
        }

        async fn list_messages(&self, _: &str, _: &[String], _: u32) -> Result<Vec<MessageRef>, GmailApiError> {
            unreachable!()
        }

        async fn get_message(
            &self,
            _user: &str,
            id: &str,
            format: MessageFormat,
        ) -> Result<GmailMessage, GmailApiError> {
            self.formats.lock().push(format);
            if self.fail_on.as_deref() == Some(id) {
                return Err(GmailApiError::http(500, None, "boom"));
            }
            Ok(sample_message(id, "Hello wörld"))
        }

        async fn watch(&self, _: &str, _: &str, _: &[String]) -> Result<WatchResponse, GmailApiError> {
            unreachable!()
        }

        async fn stop(&self, _: &str) -> Result<(), GmailApiError> {
            unreachable!()
        }
    }

    fn sample_message(id: &str, body: &str) -> GmailMessage {
        let header = |name: &str, value: &str| MessageHeader {
            name: name.into(),
            value: value.into(),
        };
        GmailMessage {
            id: id.into(),
            thread_id: format!("t-{}", id),
            label_ids: vec!["INBOX".into(), "UNREAD".into()],
            snippet: Some("Hello".into()),
            payload: Some(MessagePart {
                mime_type: Some("text/plain".into()),
                headers: vec![
                    header("From", "Ann <ann@example.com>"),
                    header("to", "a@b.com"),
                    header("Subject", "Hi"),
                    header("Date", "Mon, 1 Jan 2024 10:00:00 +0000"),
                ],
                body: Some(MessageBody {
                    data: Some(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(body)),
                    size: None,
                }),
                ..Default::default()
            }),
            internal_date: None,
        }
    }

    #[test]
    fn truncation_never_splits_code_points() {
        let samples = ["", "ascii only", "héllo wörld", "日本語のテキスト", "emoji 🎉🎉 done", "a\u{0301}b"];
        for text in samples {
            for budget in 0..=text.len() + 2 {
                let (cut, truncated) = truncate_utf8(text, budget);
                assert!(cut.len() <= budget);
                assert!(text.starts_with(cut));
                assert_eq!(truncated, text.len() > budget, "{:?} @ {}", text, budget);
                assert!(std::str::from_utf8(cut.as_bytes()).is_ok());
            }
        }
    }

    #[test]
    fn truncation_backs_off_to_boundary() {
        // "é" is two bytes; a 2-byte budget on "aé" must keep only "a".
        assert_eq!(truncate_utf8("aé", 2), ("a", true));
        assert_eq!(truncate_utf8("aé", 3), ("aé", false));
    }

    #[test]
    fn normalize_extracts_headers_and_body() {
        let msg = normalize(
            sample_message("m1", "Hello wörld"),
            FetchOptions { include_body: true, max_bytes: 7 },
        );
        assert_eq!(msg.id, "m1");
        assert_eq!(msg.thread_id, "t-m1");
        assert_eq!(msg.from, "Ann <ann@example.com>");
        assert_eq!(msg.to, "a@b.com");
        assert_eq!(msg.subject, "Hi");
        assert_eq!(msg.labels, vec!["INBOX", "UNREAD"]);
        assert_eq!(msg.body.as_deref(), Some("Hello w"));
        assert!(msg.body_truncated);
    }

    #[test]
    fn normalize_without_body_leaves_body_unset() {
        let msg = normalize(
            sample_message("m1", "Hello"),
            FetchOptions { include_body: false, max_bytes: 7 },
        );
        assert!(msg.body.is_none());
        assert!(!msg.body_truncated);
        assert_eq!(msg.subject, "Hi");
    }

    #[tokio::test]
    async fn fetch_all_preserves_order_and_format() {
        let api = Arc::new(StubApi { fail_on: None, formats: Mutex::new(Vec::new()) });
        let fetcher = MessageFetcher::new(api.clone(), "a@b.com");
        let ids: Vec<String> = (0..9).map(|i| format!("m{}", i)).collect();

        let messages = fetcher
            .fetch_all(&ids, FetchOptions { include_body: false, max_bytes: 100 })
            .await
            .unwrap();
        let got: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(got, ids.iter().map(|s| s.as_str()).collect::<Vec<_>>());
        assert!(api.formats.lock().iter().all(|f| *f == MessageFormat::Metadata));
    }

    #[tokio::test]
    async fn fetch_runs_on_a_spawned_task() {
        let api = Arc::new(StubApi { fail_on: None, formats: Mutex::new(Vec::new()) });
        let fetcher = MessageFetcher::new(api, "a@b.com");
        let ids = vec!["m1".to_string(), "m2".to_string()];

        let messages = tokio::spawn(async move {
            fetcher
                .fetch_all(&ids, FetchOptions { include_body: false, max_bytes: 100 })
                .await
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn one_failure_aborts_the_batch() {
        let api = Arc::new(StubApi { fail_on: Some("m2".into()), formats: Mutex::new(Vec::new()) });
        let fetcher = MessageFetcher::new(api, "a@b.com");
        let ids = vec!["m1".to_string(), "m2".to_string(), "m3".to_string()];
        let err = fetcher
            .fetch_all(&ids, FetchOptions { include_body: true, max_bytes: 100 })
            .await
            .unwrap_err();
        assert_eq!(err.status, Some(500));
    }
}
