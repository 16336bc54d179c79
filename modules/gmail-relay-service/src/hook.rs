//! Downstream webhook delivery.

use gmail_relay_types::{DeliveryStatus, HookPayload, HookSettings};
use std::time::Duration;

/// Result of one hook POST.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    pub status: DeliveryStatus,
    pub http_status: Option<u16>,
    pub note: Option<String>,
}

impl DeliveryOutcome {
    pub fn is_ok(&self) -> bool {
        self.status == DeliveryStatus::Ok
    }
}

#[derive(Clone)]
pub struct HookDispatcher {
    http: reqwest::Client,
    timeout: Duration,
}

impl HookDispatcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout,
        }
    }

    /// POST the payload. Never fails; the outcome says what happened.
    pub async fn deliver(&self, hook: &HookSettings, payload: &HookPayload) -> DeliveryOutcome {
        let mut request = self
            .http
            .post(&hook.url)
            .timeout(self.timeout)
            .json(payload);
        if let Some(token) = hook.token.as_deref().filter(|t| !t.is_empty()) {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => DeliveryOutcome {
                status: DeliveryStatus::Ok,
                http_status: Some(response.status().as_u16()),
                note: None,
            },
            Ok(response) => {
                let code = response.status().as_u16();
                DeliveryOutcome {
                    status: DeliveryStatus::HttpError,
                    http_status: Some(code),
                    note: Some(format!("HTTP {}", code)),
                }
            }
            Err(e) => DeliveryOutcome {
                status: DeliveryStatus::Error,
                http_status: None,
                note: Some(e.to_string()),
            },
        }
    }

    /// Deliver on a detached task so dropping the inbound request cannot cancel it.
    pub async fn deliver_detached(&self, hook: HookSettings, payload: HookPayload) -> DeliveryOutcome {
        let dispatcher = self.clone();
        let task = tokio::spawn(async move { dispatcher.deliver(&hook, &payload).await });
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => DeliveryOutcome {
                status: DeliveryStatus::Error,
                http_status: None,
                note: Some(format!("hook task failed: {}", e)),
            },
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::spawn_hook;
    use super::*;
    use axum::http::StatusCode;
    use gmail_relay_types::HookMessage;

    fn settings(url: &str, token: Option<&str>) -> HookSettings {
        HookSettings {
            url: url.to_string(),
            token: token.map(|t| t.to_string()),
            include_body: false,
            max_bytes: 100,
        }
    }

    fn payload() -> HookPayload {
        HookPayload::gmail(
            "a@b.com",
            "200",
            vec![HookMessage {
                id: "m1".into(),
                thread_id: "t1".into(),
                ..Default::default()
            }],
        )
    }

    #[tokio::test]
    async fn successful_delivery_sends_bearer_and_json() {
        let (url, captured) = spawn_hook(StatusCode::OK).await;
        let dispatcher = HookDispatcher::new(Duration::from_secs(5));

        let outcome = dispatcher.deliver(&settings(&url, Some("hook-token")), &payload()).await;
        assert!(outcome.is_ok());
        assert_eq!(outcome.http_status, Some(200));

        let captured = captured.lock().await;
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].authorization.as_deref(), Some("Bearer hook-token"));
        assert_eq!(captured[0].body["source"], "gmail");
        assert_eq!(captured[0].body["historyId"], "200");
        assert_eq!(captured[0].body["messages"][0]["threadId"], "t1");
    }

    #[tokio::test]
    async fn non_2xx_is_http_error() {
        let (url, captured) = spawn_hook(StatusCode::SERVICE_UNAVAILABLE).await;
        let dispatcher = HookDispatcher::new(Duration::from_secs(5));

        let outcome = dispatcher.deliver_detached(settings(&url, None), payload()).await;
        assert_eq!(outcome.status, DeliveryStatus::HttpError);
        assert_eq!(outcome.note.as_deref(), Some("HTTP 503"));
        assert!(captured.lock().await[0].authorization.is_none());
    }

    #[tokio::test]
    async fn connection_failure_is_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dispatcher = HookDispatcher::new(Duration::from_secs(2));
        let outcome = dispatcher
            .deliver(&settings(&format!("http://{}/hook", addr), None), &payload())
            .await;
        assert_eq!(outcome.status, DeliveryStatus::Error);
        assert!(outcome.note.is_some());
    }
}
