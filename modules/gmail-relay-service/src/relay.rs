//! Per-push pipeline: gate, reconcile, fetch, dispatch, acknowledge.

use crate::config::AckPolicy;
use crate::fetcher::{FetchOptions, MessageFetcher};
use crate::gmail_api::GmailApiError;
use crate::hook::{DeliveryOutcome, HookDispatcher};
use crate::reconciler::{HistoryReconciler, Reconciled};
use crate::store::{StoreError, WatchStore};
use axum::http::StatusCode;
use gmail_relay_types::{HookPayload, HookSettings, PushPayload};
use std::sync::Arc;

#[derive(Debug)]
pub enum RelayError {
    Store(StoreError),
    Upstream(GmailApiError),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::Store(e) => write!(f, "{}", e),
            RelayError::Upstream(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RelayError {}

/// How one push ended, short of an error.
#[derive(Debug, Clone)]
pub enum PushOutcome {
    AccountMismatch,
    NotWatching,
    Duplicate,
    NoNewMessages,
    /// New messages but no hook configured.
    NoHook,
    /// Diagnostic mode: no hook, payload returned to the caller.
    Echo(HookPayload),
    Delivered {
        history_id: String,
        messages: usize,
        outcome: DeliveryOutcome,
    },
    /// Hook failed under the redeliver policy; the cursor was not advanced.
    HookRejected { outcome: DeliveryOutcome },
}

impl PushOutcome {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PushOutcome::AccountMismatch
            | PushOutcome::NotWatching
            | PushOutcome::Duplicate
            | PushOutcome::NoNewMessages
            | PushOutcome::NoHook => StatusCode::ACCEPTED,
            PushOutcome::Echo(_) | PushOutcome::Delivered { .. } => StatusCode::OK,
            PushOutcome::HookRejected { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PushOutcome::AccountMismatch => "account_mismatch",
            PushOutcome::NotWatching => "not_watching",
            PushOutcome::Duplicate => "duplicate",
            PushOutcome::NoNewMessages => "no_new_messages",
            PushOutcome::NoHook => "no_hook",
            PushOutcome::Echo(_) => "echo",
            PushOutcome::Delivered { .. } => "delivered",
            PushOutcome::HookRejected { .. } => "hook_rejected",
        }
    }
}

pub struct RelayOptions {
    /// Hook from configuration; takes precedence over the one stored with the watch.
    pub hook: Option<HookSettings>,
    /// Fetch options when no hook is configured.
    pub fetch_defaults: FetchOptions,
    pub echo_payload: bool,
    pub ack_policy: AckPolicy,
}

pub struct Relay {
    store: Arc<WatchStore>,
    reconciler: HistoryReconciler,
    fetcher: MessageFetcher,
    dispatcher: HookDispatcher,
    options: RelayOptions,
}

impl Relay {
    pub fn new(
        store: Arc<WatchStore>,
        reconciler: HistoryReconciler,
        fetcher: MessageFetcher,
        dispatcher: HookDispatcher,
        options: RelayOptions,
    ) -> Self {
        Self {
            store,
            reconciler,
            fetcher,
            dispatcher,
            options,
        }
    }

    pub async fn handle_push(&self, push: &PushPayload) -> Result<PushOutcome, RelayError> {
        let account = self.store.account();
        if !push.email_address.eq_ignore_ascii_case(account) {
            log::warn!(
                "[GMAIL_RELAY] Ignoring push for {} (watching {})",
                push.email_address,
                account
            );
            return Ok(PushOutcome::AccountMismatch);
        }

        let mut gate = Some(self.store.sync_gate().await);

        let state = match self.store.get() {
            Some(state) => state,
            None => {
                log::warn!("[GMAIL_RELAY] Push for {} but no watch has been started", account);
                return Ok(PushOutcome::NotWatching);
            }
        };

        let changes = match self.reconciler.resolve(&state, push).await? {
            Reconciled::AlreadyProcessed => return Ok(PushOutcome::Duplicate),
            Reconciled::Changes(changes) => changes,
        };

        let hook = self.options.hook.clone().or_else(|| state.hook.clone());
        let fetch_options = hook
            .as_ref()
            .map(|h| FetchOptions {
                include_body: h.include_body,
                max_bytes: h.max_bytes,
            })
            .unwrap_or(self.options.fetch_defaults);

        let messages = self
            .fetcher
            .fetch_all(&changes.message_ids, fetch_options)
            .await
            .map_err(RelayError::Upstream)?;

        let deferred =
            self.options.ack_policy == AckPolicy::Redeliver && hook.is_some() && !messages.is_empty();
        if !deferred {
            self.reconciler.commit(&changes).await?;
            gate.take();
        }

        if messages.is_empty() {
            log::debug!(
                "[GMAIL_RELAY] No new messages for historyId {}, cursor now {}",
                push.history_id,
                changes.next_history_id
            );
            return Ok(PushOutcome::NoNewMessages);
        }

        let count = messages.len();
        let payload = HookPayload::gmail(account, &push.history_id, messages);

        let hook = match hook {
            Some(hook) => hook,
            None if self.options.echo_payload => {
                log::info!(
                    "[GMAIL_RELAY] Echoing {} message(s) for historyId {} (no hook configured)",
                    count,
                    push.history_id
                );
                return Ok(PushOutcome::Echo(payload));
            }
            None => {
                log::info!(
                    "[GMAIL_RELAY] {} new message(s) for historyId {} but no hook is configured",
                    count,
                    push.history_id
                );
                return Ok(PushOutcome::NoHook);
            }
        };

        let outcome = self.dispatcher.deliver_detached(hook, payload).await;
        if let Err(e) = self
            .store
            .record_delivery(outcome.status, outcome.note.clone())
            .await
        {
            log::error!("[GMAIL_RELAY] Failed to record delivery status: {}", e);
        }

        if outcome.is_ok() {
            if deferred {
                self.reconciler.commit(&changes).await?;
            }
            log::info!(
                "[GMAIL_RELAY] Delivered {} message(s) for historyId {}{}",
                count,
                push.history_id,
                if changes.resynced { " (resync)" } else { "" }
            );
        } else {
            log::warn!(
                "[GMAIL_RELAY] Hook delivery failed for historyId {}: {}",
                push.history_id,
                outcome.note.as_deref().unwrap_or(outcome.status.as_str())
            );
            if deferred {
                return Ok(PushOutcome::HookRejected { outcome });
            }
        }

        drop(gate);
        Ok(PushOutcome::Delivered {
            history_id: push.history_id.clone(),
            messages: count,
            outcome,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::FakeGmail;
    use super::*;
    use crate::hook::test_support::spawn_hook;
    use crate::reconciler::ReconcileLimits;
    use gmail_relay_types::{DeliveryStatus, WatchState};
    use std::time::Duration;

    struct Harness {
        dir: tempfile::TempDir,
        store: Arc<WatchStore>,
        api: Arc<FakeGmail>,
        relay: Relay,
    }

    async fn harness(api: FakeGmail, hook: Option<HookSettings>, echo: bool, ack: AckPolicy) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(WatchStore::open(dir.path(), "a@b.com").unwrap());
        store
            .save(WatchState {
                account: "a@b.com".into(),
                topic: "projects/p/topics/t".into(),
                labels: vec!["INBOX".into()],
                history_id: "100".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let api = Arc::new(api);
        let relay = Relay::new(
            store.clone(),
            HistoryReconciler::new(
                api.clone(),
                store.clone(),
                ReconcileLimits {
                    history_max_results: 100,
                    resync_max_results: 10,
                },
            ),
            MessageFetcher::new(api.clone(), "a@b.com"),
            HookDispatcher::new(Duration::from_secs(5)),
            RelayOptions {
                hook,
                fetch_defaults: FetchOptions {
                    include_body: false,
                    max_bytes: 100,
                },
                echo_payload: echo,
                ack_policy: ack,
            },
        );
        Harness {
            dir,
            store,
            api,
            relay,
        }
    }

    fn hook(url: &str) -> HookSettings {
        HookSettings {
            url: url.to_string(),
            token: Some("hook-token".into()),
            include_body: false,
            max_bytes: 100,
        }
    }

    fn push(account: &str, history_id: &str) -> PushPayload {
        PushPayload {
            email_address: account.into(),
            history_id: history_id.into(),
        }
    }

    #[tokio::test]
    async fn delivers_and_records_status() {
        let (url, captured) = spawn_hook(StatusCode::OK).await;
        let h = harness(
            FakeGmail::with_history(&[&["m1"]], Some("200")),
            Some(hook(&url)),
            false,
            AckPolicy::Acknowledge,
        )
        .await;

        let outcome = h.relay.handle_push(&push("a@b.com", "200")).await.unwrap();
        assert_eq!(outcome.status_code(), StatusCode::OK);
        assert!(matches!(outcome, PushOutcome::Delivered { messages: 1, .. }));

        let state = h.store.get().unwrap();
        assert_eq!(state.history_id, "200");
        assert_eq!(state.last_delivery_status, Some(DeliveryStatus::Ok));
        assert_eq!(captured.lock().await[0].body["messages"][0]["id"], "m1");
    }

    #[tokio::test]
    async fn mismatched_account_touches_nothing() {
        let h = harness(
            FakeGmail::with_history(&[&["m1"]], Some("200")),
            None,
            true,
            AckPolicy::Acknowledge,
        )
        .await;

        let outcome = h.relay.handle_push(&push("other@b.com", "200")).await.unwrap();
        assert!(matches!(outcome, PushOutcome::AccountMismatch));
        assert!(h.api.history_calls.lock().is_empty());
        assert!(h.api.fetched_ids().is_empty());
        assert_eq!(h.store.get().unwrap().history_id, "100");
    }

    #[tokio::test]
    async fn empty_change_set_advances_without_hook() {
        let (url, captured) = spawn_hook(StatusCode::OK).await;
        let h = harness(
            FakeGmail::with_history(&[], Some("150")),
            Some(hook(&url)),
            false,
            AckPolicy::Redeliver,
        )
        .await;

        let outcome = h.relay.handle_push(&push("a@b.com", "150")).await.unwrap();
        assert!(matches!(outcome, PushOutcome::NoNewMessages));
        assert_eq!(h.store.get().unwrap().history_id, "150");
        assert!(captured.lock().await.is_empty());
    }

    #[tokio::test]
    async fn no_hook_without_echo_is_accepted() {
        let h = harness(
            FakeGmail::with_history(&[&["m1"]], Some("200")),
            None,
            false,
            AckPolicy::Acknowledge,
        )
        .await;

        let outcome = h.relay.handle_push(&push("a@b.com", "200")).await.unwrap();
        assert!(matches!(outcome, PushOutcome::NoHook));
        assert_eq!(outcome.status_code(), StatusCode::ACCEPTED);
        assert_eq!(h.store.get().unwrap().history_id, "200");
    }

    #[tokio::test]
    async fn hook_failure_under_ack_still_advances() {
        let (url, _captured) = spawn_hook(StatusCode::INTERNAL_SERVER_ERROR).await;
        let h = harness(
            FakeGmail::with_history(&[&["m1"]], Some("200")),
            Some(hook(&url)),
            false,
            AckPolicy::Acknowledge,
        )
        .await;

        let outcome = h.relay.handle_push(&push("a@b.com", "200")).await.unwrap();
        assert_eq!(outcome.status_code(), StatusCode::OK);
        let state = h.store.get().unwrap();
        assert_eq!(state.history_id, "200");
        assert_eq!(state.last_delivery_status, Some(DeliveryStatus::HttpError));
        assert_eq!(state.last_delivery_note.as_deref(), Some("HTTP 500"));
    }

    #[tokio::test]
    async fn hook_failure_under_redeliver_keeps_cursor() {
        let (url, captured) = spawn_hook(StatusCode::SERVICE_UNAVAILABLE).await;
        let h = harness(
            FakeGmail::with_history(&[&["m1"]], Some("200")),
            Some(hook(&url)),
            false,
            AckPolicy::Redeliver,
        )
        .await;

        let outcome = h.relay.handle_push(&push("a@b.com", "200")).await.unwrap();
        assert!(matches!(outcome, PushOutcome::HookRejected { .. }));
        assert_eq!(outcome.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(h.store.get().unwrap().history_id, "100");

        // The redelivery passes the idempotency gate and is processed again.
        let again = h.relay.handle_push(&push("a@b.com", "200")).await.unwrap();
        assert!(matches!(again, PushOutcome::HookRejected { .. }));
        assert_eq!(captured.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn upstream_failure_is_an_error_and_keeps_cursor() {
        let h = harness(
            FakeGmail::failing_history(500, "backend error"),
            None,
            false,
            AckPolicy::Acknowledge,
        )
        .await;

        let err = h.relay.handle_push(&push("a@b.com", "200")).await.unwrap_err();
        assert!(matches!(err, RelayError::Upstream(_)));
        assert_eq!(h.store.get().unwrap().history_id, "100");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicate_pushes_sync_once() {
        let h = Arc::new(
            harness(
                FakeGmail::with_history(&[&["m1"]], Some("200")),
                None,
                true,
                AckPolicy::Acknowledge,
            )
            .await,
        );

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let h = h.clone();
                tokio::spawn(async move { h.relay.handle_push(&push("a@b.com", "200")).await })
            })
            .collect();
        let mut outcomes = Vec::new();
        for task in tasks {
            outcomes.push(task.await.unwrap().unwrap());
        }

        let processed = outcomes
            .iter()
            .filter(|o| !matches!(o, PushOutcome::Duplicate))
            .count();
        assert_eq!(processed, 1);
        assert!(outcomes.iter().any(|o| matches!(o, PushOutcome::Echo(_))));
        assert_eq!(h.api.history_calls.lock().len(), 1);
        assert_eq!(h.api.fetched_ids(), vec!["m1".to_string()]);
        assert_eq!(h.store.get().unwrap().history_id, "200");
    }

    #[tokio::test]
    async fn store_write_failure_is_a_store_error() {
        let h = harness(
            FakeGmail::with_history(&[&["m1"]], Some("200")),
            None,
            true,
            AckPolicy::Acknowledge,
        )
        .await;
        // Replace the state directory with a plain file so the cursor cannot be persisted.
        std::fs::remove_dir_all(h.dir.path()).unwrap();
        std::fs::write(h.dir.path(), b"").unwrap();

        let err = h.relay.handle_push(&push("a@b.com", "200")).await.unwrap_err();
        assert!(matches!(err, RelayError::Store(_)));
        assert_eq!(h.store.get().unwrap().history_id, "100");

        std::fs::remove_file(h.dir.path()).unwrap();
    }
}
