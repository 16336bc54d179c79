//! History reconciliation: turns a pushed cursor into the concrete set of
//! new message IDs, falling back to a bounded resync when Gmail no longer
//! has history for the stored cursor.

use crate::gmail_api::GmailApi;
use crate::relay::RelayError;
use crate::store::WatchStore;
use gmail_relay_types::{parse_history_id, PushPayload, WatchState};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct ReconcileLimits {
    pub history_max_results: u32,
    pub resync_max_results: u32,
}

/// New history found for one push.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub start_history_id: u64,
    /// Cursor to persist once the change set has been handled.
    pub next_history_id: String,
    /// Deduplicated, in first-seen order.
    pub message_ids: Vec<String>,
    pub resynced: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// The pushed cursor is not newer than the stored one.
    AlreadyProcessed,
    Changes(ChangeSet),
}

pub struct HistoryReconciler {
    api: Arc<dyn GmailApi>,
    store: Arc<WatchStore>,
    limits: ReconcileLimits,
}

impl HistoryReconciler {
    pub fn new(api: Arc<dyn GmailApi>, store: Arc<WatchStore>, limits: ReconcileLimits) -> Self {
        Self { api, store, limits }
    }

    /// Resolve the push against the stored cursor. Callers hold the store's
    /// sync gate for the duration of resolve + commit.
    pub async fn resolve(&self, state: &WatchState, push: &PushPayload) -> Result<Reconciled, RelayError> {
        let start = self
            .store
            .start_history_id(&push.history_id)
            .await
            .map_err(RelayError::Store)?;
        if start == 0 {
            log::debug!(
                "[GMAIL_RELAY] historyId {} already processed (stored {})",
                push.history_id,
                state.history_id
            );
            return Ok(Reconciled::AlreadyProcessed);
        }

        let account = self.store.account();
        match self
            .api
            .list_history(account, start, self.limits.history_max_results)
            .await
        {
            Ok(response) => {
                let mut seen = HashSet::new();
                let message_ids = response
                    .history
                    .iter()
                    .flat_map(|record| record.messages_added.iter())
                    .map(|added| added.message.id.clone())
                    .filter(|id| !id.is_empty() && seen.insert(id.clone()))
                    .collect();

                let next_history_id = response
                    .history_id
                    .as_deref()
                    .and_then(parse_history_id)
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| push.history_id.clone());

                Ok(Reconciled::Changes(ChangeSet {
                    start_history_id: start,
                    next_history_id,
                    message_ids,
                    resynced: false,
                }))
            }
            Err(e) if e.is_stale_history() => {
                log::warn!(
                    "[GMAIL_RELAY] History from {} is no longer available ({}); resyncing last {} messages",
                    start,
                    e,
                    self.limits.resync_max_results
                );
                let refs = self
                    .api
                    .list_messages(account, &state.labels, self.limits.resync_max_results)
                    .await
                    .map_err(RelayError::Upstream)?;

                let mut seen = HashSet::new();
                let message_ids = refs
                    .into_iter()
                    .map(|r| r.id)
                    .filter(|id| !id.is_empty() && seen.insert(id.clone()))
                    .take(self.limits.resync_max_results as usize)
                    .collect();

                Ok(Reconciled::Changes(ChangeSet {
                    start_history_id: start,
                    next_history_id: push.history_id.clone(),
                    message_ids,
                    resynced: true,
                }))
            }
            Err(e) => Err(RelayError::Upstream(e)),
        }
    }

    /// Persist the advanced cursor.
    pub async fn commit(&self, changes: &ChangeSet) -> Result<(), RelayError> {
        self.store
            .advance_history_id(&changes.next_history_id)
            .await
            .map(|_| ())
            .map_err(RelayError::Store)
    }
}
