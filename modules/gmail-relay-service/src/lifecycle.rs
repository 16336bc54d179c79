//! Watch lifecycle verbs: start, renew, stop, status.

use crate::config::WatchSettings;
use crate::gmail_api::GmailApi;
use crate::gmail_types::WatchResponse;
use crate::store::WatchStore;
use chrono::Utc;
use gmail_relay_types::{HookSettings, WatchState, WatchStatus};

/// Register the watch with Gmail and seed the store.
pub async fn start_watch(
    api: &dyn GmailApi,
    store: &WatchStore,
    settings: &WatchSettings,
    hook: Option<HookSettings>,
) -> Result<WatchState, String> {
    let topic = settings
        .topic
        .clone()
        .ok_or("GMAIL_RELAY_TOPIC must be set to start a watch")?;

    let response = api
        .watch(store.account(), &topic, &settings.labels)
        .await
        .map_err(|e| format!("Failed to start watch: {}", e))?;

    let previous = store.get();
    let now_ms = Utc::now().timestamp_millis();
    let mut state = WatchState {
        account: store.account().to_string(),
        topic,
        labels: settings.labels.clone(),
        history_id: response.history_id.clone(),
        hook: hook.or_else(|| previous.as_ref().and_then(|p| p.hook.clone())),
        ..Default::default()
    };
    if let Some(previous) = previous {
        state.last_delivery_status = previous.last_delivery_status;
        state.last_delivery_at_ms = previous.last_delivery_at_ms;
        state.last_delivery_note = previous.last_delivery_note;
    }
    apply_expiration(&mut state, &response, settings, now_ms);

    let saved = store
        .save(state)
        .await
        .map_err(|e| format!("Failed to save watch state: {}", e))?;
    log::info!(
        "[GMAIL_RELAY] Watch started for {} on {} (historyId {})",
        saved.account,
        saved.topic,
        saved.history_id
    );
    Ok(saved)
}

/// Re-issue the watch with the stored topic and labels.
pub async fn renew_watch(
    api: &dyn GmailApi,
    store: &WatchStore,
    settings: &WatchSettings,
) -> Result<WatchState, String> {
    let current = store
        .get()
        .ok_or_else(|| format!("No watch state for {}; run `start` first", store.account()))?;

    let response = api
        .watch(store.account(), &current.topic, &current.labels)
        .await
        .map_err(|e| format!("Failed to renew watch: {}", e))?;

    let now_ms = Utc::now().timestamp_millis();
    let saved = store
        .update(|state| {
            if state.history_id.is_empty() {
                state.history_id = response.history_id.clone();
            }
            apply_expiration(state, &response, settings, now_ms);
        })
        .await
        .map_err(|e| format!("Failed to save watch state: {}", e))?;
    log::info!(
        "[GMAIL_RELAY] Watch renewed for {} (expires {:?})",
        saved.account,
        saved.expiration_ms
    );
    Ok(saved)
}

/// Stop the Gmail watch and forget the local state.
pub async fn stop_watch(api: &dyn GmailApi, store: &WatchStore) -> Result<bool, String> {
    api.stop(store.account())
        .await
        .map_err(|e| format!("Failed to stop watch: {}", e))?;
    let removed = store
        .delete()
        .await
        .map_err(|e| format!("Failed to delete watch state: {}", e))?;
    log::info!("[GMAIL_RELAY] Watch stopped for {}", store.account());
    Ok(removed)
}

pub fn watch_status(store: &WatchStore) -> Option<WatchStatus> {
    store
        .get()
        .map(|state| WatchStatus::from_state(&state, Utc::now().timestamp_millis()))
}

/// Persist `hook` into the stored watch so later runs pick it up without configuration.
pub async fn save_hook(store: &WatchStore, hook: HookSettings) -> Result<WatchState, String> {
    store
        .update(move |state| state.hook = Some(hook))
        .await
        .map_err(|e| format!("Failed to save hook settings: {}", e))
}

fn apply_expiration(state: &mut WatchState, response: &WatchResponse, settings: &WatchSettings, now_ms: i64) {
    let provider = (response.expiration > 0).then_some(response.expiration);
    let requested = settings
        .ttl
        .map(|ttl| now_ms.saturating_add(ttl.as_millis() as i64));

    state.provider_expiration_ms = provider;
    state.expiration_ms = match (provider, requested) {
        (Some(p), Some(r)) => Some(p.min(r)),
        (p, r) => p.or(r),
    };
    state.renew_after_ms = Some(now_ms.saturating_add(settings.renew_after.as_millis() as i64));
}
