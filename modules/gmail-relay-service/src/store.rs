//! Per-account watch state store.
//!
//! One JSON document per account is the durable source of truth. Reads are
//! served from an in-memory snapshot; every mutation runs under a single
//! async write lock, is persisted (temp file + rename) and only then
//! published to the snapshot. The history cursor is monotonic on every
//! write path.

use chrono::Utc;
use gmail_relay_types::{parse_history_id, DeliveryStatus, WatchState};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Serde(serde_json::Error),
    /// No watch has been started for this account.
    Missing(String),
    InvalidHistoryId(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "watch state I/O error: {}", e),
            StoreError::Serde(e) => write!(f, "watch state is not valid JSON: {}", e),
            StoreError::Missing(account) => write!(f, "no watch state for {}", account),
            StoreError::InvalidHistoryId(raw) => write!(f, "invalid history id: {:?}", raw),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e)
    }
}

pub struct WatchStore {
    account: String,
    path: PathBuf,
    snapshot: RwLock<Option<WatchState>>,
    writer: Mutex<()>,
    sync_gate: Arc<Mutex<()>>,
}

impl WatchStore {
    /// Open the store for `account` under `state_dir`, loading any existing document.
    pub fn open(state_dir: impl AsRef<Path>, account: &str) -> Result<Self, StoreError> {
        let path = state_dir
            .as_ref()
            .join(format!("{}.json", sanitize_account(account)));

        let existing = match std::fs::read(&path) {
            Ok(bytes) => Some(serde_json::from_slice::<WatchState>(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        if existing.is_some() {
            log::info!("[GMAIL_RELAY] Loaded watch state from {}", path.display());
        }

        Ok(Self {
            account: account.to_string(),
            path,
            snapshot: RwLock::new(existing),
            writer: Mutex::new(()),
            sync_gate: Arc::new(Mutex::new(())),
        })
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Latest persisted snapshot.
    pub fn get(&self) -> Option<WatchState> {
        self.snapshot.read().clone()
    }

    /// Exclusive per-account gate held across one reconciliation.
    pub async fn sync_gate(&self) -> OwnedMutexGuard<()> {
        self.sync_gate.clone().lock_owned().await
    }

    /// Create or replace the state. The cursor still never moves backwards.
    pub async fn save(&self, state: WatchState) -> Result<WatchState, StoreError> {
        let _guard = self.writer.lock().await;
        let current = self.snapshot.read().clone();
        let mut next = state;
        if let Some(current) = current {
            keep_cursor_monotonic(&current, &mut next);
        }
        self.persist(next).await
    }

    /// Read-modify-write, applied once and persisted before returning.
    pub async fn update<F>(&self, mutate: F) -> Result<WatchState, StoreError>
    where
        F: FnOnce(&mut WatchState),
    {
        let _guard = self.writer.lock().await;
        let current = self
            .snapshot
            .read()
            .clone()
            .ok_or_else(|| StoreError::Missing(self.account.clone()))?;

        let mut next = current.clone();
        mutate(&mut next);
        keep_cursor_monotonic(&current, &mut next);
        self.persist(next).await
    }

    /// Idempotency gate. Returns the cursor to start history from, or 0 when
    /// the pushed cursor has already been processed.
    pub async fn start_history_id(&self, pushed: &str) -> Result<u64, StoreError> {
        let pushed_id =
            parse_history_id(pushed).ok_or_else(|| StoreError::InvalidHistoryId(pushed.to_string()))?;

        let _guard = self.writer.lock().await;
        let stored = self
            .snapshot
            .read()
            .as_ref()
            .and_then(|s| parse_history_id(&s.history_id));

        Ok(match stored {
            None | Some(0) => pushed_id,
            Some(current) if pushed_id <= current => 0,
            Some(current) => current,
        })
    }

    pub async fn advance_history_id(&self, next: &str) -> Result<WatchState, StoreError> {
        if parse_history_id(next).is_none() {
            return Err(StoreError::InvalidHistoryId(next.to_string()));
        }
        let next = next.to_string();
        self.update(move |state| state.history_id = next).await
    }

    pub async fn record_delivery(
        &self,
        status: DeliveryStatus,
        note: Option<String>,
    ) -> Result<WatchState, StoreError> {
        self.update(move |state| {
            state.last_delivery_status = Some(status);
            state.last_delivery_at_ms = Some(Utc::now().timestamp_millis());
            state.last_delivery_note = note;
        })
        .await
    }

    /// Remove the document. Returns false if there was nothing to delete.
    pub async fn delete(&self) -> Result<bool, StoreError> {
        let _guard = self.writer.lock().await;
        let removed = match tokio::fs::remove_file(&self.path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        *self.snapshot.write() = None;
        Ok(removed)
    }

    // Caller must hold `writer`.
    async fn persist(&self, mut state: WatchState) -> Result<WatchState, StoreError> {
        state.account = self.account.clone();
        state.updated_at_ms = Utc::now().timestamp_millis();

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let bytes = serde_json::to_vec_pretty(&state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        *self.snapshot.write() = Some(state.clone());
        Ok(state)
    }
}

fn keep_cursor_monotonic(current: &WatchState, next: &mut WatchState) {
    let current_id = current.history_cursor();
    let next_id = next.history_cursor();
    if next_id < current_id {
        if !next.history_id.is_empty() {
            log::debug!(
                "[GMAIL_RELAY] Ignoring cursor regression {} -> {}",
                current.history_id,
                next.history_id
            );
        }
        next.history_id = current.history_id.clone();
    }
}

fn sanitize_account(account: &str) -> String {
    account
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
