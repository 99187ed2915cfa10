use crate::error::StateError;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertState {
    pub last_alert_time: DateTime<Utc>,
}

impl Default for AlertState {
    fn default() -> Self {
        Self {
            last_alert_time: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

/// Storage port for the single persisted [`AlertState`] record.
#[async_trait]
pub trait AlertStateStore: Send + Sync {
    /// Makes sure the storage location exists.
    async fn prepare(&self) -> Result<(), StateError>;
    /// Returns the stored state, creating the default record when none exists yet.
    async fn load(&self) -> Result<AlertState, StateError>;
    async fn save(&self, state: &AlertState) -> Result<(), StateError>;
}

#[derive(Debug, Clone)]
pub struct FileAlertStateStore {
    path: PathBuf,
}

impl FileAlertStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AlertStateStore for FileAlertStateStore {
    async fn prepare(&self) -> Result<(), StateError> {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => {
                fs::create_dir_all(dir).await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn load(&self) -> Result<AlertState, StateError> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let state = AlertState::default();
                self.save(&state).await?;
                return Ok(state);
            }
            Err(err) => return Err(err.into()),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(AlertState::default());
        }
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn save(&self, state: &AlertState) -> Result<(), StateError> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(state)?).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// In-process state record with switches to simulate storage faults.
#[derive(Debug, Default)]
pub struct MemoryAlertStateStore {
    state: Mutex<Option<AlertState>>,
    fail_prepare: AtomicBool,
    fail_load: AtomicBool,
    fail_save: AtomicBool,
}

impl MemoryAlertStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: AlertState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            ..Self::default()
        }
    }

    pub async fn snapshot(&self) -> Option<AlertState> {
        *self.state.lock().await
    }

    pub fn set_fail_prepare(&self, fail: bool) {
        self.fail_prepare.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_load(&self, fail: bool) {
        self.fail_load.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_save(&self, fail: bool) {
        self.fail_save.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl AlertStateStore for MemoryAlertStateStore {
    async fn prepare(&self) -> Result<(), StateError> {
        if self.fail_prepare.load(Ordering::Relaxed) {
            return Err(StateError::Unavailable("prepare disabled".to_string()));
        }
        Ok(())
    }

    async fn load(&self) -> Result<AlertState, StateError> {
        if self.fail_load.load(Ordering::Relaxed) {
            return Err(StateError::Unavailable("load disabled".to_string()));
        }
        let mut state = self.state.lock().await;
        Ok(*state.get_or_insert_with(AlertState::default))
    }

    async fn save(&self, new_state: &AlertState) -> Result<(), StateError> {
        if self.fail_save.load(Ordering::Relaxed) {
            return Err(StateError::Unavailable("save disabled".to_string()));
        }
        *self.state.lock().await = Some(*new_state);
        Ok(())
    }
}

/// Allows at most one alert per suppression period, measured from the last
/// recorded send. State is re-read on every decision; check and record are
/// separate steps, so concurrent callers may both be permitted.
#[derive(Clone)]
pub struct AlertDebouncer {
    store: Arc<dyn AlertStateStore>,
    suppression: ChronoDuration,
}

impl AlertDebouncer {
    pub fn new(store: Arc<dyn AlertStateStore>, suppression: ChronoDuration) -> Self {
        Self { store, suppression }
    }

    pub fn daily(store: Arc<dyn AlertStateStore>) -> Self {
        Self::new(store, ChronoDuration::hours(24))
    }

    pub async fn should_send(&self, now: DateTime<Utc>) -> bool {
        if let Err(err) = self.store.prepare().await {
            tracing::warn!(error = %err, "alert state location unavailable; allowing alert");
            return true;
        }
        let state = match self.store.load().await {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read alert state; allowing alert");
                return true;
            }
        };
        if now - state.last_alert_time < self.suppression {
            tracing::info!(
                last_alert_time = %state.last_alert_time,
                "alert already sent within suppression period"
            );
            return false;
        }
        true
    }

    pub async fn record_sent(&self, now: DateTime<Utc>) {
        let state = AlertState {
            last_alert_time: now,
        };
        if let Err(err) = self.store.save(&state).await {
            tracing::warn!(error = %err, "failed to save alert state");
        }
    }
}
