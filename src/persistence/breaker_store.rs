//! Circuit breaker persistence
//!
//! Loaded at cycle start and saved after every breaker mutation.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{DeskError, Result};
use crate::risk::CircuitBreakerState;

#[async_trait]
pub trait BreakerStore: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet. Unreadable content is
    /// `BreakerStateCorrupted`.
    async fn load(&self) -> Result<Option<CircuitBreakerState>>;

    async fn save(&self, state: &CircuitBreakerState) -> Result<()>;
}

/// JSON file store, written through a temp file and rename
pub struct FileBreakerStore {
    path: PathBuf,
}

impl FileBreakerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BreakerStore for FileBreakerStore {
    async fn load(&self) -> Result<Option<CircuitBreakerState>> {
        let body = match tokio::fs::read_to_string(&self.path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DeskError::Io(e)),
        };
        serde_json::from_str(&body).map(Some).map_err(|e| {
            DeskError::BreakerStateCorrupted(format!("{}: {}", self.path.display(), e))
        })
    }

    async fn save(&self, state: &CircuitBreakerState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(state)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Saved breaker state to {}", self.path.display());
        Ok(())
    }
}

/// In-process store
#[derive(Default)]
pub struct MemoryBreakerStore {
    state: RwLock<Option<CircuitBreakerState>>,
}

impl MemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: CircuitBreakerState) -> Self {
        Self {
            state: RwLock::new(Some(state)),
        }
    }

    pub async fn snapshot(&self) -> Option<CircuitBreakerState> {
        self.state.read().await.clone()
    }
}

#[async_trait]
impl BreakerStore for MemoryBreakerStore {
    async fn load(&self) -> Result<Option<CircuitBreakerState>> {
        Ok(self.state.read().await.clone())
    }

    async fn save(&self, state: &CircuitBreakerState) -> Result<()> {
        *self.state.write().await = Some(state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "tradedesk_breaker_{}_{}.json",
            tag,
            Utc::now().timestamp_nanos_opt().unwrap_or(0)
        ))
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let store = FileBreakerStore::new(temp_path("missing"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn saved_state_survives_reload() {
        let path = temp_path("saved");
        let store = FileBreakerStore::new(&path);
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 1, 0, 0).unwrap();
        let mut state = CircuitBreakerState::new(now);
        state.record_outcome(dec!(-5), now, 1, chrono::Duration::minutes(10));
        store.save(&state).await.unwrap();

        let loaded = FileBreakerStore::new(&path).load().await.unwrap().unwrap();
        assert_eq!(loaded, state);
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn corrupted_file_is_fatal() {
        let path = temp_path("corrupt");
        tokio::fs::write(&path, "{ not json").await.unwrap();
        let err = FileBreakerStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, DeskError::BreakerStateCorrupted(_)));
        assert_eq!(err.class(), ErrorClass::Fatal);
        let _ = tokio::fs::remove_file(&path).await;
    }
}
