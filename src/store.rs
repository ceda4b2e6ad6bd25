//! Persistence for the active tab selection.
//!
//! The choice of tab survives restarts; everything else in panel state is
//! rebuilt from the backend on init.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;

#[async_trait]
pub trait TabStore: Send + Sync {
    async fn active_tab(&self) -> Result<Option<String>>;
    async fn set_active_tab(&self, tab_id: &str) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredState {
    active_tab: String,
    updated_at: DateTime<Utc>,
}

/// JSON-file-backed store.
pub struct FileTabStore {
    path: PathBuf,
}

impl FileTabStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TabStore for FileTabStore {
    async fn active_tab(&self) -> Result<Option<String>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no persisted tab state");
                return Ok(None);
            }
            Err(e) => return Err(e).context("failed to read tab state"),
        };
        let state: StoredState =
            serde_json::from_str(&raw).context("failed to parse tab state")?;
        Ok(Some(state.active_tab))
    }

    async fn set_active_tab(&self, tab_id: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create state directory")?;
        }
        let state = StoredState {
            active_tab: tab_id.to_string(),
            updated_at: Utc::now(),
        };
        let raw = serde_json::to_string(&state)?;
        tokio::fs::write(&self.path, raw)
            .await
            .context("failed to write tab state")?;
        Ok(())
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryTabStore {
    active: Mutex<Option<String>>,
}

impl MemoryTabStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TabStore for MemoryTabStore {
    async fn active_tab(&self) -> Result<Option<String>> {
        Ok(self.active.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn set_active_tab(&self, tab_id: &str) -> Result<()> {
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = Some(tab_id.to_string());
        Ok(())
    }
}
