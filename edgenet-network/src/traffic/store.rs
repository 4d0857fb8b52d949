//! File-backed traffic store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::TrafficRecord;
use crate::error::{NetworkError, Result};
use crate::traits::TrafficStore;

/// Keeps every record in one JSON document.
///
/// The document is read on first access and rewritten on every save
/// through a temporary file and a rename, so a crash never leaves a
/// truncated file behind.
pub struct JsonTrafficStore {
    path: PathBuf,
    records: Mutex<Option<HashMap<String, TrafficRecord>>>,
}

impl JsonTrafficStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<HashMap<String, TrafficRecord>> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(NetworkError::Store(format!("{}: {}", self.path.display(), e))),
        };

        match serde_json::from_slice(&content) {
            Ok(records) => Ok(records),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Traffic store is corrupted, starting empty");
                Ok(HashMap::new())
            }
        }
    }

    async fn write_file(&self, records: &HashMap<String, TrafficRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_vec_pretty(records)?;
        let tmp = self.path.with_extension("tmp");

        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), records = records.len(), "Traffic store written");

        Ok(())
    }
}

#[async_trait]
impl TrafficStore for JsonTrafficStore {
    async fn load(&self, chain: &str) -> Result<Option<TrafficRecord>> {
        let mut guard = self.records.lock().await;

        if guard.is_none() {
            *guard = Some(self.read_file().await?);
        }

        Ok(guard.as_ref().and_then(|records| records.get(chain).copied()))
    }

    async fn save(&self, chain: &str, record: &TrafficRecord) -> Result<()> {
        let mut guard = self.records.lock().await;

        let mut records = match guard.take() {
            Some(records) => records,
            None => self.read_file().await?,
        };
        records.insert(chain.to_string(), *record);

        let result = self.write_file(&records).await;
        *guard = Some(records);

        result
    }
}
