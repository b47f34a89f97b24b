//! Durable session storage

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::ContextResult;
use crate::session::{SessionId, SessionRecord};

const FILE_PREFIX: &str = "s_";
const FILE_SUFFIX: &str = ".json";

/// Where session records live between restarts.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Every readable record. Unreadable entries are skipped, not fatal.
    async fn load_all(&self) -> ContextResult<Vec<SessionRecord>>;

    /// Insert or replace the record stored under `record.id`.
    async fn save(&self, record: &SessionRecord) -> ContextResult<()>;
}

/// One pretty-printed JSON file per session: `<dir>/s_<id>.json`.
#[derive(Debug, Clone)]
pub struct JsonDirRepository {
    dir: PathBuf,
}

impl JsonDirRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, id: SessionId) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}{id}{FILE_SUFFIX}"))
    }

    fn parse_file_id(name: &str) -> Option<SessionId> {
        name.strip_prefix(FILE_PREFIX)?
            .strip_suffix(FILE_SUFFIX)?
            .parse()
            .ok()
    }

    async fn read_record(path: &Path, expected: SessionId) -> Option<SessionRecord> {
        let raw = match fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable session file");
                return None;
            }
        };

        let record: SessionRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping malformed session file");
                return None;
            }
        };

        if record.id != expected {
            warn!(
                path = %path.display(),
                embedded = record.id,
                "skipping session file whose id disagrees with its name"
            );
            return None;
        }
        Some(record)
    }
}

#[async_trait]
impl SessionRepository for JsonDirRepository {
    async fn load_all(&self) -> ContextResult<Vec<SessionRecord>> {
        fs::create_dir_all(&self.dir).await?;

        let mut entries = fs::read_dir(&self.dir).await?;
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(Self::parse_file_id) else {
                debug!(file = ?name, "ignoring non-session file");
                continue;
            };
            if let Some(record) = Self::read_record(&entry.path(), id).await {
                records.push(record);
            }
        }

        records.sort_by_key(|record| record.id);
        Ok(records)
    }

    async fn save(&self, record: &SessionRecord) -> ContextResult<()> {
        fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(record.id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(record)?;

        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &path).await?;
        debug!(session_id = record.id, path = %path.display(), "session saved");
        Ok(())
    }
}

/// Process-local storage; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    records: RwLock<HashMap<SessionId, SessionRecord>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: SessionId) -> Option<SessionRecord> {
        self.records.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl SessionRepository for MemoryRepository {
    async fn load_all(&self) -> ContextResult<Vec<SessionRecord>> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by_key(|record| record.id);
        Ok(records)
    }

    async fn save(&self, record: &SessionRecord) -> ContextResult<()> {
        self.records
            .write()
            .await
            .insert(record.id, record.clone());
        Ok(())
    }
}
