//! JSON-file backed [`EmailStore`].
//!
//! Layout under `<data_dir>/<agent>/`:
//!
//! ```text
//! index.json           hash -> {state, size, has_attachments}
//! records/<hash>.json  one full record per message
//! watermark.json       newest terminal message
//! ```
//!
//! Every file is replaced atomically (temp file, fsync, rename). A record is
//! always written before its index entry, so a crash in between leaves a
//! record ahead of the index. `save` trusts whichever is further along and
//! repairs the index from the record.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::validate_agent_name;
use crate::error::StorageError;
use crate::store::record::{
    ActionOutcome, ClassificationUpdate, EmailRecord, IndexEntry, ProcessingState, StoreStats,
    Watermark,
};
use crate::store::traits::EmailStore;

const INDEX_FILE: &str = "index.json";
const WATERMARK_FILE: &str = "watermark.json";
const RECORDS_DIR: &str = "records";

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    entries: HashMap<String, IndexEntry>,
}

#[derive(Default)]
struct Inner {
    index: HashMap<String, IndexEntry>,
    watermark: Option<Watermark>,
}

/// File-backed store for one agent's namespace.
pub struct FileEmailStore {
    agent: String,
    root: PathBuf,
    inner: Mutex<Inner>,
}

impl FileEmailStore {
    /// Open (or create) the namespace for `agent` under `data_dir`.
    ///
    /// Fails with [`StorageError::Corruption`] if the index or watermark is
    /// unreadable.
    pub async fn open(data_dir: &Path, agent: &str) -> Result<Self, StorageError> {
        validate_agent_name(agent).map_err(|_| StorageError::InvalidNamespace(agent.into()))?;

        let root = data_dir.join(agent);
        tokio::fs::create_dir_all(root.join(RECORDS_DIR)).await?;

        let index = read_json::<IndexFile>(&root.join(INDEX_FILE))
            .await?
            .map(|f| f.entries)
            .unwrap_or_default();
        let watermark = read_json::<Watermark>(&root.join(WATERMARK_FILE)).await?;

        info!(
            agent,
            records = index.len(),
            has_watermark = watermark.is_some(),
            "Opened email store"
        );

        Ok(Self {
            agent: agent.to_string(),
            root,
            inner: Mutex::new(Inner { index, watermark }),
        })
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, hash: &str) -> Result<PathBuf, StorageError> {
        if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(StorageError::InvalidKey(hash.to_string()));
        }
        Ok(self.root.join(RECORDS_DIR).join(format!("{hash}.json")))
    }

    async fn read_record(&self, hash: &str) -> Result<Option<EmailRecord>, StorageError> {
        read_json(&self.record_path(hash)?).await
    }

    async fn write_record(&self, record: &EmailRecord) -> Result<(), StorageError> {
        write_json_atomic(&self.record_path(&record.hash)?, record).await
    }

    /// Commit one index entry, rolling the in-memory copy back if the index
    /// file cannot be written.
    async fn commit_index(
        &self,
        inner: &mut Inner,
        hash: &str,
        entry: IndexEntry,
    ) -> Result<(), StorageError> {
        let previous = inner.index.insert(hash.to_string(), entry);
        let file = IndexFile {
            entries: inner.index.clone(),
        };
        if let Err(e) = write_json_atomic(&self.root.join(INDEX_FILE), &file).await {
            match previous {
                Some(prev) => inner.index.insert(hash.to_string(), prev),
                None => inner.index.remove(hash),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Load, modify and persist an existing record under the store lock.
    async fn mutate<F>(&self, hash: &str, apply: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut EmailRecord) -> Result<(), StorageError> + Send,
    {
        let mut inner = self.inner.lock().await;
        if !inner.index.contains_key(hash) {
            return Err(StorageError::NotFound { hash: hash.into() });
        }
        let mut record =
            self.read_record(hash)
                .await?
                .ok_or_else(|| StorageError::Corruption {
                    path: self.root.join(RECORDS_DIR).join(format!("{hash}.json")),
                    reason: "indexed record file is missing".into(),
                })?;

        apply(&mut record)?;
        record.updated_at = Utc::now();

        self.write_record(&record).await?;
        self.commit_index(&mut inner, hash, record.index_entry())
            .await
    }
}

fn check_transition(
    hash: &str,
    from: ProcessingState,
    to: ProcessingState,
) -> Result<(), StorageError> {
    if from == to || from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StorageError::InvalidTransition {
            hash: hash.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[async_trait]
impl EmailStore for FileEmailStore {
    async fn exists(&self, hash: &str) -> bool {
        self.inner.lock().await.index.contains_key(hash)
    }

    async fn state_of(&self, hash: &str) -> Option<ProcessingState> {
        self.inner.lock().await.index.get(hash).map(|e| e.state)
    }

    async fn load(&self, hash: &str) -> Result<Option<EmailRecord>, StorageError> {
        self.read_record(hash).await
    }

    async fn save(
        &self,
        record: &EmailRecord,
        state: ProcessingState,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let mut record = record.clone();

        // The record file is written before the index, so after a crash
        // between the two the record is the more advanced copy.
        let existing = self.read_record(&record.hash).await?;
        let indexed = inner.index.get(&record.hash).map(|e| e.state);
        let current = indexed.max(existing.as_ref().map(|r| r.state));

        if let Some(cur) = current
            && cur != state
            && !cur.can_transition_to(state)
        {
            debug!(
                agent = %self.agent,
                hash = %record.hash,
                current = %cur,
                requested = %state,
                "Save would move state backward, keeping current record"
            );
            if let Some(found) = &existing
                && found.state == cur
            {
                if indexed != Some(cur) {
                    info!(agent = %self.agent, hash = %record.hash, state = %cur, "Repaired index entry from record");
                    self.commit_index(&mut inner, &record.hash, found.index_entry())
                        .await?;
                }
                return Ok(());
            }
            record.state = cur;
        } else {
            record.state = state;
        }

        if let Some(existing) = &existing {
            record.saved_at = existing.saved_at;
        }
        record.updated_at = Utc::now();

        self.write_record(&record).await?;
        self.commit_index(&mut inner, &record.hash, record.index_entry())
            .await
    }

    async fn update_classification(
        &self,
        hash: &str,
        update: ClassificationUpdate,
    ) -> Result<(), StorageError> {
        self.mutate(hash, |record| {
            record.classification = Some(update.classification);
            record.topic_match = Some(update.topic_match);
            record.sender_status = Some(update.sender_status);
            if record.state == ProcessingState::New {
                record.state = ProcessingState::Classified;
            }
            Ok(())
        })
        .await
    }

    async fn update_state(
        &self,
        hash: &str,
        new_state: ProcessingState,
    ) -> Result<(), StorageError> {
        if self.state_of(hash).await == Some(new_state) {
            return Ok(());
        }
        self.mutate(hash, |record| {
            check_transition(hash, record.state, new_state)?;
            record.state = new_state;
            Ok(())
        })
        .await
    }

    async fn record_outcome(
        &self,
        hash: &str,
        outcome: ActionOutcome,
        state: ProcessingState,
    ) -> Result<(), StorageError> {
        self.mutate(hash, |record| {
            check_transition(hash, record.state, state)?;
            record.decision = Some(outcome.decision);
            record.decision_reason = Some(outcome.reason);
            record.action = outcome.action;
            record.calendar_event_ids = outcome.calendar_event_ids;
            record.last_error = None;
            record.state = state;
            Ok(())
        })
        .await
    }

    async fn mark_error(&self, hash: &str, reason: &str) -> Result<(), StorageError> {
        self.mutate(hash, |record| {
            if record.state.is_terminal() {
                return Err(StorageError::InvalidTransition {
                    hash: hash.to_string(),
                    from: record.state.to_string(),
                    to: ProcessingState::Error.to_string(),
                });
            }
            record.state = ProcessingState::Error;
            record.last_error = Some(reason.to_string());
            Ok(())
        })
        .await
    }

    async fn stats(&self) -> StoreStats {
        StoreStats::from_entries(self.inner.lock().await.index.values())
    }

    async fn watermark(&self) -> Option<Watermark> {
        self.inner.lock().await.watermark.clone()
    }

    async fn advance_watermark(
        &self,
        date: DateTime<Utc>,
        hash: &str,
    ) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().await;
        if let Some(current) = &inner.watermark
            && date <= current.last_date
        {
            return Ok(false);
        }

        let watermark = Watermark {
            last_date: date,
            last_hash: hash.to_string(),
            updated_at: Utc::now(),
        };
        write_json_atomic(&self.root.join(WATERMARK_FILE), &watermark).await?;
        debug!(agent = %self.agent, %date, hash, "Watermark advanced");
        inner.watermark = Some(watermark);
        Ok(true)
    }
}

// ── File helpers ────────────────────────────────────────────────────

/// Read and parse a JSON file. A missing file is `None`; an unparseable one
/// is corruption.
async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::Io(e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StorageError::Corruption {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Replace `path` with the JSON encoding of `value` in one rename.
async fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), StorageError> {
    let bytes =
        serde_json::to_vec_pretty(value).map_err(|e| StorageError::Serialization(e.to_string()))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("store");
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(StorageError::Io(e));
    }
    Ok(())
}
