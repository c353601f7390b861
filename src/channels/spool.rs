//! Local spool mailbox.
//!
//! A directory of `.eml` files laid out like a minimal Maildir:
//!
//! ```text
//! new/              unread messages
//! cur/              read messages
//! archive/          mark-read-and-archive target
//! trash/            move-to-trash target
//! labels/<label>/   copies of labelled messages (originals stay put)
//! ```
//!
//! Provider ids are paths relative to the root, e.g. `new/0042.eml`.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use tracing::{debug, info};

use crate::channels::{FetchFilters, MailAction, MailClient, RawMessage};
use crate::error::MailError;
use crate::store::Watermark;

const UNREAD_DIR: &str = "new";
const READ_DIR: &str = "cur";
const ARCHIVE_DIR: &str = "archive";
const TRASH_DIR: &str = "trash";
const LABELS_DIR: &str = "labels";

/// Mail collaborator backed by a local directory.
pub struct SpoolMailbox {
    name: String,
    root: PathBuf,
}

impl SpoolMailbox {
    /// Open a spool, creating its folders if needed.
    pub async fn open(name: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self, MailError> {
        let root = root.into();
        for dir in [UNREAD_DIR, READ_DIR, ARCHIVE_DIR, TRASH_DIR, LABELS_DIR] {
            tokio::fs::create_dir_all(root.join(dir)).await?;
        }
        Ok(Self {
            name: name.into(),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Drop a raw message into `new/`. Used by tests and local tooling.
    pub async fn deliver(&self, file_name: &str, bytes: &[u8]) -> Result<String, MailError> {
        let provider_id = format!("{UNREAD_DIR}/{file_name}");
        let path = self.resolve(&provider_id)?;
        tokio::fs::write(&path, bytes).await?;
        Ok(provider_id)
    }

    /// Map a provider id to a path, refusing anything outside the inbox
    /// folders.
    fn resolve(&self, provider_id: &str) -> Result<PathBuf, MailError> {
        let rel = Path::new(provider_id);
        let mut components = rel.components();
        let folder_ok = matches!(
            components.next(),
            Some(Component::Normal(f)) if f == UNREAD_DIR || f == READ_DIR
        );
        let file_ok = matches!(components.next(), Some(Component::Normal(_)))
            && components.next().is_none();
        if !folder_ok || !file_ok {
            return Err(MailError::MessageNotFound {
                id: provider_id.to_string(),
            });
        }
        Ok(self.root.join(rel))
    }

    async fn list_folder(&self, folder: &str) -> Result<Vec<(String, PathBuf)>, MailError> {
        let mut entries = tokio::fs::read_dir(self.root.join(folder)).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_eml = path.extension().and_then(|e| e.to_str()) == Some("eml");
            if is_eml && entry.file_type().await?.is_file() {
                let file_name = entry.file_name().to_string_lossy().to_string();
                out.push((format!("{folder}/{file_name}"), path));
            }
        }
        Ok(out)
    }

    async fn move_to(&self, provider_id: &str, folder: &str) -> Result<(), MailError> {
        let src = self.resolve(provider_id)?;
        let file_name = src.file_name().ok_or_else(|| MailError::MessageNotFound {
            id: provider_id.to_string(),
        })?;
        let dst = self.root.join(folder).join(file_name);
        tokio::fs::rename(&src, &dst)
            .await
            .map_err(|e| action_error(provider_id, folder, e))
    }

    async fn copy_to_label(&self, provider_id: &str, label: &str) -> Result<(), MailError> {
        let valid = !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(MailError::ActionFailed {
                id: provider_id.to_string(),
                action: format!("apply_label({label})"),
                reason: "label may only contain letters, digits, '-' and '_'".into(),
            });
        }

        let src = self.resolve(provider_id)?;
        let file_name = src.file_name().ok_or_else(|| MailError::MessageNotFound {
            id: provider_id.to_string(),
        })?;
        let dir = self.root.join(LABELS_DIR).join(label);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::copy(&src, dir.join(file_name))
            .await
            .map(|_| ())
            .map_err(|e| action_error(provider_id, label, e))
    }
}

fn action_error(id: &str, action: &str, e: std::io::Error) -> MailError {
    if e.kind() == std::io::ErrorKind::NotFound {
        MailError::MessageNotFound { id: id.to_string() }
    } else {
        MailError::ActionFailed {
            id: id.to_string(),
            action: action.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Date header of a raw message, falling back to the file's mtime.
async fn message_date(path: &Path, bytes: &[u8]) -> Option<DateTime<Utc>> {
    let header_date = MessageParser::default()
        .parse_headers(bytes)
        .and_then(|m| m.date().map(|d| d.to_timestamp()))
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0));
    if header_date.is_some() {
        return header_date;
    }
    tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

#[async_trait]
impl MailClient for SpoolMailbox {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        since: Option<&Watermark>,
        filters: &FetchFilters,
    ) -> Result<Vec<RawMessage>, MailError> {
        let mut candidates = self.list_folder(UNREAD_DIR).await?;
        if !filters.unread_only {
            candidates.extend(self.list_folder(READ_DIR).await?);
        }

        let lower = filters.lower_bound(since);
        let mut dated = Vec::with_capacity(candidates.len());
        for (provider_id, path) in candidates {
            let bytes = tokio::fs::read(&path).await?;
            let date = message_date(&path, &bytes).await;
            let in_range = match date {
                Some(d) => {
                    lower.is_none_or(|l| d >= l) && filters.until.is_none_or(|u| d <= u)
                }
                // Undated and no mtime: only a bounded range query skips it.
                None => lower.is_none() && filters.until.is_none(),
            };
            if in_range {
                dated.push((date, provider_id, bytes));
            }
        }

        dated.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        dated.truncate(filters.limit);

        debug!(
            mailbox = %self.name,
            count = dated.len(),
            since = ?lower,
            "Fetched spool messages"
        );
        Ok(dated
            .into_iter()
            .map(|(_, provider_id, bytes)| RawMessage { provider_id, bytes })
            .collect())
    }

    async fn perform_action(
        &self,
        provider_id: &str,
        action: &MailAction,
    ) -> Result<(), MailError> {
        match action {
            MailAction::MarkReadAndArchive => self.move_to(provider_id, ARCHIVE_DIR).await?,
            MailAction::MoveToTrash => self.move_to(provider_id, TRASH_DIR).await?,
            MailAction::ApplyLabel(label) => self.copy_to_label(provider_id, label).await?,
        }
        info!(mailbox = %self.name, provider_id, %action, "Mail action applied");
        Ok(())
    }
}
