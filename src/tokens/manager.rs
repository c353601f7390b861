//! Lock-file backed token manager.
//!
//! One file per resource under the lock directory. A holder keeps the file
//! open with an exclusive `flock`-style lock for as long as it owns the token
//! and writes a [`HolderInfo`] record into it. Because the OS drops the lock
//! when the holder process dies, the staleness check only matters for a holder
//! that is alive but wedged.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use fs2::FileExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{HolderInfo, ResourceKind, TokenStatus};
use crate::error::TokenError;

/// A holder that locked the file but has not written its metadata yet looks
/// exactly like a garbled file. The metadata must stay unreadable for this
/// long, counted from the first time this manager saw it so, before the
/// token is treated as stale. The file's mtime is no guide: a released file
/// keeps the mtime of its release.
const METADATA_GRACE: Duration = Duration::from_secs(5);

/// A token currently owned through this manager.
struct HeldToken {
    file: File,
    holder: String,
}

/// Acquires and releases resource tokens for one process.
pub struct TokenManager {
    lock_dir: PathBuf,
    stale_after: Duration,
    poll_interval: Duration,
    held: Mutex<HashMap<ResourceKind, HeldToken>>,
    /// When a contended token was first seen without readable metadata.
    unreadable_since: Mutex<HashMap<ResourceKind, Instant>>,
}

impl TokenManager {
    /// Create a manager over `lock_dir`, creating the directory if needed.
    pub fn new(lock_dir: impl Into<PathBuf>) -> Result<Self, TokenError> {
        let lock_dir = lock_dir.into();
        fs::create_dir_all(&lock_dir)?;
        Ok(Self {
            lock_dir,
            stale_after: Duration::from_secs(3600),
            poll_interval: Duration::from_millis(250),
            held: Mutex::new(HashMap::new()),
            unreadable_since: Mutex::new(HashMap::new()),
        })
    }

    /// Age after which a held token may be reclaimed.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Delay between acquisition attempts while a token is busy.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    fn lock_path(&self, kind: ResourceKind) -> PathBuf {
        self.lock_dir.join(kind.lock_file_name())
    }

    fn held(&self) -> MutexGuard<'_, HashMap<ResourceKind, HeldToken>> {
        // A poisoned map still holds valid file handles.
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn unreadable_since(&self) -> MutexGuard<'_, HashMap<ResourceKind, Instant>> {
        self.unreadable_since
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Try to take `kind` for `holder`, waiting up to `timeout`.
    ///
    /// Returns `Ok(false)` when the token stayed busy for the whole window.
    /// Errors are reserved for a broken lock directory.
    pub async fn acquire(
        &self,
        kind: ResourceKind,
        holder: &str,
        timeout: Duration,
    ) -> Result<bool, TokenError> {
        if let Some(current) = self.held().get(&kind)
            && current.holder == holder
        {
            debug!(resource = %kind, holder, "Token already held by this holder");
            return Ok(true);
        }

        let deadline = Instant::now() + timeout;
        loop {
            match self.try_acquire_once(kind, holder)? {
                Attempt::Granted => {
                    info!(resource = %kind, holder, "Token acquired");
                    return Ok(true);
                }
                Attempt::Reclaimed => continue,
                Attempt::Busy => {}
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(resource = %kind, holder, ?timeout, "Token acquisition timed out");
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    fn try_acquire_once(&self, kind: ResourceKind, holder: &str) -> Result<Attempt, TokenError> {
        let path = self.lock_path(kind);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                // The file may have been unlinked by a reclaimer between our
                // open and our lock; a lock on an orphaned inode guards nothing.
                if !still_linked(&file, &path) {
                    let _ = FileExt::unlock(&file);
                    return Ok(Attempt::Reclaimed);
                }
                let info = HolderInfo {
                    holder: holder.to_string(),
                    pid: std::process::id(),
                    acquired_at: Utc::now(),
                };
                write_holder_info(&mut file, &info).map_err(|e| TokenError::LockFile {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
                // A reclaimer that judged the empty file stale may have
                // unlinked it before the metadata landed.
                if !still_linked(&file, &path) {
                    let _ = FileExt::unlock(&file);
                    return Ok(Attempt::Reclaimed);
                }
                self.unreadable_since().remove(&kind);
                self.held().insert(
                    kind,
                    HeldToken {
                        file,
                        holder: holder.to_string(),
                    },
                );
                Ok(Attempt::Granted)
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                if self.reclaim_if_stale(kind, &file, &path)? {
                    Ok(Attempt::Reclaimed)
                } else {
                    Ok(Attempt::Busy)
                }
            }
            Err(e) => Err(TokenError::Io(e)),
        }
    }

    /// Unlink the lock file when its holder looks abandoned. The next open
    /// creates a fresh file whose lock is free.
    fn reclaim_if_stale(
        &self,
        kind: ResourceKind,
        contended: &File,
        path: &Path,
    ) -> Result<bool, TokenError> {
        let stale = match read_holder_info(path) {
            Some(info) => {
                self.unreadable_since().remove(&kind);
                let age = Utc::now().signed_duration_since(info.acquired_at);
                let stale = age.to_std().map(|a| a > self.stale_after).unwrap_or(false);
                if stale {
                    warn!(
                        resource = %kind,
                        holder = %info.holder,
                        age_secs = age.num_seconds(),
                        "Reclaiming stale token"
                    );
                }
                stale
            }
            None => {
                let first_seen = *self
                    .unreadable_since()
                    .entry(kind)
                    .or_insert_with(Instant::now);
                let stale = first_seen.elapsed() > METADATA_GRACE;
                if stale {
                    warn!(resource = %kind, "Reclaiming token with unreadable holder metadata");
                    self.unreadable_since().remove(&kind);
                }
                stale
            }
        };

        // Another reclaimer may already have replaced the file.
        if stale && still_linked(contended, path) {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(TokenError::Io(e)),
            }
        }
        Ok(stale)
    }

    /// Give `kind` back. A release by someone other than the current holder
    /// is logged and ignored.
    pub fn release(&self, kind: ResourceKind, holder: &str) {
        let mut held = self.held();
        match held.get(&kind) {
            Some(token) if token.holder == holder => {}
            Some(token) => {
                warn!(
                    resource = %kind,
                    holder,
                    owner = %token.holder,
                    "Ignoring release of token held by another holder"
                );
                return;
            }
            None => {
                warn!(resource = %kind, holder, "Ignoring release of token not held");
                return;
            }
        }

        if let Some(token) = held.remove(&kind) {
            // Clear the metadata so observers never see a released holder.
            let _ = token.file.set_len(0);
            if let Err(e) = FileExt::unlock(&token.file) {
                warn!(resource = %kind, error = %e, "Unlock failed, closing handle");
            }
            info!(resource = %kind, holder, "Token released");
        }
    }

    /// Release every token `holder` owns through this manager.
    pub fn release_all(&self, holder: &str) {
        let kinds: Vec<ResourceKind> = self
            .held()
            .iter()
            .filter(|(_, t)| t.holder == holder)
            .map(|(k, _)| *k)
            .collect();
        for kind in kinds {
            self.release(kind, holder);
        }
    }

    /// Release every token this manager holds, whoever the holder. Used on
    /// process shutdown.
    pub fn release_everything(&self) {
        let owned: Vec<(ResourceKind, String)> = self
            .held()
            .iter()
            .map(|(k, t)| (*k, t.holder.clone()))
            .collect();
        for (kind, holder) in owned {
            self.release(kind, &holder);
        }
    }

    /// Whether this manager currently holds `kind`.
    pub fn is_held(&self, kind: ResourceKind) -> bool {
        self.held().contains_key(&kind)
    }

    /// Snapshot of every token as seen from the filesystem.
    pub fn status(&self) -> Result<Vec<(ResourceKind, TokenStatus)>, TokenError> {
        ResourceKind::ALL
            .iter()
            .map(|kind| Ok((*kind, self.status_of(*kind)?)))
            .collect()
    }

    fn status_of(&self, kind: ResourceKind) -> Result<TokenStatus, TokenError> {
        let path = self.lock_path(kind);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(TokenStatus::Available);
            }
            Err(e) => return Err(TokenError::Io(e)),
        };

        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                Ok(TokenStatus::Available)
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Ok(match read_holder_info(&path) {
                    Some(info) => TokenStatus::HeldBy {
                        age_secs: Some(
                            Utc::now()
                                .signed_duration_since(info.acquired_at)
                                .num_seconds(),
                        ),
                        acquired_at: Some(info.acquired_at),
                        holder: info.holder,
                    },
                    None => TokenStatus::HeldBy {
                        holder: "unknown".to_string(),
                        acquired_at: None,
                        age_secs: None,
                    },
                })
            }
            Err(e) => Err(TokenError::Io(e)),
        }
    }

    /// Acquire `kind` as a scoped lease that releases itself when dropped.
    ///
    /// A busy resource becomes [`TokenError::Timeout`] so runs can bail out
    /// with `?`.
    pub async fn lease(
        self: &Arc<Self>,
        kind: ResourceKind,
        holder: &str,
        timeout: Duration,
    ) -> Result<TokenLease, TokenError> {
        if self.acquire(kind, holder, timeout).await? {
            Ok(TokenLease {
                manager: Arc::clone(self),
                kind,
                holder: holder.to_string(),
            })
        } else {
            Err(TokenError::Timeout {
                kind,
                waited: timeout,
            })
        }
    }
}

enum Attempt {
    Granted,
    Busy,
    /// A stale or orphaned lock was cleared; retry right away.
    Reclaimed,
}

/// A held token. Dropping it releases the token, which covers early returns,
/// errors and cancelled tasks alike.
pub struct TokenLease {
    manager: Arc<TokenManager>,
    kind: ResourceKind,
    holder: String,
}

impl TokenLease {
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl std::fmt::Debug for TokenLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenLease")
            .field("kind", &self.kind)
            .field("holder", &self.holder)
            .finish()
    }
}

impl Drop for TokenLease {
    fn drop(&mut self) {
        self.manager.release(self.kind, &self.holder);
    }
}

// ── Lock file helpers ───────────────────────────────────────────────

fn write_holder_info(file: &mut File, info: &HolderInfo) -> std::io::Result<()> {
    let json = serde_json::to_vec(info).map_err(std::io::Error::other)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&json)?;
    file.sync_data()
}

fn read_holder_info(path: &Path) -> Option<HolderInfo> {
    let mut content = String::new();
    File::open(path).ok()?.read_to_string(&mut content).ok()?;
    serde_json::from_str(content.trim()).ok()
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), fs::metadata(path)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> bool {
    path.exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path) -> Arc<TokenManager> {
        Arc::new(
            TokenManager::new(dir)
                .unwrap()
                .with_poll_interval(Duration::from_millis(20)),
        )
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = manager(dir.path());

        assert!(
            tokens
                .acquire(ResourceKind::Inference, "a", Duration::from_millis(100))
                .await
                .unwrap()
        );
        assert!(tokens.is_held(ResourceKind::Inference));

        tokens.release(ResourceKind::Inference, "a");
        assert!(!tokens.is_held(ResourceKind::Inference));
    }

    #[tokio::test]
    async fn second_holder_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let first = manager(dir.path());
        let second = manager(dir.path());

        assert!(
            first
                .acquire(ResourceKind::Inference, "a", Duration::from_millis(50))
                .await
                .unwrap()
        );

        let started = std::time::Instant::now();
        let granted = second
            .acquire(ResourceKind::Inference, "b", Duration::from_millis(300))
            .await
            .unwrap();
        assert!(!granted);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn concurrent_acquire_grants_exactly_one() {
        let dir = tempfile::tempdir().unwrap();
        let a = manager(dir.path());
        let b = manager(dir.path());

        let (ra, rb) = tokio::join!(
            a.acquire(ResourceKind::Inference, "a", Duration::from_millis(200)),
            b.acquire(ResourceKind::Inference, "b", Duration::from_millis(200)),
        );
        let granted = [ra.unwrap(), rb.unwrap()];
        assert_eq!(granted.iter().filter(|g| **g).count(), 1);
    }

    #[tokio::test]
    async fn released_token_can_be_reacquired() {
        let dir = tempfile::tempdir().unwrap();
        let a = manager(dir.path());
        let b = manager(dir.path());

        assert!(
            a.acquire(ResourceKind::MailChannel, "a", Duration::ZERO)
                .await
                .unwrap()
        );
        a.release(ResourceKind::MailChannel, "a");
        assert!(
            b.acquire(ResourceKind::MailChannel, "b", Duration::ZERO)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn different_resources_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let a = manager(dir.path());
        let b = manager(dir.path());

        assert!(
            a.acquire(ResourceKind::Inference, "a", Duration::ZERO)
                .await
                .unwrap()
        );
        assert!(
            b.acquire(ResourceKind::Calendar, "b", Duration::ZERO)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn stale_token_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let wedged = manager(dir.path());
        let fresh = Arc::new(
            TokenManager::new(dir.path())
                .unwrap()
                .with_poll_interval(Duration::from_millis(20))
                .with_stale_after(Duration::from_millis(50)),
        );

        assert!(
            wedged
                .acquire(ResourceKind::Inference, "wedged", Duration::ZERO)
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(
            fresh
                .acquire(ResourceKind::Inference, "fresh", Duration::from_secs(2))
                .await
                .unwrap()
        );
        match fresh.status().unwrap()[0].1.clone() {
            TokenStatus::HeldBy { holder, .. } => assert_eq!(holder, "fresh"),
            other => panic!("expected held, got {other:?}"),
        }

        // The wedged holder releasing late must not disturb the new owner.
        wedged.release(ResourceKind::Inference, "wedged");
        assert!(fresh.is_held(ResourceKind::Inference));
        let third = manager(dir.path());
        assert!(
            !third
                .acquire(ResourceKind::Inference, "third", Duration::from_millis(60))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn fresh_token_is_not_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let a = manager(dir.path());
        let b = manager(dir.path());

        assert!(
            a.acquire(ResourceKind::Inference, "a", Duration::ZERO)
                .await
                .unwrap()
        );
        assert!(
            !b.acquire(ResourceKind::Inference, "b", Duration::from_millis(80))
                .await
                .unwrap()
        );
        assert!(a.is_held(ResourceKind::Inference));
    }

    #[tokio::test]
    async fn locked_file_awaiting_metadata_is_not_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = manager(dir.path());
        let path = dir.path().join(ResourceKind::MailChannel.lock_file_name());

        // A holder that has locked a long-released file but not yet written
        // its metadata.
        let pending = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .unwrap();
        pending
            .set_modified(std::time::SystemTime::now() - Duration::from_secs(600))
            .unwrap();
        pending.try_lock_exclusive().unwrap();

        assert!(
            !tokens
                .acquire(ResourceKind::MailChannel, "c", Duration::from_millis(200))
                .await
                .unwrap()
        );
        assert!(still_linked(&pending, &path));
        assert!(!tokens.is_held(ResourceKind::MailChannel));
    }

    #[tokio::test]
    async fn release_by_non_holder_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = manager(dir.path());

        assert!(
            tokens
                .acquire(ResourceKind::Calendar, "owner", Duration::ZERO)
                .await
                .unwrap()
        );
        tokens.release(ResourceKind::Calendar, "intruder");
        assert!(tokens.is_held(ResourceKind::Calendar));
    }

    #[tokio::test]
    async fn lease_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = manager(dir.path());
        let other = manager(dir.path());

        {
            let lease = tokens
                .lease(ResourceKind::MailChannel, "a", Duration::ZERO)
                .await
                .unwrap();
            assert_eq!(lease.kind(), ResourceKind::MailChannel);
            assert!(matches!(
                other
                    .lease(ResourceKind::MailChannel, "b", Duration::from_millis(40))
                    .await,
                Err(TokenError::Timeout { .. })
            ));
        }

        assert!(!tokens.is_held(ResourceKind::MailChannel));
        assert!(
            other
                .lease(ResourceKind::MailChannel, "b", Duration::ZERO)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn lease_released_when_task_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = manager(dir.path());

        let worker = {
            let tokens = Arc::clone(&tokens);
            tokio::spawn(async move {
                let _lease = tokens
                    .lease(ResourceKind::Inference, "worker", Duration::ZERO)
                    .await
                    .unwrap();
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tokens.is_held(ResourceKind::Inference));

        worker.abort();
        let _ = worker.await;
        assert!(!tokens.is_held(ResourceKind::Inference));
    }

    #[tokio::test]
    async fn release_all_drops_only_that_holder() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = manager(dir.path());

        for kind in [ResourceKind::Inference, ResourceKind::MailChannel] {
            assert!(tokens.acquire(kind, "run-1", Duration::ZERO).await.unwrap());
        }
        assert!(
            tokens
                .acquire(ResourceKind::Calendar, "run-2", Duration::ZERO)
                .await
                .unwrap()
        );

        tokens.release_all("run-1");
        assert!(!tokens.is_held(ResourceKind::Inference));
        assert!(!tokens.is_held(ResourceKind::MailChannel));
        assert!(tokens.is_held(ResourceKind::Calendar));

        tokens.release_everything();
        assert!(!tokens.is_held(ResourceKind::Calendar));
    }

    #[tokio::test]
    async fn status_reports_available_and_held() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = manager(dir.path());
        let observer = manager(dir.path());

        let before = observer.status().unwrap();
        assert!(before.iter().all(|(_, s)| *s == TokenStatus::Available));

        assert!(
            tokens
                .acquire(ResourceKind::MailChannel, "agent:1:x", Duration::ZERO)
                .await
                .unwrap()
        );
        let after = observer.status().unwrap();
        let mail = after
            .iter()
            .find(|(k, _)| *k == ResourceKind::MailChannel)
            .map(|(_, s)| s.clone())
            .unwrap();
        match mail {
            TokenStatus::HeldBy { holder, age_secs, .. } => {
                assert_eq!(holder, "agent:1:x");
                assert!(age_secs.is_some());
            }
            other => panic!("expected held, got {other:?}"),
        }
    }
}
