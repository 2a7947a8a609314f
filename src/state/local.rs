//! Local file-based state storage backend.
//!
//! State lives in a directory next to the plan file (`.tierform/` by
//! default). Writes go to a uniquely named staging file that is renamed
//! into place. The lock file is published with a hard link, which fails if
//! a lock already exists, so two contenders can never both succeed.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, StateError, TierformError};

use super::lock::{LOCK_ATTEMPTS, LOCK_EXPIRY_SECS, LockInfo, holder_or_generated};
use super::store::{StateStore, decode_lock, decode_state, encode_lock, encode_state};
use super::types::StateSnapshot;

/// Default state directory name.
pub const STATE_DIR: &str = ".tierform";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a store in `.tierform/` under the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| TierformError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Returns the path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| StateError::write(format!("Failed to create state directory: {e}")))?;
        }
        Ok(())
    }

    /// Writes `content` to `path` through a staging file and a rename.
    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        let temp_path = self.write_staged(path, content).await?;

        if let Err(e) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StateError::write(format!("Failed to rename into {}: {e}", path.display())).into());
        }

        Ok(())
    }

    /// Writes and syncs `content` into a fresh staging file beside `target`.
    async fn write_staged(&self, target: &Path, content: &str) -> Result<PathBuf> {
        self.ensure_dir().await?;

        let temp_path = sibling(target, "tmp");

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await
            .map_err(|e| StateError::write(format!("Failed to create {}: {e}", temp_path.display())))?;

        let written = async {
            file.write_all(content.as_bytes()).await?;
            file.sync_all().await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StateError::write(format!("Failed to write {}: {e}", temp_path.display())).into());
        }

        Ok(temp_path)
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        match fs::read_to_string(&self.lock_path).await {
            Ok(content) => decode_lock(&content).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::corrupted(format!("Failed to read lock file: {e}")).into()),
        }
    }

    /// Publishes the staged lock at the lock path, taking over expired locks.
    async fn publish_lock(&self, staged: &Path) -> Result<()> {
        for _ in 0..LOCK_ATTEMPTS {
            match fs::hard_link(staged, &self.lock_path).await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(StateError::LockFailed {
                        message: format!("Failed to create lock file: {e}"),
                    }
                    .into());
                }
            }

            // Released between the link and the read: try again.
            let Some(existing) = self.read_lock_file().await? else {
                continue;
            };
            if !existing.is_expired() {
                return Err(existing.into_conflict());
            }

            debug!(holder = %existing.holder, "Expired lock found, taking over");
            self.discard_expired(&existing).await?;
        }

        Err(StateError::LockFailed {
            message: format!("Lock file kept changing after {LOCK_ATTEMPTS} attempts"),
        }
        .into())
    }

    /// Moves an expired lock out of the way.
    ///
    /// The lock is renamed aside before it is inspected. If a contender had
    /// already replaced it with a live lock, that lock is linked back.
    async fn discard_expired(&self, expired: &LockInfo) -> Result<()> {
        let aside = sibling(&self.lock_path, "stale");

        match fs::rename(&self.lock_path, &aside).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(StateError::LockFailed {
                    message: format!("Failed to move expired lock: {e}"),
                }
                .into());
            }
        }

        let moved = fs::read_to_string(&aside)
            .await
            .ok()
            .and_then(|content| decode_lock(&content).ok());
        if moved.is_some_and(|lock| lock.lock_id != expired.lock_id)
            && let Err(e) = fs::hard_link(&aside, &self.lock_path).await
        {
            warn!("Could not restore a live lock moved aside: {e}");
        }

        let _ = fs::remove_file(&aside).await;
        Ok(())
    }

    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })?;
        }
        Ok(())
    }
}

/// Returns a unique path next to `target`, e.g. `state.json.<uuid>.tmp`.
fn sibling(target: &Path, suffix: &str) -> PathBuf {
    let name = target.file_name().map_or_else(String::new, |n| n.to_string_lossy().into_owned());
    target.with_file_name(format!("{name}.{}.{suffix}", Uuid::new_v4().simple()))
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        debug!("Loading state from: {}", self.state_path.display());

        let content = fs::read_to_string(&self.state_path)
            .await
            .map_err(|e| StateError::corrupted(format!("Failed to read state file: {e}")))?;

        decode_state(&content).map(Some)
    }

    async fn save(&self, state: &StateSnapshot) -> Result<()> {
        let content = encode_state(state)?;
        self.write_atomic(&self.state_path, &content).await?;
        debug!(serial = state.serial, "State saved to {}", self.state_path.display());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path)
                .await
                .map_err(|e| StateError::write(format!("Failed to delete state file: {e}")))?;
        }

        self.delete_lock_file().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let lock_info = LockInfo::new(&holder_or_generated(holder), operation);

        let staged = self.write_staged(&self.lock_path, &encode_lock(&lock_info)?).await?;
        let published = self.publish_lock(&staged).await;
        let _ = fs::remove_file(&staged).await;
        published?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        match self.read_lock_file().await? {
            Some(existing) if existing.lock_id == lock.lock_id => {
                let mut refreshed = existing;
                refreshed.refresh();
                self.write_atomic(&self.lock_path, &encode_lock(&refreshed)?).await?;
                debug!(lock_id = %refreshed.lock_id, "Refreshed state lock");
                Ok(refreshed)
            }
            Some(other) => Err(other.into_conflict()),
            None => Err(TierformError::State(StateError::LockFailed {
                message: format!("Lock {} is no longer held", lock.lock_id),
            })),
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!("Lock ID mismatch: expected {lock_id}, found {}", existing.lock_id);
            }
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceKind;
    use crate::state::{ResourceState, ResourceStatus};
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path().join(STATE_DIR));
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, temp) = create_test_store();

        let mut state = StateSnapshot::new("web-stack", "dev");
        let mut vpc = ResourceState::new("vpc", ResourceKind::Vpc, "hash", Vec::new());
        vpc.handle = Some(String::from("arn:aws:ec2:us-east-1:1:vpc/vpc-1"));
        vpc.status = ResourceStatus::Ready;
        state.upsert(vpc);
        state.touch();
        store.save(&state).await.expect("Failed to save state");

        let loaded = store
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded.project, "web-stack");
        assert_eq!(loaded.serial, 1);
        assert_eq!(loaded.get("vpc").unwrap().status, ResourceStatus::Ready);
        assert_eq!(std::fs::read_dir(temp.path().join(STATE_DIR)).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();
        let result = store.load().await.expect("Load should not fail");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_exists_and_delete() {
        let (store, _temp) = create_test_store();
        assert!(!store.exists().await.unwrap());

        store.save(&StateSnapshot::new("web-stack", "dev")).await.unwrap();
        assert!(store.exists().await.unwrap());

        store.delete().await.unwrap();
        assert!(!store.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store.acquire_lock("ci", "apply").await.expect("Failed to acquire lock");
        assert!(store.is_locked().await.unwrap());
        assert_eq!(store.get_lock_info().await.unwrap().unwrap().operation, "apply");

        store.release_lock(&lock.lock_id).await.expect("Failed to release lock");
        assert!(!store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _lock = store.acquire_lock("holder-1", "apply").await.unwrap();
        let err = store.acquire_lock("holder-2", "destroy").await.unwrap_err();
        assert!(matches!(err, TierformError::State(StateError::LockedByOther { ref holder, .. }) if holder == "holder-1"));
    }

    #[tokio::test]
    async fn test_expired_lock_taken_over() {
        let (store, _temp) = create_test_store();

        let mut stale = LockInfo::new("crashed", "apply");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(5);
        store.write_atomic(&store.lock_path, &encode_lock(&stale).unwrap()).await.unwrap();

        let lock = store.acquire_lock("fresh", "apply").await.unwrap();
        assert_eq!(lock.holder, "fresh");
    }

    #[tokio::test]
    async fn test_refresh_requires_ownership() {
        let (store, _temp) = create_test_store();

        let lock = store.acquire_lock("ci", "apply").await.unwrap();
        let refreshed = store.refresh_lock(&lock).await.unwrap();
        assert!(refreshed.expires_at >= lock.expires_at);

        let foreign = LockInfo::new("other", "apply");
        assert!(store.refresh_lock(&foreign).await.is_err());

        store.release_lock(&lock.lock_id).await.unwrap();
        assert!(store.refresh_lock(&lock).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_racing_stores_elect_one_holder() {
        for _ in 0..25 {
            let temp = TempDir::new().unwrap();
            let first = LocalStateStore::with_base_dir(temp.path());
            let second = LocalStateStore::with_base_dir(temp.path());

            let (a, b) = tokio::join!(first.acquire_lock("a", "apply"), second.acquire_lock("b", "apply"));
            let (winner, loser) = match (a, b) {
                (Ok(lock), Err(e)) | (Err(e), Ok(lock)) => (lock, e),
                other => panic!("expected exactly one holder, got {other:?}"),
            };

            assert!(matches!(loser, TierformError::State(StateError::LockedByOther { .. })));
            assert_eq!(first.get_lock_info().await.unwrap().unwrap().lock_id, winner.lock_id);
            assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1);

            second.release_lock(&winner.lock_id).await.unwrap();
            assert!(!first.is_locked().await.unwrap());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lock_and_state_writes_do_not_collide() {
        let temp = TempDir::new().unwrap();
        let writer = LocalStateStore::with_base_dir(temp.path());
        let locker = LocalStateStore::with_base_dir(temp.path());
        let state = StateSnapshot::new("web-stack", "dev");

        for _ in 0..25 {
            let (saved, locked) = tokio::join!(writer.save(&state), locker.acquire_lock("ci", "apply"));
            saved.unwrap();
            let lock = locked.unwrap();

            assert_eq!(writer.load().await.unwrap().unwrap().project, "web-stack");
            assert_eq!(locker.get_lock_info().await.unwrap().unwrap().lock_id, lock.lock_id);
            locker.release_lock(&lock.lock_id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_takeover_keeps_live_lock_moved_aside() {
        let (store, _temp) = create_test_store();

        let live = store.acquire_lock("live", "apply").await.unwrap();
        let mut expired = LockInfo::new("crashed", "apply");
        expired.expires_at = chrono::Utc::now() - chrono::Duration::seconds(5);

        store.discard_expired(&expired).await.unwrap();
        assert_eq!(store.get_lock_info().await.unwrap().unwrap().lock_id, live.lock_id);
    }
}
