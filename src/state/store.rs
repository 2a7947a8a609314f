//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::{STATE_VERSION, StateSnapshot};
use crate::error::{Result, StateError, TierformError};

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the snapshot.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<StateSnapshot>>;

    /// Saves the snapshot.
    async fn save(&self, state: &StateSnapshot) -> Result<()>;

    /// Deletes the snapshot.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the lock for `operation`.
    ///
    /// Fails with [`StateError::LockedByOther`] while another holder has an
    /// unexpired lock.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Pushes the expiry of a held lock forward.
    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo>;

    /// Releases the lock if `lock_id` still holds it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self.get_lock_info().await?.is_some_and(|lock| !lock.is_expired()))
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        (**self).load().await
    }

    async fn save(&self, state: &StateSnapshot) -> Result<()> {
        (**self).save(state).await
    }

    async fn delete(&self) -> Result<()> {
        (**self).delete().await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder, operation).await
    }

    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        (**self).refresh_lock(lock).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}

/// Decodes a stored snapshot, rejecting unknown format versions.
///
/// # Errors
///
/// Returns an error if the content is not a valid snapshot.
pub fn decode_state(content: &str) -> Result<StateSnapshot> {
    let state: StateSnapshot = serde_json::from_str(content)
        .map_err(|e| StateError::corrupted(format!("Failed to parse state: {e}")))?;

    if state.version != STATE_VERSION {
        return Err(TierformError::State(StateError::VersionMismatch {
            expected: STATE_VERSION.to_string(),
            found: state.version,
        }));
    }

    Ok(state)
}

/// Encodes a snapshot for storage.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_state(state: &StateSnapshot) -> Result<String> {
    serde_json::to_string_pretty(state)
        .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")).into())
}

/// Decodes a stored lock.
///
/// # Errors
///
/// Returns an error if the content is not a valid lock.
pub fn decode_lock(content: &str) -> Result<LockInfo> {
    serde_json::from_str(content)
        .map_err(|e| StateError::corrupted(format!("Failed to parse lock: {e}")).into())
}

/// Encodes a lock for storage.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_lock(lock: &LockInfo) -> Result<String> {
    serde_json::to_string_pretty(lock)
        .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_other_versions() {
        let mut state = StateSnapshot::new("web-stack", "dev");
        state.version = String::from("0.1");
        let content = serde_json::to_string(&state).unwrap();

        let err = decode_state(&content).unwrap_err();
        assert!(matches!(err, TierformError::State(StateError::VersionMismatch { .. })));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode_state("{not json").unwrap_err();
        assert!(matches!(err, TierformError::State(StateError::Corrupted { .. })));
    }

    #[test]
    fn test_encode_decode_preserves_records() {
        let state = StateSnapshot::new("web-stack", "prod");
        let decoded = decode_state(&encode_state(&state).unwrap()).unwrap();
        assert_eq!(decoded.project, "web-stack");
        assert_eq!(decoded.environment, "prod");
    }
}
