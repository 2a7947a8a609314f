//! S3-based state storage backend.
//!
//! Remote state for teams and CI: the snapshot and its lock live as JSON
//! objects under a key prefix in a bucket. Lock writes are conditional
//! (`If-None-Match: *` for a fresh lock, `If-Match` on the expired lock's
//! ETag for a takeover), so only one contender's write is accepted.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::ProvideErrorMetadata;
use tracing::{debug, info};

use crate::error::{Result, StateError, TierformError};

use super::lock::{LOCK_ATTEMPTS, LOCK_EXPIRY_SECS, LockInfo, holder_or_generated};
use super::store::{StateStore, decode_lock, decode_state, encode_lock, encode_state};
use super::types::StateSnapshot;

/// State object key suffix.
const STATE_KEY: &str = "state.json";

/// Lock object key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending with `/`.
    prefix: String,
}

impl S3StateStore {
    /// Creates a new S3 state store from the ambient AWS configuration.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Self {
        let config = if let Some(region) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Self::with_client(Client::new(&config), bucket, prefix)
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_tagged_object(key).await?.map(|(content, _)| content))
    }

    /// Reads an object together with its `ETag`.
    async fn get_tagged_object(&self, key: &str) -> Result<Option<(String, Option<String>)>> {
        let result = self.client.get_object().bucket(&self.bucket).key(key).send().await;

        match result {
            Ok(response) => {
                let etag = response.e_tag().map(str::to_string);
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| StateError::s3(format!("Failed to read s3://{}/{key}: {e}", self.bucket)))?;

                let content = String::from_utf8(bytes.to_vec())
                    .map_err(|e| StateError::corrupted(format!("Invalid UTF-8 in s3://{}/{key}: {e}", self.bucket)))?;

                Ok(Some((content, etag)))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::s3(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 put error: {e}")))?;

        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 delete error: {e}")))?;

        Ok(())
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        Ok(self.read_tagged_lock().await?.map(|(lock, _)| lock))
    }

    async fn read_tagged_lock(&self) -> Result<Option<(LockInfo, Option<String>)>> {
        match self.get_tagged_object(&self.key(LOCK_KEY)).await? {
            Some((content, etag)) => Ok(Some((decode_lock(&content)?, etag))),
            None => Ok(None),
        }
    }

    /// Writes the lock object if no lock exists, or if the lock still has
    /// the ETag `replacing`. Returns false when another writer got there first.
    async fn put_lock(&self, lock: &LockInfo, replacing: Option<&str>) -> Result<bool> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(LOCK_KEY))
            .body(encode_lock(lock)?.into_bytes().into())
            .content_type("application/json");

        let request = match replacing {
            Some(etag) => request.if_match(etag),
            None => request.if_none_match("*"),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(e) if is_precondition_failure(e.code()) => Ok(false),
            Err(e) => Err(StateError::s3(format!("S3 lock put error: {e}")).into()),
        }
    }
}

/// Returns true for the error codes S3 uses when a conditional write loses.
fn is_precondition_failure(code: Option<&str>) -> bool {
    matches!(code, Some("PreconditionFailed" | "ConditionalRequestConflict"))
}

/// Normalizes a key prefix to be empty or end with exactly one `/`.
fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .map(|p| format!("{p}/"))
        .unwrap_or_default()
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        match self.get_object(&key).await? {
            Some(content) => {
                let state = decode_state(&content)?;
                info!(
                    serial = state.serial,
                    "Loaded state for project: {}/{}", state.project, state.environment
                );
                Ok(Some(state))
            }
            None => {
                debug!("No state found in S3");
                Ok(None)
            }
        }
    }

    async fn save(&self, state: &StateSnapshot) -> Result<()> {
        let key = self.key(STATE_KEY);
        self.put_object(&key, &encode_state(state)?).await?;
        debug!(serial = state.serial, "State saved to s3://{}/{key}", self.bucket);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let state_key = self.key(STATE_KEY);
        info!("Deleting state from s3://{}/{state_key}", self.bucket);

        self.delete_object(&state_key).await?;
        self.delete_object(&self.key(LOCK_KEY)).await
    }

    async fn exists(&self) -> Result<bool> {
        let key = self.key(STATE_KEY);
        let result = self.client.head_object().bucket(&self.bucket).key(&key).send().await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StateError::s3(format!("S3 head error: {service_err}")).into())
                }
            }
        }
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let lock_info = LockInfo::new(&holder_or_generated(holder), operation);

        for _ in 0..LOCK_ATTEMPTS {
            let replacing = match self.read_tagged_lock().await? {
                None => None,
                Some((existing, _)) if !existing.is_expired() => return Err(existing.into_conflict()),
                Some((existing, etag)) => {
                    debug!(holder = %existing.holder, "Expired lock found, taking over");
                    Some(etag.ok_or_else(|| StateError::LockFailed {
                        message: String::from("Expired lock object has no ETag"),
                    })?)
                }
            };

            if self.put_lock(&lock_info, replacing.as_deref()).await? {
                info!(
                    "Acquired state lock: {} (expires in {}s)",
                    lock_info.lock_id, LOCK_EXPIRY_SECS
                );
                return Ok(lock_info);
            }
            debug!("Lock object changed during acquisition, re-reading");
        }

        Err(StateError::LockFailed {
            message: format!("Lock object kept changing after {LOCK_ATTEMPTS} attempts"),
        }
        .into())
    }

    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        match self.read_lock().await? {
            Some(existing) if existing.lock_id == lock.lock_id => {
                let mut refreshed = existing;
                refreshed.refresh();
                self.put_object(&self.key(LOCK_KEY), &encode_lock(&refreshed)?).await?;
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
        if let Some(existing) = self.read_lock().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(LOCK_KEY)).await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!("Lock ID mismatch: expected {lock_id}, found {}", existing.lock_id);
            }
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock().await
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
