//! The provider capability interface.

use async_trait::async_trait;

use crate::config::ResourceKind;
use crate::error::Result;

use super::types::{CreateRequest, ProviderResource, ProviderStatus};

/// Creates, describes and deletes resources on a control plane.
///
/// Implementations must be safe to call concurrently; the apply engine
/// issues calls for independent resources in parallel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Issues a create call.
    ///
    /// The returned status is `Available` if the resource is usable at once,
    /// or `InProgress` if it must be polled with [`describe`](Self::describe).
    async fn create(&self, request: &CreateRequest) -> Result<ProviderResource>;

    /// Describes the resource behind `handle`.
    async fn describe(&self, kind: ResourceKind, handle: &str) -> Result<ProviderResource>;

    /// Issues a delete call for `handle`.
    async fn delete(&self, kind: ResourceKind, handle: &str) -> Result<ProviderStatus>;

    /// Returns a short name for logs.
    fn name(&self) -> &'static str;
}
