//! Types exchanged with resource providers.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::config::ResourceKind;

/// Request to create a resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateRequest {
    /// Declaration identifier, used as the resource name.
    #[serde(rename = "name")]
    pub resource_id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Region to create the resource in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Fully resolved attributes.
    pub attributes: BTreeMap<String, JsonValue>,
    /// Tags identifying the owning project.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl CreateRequest {
    /// Creates a new request.
    #[must_use]
    pub fn new(resource_id: &str, kind: ResourceKind, attributes: BTreeMap<String, JsonValue>) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            kind,
            region: None,
            attributes,
            tags: BTreeMap::new(),
        }
    }

    /// Sets the region.
    #[must_use]
    pub fn with_region(mut self, region: Option<&str>) -> Self {
        self.region = region.map(String::from);
        self
    }

    /// Returns a key that is stable for identical requests.
    ///
    /// Sent with the create call so a gateway can recognise a retried POST
    /// whose first attempt already created the resource.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(self).unwrap_or_default());
        hex::encode(hasher.finalize())
    }

    /// Adds the project ownership tags.
    #[must_use]
    pub fn with_project(mut self, project: &str, environment: &str) -> Self {
        self.tags.insert(String::from("tierform:project"), project.to_string());
        self.tags.insert(String::from("tierform:environment"), environment.to_string());
        self.tags.insert(String::from("tierform:resource"), self.resource_id.clone());
        self
    }
}

/// Status of a provider-side resource or operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ProviderStatus {
    /// The operation is still running.
    InProgress,
    /// The resource is available.
    Available,
    /// The operation failed.
    Failed(String),
    /// The handle does not exist.
    NotFound,
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "in progress"),
            Self::Available => write!(f, "available"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::NotFound => write!(f, "not found"),
        }
    }
}

/// A provider-side resource as last observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResource {
    /// Provider-assigned handle.
    pub handle: String,
    /// Current status.
    pub status: ProviderStatus,
    /// Realized attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, JsonValue>,
}

impl ProviderResource {
    /// Creates a resource view with no attributes.
    #[must_use]
    pub fn new(handle: &str, status: ProviderStatus) -> Self {
        Self {
            handle: handle.to_string(),
            status,
            attributes: BTreeMap::new(),
        }
    }
}
