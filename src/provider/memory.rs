//! In-memory simulated provider.
//!
//! Resources live in a map guarded by a mutex. Each kind can take a number
//! of describe calls before becoming available, and individual resources can
//! be made to fail, so the engine's concurrency and failure handling can be
//! exercised without a control plane.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::config::ResourceKind;
use crate::error::{ProviderError, Result};

use super::traits::Provider;
use super::types::{CreateRequest, ProviderResource, ProviderStatus};

/// Region used when none is configured.
const DEFAULT_REGION: &str = "us-east-1";

/// Account id embedded in generated ARNs.
const ACCOUNT_ID: &str = "123456789012";

/// An injected failure for one declaration identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The create call is rejected.
    RejectCreate(String),
    /// The resource is created but fails instead of becoming available.
    FailReadiness(String),
    /// The resource stays in progress forever.
    NeverReady,
    /// The delete call reports a failure.
    FailDelete(String),
}

/// Number of calls received, per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// Create calls.
    pub creates: usize,
    /// Describe calls.
    pub describes: usize,
    /// Delete calls.
    pub deletes: usize,
}

#[derive(Debug, Clone)]
struct SimResource {
    resource_id: String,
    kind: ResourceKind,
    status: ProviderStatus,
    remaining_polls: u32,
    deleting: bool,
    attributes: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Default)]
struct Inner {
    resources: HashMap<String, SimResource>,
    next_serial: u64,
    calls: CallCounts,
    create_log: Vec<String>,
    delete_log: Vec<String>,
}

/// A deterministic in-memory provider.
#[derive(Debug)]
pub struct SimulatedProvider {
    inner: Mutex<Inner>,
    region: String,
    latency: Duration,
    default_polls: u32,
    kind_polls: HashMap<ResourceKind, u32>,
    faults: HashMap<String, Fault>,
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedProvider {
    /// Creates a provider where every resource is available at once.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            region: DEFAULT_REGION.to_string(),
            latency: Duration::ZERO,
            default_polls: 0,
            kind_polls: HashMap::new(),
            faults: HashMap::new(),
        }
    }

    /// Sets the region embedded in handles.
    #[must_use]
    pub fn with_region(mut self, region: &str) -> Self {
        self.region = region.to_string();
        self
    }

    /// Adds a delay to every call.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Sets how many describe calls every resource needs before it settles.
    #[must_use]
    pub const fn with_polls(mut self, polls: u32) -> Self {
        self.default_polls = polls;
        self
    }

    /// Sets the number of describe calls for one kind.
    #[must_use]
    pub fn with_kind_polls(mut self, kind: ResourceKind, polls: u32) -> Self {
        self.kind_polls.insert(kind, polls);
        self
    }

    /// Injects a failure for a declaration identifier.
    #[must_use]
    pub fn with_fault(mut self, resource_id: &str, fault: Fault) -> Self {
        self.faults.insert(resource_id.to_string(), fault);
        self
    }

    /// Returns the number of calls received so far.
    #[must_use]
    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    /// Returns declaration identifiers in the order create calls arrived.
    #[must_use]
    pub fn create_log(&self) -> Vec<String> {
        self.lock().create_log.clone()
    }

    /// Returns declaration identifiers in the order delete calls arrived.
    #[must_use]
    pub fn delete_log(&self) -> Vec<String> {
        self.lock().delete_log.clone()
    }

    /// Returns the number of resources that currently exist.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.lock().resources.len()
    }

    /// Returns the handle of the live resource created for `resource_id`.
    #[must_use]
    pub fn handle_of(&self, resource_id: &str) -> Option<String> {
        self.lock()
            .resources
            .iter()
            .find(|(_, r)| r.resource_id == resource_id)
            .map(|(handle, _)| handle.clone())
    }

    /// Removes a resource behind the engine's back.
    pub fn forget(&self, handle: &str) -> bool {
        self.lock().resources.remove(handle).is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn polls_for(&self, kind: ResourceKind) -> u32 {
        self.kind_polls.get(&kind).copied().unwrap_or(self.default_polls)
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn settle(&self, resource: &mut SimResource) {
        match self.faults.get(&resource.resource_id) {
            Some(Fault::NeverReady) => {}
            Some(Fault::FailReadiness(reason)) => resource.status = ProviderStatus::Failed(reason.clone()),
            _ => resource.status = ProviderStatus::Available,
        }
    }

    fn view(handle: &str, resource: &SimResource) -> ProviderResource {
        ProviderResource {
            handle: handle.to_string(),
            status: resource.status.clone(),
            attributes: resource.attributes.clone(),
        }
    }
}

#[async_trait]
impl Provider for SimulatedProvider {
    async fn create(&self, request: &CreateRequest) -> Result<ProviderResource> {
        self.delay().await;

        let mut inner = self.lock();
        inner.calls.creates += 1;
        inner.create_log.push(request.resource_id.clone());

        if let Some(Fault::RejectCreate(reason)) = self.faults.get(&request.resource_id) {
            return Err(ProviderError::rejected(&request.resource_id, 400, reason.clone()).into());
        }

        inner.next_serial += 1;
        let serial = inner.next_serial;
        let short_id = format!("{}-{serial:08x}", id_prefix(request.kind));
        let handle = arn(request.kind, &self.region, &short_id);
        let attributes = synthesize_attributes(request, &short_id, &handle, &self.region, serial);

        let mut resource = SimResource {
            resource_id: request.resource_id.clone(),
            kind: request.kind,
            status: ProviderStatus::InProgress,
            remaining_polls: self.polls_for(request.kind),
            deleting: false,
            attributes,
        };
        if resource.remaining_polls == 0 {
            self.settle(&mut resource);
        }

        debug!(resource = %request.resource_id, %handle, status = %resource.status, "Simulated create");

        let view = Self::view(&handle, &resource);
        inner.resources.insert(handle, resource);
        Ok(view)
    }

    async fn describe(&self, kind: ResourceKind, handle: &str) -> Result<ProviderResource> {
        self.delay().await;

        let mut inner = self.lock();
        inner.calls.describes += 1;

        let Some(mut resource) = inner.resources.get(handle).filter(|r| r.kind == kind).cloned() else {
            return Ok(ProviderResource::new(handle, ProviderStatus::NotFound));
        };

        if resource.status == ProviderStatus::InProgress {
            resource.remaining_polls = resource.remaining_polls.saturating_sub(1);
            if resource.remaining_polls == 0 {
                if resource.deleting {
                    inner.resources.remove(handle);
                    return Ok(ProviderResource::new(handle, ProviderStatus::NotFound));
                }
                self.settle(&mut resource);
            }
        }

        let view = Self::view(handle, &resource);
        inner.resources.insert(handle.to_string(), resource);
        Ok(view)
    }

    async fn delete(&self, kind: ResourceKind, handle: &str) -> Result<ProviderStatus> {
        self.delay().await;

        let mut inner = self.lock();
        inner.calls.deletes += 1;

        let Some(resource) = inner.resources.get_mut(handle).filter(|r| r.kind == kind) else {
            return Ok(ProviderStatus::NotFound);
        };
        let resource_id = resource.resource_id.clone();

        if let Some(Fault::FailDelete(reason)) = self.faults.get(&resource_id) {
            inner.delete_log.push(resource_id);
            return Ok(ProviderStatus::Failed(reason.clone()));
        }

        let polls = self.polls_for(kind);
        let status = if polls == 0 {
            inner.resources.remove(handle);
            ProviderStatus::Available
        } else {
            resource.deleting = true;
            resource.remaining_polls = polls;
            resource.status = ProviderStatus::InProgress;
            ProviderStatus::InProgress
        };

        debug!(resource = %resource_id, handle, %status, "Simulated delete");
        inner.delete_log.push(resource_id);
        Ok(status)
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

const fn id_prefix(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Vpc => "vpc",
        ResourceKind::Subnet => "subnet",
        ResourceKind::InternetGateway => "igw",
        ResourceKind::RouteTable => "rtb",
        ResourceKind::SecurityGroup => "sg",
        ResourceKind::LoadBalancer => "app",
        ResourceKind::TargetGroup => "tg",
        ResourceKind::Listener => "listener",
        ResourceKind::LaunchTemplate => "lt",
        ResourceKind::AutoScalingGroup => "asg",
        ResourceKind::Instance => "i",
        ResourceKind::TargetAttachment => "attach",
        ResourceKind::DbSubnetGroup => "dbsubnet",
        ResourceKind::DbCluster => "cluster",
        ResourceKind::DbInstance => "db",
        ResourceKind::CacheSubnetGroup => "cachesubnet",
        ResourceKind::CacheReplicationGroup => "rg",
        ResourceKind::FileSystem => "fs",
        ResourceKind::MountTarget => "fsmt",
    }
}

const fn service(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::LoadBalancer | ResourceKind::TargetGroup | ResourceKind::Listener | ResourceKind::TargetAttachment => {
            "elasticloadbalancing"
        }
        ResourceKind::AutoScalingGroup => "autoscaling",
        ResourceKind::DbSubnetGroup | ResourceKind::DbCluster | ResourceKind::DbInstance => "rds",
        ResourceKind::CacheSubnetGroup | ResourceKind::CacheReplicationGroup => "elasticache",
        ResourceKind::FileSystem | ResourceKind::MountTarget => "elasticfilesystem",
        _ => "ec2",
    }
}

fn arn(kind: ResourceKind, region: &str, short_id: &str) -> String {
    format!("arn:aws:{}:{region}:{ACCOUNT_ID}:{}/{short_id}", service(kind), kind.as_str())
}

fn synthesize_attributes(
    request: &CreateRequest,
    short_id: &str,
    handle: &str,
    region: &str,
    serial: u64,
) -> BTreeMap<String, JsonValue> {
    let octets = (serial / 256 % 256, serial % 256);
    let private_ip = format!("10.0.{}.{}", octets.0, octets.1);

    request
        .kind
        .exported_attributes()
        .into_iter()
        .map(|attr| {
            let value = match attr {
                "id" => JsonValue::from(short_id),
                "arn" => JsonValue::from(handle),
                _ if request.attributes.contains_key(attr) => request.attributes[attr].clone(),
                "name" => JsonValue::from(request.resource_id.replace(['[', ']'], "-").trim_end_matches('-')),
                "availability_zone" => JsonValue::from(format!("{region}a")),
                "private_ip" | "ip_address" => JsonValue::from(private_ip.clone()),
                "public_ip" => JsonValue::from(format!("54.210.{}.{}", octets.0, octets.1)),
                "private_dns" => JsonValue::from(format!("ip-{}.ec2.internal", private_ip.replace('.', "-"))),
                "port" => JsonValue::from(default_port(request)),
                "latest_version" => JsonValue::from(1),
                "zone_id" => JsonValue::from("Z35SXDOTRQ7X7K"),
                "default_security_group_id" => JsonValue::from(format!("sg-{serial:08x}")),
                "dns_name" | "endpoint" | "primary_endpoint" | "reader_endpoint" => JsonValue::from(format!(
                    "{short_id}.{attr_tag}.{region}.amazonaws.com",
                    attr_tag = attr.replace('_', "-")
                )),
                other => JsonValue::from(format!("{other}-{short_id}")),
            };
            (attr.to_string(), value)
        })
        .collect()
}

fn default_port(request: &CreateRequest) -> u16 {
    let engine = request
        .attributes
        .get("engine")
        .and_then(JsonValue::as_str)
        .unwrap_or_default();
    match request.kind {
        ResourceKind::CacheReplicationGroup => 6379,
        ResourceKind::DbCluster if engine.contains("postgres") => 5432,
        ResourceKind::DbCluster => 3306,
        _ => 443,
    }
}
