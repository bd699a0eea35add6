//! Device service: the remote provisioning API as seen by the reconciler.
//!
//! `DeviceService` mirrors the device operations of the Equinix Metal API. A
//! `DeviceServiceFactory` hands out a service bound to a project and API key;
//! production uses [`metal::MetalClientFactory`], tests use
//! [`crate::test_util::FakeDeviceService`].

pub mod metal;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use metal::{MetalClientConfig, MetalClientFactory, MetalDeviceService};

pub const STATE_QUEUED: &str = "queued";
pub const STATE_PROVISIONING: &str = "provisioning";
pub const STATE_ACTIVE: &str = "active";
pub const STATE_INACTIVE: &str = "inactive";
pub const STATE_DEPROVISIONING: &str = "deprovisioning";
pub const STATE_FAILED: &str = "failed";

/// Errors returned by a device service.
#[derive(Debug, Error)]
pub enum DeviceServiceError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("project ID is not set")]
    MissingProject,

    #[error("request cancelled")]
    Cancelled,
}

impl DeviceServiceError {
    /// The addressed resource does not exist on the provider.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DeviceServiceError::NotFound(_) | DeviceServiceError::Api { status: 404, .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DeviceServiceError::Cancelled)
    }
}

/// Transport metadata of a device service response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    pub status: u16,
    pub request_id: Option<String>,
    pub rate_limit_remaining: Option<u32>,
}

/// A device service result together with its transport metadata.
#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub value: T,
    pub meta: ResponseMeta,
}

impl<T> ApiResponse<T> {
    pub fn new(value: T, meta: ResponseMeta) -> Self {
        Self { value, meta }
    }
}

pub type DeviceResult<T> = Result<ApiResponse<T>, DeviceServiceError>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub slug: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facility {
    #[serde(default)]
    pub code: String,
}

/// IP address assigned to a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddressAssignment {
    pub address: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub address_family: u8,
}

/// A device as reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facility: Option<Facility>,
    #[serde(default)]
    pub ip_addresses: Vec<IpAddressAssignment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Device {
    pub fn is_powered_off(&self) -> bool {
        self.state == STATE_INACTIVE
    }

    pub fn is_failed(&self) -> bool {
        self.state == STATE_FAILED
    }

    pub fn is_deprovisioning(&self) -> bool {
        self.state == STATE_DEPROVISIONING
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Body of a device create call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCreateRequest {
    pub hostname: String,
    pub plan: String,
    pub facility: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operating_system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_cycle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userdata: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub locked: bool,
}

/// Body of a device update call. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceUpdateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userdata: Option<String>,
}

/// Filters and paging for list calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Free-text search, matched by the provider against hostname and tags.
    pub search: Option<String>,
    pub tag: Option<String>,
    pub per_page: Option<u32>,
}

impl ListOptions {
    pub fn search(term: impl Into<String>) -> Self {
        Self {
            search: Some(term.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BgpSession {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub address_family: String,
    #[serde(default)]
    pub learned_routes: Vec<String>,
    #[serde(default)]
    pub default_route: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BgpRoute {
    pub route: String,
    #[serde(default)]
    pub exact: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BgpNeighbor {
    #[serde(default)]
    pub address_family: u8,
    #[serde(default)]
    pub customer_as: u32,
    #[serde(default)]
    pub customer_ip: String,
    #[serde(default)]
    pub md5_enabled: bool,
    #[serde(default)]
    pub peer_as: u32,
    #[serde(default)]
    pub peer_ips: Vec<String>,
    #[serde(default)]
    pub routes_in: Vec<BgpRoute>,
    #[serde(default)]
    pub routes_out: Vec<BgpRoute>,
}

/// Provider-side event attached to a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub id: String,
    #[serde(default)]
    pub state: String,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Device operations of the provisioning API, bound to one project.
#[async_trait]
pub trait DeviceService: Send + Sync {
    /// List the project's devices.
    async fn list(&self, opts: &ListOptions) -> DeviceResult<Vec<Device>>;

    async fn get(&self, device_id: &str) -> DeviceResult<Device>;

    /// Create a device in the project.
    async fn create(&self, request: &DeviceCreateRequest) -> DeviceResult<Device>;

    async fn update(&self, device_id: &str, request: &DeviceUpdateRequest) -> DeviceResult<Device>;

    async fn delete(&self, device_id: &str, force: bool) -> DeviceResult<()>;

    async fn power_on(&self, device_id: &str) -> DeviceResult<()>;

    async fn power_off(&self, device_id: &str) -> DeviceResult<()>;

    async fn reboot(&self, device_id: &str) -> DeviceResult<()>;

    async fn lock(&self, device_id: &str) -> DeviceResult<()>;

    async fn unlock(&self, device_id: &str) -> DeviceResult<()>;

    async fn list_bgp_sessions(
        &self,
        device_id: &str,
        opts: &ListOptions,
    ) -> DeviceResult<Vec<BgpSession>>;

    async fn list_bgp_neighbors(
        &self,
        device_id: &str,
        opts: &ListOptions,
    ) -> DeviceResult<Vec<BgpNeighbor>>;

    /// Provider events for a device, newest first.
    async fn list_events(&self, device_id: &str, opts: &ListOptions)
        -> DeviceResult<Vec<DeviceEvent>>;
}

/// Hands out device services bound to a project and API key.
pub trait DeviceServiceFactory: Send + Sync {
    fn device_service(&self, project_id: &str, api_key: &str) -> Arc<dyn DeviceService>;
}

impl<F> DeviceServiceFactory for F
where
    F: Fn(&str, &str) -> Arc<dyn DeviceService> + Send + Sync,
{
    fn device_service(&self, project_id: &str, api_key: &str) -> Arc<dyn DeviceService> {
        self(project_id, api_key)
    }
}
