//! Equinix Metal REST client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    ApiResponse, BgpNeighbor, BgpSession, Device, DeviceCreateRequest, DeviceEvent, DeviceResult,
    DeviceService, DeviceServiceError, DeviceServiceFactory, DeviceUpdateRequest, ListOptions,
    ResponseMeta,
};

pub const DEFAULT_API_URL: &str = "https://api.equinix.com/metal/v1";

const AUTH_HEADER: &str = "X-Auth-Token";
const REQUEST_ID_HEADER: &str = "x-request-id";
const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
const DEFAULT_PAGE_SIZE: u32 = 100;

/// Connection settings for the Equinix Metal API.
#[derive(Debug, Clone)]
pub struct MetalClientConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for MetalClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            user_agent: format!("metal-actuator/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Factory for [`MetalDeviceService`] handles.
///
/// One HTTP connection pool is shared by every handle. Handles are cached per
/// API key and project.
pub struct MetalClientFactory {
    http: reqwest::Client,
    base_url: String,
    services: Mutex<HashMap<(String, String), Arc<MetalDeviceService>>>,
}

impl MetalClientFactory {
    pub fn new(config: MetalClientConfig) -> Result<Self, DeviceServiceError> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            services: Mutex::new(HashMap::new()),
        })
    }
}

impl DeviceServiceFactory for MetalClientFactory {
    fn device_service(&self, project_id: &str, api_key: &str) -> Arc<dyn DeviceService> {
        let mut services = self
            .services
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let service = services
            .entry((api_key.to_string(), project_id.to_string()))
            .or_insert_with(|| {
                debug!("Creating Equinix Metal client for project {:?}", project_id);
                Arc::new(MetalDeviceService {
                    http: self.http.clone(),
                    base_url: self.base_url.clone(),
                    project_id: project_id.to_string(),
                    api_key: api_key.to_string(),
                })
            });

        Arc::clone(service) as Arc<dyn DeviceService>
    }
}

/// Device service backed by the Equinix Metal API.
pub struct MetalDeviceService {
    http: reqwest::Client,
    base_url: String,
    project_id: String,
    api_key: String,
}

#[derive(Deserialize)]
struct PageMeta {
    #[serde(default)]
    last_page: Option<u32>,
}

#[derive(Deserialize)]
struct DeviceList {
    #[serde(default)]
    devices: Vec<Device>,
    #[serde(default)]
    meta: Option<PageMeta>,
}

#[derive(Deserialize)]
struct BgpSessionList {
    #[serde(default)]
    bgp_sessions: Vec<BgpSession>,
}

#[derive(Deserialize)]
struct BgpNeighborList {
    #[serde(default)]
    bgp_neighbors: Vec<BgpNeighbor>,
}

#[derive(Deserialize)]
struct EventList {
    #[serde(default)]
    events: Vec<DeviceEvent>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
struct DeviceAction<'a> {
    #[serde(rename = "type")]
    action: &'a str,
}

#[derive(Serialize)]
struct LockRequest {
    locked: bool,
}

/// Build the message of a failed call from the provider's error body.
fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if !parsed.errors.is_empty() {
            return parsed.errors.join("; ");
        }
        if let Some(error) = parsed.error {
            return error;
        }
    }

    let body = body.trim();
    if body.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string()
    } else {
        body.to_string()
    }
}

fn list_query(opts: &ListOptions, page: u32) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("page", page.to_string()),
        (
            "per_page",
            opts.per_page.unwrap_or(DEFAULT_PAGE_SIZE).to_string(),
        ),
    ];
    if let Some(search) = &opts.search {
        query.push(("search", search.clone()));
    }
    if let Some(tag) = &opts.tag {
        query.push(("tag", tag.clone()));
    }
    query
}

impl MetalDeviceService {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn project_path(&self, suffix: &str) -> Result<String, DeviceServiceError> {
        if self.project_id.is_empty() {
            return Err(DeviceServiceError::MissingProject);
        }
        Ok(self.url(&format!("/projects/{}{}", self.project_id, suffix)))
    }

    /// Send a request and check its status. `resource` names the target in
    /// not-found errors.
    async fn send(
        &self,
        request: RequestBuilder,
        resource: &str,
    ) -> Result<(reqwest::Response, ResponseMeta), DeviceServiceError> {
        let response = request.header(AUTH_HEADER, &self.api_key).send().await?;

        let status = response.status();
        let headers = response.headers();
        let meta = ResponseMeta {
            status: status.as_u16(),
            request_id: headers
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            rate_limit_remaining: headers
                .get(RATE_LIMIT_REMAINING_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok()),
        };
        debug!(
            status = meta.status,
            request_id = ?meta.request_id,
            "Equinix Metal API response for {}",
            resource
        );

        if status == StatusCode::NOT_FOUND {
            return Err(DeviceServiceError::NotFound(resource.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeviceServiceError::Api {
                status: status.as_u16(),
                message: error_message(status, &body),
            });
        }

        Ok((response, meta))
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        resource: &str,
    ) -> DeviceResult<T> {
        let (response, meta) = self.send(request, resource).await?;
        let value = response.json::<T>().await?;
        Ok(ApiResponse::new(value, meta))
    }

    async fn execute(&self, request: RequestBuilder, resource: &str) -> DeviceResult<()> {
        let (_, meta) = self.send(request, resource).await?;
        Ok(ApiResponse::new((), meta))
    }

    async fn action(&self, device_id: &str, action: &str) -> DeviceResult<()> {
        let request = self
            .http
            .post(self.url(&format!("/devices/{}/actions", device_id)))
            .json(&DeviceAction { action });
        self.execute(request, &format!("device {}", device_id)).await
    }

    async fn set_lock(&self, device_id: &str, locked: bool) -> DeviceResult<()> {
        let request = self
            .http
            .put(self.url(&format!("/devices/{}", device_id)))
            .json(&LockRequest { locked });
        self.execute(request, &format!("device {}", device_id)).await
    }
}

#[async_trait]
impl DeviceService for MetalDeviceService {
    async fn list(&self, opts: &ListOptions) -> DeviceResult<Vec<Device>> {
        let url = self.project_path("/devices")?;
        let mut devices = Vec::new();
        let mut page = 1;

        loop {
            let request = self.http.get(&url).query(&list_query(opts, page));
            let response: ApiResponse<DeviceList> = self.fetch(request, "project devices").await?;
            devices.extend(response.value.devices);

            match response.value.meta.and_then(|m| m.last_page) {
                Some(last) if page < last => page += 1,
                _ => return Ok(ApiResponse::new(devices, response.meta)),
            }
        }
    }

    async fn get(&self, device_id: &str) -> DeviceResult<Device> {
        let request = self.http.get(self.url(&format!("/devices/{}", device_id)));
        self.fetch(request, &format!("device {}", device_id)).await
    }

    async fn create(&self, request: &DeviceCreateRequest) -> DeviceResult<Device> {
        let url = self.project_path("/devices")?;
        self.fetch(self.http.post(url).json(request), "project devices")
            .await
    }

    async fn update(&self, device_id: &str, request: &DeviceUpdateRequest) -> DeviceResult<Device> {
        let builder = self
            .http
            .put(self.url(&format!("/devices/{}", device_id)))
            .json(request);
        self.fetch(builder, &format!("device {}", device_id)).await
    }

    async fn delete(&self, device_id: &str, force: bool) -> DeviceResult<()> {
        let request = self
            .http
            .delete(self.url(&format!("/devices/{}", device_id)))
            .query(&[("force_delete", force)]);
        self.execute(request, &format!("device {}", device_id)).await
    }

    async fn power_on(&self, device_id: &str) -> DeviceResult<()> {
        self.action(device_id, "power_on").await
    }

    async fn power_off(&self, device_id: &str) -> DeviceResult<()> {
        self.action(device_id, "power_off").await
    }

    async fn reboot(&self, device_id: &str) -> DeviceResult<()> {
        self.action(device_id, "reboot").await
    }

    async fn lock(&self, device_id: &str) -> DeviceResult<()> {
        self.set_lock(device_id, true).await
    }

    async fn unlock(&self, device_id: &str) -> DeviceResult<()> {
        self.set_lock(device_id, false).await
    }

    async fn list_bgp_sessions(
        &self,
        device_id: &str,
        opts: &ListOptions,
    ) -> DeviceResult<Vec<BgpSession>> {
        let request = self
            .http
            .get(self.url(&format!("/devices/{}/bgp/sessions", device_id)))
            .query(&list_query(opts, 1));
        let response: ApiResponse<BgpSessionList> = self
            .fetch(request, &format!("device {}", device_id))
            .await?;
        Ok(ApiResponse::new(response.value.bgp_sessions, response.meta))
    }

    async fn list_bgp_neighbors(
        &self,
        device_id: &str,
        opts: &ListOptions,
    ) -> DeviceResult<Vec<BgpNeighbor>> {
        let request = self
            .http
            .get(self.url(&format!("/devices/{}/bgp/neighbors", device_id)))
            .query(&list_query(opts, 1));
        let response: ApiResponse<BgpNeighborList> = self
            .fetch(request, &format!("device {}", device_id))
            .await?;
        Ok(ApiResponse::new(response.value.bgp_neighbors, response.meta))
    }

    async fn list_events(
        &self,
        device_id: &str,
        opts: &ListOptions,
    ) -> DeviceResult<Vec<DeviceEvent>> {
        let request = self
            .http
            .get(self.url(&format!("/devices/{}/events", device_id)))
            .query(&list_query(opts, 1));
        let response: ApiResponse<EventList> = self
            .fetch(request, &format!("device {}", device_id))
            .await?;
        Ok(ApiResponse::new(response.value.events, response.meta))
    }
}
