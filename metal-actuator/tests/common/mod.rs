//! In-process mock of the Equinix Metal API for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metal_actuator::device::{
    Device, DeviceCreateRequest, DeviceEvent, DeviceUpdateRequest, IpAddressAssignment, Plan,
    MetalClientConfig, MetalClientFactory,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;

pub const API_KEY: &str = "mock-api-key";
pub const PROJECT_ID: &str = "mock-project";

/// A request as seen by the mock.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
}

#[derive(Default)]
pub struct MockState {
    devices: Mutex<BTreeMap<String, Device>>,
    events: Mutex<HashMap<String, Vec<DeviceEvent>>>,
    requests: Mutex<Vec<Recorded>>,
    created: Mutex<u32>,
}

type Shared = Arc<MockState>;

impl MockState {
    pub fn insert(&self, device: Device) {
        self.devices
            .lock()
            .unwrap()
            .insert(device.id.clone(), device);
    }

    pub fn device(&self, id: &str) -> Option<Device> {
        self.devices.lock().unwrap().get(id).cloned()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices.lock().unwrap().values().cloned().collect()
    }

    pub fn add_event(&self, device_id: &str, event: DeviceEvent) {
        self.events
            .lock()
            .unwrap()
            .entry(device_id.to_string())
            .or_default()
            .insert(0, event);
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "errors": [message] }))).into_response()
}

fn not_found() -> Response {
    error(StatusCode::NOT_FOUND, "Not found")
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// Record the request, check the token and stamp response headers.
async fn guard(State(state): State<Shared>, request: Request, next: Next) -> Response {
    state.requests.lock().unwrap().push(Recorded {
        method: request.method().to_string(),
        path: request.uri().path().to_string(),
        query: request.uri().query().map(parse_query).unwrap_or_default(),
    });

    let token = request
        .headers()
        .get("x-auth-token")
        .and_then(|v| v.to_str().ok());
    if token != Some(API_KEY) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Invalid authentication token" })),
        )
            .into_response();
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("x-request-id", HeaderValue::from_static("mock-request"));
    headers.insert("x-ratelimit-remaining", HeaderValue::from_static("4999"));
    response
}

async fn list_devices(
    State(state): State<Shared>,
    Path(project): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if project != PROJECT_ID {
        return not_found();
    }
    let per_page: usize = query
        .get("per_page")
        .and_then(|v| v.parse().ok())
        .unwrap_or(100)
        .max(1);
    let page: usize = query
        .get("page")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1)
        .max(1);

    let matching: Vec<Device> = state
        .devices()
        .into_iter()
        .filter(|d| {
            query
                .get("search")
                .map_or(true, |term| d.hostname.contains(term.as_str()))
        })
        .collect();
    let last_page = matching.len().div_ceil(per_page).max(1);
    let devices: Vec<Device> = matching
        .into_iter()
        .skip((page - 1) * per_page)
        .take(per_page)
        .collect();

    Json(json!({
        "devices": devices,
        "meta": { "current_page": page, "last_page": last_page }
    }))
    .into_response()
}

async fn create_device(
    State(state): State<Shared>,
    Path(project): Path<String>,
    Json(request): Json<DeviceCreateRequest>,
) -> Response {
    if project != PROJECT_ID {
        return not_found();
    }
    if request.plan.is_empty() {
        return error(StatusCode::UNPROCESSABLE_ENTITY, "plan is required");
    }
    let n = {
        let mut created = state.created.lock().unwrap();
        *created += 1;
        *created
    };
    let device = Device {
        id: format!("device-{}", n),
        hostname: request.hostname,
        state: "queued".to_string(),
        locked: request.locked,
        tags: request.tags,
        plan: Some(Plan { slug: request.plan }),
        ip_addresses: vec![IpAddressAssignment {
            address: format!("147.75.1.{}", n),
            public: true,
            address_family: 4,
        }],
        ..Default::default()
    };
    state.insert(device.clone());
    (StatusCode::CREATED, Json(device)).into_response()
}

async fn get_device(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    match state.device(&id) {
        Some(device) => Json(device).into_response(),
        None => not_found(),
    }
}

async fn update_device(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Json(request): Json<DeviceUpdateRequest>,
) -> Response {
    let mut devices = state.devices.lock().unwrap();
    let Some(device) = devices.get_mut(&id) else {
        return not_found();
    };
    if let Some(tags) = request.tags {
        device.tags = tags;
    }
    if let Some(locked) = request.locked {
        device.locked = locked;
    }
    if let Some(hostname) = request.hostname {
        device.hostname = hostname;
    }
    Json(device.clone()).into_response()
}

async fn delete_device(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let mut devices = state.devices.lock().unwrap();
    let locked = match devices.get(&id) {
        Some(device) => device.locked,
        None => return not_found(),
    };
    if locked {
        return error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Cannot delete a locked device",
        );
    }
    devices.remove(&id);
    StatusCode::NO_CONTENT.into_response()
}

async fn device_action(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let mut devices = state.devices.lock().unwrap();
    let Some(device) = devices.get_mut(&id) else {
        return not_found();
    };
    match body["type"].as_str() {
        Some("power_on") => device.state = "active".to_string(),
        Some("power_off") => device.state = "inactive".to_string(),
        Some("reboot") => {}
        _ => return error(StatusCode::UNPROCESSABLE_ENTITY, "unknown action"),
    }
    StatusCode::ACCEPTED.into_response()
}

async fn list_events(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    if state.device(&id).is_none() {
        return not_found();
    }
    let events = state
        .events
        .lock()
        .unwrap()
        .get(&id)
        .cloned()
        .unwrap_or_default();
    Json(json!({ "events": events })).into_response()
}

async fn bgp_sessions(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    if state.device(&id).is_none() {
        return not_found();
    }
    Json(json!({
        "bgp_sessions": [{
            "id": "session-1",
            "status": "up",
            "address_family": "ipv4",
            "learned_routes": ["10.0.0.0/8"],
            "default_route": false
        }]
    }))
    .into_response()
}

async fn bgp_neighbors(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    if state.device(&id).is_none() {
        return not_found();
    }
    Json(json!({
        "bgp_neighbors": [{
            "address_family": 4,
            "customer_as": 65000,
            "customer_ip": "10.0.0.2",
            "md5_enabled": false,
            "peer_as": 65530,
            "peer_ips": ["169.254.255.1", "169.254.255.2"],
            "routes_in": [{"route": "10.0.0.0/8", "exact": false}],
            "routes_out": []
        }]
    }))
    .into_response()
}

/// Mock API server bound to an ephemeral port.
pub struct MockMetalApi {
    pub addr: SocketAddr,
    pub state: Shared,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl MockMetalApi {
    pub async fn spawn() -> Self {
        let state: Shared = Arc::new(MockState::default());

        let router = Router::new()
            .route(
                "/projects/{project}/devices",
                get(list_devices).post(create_device),
            )
            .route(
                "/devices/{id}",
                get(get_device).put(update_device).delete(delete_device),
            )
            .route("/devices/{id}/actions", post(device_action))
            .route("/devices/{id}/events", get(list_events))
            .route("/devices/{id}/bgp/sessions", get(bgp_sessions))
            .route("/devices/{id}/bgp/neighbors", get(bgp_neighbors))
            .layer(middleware::from_fn_with_state(state.clone(), guard))
            .with_state(state.clone());

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpListener::bind(&addr).await.expect("Failed to bind");
        let actual_addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("Server error");
        });

        Self {
            addr: actual_addr,
            state,
            shutdown_tx,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn factory(&self) -> MetalClientFactory {
        MetalClientFactory::new(MetalClientConfig {
            base_url: self.base_url(),
            ..Default::default()
        })
        .expect("Failed to build client")
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}
