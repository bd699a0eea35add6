//! Test helpers: a recording in-memory device service and Machine builders.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use metal_apis::{encode_spec, LocalObjectReference, Machine, ProviderSpec, CLUSTER_ID_LABEL};

use crate::device::{
    ApiResponse, BgpNeighbor, BgpSession, Device, DeviceCreateRequest, DeviceEvent, DeviceResult,
    DeviceService, DeviceServiceError, DeviceServiceFactory, DeviceUpdateRequest, Facility,
    IpAddressAssignment, ListOptions, Plan, ResponseMeta, STATE_ACTIVE, STATE_INACTIVE,
    STATE_PROVISIONING,
};
use crate::scope::{CREDENTIALS_SECRET_KEY, USER_DATA_SECRET_KEY};
use crate::secrets::MemorySecrets;

pub const NAMESPACE: &str = "test";
pub const CLUSTER_ID: &str = "test-cluster";
pub const PROJECT_ID: &str = "test-project";
pub const API_KEY: &str = "test-api-key";
pub const CREDENTIALS_SECRET: &str = "equinix-metal-credentials";
pub const USER_DATA_SECRET: &str = "worker-user-data";
pub const USER_DATA: &str = "#cloud-config\n";
pub const MACHINE_TYPE: &str = "c3.small.x86";
pub const FACILITY: &str = "ny5";

/// Provider spec referencing the test secrets.
pub fn provider_spec() -> ProviderSpec {
    ProviderSpec {
        user_data_secret: Some(LocalObjectReference::new(USER_DATA_SECRET)),
        machine_type: MACHINE_TYPE.to_string(),
        facility: FACILITY.to_string(),
        credentials_secret: Some(LocalObjectReference::new(CREDENTIALS_SECRET)),
        operating_system: Some("rhcos_a".to_string()),
        billing_cycle: Some("hourly".to_string()),
        ..Default::default()
    }
}

/// A Machine in the test namespace carrying the cluster label and `spec`.
pub fn machine_with_spec(name: &str, spec: &ProviderSpec) -> Machine {
    let mut machine = Machine::new(NAMESPACE, name);
    machine
        .metadata
        .labels
        .insert(CLUSTER_ID_LABEL.to_string(), CLUSTER_ID.to_string());
    machine.spec.provider_spec = Some(encode_spec(spec).expect("test provider spec encodes"));
    machine
}

pub fn machine(name: &str) -> Machine {
    machine_with_spec(name, &provider_spec())
}

/// Credentials and user-data secrets for `namespace`.
pub fn secrets(namespace: &str) -> MemorySecrets {
    let secrets = MemorySecrets::new();
    let credentials = format!(
        r#"{{"api_key": "{}", "project_id": "{}"}}"#,
        API_KEY, PROJECT_ID
    );
    secrets.insert(
        namespace,
        CREDENTIALS_SECRET,
        [(CREDENTIALS_SECRET_KEY, credentials)],
    );
    secrets.insert(namespace, USER_DATA_SECRET, [(USER_DATA_SECRET_KEY, USER_DATA)]);
    secrets
}

/// A device service call as seen by [`FakeDeviceService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    List(Option<String>),
    Get(String),
    Create(String),
    Update(String),
    Delete { id: String, force: bool },
    PowerOn(String),
    PowerOff(String),
    Reboot(String),
    Lock(String),
    Unlock(String),
    ListBgpSessions(String),
    ListBgpNeighbors(String),
    ListEvents(String),
}

impl Call {
    pub fn method(&self) -> &'static str {
        match self {
            Call::List(_) => "list",
            Call::Get(_) => "get",
            Call::Create(_) => "create",
            Call::Update(_) => "update",
            Call::Delete { .. } => "delete",
            Call::PowerOn(_) => "power_on",
            Call::PowerOff(_) => "power_off",
            Call::Reboot(_) => "reboot",
            Call::Lock(_) => "lock",
            Call::Unlock(_) => "unlock",
            Call::ListBgpSessions(_) => "list_bgp_sessions",
            Call::ListBgpNeighbors(_) => "list_bgp_neighbors",
            Call::ListEvents(_) => "list_events",
        }
    }

    /// Calls that change provider state.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Call::Create(_)
                | Call::Update(_)
                | Call::Delete { .. }
                | Call::PowerOn(_)
                | Call::PowerOff(_)
                | Call::Reboot(_)
                | Call::Lock(_)
                | Call::Unlock(_)
        )
    }
}

#[derive(Default)]
struct FakeState {
    devices: BTreeMap<String, Device>,
    events: HashMap<String, Vec<DeviceEvent>>,
    calls: Vec<Call>,
    bindings: Vec<(String, String)>,
    failures: HashMap<&'static str, String>,
    blocked: HashSet<&'static str>,
    created: u32,
}

/// In-memory device service that records every call.
///
/// Deleting a device removes it right away; a locked device refuses
/// deletion. Methods can be made to fail with [`fail`](Self::fail) or to
/// never complete with [`block`](Self::block).
#[derive(Default)]
pub struct FakeDeviceService {
    state: Mutex<FakeState>,
}

fn ok<T>(value: T) -> DeviceResult<T> {
    Ok(ApiResponse::new(
        value,
        ResponseMeta {
            status: 200,
            request_id: Some(uuid::Uuid::new_v4().to_string()),
            rate_limit_remaining: None,
        },
    ))
}

fn not_found(id: &str) -> DeviceServiceError {
    DeviceServiceError::NotFound(format!("device {}", id))
}

impl FakeDeviceService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Factory that binds every scope to this service.
    pub fn factory(self: &Arc<Self>) -> Arc<dyn DeviceServiceFactory> {
        let fake = Arc::clone(self);
        Arc::new(move |project_id: &str, api_key: &str| -> Arc<dyn DeviceService> {
            fake.lock_state()
                .bindings
                .push((project_id.to_string(), api_key.to_string()));
            Arc::clone(&fake) as Arc<dyn DeviceService>
        })
    }

    /// `(project, api key)` pairs the factory was asked for.
    pub fn bindings(&self) -> Vec<(String, String)> {
        self.lock_state().bindings.clone()
    }

    pub fn insert(&self, device: Device) {
        self.lock_state().devices.insert(device.id.clone(), device);
    }

    pub fn device(&self, id: &str) -> Option<Device> {
        self.lock_state().devices.get(id).cloned()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.lock_state().devices.values().cloned().collect()
    }

    pub fn set_state(&self, id: &str, state: &str) {
        if let Some(device) = self.lock_state().devices.get_mut(id) {
            device.state = state.to_string();
        }
    }

    /// Record a provider event; the latest event is listed first.
    pub fn add_event(&self, device_id: &str, body: &str) {
        let event = DeviceEvent {
            id: uuid::Uuid::new_v4().to_string(),
            state: "failed".to_string(),
            event_type: "provisioning.failed".to_string(),
            body: body.to_string(),
            created_at: Some(Utc::now()),
        };
        self.lock_state()
            .events
            .entry(device_id.to_string())
            .or_default()
            .insert(0, event);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock_state().calls.clone()
    }

    pub fn mutating_calls(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutating).collect()
    }

    pub fn clear_calls(&self) {
        self.lock_state().calls.clear();
    }

    /// Make `method` fail with a 500 carrying `message`.
    pub fn fail(&self, method: &'static str, message: &str) {
        self.lock_state()
            .failures
            .insert(method, message.to_string());
    }

    /// Make `method` never complete.
    pub fn block(&self, method: &'static str) {
        self.lock_state().blocked.insert(method);
    }

    /// Record `call` and apply any injected failure. The state lock is
    /// released before a blocked call parks.
    async fn enter(&self, call: Call) -> Result<(), DeviceServiceError> {
        let method = call.method();
        let (failure, blocked) = {
            let mut state = self.lock_state();
            state.calls.push(call);
            (
                state.failures.get(method).cloned(),
                state.blocked.contains(method),
            )
        };
        if blocked {
            std::future::pending::<()>().await;
        }
        match failure {
            Some(message) => Err(DeviceServiceError::Api {
                status: 500,
                message,
            }),
            None => Ok(()),
        }
    }

    fn with_device<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Device) -> T,
    ) -> Result<T, DeviceServiceError> {
        let mut state = self.lock_state();
        let device = state.devices.get_mut(id).ok_or_else(|| not_found(id))?;
        Ok(f(device))
    }
}

fn matches_options(device: &Device, opts: &ListOptions) -> bool {
    let search = opts.search.as_deref().map_or(true, |term| {
        device.hostname.contains(term) || device.tags.iter().any(|t| t.contains(term))
    });
    let tag = opts.tag.as_deref().map_or(true, |tag| device.has_tag(tag));
    search && tag
}

#[async_trait]
impl DeviceService for FakeDeviceService {
    async fn list(&self, opts: &ListOptions) -> DeviceResult<Vec<Device>> {
        self.enter(Call::List(opts.search.clone())).await?;
        let devices = self
            .lock_state()
            .devices
            .values()
            .filter(|d| matches_options(d, opts))
            .cloned()
            .collect();
        ok(devices)
    }

    async fn get(&self, device_id: &str) -> DeviceResult<Device> {
        self.enter(Call::Get(device_id.to_string())).await?;
        ok(self.with_device(device_id, |d| d.clone())?)
    }

    async fn create(&self, request: &DeviceCreateRequest) -> DeviceResult<Device> {
        self.enter(Call::Create(request.hostname.clone())).await?;
        let mut state = self.lock_state();
        state.created += 1;
        let n = state.created;
        let device = Device {
            id: uuid::Uuid::new_v4().to_string(),
            hostname: request.hostname.clone(),
            state: STATE_PROVISIONING.to_string(),
            locked: request.locked,
            tags: request.tags.clone(),
            plan: Some(Plan {
                slug: request.plan.clone(),
            }),
            facility: request.facility.first().map(|code| Facility { code: code.clone() }),
            ip_addresses: vec![
                IpAddressAssignment {
                    address: format!("147.75.100.{}", n),
                    public: true,
                    address_family: 4,
                },
                IpAddressAssignment {
                    address: format!("10.0.0.{}", n),
                    public: false,
                    address_family: 4,
                },
            ],
            created_at: Some(Utc::now()),
        };
        state.devices.insert(device.id.clone(), device.clone());
        ok(device)
    }

    async fn update(&self, device_id: &str, request: &DeviceUpdateRequest) -> DeviceResult<Device> {
        self.enter(Call::Update(device_id.to_string())).await?;
        let device = self.with_device(device_id, |d| {
            if let Some(hostname) = &request.hostname {
                d.hostname = hostname.clone();
            }
            if let Some(tags) = &request.tags {
                d.tags = tags.clone();
            }
            if let Some(locked) = request.locked {
                d.locked = locked;
            }
            d.clone()
        })?;
        ok(device)
    }

    async fn delete(&self, device_id: &str, force: bool) -> DeviceResult<()> {
        self.enter(Call::Delete {
            id: device_id.to_string(),
            force,
        })
        .await?;
        let mut state = self.lock_state();
        match state.devices.get(device_id) {
            None => Err(not_found(device_id)),
            Some(device) if device.locked => Err(DeviceServiceError::Api {
                status: 422,
                message: "Cannot delete a locked device".to_string(),
            }),
            Some(_) => {
                state.devices.remove(device_id);
                ok(())
            }
        }
    }

    async fn power_on(&self, device_id: &str) -> DeviceResult<()> {
        self.enter(Call::PowerOn(device_id.to_string())).await?;
        ok(self.with_device(device_id, |d| d.state = STATE_ACTIVE.to_string())?)
    }

    async fn power_off(&self, device_id: &str) -> DeviceResult<()> {
        self.enter(Call::PowerOff(device_id.to_string())).await?;
        ok(self.with_device(device_id, |d| d.state = STATE_INACTIVE.to_string())?)
    }

    async fn reboot(&self, device_id: &str) -> DeviceResult<()> {
        self.enter(Call::Reboot(device_id.to_string())).await?;
        ok(self.with_device(device_id, |_| ())?)
    }

    async fn lock(&self, device_id: &str) -> DeviceResult<()> {
        self.enter(Call::Lock(device_id.to_string())).await?;
        ok(self.with_device(device_id, |d| d.locked = true)?)
    }

    async fn unlock(&self, device_id: &str) -> DeviceResult<()> {
        self.enter(Call::Unlock(device_id.to_string())).await?;
        ok(self.with_device(device_id, |d| d.locked = false)?)
    }

    async fn list_bgp_sessions(
        &self,
        device_id: &str,
        _opts: &ListOptions,
    ) -> DeviceResult<Vec<BgpSession>> {
        self.enter(Call::ListBgpSessions(device_id.to_string()))
            .await?;
        self.with_device(device_id, |_| ())?;
        ok(Vec::new())
    }

    async fn list_bgp_neighbors(
        &self,
        device_id: &str,
        _opts: &ListOptions,
    ) -> DeviceResult<Vec<BgpNeighbor>> {
        self.enter(Call::ListBgpNeighbors(device_id.to_string()))
            .await?;
        self.with_device(device_id, |_| ())?;
        ok(Vec::new())
    }

    async fn list_events(
        &self,
        device_id: &str,
        opts: &ListOptions,
    ) -> DeviceResult<Vec<DeviceEvent>> {
        self.enter(Call::ListEvents(device_id.to_string())).await?;
        let mut events = self
            .lock_state()
            .events
            .get(device_id)
            .cloned()
            .unwrap_or_default();
        if let Some(per_page) = opts.per_page {
            events.truncate(per_page as usize);
        }
        ok(events)
    }
}
