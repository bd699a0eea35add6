//! Device lifecycle reconciler.
//!
//! Compares the Machine's desired state (provider spec) with the device the
//! provider reports and issues the calls that converge them. Results are
//! recorded on the scope; nothing is written back here.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use metal_apis::{AddressType, MachineAddress, CLUSTER_ID_LABEL};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ActuatorConfig;
use crate::device::{
    Device, DeviceCreateRequest, DeviceResult, DeviceService, DeviceServiceError,
    DeviceUpdateRequest, ListOptions, STATE_PROVISIONING, STATE_QUEUED,
};
use crate::error::{ReconcileError, ValidationError};
use crate::scope::MachineScope;

/// Prefix of the tag that ties a device to its cluster.
pub const CLUSTER_TAG_PREFIX: &str = "machine-api:cluster-id:";

/// Actuator operation, as named in events and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
    Exists,
}

impl Operation {
    /// Lowercase verb used in remote failure messages.
    pub fn verb(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Exists => "look up",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => f.write_str("Create"),
            Operation::Update => f.write_str("Update"),
            Operation::Delete => f.write_str("Delete"),
            Operation::Exists => f.write_str("Exists"),
        }
    }
}

/// Operations that write results back to the Machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mutation {
    Create,
    Update,
    Delete,
}

impl From<Mutation> for Operation {
    fn from(mutation: Mutation) -> Self {
        match mutation {
            Mutation::Create => Operation::Create,
            Mutation::Update => Operation::Update,
            Mutation::Delete => Operation::Delete,
        }
    }
}

/// What the provider reports for a Machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    /// No instance recorded and no matching device.
    Unprovisioned,
    Provisioning(Device),
    Provisioned(Device),
    Deleting(Device),
    /// The recorded instance is gone.
    Absent,
}

impl Observed {
    fn of(device: Device) -> Self {
        match device.state.as_str() {
            STATE_QUEUED | STATE_PROVISIONING => Observed::Provisioning(device),
            _ if device.is_deprovisioning() => Observed::Deleting(device),
            _ => Observed::Provisioned(device),
        }
    }
}

pub fn cluster_tag(cluster_id: &str) -> String {
    format!("{}{}", CLUSTER_TAG_PREFIX, cluster_id)
}

/// Addresses reported on the Machine for `device`.
pub fn machine_addresses(device: &Device) -> Vec<MachineAddress> {
    let mut addresses: Vec<MachineAddress> = device
        .ip_addresses
        .iter()
        .map(|ip| MachineAddress {
            address_type: if ip.public {
                AddressType::ExternalIp
            } else {
                AddressType::InternalIp
            },
            address: ip.address.clone(),
        })
        .collect();
    if !device.hostname.is_empty() {
        addresses.push(MachineAddress {
            address_type: AddressType::Hostname,
            address: device.hostname.clone(),
        });
    }
    addresses
}

/// Run `call` unless `cancel` fires first.
async fn guarded<T, F>(
    cancel: &CancellationToken,
    call: &'static str,
    fut: F,
) -> Result<T, DeviceServiceError>
where
    F: Future<Output = DeviceResult<T>>,
{
    if cancel.is_cancelled() {
        return Err(DeviceServiceError::Cancelled);
    }
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(DeviceServiceError::Cancelled),
        result = fut => result?,
    };
    debug!(
        call,
        status = response.meta.status,
        request_id = ?response.meta.request_id,
        "Device service call completed"
    );
    Ok(response.value)
}

pub struct Reconciler<'s, 'a> {
    scope: &'s mut MachineScope<'a>,
    config: &'s ActuatorConfig,
    devices: Arc<dyn DeviceService>,
    cancel: CancellationToken,
}

impl<'s, 'a> Reconciler<'s, 'a> {
    pub fn new(scope: &'s mut MachineScope<'a>, config: &'s ActuatorConfig) -> Self {
        let devices = scope.device_service();
        let cancel = scope.cancellation().clone();
        Self {
            scope,
            config,
            devices,
            cancel,
        }
    }

    pub async fn apply(&mut self, mutation: Mutation) -> Result<(), ReconcileError> {
        match mutation {
            Mutation::Create => self.create().await,
            Mutation::Update => self.update().await,
            Mutation::Delete => self.delete().await,
        }
    }

    /// Provision a device for the Machine, adopting one that already exists.
    /// The recorded instance is only replaced once a device is in hand.
    pub async fn create(&mut self) -> Result<(), ReconcileError> {
        self.validate()?;
        info!("Creating machine {}", self.scope.name());

        let op = Operation::Create;
        let found = match self.recorded_device(op).await? {
            Some(device) if !device.is_deprovisioning() => Some(device),
            _ => self
                .find_by_hostname(op)
                .await?
                .filter(|d| !d.is_deprovisioning()),
        };
        if let Some(device) = found {
            info!(
                "Machine {} already has device {} ({})",
                self.scope.name(),
                device.id,
                device.state
            );
            self.observe(&device);
            return Ok(());
        }

        let request = self.create_request();
        let device = guarded(&self.cancel, "create", self.devices.create(&request))
            .await
            .map_err(|e| ReconcileError::remote(op, e))?;
        info!(
            "Created device {} for machine {}",
            device.id,
            self.scope.name()
        );
        self.observe(&device);
        Ok(())
    }

    /// Converge tags, lock and power of the Machine's device.
    pub async fn update(&mut self) -> Result<(), ReconcileError> {
        self.validate()?;
        let op = Operation::Update;

        let Some(id) = self.scope.instance_id().map(str::to_string) else {
            info!(
                "Machine {} has no instance yet, creating",
                self.scope.name()
            );
            return self.create().await;
        };

        let device = match self.get(op, &id).await? {
            Some(device) => device,
            None => {
                warn!(
                    "Device {} of machine {} is gone, creating a new one",
                    id,
                    self.scope.name()
                );
                return self.create().await;
            }
        };

        if device.is_failed() {
            self.observe(&device);
            return Err(self.failure(&device).await);
        }

        let mut mutated = false;

        let desired = self.desired_tags();
        if desired.iter().any(|tag| !device.has_tag(tag)) {
            let tags: BTreeSet<String> = device.tags.iter().cloned().chain(desired).collect();
            let request = DeviceUpdateRequest {
                tags: Some(tags.into_iter().collect()),
                ..Default::default()
            };
            debug!("Updating tags of device {}", id);
            guarded(&self.cancel, "update", self.devices.update(&id, &request))
                .await
                .map_err(|e| ReconcileError::remote(op, e))?;
            mutated = true;
        }

        if let Some(locked) = self.scope.provider_spec().locked {
            if locked != device.locked {
                debug!("Setting lock of device {} to {}", id, locked);
                let result = if locked {
                    guarded(&self.cancel, "lock", self.devices.lock(&id)).await
                } else {
                    guarded(&self.cancel, "unlock", self.devices.unlock(&id)).await
                };
                result.map_err(|e| ReconcileError::remote(op, e))?;
                mutated = true;
            }
        }

        if device.is_powered_off() {
            info!("Powering on device {}", id);
            guarded(&self.cancel, "power_on", self.devices.power_on(&id))
                .await
                .map_err(|e| ReconcileError::remote(op, e))?;
            mutated = true;
        }

        let device = if mutated {
            match self.get(op, &id).await? {
                Some(device) => device,
                None => {
                    return Err(ReconcileError::remote(
                        op,
                        DeviceServiceError::NotFound(format!("device {}", id)),
                    ))
                }
            }
        } else {
            device
        };

        self.observe(&device);
        Ok(())
    }

    /// Deprovision the Machine's device.
    ///
    /// Returns `Ok` once the provider accepted the delete or the device is
    /// gone. A device still deprovisioning from an earlier call, and any
    /// remote failure, yield [`ReconcileError::RequeueAfter`].
    pub async fn delete(&mut self) -> Result<(), ReconcileError> {
        info!("Deleting machine {}", self.scope.name());

        let observed = match self.observe_device(Operation::Delete).await {
            Ok(observed) => observed,
            Err(ReconcileError::Cancelled) => return Err(ReconcileError::Cancelled),
            Err(e) => {
                warn!(
                    "Failed to look up device of machine {}: {}",
                    self.scope.name(),
                    e
                );
                return Err(self.requeue());
            }
        };

        let device = match observed {
            Observed::Unprovisioned | Observed::Absent => {
                info!("Machine {} has no device left", self.scope.name());
                self.scope.clear_instance();
                return Ok(());
            }
            Observed::Deleting(device) => {
                debug!("Device {} is already deprovisioning", device.id);
                self.observe(&device);
                return Err(self.requeue());
            }
            Observed::Provisioning(device) | Observed::Provisioned(device) => device,
        };

        if device.locked {
            info!("Unlocking device {} before deletion", device.id);
            if let Err(e) = guarded(&self.cancel, "unlock", self.devices.unlock(&device.id)).await {
                return Err(self.delete_failed(&device.id, e));
            }
        }

        let force = self.config.force_delete;
        match guarded(&self.cancel, "delete", self.devices.delete(&device.id, force)).await {
            Ok(()) => {
                info!("Delete of device {} accepted", device.id);
                self.scope.clear_instance();
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!("Device {} is already gone", device.id);
                self.scope.clear_instance();
                Ok(())
            }
            Err(e) => Err(self.delete_failed(&device.id, e)),
        }
    }

    /// Whether the Machine's device exists on the provider.
    pub async fn exists(&mut self) -> Result<bool, ReconcileError> {
        let observed = self.observe_device(Operation::Exists).await?;
        let exists = !matches!(observed, Observed::Unprovisioned | Observed::Absent);
        debug!("Machine {} exists: {}", self.scope.name(), exists);
        Ok(exists)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.scope.cluster_id().map_or(true, str::is_empty) {
            return Err(ValidationError::MissingLabel(CLUSTER_ID_LABEL));
        }
        Ok(())
    }

    /// Look up the device by recorded ID, else by hostname.
    pub async fn observe_device(&self, op: Operation) -> Result<Observed, ReconcileError> {
        if let Some(id) = self.scope.instance_id() {
            let id = id.to_string();
            return Ok(match self.get(op, &id).await? {
                Some(device) => Observed::of(device),
                None => Observed::Absent,
            });
        }
        Ok(match self.find_by_hostname(op).await? {
            Some(device) => Observed::of(device),
            None => Observed::Unprovisioned,
        })
    }

    /// Get a device, mapping not-found to `None`.
    async fn get(&self, op: Operation, id: &str) -> Result<Option<Device>, ReconcileError> {
        match guarded(&self.cancel, "get", self.devices.get(id)).await {
            Ok(device) => Ok(Some(device)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(ReconcileError::remote(op, e)),
        }
    }

    async fn recorded_device(&self, op: Operation) -> Result<Option<Device>, ReconcileError> {
        match self.scope.instance_id() {
            Some(id) => {
                let id = id.to_string();
                self.get(op, &id).await
            }
            None => Ok(None),
        }
    }

    /// Find a device named after the Machine. With a cluster ID, the device
    /// must also carry the cluster tag.
    async fn find_by_hostname(&self, op: Operation) -> Result<Option<Device>, ReconcileError> {
        let hostname = self.scope.name().to_string();
        let tag = self
            .scope
            .cluster_id()
            .filter(|id| !id.is_empty())
            .map(cluster_tag);
        let opts = ListOptions::search(hostname.as_str());
        let devices = guarded(&self.cancel, "list", self.devices.list(&opts))
            .await
            .map_err(|e| ReconcileError::remote(op, e))?;
        Ok(devices.into_iter().find(|d| {
            d.hostname == hostname && tag.as_deref().map_or(true, |tag| d.has_tag(tag))
        }))
    }

    /// Spec tags plus the cluster tag.
    fn desired_tags(&self) -> Vec<String> {
        let mut tags = self.scope.provider_spec().tags.clone();
        if let Some(id) = self.scope.cluster_id().filter(|id| !id.is_empty()) {
            tags.push(cluster_tag(id));
        }
        tags
    }

    fn create_request(&self) -> DeviceCreateRequest {
        let spec = self.scope.provider_spec();
        let mut tags = Vec::new();
        for tag in self.desired_tags() {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        DeviceCreateRequest {
            hostname: self.scope.name().to_string(),
            plan: spec.machine_type.clone(),
            facility: if spec.facility.is_empty() {
                Vec::new()
            } else {
                vec![spec.facility.clone()]
            },
            operating_system: spec.operating_system.clone(),
            billing_cycle: spec.billing_cycle.clone(),
            userdata: self.scope.user_data().map(str::to_string),
            tags,
            locked: spec.locked.unwrap_or(false),
        }
    }

    fn observe(&mut self, device: &Device) {
        self.scope.set_instance_id(device.id.clone());
        self.scope.set_instance_state(device.state.clone());
        self.scope.set_addresses(machine_addresses(device));
    }

    /// Error for a device the provider marked failed, with its latest event.
    async fn failure(&self, device: &Device) -> ReconcileError {
        let opts = ListOptions {
            per_page: Some(1),
            ..Default::default()
        };
        let reason = match guarded(
            &self.cancel,
            "list_events",
            self.devices.list_events(&device.id, &opts),
        )
        .await
        {
            Ok(events) => events
                .into_iter()
                .next()
                .map(|event| event.body)
                .unwrap_or_else(|| "no provider events".to_string()),
            Err(DeviceServiceError::Cancelled) => return ReconcileError::Cancelled,
            Err(e) => format!("failed to list events: {}", e),
        };
        ReconcileError::DeviceFailed {
            id: device.id.clone(),
            reason,
        }
    }

    fn requeue(&self) -> ReconcileError {
        ReconcileError::RequeueAfter {
            operation: Operation::Delete,
            after: self.config.delete_requeue_after,
        }
    }

    fn delete_failed(&self, id: &str, err: DeviceServiceError) -> ReconcileError {
        if err.is_cancelled() {
            return ReconcileError::Cancelled;
        }
        warn!("Failed to delete device {}: {}", id, err);
        self.requeue()
    }
}
