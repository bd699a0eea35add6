//! Machine actuator: the entry point the orchestration runtime calls.
//!
//! Each call builds a scope, runs the reconciler, persists the scope and
//! records exactly one event describing the outcome.

use std::sync::Arc;

use metal_apis::Machine;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ActuatorConfig;
use crate::device::DeviceServiceFactory;
use crate::error::{ActuatorError, ScopeError};
use crate::events::{EventRecorder, EventType, ObjectReference};
use crate::reconciler::{Mutation, Operation, Reconciler};
use crate::scope::{MachineScope, MachineScopeParams};
use crate::secrets::SecretReader;
use crate::store::MachineClient;

/// Collaborators of an [`Actuator`].
pub struct ActuatorParams {
    pub machine_client: Arc<dyn MachineClient>,
    pub secrets: Arc<dyn SecretReader>,
    pub event_recorder: Arc<dyn EventRecorder>,
    pub device_services: Arc<dyn DeviceServiceFactory>,
    pub config: ActuatorConfig,
}

pub struct Actuator {
    machine_client: Arc<dyn MachineClient>,
    secrets: Arc<dyn SecretReader>,
    event_recorder: Arc<dyn EventRecorder>,
    device_services: Arc<dyn DeviceServiceFactory>,
    config: ActuatorConfig,
}

fn success_message(mutation: Mutation, name: &str) -> String {
    match mutation {
        Mutation::Create => format!("Created Machine {}", name),
        Mutation::Update => format!("Updated Machine {}", name),
        Mutation::Delete => format!("Deleted machine {}", name),
    }
}

impl Actuator {
    pub fn new(params: ActuatorParams) -> Self {
        Self {
            machine_client: params.machine_client,
            secrets: params.secrets,
            event_recorder: params.event_recorder,
            device_services: params.device_services,
            config: params.config,
        }
    }

    /// Provision a device for `machine`.
    pub async fn create(
        &self,
        cancel: &CancellationToken,
        machine: &mut Machine,
    ) -> Result<(), ActuatorError> {
        self.mutate(Mutation::Create, cancel, machine).await
    }

    /// Converge the device of `machine` with its spec.
    pub async fn update(
        &self,
        cancel: &CancellationToken,
        machine: &mut Machine,
    ) -> Result<(), ActuatorError> {
        self.mutate(Mutation::Update, cancel, machine).await
    }

    /// Deprovision the device of `machine`.
    pub async fn delete(
        &self,
        cancel: &CancellationToken,
        machine: &mut Machine,
    ) -> Result<(), ActuatorError> {
        self.mutate(Mutation::Delete, cancel, machine).await
    }

    /// Whether `machine` has a device. Nothing is written back.
    pub async fn exists(
        &self,
        cancel: &CancellationToken,
        machine: &Machine,
    ) -> Result<bool, ActuatorError> {
        let op = Operation::Exists;
        let object = ObjectReference::from(machine);
        let mut machine = machine.clone();

        let mut scope = match self.scope(cancel, &mut machine).await {
            Ok(scope) => scope,
            Err(err) => return Err(self.scope_failed(&object, op, err)),
        };
        match Reconciler::new(&mut scope, &self.config).exists().await {
            Ok(exists) => Ok(exists),
            Err(err) => Err(self.failed(&object, op, err.into())),
        }
    }

    async fn scope<'a>(
        &'a self,
        cancel: &CancellationToken,
        machine: &'a mut Machine,
    ) -> Result<MachineScope<'a>, ScopeError> {
        MachineScope::new(MachineScopeParams {
            machine,
            secrets: self.secrets.as_ref(),
            machine_client: self.machine_client.as_ref(),
            device_services: self.device_services.as_ref(),
            cancel: cancel.clone(),
        })
        .await
    }

    async fn mutate(
        &self,
        mutation: Mutation,
        cancel: &CancellationToken,
        machine: &mut Machine,
    ) -> Result<(), ActuatorError> {
        let op = Operation::from(mutation);
        let object = ObjectReference::from(&*machine);
        info!("{}/{}: {} machine", object.namespace, object.name, op.verb());

        let mut scope = match self.scope(cancel, machine).await {
            Ok(scope) => scope,
            Err(err) => return Err(self.scope_failed(&object, op, err)),
        };

        let reconciled = Reconciler::new(&mut scope, &self.config)
            .apply(mutation)
            .await;
        let persisted = scope.persist().await;

        match (reconciled, persisted) {
            (Err(err), persisted) => {
                if let Err(persist_err) = persisted {
                    error!(
                        "{}: failed to persist machine after failed {}: {}",
                        object.name, op, persist_err
                    );
                }
                Err(self.failed(&object, op, err.into()))
            }
            (Ok(()), Err(err)) => Err(self.failed(&object, op, err.into())),
            (Ok(()), Ok(())) => {
                self.event_recorder.event(
                    &object,
                    EventType::Normal,
                    &op.to_string(),
                    &success_message(mutation, &object.name),
                );
                Ok(())
            }
        }
    }

    fn scope_failed(
        &self,
        object: &ObjectReference,
        op: Operation,
        err: ScopeError,
    ) -> ActuatorError {
        self.event_recorder.event(
            object,
            EventType::Warning,
            &format!("Failed{}", op),
            &format!("{}: failed to create scope for machine: {}", object.name, err),
        );
        err.into()
    }

    fn failed(&self, object: &ObjectReference, op: Operation, err: ActuatorError) -> ActuatorError {
        self.event_recorder.event(
            object,
            EventType::Warning,
            &format!("Failed{}", op),
            &format!("{}: reconciler failed to {} machine: {}", object.name, op, err),
        );
        err
    }
}
