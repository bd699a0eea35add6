//! Machine scope: the context of one actuator call.
//!
//! A scope decodes the Machine's provider spec and status, resolves the
//! credentials and user data it references, and binds a device service.
//! Reconcilers mutate the provider status through the scope; `persist`
//! consumes the scope and writes the result back to the Machine once.

use std::fmt;
use std::sync::Arc;

use metal_apis::{
    decode_spec, decode_status, encode_status, Machine, MachineAddress, ProviderSpec,
    ProviderStatus, INSTANCE_STATE_ANNOTATION, PROVIDER_ID_PREFIX,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::device::{DeviceService, DeviceServiceFactory};
use crate::error::{PersistError, ScopeError};
use crate::secrets::SecretReader;
use crate::store::MachineClient;

/// Key of the API credentials in the credentials secret.
pub const CREDENTIALS_SECRET_KEY: &str = "EQUINIX_METAL_API_KEY";

/// Key of the user data in the user-data secret.
pub const USER_DATA_SECRET_KEY: &str = "userData";

/// API credentials resolved from the credentials secret.
///
/// The secret value is either a bare API key or a JSON object carrying
/// `api_key` and `project_id`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub project_id: Option<String>,
}

#[derive(Deserialize)]
struct CredentialsPayload {
    #[serde(default, alias = "apiKey")]
    api_key: Option<String>,
    #[serde(default, alias = "projectId")]
    project_id: Option<String>,
}

impl Credentials {
    pub fn parse(payload: &str) -> Self {
        let payload = payload.trim();
        match serde_json::from_str::<CredentialsPayload>(payload) {
            Ok(parsed) => Self {
                api_key: parsed
                    .api_key
                    .filter(|key| !key.is_empty())
                    .unwrap_or_else(|| payload.to_string()),
                project_id: parsed.project_id.filter(|id| !id.is_empty()),
            },
            Err(_) => Self {
                api_key: payload.to_string(),
                project_id: None,
            },
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("project_id", &self.project_id)
            .finish()
    }
}

/// Inputs of [`MachineScope::new`].
pub struct MachineScopeParams<'a> {
    pub machine: &'a mut Machine,
    pub secrets: &'a dyn SecretReader,
    pub machine_client: &'a dyn MachineClient,
    pub device_services: &'a dyn DeviceServiceFactory,
    pub cancel: CancellationToken,
}

/// Read one key of a secret as UTF-8 text.
async fn read_secret_key(
    secrets: &dyn SecretReader,
    namespace: &str,
    name: &str,
    key: &'static str,
) -> Result<String, ScopeError> {
    let mut data = secrets.get(namespace, name).await?;
    let value = data.remove(key).ok_or_else(|| ScopeError::SecretKeyMissing {
        namespace: namespace.to_string(),
        name: name.to_string(),
        key,
    })?;
    String::from_utf8(value).map_err(|_| ScopeError::SecretNotUtf8 {
        namespace: namespace.to_string(),
        name: name.to_string(),
        key,
    })
}

pub struct MachineScope<'a> {
    machine: &'a mut Machine,
    machine_client: &'a dyn MachineClient,
    provider_spec: ProviderSpec,
    provider_status: ProviderStatus,
    /// `None` leaves the Machine's addresses untouched.
    addresses: Option<Vec<MachineAddress>>,
    credentials: Credentials,
    project_id: String,
    user_data: Option<String>,
    device_service: Arc<dyn DeviceService>,
    cancel: CancellationToken,
}

impl<'a> MachineScope<'a> {
    pub async fn new(params: MachineScopeParams<'a>) -> Result<MachineScope<'a>, ScopeError> {
        let MachineScopeParams {
            machine,
            secrets,
            machine_client,
            device_services,
            cancel,
        } = params;

        let provider_spec =
            decode_spec(machine.spec.provider_spec.as_ref()).map_err(ScopeError::MachineConfig)?;

        let provider_status = match machine.status.provider_status.as_ref() {
            Some(raw) if !raw.is_empty() => {
                decode_status(Some(raw)).map_err(ScopeError::ProviderStatus)?
            }
            _ => ProviderStatus::default(),
        };

        let namespace = machine.namespace().to_string();

        let credentials_secret = provider_spec
            .credentials_secret
            .as_ref()
            .filter(|r| !r.name.is_empty())
            .ok_or(ScopeError::CredentialsSecretUnset)?;
        let payload = read_secret_key(
            secrets,
            &namespace,
            &credentials_secret.name,
            CREDENTIALS_SECRET_KEY,
        )
        .await?;
        let credentials = Credentials::parse(&payload);

        let user_data = match provider_spec
            .user_data_secret
            .as_ref()
            .filter(|r| !r.name.is_empty())
        {
            Some(secret) => Some(
                read_secret_key(secrets, &namespace, &secret.name, USER_DATA_SECRET_KEY).await?,
            ),
            None => None,
        };

        let project_id = provider_spec
            .project_id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| credentials.project_id.clone())
            .unwrap_or_default();

        let device_service = device_services.device_service(&project_id, &credentials.api_key);
        debug!(
            "Built scope for machine {}/{} (project {:?})",
            namespace,
            machine.name(),
            project_id
        );

        Ok(MachineScope {
            machine,
            machine_client,
            provider_spec,
            provider_status,
            addresses: None,
            credentials,
            project_id,
            user_data,
            device_service,
            cancel,
        })
    }

    pub fn name(&self) -> &str {
        self.machine.name()
    }

    pub fn namespace(&self) -> &str {
        self.machine.namespace()
    }

    pub fn cluster_id(&self) -> Option<&str> {
        self.machine.cluster_id()
    }

    pub fn provider_spec(&self) -> &ProviderSpec {
        &self.provider_spec
    }

    pub fn provider_status(&self) -> &ProviderStatus {
        &self.provider_status
    }

    /// Assigned instance ID. An empty ID counts as unassigned.
    pub fn instance_id(&self) -> Option<&str> {
        self.provider_status
            .instance_id
            .as_deref()
            .filter(|id| !id.is_empty())
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn user_data(&self) -> Option<&str> {
        self.user_data.as_deref()
    }

    pub fn device_service(&self) -> Arc<dyn DeviceService> {
        Arc::clone(&self.device_service)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn set_instance_id(&mut self, id: impl Into<String>) {
        self.provider_status.instance_id = Some(id.into());
    }

    pub fn set_instance_state(&mut self, state: impl Into<String>) {
        self.provider_status.instance_state = Some(state.into());
    }

    pub fn set_addresses(&mut self, addresses: Vec<MachineAddress>) {
        self.addresses = Some(addresses);
    }

    /// Forget the instance after it is gone from the provider.
    pub fn clear_instance(&mut self) {
        self.provider_status = ProviderStatus::default();
        self.addresses = Some(Vec::new());
    }

    /// Write the scope's changes back to the Machine and the runtime.
    pub async fn persist(self) -> Result<(), PersistError> {
        let mut updated = self.machine.clone();

        updated.status.provider_status = Some(encode_status(&self.provider_status)?);
        if let Some(addresses) = self.addresses {
            updated.status.addresses = addresses;
        }
        if let Some(id) = self
            .provider_status
            .instance_id
            .as_deref()
            .filter(|id| !id.is_empty())
        {
            updated.spec.provider_id = Some(format!("{}{}", PROVIDER_ID_PREFIX, id));
        }
        if let Some(state) = &self.provider_status.instance_state {
            updated
                .metadata
                .annotations
                .insert(INSTANCE_STATE_ANNOTATION.to_string(), state.clone());
        }

        if updated.metadata != self.machine.metadata || updated.spec != self.machine.spec {
            self.machine_client
                .patch_machine(self.machine, &updated)
                .await
                .map_err(PersistError::Patch)?;
        }
        if updated.status != self.machine.status {
            self.machine_client
                .patch_machine_status(&updated)
                .await
                .map_err(PersistError::PatchStatus)?;
        }

        debug!("Persisted machine {}/{}", updated.namespace(), updated.name());
        *self.machine = updated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::MemorySecrets;
    use crate::store::MemoryMachineClient;
    use crate::test_util::{self, FakeDeviceService};
    use metal_apis::{AddressType, RawExtension};

    struct Fixture {
        secrets: MemorySecrets,
        client: MemoryMachineClient,
        devices: Arc<FakeDeviceService>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                secrets: test_util::secrets(test_util::NAMESPACE),
                client: MemoryMachineClient::new(),
                devices: Arc::new(FakeDeviceService::new()),
            }
        }

        async fn scope<'a>(
            &'a self,
            factory: &'a dyn DeviceServiceFactory,
            machine: &'a mut Machine,
        ) -> Result<MachineScope<'a>, ScopeError> {
            MachineScope::new(MachineScopeParams {
                machine,
                secrets: &self.secrets,
                machine_client: &self.client,
                device_services: factory,
                cancel: CancellationToken::new(),
            })
            .await
        }
    }

    #[test]
    fn credentials_from_bare_key() {
        let creds = Credentials::parse("  secret-key\n");
        assert_eq!(creds.api_key, "secret-key");
        assert_eq!(creds.project_id, None);
    }

    #[test]
    fn credentials_from_json_payload() {
        let creds = Credentials::parse(r#"{"api_key": "k", "project_id": "p"}"#);
        assert_eq!(creds.api_key, "k");
        assert_eq!(creds.project_id.as_deref(), Some("p"));

        let payload = r#"{"project_id": "test"}"#;
        let creds = Credentials::parse(payload);
        assert_eq!(creds.api_key, payload);
        assert_eq!(creds.project_id.as_deref(), Some("test"));

        let debug = format!("{:?}", creds);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains(payload));
    }

    #[tokio::test]
    async fn builds_scope_from_secrets() {
        let fixture = Fixture::new();
        let factory = fixture.devices.factory();
        let mut machine = test_util::machine("worker-0");

        let scope = fixture.scope(factory.as_ref(), &mut machine).await.unwrap();
        assert_eq!(scope.name(), "worker-0");
        assert_eq!(scope.cluster_id(), Some(test_util::CLUSTER_ID));
        assert_eq!(scope.user_data(), Some(test_util::USER_DATA));
        assert_eq!(scope.project_id(), test_util::PROJECT_ID);
        assert_eq!(scope.instance_id(), None);
        assert_eq!(scope.credentials().api_key, test_util::API_KEY);

        assert_eq!(
            fixture.devices.bindings(),
            vec![(
                test_util::PROJECT_ID.to_string(),
                test_util::API_KEY.to_string()
            )]
        );
    }

    #[tokio::test]
    async fn spec_project_overrides_credentials() {
        let fixture = Fixture::new();
        let factory = fixture.devices.factory();
        let mut spec = test_util::provider_spec();
        spec.project_id = Some("other-project".to_string());
        let mut machine = test_util::machine_with_spec("worker-0", &spec);

        let scope = fixture.scope(factory.as_ref(), &mut machine).await.unwrap();
        assert_eq!(scope.project_id(), "other-project");
    }

    #[tokio::test]
    async fn malformed_spec_fails_before_secrets() {
        let fixture = Fixture::new();
        fixture
            .secrets
            .remove(test_util::NAMESPACE, test_util::CREDENTIALS_SECRET);
        let factory = fixture.devices.factory();
        let mut machine = test_util::machine("worker-0");
        machine.spec.provider_spec = Some(RawExtension::new(vec![b'1']));

        let err = fixture
            .scope(factory.as_ref(), &mut machine)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ScopeError::MachineConfig(_)));
        assert!(fixture.devices.bindings().is_empty());
    }

    #[tokio::test]
    async fn malformed_status_fails_scope() {
        let fixture = Fixture::new();
        let factory = fixture.devices.factory();
        let mut machine = test_util::machine("worker-0");
        machine.status.provider_status = Some(RawExtension::new(r#""RUNNING""#));

        let err = fixture
            .scope(factory.as_ref(), &mut machine)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ScopeError::ProviderStatus(_)));
    }

    #[tokio::test]
    async fn missing_credentials_secret() {
        let fixture = Fixture::new();
        fixture
            .secrets
            .remove(test_util::NAMESPACE, test_util::CREDENTIALS_SECRET);
        let factory = fixture.devices.factory();
        let mut machine = test_util::machine("worker-0");

        let err = fixture
            .scope(factory.as_ref(), &mut machine)
            .await
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            format!(
                "secret {}/{} not found",
                test_util::NAMESPACE,
                test_util::CREDENTIALS_SECRET
            )
        );
    }

    #[tokio::test]
    async fn missing_credentials_key() {
        let fixture = Fixture::new();
        fixture.secrets.insert(
            test_util::NAMESPACE,
            test_util::CREDENTIALS_SECRET,
            [("WRONG_KEY", "x")],
        );
        let factory = fixture.devices.factory();
        let mut machine = test_util::machine("worker-0");

        let err = fixture
            .scope(factory.as_ref(), &mut machine)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ScopeError::SecretKeyMissing {
                key: CREDENTIALS_SECRET_KEY,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn user_data_is_optional() {
        let fixture = Fixture::new();
        fixture
            .secrets
            .remove(test_util::NAMESPACE, test_util::USER_DATA_SECRET);
        let factory = fixture.devices.factory();
        let mut spec = test_util::provider_spec();
        spec.user_data_secret = None;
        let mut machine = test_util::machine_with_spec("worker-0", &spec);

        let scope = fixture.scope(factory.as_ref(), &mut machine).await.unwrap();
        assert_eq!(scope.user_data(), None);
    }

    #[tokio::test]
    async fn referenced_user_data_must_exist() {
        let fixture = Fixture::new();
        fixture
            .secrets
            .remove(test_util::NAMESPACE, test_util::USER_DATA_SECRET);
        let factory = fixture.devices.factory();
        let mut machine = test_util::machine("worker-0");

        let err = fixture
            .scope(factory.as_ref(), &mut machine)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ScopeError::SecretNotFound { .. }));
    }

    #[tokio::test]
    async fn persist_writes_status_back() {
        let fixture = Fixture::new();
        let factory = fixture.devices.factory();
        let mut machine = test_util::machine("worker-0");
        fixture.client.insert(machine.clone());

        let mut scope = fixture.scope(factory.as_ref(), &mut machine).await.unwrap();
        scope.set_instance_id("device-1");
        scope.set_instance_state("active");
        scope.set_addresses(vec![MachineAddress {
            address_type: AddressType::Hostname,
            address: "worker-0".to_string(),
        }]);
        scope.persist().await.unwrap();

        assert_eq!(
            machine.spec.provider_id.as_deref(),
            Some("equinixmetal://device-1")
        );
        assert_eq!(
            machine.metadata.annotations[INSTANCE_STATE_ANNOTATION],
            "active"
        );
        let status = decode_status(machine.status.provider_status.as_ref()).unwrap();
        assert_eq!(status.instance_id.as_deref(), Some("device-1"));

        let stored = fixture
            .client
            .get(test_util::NAMESPACE, "worker-0")
            .unwrap();
        assert_eq!(stored, machine);
    }

    #[tokio::test]
    async fn persist_failure_leaves_machine_untouched() {
        let fixture = Fixture::new();
        let factory = fixture.devices.factory();
        let mut machine = test_util::machine("worker-0");
        let before = machine.clone();

        let mut scope = fixture.scope(factory.as_ref(), &mut machine).await.unwrap();
        scope.set_instance_id("device-1");
        let err = scope.persist().await.unwrap_err();

        assert!(matches!(err, PersistError::Patch(_)));
        assert_eq!(machine, before);
    }
}
