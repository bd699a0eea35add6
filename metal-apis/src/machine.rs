//! Machine resource as seen by the actuator.
//!
//! The orchestration runtime owns these objects. The actuator reads the spec
//! and labels and writes back the provider status, provider ID, instance
//! state annotation and addresses.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec::RawExtension;

/// Label carrying the ID of the cluster a Machine belongs to.
pub const CLUSTER_ID_LABEL: &str = "machine.openshift.io/cluster-api-cluster";

/// Annotation mirroring the provider's instance state.
pub const INSTANCE_STATE_ANNOTATION: &str = "machine.openshift.io/instance-state";

/// Scheme prefix of `spec.providerID`.
pub const PROVIDER_ID_PREFIX: &str = "equinixmetal://";

/// Object metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// Desired state of a Machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSpec {
    #[serde(
        rename = "providerSpec",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub provider_spec: Option<RawExtension>,
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

/// Kind of a machine address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AddressType {
    Hostname,
    #[serde(rename = "ExternalIP")]
    ExternalIp,
    #[serde(rename = "InternalIP")]
    InternalIp,
}

/// Address reported for a Machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineAddress {
    #[serde(rename = "type")]
    pub address_type: AddressType,
    pub address: String,
}

/// Observed state of a Machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<RawExtension>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,
}

/// A Machine resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: MachineSpec,
    #[serde(default)]
    pub status: MachineStatus,
}

impl Machine {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// Value of the cluster-ID label, if present.
    pub fn cluster_id(&self) -> Option<&str> {
        self.metadata.labels.get(CLUSTER_ID_LABEL).map(String::as_str)
    }
}
