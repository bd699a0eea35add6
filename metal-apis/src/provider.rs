//! Equinix Metal provider spec and status.
//!
//! Field order is the encoded field order. Optional fields are omitted when
//! unset so that absent and empty stay distinguishable on the wire.

use serde::{Deserialize, Serialize};

/// Reference to a secret in the Machine's namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalObjectReference {
    #[serde(default)]
    pub name: String,
}

impl LocalObjectReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Provider configuration carried in `spec.providerSpec`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Secret holding the device user data under the `userData` key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_secret: Option<LocalObjectReference>,

    /// Plan slug, e.g. `c3.small.x86`.
    #[serde(default)]
    pub machine_type: String,

    /// Facility code, e.g. `ny5`.
    #[serde(default)]
    pub facility: String,

    /// Secret holding the API credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<LocalObjectReference>,

    /// Overrides the project carried in the credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operating_system: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_cycle: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Desired device lock. Unset leaves the lock alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
}

/// Provider state carried in `status.providerStatus`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_state: Option<String>,
}
