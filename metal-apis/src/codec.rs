//! Conversion between the opaque provider blobs on a Machine and the typed
//! provider spec/status records.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::provider::{ProviderSpec, ProviderStatus};

const PROVIDER_SPEC: &str = "providerSpec";
const PROVIDER_STATUS: &str = "providerStatus";

/// Opaque JSON document embedded in a Machine.
///
/// Holds the raw bytes as received. It serializes as the embedded JSON value,
/// so a Machine document carries its provider blobs inline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawExtension {
    pub raw: Vec<u8>,
}

impl RawExtension {
    pub fn new(raw: impl Into<Vec<u8>>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

impl Serialize for RawExtension {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value: serde_json::Value =
            serde_json::from_slice(&self.raw).map_err(serde::ser::Error::custom)?;
        value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RawExtension {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        serde_json::to_vec(&value)
            .map(RawExtension::new)
            .map_err(serde::de::Error::custom)
    }
}

/// A provider blob could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The blob is missing or zero-length.
    #[error("{field} is empty")]
    Empty { field: &'static str },

    /// The blob is not a valid encoding of the target record.
    #[error("error unmarshalling {field}: {source}")]
    Malformed {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// Name of the blob that failed to decode.
    pub fn field(&self) -> &'static str {
        match self {
            DecodeError::Empty { field } | DecodeError::Malformed { field, .. } => field,
        }
    }
}

/// A provider record could not be encoded.
#[derive(Debug, Error)]
#[error("error marshalling {field}: {source}")]
pub struct EncodeError {
    pub field: &'static str,
    #[source]
    pub source: serde_json::Error,
}

fn decode<T: DeserializeOwned>(
    field: &'static str,
    raw: Option<&RawExtension>,
) -> Result<T, DecodeError> {
    let raw = match raw {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Err(DecodeError::Empty { field }),
    };
    serde_json::from_slice(raw.as_bytes()).map_err(|source| DecodeError::Malformed { field, source })
}

fn encode<T: Serialize>(field: &'static str, value: &T) -> Result<RawExtension, EncodeError> {
    serde_json::to_vec(value)
        .map(RawExtension::new)
        .map_err(|source| EncodeError { field, source })
}

/// Decode `spec.providerSpec`.
pub fn decode_spec(raw: Option<&RawExtension>) -> Result<ProviderSpec, DecodeError> {
    decode(PROVIDER_SPEC, raw)
}

/// Encode a provider spec into its canonical blob.
pub fn encode_spec(spec: &ProviderSpec) -> Result<RawExtension, EncodeError> {
    encode(PROVIDER_SPEC, spec)
}

/// Decode `status.providerStatus`.
pub fn decode_status(raw: Option<&RawExtension>) -> Result<ProviderStatus, DecodeError> {
    decode(PROVIDER_STATUS, raw)
}

/// Encode a provider status into its canonical blob.
pub fn encode_status(status: &ProviderStatus) -> Result<RawExtension, EncodeError> {
    encode(PROVIDER_STATUS, status)
}
