//! metal-apis: resource types shared by the machine actuator.
//!
//! - `machine`: the Machine resource as delivered by the orchestration runtime
//! - `provider`: Equinix Metal provider spec and status carried on a Machine
//! - `codec`: conversion between the opaque provider blobs and typed records

pub mod codec;
pub mod machine;
pub mod provider;

pub use codec::{
    decode_spec, decode_status, encode_spec, encode_status, DecodeError, EncodeError, RawExtension,
};
pub use machine::{
    AddressType, Machine, MachineAddress, MachineSpec, MachineStatus, ObjectMeta,
    CLUSTER_ID_LABEL, INSTANCE_STATE_ANNOTATION, PROVIDER_ID_PREFIX,
};
pub use provider::{LocalObjectReference, ProviderSpec, ProviderStatus};
