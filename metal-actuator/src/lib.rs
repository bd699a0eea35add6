//! Machine actuator for Equinix Metal.
//!
//! Reconciles declarative Machine resources with bare-metal devices: the
//! runtime calls [`Actuator`] to create, update, delete or look up the
//! device behind a Machine.

pub mod actuator;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod reconciler;
pub mod scope;
pub mod secrets;
pub mod store;
pub mod test_util;

pub use actuator::{Actuator, ActuatorParams};
pub use config::ActuatorConfig;
pub use error::{ActuatorError, Retry};
pub use reconciler::{Mutation, Operation};
