//! Actuator settings.

use std::time::Duration;

/// Requeue delay after a delete that has not finished yet.
pub const DEFAULT_DELETE_REQUEUE_AFTER: Duration = Duration::from_secs(20);

/// Component name events are recorded under.
pub const DEFAULT_EVENT_COMPONENT: &str = "equinixmetalcontroller";

#[derive(Debug, Clone)]
pub struct ActuatorConfig {
    pub delete_requeue_after: Duration,
    /// Passed as `force_delete` on device deletion.
    pub force_delete: bool,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            delete_requeue_after: DEFAULT_DELETE_REQUEUE_AFTER,
            force_delete: false,
        }
    }
}
