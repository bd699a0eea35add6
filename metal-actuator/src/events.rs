//! Operator-facing events about Machines.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use metal_apis::Machine;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Normal => f.write_str("Normal"),
            EventType::Warning => f.write_str("Warning"),
        }
    }
}

/// The object an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectReference {
    pub namespace: String,
    pub name: String,
}

impl From<&Machine> for ObjectReference {
    fn from(machine: &Machine) -> Self {
        Self {
            namespace: machine.namespace().to_string(),
            name: machine.name().to_string(),
        }
    }
}

/// A recorded event. Identical events are folded into one with a count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub involved_object: ObjectReference,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub count: u32,
    pub first_timestamp: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
}

/// Sink for Machine events.
pub trait EventRecorder: Send + Sync {
    fn event(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str);
}

/// Keeps events in memory.
#[derive(Default)]
pub struct MemoryEventRecorder {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Events recorded for one object, oldest first.
    pub fn events_for(&self, namespace: &str, name: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.involved_object.namespace == namespace && e.involved_object.name == name)
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl EventRecorder for MemoryEventRecorder {
    fn event(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str) {
        let now = Utc::now();
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(existing) = events.iter_mut().find(|e| {
            e.involved_object == *object
                && e.event_type == event_type
                && e.reason == reason
                && e.message == message
        }) {
            existing.count += 1;
            existing.last_timestamp = now;
            return;
        }

        events.push(Event {
            involved_object: object.clone(),
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
            count: 1,
            first_timestamp: now,
            last_timestamp: now,
        });
    }
}

/// Writes events to the log.
pub struct LogEventRecorder {
    component: String,
}

impl LogEventRecorder {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }
}

impl EventRecorder for LogEventRecorder {
    fn event(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str) {
        match event_type {
            EventType::Normal => info!(
                component = %self.component,
                object = %format!("{}/{}", object.namespace, object.name),
                reason,
                "{}",
                message
            ),
            EventType::Warning => warn!(
                component = %self.component,
                object = %format!("{}/{}", object.namespace, object.name),
                reason,
                "{}",
                message
            ),
        }
    }
}
