//! Event bus for VIF events.
//!
//! Provides a publish/subscribe mechanism for interface lifecycle changes,
//! bridge setup/teardown, service health transitions and kill-switch actions.
//!
//! # Example
//!
//! ```ignore
//! let bus = EventBus::new();
//!
//! // Subscribe to bridge events
//! let mut rx = bus.subscribe(vec!["bridge.*".to_string()]);
//!
//! bus.publish(Event::new(EventType::BridgeSetupComplete, "inst-123", "Bridge ready"));
//!
//! while let Some(event) = rx.recv().await {
//!     println!("Received: {:?}", event);
//! }
//! ```

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::debug;

pub mod handlers;

/// Maximum number of events buffered in the broadcast channel.
const EVENT_BUFFER_SIZE: usize = 256;

/// Event types for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    // Interface events
    InterfaceCreated,
    InterfaceRemoved,
    InterfaceStatusChanged,

    // VLAN pool events
    VlanPoolWarning,

    // Bridge events
    BridgeSetupComplete,
    BridgeTeardownComplete,

    // Service events
    ServiceInstanceRemoved,
    ServiceHealthChanged,

    // Kill switch events
    KillSwitchEnabled,
    KillSwitchDisabled,
    KillSwitchActivated,
    KillSwitchDeactivated,
    KillSwitchReconciled,
}

impl EventType {
    /// Get the event type string (e.g., "bridge.setup.complete").
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::InterfaceCreated => "interface.created",
            EventType::InterfaceRemoved => "interface.removed",
            EventType::InterfaceStatusChanged => "interface.status_changed",
            EventType::VlanPoolWarning => "vlan.pool.warning",
            EventType::BridgeSetupComplete => "bridge.setup.complete",
            EventType::BridgeTeardownComplete => "bridge.teardown.complete",
            EventType::ServiceInstanceRemoved => "service.instance.removed",
            EventType::ServiceHealthChanged => "service.health.changed",
            EventType::KillSwitchEnabled => "killswitch.enabled",
            EventType::KillSwitchDisabled => "killswitch.disabled",
            EventType::KillSwitchActivated => "killswitch.activated",
            EventType::KillSwitchDeactivated => "killswitch.deactivated",
            EventType::KillSwitchReconciled => "killswitch.reconciled",
        }
    }

    /// Get the resource type (e.g., "interface", "bridge").
    pub fn resource_type(&self) -> &'static str {
        match self {
            EventType::InterfaceCreated
            | EventType::InterfaceRemoved
            | EventType::InterfaceStatusChanged => "interface",
            EventType::VlanPoolWarning => "vlan_pool",
            EventType::BridgeSetupComplete | EventType::BridgeTeardownComplete => "bridge",
            EventType::ServiceInstanceRemoved | EventType::ServiceHealthChanged => "service",
            EventType::KillSwitchEnabled
            | EventType::KillSwitchDisabled
            | EventType::KillSwitchActivated
            | EventType::KillSwitchDeactivated
            | EventType::KillSwitchReconciled => "killswitch",
        }
    }
}

/// Health of a service instance as reported by health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Typed event body. `Generic` events carry their data in `Event::metadata`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EventPayload {
    InterfaceStatusChanged {
        interface_id: String,
        instance_id: Option<String>,
        new_status: String,
    },
    ServiceInstanceRemoved {
        instance_id: String,
    },
    HealthChanged {
        instance_id: String,
        previous: HealthState,
        current: HealthState,
    },
    #[default]
    Generic,
}

/// A VIF event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Event type string (e.g., "interface.created")
    pub event_type: String,
    /// Resource type (e.g., "interface", "killswitch")
    pub resource_type: String,
    /// Resource ID
    pub resource_id: String,
    /// Human-readable message
    pub message: String,
    pub payload: EventPayload,
    /// Additional metadata
    pub metadata: HashMap<String, String>,
}

impl Event {
    /// Create a new event.
    pub fn new(event_type: EventType, resource_id: &str, message: &str) -> Self {
        Self {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as i64,
            event_type: event_type.as_str().to_string(),
            resource_type: event_type.resource_type().to_string(),
            resource_id: resource_id.to_string(),
            message: message.to_string(),
            payload: EventPayload::Generic,
            metadata: HashMap::new(),
        }
    }

    /// Health transition event for a service instance.
    pub fn health_changed(instance_id: &str, previous: HealthState, current: HealthState) -> Self {
        Self::new(
            EventType::ServiceHealthChanged,
            instance_id,
            &format!("Health changed from {:?} to {:?}", previous, current),
        )
        .with_payload(EventPayload::HealthChanged {
            instance_id: instance_id.to_string(),
            previous,
            current,
        })
    }

    /// Attach a typed payload.
    pub fn with_payload(mut self, payload: EventPayload) -> Self {
        self.payload = payload;
        self
    }

    /// Add metadata to the event.
    pub fn with_metadata(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is(&self, event_type: EventType) -> bool {
        self.event_type == event_type.as_str()
    }
}

/// Event bus for publishing and subscribing to VIF events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    ///
    /// Never fails the caller; with no subscribers the event is dropped.
    pub fn publish(&self, event: Event) {
        debug!(event_type = %event.event_type, resource_id = %event.resource_id, "Publishing event");
        if self.sender.send(event).is_err() {
            debug!("No subscribers for event");
        }
    }

    /// Subscribe to events, optionally filtered by event type patterns.
    ///
    /// # Filter patterns
    ///
    /// - `"bridge.*"` - All bridge events
    /// - `"killswitch.activated"` - Only activation events
    /// - Empty list - All events
    pub fn subscribe(&self, filters: Vec<String>) -> EventSubscriber {
        EventSubscriber { receiver: self.sender.subscribe(), filters }
    }

    /// Get the number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event subscriber with optional filtering.
pub struct EventSubscriber {
    receiver: broadcast::Receiver<Event>,
    filters: Vec<String>,
}

impl EventSubscriber {
    /// Receive the next matching event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Event subscriber lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return None;
                }
            }
        }
    }

    fn matches(&self, event: &Event) -> bool {
        if self.filters.is_empty() {
            return true;
        }

        self.filters.iter().any(|filter| {
            if filter == &event.event_type {
                return true;
            }
            // "bridge.*" matches "bridge.setup.complete" but not "bridges.x"
            match filter.strip_suffix('*') {
                Some(prefix) if prefix.ends_with('.') => event.event_type.starts_with(prefix),
                _ => false,
            }
        })
    }
}
