use dashmap::DashMap;
use tokio::sync::broadcast;

use skywave_protocol::types::{SessionId, UserId};

/// Capacity of each topic channel; lagging subscribers lose oldest events.
const TOPIC_CAPACITY: usize = 256;

/// Events carried on the in-process bus. Delivery is best-effort; observers
/// of state-change events must treat them as hints and re-query.
#[derive(Debug, Clone)]
pub enum Event {
    PropagationUpdated {
        epoch: u64,
    },
    SignalStrengthChanged {
        grid_a: String,
        grid_b: String,
        strength: f64,
    },
    MufChanged {
        muf_mhz: f64,
    },
    ExternalDataUpdated {
        source: String,
    },
    UserAuthenticated {
        session: SessionId,
        user_id: Option<UserId>,
        name: String,
    },
    UserRegistered {
        user_id: UserId,
        name: String,
    },
    UserUnregistered {
        user_id: UserId,
    },
    UserPropertiesChanged {
        user_id: UserId,
    },
}

impl Event {
    /// The topic an event is published under.
    pub fn topic(&self) -> &'static str {
        match self {
            Event::PropagationUpdated { .. } => topics::PROPAGATION_UPDATED,
            Event::SignalStrengthChanged { .. } => topics::SIGNAL_STRENGTH_CHANGED,
            Event::MufChanged { .. } => topics::MUF_CHANGED,
            Event::ExternalDataUpdated { .. } => topics::EXTERNAL_DATA_UPDATED,
            Event::UserAuthenticated { .. } => topics::USER_AUTHENTICATED,
            Event::UserRegistered { .. } => topics::USER_REGISTERED,
            Event::UserUnregistered { .. } => topics::USER_UNREGISTERED,
            Event::UserPropertiesChanged { .. } => topics::USER_PROPERTIES_CHANGED,
        }
    }
}

pub mod topics {
    pub const PROPAGATION_UPDATED: &str = "propagation-updated";
    pub const SIGNAL_STRENGTH_CHANGED: &str = "signal-strength-changed";
    pub const MUF_CHANGED: &str = "muf-changed";
    pub const EXTERNAL_DATA_UPDATED: &str = "external-data-updated";
    pub const USER_AUTHENTICATED: &str = "user-authenticated";
    pub const USER_REGISTERED: &str = "user-registered";
    pub const USER_UNREGISTERED: &str = "user-unregistered";
    pub const USER_PROPERTIES_CHANGED: &str = "user-properties-changed";
}

/// Minimal publish/subscribe bus: one broadcast channel per topic.
///
/// Publishers never block. Per-topic delivery preserves publish order; there
/// is no ordering between topics.
pub struct EventBus {
    topics: DashMap<&'static str, broadcast::Sender<Event>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
        }
    }

    fn sender(&self, topic: &'static str) -> broadcast::Sender<Event> {
        self.topics
            .entry(topic)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    /// Publish an event under its topic. Dropped when nobody subscribes.
    pub fn publish(&self, event: Event) {
        let _ = self.sender(event.topic()).send(event);
    }

    /// Subscribe to one topic.
    pub fn subscribe(&self, topic: &'static str) -> broadcast::Receiver<Event> {
        self.sender(topic).subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
