//! In-process event bus
//!
//! The bus uses `tokio::sync::broadcast` so any number of subscribers (CLI
//! output, monitors, tests) can follow publishing and SSO activity.
//!
//! Emission never blocks: with no subscribers events are dropped, and a
//! lagging subscriber misses the oldest events instead of slowing emitters.
//!
//! # Example
//!
//! ```no_run
//! use libpostgrid::service::events::{Event, EventBus};
//!
//! # async fn example() {
//! let event_bus = EventBus::new(100);
//! let mut receiver = event_bus.subscribe();
//!
//! event_bus.emit(Event::PublishStarted {
//!     job_id: "job-1".to_string(),
//!     provider: "x".to_string(),
//!     integration_id: "int-1".to_string(),
//! });
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("Received: {:?}", event);
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub type EventReceiver = broadcast::Receiver<Event>;

/// Broadcast channel shared by services
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// `capacity` is the per-subscriber buffer before old events are dropped
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Receive every event emitted after this call
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: Event) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Events emitted by the publishing and SSO services
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    PublishStarted {
        job_id: String,
        provider: String,
        integration_id: String,
    },

    PublishCompleted {
        job_id: String,
        provider: String,
        /// Network post ids, in input order
        post_ids: Vec<String>,
        attempts: u32,
    },

    PublishFailed {
        job_id: String,
        provider: String,
        error: String,
        /// The account has to be reconnected before publishing can succeed
        reauthenticate: bool,
    },

    TokenRefreshed {
        provider: String,
        integration_id: String,
    },

    /// The provider rejected the token and it could not be refreshed
    RefreshRequired {
        provider: String,
        integration_id: String,
    },

    ProductRegistered {
        product_id: String,
        slug: String,
    },

    ProductUpdated {
        product_id: String,
        /// "updated", "credentials_rotated" or "deactivated"
        change: String,
    },

    UserMapped {
        product_id: String,
        user_id: String,
        /// The internal user was created by this mapping
        created: bool,
    },

    SsoLogin {
        product_id: String,
        user_id: String,
    },

    ProductHealthChanged {
        product_id: String,
        healthy: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_emission_and_subscription() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        let event = Event::TokenRefreshed {
            provider: "x".to_string(),
            integration_id: "int-1".to_string(),
        };
        event_bus.emit(event.clone());

        assert_eq!(receiver.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_does_not_block() {
        let event_bus = EventBus::new(1);
        for _ in 0..10 {
            event_bus.emit(Event::SsoLogin {
                product_id: "p".to_string(),
                user_id: "u".to_string(),
            });
        }
        assert_eq!(event_bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::ProductHealthChanged {
            product_id: "p1".to_string(),
            healthy: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "product_health_changed");
        assert_eq!(json["healthy"], false);
    }
}
