//! Publisher/Subscriber Traits
//!
//! The runtime only ever talks to a [`Publisher`]; subscribers are attached to whatever
//! publisher the embedding process supplies.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::notifications::error::NotificationResult;
use crate::notifications::events::NotificationEvent;

/// Components that emit events
#[async_trait]
pub trait Publisher<T>: Send + Sync
where
    T: NotificationEvent
{
    /// Publish an event to all subscribers
    async fn publish(&self, event: T) -> NotificationResult<()>;

    /// Get the publisher identifier
    fn publisher_id(&self) -> &str;
}

/// Components that handle events
#[async_trait]
pub trait Subscriber<T>: Send + Sync
where
    T: NotificationEvent
{
    /// Handle an incoming event
    async fn handle_event(&self, event: T) -> NotificationResult<()>;

    /// Get the subscriber identifier (must be unique)
    fn subscriber_id(&self) -> &str;

    /// Check if this subscriber should receive the event
    fn should_receive(&self, _event: &T) -> bool {
        true
    }
}

/// Statistics about notification delivery
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStats {
    /// Total events published
    pub events_published: u64,

    /// Total events delivered successfully
    pub events_delivered: u64,

    /// Total delivery failures, including timeouts
    pub delivery_failures: u64,

    /// Deliveries that hit the per-delivery timeout
    pub delivery_timeouts: u64,

    /// Average delivery time in microseconds
    pub avg_delivery_time_us: u64,
}
