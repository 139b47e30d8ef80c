//! Runtime Notification System
//!
//! Publisher/subscriber plumbing for runtime events. The runtime publishes
//! [`RuntimeEvent`]s through an injected [`Publisher`]; [`NotificationManager`] is the default,
//! fanning each event out to its subscribers.
//!
//! # Example Usage
//!
//! ```no_run
//! use plugin_runtime::notifications::{NotificationManager, Publisher, RuntimeEvent, RuntimeEventType};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = NotificationManager::<RuntimeEvent>::new();
//! let event = RuntimeEvent::new(RuntimeEventType::PluginRegistered, "alpha", serde_json::json!({}));
//! manager.publish(event).await?;
//! # Ok(())
//! # }
//! ```

pub mod traits;
pub mod manager;
pub mod events;
pub mod error;


pub use traits::{DeliveryStats, Publisher, Subscriber};
pub use manager::{NotificationManager, SubscriberStats};
pub use events::{NotificationEvent, RuntimeEvent, RuntimeEventType};
pub use error::{NotificationError, NotificationResult};
