//! Async Notification Manager
//!
//! Default [`Publisher`] implementation. Each published event is delivered to every interested
//! subscriber concurrently, each delivery bounded by its own timeout. Delivery failures are
//! logged and counted but never returned to the publisher's caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::notifications::error::{NotificationError, NotificationResult};
use crate::notifications::events::NotificationEvent;
use crate::notifications::traits::{DeliveryStats, Publisher, Subscriber};

/// Statistics for individual subscribers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    pub events_received: u64,
    pub events_processed: u64,
    pub processing_failures: u64,
    pub total_processing_time_us: u64,
}

struct SubscriberInfo<T>
where
    T: NotificationEvent
{
    subscriber: Arc<dyn Subscriber<T>>,
    stats: Arc<Mutex<SubscriberStats>>,
}

enum Delivery {
    Delivered(Duration),
    Failed,
    TimedOut,
}

/// Fan-out publisher with per-delivery timeouts
pub struct NotificationManager<T>
where
    T: NotificationEvent
{
    id: String,
    subscribers: Arc<RwLock<HashMap<String, SubscriberInfo<T>>>>,
    global_stats: Arc<Mutex<DeliveryStats>>,
    delivery_timeout: Duration,
    shutdown: Arc<AtomicBool>,
}

impl<T> NotificationManager<T>
where
    T: NotificationEvent
{
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(5))
    }

    pub fn with_timeout(delivery_timeout: Duration) -> Self {
        Self {
            id: "notification-manager".to_string(),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            global_stats: Arc::new(Mutex::new(DeliveryStats::default())),
            delivery_timeout,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) -> NotificationResult<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(NotificationError::SystemShutdown);
        }

        let subscriber_id = subscriber.subscriber_id().to_string();
        let mut subscribers = self.subscribers.write().await;
        if subscribers.contains_key(&subscriber_id) {
            return Err(NotificationError::subscriber_already_exists(subscriber_id));
        }

        subscribers.insert(subscriber_id.clone(), SubscriberInfo {
            subscriber,
            stats: Arc::new(Mutex::new(SubscriberStats::default())),
        });
        debug!("Subscribed '{}' to runtime notifications", subscriber_id);
        Ok(())
    }

    pub async fn unsubscribe(&self, subscriber_id: &str) -> NotificationResult<()> {
        let mut subscribers = self.subscribers.write().await;
        if subscribers.remove(subscriber_id).is_some() {
            debug!("Unsubscribed '{}' from runtime notifications", subscriber_id);
            Ok(())
        } else {
            Err(NotificationError::subscriber_not_found(subscriber_id))
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn has_subscriber(&self, subscriber_id: &str) -> bool {
        self.subscribers.read().await.contains_key(subscriber_id)
    }

    pub async fn list_subscribers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.subscribers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn get_stats(&self) -> DeliveryStats {
        self.global_stats.lock().clone()
    }

    pub async fn get_subscriber_stats(&self, subscriber_id: &str) -> Option<SubscriberStats> {
        let subscribers = self.subscribers.read().await;
        subscribers.get(subscriber_id).map(|info| info.stats.lock().clone())
    }

    /// Refuse further publishing and drop every subscriber
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let mut subscribers = self.subscribers.write().await;
        let count = subscribers.len();
        subscribers.clear();
        debug!("Notification manager shut down ({} subscribers removed)", count);
    }

    async fn deliver(
        subscriber: Arc<dyn Subscriber<T>>,
        stats: Arc<Mutex<SubscriberStats>>,
        event: T,
        delivery_timeout: Duration,
    ) -> Delivery {
        let subscriber_id = subscriber.subscriber_id().to_string();
        stats.lock().events_received += 1;

        let started = Instant::now();
        let outcome = timeout(delivery_timeout, subscriber.handle_event(event)).await;
        let elapsed = started.elapsed();

        let mut stats = stats.lock();
        stats.total_processing_time_us += elapsed.as_micros() as u64;
        match outcome {
            Ok(Ok(())) => {
                stats.events_processed += 1;
                Delivery::Delivered(elapsed)
            }
            Ok(Err(e)) => {
                stats.processing_failures += 1;
                warn!("Subscriber '{}' failed to process event: {}", subscriber_id, e);
                Delivery::Failed
            }
            Err(_) => {
                stats.processing_failures += 1;
                warn!(
                    "{}",
                    NotificationError::timeout(format!("delivery to '{}'", subscriber_id), delivery_timeout.as_millis() as u64)
                );
                Delivery::TimedOut
            }
        }
    }
}

#[async_trait]
impl<T> Publisher<T> for NotificationManager<T>
where
    T: NotificationEvent
{
    async fn publish(&self, event: T) -> NotificationResult<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(NotificationError::SystemShutdown);
        }

        // Snapshot the targets so slow subscribers never hold the registry lock
        let targets: Vec<_> = {
            let subscribers = self.subscribers.read().await;
            subscribers.values()
                .filter(|info| info.subscriber.should_receive(&event))
                .map(|info| (info.subscriber.clone(), info.stats.clone()))
                .collect()
        };

        let deliveries = targets.into_iter().map(|(subscriber, stats)| {
            Self::deliver(subscriber, stats, event.clone(), self.delivery_timeout)
        });
        let outcomes = join_all(deliveries).await;

        let mut stats = self.global_stats.lock();
        stats.events_published += 1;
        let mut delivered_time = Duration::ZERO;
        let mut delivered = 0u64;
        for outcome in &outcomes {
            match outcome {
                Delivery::Delivered(elapsed) => {
                    delivered += 1;
                    delivered_time += *elapsed;
                }
                Delivery::Failed => stats.delivery_failures += 1,
                Delivery::TimedOut => {
                    stats.delivery_failures += 1;
                    stats.delivery_timeouts += 1;
                }
            }
        }
        if delivered > 0 {
            let avg = delivered_time.as_micros() as u64 / delivered;
            stats.avg_delivery_time_us = if stats.events_delivered == 0 {
                avg
            } else {
                (stats.avg_delivery_time_us + avg) / 2
            };
        }
        stats.events_delivered += delivered;

        debug!("Published event to {} subscribers ({} delivered)", outcomes.len(), delivered);
        Ok(())
    }

    fn publisher_id(&self) -> &str {
        &self.id
    }
}

impl<T> Default for NotificationManager<T>
where
    T: NotificationEvent
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for NotificationManager<T>
where
    T: NotificationEvent
{
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            subscribers: Arc::clone(&self.subscribers),
            global_stats: Arc::clone(&self.global_stats),
            delivery_timeout: self.delivery_timeout,
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}
