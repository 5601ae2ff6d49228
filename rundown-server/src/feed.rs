//! Realtime change feed.
//!
//! One `tokio::sync::broadcast` channel per service. Writers publish while
//! holding the service lock, so every subscriber observes events in the same
//! order they were committed. A subscriber that falls behind receives
//! `RecvError::Lagged` and is expected to re-fetch the current snapshot.

use std::collections::HashMap;

use rundown_proto::agenda::{Service, ServiceId};
use rundown_proto::timer::TimerState;
use tokio::sync::broadcast;

/// Default number of buffered events per service.
pub const DEFAULT_FEED_CAPACITY: usize = 64;

/// A committed change to one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// New authoritative timer snapshot.
    Timer(TimerState),
    /// Service details, agenda or grants changed.
    Service(Service),
    /// The service was deleted. No further events follow.
    Removed(ServiceId),
}

/// Per-service broadcast of [`FeedEvent`]s.
#[derive(Debug)]
pub struct ChangeFeed {
    capacity: usize,
    channels: parking_lot::Mutex<HashMap<ServiceId, broadcast::Sender<FeedEvent>>>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl ChangeFeed {
    /// Creates a feed buffering up to `capacity` events per service.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Subscribes to future events of `service_id`.
    pub fn subscribe(&self, service_id: ServiceId) -> broadcast::Receiver<FeedEvent> {
        let mut channels = self.channels.lock();
        channels
            .entry(service_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publishes `event` to every subscriber of `service_id`.
    ///
    /// Returns the number of subscribers that received it. A channel with no
    /// subscribers left is dropped.
    pub fn publish(&self, service_id: ServiceId, event: FeedEvent) -> usize {
        let mut channels = self.channels.lock();
        let Some(sender) = channels.get(&service_id) else {
            return 0;
        };
        if let Ok(count) = sender.send(event) {
            tracing::trace!(service_id = %service_id, receivers = count, "feed event published");
            count
        } else {
            channels.remove(&service_id);
            0
        }
    }

    /// Drops the channel for `service_id`. Receivers drain what is buffered
    /// and then observe `Closed`.
    pub fn close(&self, service_id: ServiceId) {
        self.channels.lock().remove(&service_id);
    }

    /// Drops the channel for `service_id` if nobody listens to it anymore.
    pub fn prune(&self, service_id: ServiceId) {
        let mut channels = self.channels.lock();
        if channels
            .get(&service_id)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(&service_id);
        }
    }

    /// Number of services with a live channel.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// Current number of subscribers for `service_id`.
    #[must_use]
    pub fn subscriber_count(&self, service_id: ServiceId) -> usize {
        self.channels
            .lock()
            .get(&service_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}
