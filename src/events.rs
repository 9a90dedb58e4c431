use bytes::Bytes;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::{
    protocol::Attribute,
    types::{AuthLevel, ConnectionSnapshot, DeviceState, Preset, SessionState},
};

const DEFAULT_CHANNEL_CAPACITY: usize = 128;

/// State change re-emitted by a [`crate::MotionMount`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountEvent {
    /// Connection state machine moved
    ConnectionChanged(ConnectionSnapshot),
    /// Every readable attribute was re-read
    StateRefreshed(Box<DeviceState>),
    /// Actual position reported by the device
    PositionChanged {
        /// Distance in percent
        distance: u8,
        /// Rotation in percent
        rotation: i8,
    },
    /// A preset slot was written or re-read
    PresetChanged(Preset),
    /// Authentication state or PIN configuration changed
    SessionChanged(SessionState),
    /// PIN sent during connect was not accepted
    AuthenticationRejected(AuthLevel),
    /// Calibration reported a step
    CalibrationProgress(u8),
    /// Calibration reached its terminal step
    CalibrationFinished,
    /// Calibration step did not increase
    CalibrationOutOfOrder {
        /// Last accepted step
        previous: u8,
        /// Step that was observed
        observed: u8,
    },
    /// Undocumented attribute notified a payload
    OpaqueNotification {
        /// Index of the undocumented attribute
        index: u8,
        /// Verbatim payload
        value: Bytes,
    },
    /// Subscribing to an attribute failed; its updates will be missing
    SubscriptionDegraded(Attribute),
    /// The next connection attempt is scheduled
    ReconnectScheduled(Duration),
}

/// Broadcast channel fanning [`MountEvent`]s out to subscribers
///
/// Slow subscribers lose the oldest events and observe
/// [`broadcast::error::RecvError::Lagged`].
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MountEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Bus with the default capacity
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Bus buffering up to `capacity` events per subscriber
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Receive every event published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MountEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish to all subscribers, discarding the event if there are none
    pub fn publish(&self, event: MountEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(MountEvent::CalibrationProgress(3));

        assert_eq!(first.recv().await.unwrap(), MountEvent::CalibrationProgress(3));
        assert_eq!(second.recv().await.unwrap(), MountEvent::CalibrationProgress(3));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(MountEvent::CalibrationFinished);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();
        for step in 1..=4 {
            bus.publish(MountEvent::CalibrationProgress(step));
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
        assert_eq!(rx.recv().await.unwrap(), MountEvent::CalibrationProgress(3));
    }
}
