//! Event system for channel notifications.
//!
//! Every channel owns an [`EventDispatcher`]. Decoded sensor data, devices
//! detected while scanning and raw channel events are broadcast to all
//! subscribers of that channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::sensors::{Profile, SensorState};

/// Default capacity of a channel's event buffer.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Events published by a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A device was seen while scanning.
    Detected {
        /// Channel number.
        channel: u8,
        /// Profile of the decoder that recognized the device.
        profile: Profile,
        /// Device id.
        device_id: u16,
    },
    /// Decoded data from a device.
    Data {
        /// Channel number.
        channel: u8,
        /// Profile of the decoder.
        profile: Profile,
        /// Device id.
        device_id: u16,
        /// State after the update.
        state: SensorState,
    },
    /// A channel event or command response.
    Status {
        /// Channel number.
        channel: u8,
        /// Message id the event refers to (1 for RF events).
        msg_id: u8,
        /// Event or response code.
        code: u8,
    },
}

impl Event {
    /// Returns the channel number the event was published on.
    #[must_use]
    pub const fn channel(&self) -> u8 {
        match self {
            Self::Detected { channel, .. }
            | Self::Data { channel, .. }
            | Self::Status { channel, .. } => *channel,
        }
    }

    /// Returns the profile for device events.
    #[must_use]
    pub const fn profile(&self) -> Option<Profile> {
        match self {
            Self::Detected { profile, .. } | Self::Data { profile, .. } => Some(*profile),
            Self::Status { .. } => None,
        }
    }

    /// Returns the device id for device events.
    #[must_use]
    pub const fn device_id(&self) -> Option<u16> {
        match self {
            Self::Detected { device_id, .. } | Self::Data { device_id, .. } => Some(*device_id),
            Self::Status { .. } => None,
        }
    }
}

/// A subscription to events.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Receives the next event.
    ///
    /// Events missed because the subscriber lagged behind are skipped.
    /// Returns `None` once the dispatcher is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("subscriber lagged, skipped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Filter for device events.
///
/// An empty filter matches every event; a filter with a profile or device id
/// only matches device events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Filter by profile.
    pub profile: Option<Profile>,
    /// Filter by device id.
    pub device_id: Option<u16>,
}

impl EventFilter {
    /// Creates a filter for one profile.
    #[must_use]
    pub const fn profile(profile: Profile) -> Self {
        Self {
            profile: Some(profile),
            device_id: None,
        }
    }

    /// Creates a filter for one device of a profile.
    #[must_use]
    pub const fn device(profile: Profile, device_id: u16) -> Self {
        Self {
            profile: Some(profile),
            device_id: Some(device_id),
        }
    }

    /// Checks if an event matches this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(profile) = self.profile
            && event.profile() != Some(profile)
        {
            return false;
        }
        if let Some(device_id) = self.device_id
            && event.device_id() != Some(device_id)
        {
            return false;
        }
        true
    }
}

/// Dispatches events to subscribers.
#[derive(Clone)]
pub struct EventDispatcher {
    sender: Arc<broadcast::Sender<Event>>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventDispatcher {
    /// Creates a new event dispatcher.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Dispatches an event to all subscribers.
    pub fn dispatch(&self, event: Event) {
        // no receivers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribes to all events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    /// Waits for an event matching the filter with timeout.
    ///
    /// Returns `None` if the timeout expires or the dispatcher is gone.
    pub async fn wait_for(&self, filter: EventFilter, timeout: Duration) -> Option<Event> {
        let mut subscription = self.subscribe();

        tokio::select! {
            biased;
            result = async {
                loop {
                    let event = subscription.recv().await?;
                    if filter.matches(&event) {
                        return Some(event);
                    }
                }
            } => result,
            () = tokio::time::sleep(timeout) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u8) -> Event {
        Event::Status {
            channel: 0,
            msg_id: 1,
            code,
        }
    }

    fn detected(profile: Profile, device_id: u16) -> Event {
        Event::Detected {
            channel: 1,
            profile,
            device_id,
        }
    }

    #[tokio::test]
    async fn test_event_dispatch() {
        let dispatcher = EventDispatcher::default();
        let mut sub = dispatcher.subscribe();

        dispatcher.dispatch(status(7));

        let event = tokio::time::timeout(Duration::from_millis(100), sub.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(status(7)));
    }

    #[test]
    fn test_event_filter() {
        let any = EventFilter::default();
        assert!(any.matches(&status(0)));

        let hr = EventFilter::profile(Profile::HeartRate);
        assert!(hr.matches(&detected(Profile::HeartRate, 1)));
        assert!(!hr.matches(&detected(Profile::BicyclePower, 1)));
        assert!(!hr.matches(&status(0)));

        let device = EventFilter::device(Profile::HeartRate, 42);
        assert!(device.matches(&detected(Profile::HeartRate, 42)));
        assert!(!device.matches(&detected(Profile::HeartRate, 43)));
    }

    #[test]
    fn test_event_accessors() {
        let event = detected(Profile::BikeSpeed, 9);
        assert_eq!(event.channel(), 1);
        assert_eq!(event.profile(), Some(Profile::BikeSpeed));
        assert_eq!(event.device_id(), Some(9));
        assert_eq!(status(1).device_id(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for() {
        let dispatcher = EventDispatcher::default();
        let sender = dispatcher.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            sender.dispatch(status(0));
            sender.dispatch(detected(Profile::HeartRate, 5));
        });

        let event = dispatcher
            .wait_for(EventFilter::profile(Profile::HeartRate), Duration::from_secs(1))
            .await;
        assert_eq!(event, Some(detected(Profile::HeartRate, 5)));

        let none = dispatcher
            .wait_for(EventFilter::profile(Profile::HeartRate), Duration::from_millis(50))
            .await;
        assert!(none.is_none());
    }
}
