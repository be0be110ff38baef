//! Event system for engine notifications.
//!
//! Consumers (a dashboard, a session recorder) subscribe to a broadcast
//! stream of typed events instead of watching ambient mutable fields. Events
//! describe state transitions and decoded inbound data; they are published by
//! the engine task only.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::protocol::ControlResponse;
use crate::types::{ConnectionState, PeripheralHandle, TelemetrySample};

/// Event types published by the engine.
#[derive(Debug, Clone)]
pub enum Event {
    /// The connection lifecycle state changed.
    StateChanged(ConnectionState),
    /// A new unique peripheral was discovered while scanning.
    PeripheralDiscovered(PeripheralHandle),
    /// A connection attempt failed; the engine is back in `Idle`.
    ConnectionFailed {
        /// Human-readable failure reason from the transport.
        reason: String,
    },
    /// The peripheral link was torn down; the engine is back in `Idle`.
    Disconnected {
        /// Reason reported by the transport, if any.
        reason: Option<String>,
    },
    /// Telemetry was updated; carries the full last-known sample.
    Telemetry(TelemetrySample),
    /// A control point response indication arrived.
    ControlResponse(ControlResponse),
    /// The machine granted control authority.
    ControlGranted,
    /// The published power target changed (already safety-clamped).
    TargetPowerChanged {
        /// Clamped wattage that was transmitted.
        watts: i16,
    },
    /// An outbound command write was rejected by the transport. Non-fatal.
    WriteFailed {
        /// Human-readable failure reason.
        reason: String,
    },
}

/// A subscription to engine events.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Receives the next event.
    ///
    /// Returns `None` once the engine has shut down. A slow subscriber that
    /// lags behind skips missed events rather than erroring.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

struct EventDispatcherInner {
    sender: broadcast::Sender<Event>,
}

/// Dispatches events to subscribers.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<EventDispatcherInner>,
}

impl EventDispatcher {
    /// Creates a new event dispatcher with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(EventDispatcherInner { sender }),
        }
    }

    /// Dispatches an event to all subscribers.
    pub fn dispatch(&self, event: Event) {
        // No receivers is fine; dropping the event is the intended behavior.
        let _ = self.inner.sender.send(event);
    }

    /// Subscribes to events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.inner.sender.subscribe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_dispatch() {
        let dispatcher = EventDispatcher::new(16);
        let mut sub = dispatcher.subscribe();

        dispatcher.dispatch(Event::StateChanged(ConnectionState::Scanning));

        let event = tokio::time::timeout(std::time::Duration::from_millis(100), sub.recv())
            .await
            .unwrap();

        assert!(matches!(
            event,
            Some(Event::StateChanged(ConnectionState::Scanning))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_without_subscribers_is_silent() {
        let dispatcher = EventDispatcher::new(16);
        dispatcher.dispatch(Event::ControlGranted);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_see_the_same_event() {
        let dispatcher = EventDispatcher::new(16);
        let mut a = dispatcher.subscribe();
        let mut b = dispatcher.subscribe();

        dispatcher.dispatch(Event::TargetPowerChanged { watts: 120 });

        for sub in [&mut a, &mut b] {
            let event = tokio::time::timeout(std::time::Duration::from_millis(100), sub.recv())
                .await
                .unwrap();
            assert!(matches!(
                event,
                Some(Event::TargetPowerChanged { watts: 120 })
            ));
        }
    }
}
