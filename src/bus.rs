//! Fan-out bus: internal publish/subscribe plane delivering state to
//! dashboard subscribers (spec.md §4.8).
//!
//! Built on [`tokio::sync::broadcast`]. Its lagged-receiver semantics are
//! exactly the drop-oldest-plus-resync behaviour the spec asks for: when a
//! subscriber falls more than `capacity` messages behind, the next `recv()`
//! returns `RecvError::Lagged(n)` instead of the missed messages, and the
//! subscriber task turns that into a synthetic [`BusMessage::Resync`] frame.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::alarm::Alarm;
use crate::model::grid::GridSnapshot;
use crate::model::node::{LinkState, NodeSummary};
use crate::model::security::SecurityEvent;
use crate::model::telemetry::TelemetrySample;

/// Outbound subscriber queue depth (spec.md §4.8 default 256).
pub const SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum BusMessage {
    FullStateSnapshot {
        grid: GridSnapshot,
        nodes: Vec<NodeSummary>,
        latest_samples: Vec<TelemetrySample>,
        open_alarms: Vec<Alarm>,
    },
    GridOverviewUpdate {
        grid: GridSnapshot,
    },
    TelemetryUpdate {
        sample: TelemetrySample,
    },
    AlarmRaised {
        alarm: Alarm,
    },
    AlarmCleared {
        alarm: Alarm,
    },
    AlarmAcknowledged {
        alarm: Alarm,
    },
    UnknownConnection {
        event: SecurityEvent,
    },
    SecurityEvent {
        event: SecurityEvent,
    },
    NodeStateChanged {
        node_id: String,
        link_state: LinkState,
    },
    Heartbeat {
        sent_at: DateTime<Utc>,
    },
    Resync,
}

/// Holds the broadcast sender; every subscriber gets its own `Receiver`
/// with its own 256-slot lag window.
#[derive(Clone)]
pub struct FanOutBus {
    sender: broadcast::Sender<BusMessage>,
}

pub struct Subscription {
    receiver: broadcast::Receiver<BusMessage>,
}

impl FanOutBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, message: BusMessage) {
        // No receivers is the common case before the first dashboard
        // connects; that's not an error.
        let _ = self.sender.send(message);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for FanOutBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Subscription {
    /// Await the next message, folding a lag into a `Resync` sentinel so
    /// callers never have to special-case `broadcast::error::RecvError`.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(_)) => return Some(BusMessage::Resync),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_message() {
        let bus = FanOutBus::new();
        let mut sub = bus.subscribe();
        bus.publish(BusMessage::Resync);
        assert!(matches!(sub.recv().await, Some(BusMessage::Resync)));
    }

    #[tokio::test]
    async fn lagging_subscriber_gets_resync_not_a_panic() {
        let bus = FanOutBus::new();
        let mut sub = bus.subscribe();
        for _ in 0..(SUBSCRIBER_CAPACITY + 10) {
            bus.publish(BusMessage::Heartbeat { sent_at: Utc::now() });
        }
        let msg = sub.recv().await;
        assert!(matches!(msg, Some(BusMessage::Resync)));
    }

    #[tokio::test]
    async fn subscriber_count_reflects_active_subscriptions() {
        let bus = FanOutBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        let _sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
    }
}
