//! Control-plane events
//!
//! Subsystems return structured records; only the facade turns them into
//! events and publishes them. Sinks are fire-and-forget: `publish` must not
//! block and is never called while a lock is held.

use mittari_core::{PluginId, SubscriptionKind};
use serde::Serialize;
use tokio::sync::broadcast;

/// Everything the control plane announces to the outside world.
/// Serializable so sinks can forward events off-process as JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlEvent {
    /// A plugin was loaded
    LoadPlugin {
        /// Identity of the loaded plugin
        id: PluginId,
        /// Whether its signature validated
        signed: bool,
    },
    /// A plugin was unloaded
    UnloadPlugin {
        /// Identity of the unloaded plugin
        id: PluginId,
    },
    /// A swap completed: `loaded` replaced `unloaded`
    SwapPlugins {
        /// The incoming plugin
        loaded: PluginId,
        /// The outgoing plugin
        unloaded: PluginId,
    },
    /// A task subscribed to a plugin's pool
    PluginSubscription {
        /// Subscribing task
        task_id: u64,
        /// Plugin the pool belongs to
        id: PluginId,
        /// Bound (pinned version) or unbound (follows latest)
        kind: SubscriptionKind,
    },
    /// A task dropped its subscription
    PluginUnsubscription {
        /// Unsubscribing task
        task_id: u64,
        /// Plugin the pool belongs to
        id: PluginId,
    },
}

/// A destination for control events.
pub trait EventSink: Send + Sync {
    /// Deliver one event. Must not block; failures are the sink's problem.
    fn publish(&self, event: ControlEvent);
}

/// Sink that discards everything. The default when no bus is wired in.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: ControlEvent) {}
}

/// Broadcast-backed event bus.
///
/// `publish` never blocks: with no receivers the event is dropped, and slow
/// receivers that fall behind the channel capacity lose the oldest events
/// (tokio broadcast lagging semantics).
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<ControlEvent>,
}

impl BroadcastBus {
    /// Create a bus retaining up to `capacity` undelivered events per receiver
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Open a new receiver; it observes events published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.tx.subscribe()
    }

    /// Number of live receivers
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastBus {
    fn publish(&self, event: ControlEvent) {
        // send only errors when there are no receivers; nothing to do then
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use mittari_core::PluginRole;

    fn cpu(version: u32) -> PluginId {
        PluginId::new(PluginRole::Collector, "cpu", version)
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = BroadcastBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(ControlEvent::LoadPlugin {
            id: cpu(1),
            signed: true,
        });
        bus.publish(ControlEvent::UnloadPlugin { id: cpu(1) });

        assert_eq!(
            rx.recv().await.unwrap(),
            ControlEvent::LoadPlugin {
                id: cpu(1),
                signed: true
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ControlEvent::UnloadPlugin { id: cpu(1) }
        );
    }

    #[test]
    fn publish_without_receivers_is_a_no_op() {
        let bus = BroadcastBus::new(8);
        assert_eq!(bus.receiver_count(), 0);
        // must not panic or block
        bus.publish(ControlEvent::UnloadPlugin { id: cpu(2) });
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let event = ControlEvent::LoadPlugin {
            id: cpu(2),
            signed: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "load_plugin");
        assert_eq!(json["id"]["name"], "cpu");
        assert_eq!(json["id"]["version"], 2);
        assert_eq!(json["signed"], true);
    }

    #[tokio::test]
    async fn receivers_only_see_events_after_subscribing() {
        let bus = BroadcastBus::new(8);
        bus.publish(ControlEvent::LoadPlugin {
            id: cpu(1),
            signed: false,
        });

        let mut rx = bus.subscribe();
        bus.publish(ControlEvent::UnloadPlugin { id: cpu(1) });

        assert_eq!(
            rx.recv().await.unwrap(),
            ControlEvent::UnloadPlugin { id: cpu(1) }
        );
    }
}
