// apps/kernel-server/src/event_bus.rs
// Purpose: Per-run broadcast of RuntimeEvent to WebSocket subscribers and the
// Pattern Engine. §4.10, §6.5
// Architecture: Infrastructure Layer
// Dependencies: tokio::sync::broadcast, DashMap

use crate::events::RuntimeEvent;
use dashmap::DashMap;
use tokio::sync::broadcast;

/// Each run gets its own broadcast channel, created lazily on first publish
/// or subscribe. Subscribers that never connect (or that connect late) don't
/// hold up publishers; a lagging receiver just misses events, it never
/// blocks the sender.
pub struct EventBus {
    capacity: usize,
    channels: DashMap<String, broadcast::Sender<RuntimeEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        EventBus {
            capacity,
            channels: DashMap::new(),
        }
    }

    fn sender_for(&self, run_id: &str) -> broadcast::Sender<RuntimeEvent> {
        self.channels
            .entry(run_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publishes an event. Returns the number of active subscribers it
    /// reached (0 if nobody is currently listening; this is not an error).
    pub fn publish(&self, event: RuntimeEvent) -> usize {
        let sender = self.sender_for(&event.run_id);
        sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self, run_id: &str) -> broadcast::Receiver<RuntimeEvent> {
        self.sender_for(run_id).subscribe()
    }

    /// Drops the channel for a run once it is terminal and has no
    /// subscribers, so the map doesn't grow unbounded across long uptimes.
    pub fn retire(&self, run_id: &str) {
        if let Some(entry) = self.channels.get(run_id) {
            if entry.receiver_count() == 0 {
                drop(entry);
                self.channels.remove(run_id);
            }
        }
    }
}
