// src/ami/router.rs
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::trace;

use super::message::Message;

const TOPIC_CAPACITY: usize = 256;

/// Dispatches events not claimed by a pending action to subscribers, keyed
/// by event name. Delivery follows arrival order; a topic nobody listens to
/// costs nothing beyond the map lookup.
pub struct EventRouter {
    topics: Mutex<HashMap<String, broadcast::Sender<Arc<Message>>>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to events with the given `Event` field value. Lagging
    /// receivers drop the oldest entries (broadcast semantics), they never
    /// block the read loop.
    pub fn subscribe(&self, event_name: &str) -> broadcast::Receiver<Arc<Message>> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(event_name.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    pub fn dispatch(&self, msg: Message) {
        let Some(name) = msg.event_name().map(str::to_owned) else {
            trace!("Dropping unclaimed non-event message");
            return;
        };
        let topics = self.topics.lock().unwrap();
        if let Some(sender) = topics.get(&name) {
            // Err means no live receivers; that is fine.
            let _ = sender.send(Arc::new(msg));
        } else {
            trace!(event = %name, "No subscribers for event");
        }
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}
