use crate::entry::ConversationEntry;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    /// A conversation entry was stored
    EntryRecorded {
        user_id: String,
        entry: ConversationEntry,
    },

    /// A user rewrote the title or diary body of an entry
    EntryEdited {
        user_id: String,
        entry: ConversationEntry,
    },

    /// A day's materialized photos/summary were saved
    DayDigestSaved { user_id: String, date: String },
}

impl Event {
    pub fn user_id(&self) -> &str {
        match self {
            Event::EntryRecorded { user_id, .. }
            | Event::EntryEdited { user_id, .. }
            | Event::DayDigestSaved { user_id, .. } => user_id,
        }
    }
}

pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(100);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        // No receivers is not an error
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
