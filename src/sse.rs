//! Live status fan-out to SSE clients
//!
//! Producers push full and partial status updates into a broadcast channel;
//! the web layer turns them into `text/event-stream` events. Slow or dead
//! clients drop out of the channel on their own without affecting the rest.

use crate::wallbox::WallboxStatus;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 32;

/// Events pushed to the UI
#[derive(Debug, Clone)]
pub enum StatusEvent {
    /// Complete wallbox snapshot (`event: wallbox-status`)
    Full(WallboxStatus),
    /// Only the changed fields plus `lastUpdated` (`event: wallbox-partial`)
    Partial(serde_json::Value),
    /// Final event before the server goes away (`event: shutdown`)
    Shutdown,
}

impl StatusEvent {
    /// SSE event name on the wire
    pub fn event_name(&self) -> &'static str {
        match self {
            StatusEvent::Full(_) => "wallbox-status",
            StatusEvent::Partial(_) => "wallbox-partial",
            StatusEvent::Shutdown => "shutdown",
        }
    }

    /// Serialized event payload
    pub fn payload(&self) -> String {
        match self {
            StatusEvent::Full(status) => {
                serde_json::to_string(status).unwrap_or_else(|_| "{}".to_string())
            }
            StatusEvent::Partial(fields) => fields.to_string(),
            StatusEvent::Shutdown => "{}".to_string(),
        }
    }
}

/// Fan-out handle shared by the producers
pub struct StatusBroadcaster {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// Push a complete snapshot
    pub fn send_full(&self, status: WallboxStatus) {
        let _ = self.tx.send(StatusEvent::Full(status));
    }

    /// Push only the given changed fields; `lastUpdated` is stamped here
    pub fn send_partial(&self, mut fields: serde_json::Value) {
        if let Some(object) = fields.as_object_mut() {
            object.insert(
                "lastUpdated".to_string(),
                serde_json::json!(chrono::Utc::now()),
            );
        }
        let _ = self.tx.send(StatusEvent::Partial(fields));
    }

    /// Announce shutdown to every client
    pub fn send_shutdown(&self) {
        let _ = self.tx.send(StatusEvent::Shutdown);
    }

    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn partial_updates_carry_last_updated() {
        let broadcaster = StatusBroadcaster::new();
        let mut rx = broadcaster.subscribe();

        broadcaster.send_partial(serde_json::json!({"state": 3}));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_name(), "wallbox-partial");
        let payload: serde_json::Value = serde_json::from_str(&event.payload()).unwrap();
        assert_eq!(payload["state"], 3);
        assert!(payload.get("lastUpdated").is_some());
    }

    #[tokio::test]
    async fn every_subscriber_sees_the_broadcast() {
        let broadcaster = StatusBroadcaster::new();
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();

        broadcaster.send_full(WallboxStatus::default());
        assert_eq!(a.recv().await.unwrap().event_name(), "wallbox-status");
        assert_eq!(b.recv().await.unwrap().event_name(), "wallbox-status");

        broadcaster.send_shutdown();
        assert!(matches!(a.recv().await.unwrap(), StatusEvent::Shutdown));
        assert!(matches!(b.recv().await.unwrap(), StatusEvent::Shutdown));
    }
}
