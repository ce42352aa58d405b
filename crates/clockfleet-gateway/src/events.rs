use std::sync::atomic::{AtomicU64, Ordering};

use clockfleet_controller::EventSink;
use serde_json::json;
use tokio::sync::broadcast;

const BROADCAST_CAPACITY: usize = 256;

/// Fan-out of controller status events to every subscriber via a tokio
/// broadcast channel. Each frame is a JSON string
/// `{"event": topic, "seq": n, "payload": {...}}`.
pub struct EventBroadcaster {
    tx: broadcast::Sender<String>,
    seq: AtomicU64,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            tx,
            seq: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventSink for EventBroadcaster {
    /// Silently drops the frame if no subscribers exist.
    fn emit(&self, topic: &str, payload: serde_json::Value) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let frame = json!({ "event": topic, "seq": seq, "payload": payload }).to_string();
        let _ = self.tx.send(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_sequenced_frames() {
        let broadcaster = EventBroadcaster::new();
        broadcaster.emit("device:status", json!({ "deviceId": "lost" }));

        let mut rx = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);
        broadcaster.emit("device:d1:status", json!({ "deviceId": "d1" }));

        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["event"], "device:d1:status");
        assert_eq!(frame["seq"], 1);
        assert_eq!(frame["payload"]["deviceId"], "d1");
    }
}
