//! Live-data hub
//!
//! Single-writer, multi-subscriber distribution of inverter snapshots. Late
//! joiners immediately observe the last published snapshot; consumers that
//! fall behind only ever see the latest value (intermediates are dropped,
//! which is what the strategy controller wants). Each subscriber runs in its
//! own task, so a failing subscriber cannot affect the others.

use super::LiveData;
use tokio::sync::watch;

/// Snapshot distribution hub
pub struct LiveDataHub {
    tx: watch::Sender<Option<LiveData>>,
}

impl LiveDataHub {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Publish a new snapshot to every subscriber
    pub fn publish(&self, data: LiveData) {
        let _ = self.tx.send(Some(data));
    }

    /// Subscribe; the receiver starts out holding the latest snapshot (if any)
    pub fn subscribe(&self) -> watch::Receiver<Option<LiveData>> {
        self.tx.subscribe()
    }

    /// Most recent snapshot without subscribing
    pub fn latest(&self) -> Option<LiveData> {
        *self.tx.borrow()
    }

    /// Number of attached subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LiveDataHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(pv: f64) -> LiveData {
        LiveData {
            pv_power: pv,
            timestamp: Utc::now(),
            ..LiveData::default()
        }
    }

    #[tokio::test]
    async fn late_subscriber_sees_last_snapshot() {
        let hub = LiveDataHub::new();
        hub.publish(sample(4200.0));

        let rx = hub.subscribe();
        assert_eq!(rx.borrow().map(|d| d.pv_power), Some(4200.0));
    }

    #[tokio::test]
    async fn slow_subscriber_gets_latest_only() {
        let hub = LiveDataHub::new();
        let mut rx = hub.subscribe();

        hub.publish(sample(1000.0));
        hub.publish(sample(2000.0));
        hub.publish(sample(3000.0));

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().map(|d| d.pv_power), Some(3000.0));
        // No further change pending
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_affect_others() {
        let hub = LiveDataHub::new();
        let mut bad_rx = hub.subscribe();
        let mut good_rx = hub.subscribe();

        let bad = tokio::spawn(async move {
            bad_rx.changed().await.ok();
            panic!("subscriber failure");
        });
        let good = tokio::spawn(async move {
            good_rx.changed().await.ok();
            good_rx.borrow().map(|d| d.pv_power)
        });

        hub.publish(sample(500.0));

        assert!(bad.await.is_err());
        assert_eq!(good.await.unwrap(), Some(500.0));
    }
}
