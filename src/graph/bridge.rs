//! Hand-off from server callbacks to the general-purpose domain.
//!
//! Server notifications arrive on a server-owned thread. [`CallbackBridge`]
//! only filters out our own client, bumps counters and posts a
//! [`ServerNotification`] with `try_send`. Shutdown is signalled through a
//! [`Notify`] permit so it cannot be lost to a full queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use crate::server::{client_of, NotificationHandler};

/// Capacity of the notification queue.
pub(crate) const NOTIFICATION_QUEUE_CAPACITY: usize = 256;

/// A server notification moved off the callback thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ServerNotification {
    Xrun,
    ClientRegistration { client: String, registered: bool },
    PortRegistration { client: String, registered: bool },
    SampleRate(u32),
    BufferSize(u32),
}

/// Counters shared between the bridge, the process callback and the manager.
#[derive(Debug, Default)]
pub(crate) struct LinkCounters {
    pub xruns: AtomicU64,
    pub dropped_notifications: AtomicU64,
    pub skipped_cycles: Arc<AtomicU64>,
}

impl LinkCounters {
    pub fn reset(&self) {
        self.xruns.store(0, Ordering::Relaxed);
        self.dropped_notifications.store(0, Ordering::Relaxed);
        self.skipped_cycles.store(0, Ordering::Relaxed);
    }
}

/// Notification handler installed on the manager's connection.
pub(crate) struct CallbackBridge {
    own_name: String,
    tx: mpsc::Sender<ServerNotification>,
    shutdown: Arc<Notify>,
    counters: Arc<LinkCounters>,
}

impl CallbackBridge {
    pub fn new(
        own_name: String,
        tx: mpsc::Sender<ServerNotification>,
        shutdown: Arc<Notify>,
        counters: Arc<LinkCounters>,
    ) -> Self {
        Self {
            own_name,
            tx,
            shutdown,
            counters,
        }
    }

    fn post(&self, notification: ServerNotification) {
        if self.tx.try_send(notification).is_err() {
            self.counters
                .dropped_notifications
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl NotificationHandler for CallbackBridge {
    fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    fn xrun(&self) {
        self.counters.xruns.fetch_add(1, Ordering::Relaxed);
        self.post(ServerNotification::Xrun);
    }

    fn client_registration(&self, client: &str, registered: bool) {
        if client == self.own_name {
            return;
        }
        self.post(ServerNotification::ClientRegistration {
            client: client.to_string(),
            registered,
        });
    }

    fn port_registration(&self, port: &str, registered: bool) {
        let Some(client) = client_of(port) else {
            return;
        };
        if client == self.own_name {
            return;
        }
        self.post(ServerNotification::PortRegistration {
            client: client.to_string(),
            registered,
        });
    }

    fn sample_rate_changed(&self, sample_rate: u32) {
        self.post(ServerNotification::SampleRate(sample_rate));
    }

    fn buffer_size_changed(&self, buffer_size: u32) {
        self.post(ServerNotification::BufferSize(buffer_size));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge(
        capacity: usize,
    ) -> (
        CallbackBridge,
        mpsc::Receiver<ServerNotification>,
        Arc<LinkCounters>,
    ) {
        let (tx, rx) = mpsc::channel(capacity);
        let counters = Arc::new(LinkCounters::default());
        let bridge = CallbackBridge::new(
            "engine".to_string(),
            tx,
            Arc::new(Notify::new()),
            Arc::clone(&counters),
        );
        (bridge, rx, counters)
    }

    #[test]
    fn test_bridge_filters_own_client() {
        let (bridge, mut rx, _) = bridge(8);
        bridge.port_registration("engine:link_in_1", true);
        bridge.client_registration("engine", false);
        bridge.port_registration("synth:out_1", true);

        assert_eq!(
            rx.try_recv().unwrap(),
            ServerNotification::PortRegistration {
                client: "synth".to_string(),
                registered: true
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_bridge_counts_dropped_notifications() {
        let (bridge, _rx, counters) = bridge(1);
        bridge.xrun();
        bridge.xrun();
        bridge.xrun();

        assert_eq!(counters.xruns.load(Ordering::Relaxed), 3);
        assert_eq!(counters.dropped_notifications.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_bridge_ignores_malformed_port_names() {
        let (bridge, mut rx, _) = bridge(8);
        bridge.port_registration("no-colon", true);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_survives_full_queue() {
        let (tx, _rx) = mpsc::channel(1);
        let shutdown = Arc::new(Notify::new());
        let bridge = CallbackBridge::new(
            "engine".to_string(),
            tx,
            Arc::clone(&shutdown),
            Arc::new(LinkCounters::default()),
        );
        bridge.xrun();
        bridge.xrun();
        bridge.shutdown();

        tokio::time::timeout(std::time::Duration::from_secs(1), shutdown.notified())
            .await
            .unwrap();
    }
}
