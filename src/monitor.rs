//! Server availability monitor.
//!
//! Keeps a [`ServerState`] snapshot current without the graph manager's
//! help. While a long-lived sentinel client is attached, its callbacks keep
//! the sample rate and period size up to date. While none is attached, a
//! periodic tick opens and immediately closes a probe client and re-attaches
//! the sentinel once the server answers.
//!
//! ```text
//! Inactive ──start()──▶ Probing ⇄ SentinelAttached ──stop()──▶ Inactive
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::server::{AudioServer, NotificationHandler, OpenOptions, ServerConnection};
use crate::MonitorConfig;

/// Capacity of the sentinel's notification queue.
const SENTINEL_QUEUE_CAPACITY: usize = 16;

/// Snapshot of the server's availability and format.
///
/// When `available` is false, `sample_rate` and `buffer_size` are 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerState {
    /// The server accepts clients.
    pub available: bool,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Period size in frames.
    pub buffer_size: u32,
}

impl ServerState {
    /// The unavailable state.
    pub const UNAVAILABLE: Self = Self {
        available: false,
        sample_rate: 0,
        buffer_size: 0,
    };
}

/// Watches whether the audio server is reachable.
///
/// Cloning is cheap; every clone controls the same monitor.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use audio_graph_link::{AvailabilityMonitor, DummyServer, MonitorConfig};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let server = DummyServer::new(44100, 128);
/// let monitor = AvailabilityMonitor::new(
///     Arc::new(server.clone()),
///     MonitorConfig::default(),
///     tokio::runtime::Handle::current(),
/// );
///
/// monitor.start();
/// let state = monitor.state();
/// assert!(state.available);
/// assert_eq!(state.sample_rate, 44100);
///
/// monitor.stop();
/// # }
/// ```
#[derive(Clone)]
pub struct AvailabilityMonitor {
    inner: Arc<Inner>,
}

struct Inner {
    server: Arc<dyn AudioServer>,
    config: MonitorConfig,
    runtime: Handle,
    active: AtomicBool,
    state: Mutex<ServerState>,
    sentinel: Mutex<Option<Sentinel>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
    dropped_events: Arc<AtomicU64>,
}

struct Sentinel {
    connection: Box<dyn ServerConnection>,
    generation: u64,
    events: JoinHandle<()>,
}

impl Sentinel {
    fn close(self) {
        self.events.abort();
        self.connection.close();
    }
}

#[derive(Debug)]
enum SentinelEvent {
    SampleRate(u32),
    BufferSize(u32),
}

/// Notification handler installed on the sentinel client.
///
/// Events only trigger a re-read of the format from the connection, so a
/// dropped event loses nothing while a later one is still queued.
struct SentinelBridge {
    tx: mpsc::Sender<SentinelEvent>,
    shutdown: Arc<Notify>,
    dropped: Arc<AtomicU64>,
}

impl SentinelBridge {
    fn post(&self, event: SentinelEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl NotificationHandler for SentinelBridge {
    fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    fn sample_rate_changed(&self, sample_rate: u32) {
        self.post(SentinelEvent::SampleRate(sample_rate));
    }

    fn buffer_size_changed(&self, buffer_size: u32) {
        self.post(SentinelEvent::BufferSize(buffer_size));
    }
}

impl AvailabilityMonitor {
    /// Creates an inactive monitor.
    pub fn new(server: Arc<dyn AudioServer>, config: MonitorConfig, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                server,
                config,
                runtime,
                active: AtomicBool::new(false),
                state: Mutex::new(ServerState::UNAVAILABLE),
                sentinel: Mutex::new(None),
                ticker: Mutex::new(None),
                generation: AtomicU64::new(0),
                dropped_events: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    /// Starts monitoring: attaches the sentinel if possible and starts the
    /// probe ticker. Does nothing if already active.
    pub fn start(&self) {
        if self.inner.active.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(
            interval = ?self.inner.config.probe_interval,
            "Availability monitor started"
        );

        self.inner.open_sentinel();

        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.probe_interval;
        let ticker = self.inner.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.active.load(Ordering::SeqCst) {
                    break;
                }
                inner.tick();
            }
        });
        if let Some(previous) = self.inner.ticker.lock().replace(ticker) {
            previous.abort();
        }
    }

    /// Stops monitoring and closes the sentinel. Safe to call repeatedly.
    pub fn stop(&self) {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(ticker) = self.inner.ticker.lock().take() {
            ticker.abort();
        }
        let sentinel = self.inner.sentinel.lock().take();
        if let Some(sentinel) = sentinel {
            sentinel.close();
        }
        tracing::info!("Availability monitor stopped");
    }

    /// Returns true between [`start`](Self::start) and [`stop`](Self::stop).
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Returns true while a sentinel client is attached.
    pub fn has_sentinel(&self) -> bool {
        self.inner.sentinel.lock().is_some()
    }

    /// Returns a copy of the current state.
    pub fn state(&self) -> ServerState {
        *self.inner.state.lock()
    }

    /// Format-change notifications dropped because the sentinel's queue
    /// was full.
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped_events.load(Ordering::Relaxed)
    }

    /// Tries to attach the sentinel now instead of waiting for the next tick.
    ///
    /// Returns true if a sentinel is attached afterwards.
    pub fn request_immediate_probe(&self) -> bool {
        self.inner.request_immediate_probe()
    }

    /// Marks the server down and closes the sentinel without probing.
    ///
    /// For use right after stopping the server ourselves.
    pub fn mark_server_down(&self) {
        *self.inner.state.lock() = ServerState::UNAVAILABLE;
        let sentinel = self.inner.sentinel.lock().take();
        if let Some(sentinel) = sentinel {
            sentinel.close();
        }
        tracing::info!("Server marked down");
    }
}

impl std::fmt::Debug for AvailabilityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvailabilityMonitor")
            .field("active", &self.is_active())
            .field("sentinel", &self.has_sentinel())
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn tick(self: &Arc<Self>) {
        if self.sentinel.lock().is_some() {
            return;
        }
        if self.probe() {
            self.open_sentinel();
        }
    }

    fn request_immediate_probe(self: &Arc<Self>) -> bool {
        if !self.active.load(Ordering::SeqCst) {
            return false;
        }
        if self.sentinel.lock().is_some() {
            return true;
        }
        self.probe() && self.open_sentinel()
    }

    /// Opens and immediately closes a throwaway client.
    fn probe(&self) -> bool {
        match self
            .server
            .open(&self.config.probe_name, OpenOptions::no_start_server())
        {
            Ok(opened) => {
                opened.connection.close();
                tracing::trace!("Probe succeeded");
                true
            }
            Err(e) => {
                tracing::trace!(error = %e, "Probe failed");
                false
            }
        }
    }

    /// Attaches the sentinel client. Returns true if one is attached.
    fn open_sentinel(self: &Arc<Self>) -> bool {
        if !self.active.load(Ordering::SeqCst) {
            return false;
        }
        let mut sentinel = self.sentinel.lock();
        if sentinel.is_some() {
            return true;
        }

        let opened = match self
            .server
            .open(&self.config.sentinel_name, OpenOptions::no_start_server())
        {
            Ok(opened) => opened,
            Err(e) => {
                tracing::debug!(error = %e, "Sentinel could not attach");
                *self.state.lock() = ServerState::UNAVAILABLE;
                return false;
            }
        };
        let mut connection = opened.connection;

        let (tx, rx) = mpsc::channel(SENTINEL_QUEUE_CAPACITY);
        let shutdown = Arc::new(Notify::new());
        let bridge = SentinelBridge {
            tx,
            shutdown: Arc::clone(&shutdown),
            dropped: Arc::clone(&self.dropped_events),
        };
        if let Err(e) = connection.set_notification_handler(Arc::new(bridge)) {
            tracing::warn!(error = %e, "Failed to install sentinel callbacks");
            connection.close();
            return false;
        }
        if let Err(e) = connection.activate() {
            tracing::debug!(error = %e, "Sentinel activation failed");
        }

        *self.state.lock() = ServerState {
            available: true,
            sample_rate: connection.sample_rate(),
            buffer_size: connection.buffer_size(),
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let events = self.runtime.spawn(run_sentinel_events(
            Arc::downgrade(self),
            rx,
            shutdown,
            generation,
        ));
        tracing::info!(
            sample_rate = connection.sample_rate(),
            buffer_size = connection.buffer_size(),
            "Sentinel attached; server available"
        );
        *sentinel = Some(Sentinel {
            connection,
            generation,
            events,
        });
        true
    }

    fn on_format_change(&self, generation: u64, event: SentinelEvent) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        let format = {
            let sentinel = self.sentinel.lock();
            sentinel
                .as_ref()
                .filter(|s| s.generation == generation)
                .map(|s| (s.connection.sample_rate(), s.connection.buffer_size()))
        };
        let Some((sample_rate, buffer_size)) = format else {
            return;
        };
        tracing::debug!(?event, sample_rate, buffer_size, "Server format changed");

        let mut state = self.state.lock();
        state.sample_rate = sample_rate;
        state.buffer_size = buffer_size;
    }

    fn on_sentinel_shutdown(self: &Arc<Self>, generation: u64) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        let released = {
            let mut sentinel = self.sentinel.lock();
            match sentinel.as_ref() {
                Some(s) if s.generation == generation => sentinel.take(),
                _ => None,
            }
        };
        let Some(released) = released else {
            return;
        };
        *self.state.lock() = ServerState::UNAVAILABLE;
        // The server is already tearing the client down.
        released.connection.abandon();
        tracing::info!("Server shut down; sentinel released");

        let weak = Arc::downgrade(self);
        let delay = self.config.reprobe_delay;
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.request_immediate_probe();
            }
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.get_mut().take() {
            ticker.abort();
        }
        if let Some(sentinel) = self.sentinel.get_mut().take() {
            sentinel.close();
        }
    }
}

async fn run_sentinel_events(
    inner: Weak<Inner>,
    mut rx: mpsc::Receiver<SentinelEvent>,
    shutdown: Arc<Notify>,
    generation: u64,
) {
    loop {
        tokio::select! {
            biased;
            () = shutdown.notified() => {
                if let Some(inner) = inner.upgrade() {
                    inner.on_sentinel_shutdown(generation);
                }
                break;
            }
            event = rx.recv() => {
                let (Some(event), Some(inner)) = (event, inner.upgrade()) else {
                    break;
                };
                inner.on_format_change(generation, event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::DummyServer;
    use std::time::Duration;

    fn monitor(server: &DummyServer, probe_interval: Duration) -> AvailabilityMonitor {
        AvailabilityMonitor::new(
            Arc::new(server.clone()),
            MonitorConfig {
                probe_interval,
                reprobe_delay: Duration::from_millis(50),
                ..Default::default()
            },
            Handle::current(),
        )
    }

    async fn wait_for(monitor: &AvailabilityMonitor, available: bool) -> ServerState {
        for _ in 0..200 {
            let state = monitor.state();
            if state.available == available {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("monitor never reported available = {available}");
    }

    #[tokio::test]
    async fn test_inactive_monitor_is_unavailable() {
        let server = DummyServer::default();
        let monitor = monitor(&server, Duration::from_secs(1));

        assert_eq!(monitor.state(), ServerState::UNAVAILABLE);
        assert!(!monitor.request_immediate_probe());
        assert!(!monitor.is_active());
    }

    #[tokio::test]
    async fn test_start_attaches_sentinel() {
        let server = DummyServer::new(96000, 64);
        let monitor = monitor(&server, Duration::from_secs(1));
        monitor.start();
        monitor.start();

        assert!(monitor.has_sentinel());
        assert_eq!(
            monitor.state(),
            ServerState {
                available: true,
                sample_rate: 96000,
                buffer_size: 64
            }
        );
        assert_eq!(server.client_names(), vec!["audio-graph-link-monitor"]);

        monitor.stop();
        monitor.stop();
        assert!(server.client_names().is_empty());
    }

    #[tokio::test]
    async fn test_sentinel_tracks_format_changes() {
        let server = DummyServer::new(48000, 512);
        let monitor = monitor(&server, Duration::from_secs(1));
        monitor.start();

        server.set_sample_rate(44100);
        server.set_buffer_size(256);

        for _ in 0..100 {
            if monitor.state().buffer_size == 256 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(monitor.state().sample_rate, 44100);
        assert_eq!(monitor.state().buffer_size, 256);
        monitor.stop();
    }

    #[tokio::test]
    async fn test_format_burst_overflowing_queue_ends_current() {
        let server = DummyServer::new(48000, 512);
        let monitor = monitor(&server, Duration::from_secs(60));
        monitor.start();

        // the event task cannot run until we yield, so the queue overflows
        for rate in 1..=20 {
            server.set_sample_rate(1000 * rate);
        }
        assert_eq!(monitor.dropped_events(), 4);

        for _ in 0..100 {
            if monitor.state().sample_rate == 20000 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(monitor.state().sample_rate, 20000);
        assert!(monitor.state().available);
        monitor.stop();
    }

    #[tokio::test]
    async fn test_shutdown_zeroes_state_and_reprobe_recovers() {
        let server = DummyServer::new(48000, 512);
        let monitor = monitor(&server, Duration::from_secs(60));
        monitor.start();

        server.shutdown();
        let state = wait_for(&monitor, false).await;
        assert_eq!(state, ServerState::UNAVAILABLE);
        assert!(!monitor.has_sentinel());

        // restart before the delayed re-probe fires
        server.restart();
        let state = wait_for(&monitor, true).await;
        assert_eq!(state.sample_rate, 48000);
        assert!(monitor.has_sentinel());
        monitor.stop();
    }

    #[tokio::test]
    async fn test_ticker_reattaches_after_late_restart() {
        let server = DummyServer::new(48000, 512);
        server.shutdown();
        let monitor = monitor(&server, Duration::from_millis(20));
        monitor.start();
        assert!(!monitor.state().available);

        server.restart();
        wait_for(&monitor, true).await;
        monitor.stop();
    }

    #[tokio::test]
    async fn test_mark_server_down_and_immediate_probe() {
        let server = DummyServer::new(48000, 512);
        let monitor = monitor(&server, Duration::from_secs(60));
        monitor.start();

        monitor.mark_server_down();
        assert_eq!(monitor.state(), ServerState::UNAVAILABLE);
        assert!(!monitor.has_sentinel());
        assert!(server.client_names().is_empty());

        assert!(monitor.request_immediate_probe());
        assert!(monitor.state().available);
        monitor.stop();
    }

    #[tokio::test]
    async fn test_probe_does_not_leave_clients_behind() {
        let server = DummyServer::new(48000, 512);
        let monitor = monitor(&server, Duration::from_secs(60));
        monitor.start();
        monitor.mark_server_down();

        monitor.request_immediate_probe();
        assert_eq!(server.client_names(), vec!["audio-graph-link-monitor"]);
        monitor.stop();
    }
}
