//! Composition root.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::server::{AudioServer, LaunchRequest, ServerLauncher, SYSTEM_CLIENT};
use crate::{AvailabilityMonitor, GraphManager, LinkConfig, LinkError, LinkStats, ServerState};

/// Snapshot of the link for status displays.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkStatus {
    /// What the availability monitor last saw.
    pub server: ServerState,
    /// Our client connection is open.
    pub connected: bool,
    /// Our client is processing audio.
    pub active: bool,
    /// Name the server assigned to our client.
    pub client_name: Option<String>,
    /// Registered input ports.
    pub inputs: usize,
    /// Registered output ports.
    pub outputs: usize,
    /// Server DSP load in percent.
    pub cpu_load: f32,
    /// The periodic auto-connect sweep is running.
    pub auto_connect_running: bool,
    /// Counters for the current connection.
    pub stats: LinkStats,
}

/// Owns the graph manager, the availability monitor and the optional
/// server launcher for the lifetime of the host.
///
/// # Lifecycle
///
/// 1. [`new`](Self::new), optionally [`with_launcher`](Self::with_launcher)
/// 2. [`start`](Self::start) launches the server (if configured) and the monitor
/// 3. [`connect_client`](Self::connect_client) opens our client and starts audio,
///    or [`connect_configured`](Self::connect_configured) does so from the config
/// 4. [`shutdown`](Self::shutdown) tears everything down in order
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use audio_graph_link::{DummyServer, LinkConfig, LinkContext};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), audio_graph_link::LinkError> {
/// let server = DummyServer::default();
/// let context = LinkContext::new(
///     Arc::new(server.clone()),
///     LinkConfig::default(),
///     tokio::runtime::Handle::current(),
/// );
///
/// context.start().await?;
/// context.connect_client("engine", 2, 2)?;
/// assert!(context.status().active);
///
/// context.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct LinkContext {
    config: LinkConfig,
    runtime: Handle,
    graph: GraphManager,
    monitor: AvailabilityMonitor,
    launcher: Option<Arc<dyn ServerLauncher>>,
    auto_connect: Mutex<Option<JoinHandle<()>>>,
    requested_name: Mutex<Option<String>>,
}

impl LinkContext {
    /// Creates a context without a launcher. Out-of-range config values are
    /// replaced by their defaults.
    pub fn new(server: Arc<dyn AudioServer>, config: LinkConfig, runtime: Handle) -> Self {
        let config = config.validated();
        let graph = GraphManager::new(Arc::clone(&server), &config, runtime.clone());
        let monitor = AvailabilityMonitor::new(server, config.monitor.clone(), runtime.clone());
        Self {
            config,
            runtime,
            graph,
            monitor,
            launcher: None,
            auto_connect: Mutex::new(None),
            requested_name: Mutex::new(None),
        }
    }

    /// Attaches a launcher for starting and stopping the server.
    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn ServerLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// The graph manager.
    pub fn graph(&self) -> &GraphManager {
        &self.graph
    }

    /// The availability monitor.
    pub fn monitor(&self) -> &AvailabilityMonitor {
        &self.monitor
    }

    /// The validated configuration.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Starts the availability monitor, launching the server first when
    /// `auto_start_server` is set and a launcher is attached.
    ///
    /// # Errors
    ///
    /// Returns the launcher's error. The monitor is started regardless.
    pub async fn start(&self) -> Result<(), LinkError> {
        let launched = if self.config.auto_start_server && self.launcher.is_some() {
            self.start_server().await
        } else {
            Ok(())
        };
        self.monitor.start();
        launched
    }

    /// Connects our client, registers `inputs` and `outputs` ports with the
    /// configured base name, and activates it.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error. A client opened by this call
    /// is closed again on failure.
    pub fn connect_client(
        &self,
        name: &str,
        inputs: usize,
        outputs: usize,
    ) -> Result<(), LinkError> {
        let was_connected = self.graph.is_connected();
        self.graph.connect(name)?;

        let result = self
            .graph
            .register_audio_ports(inputs, outputs, &self.config.port_base_name)
            .and_then(|()| self.graph.activate());
        if let Err(e) = result {
            tracing::warn!(client = name, error = %e, "Client setup failed");
            if !was_connected {
                self.graph.disconnect();
            }
            return Err(e);
        }

        *self.requested_name.lock() = Some(name.to_string());
        if self.is_auto_connect_running() {
            self.sweep();
        }
        Ok(())
    }

    /// Connects our client with the configured name and channel counts, and
    /// starts the auto-connect sweep at `client_monitor_interval` when
    /// `auto_connect` is set.
    ///
    /// # Errors
    ///
    /// Same as [`connect_client`](Self::connect_client).
    pub fn connect_configured(&self) -> Result<(), LinkError> {
        self.connect_client(
            &self.config.client_name,
            self.config.input_channels,
            self.config.output_channels,
        )?;
        if self.config.auto_connect {
            self.start_auto_connect(self.config.client_monitor_interval, true);
            self.sweep();
        }
        Ok(())
    }

    /// Disconnects our client. Does nothing if not connected.
    pub fn disconnect_client(&self) {
        self.graph.disconnect();
    }

    /// Starts the server through the launcher with the configured format,
    /// then probes for it immediately.
    ///
    /// # Errors
    ///
    /// Returns `Launcher` if no launcher is attached, or the launcher's error.
    pub async fn start_server(&self) -> Result<(), LinkError> {
        let launcher = self.launcher()?;
        let request = LaunchRequest::from_config(&self.config);
        tracing::info!(
            launcher = launcher.name(),
            sample_rate = request.sample_rate,
            buffer_size = request.buffer_size,
            driver = %request.driver,
            "Starting audio server"
        );
        launcher.start(&request).await?;
        self.monitor.request_immediate_probe();
        Ok(())
    }

    /// Disconnects our client and stops the server through the launcher.
    ///
    /// # Errors
    ///
    /// Returns `Launcher` if no launcher is attached, or the launcher's error.
    pub async fn stop_server(&self) -> Result<(), LinkError> {
        let launcher = self.launcher()?;
        self.graph.disconnect();
        launcher.stop().await?;
        self.monitor.mark_server_down();
        tracing::info!(launcher = launcher.name(), "Audio server stopped");
        Ok(())
    }

    /// Restarts the server with a new format.
    ///
    /// If our client was connected, it is reconnected with the same port
    /// counts once the server is back.
    ///
    /// # Errors
    ///
    /// Returns `Launcher` if no launcher is attached, the launcher's error,
    /// or the reconnect error.
    pub async fn restart_server(
        &self,
        sample_rate: u32,
        buffer_size: u32,
    ) -> Result<(), LinkError> {
        let launcher = self.launcher()?;
        let reconnect = self.graph.is_connected().then(|| {
            let name = self
                .requested_name
                .lock()
                .clone()
                .unwrap_or_else(|| self.config.client_name.clone());
            (name, self.graph.input_count(), self.graph.output_count())
        });

        self.graph.disconnect();
        launcher.stop().await?;
        self.monitor.mark_server_down();

        let request =
            LaunchRequest::from_config(&self.config).with_format(sample_rate, buffer_size);
        launcher.start(&request).await?;
        self.monitor.request_immediate_probe();
        tracing::info!(sample_rate, buffer_size, "Audio server restarted");

        match reconnect {
            Some((name, inputs, outputs)) => self.connect_client(&name, inputs, outputs),
            None => Ok(()),
        }
    }

    /// Starts the periodic auto-connect sweep.
    ///
    /// Every `interval`, outputs of every peer client except ourselves and
    /// the `system` client are connected positionally to our inputs. `enable`
    /// also sets whether newly announced clients are connected immediately.
    /// With `enable` false, any running sweep is stopped.
    pub fn start_auto_connect(&self, interval: Duration, enable: bool) {
        self.graph.set_auto_connect(enable);
        self.stop_auto_connect();
        if !enable {
            return;
        }

        let graph = self.graph.clone();
        let interval = interval.max(Duration::from_millis(1));
        let task = self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                sweep(&graph);
            }
        });
        *self.auto_connect.lock() = Some(task);
        tracing::info!(?interval, "Auto-connect sweep started");
    }

    /// Stops the periodic auto-connect sweep.
    pub fn stop_auto_connect(&self) {
        if let Some(task) = self.auto_connect.lock().take() {
            task.abort();
            tracing::info!("Auto-connect sweep stopped");
        }
    }

    /// Returns true while the auto-connect sweep is running.
    pub fn is_auto_connect_running(&self) -> bool {
        self.auto_connect.lock().is_some()
    }

    /// Runs one auto-connect sweep now. Returns the number of new connections.
    pub fn sweep(&self) -> usize {
        sweep(&self.graph)
    }

    /// Returns a status snapshot.
    pub fn status(&self) -> LinkStatus {
        LinkStatus {
            server: self.monitor.state(),
            connected: self.graph.is_connected(),
            active: self.graph.is_active(),
            client_name: self.graph.client_name(),
            inputs: self.graph.input_count(),
            outputs: self.graph.output_count(),
            cpu_load: self.graph.cpu_load(),
            auto_connect_running: self.is_auto_connect_running(),
            stats: self.graph.stats(),
        }
    }

    /// Stops the sweep, disconnects, stops the monitor, and stops the
    /// server when `kill_server_on_shutdown` is set and it is running.
    ///
    /// # Errors
    ///
    /// Returns the launcher's error if stopping the server fails.
    pub async fn shutdown(&self) -> Result<(), LinkError> {
        self.stop_auto_connect();
        self.graph.disconnect();
        self.monitor.stop();

        if self.config.kill_server_on_shutdown {
            if let Some(launcher) = &self.launcher {
                if launcher.is_running().await {
                    launcher.stop().await?;
                    tracing::info!(launcher = launcher.name(), "Audio server stopped on shutdown");
                }
            }
        }
        tracing::info!("Link shut down");
        Ok(())
    }

    fn launcher(&self) -> Result<&Arc<dyn ServerLauncher>, LinkError> {
        self.launcher
            .as_ref()
            .ok_or_else(|| LinkError::launcher("no server launcher configured"))
    }
}

impl Drop for LinkContext {
    fn drop(&mut self) {
        if let Some(task) = self.auto_connect.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for LinkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkContext")
            .field("graph", &self.graph)
            .field("monitor", &self.monitor)
            .field("launcher", &self.launcher.as_ref().map(|l| l.name().to_string()))
            .finish_non_exhaustive()
    }
}

fn sweep(graph: &GraphManager) -> usize {
    let Some(own_name) = graph.client_name() else {
        return 0;
    };
    if graph.input_count() == 0 {
        return 0;
    }
    graph
        .all_clients()
        .iter()
        .filter(|client| client.as_str() != own_name && client.as_str() != SYSTEM_CLIENT)
        .map(|client| graph.auto_connect_to_client(client))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{
        DummyLauncher, DummyServer, OpenOptions, PortDirection, ServerConnection,
    };

    fn context(server: &DummyServer) -> LinkContext {
        LinkContext::new(
            Arc::new(server.clone()),
            LinkConfig {
                auto_start_server: false,
                ..Default::default()
            },
            Handle::current(),
        )
    }

    fn peer(server: &DummyServer, name: &str, outputs: usize) -> Box<dyn ServerConnection> {
        let mut connection = server.open(name, OpenOptions::default()).unwrap().connection;
        for n in 1..=outputs {
            connection
                .register_port(&format!("out_{n}"), PortDirection::Output)
                .unwrap();
        }
        connection
    }

    #[tokio::test]
    async fn test_connect_client_registers_and_activates() {
        let server = DummyServer::default();
        let context = context(&server);

        context.connect_client("engine", 3, 1).unwrap();

        let status = context.status();
        assert!(status.connected);
        assert!(status.active);
        assert_eq!(status.client_name.as_deref(), Some("engine"));
        assert_eq!((status.inputs, status.outputs), (3, 1));
        assert!(server
            .port_names()
            .contains(&"engine:link_in_3".to_string()));

        context.disconnect_client();
        assert!(!context.status().connected);
        assert!(server.port_names().is_empty());
    }

    #[tokio::test]
    async fn test_connect_client_without_server() {
        let server = DummyServer::default();
        server.shutdown();
        let context = context(&server);

        assert!(matches!(
            context.connect_client("engine", 2, 2),
            Err(LinkError::ServerUnavailable { .. })
        ));
        assert!(!context.status().connected);
    }

    #[tokio::test]
    async fn test_sweep_skips_self_and_system() {
        let server = DummyServer::default().with_system_ports(2, 2);
        let _synth = peer(&server, "synth", 2);
        let context = context(&server);
        context.connect_client("engine", 2, 2).unwrap();

        assert_eq!(context.sweep(), 2);
        assert!(server.is_linked("synth:out_1", "engine:link_in_1"));
        assert!(server.is_linked("synth:out_2", "engine:link_in_2"));
        assert!(!server.is_linked("system:capture_1", "engine:link_in_1"));
        // already connected pairs are skipped
        assert_eq!(context.sweep(), 0);
    }

    #[tokio::test]
    async fn test_sweep_without_client_is_noop() {
        let server = DummyServer::default();
        let _synth = peer(&server, "synth", 2);
        let context = context(&server);

        assert_eq!(context.sweep(), 0);
    }

    #[tokio::test]
    async fn test_auto_connect_task_lifecycle() {
        let server = DummyServer::default();
        let context = context(&server);
        context.connect_client("engine", 2, 2).unwrap();

        context.start_auto_connect(Duration::from_millis(10), true);
        assert!(context.is_auto_connect_running());
        assert!(context.graph().auto_connect_enabled());

        let _late = peer(&server, "late", 1);
        for _ in 0..100 {
            if server.is_linked("late:out_1", "engine:link_in_1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(server.is_linked("late:out_1", "engine:link_in_1"));

        context.start_auto_connect(Duration::from_millis(10), false);
        assert!(!context.is_auto_connect_running());
        assert!(!context.graph().auto_connect_enabled());
    }

    #[tokio::test]
    async fn test_connect_configured_uses_settings() {
        let server = DummyServer::default();
        let _synth = peer(&server, "synth", 2);
        let config = LinkConfig::from_toml_str(
            r#"
            auto_start_server = false
            client_name = "rig"
            port_base_name = "bus"
            input_channels = 4
            output_channels = 3
            client_monitor_interval = "50ms"
            "#,
        )
        .unwrap();
        let context = LinkContext::new(Arc::new(server.clone()), config, Handle::current());

        context.connect_configured().unwrap();

        let status = context.status();
        assert_eq!(status.client_name.as_deref(), Some("rig"));
        assert_eq!((status.inputs, status.outputs), (4, 3));
        assert!(status.auto_connect_running);
        assert!(server.is_linked("synth:out_2", "rig:bus_in_2"));

        let _late = peer(&server, "late", 1);
        for _ in 0..100 {
            if server.is_linked("late:out_1", "rig:bus_in_1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(server.is_linked("late:out_1", "rig:bus_in_1"));
        context.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_configured_without_auto_connect() {
        let server = DummyServer::default();
        let context = LinkContext::new(
            Arc::new(server.clone()),
            LinkConfig {
                auto_start_server: false,
                auto_connect: false,
                input_channels: 0,
                ..Default::default()
            },
            Handle::current(),
        );

        context.connect_configured().unwrap();

        let status = context.status();
        assert_eq!(status.client_name.as_deref(), Some("audio-graph-link"));
        // validated() clamps the channel count to 1
        assert_eq!((status.inputs, status.outputs), (1, 2));
        assert!(!status.auto_connect_running);
    }

    #[tokio::test]
    async fn test_server_control_requires_launcher() {
        let server = DummyServer::default();
        let context = context(&server);

        assert!(matches!(
            context.start_server().await,
            Err(LinkError::Launcher(_))
        ));
        assert!(matches!(
            context.restart_server(44100, 256).await,
            Err(LinkError::Launcher(_))
        ));
    }

    #[tokio::test]
    async fn test_restart_server_reconnects_with_new_format() {
        let server = DummyServer::new(48000, 512);
        let context =
            context(&server).with_launcher(Arc::new(DummyLauncher::new(server.clone())));
        context.start().await.unwrap();
        context.connect_client("engine", 2, 1).unwrap();

        context.restart_server(96000, 128).await.unwrap();

        let status = context.status();
        assert!(status.active);
        assert_eq!(status.client_name.as_deref(), Some("engine"));
        assert_eq!((status.inputs, status.outputs), (2, 1));
        assert_eq!(context.graph().sample_rate(), 96000);
        assert_eq!(status.server.sample_rate, 96000);
        assert_eq!(status.server.buffer_size, 128);
        context.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_server_marks_down() {
        let server = DummyServer::default();
        let context =
            context(&server).with_launcher(Arc::new(DummyLauncher::new(server.clone())));
        context.start().await.unwrap();
        assert!(context.status().server.available);

        context.stop_server().await.unwrap();
        assert!(!server.is_running());
        assert!(!context.status().server.available);

        context.start_server().await.unwrap();
        assert!(context.status().server.available);
        context.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_honours_kill_policy() {
        for kill in [false, true] {
            let server = DummyServer::default();
            let context = LinkContext::new(
                Arc::new(server.clone()),
                LinkConfig {
                    kill_server_on_shutdown: kill,
                    ..Default::default()
                },
                Handle::current(),
            )
            .with_launcher(Arc::new(DummyLauncher::new(server.clone())));
            context.start().await.unwrap();
            context.connect_client("engine", 1, 1).unwrap();

            context.shutdown().await.unwrap();

            assert!(!context.status().connected);
            assert!(!context.monitor().is_active());
            assert_eq!(server.is_running(), !kill);
        }
    }
}
