//! Connection graph manager.
//!
//! [`GraphManager`] owns the client connection to the audio server: it
//! registers ports, installs the process callback, exposes per-channel
//! audio I/O, discovery and routing, and turns server notifications into
//! [`LinkEvent`]s.
//!
//! Server notifications reach a per-connection worker task through a
//! bounded channel. The worker owns the
//! [`TopologyNotifier`] and is the only place observers are called from.
//!
//! Teardown order on [`disconnect`](GraphManager::disconnect) is fixed:
//! deactivate, unregister ports, close. When the server itself shuts down
//! the connection is abandoned rather than closed.

mod bridge;
mod topology;

pub use topology::TopologyNotifier;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::pipeline::{port_short_name, Port, PortProcessor, PortTable};
use crate::server::{
    client_of, AudioServer, OpenOptions, PortDirection, PortFlags, ServerConnection,
    DEFAULT_AUDIO_TYPE,
};
use crate::{EventCallback, LinkConfig, LinkError, LinkEvent};
use bridge::{CallbackBridge, LinkCounters, ServerNotification, NOTIFICATION_QUEUE_CAPACITY};

/// Statistics about the current connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Xruns reported by the server.
    pub xruns: u64,
    /// Notifications dropped because the hand-off queue was full.
    pub dropped_notifications: u64,
    /// Process cycles skipped while ports were being re-registered.
    pub skipped_cycles: u64,
    /// Samples dropped by overwrite-on-full across all port ring buffers.
    pub ring_overruns: u64,
}

/// A port addressed by (direction, client, 1-based index).
///
/// Index 0 is treated as 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAddress {
    /// Direction of the port on its client.
    pub direction: PortDirection,
    /// Client name.
    pub client: String,
    /// 1-based position among that client's ports of this direction.
    pub index: usize,
}

impl PortAddress {
    /// Creates an address.
    pub fn new(direction: PortDirection, client: impl Into<String>, index: usize) -> Self {
        Self {
            direction,
            client: client.into(),
            index,
        }
    }

    /// Address of an output port.
    pub fn output(client: impl Into<String>, index: usize) -> Self {
        Self::new(PortDirection::Output, client, index)
    }

    /// Address of an input port.
    pub fn input(client: impl Into<String>, index: usize) -> Self {
        Self::new(PortDirection::Input, client, index)
    }
}

impl std::fmt::Display for PortAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} #{}", self.client, self.direction, self.index)
    }
}

/// Owner of the connection to the audio graph server.
///
/// Cloning is cheap; every clone manages the same connection.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use audio_graph_link::{DummyServer, GraphManager, LinkConfig};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), audio_graph_link::LinkError> {
/// let server = DummyServer::new(48000, 256);
/// let graph = GraphManager::new(
///     Arc::new(server.clone()),
///     &LinkConfig::default(),
///     tokio::runtime::Handle::current(),
/// );
///
/// graph.connect("engine")?;
/// graph.register_audio_ports(2, 2, "unreal")?;
/// graph.activate()?;
///
/// graph.write_audio_buffer(0, &[0.25; 256])?;
/// server.run_cycle();
/// assert_eq!(server.read_port("engine:unreal_out_1"), Some(vec![0.25; 256]));
///
/// graph.disconnect();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct GraphManager {
    inner: Arc<Inner>,
}

struct Inner {
    server: Arc<dyn AudioServer>,
    runtime: Handle,
    ring_capacity: usize,
    auto_connect: AtomicBool,
    client: Mutex<Option<ClientState>>,
    ports: Arc<RwLock<PortTable>>,
    observers: RwLock<Vec<EventCallback>>,
    counters: Arc<LinkCounters>,
    generation: AtomicU64,
}

struct ClientState {
    connection: Box<dyn ServerConnection>,
    generation: u64,
    alive: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

impl ClientState {
    /// Deactivate, unregister every port, close.
    fn teardown(self, ports: &RwLock<PortTable>) -> String {
        let ClientState {
            mut connection,
            alive,
            worker,
            ..
        } = self;
        alive.store(false, Ordering::SeqCst);
        let name = connection.client_name().to_string();

        if let Err(e) = connection.deactivate() {
            tracing::debug!(client = %name, error = %e, "Deactivate failed during teardown");
        }
        unregister_ports(connection.as_mut(), ports);
        connection.close();
        worker.abort();
        name
    }
}

fn unregister_ports(connection: &mut dyn ServerConnection, ports: &RwLock<PortTable>) {
    let ids = ports.write().take_all();
    for id in ids {
        if let Err(e) = connection.unregister_port(id) {
            tracing::debug!(port = id.0, error = %e, "Failed to unregister port");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(state) = self.client.get_mut().take() {
            state.teardown(&self.ports);
        }
    }
}

impl GraphManager {
    /// Creates a disconnected manager.
    ///
    /// Notification workers are spawned on `runtime`.
    pub fn new(server: Arc<dyn AudioServer>, config: &LinkConfig, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                server,
                runtime,
                ring_capacity: config.ring_buffer_capacity.max(1),
                auto_connect: AtomicBool::new(config.auto_connect),
                client: Mutex::new(None),
                ports: Arc::new(RwLock::new(PortTable::new())),
                observers: RwLock::new(Vec::new()),
                counters: Arc::new(LinkCounters::default()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Opens the client connection. Succeeds immediately if already connected.
    ///
    /// # Errors
    ///
    /// Returns the server's error if the client cannot be opened or its
    /// callbacks cannot be installed.
    pub fn connect(&self, client_name: &str) -> Result<(), LinkError> {
        let mut client = self.inner.client.lock();
        if client.is_some() {
            tracing::debug!(client = client_name, "Already connected");
            return Ok(());
        }

        let opened = self
            .inner
            .server
            .open(client_name, OpenOptions::default())
            .map_err(|e| {
                tracing::warn!(client = client_name, error = %e, "Failed to open client");
                e
            })?;
        let mut connection = opened.connection;
        let name = connection.client_name().to_string();
        if opened.status.name_not_unique {
            tracing::info!(
                requested = client_name,
                assigned = %name,
                "Server assigned a unique client name"
            );
        }

        self.inner.counters.reset();
        let (tx, rx) = mpsc::channel(NOTIFICATION_QUEUE_CAPACITY);
        let shutdown = Arc::new(Notify::new());
        let bridge = CallbackBridge::new(
            name.clone(),
            tx,
            Arc::clone(&shutdown),
            Arc::clone(&self.inner.counters),
        );
        let processor = PortProcessor::new(
            Arc::clone(&self.inner.ports),
            Arc::clone(&self.inner.counters.skipped_cycles),
        );
        let installed = connection
            .set_notification_handler(Arc::new(bridge))
            .and_then(|()| connection.set_process_handler(Box::new(processor)));
        if let Err(e) = installed {
            tracing::warn!(client = %name, error = %e, "Failed to install callbacks");
            connection.close();
            return Err(e);
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let alive = Arc::new(AtomicBool::new(true));
        let worker = self.inner.runtime.spawn(run_worker(
            Arc::downgrade(&self.inner),
            rx,
            shutdown,
            Arc::clone(&alive),
            generation,
            name.clone(),
        ));

        *client = Some(ClientState {
            connection,
            generation,
            alive,
            worker,
        });
        tracing::info!(client = %name, "Connected to audio server");
        Ok(())
    }

    /// Deactivates, unregisters all ports and closes the connection.
    ///
    /// Does nothing if not connected.
    pub fn disconnect(&self) {
        let Some(state) = self.inner.client.lock().take() else {
            return;
        };
        let name = state.teardown(&self.inner.ports);
        tracing::info!(client = %name, "Disconnected from audio server");
    }

    /// Returns true while a client connection is open.
    pub fn is_connected(&self) -> bool {
        self.inner.client.lock().is_some()
    }

    /// Starts the process callback and notification delivery.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected`, or the server's error if it refuses.
    pub fn activate(&self) -> Result<(), LinkError> {
        let mut client = self.inner.client.lock();
        let state = client.as_mut().ok_or(LinkError::NotConnected)?;
        state.connection.activate().map_err(|e| {
            tracing::warn!(error = %e, "Failed to activate client");
            e
        })?;
        tracing::info!(client = state.connection.client_name(), "Client activated");
        Ok(())
    }

    /// Stops the process callback. No cycle runs after this returns.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected`, or the server's error if it refuses.
    pub fn deactivate(&self) -> Result<(), LinkError> {
        let mut client = self.inner.client.lock();
        let state = client.as_mut().ok_or(LinkError::NotConnected)?;
        state.connection.deactivate()?;
        tracing::info!(client = state.connection.client_name(), "Client deactivated");
        Ok(())
    }

    /// Returns true while the client is active.
    pub fn is_active(&self) -> bool {
        self.inner
            .client
            .lock()
            .as_ref()
            .is_some_and(|state| state.connection.is_active())
    }

    /// Replaces all ports with `inputs` inputs and `outputs` outputs named
    /// `{base}_in_{n}` / `{base}_out_{n}`.
    ///
    /// Ports the server refuses are skipped; compare
    /// [`input_count`](Self::input_count) / [`output_count`](Self::output_count)
    /// with the request to detect partial registration.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` if there is no connection.
    pub fn register_audio_ports(
        &self,
        inputs: usize,
        outputs: usize,
        base: &str,
    ) -> Result<(), LinkError> {
        let mut client = self.inner.client.lock();
        let state = client.as_mut().ok_or(LinkError::NotConnected)?;
        let connection = state.connection.as_mut();

        unregister_ports(connection, &self.inner.ports);

        let mut table = PortTable::new();
        for (direction, count) in [(PortDirection::Input, inputs), (PortDirection::Output, outputs)]
        {
            for index in 1..=count {
                let short_name = port_short_name(base, direction, index);
                match connection.register_port(&short_name, direction) {
                    Ok(id) => {
                        let full_name = connection.port_name(id).unwrap_or_else(|| {
                            format!("{}:{short_name}", connection.client_name())
                        });
                        table.set_mut(direction).push(Port::new(
                            short_name,
                            full_name,
                            direction,
                            id,
                            self.inner.ring_capacity,
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(port = %short_name, error = %e, "Skipping port");
                    }
                }
            }
        }

        let registered = (table.inputs.len(), table.outputs.len());
        *self.inner.ports.write() = table;

        tracing::info!(
            requested_inputs = inputs,
            requested_outputs = outputs,
            inputs = registered.0,
            outputs = registered.1,
            "Registered audio ports"
        );
        Ok(())
    }

    /// Unregisters every port and drops their ring buffers.
    ///
    /// Safe to call without a connection.
    pub fn unregister_all_ports(&self) {
        let mut client = self.inner.client.lock();
        match client.as_mut() {
            Some(state) => unregister_ports(state.connection.as_mut(), &self.inner.ports),
            None => {
                self.inner.ports.write().take_all();
            }
        }
    }

    /// Number of registered input ports.
    pub fn input_count(&self) -> usize {
        self.inner.ports.read().inputs.len()
    }

    /// Number of registered output ports.
    pub fn output_count(&self) -> usize {
        self.inner.ports.read().outputs.len()
    }

    /// Full names of our input ports, in channel order.
    pub fn input_port_names(&self) -> Vec<String> {
        self.inner.ports.read().inputs.full_names()
    }

    /// Full names of our output ports, in channel order.
    pub fn output_port_names(&self) -> Vec<String> {
        self.inner.ports.read().outputs.full_names()
    }

    /// Pulls `n` samples from input channel `channel` (0-based).
    ///
    /// Missing samples are zero-filled. Returns an empty vector for an
    /// unknown channel.
    pub fn read_audio_buffer(&self, channel: usize, n: usize) -> Vec<f32> {
        let ports = self.inner.ports.read();
        let Some(port) = ports.inputs.get(channel) else {
            return Vec::new();
        };
        let mut out = vec![0.0; n];
        port.buffer().read(&mut out);
        out
    }

    /// Pulls samples from input channel `channel` into `out`.
    ///
    /// Returns the number of real samples copied, or `None` for an unknown
    /// channel.
    pub fn read_audio_into(&self, channel: usize, out: &mut [f32]) -> Option<usize> {
        let ports = self.inner.ports.read();
        ports.inputs.get(channel).map(|port| port.buffer().read(out))
    }

    /// Pushes samples to output channel `channel` (0-based).
    ///
    /// # Errors
    ///
    /// Returns `ChannelOutOfRange` for an unknown channel.
    pub fn write_audio_buffer(&self, channel: usize, data: &[f32]) -> Result<(), LinkError> {
        let ports = self.inner.ports.read();
        let port = ports
            .outputs
            .get(channel)
            .ok_or(LinkError::ChannelOutOfRange {
                direction: PortDirection::Output,
                index: channel,
                available: ports.outputs.len(),
            })?;
        port.buffer().write(data);
        Ok(())
    }

    /// RMS of the recent samples queued on input channel `channel`.
    ///
    /// Returns 0.0 for an unknown channel.
    pub fn input_level(&self, channel: usize) -> f32 {
        self.inner
            .ports
            .read()
            .inputs
            .get(channel)
            .map_or(0.0, |port| port.buffer().rms_level())
    }

    /// Lists full port names matching the regex patterns and flags.
    ///
    /// Returns an empty vector when not connected.
    pub fn available_ports(
        &self,
        name_pattern: Option<&str>,
        type_pattern: Option<&str>,
        flags: PortFlags,
    ) -> Vec<String> {
        self.inner
            .client
            .lock()
            .as_ref()
            .map(|state| state.connection.ports(name_pattern, type_pattern, flags))
            .unwrap_or_default()
    }

    /// Names of every client with at least one port, sorted and deduplicated.
    pub fn all_clients(&self) -> Vec<String> {
        self.available_ports(None, None, PortFlags::NONE)
            .iter()
            .filter_map(|port| client_of(port))
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Audio input ports of `client`, in server order.
    pub fn client_input_ports(&self, client: &str) -> Vec<String> {
        self.client_ports(client, PortDirection::Input)
    }

    /// Audio output ports of `client`, in server order.
    pub fn client_output_ports(&self, client: &str) -> Vec<String> {
        self.client_ports(client, PortDirection::Output)
    }

    /// `(inputs, outputs)` port counts of `client`.
    pub fn client_port_counts(&self, client: &str) -> (usize, usize) {
        (
            self.client_input_ports(client).len(),
            self.client_output_ports(client).len(),
        )
    }

    fn client_ports(&self, client: &str, direction: PortDirection) -> Vec<String> {
        let pattern = format!("^{}:", regex::escape(client));
        self.available_ports(Some(&pattern), Some(DEFAULT_AUDIO_TYPE), direction.flag())
    }

    /// Connects an output port to an input port by full name.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected`, or `RoutingRejected` if the server refuses.
    pub fn connect_ports(&self, source: &str, destination: &str) -> Result<(), LinkError> {
        self.route(source, destination, true).map_err(|e| {
            tracing::warn!(source, destination, error = %e, "Port connection rejected");
            e
        })?;
        tracing::info!(source, destination, "Ports connected");
        Ok(())
    }

    /// Removes a connection by full port names.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected`, or `RoutingRejected` if the server refuses.
    pub fn disconnect_ports(&self, source: &str, destination: &str) -> Result<(), LinkError> {
        self.route(source, destination, false).map_err(|e| {
            tracing::warn!(source, destination, error = %e, "Port disconnection rejected");
            e
        })?;
        tracing::info!(source, destination, "Ports disconnected");
        Ok(())
    }

    fn route(&self, source: &str, destination: &str, connect: bool) -> Result<(), LinkError> {
        let client = self.inner.client.lock();
        let state = client.as_ref().ok_or(LinkError::NotConnected)?;
        if connect {
            state.connection.connect_ports(source, destination)
        } else {
            state.connection.disconnect_ports(source, destination)
        }
    }

    /// Connects `client`'s outputs to our inputs positionally.
    ///
    /// Best effort: pairs the server rejects (typically already connected)
    /// are skipped. Returns the number of new connections.
    pub fn auto_connect_to_client(&self, client: &str) -> usize {
        let sources = self.client_output_ports(client);
        let destinations = self.input_port_names();

        let mut connected = 0;
        for (source, destination) in sources.iter().zip(&destinations) {
            match self.route(source, destination, true) {
                Ok(()) => connected += 1,
                Err(e) => {
                    tracing::trace!(%source, %destination, error = %e, "Auto-connect skipped");
                }
            }
        }
        if connected > 0 {
            tracing::info!(client, connected, "Auto-connected client");
        }
        connected
    }

    /// Enables or disables auto-connect of newly announced clients.
    pub fn set_auto_connect(&self, enabled: bool) {
        self.inner.auto_connect.store(enabled, Ordering::SeqCst);
    }

    /// Returns true if newly announced clients are auto-connected.
    pub fn auto_connect_enabled(&self) -> bool {
        self.inner.auto_connect.load(Ordering::SeqCst)
    }

    /// Full name of the port at `(direction, client, index)`.
    ///
    /// `index` is 1-based; 0 is treated as 1.
    pub fn port_by_index(
        &self,
        direction: PortDirection,
        client: &str,
        index: usize,
    ) -> Option<String> {
        let index = index.max(1);
        self.client_ports(client, direction).into_iter().nth(index - 1)
    }

    /// Connects two ports addressed by index.
    ///
    /// # Errors
    ///
    /// `InvalidDirection` unless `source` is an output and `destination` an
    /// input (checked before any lookup), `PortNotFound` if an address does
    /// not resolve, or the routing error from the server.
    pub fn connect_ports_by_index(
        &self,
        source: &PortAddress,
        destination: &PortAddress,
    ) -> Result<(), LinkError> {
        let (source, destination) = self.resolve_route(source, destination)?;
        self.connect_ports(&source, &destination)
    }

    /// Removes a connection between two ports addressed by index.
    ///
    /// # Errors
    ///
    /// Same as [`connect_ports_by_index`](Self::connect_ports_by_index).
    pub fn disconnect_ports_by_index(
        &self,
        source: &PortAddress,
        destination: &PortAddress,
    ) -> Result<(), LinkError> {
        let (source, destination) = self.resolve_route(source, destination)?;
        self.disconnect_ports(&source, &destination)
    }

    fn resolve_route(
        &self,
        source: &PortAddress,
        destination: &PortAddress,
    ) -> Result<(String, String), LinkError> {
        if source.direction != PortDirection::Output
            || destination.direction != PortDirection::Input
        {
            tracing::warn!(
                source = %source,
                destination = %destination,
                "Routing needs an output source and an input destination"
            );
            return Err(LinkError::InvalidDirection {
                source_direction: source.direction,
                destination_direction: destination.direction,
            });
        }

        let resolve = |address: &PortAddress| {
            self.port_by_index(address.direction, &address.client, address.index)
                .ok_or_else(|| {
                    tracing::warn!(address = %address, "No port at address");
                    LinkError::PortNotFound {
                        client: address.client.clone(),
                        direction: address.direction,
                        index: address.index.max(1),
                    }
                })
        };
        Ok((resolve(source)?, resolve(destination)?))
    }

    /// Name the server assigned to our client.
    pub fn client_name(&self) -> Option<String> {
        self.inner
            .client
            .lock()
            .as_ref()
            .map(|state| state.connection.client_name().to_string())
    }

    /// Current sample rate, or 0 when not connected.
    pub fn sample_rate(&self) -> u32 {
        self.with_connection(|c| c.sample_rate()).unwrap_or(0)
    }

    /// Current period size, or 0 when not connected.
    pub fn buffer_size(&self) -> u32 {
        self.with_connection(|c| c.buffer_size()).unwrap_or(0)
    }

    /// Server DSP load in percent, or 0.0 when not connected.
    pub fn cpu_load(&self) -> f32 {
        self.with_connection(|c| c.cpu_load()).unwrap_or(0.0)
    }

    fn with_connection<T>(&self, f: impl FnOnce(&dyn ServerConnection) -> T) -> Option<T> {
        self.inner
            .client
            .lock()
            .as_ref()
            .map(|state| f(state.connection.as_ref()))
    }

    /// Xruns reported on the current connection.
    pub fn xrun_count(&self) -> u64 {
        self.inner.counters.xruns.load(Ordering::Relaxed)
    }

    /// Returns current connection statistics.
    pub fn stats(&self) -> LinkStats {
        let counters = &self.inner.counters;
        LinkStats {
            xruns: counters.xruns.load(Ordering::Relaxed),
            dropped_notifications: counters.dropped_notifications.load(Ordering::Relaxed),
            skipped_cycles: counters.skipped_cycles.load(Ordering::Relaxed),
            ring_overruns: self.inner.ports.read().total_overruns(),
        }
    }

    /// Registers an observer for [`LinkEvent`]s.
    ///
    /// Observers run on the notification worker, never on a server thread.
    pub fn on_event(&self, callback: EventCallback) {
        self.inner.observers.write().push(callback);
    }

    fn emit(&self, event: LinkEvent) {
        let observers = self.inner.observers.read().clone();
        for observer in observers {
            observer(event.clone());
        }
    }

    fn handle_notification(
        &self,
        topology: &mut TopologyNotifier,
        notification: ServerNotification,
    ) {
        match notification {
            ServerNotification::Xrun => {
                let total = self.xrun_count();
                tracing::debug!(total, "Xrun");
                self.emit(LinkEvent::Xrun { total });
            }
            ServerNotification::PortRegistration {
                client,
                registered: true,
            } => {
                let Some(event) = topology.port_registered(&client, |c| self.client_port_counts(c))
                else {
                    return;
                };
                tracing::info!(client = %client, "Client connected");
                self.emit(event);
                if self.auto_connect_enabled() {
                    self.auto_connect_to_client(&client);
                }
            }
            ServerNotification::PortRegistration {
                client,
                registered: false,
            } => {
                if let Some(event) =
                    topology.port_unregistered(&client, |c| self.client_port_counts(c))
                {
                    tracing::info!(client = %client, "Client disconnected");
                    self.emit(event);
                }
            }
            ServerNotification::ClientRegistration {
                client,
                registered: false,
            } => {
                if let Some(event) = topology.client_unregistered(&client) {
                    tracing::info!(client = %client, "Client unregistered");
                    self.emit(event);
                }
            }
            ServerNotification::ClientRegistration {
                client,
                registered: true,
            } => {
                tracing::debug!(client = %client, "Client registered");
            }
            ServerNotification::SampleRate(sample_rate) => {
                tracing::info!(sample_rate, "Sample rate changed");
                self.emit(LinkEvent::SampleRateChanged { sample_rate });
            }
            ServerNotification::BufferSize(buffer_size) => {
                tracing::info!(buffer_size, "Buffer size changed");
                self.emit(LinkEvent::BufferSizeChanged { buffer_size });
            }
        }
    }

    fn report_drops(&self, reported: &mut u64) {
        let dropped = self
            .inner
            .counters
            .dropped_notifications
            .load(Ordering::Relaxed);
        if dropped > *reported {
            *reported = dropped;
            tracing::warn!(dropped, "Server notifications dropped");
            self.emit(LinkEvent::NotificationsDropped { dropped });
        }
    }

    /// The server shut down underneath connection `generation`.
    fn connection_lost(&self, generation: u64) {
        let state = {
            let mut client = self.inner.client.lock();
            match client.as_ref() {
                Some(state) if state.generation == generation => client.take(),
                _ => None,
            }
        };
        let Some(state) = state else {
            return;
        };

        state.alive.store(false, Ordering::SeqCst);
        self.inner.ports.write().take_all();
        let name = state.connection.client_name().to_string();
        state.connection.abandon();

        tracing::warn!(client = %name, "Audio server shut down; connection lost");
        self.emit(LinkEvent::ConnectionLost);
    }
}

impl std::fmt::Debug for GraphManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphManager")
            .field("client", &self.client_name())
            .field("inputs", &self.input_count())
            .field("outputs", &self.output_count())
            .finish()
    }
}

async fn run_worker(
    inner: Weak<Inner>,
    mut rx: mpsc::Receiver<ServerNotification>,
    shutdown: Arc<Notify>,
    alive: Arc<AtomicBool>,
    generation: u64,
    own_name: String,
) {
    let mut topology = TopologyNotifier::new(own_name);
    let mut reported_drops = 0;
    let manager = |inner: &Weak<Inner>| inner.upgrade().map(|inner| GraphManager { inner });

    loop {
        tokio::select! {
            biased;
            () = shutdown.notified() => {
                if alive.load(Ordering::SeqCst) {
                    if let Some(manager) = manager(&inner) {
                        manager.connection_lost(generation);
                    }
                }
                break;
            }
            notification = rx.recv() => {
                let Some(notification) = notification else {
                    break;
                };
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                let Some(manager) = manager(&inner) else {
                    break;
                };
                manager.report_drops(&mut reported_drops);
                manager.handle_notification(&mut topology, notification);
            }
        }
    }
}
