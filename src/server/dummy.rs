//! In-process audio graph server.
//!
//! [`DummyServer`] keeps clients, ports and connections in memory and runs
//! the process cycle on demand ([`DummyServer::run_cycle`]) or from a
//! background driver thread. It is the stand-in backend for tests and for
//! running the link without an external server.
//!
//! Cycle order:
//!
//! 1. Output ports of clients without a process handler take any samples
//!    queued with [`DummyServer::write_port`], or silence.
//! 2. Every input port receives its queued samples (if any) plus the sum of
//!    all output ports connected to it.
//! 3. Each active client with a process handler has its outputs zeroed and
//!    its handler invoked.
//!
//! Notifications are delivered after the graph lock is released.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use regex::Regex;

use super::{
    AudioServer, NotificationHandler, OpenOptions, OpenStatus, OpenedClient, PortDirection,
    PortFlags, PortId, ProcessHandler, ProcessScope, ServerConnection, DEFAULT_AUDIO_TYPE,
    SYSTEM_CLIENT,
};
use crate::LinkError;

/// Highest numeric suffix tried when making a client name unique.
const MAX_NAME_SUFFIX: u32 = 99;

type ClientKey = u64;

/// An in-memory audio graph server.
///
/// Cloning is cheap and every clone drives the same graph.
///
/// # Example
///
/// ```
/// use audio_graph_link::server::{
///     AudioServer, DummyServer, OpenOptions, PortDirection, ServerConnection,
/// };
///
/// let server = DummyServer::new(48000, 256);
/// let mut client = server.open("synth", OpenOptions::default()).unwrap().connection;
/// client.register_port("out_1", PortDirection::Output).unwrap();
///
/// assert_eq!(server.port_names(), vec!["synth:out_1".to_string()]);
/// ```
#[derive(Clone)]
pub struct DummyServer {
    shared: Arc<Shared>,
}

struct Shared {
    graph: Mutex<Graph>,
    port_queries: AtomicU64,
    driver_running: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

struct Graph {
    running: bool,
    epoch: u64,
    sample_rate: u32,
    buffer_size: u32,
    cpu_load: f32,
    system_ports: (usize, usize),
    next_client: ClientKey,
    next_port: u32,
    clients: BTreeMap<ClientKey, ClientSlot>,
    ports: BTreeMap<PortId, PortSlot>,
    /// (output, input) pairs.
    links: BTreeSet<(PortId, PortId)>,
}

struct ClientSlot {
    name: String,
    active: bool,
    notifications: Option<Arc<dyn NotificationHandler>>,
    process: Option<Box<dyn ProcessHandler>>,
}

struct PortSlot {
    owner: ClientKey,
    full_name: String,
    direction: PortDirection,
    flags: PortFlags,
    buffer: Vec<f32>,
    pending: Option<Vec<f32>>,
}

#[derive(Clone)]
enum Notice {
    Xrun,
    Client(String, bool),
    Port(String, bool),
    SampleRate(u32),
    BufferSize(u32),
}

type Deliveries = Vec<(Arc<dyn NotificationHandler>, Notice)>;

fn deliver(deliveries: Deliveries) {
    for (handler, notice) in deliveries {
        match notice {
            Notice::Xrun => handler.xrun(),
            Notice::Client(name, registered) => handler.client_registration(&name, registered),
            Notice::Port(name, registered) => handler.port_registration(&name, registered),
            Notice::SampleRate(rate) => handler.sample_rate_changed(rate),
            Notice::BufferSize(size) => handler.buffer_size_changed(size),
        }
    }
}

impl Graph {
    fn new(sample_rate: u32, buffer_size: u32) -> Self {
        Self {
            running: true,
            epoch: 0,
            sample_rate,
            buffer_size,
            cpu_load: 0.0,
            system_ports: (0, 0),
            next_client: 0,
            next_port: 0,
            clients: BTreeMap::new(),
            ports: BTreeMap::new(),
            links: BTreeSet::new(),
        }
    }

    fn client_name_taken(&self, name: &str) -> bool {
        self.clients.values().any(|c| c.name == name)
    }

    fn unique_name(&self, requested: &str) -> Option<(String, bool)> {
        if !self.client_name_taken(requested) {
            return Some((requested.to_string(), false));
        }
        (1..=MAX_NAME_SUFFIX)
            .map(|n| format!("{requested}-{n:02}"))
            .find(|candidate| !self.client_name_taken(candidate))
            .map(|name| (name, true))
    }

    fn add_client(&mut self, name: String) -> ClientKey {
        let key = self.next_client;
        self.next_client += 1;
        self.clients.insert(
            key,
            ClientSlot {
                name,
                active: false,
                notifications: None,
                process: None,
            },
        );
        key
    }

    fn add_port(
        &mut self,
        owner: ClientKey,
        full_name: String,
        direction: PortDirection,
        flags: PortFlags,
    ) -> PortId {
        let id = PortId(self.next_port);
        self.next_port += 1;
        self.ports.insert(
            id,
            PortSlot {
                owner,
                full_name,
                direction,
                flags,
                buffer: vec![0.0; self.buffer_size as usize],
                pending: None,
            },
        );
        id
    }

    fn port_id(&self, full_name: &str) -> Option<PortId> {
        self.ports
            .iter()
            .find(|(_, port)| port.full_name == full_name)
            .map(|(id, _)| *id)
    }

    /// Queues `notice` for every active client with a notification handler.
    fn broadcast(&self, notice: &Notice) -> Deliveries {
        self.clients
            .values()
            .filter(|client| client.active)
            .filter_map(|client| client.notifications.clone())
            .map(|handler| (handler, notice.clone()))
            .collect()
    }

    fn remove_port(&mut self, id: PortId) -> Option<PortSlot> {
        let port = self.ports.remove(&id)?;
        self.links.retain(|(src, dst)| *src != id && *dst != id);
        Some(port)
    }

    fn remove_client(&mut self, key: ClientKey) -> Deliveries {
        let Some(client) = self.clients.remove(&key) else {
            return Vec::new();
        };
        let owned: Vec<PortId> = self
            .ports
            .iter()
            .filter(|(_, port)| port.owner == key)
            .map(|(id, _)| *id)
            .collect();

        let mut deliveries = Vec::new();
        for id in owned {
            if let Some(port) = self.remove_port(id) {
                deliveries.extend(self.broadcast(&Notice::Port(port.full_name, false)));
            }
        }
        deliveries.extend(self.broadcast(&Notice::Client(client.name, false)));
        deliveries
    }

    fn add_system_client(&mut self) {
        let (capture, playback) = self.system_ports;
        if capture == 0 && playback == 0 {
            return;
        }
        let key = self.add_client(SYSTEM_CLIENT.to_string());
        let physical = PortFlags::IS_PHYSICAL | PortFlags::IS_TERMINAL;
        for n in 1..=capture {
            self.add_port(
                key,
                format!("{SYSTEM_CLIENT}:capture_{n}"),
                PortDirection::Output,
                PortFlags::IS_OUTPUT | physical,
            );
        }
        for n in 1..=playback {
            self.add_port(
                key,
                format!("{SYSTEM_CLIENT}:playback_{n}"),
                PortDirection::Input,
                PortFlags::IS_INPUT | physical,
            );
        }
    }

    fn is_processing(&self, key: ClientKey) -> bool {
        self.clients
            .get(&key)
            .is_some_and(|client| client.active && client.process.is_some())
    }
}

/// Buffers for one client during one cycle.
struct CycleScope<'a> {
    client: ClientKey,
    n_frames: usize,
    ports: &'a mut BTreeMap<PortId, PortSlot>,
}

impl ProcessScope for CycleScope<'_> {
    fn n_frames(&self) -> usize {
        self.n_frames
    }

    fn input(&self, port: PortId) -> Option<&[f32]> {
        self.ports
            .get(&port)
            .filter(|p| p.owner == self.client && p.direction == PortDirection::Input)
            .map(|p| p.buffer.as_slice())
    }

    fn output(&mut self, port: PortId) -> Option<&mut [f32]> {
        let client = self.client;
        self.ports
            .get_mut(&port)
            .filter(|p| p.owner == client && p.direction == PortDirection::Output)
            .map(|p| p.buffer.as_mut_slice())
    }

    fn silence_outputs(&mut self) {
        let client = self.client;
        self.ports
            .values_mut()
            .filter(|p| p.owner == client && p.direction == PortDirection::Output)
            .for_each(|p| p.buffer.fill(0.0));
    }
}

impl DummyServer {
    /// Creates a running server with the given format.
    pub fn new(sample_rate: u32, buffer_size: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                graph: Mutex::new(Graph::new(sample_rate, buffer_size)),
                port_queries: AtomicU64::new(0),
                driver_running: AtomicBool::new(false),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Adds a `system` client with physical capture and playback ports.
    ///
    /// The ports are recreated on every [`restart`](Self::restart).
    #[must_use]
    pub fn with_system_ports(self, capture: usize, playback: usize) -> Self {
        {
            let mut graph = self.shared.graph.lock();
            graph.system_ports = (capture, playback);
            if graph.running {
                graph.add_system_client();
            }
        }
        self
    }

    /// Returns true while the server accepts clients.
    pub fn is_running(&self) -> bool {
        self.shared.graph.lock().running
    }

    /// Current sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.shared.graph.lock().sample_rate
    }

    /// Current period size.
    pub fn buffer_size(&self) -> u32 {
        self.shared.graph.lock().buffer_size
    }

    /// Shuts the server down.
    ///
    /// Every client's notification handler receives `shutdown`, then all
    /// clients, ports and connections are discarded.
    pub fn shutdown(&self) {
        let handlers: Vec<Arc<dyn NotificationHandler>> = {
            let mut graph = self.shared.graph.lock();
            if !graph.running {
                return;
            }
            graph.running = false;
            graph.cpu_load = 0.0;
            graph.links.clear();
            graph.ports.clear();
            std::mem::take(&mut graph.clients)
                .into_values()
                .filter_map(|client| client.notifications)
                .collect()
        };

        tracing::info!(clients = handlers.len(), "Dummy server shutting down");
        for handler in handlers {
            handler.shutdown();
        }
    }

    /// Starts a stopped server with its previous format.
    ///
    /// Returns false if it was already running.
    pub fn restart(&self) -> bool {
        let (sample_rate, buffer_size) = {
            let graph = self.shared.graph.lock();
            (graph.sample_rate, graph.buffer_size)
        };
        self.restart_with(sample_rate, buffer_size)
    }

    /// Starts a stopped server with a new format.
    ///
    /// Connections opened before the last shutdown stay dead.
    pub fn restart_with(&self, sample_rate: u32, buffer_size: u32) -> bool {
        let mut graph = self.shared.graph.lock();
        if graph.running {
            return false;
        }
        graph.running = true;
        graph.epoch += 1;
        graph.sample_rate = sample_rate;
        graph.buffer_size = buffer_size;
        graph.add_system_client();
        tracing::info!(sample_rate, buffer_size, "Dummy server started");
        true
    }

    /// Changes the sample rate and notifies active clients.
    pub fn set_sample_rate(&self, sample_rate: u32) {
        let deliveries = {
            let mut graph = self.shared.graph.lock();
            graph.sample_rate = sample_rate;
            graph.broadcast(&Notice::SampleRate(sample_rate))
        };
        deliver(deliveries);
    }

    /// Changes the period size and notifies active clients.
    pub fn set_buffer_size(&self, buffer_size: u32) {
        let deliveries = {
            let mut graph = self.shared.graph.lock();
            graph.buffer_size = buffer_size;
            graph.broadcast(&Notice::BufferSize(buffer_size))
        };
        deliver(deliveries);
    }

    /// Reports an xrun to every active client.
    pub fn simulate_xrun(&self) {
        let deliveries = self.shared.graph.lock().broadcast(&Notice::Xrun);
        deliver(deliveries);
    }

    /// Runs one process cycle.
    ///
    /// Returns the number of process handlers invoked.
    pub fn run_cycle(&self) -> usize {
        let started = Instant::now();
        let mut guard = self.shared.graph.lock();
        if !guard.running {
            return 0;
        }
        let n_frames = guard.buffer_size as usize;
        let period = Duration::from_secs_f64(n_frames as f64 / f64::from(guard.sample_rate.max(1)));

        let passive_outputs: Vec<PortId> = guard
            .ports
            .iter()
            .filter(|(_, port)| {
                port.direction == PortDirection::Output && !guard.is_processing(port.owner)
            })
            .map(|(id, _)| *id)
            .collect();
        let inputs: Vec<PortId> = guard
            .ports
            .iter()
            .filter(|(_, port)| port.direction == PortDirection::Input)
            .map(|(id, _)| *id)
            .collect();

        let graph = &mut *guard;
        for id in passive_outputs {
            if let Some(port) = graph.ports.get_mut(&id) {
                let mut frame = port.pending.take().unwrap_or_default();
                frame.resize(n_frames, 0.0);
                port.buffer = frame;
            }
        }

        for id in inputs {
            let mut frame = graph
                .ports
                .get_mut(&id)
                .and_then(|port| port.pending.take())
                .unwrap_or_default();
            frame.resize(n_frames, 0.0);
            for (src, _) in graph.links.iter().filter(|(_, dst)| *dst == id) {
                if let Some(source) = graph.ports.get(src) {
                    for (out, sample) in frame.iter_mut().zip(&source.buffer) {
                        *out += sample;
                    }
                }
            }
            if let Some(port) = graph.ports.get_mut(&id) {
                port.buffer = frame;
            }
        }

        let mut invoked = 0;
        let Graph { clients, ports, .. } = &mut *graph;
        for (key, client) in clients.iter_mut() {
            if !client.active {
                continue;
            }
            let Some(handler) = client.process.as_mut() else {
                continue;
            };
            for port in ports.values_mut() {
                if port.owner == *key && port.direction == PortDirection::Output {
                    port.buffer.clear();
                    port.buffer.resize(n_frames, 0.0);
                }
            }
            let mut scope = CycleScope {
                client: *key,
                n_frames,
                ports: &mut *ports,
            };
            handler.process(&mut scope);
            invoked += 1;
        }

        graph.cpu_load = (started.elapsed().as_secs_f32() / period.as_secs_f32().max(f32::EPSILON)
            * 100.0)
            .min(100.0);
        invoked
    }

    /// Starts a background thread that runs one cycle per period.
    pub fn start_driver(&self) {
        let mut driver = self.shared.driver.lock();
        if driver.is_some() {
            return;
        }
        self.shared.driver_running.store(true, Ordering::SeqCst);

        let server = self.clone();
        let spawned = std::thread::Builder::new()
            .name("dummy-audio-driver".to_string())
            .spawn(move || {
                while server.shared.driver_running.load(Ordering::SeqCst) {
                    server.run_cycle();
                    std::thread::sleep(server.period());
                }
            });

        match spawned {
            Ok(handle) => *driver = Some(handle),
            Err(e) => {
                self.shared.driver_running.store(false, Ordering::SeqCst);
                tracing::error!(error = %e, "Failed to spawn dummy driver thread");
            }
        }
    }

    /// Stops the driver thread and waits for it to exit.
    pub fn stop_driver(&self) {
        self.shared.driver_running.store(false, Ordering::SeqCst);
        let handle = self.shared.driver.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("Dummy driver thread panicked");
            }
        }
    }

    fn period(&self) -> Duration {
        let graph = self.shared.graph.lock();
        Duration::from_secs_f64(
            f64::from(graph.buffer_size.max(1)) / f64::from(graph.sample_rate.max(1)),
        )
    }

    /// Queues samples for a port, delivered on the next cycle only.
    ///
    /// Works on input ports and on output ports of clients without a
    /// process handler. Returns false if no such port exists.
    pub fn write_port(&self, full_name: &str, samples: &[f32]) -> bool {
        let mut graph = self.shared.graph.lock();
        let Some(id) = graph.port_id(full_name) else {
            return false;
        };
        match graph.ports.get_mut(&id) {
            Some(port) => {
                port.pending = Some(samples.to_vec());
                true
            }
            None => false,
        }
    }

    /// Returns the samples a port carried in the last cycle.
    pub fn read_port(&self, full_name: &str) -> Option<Vec<f32>> {
        let graph = self.shared.graph.lock();
        let id = graph.port_id(full_name)?;
        graph.ports.get(&id).map(|port| port.buffer.clone())
    }

    /// Names of all clients, in registration order.
    pub fn client_names(&self) -> Vec<String> {
        let graph = self.shared.graph.lock();
        graph.clients.values().map(|c| c.name.clone()).collect()
    }

    /// Full names of all ports, in registration order.
    pub fn port_names(&self) -> Vec<String> {
        let graph = self.shared.graph.lock();
        graph.ports.values().map(|p| p.full_name.clone()).collect()
    }

    /// All connections as (source, destination) full names.
    pub fn connections(&self) -> Vec<(String, String)> {
        let graph = self.shared.graph.lock();
        graph
            .links
            .iter()
            .filter_map(|(src, dst)| {
                let src = graph.ports.get(src)?;
                let dst = graph.ports.get(dst)?;
                Some((src.full_name.clone(), dst.full_name.clone()))
            })
            .collect()
    }

    /// Returns true if `source` is connected to `destination`.
    pub fn is_linked(&self, source: &str, destination: &str) -> bool {
        let graph = self.shared.graph.lock();
        match (graph.port_id(source), graph.port_id(destination)) {
            (Some(src), Some(dst)) => graph.links.contains(&(src, dst)),
            _ => false,
        }
    }

    /// Number of port queries served so far.
    pub fn port_queries(&self) -> u64 {
        self.shared.port_queries.load(Ordering::Relaxed)
    }
}

impl Default for DummyServer {
    fn default() -> Self {
        Self::new(48000, 512)
    }
}

impl std::fmt::Debug for DummyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let graph = self.shared.graph.lock();
        f.debug_struct("DummyServer")
            .field("running", &graph.running)
            .field("sample_rate", &graph.sample_rate)
            .field("buffer_size", &graph.buffer_size)
            .field("clients", &graph.clients.len())
            .field("ports", &graph.ports.len())
            .finish()
    }
}

impl AudioServer for DummyServer {
    fn open(&self, client_name: &str, _options: OpenOptions) -> Result<OpenedClient, LinkError> {
        if client_name.is_empty() || client_name.contains(':') {
            return Err(LinkError::unavailable(format!(
                "invalid client name {client_name:?}"
            )));
        }

        let (connection, renamed, deliveries) = {
            let mut graph = self.shared.graph.lock();
            if !graph.running {
                return Err(LinkError::unavailable("server is not running"));
            }
            let (name, renamed) = graph.unique_name(client_name).ok_or_else(|| {
                LinkError::unavailable(format!("no unique name available for {client_name:?}"))
            })?;
            let deliveries = graph.broadcast(&Notice::Client(name.clone(), true));
            let key = graph.add_client(name.clone());
            let connection = DummyConnection {
                shared: Arc::clone(&self.shared),
                key,
                epoch: graph.epoch,
                name,
                released: false,
            };
            (connection, renamed, deliveries)
        };
        deliver(deliveries);

        tracing::debug!(client = %connection.name, renamed, "Dummy client opened");
        Ok(OpenedClient {
            connection: Box::new(connection),
            status: OpenStatus {
                name_not_unique: renamed,
                server_started: false,
            },
        })
    }
}

/// A client connection to a [`DummyServer`].
///
/// Dropping the connection closes it.
pub struct DummyConnection {
    shared: Arc<Shared>,
    key: ClientKey,
    epoch: u64,
    name: String,
    released: bool,
}

impl DummyConnection {
    fn live<'a>(&self, graph: &'a mut Graph) -> Result<&'a mut ClientSlot, LinkError> {
        if !graph.running || graph.epoch != self.epoch {
            return Err(LinkError::unavailable("server is not running"));
        }
        graph.clients.get_mut(&self.key).ok_or(LinkError::NotConnected)
    }

    fn teardown(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        let deliveries = {
            let mut graph = self.shared.graph.lock();
            if graph.epoch != self.epoch {
                return;
            }
            graph.remove_client(self.key)
        };
        deliver(deliveries);
        tracing::debug!(client = %self.name, "Dummy client closed");
    }
}

impl Drop for DummyConnection {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl ServerConnection for DummyConnection {
    fn client_name(&self) -> &str {
        &self.name
    }

    fn sample_rate(&self) -> u32 {
        self.shared.graph.lock().sample_rate
    }

    fn buffer_size(&self) -> u32 {
        self.shared.graph.lock().buffer_size
    }

    fn cpu_load(&self) -> f32 {
        self.shared.graph.lock().cpu_load
    }

    fn set_notification_handler(
        &mut self,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<(), LinkError> {
        let mut graph = self.shared.graph.lock();
        self.live(&mut graph)?.notifications = Some(handler);
        Ok(())
    }

    fn set_process_handler(&mut self, handler: Box<dyn ProcessHandler>) -> Result<(), LinkError> {
        let mut graph = self.shared.graph.lock();
        self.live(&mut graph)?.process = Some(handler);
        Ok(())
    }

    fn activate(&mut self) -> Result<(), LinkError> {
        let mut graph = self.shared.graph.lock();
        let client = self.live(&mut graph).map_err(|e| LinkError::ActivationFailed {
            reason: e.to_string(),
        })?;
        client.active = true;
        Ok(())
    }

    fn deactivate(&mut self) -> Result<(), LinkError> {
        let mut graph = self.shared.graph.lock();
        self.live(&mut graph)?.active = false;
        Ok(())
    }

    fn is_active(&self) -> bool {
        let mut graph = self.shared.graph.lock();
        self.live(&mut graph).is_ok_and(|client| client.active)
    }

    fn register_port(
        &mut self,
        short_name: &str,
        direction: PortDirection,
    ) -> Result<PortId, LinkError> {
        let failed = |reason: String| LinkError::PortRegistrationFailed {
            name: short_name.to_string(),
            reason,
        };
        if short_name.is_empty() || short_name.contains(':') {
            return Err(failed("invalid port name".to_string()));
        }

        let (id, deliveries) = {
            let mut graph = self.shared.graph.lock();
            self.live(&mut graph).map_err(|e| failed(e.to_string()))?;
            let full_name = format!("{}:{short_name}", self.name);
            if graph.port_id(&full_name).is_some() {
                return Err(failed("port name already in use".to_string()));
            }
            let id = graph.add_port(self.key, full_name.clone(), direction, direction.flag());
            (id, graph.broadcast(&Notice::Port(full_name, true)))
        };
        deliver(deliveries);
        Ok(id)
    }

    fn unregister_port(&mut self, port: PortId) -> Result<(), LinkError> {
        let deliveries = {
            let mut graph = self.shared.graph.lock();
            self.live(&mut graph)?;
            if graph.ports.get(&port).map(|p| p.owner) != Some(self.key) {
                return Err(LinkError::backend(format!("port {} not owned by client", port.0)));
            }
            match graph.remove_port(port) {
                Some(removed) => graph.broadcast(&Notice::Port(removed.full_name, false)),
                None => Vec::new(),
            }
        };
        deliver(deliveries);
        Ok(())
    }

    fn port_name(&self, port: PortId) -> Option<String> {
        let graph = self.shared.graph.lock();
        graph
            .ports
            .get(&port)
            .filter(|p| p.owner == self.key)
            .map(|p| p.full_name.clone())
    }

    fn ports(
        &self,
        name_pattern: Option<&str>,
        type_pattern: Option<&str>,
        flags: PortFlags,
    ) -> Vec<String> {
        self.shared.port_queries.fetch_add(1, Ordering::Relaxed);

        let compile = |pattern: Option<&str>| match pattern {
            Some(p) if !p.is_empty() => Regex::new(p).map(Some),
            _ => Ok(None),
        };
        let (Ok(name_re), Ok(type_re)) = (compile(name_pattern), compile(type_pattern)) else {
            return Vec::new();
        };
        if type_re.is_some_and(|re| !re.is_match(DEFAULT_AUDIO_TYPE)) {
            return Vec::new();
        }

        let graph = self.shared.graph.lock();
        if !graph.running || graph.epoch != self.epoch {
            return Vec::new();
        }
        graph
            .ports
            .values()
            .filter(|port| port.flags.contains(flags))
            .filter(|port| name_re.as_ref().map_or(true, |re| re.is_match(&port.full_name)))
            .map(|port| port.full_name.clone())
            .collect()
    }

    fn connect_ports(&self, source: &str, destination: &str) -> Result<(), LinkError> {
        let rejected = |reason: &str| LinkError::routing_rejected(source, destination, reason);
        let mut graph = self.shared.graph.lock();
        self.live(&mut graph).map_err(|e| rejected(&e.to_string()))?;

        let src = graph.port_id(source).ok_or_else(|| rejected("no such source port"))?;
        let dst = graph
            .port_id(destination)
            .ok_or_else(|| rejected("no such destination port"))?;
        let directions = (
            graph.ports.get(&src).map(|p| p.direction),
            graph.ports.get(&dst).map(|p| p.direction),
        );
        if directions != (Some(PortDirection::Output), Some(PortDirection::Input)) {
            return Err(rejected("source must be an output and destination an input"));
        }
        if !graph.links.insert((src, dst)) {
            return Err(rejected("already connected"));
        }
        Ok(())
    }

    fn disconnect_ports(&self, source: &str, destination: &str) -> Result<(), LinkError> {
        let rejected = |reason: &str| LinkError::routing_rejected(source, destination, reason);
        let mut graph = self.shared.graph.lock();
        self.live(&mut graph).map_err(|e| rejected(&e.to_string()))?;

        let (Some(src), Some(dst)) = (graph.port_id(source), graph.port_id(destination)) else {
            return Err(rejected("no such port"));
        };
        if !graph.links.remove(&(src, dst)) {
            return Err(rejected("not connected"));
        }
        Ok(())
    }

    fn close(mut self: Box<Self>) {
        self.teardown();
    }

    fn abandon(mut self: Box<Self>) {
        self.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.log.lock())
        }
    }

    impl NotificationHandler for Recorder {
        fn shutdown(&self) {
            self.log.lock().push("shutdown".to_string());
        }
        fn xrun(&self) {
            self.log.lock().push("xrun".to_string());
        }
        fn client_registration(&self, client: &str, registered: bool) {
            self.log.lock().push(format!("client {client} {registered}"));
        }
        fn port_registration(&self, port: &str, registered: bool) {
            self.log.lock().push(format!("port {port} {registered}"));
        }
        fn sample_rate_changed(&self, sample_rate: u32) {
            self.log.lock().push(format!("rate {sample_rate}"));
        }
    }

    struct Doubler {
        input: PortId,
        output: PortId,
    }

    impl ProcessHandler for Doubler {
        fn process(&mut self, scope: &mut dyn ProcessScope) {
            let mut frame = [0.0f32; 64];
            let n = scope.n_frames().min(frame.len());
            if let Some(input) = scope.input(self.input) {
                frame[..n].copy_from_slice(&input[..n]);
            }
            if let Some(output) = scope.output(self.output) {
                for (o, i) in output.iter_mut().zip(&frame[..n]) {
                    *o = i * 2.0;
                }
            }
        }
    }

    fn open(server: &DummyServer, name: &str) -> Box<dyn ServerConnection> {
        server.open(name, OpenOptions::default()).unwrap().connection
    }

    #[test]
    fn test_open_assigns_unique_names() {
        let server = DummyServer::default();
        let first = server.open("app", OpenOptions::default()).unwrap();
        let second = server.open("app", OpenOptions::default()).unwrap();

        assert!(!first.status.name_not_unique);
        assert!(second.status.name_not_unique);
        assert_eq!(second.connection.client_name(), "app-01");
    }

    #[test]
    fn test_open_fails_when_stopped() {
        let server = DummyServer::default();
        server.shutdown();
        let result = server.open("app", OpenOptions::no_start_server());
        assert!(matches!(result, Err(LinkError::ServerUnavailable { .. })));
    }

    #[test]
    fn test_notifications_reach_active_clients_only() {
        let server = DummyServer::default();
        let recorder = Arc::new(Recorder::default());
        let mut watcher = open(&server, "watcher");
        watcher.set_notification_handler(recorder.clone()).unwrap();

        let mut peer = open(&server, "peer");
        peer.register_port("out_1", PortDirection::Output).unwrap();
        assert!(recorder.take().is_empty());

        watcher.activate().unwrap();
        let id = peer.register_port("out_2", PortDirection::Output).unwrap();
        peer.unregister_port(id).unwrap();
        peer.close();

        assert_eq!(
            recorder.take(),
            vec![
                "port peer:out_2 true",
                "port peer:out_2 false",
                "port peer:out_1 false",
                "client peer false",
            ]
        );
    }

    #[test]
    fn test_cycle_mixes_and_processes() {
        let server = DummyServer::new(48000, 16);
        let mut source = open(&server, "source");
        source.register_port("out", PortDirection::Output).unwrap();

        let mut fx = open(&server, "fx");
        let input = fx.register_port("in", PortDirection::Input).unwrap();
        let output = fx.register_port("out", PortDirection::Output).unwrap();
        fx.set_process_handler(Box::new(Doubler { input, output })).unwrap();
        fx.activate().unwrap();

        fx.connect_ports("source:out", "fx:in").unwrap();
        assert!(server.write_port("source:out", &[0.25; 16]));
        assert!(server.write_port("fx:in", &[0.5; 16]));

        assert_eq!(server.run_cycle(), 1);
        assert_eq!(server.read_port("fx:in").unwrap(), vec![0.75; 16]);
        assert_eq!(server.read_port("fx:out").unwrap(), vec![1.5; 16]);

        // queued samples are one-shot
        server.run_cycle();
        assert_eq!(server.read_port("fx:out").unwrap(), vec![0.0; 16]);
    }

    #[test]
    fn test_deactivated_client_is_not_processed() {
        let server = DummyServer::new(48000, 16);
        let mut fx = open(&server, "fx");
        let input = fx.register_port("in", PortDirection::Input).unwrap();
        let output = fx.register_port("out", PortDirection::Output).unwrap();
        fx.set_process_handler(Box::new(Doubler { input, output })).unwrap();

        assert_eq!(server.run_cycle(), 0);
        fx.activate().unwrap();
        assert_eq!(server.run_cycle(), 1);
        fx.deactivate().unwrap();
        assert_eq!(server.run_cycle(), 0);
    }

    #[test]
    fn test_connect_rules() {
        let server = DummyServer::default();
        let mut a = open(&server, "a");
        let mut b = open(&server, "b");
        a.register_port("out", PortDirection::Output).unwrap();
        b.register_port("in", PortDirection::Input).unwrap();

        a.connect_ports("a:out", "b:in").unwrap();
        assert!(server.is_linked("a:out", "b:in"));
        assert!(matches!(
            a.connect_ports("a:out", "b:in"),
            Err(LinkError::RoutingRejected { .. })
        ));
        assert!(a.connect_ports("b:in", "a:out").is_err());
        assert!(a.connect_ports("a:out", "missing:in").is_err());

        a.disconnect_ports("a:out", "b:in").unwrap();
        assert!(server.connections().is_empty());
        assert!(a.disconnect_ports("a:out", "b:in").is_err());
    }

    #[test]
    fn test_ports_query_patterns_and_flags() {
        let server = DummyServer::default().with_system_ports(2, 2);
        let mut app = open(&server, "app");
        app.register_port("in_1", PortDirection::Input).unwrap();

        let physical = app.ports(None, None, PortFlags::IS_PHYSICAL | PortFlags::IS_OUTPUT);
        assert_eq!(physical, vec!["system:capture_1", "system:capture_2"]);

        let app_ports = app.ports(Some("^app:"), Some(DEFAULT_AUDIO_TYPE), PortFlags::NONE);
        assert_eq!(app_ports, vec!["app:in_1"]);

        assert!(app.ports(None, Some("midi"), PortFlags::NONE).is_empty());
        assert!(app.ports(Some("("), None, PortFlags::NONE).is_empty());
        assert_eq!(server.port_queries(), 4);
    }

    #[test]
    fn test_shutdown_notifies_and_kills_connections() {
        let server = DummyServer::default();
        let recorder = Arc::new(Recorder::default());
        let mut app = open(&server, "app");
        app.set_notification_handler(recorder.clone()).unwrap();

        server.shutdown();
        assert_eq!(recorder.take(), vec!["shutdown"]);
        assert!(server.client_names().is_empty());
        assert!(matches!(
            app.register_port("late", PortDirection::Input),
            Err(LinkError::PortRegistrationFailed { .. })
        ));

        assert!(server.restart());
        assert!(!app.is_active());
        app.abandon();

        let fresh = open(&server, "app");
        assert_eq!(fresh.client_name(), "app");
    }

    #[test]
    fn test_format_changes() {
        let server = DummyServer::default();
        let recorder = Arc::new(Recorder::default());
        let mut app = open(&server, "app");
        app.set_notification_handler(recorder.clone()).unwrap();
        app.activate().unwrap();

        server.set_sample_rate(44100);
        server.simulate_xrun();
        assert_eq!(app.sample_rate(), 44100);
        assert_eq!(recorder.take(), vec!["rate 44100", "xrun"]);

        server.shutdown();
        assert!(server.restart_with(96000, 128));
        assert_eq!(server.sample_rate(), 96000);
        assert_eq!(server.buffer_size(), 128);
    }

    #[test]
    fn test_drop_closes_connection() {
        let server = DummyServer::default();
        {
            let mut app = open(&server, "app");
            app.register_port("out", PortDirection::Output).unwrap();
            assert_eq!(server.client_names(), vec!["app"]);
        }
        assert!(server.client_names().is_empty());
        assert!(server.port_names().is_empty());
    }

    #[test]
    fn test_driver_runs_cycles() {
        let server = DummyServer::new(48000, 16);
        let mut fx = open(&server, "fx");
        let input = fx.register_port("in", PortDirection::Input).unwrap();
        let output = fx.register_port("out", PortDirection::Output).unwrap();
        fx.set_process_handler(Box::new(Doubler { input, output })).unwrap();
        fx.activate().unwrap();

        server.start_driver();
        std::thread::sleep(Duration::from_millis(20));
        server.stop_driver();

        assert!(fx.cpu_load() >= 0.0);
    }
}
