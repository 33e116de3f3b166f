//! Audio server abstraction.
//!
//! The graph manager and the availability monitor talk to the audio graph
//! server only through the traits in this module:
//!
//! - [`AudioServer`] opens client connections.
//! - [`ServerConnection`] is one open client: ports, routing, activation.
//! - [`ProcessHandler`] is invoked on the server's real-time thread once per period.
//! - [`NotificationHandler`] receives shutdown, xrun, registration and
//!   format-change callbacks on a server-owned thread.
//!
//! [`DummyServer`] is an in-process implementation with a deterministic
//! cycle driver, suitable for tests and for running without an external
//! server.

pub mod dummy;
pub mod launcher;
mod port_name;

pub use dummy::DummyServer;
pub use launcher::{DummyLauncher, LaunchRequest, ServerLauncher};
pub use port_name::PortName;
pub(crate) use port_name::client_of;

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use crate::LinkError;

/// Client name under which the server exposes physical ports.
pub const SYSTEM_CLIENT: &str = "system";

/// Port type string for 32-bit float mono audio ports.
pub const DEFAULT_AUDIO_TYPE: &str = "32 bit float mono audio";

/// Direction of a port, seen from the client that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDirection {
    /// Receives samples from the graph.
    Input,
    /// Sends samples into the graph.
    Output,
}

impl PortDirection {
    /// Suffix used in generated port names (`in` / `out`).
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Input => "in",
            Self::Output => "out",
        }
    }

    /// The port flag matching this direction.
    pub fn flag(self) -> PortFlags {
        match self {
            Self::Input => PortFlags::IS_INPUT,
            Self::Output => PortFlags::IS_OUTPUT,
        }
    }
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

/// Server-assigned port identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub u32);

/// Port property flags used to filter port queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PortFlags(u32);

impl PortFlags {
    /// No filtering.
    pub const NONE: Self = Self(0);
    /// Port receives data.
    pub const IS_INPUT: Self = Self(0x1);
    /// Port produces data.
    pub const IS_OUTPUT: Self = Self(0x2);
    /// Port corresponds to a physical device channel.
    pub const IS_PHYSICAL: Self = Self(0x4);
    /// Data neither originates from nor passes through to another port.
    pub const IS_TERMINAL: Self = Self(0x10);

    /// Raw bit value.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if every flag in `other` is also set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if no flags are set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for PortFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PortFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Options for opening a client connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
    /// Fail instead of auto-starting a server when none is running.
    pub no_start_server: bool,
}

impl OpenOptions {
    /// Options for probe and sentinel connections.
    pub fn no_start_server() -> Self {
        Self {
            no_start_server: true,
        }
    }
}

/// Status bits reported by a successful open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenStatus {
    /// The requested name was taken; the server assigned a different one.
    pub name_not_unique: bool,
    /// The open call started a server.
    pub server_started: bool,
}

/// A freshly opened client connection.
pub struct OpenedClient {
    /// The connection handle.
    pub connection: Box<dyn ServerConnection>,
    /// What the server reported while opening.
    pub status: OpenStatus,
}

/// Entry point to an audio graph server.
pub trait AudioServer: Send + Sync {
    /// Opens a new client connection.
    ///
    /// # Errors
    ///
    /// Returns `ServerUnavailable` if no server is reachable or the client
    /// name cannot be made unique.
    fn open(&self, client_name: &str, options: OpenOptions) -> Result<OpenedClient, LinkError>;
}

/// Buffers handed to a [`ProcessHandler`] for one period.
pub trait ProcessScope {
    /// Number of frames in this period.
    fn n_frames(&self) -> usize;

    /// Samples arriving on one of the client's input ports.
    fn input(&self, port: PortId) -> Option<&[f32]>;

    /// Buffer to fill for one of the client's output ports.
    ///
    /// Its contents on entry are unspecified; the server may hand back the
    /// previous period's samples.
    fn output(&mut self, port: PortId) -> Option<&mut [f32]>;

    /// Zero-fills every output buffer of this client for the period.
    fn silence_outputs(&mut self);
}

/// Periodic real-time callback.
///
/// Runs on the server's real-time thread. Implementations must not block,
/// allocate, or log.
pub trait ProcessHandler: Send {
    /// Processes one period.
    fn process(&mut self, scope: &mut dyn ProcessScope);
}

/// Server notifications.
///
/// Called on a server-owned thread, possibly the real-time one. Implementations
/// should only record or forward the notification.
pub trait NotificationHandler: Send + Sync {
    /// The server is shutting down this client. The connection must not be
    /// closed from here.
    fn shutdown(&self) {}

    /// The server missed a deadline.
    fn xrun(&self) {}

    /// A client appeared or went away.
    fn client_registration(&self, _client: &str, _registered: bool) {}

    /// A port appeared or went away. `port` is the full `client:port` name.
    fn port_registration(&self, _port: &str, _registered: bool) {}

    /// The sample rate changed.
    fn sample_rate_changed(&self, _sample_rate: u32) {}

    /// The period size changed.
    fn buffer_size_changed(&self, _buffer_size: u32) {}
}

/// One open client connection.
pub trait ServerConnection: Send {
    /// Name the server assigned to this client.
    fn client_name(&self) -> &str;

    /// Current sample rate in Hz.
    fn sample_rate(&self) -> u32;

    /// Current period size in frames.
    fn buffer_size(&self) -> u32;

    /// DSP load in percent.
    fn cpu_load(&self) -> f32;

    /// Installs the notification handler, replacing any previous one.
    fn set_notification_handler(
        &mut self,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<(), LinkError>;

    /// Installs the process handler, replacing any previous one.
    fn set_process_handler(&mut self, handler: Box<dyn ProcessHandler>) -> Result<(), LinkError>;

    /// Starts periodic processing and notification delivery.
    fn activate(&mut self) -> Result<(), LinkError>;

    /// Stops periodic processing. No process callback runs after this returns.
    fn deactivate(&mut self) -> Result<(), LinkError>;

    /// Returns true while the client is active.
    fn is_active(&self) -> bool;

    /// Registers an audio port with the given short name.
    fn register_port(&mut self, short_name: &str, direction: PortDirection)
        -> Result<PortId, LinkError>;

    /// Unregisters one of this client's ports.
    fn unregister_port(&mut self, port: PortId) -> Result<(), LinkError>;

    /// Full `client:port` name of a port.
    fn port_name(&self, port: PortId) -> Option<String>;

    /// Lists full port names matching the regex patterns and flags.
    ///
    /// `None` patterns match everything; [`PortFlags::NONE`] disables flag
    /// filtering.
    fn ports(
        &self,
        name_pattern: Option<&str>,
        type_pattern: Option<&str>,
        flags: PortFlags,
    ) -> Vec<String>;

    /// Connects an output port to an input port.
    fn connect_ports(&self, source: &str, destination: &str) -> Result<(), LinkError>;

    /// Removes a connection between two ports.
    fn disconnect_ports(&self, source: &str, destination: &str) -> Result<(), LinkError>;

    /// Closes the client, releasing all of its ports.
    fn close(self: Box<Self>);

    /// Releases the handle without tearing the client down.
    ///
    /// Used after [`NotificationHandler::shutdown`], when the server is
    /// already destroying the client.
    fn abandon(self: Box<Self>);
}
