//! Error types for audio-graph-link.
//!
//! Nothing in this crate is fatal to the host process. Server interaction
//! failures come back as [`LinkError`] values; runtime topology changes and
//! server health are surfaced through [`LinkEvent`](crate::LinkEvent) instead.

use std::path::PathBuf;

use crate::server::PortDirection;

/// Errors returned by graph, monitor and configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The audio server could not be reached (not running, or refused the client).
    #[error("audio server unavailable: {reason}")]
    ServerUnavailable {
        /// Why the open failed.
        reason: String,
    },

    /// The operation needs an open client connection.
    #[error("not connected to an audio server")]
    NotConnected,

    /// The server refused to register a port.
    #[error("failed to register port '{name}': {reason}")]
    PortRegistrationFailed {
        /// Short name of the port that was requested.
        name: String,
        /// Reason reported by the server.
        reason: String,
    },

    /// A channel index did not address one of our ports.
    #[error("{direction} channel {index} out of range (have {available})")]
    ChannelOutOfRange {
        /// Which port set was addressed.
        direction: PortDirection,
        /// The 0-based index that was requested.
        index: usize,
        /// Number of ports in that set.
        available: usize,
    },

    /// The server rejected a connect/disconnect request.
    #[error("routing rejected: {source_port} -> {destination_port}: {reason}")]
    RoutingRejected {
        /// Resolved source port name.
        source_port: String,
        /// Resolved destination port name.
        destination_port: String,
        /// Reason reported by the server.
        reason: String,
    },

    /// Routing by index needs an output as source and an input as destination.
    #[error("invalid routing direction: source must be output and destination input (got {source_direction} -> {destination_direction})")]
    InvalidDirection {
        /// Direction given for the source.
        source_direction: PortDirection,
        /// Direction given for the destination.
        destination_direction: PortDirection,
    },

    /// No port exists at the requested (direction, client, index) address.
    #[error("no {direction} port #{index} on client '{client}'")]
    PortNotFound {
        /// Client that was searched.
        client: String,
        /// Direction that was searched.
        direction: PortDirection,
        /// 1-based index that was requested.
        index: usize,
    },

    /// The server refused to activate or deactivate the client.
    #[error("activation failed: {reason}")]
    ActivationFailed {
        /// Reason reported by the server.
        reason: String,
    },

    /// The configuration file could not be read.
    #[error("config error: {path}: {source}")]
    ConfigRead {
        /// Path to the file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration could not be parsed.
    #[error("invalid config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// The external server launcher failed.
    #[error("server launcher error: {0}")]
    Launcher(String),

    /// Any other error from the server backend.
    #[error("audio server error: {0}")]
    Backend(String),
}

impl LinkError {
    /// Creates a server-unavailable error with the given reason.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::ServerUnavailable {
            reason: reason.into(),
        }
    }

    /// Creates a backend error with the given message.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Creates a launcher error with the given message.
    pub fn launcher(msg: impl Into<String>) -> Self {
        Self::Launcher(msg.into())
    }

    /// Creates a routing-rejected error for the given port pair.
    pub fn routing_rejected(
        source_port: impl Into<String>,
        destination_port: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::RoutingRejected {
            source_port: source_port.into(),
            destination_port: destination_port.into(),
            reason: reason.into(),
        }
    }
}
