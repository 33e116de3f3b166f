//! Full port name type.

use std::sync::Arc;

/// A full `client:port` name as reported by the server.
///
/// Cloning is cheap (`Arc<str>` inside).
///
/// # Example
///
/// ```
/// use audio_graph_link::server::PortName;
///
/// let name = PortName::new("synth:out_1");
/// assert_eq!(name.client(), Some("synth"));
/// assert_eq!(name.port(), Some("out_1"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortName(Arc<str>);

impl PortName {
    /// Creates a port name from a string.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    /// Builds `client:port`.
    pub fn join(client: &str, port: &str) -> Self {
        Self::new(format!("{client}:{port}"))
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Client part (before the first `:`), if present.
    pub fn client(&self) -> Option<&str> {
        client_of(&self.0)
    }

    /// Port part (after the first `:`), if present.
    pub fn port(&self) -> Option<&str> {
        self.0.split_once(':').map(|(_, port)| port)
    }
}

/// Client part of a `client:port` string.
pub(crate) fn client_of(full_name: &str) -> Option<&str> {
    full_name.split_once(':').map(|(client, _)| client)
}

impl std::fmt::Display for PortName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PortName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PortName {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for PortName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
