//! Graph and server events delivered to observers.
//!
//! Events are emitted from the general-purpose domain only, after the raw
//! server callback has been handed off. Observers may therefore block
//! briefly, allocate, or call back into the graph manager.

use std::sync::Arc;

/// Events emitted by the graph manager.
///
/// # Example
///
/// ```
/// use audio_graph_link::LinkEvent;
///
/// fn handle_event(event: LinkEvent) {
///     match event {
///         LinkEvent::ClientConnected { name, inputs, outputs } => {
///             eprintln!("{name} joined ({inputs} in, {outputs} out)");
///         }
///         LinkEvent::ClientDisconnected { name } => {
///             eprintln!("{name} left");
///         }
///         LinkEvent::ConnectionLost => eprintln!("server went away"),
///         other => eprintln!("{other:?}"),
///     }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A peer client registered its first port.
    ClientConnected {
        /// Name of the peer client.
        name: String,
        /// Number of input ports the peer had when it was announced.
        inputs: usize,
        /// Number of output ports the peer had when it was announced.
        outputs: usize,
    },

    /// A peer client unregistered, or its last port went away.
    ClientDisconnected {
        /// Name of the peer client.
        name: String,
    },

    /// The server shut down underneath our client.
    ///
    /// The manager has already moved to the disconnected state when this
    /// is emitted.
    ConnectionLost,

    /// The server reported a buffer underrun/overrun.
    Xrun {
        /// Total xruns seen on the current connection.
        total: u64,
    },

    /// The server changed its sample rate.
    SampleRateChanged {
        /// New sample rate in Hz.
        sample_rate: u32,
    },

    /// The server changed its period size.
    BufferSizeChanged {
        /// New period size in frames.
        buffer_size: u32,
    },

    /// Server notifications were dropped because the hand-off queue was full.
    NotificationsDropped {
        /// Total notifications dropped on the current connection.
        dropped: u64,
    },
}

/// Callback type for receiving [`LinkEvent`]s.
pub type EventCallback = Arc<dyn Fn(LinkEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// # Example
///
/// ```
/// use audio_graph_link::{event_callback, LinkEvent};
///
/// let callback = event_callback(|event: LinkEvent| {
///     println!("Got event: {:?}", event);
/// });
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(LinkEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}
