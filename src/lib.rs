//! # audio-graph-link
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Real-time-safe bridge between a JACK-style audio graph server and a
//! non-real-time host.
//!
//! `audio-graph-link` registers a client with input and output ports,
//! moves samples between the server's process callback and per-port ring
//! buffers, routes ports by name or by index, announces peer clients as
//! they come and go, and watches whether the server is reachable at all.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use audio_graph_link::{DummyServer, LinkConfig, LinkContext, LinkEvent};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), audio_graph_link::LinkError> {
//! let server = DummyServer::new(48000, 256);
//! let context = LinkContext::new(
//!     Arc::new(server.clone()),
//!     LinkConfig::default(),
//!     tokio::runtime::Handle::current(),
//! );
//!
//! context.graph().on_event(audio_graph_link::event_callback(|event: LinkEvent| {
//!     tracing::info!(?event, "graph event");
//! }));
//! context.start().await?;
//! context.connect_client("my-app", 2, 2)?;
//!
//! // One server period later the input rings hold whatever arrived.
//! server.run_cycle();
//! let samples = context.graph().read_audio_buffer(0, 256);
//! assert_eq!(samples.len(), 256);
//!
//! context.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! The crate maintains a strict boundary between two domains:
//!
//! - **Real-time**: the server's process callback and raw notifications.
//!   They only touch ring buffers, atomics and a non-blocking channel send.
//! - **General-purpose**: tokio tasks that turn notifications into
//!   [`LinkEvent`]s, run auto-connect, and drive the availability probe.
//!
//! Disconnecting always deactivates the process callback before port
//! storage is released.

#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]
// unwrap/expect allowed in tests only
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

mod config;
mod context;
mod error;
mod event;
mod graph;
mod monitor;
pub mod pipeline;
pub mod server;

pub use config::{
    LinkConfig, MonitorConfig, DEFAULT_RING_BUFFER_CAPACITY, SUPPORTED_BUFFER_SIZES,
    SUPPORTED_SAMPLE_RATES,
};
pub use context::{LinkContext, LinkStatus};
pub use error::LinkError;
pub use event::{event_callback, EventCallback, LinkEvent};
pub use graph::{GraphManager, LinkStats, PortAddress, TopologyNotifier};
pub use monitor::{AvailabilityMonitor, ServerState};
pub use pipeline::RingBuffer;
pub use server::{
    AudioServer, DummyLauncher, DummyServer, LaunchRequest, PortDirection, PortName,
    ServerLauncher,
};
