//! Real-time data path.
//!
//! ```text
//! server input buffer  → PortProcessor → RingBuffer → GraphManager::read_audio_buffer
//! GraphManager::write_audio_buffer → RingBuffer → PortProcessor → server output buffer
//! ```
//!
//! - **RingBuffer**: per-port sample queue, overwrite-on-full, zero-fill on short read
//! - **PortTable**: input and output port sets, shared behind an `RwLock`
//! - **PortProcessor**: the process callback; never waits on the port table

mod ports;
mod process;
mod ring_buffer;

pub use ports::{port_short_name, Port, PortSet, PortTable};
pub use process::PortProcessor;
pub use ring_buffer::{RingBuffer, RMS_WINDOW};
