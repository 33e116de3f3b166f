//! Configuration for the link.
//!
//! [`LinkConfig`] carries every value the rest of the crate reads from the
//! host application's settings. It can be built in code or loaded from TOML:
//!
//! ```toml
//! sample_rate = 48000
//! buffer_size = 256
//! client_name = "my-app"
//! input_channels = 8
//! output_channels = 8
//! client_monitor_interval = "500ms"
//!
//! [monitor]
//! probe_interval = "1s"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::LinkError;

/// Sample rates the server can be started with.
pub const SUPPORTED_SAMPLE_RATES: [u32; 7] = [22050, 32000, 44100, 48000, 88200, 96000, 192000];

/// Period sizes the server can be started with.
pub const SUPPORTED_BUFFER_SIZES: [u32; 9] = [16, 32, 64, 128, 256, 512, 1024, 2048, 4096];

/// Default ring buffer capacity per port, in samples.
pub const DEFAULT_RING_BUFFER_CAPACITY: usize = 8192;

const DEFAULT_SAMPLE_RATE: u32 = 48000;
const DEFAULT_BUFFER_SIZE: u32 = 512;

/// Settings consumed by the graph manager, monitor and composition root.
///
/// # Example
///
/// ```
/// use audio_graph_link::LinkConfig;
///
/// let config = LinkConfig {
///     input_channels: 8,
///     ..Default::default()
/// };
/// assert_eq!(config.output_channels, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Sample rate to start the server with, in Hz.
    ///
    /// Default: 48000
    pub sample_rate: u32,

    /// Period size to start the server with, in frames.
    ///
    /// Default: 512
    pub buffer_size: u32,

    /// Start the external server when the host starts.
    ///
    /// Default: true
    pub auto_start_server: bool,

    /// Backend driver for the external server (per-platform default if unset).
    pub backend_driver: Option<String>,

    /// Explicit path to the server executable.
    pub server_path: Option<PathBuf>,

    /// Client name requested when connecting.
    ///
    /// Default: `"audio-graph-link"`
    pub client_name: String,

    /// Base name for our ports (`{base}_in_{n}` / `{base}_out_{n}`).
    ///
    /// Default: `"link"`
    pub port_base_name: String,

    /// Number of input ports to register.
    ///
    /// Default: 2
    pub input_channels: usize,

    /// Number of output ports to register.
    ///
    /// Default: 2
    pub output_channels: usize,

    /// Connect new peer clients' outputs to our inputs when they appear.
    ///
    /// Default: true
    pub auto_connect: bool,

    /// Interval of the periodic auto-connect sweep.
    ///
    /// Default: 2s
    #[serde(deserialize_with = "deserialize_duration")]
    pub client_monitor_interval: Duration,

    /// Stop the server on shutdown if the launcher reports it running.
    ///
    /// Default: false
    pub kill_server_on_shutdown: bool,

    /// Capacity of each port's ring buffer, in samples.
    ///
    /// Default: 8192
    pub ring_buffer_capacity: usize,

    /// Availability monitor settings.
    pub monitor: MonitorConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            auto_start_server: true,
            backend_driver: None,
            server_path: None,
            client_name: "audio-graph-link".to_string(),
            port_base_name: "link".to_string(),
            input_channels: 2,
            output_channels: 2,
            auto_connect: true,
            client_monitor_interval: Duration::from_secs(2),
            kill_server_on_shutdown: false,
            ring_buffer_capacity: DEFAULT_RING_BUFFER_CAPACITY,
            monitor: MonitorConfig::default(),
        }
    }
}

impl LinkConfig {
    /// Parses a config from TOML. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, LinkError> {
        Ok(toml::from_str(s)?)
    }

    /// Reads and parses a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LinkError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| LinkError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Returns a copy with out-of-range values replaced.
    ///
    /// Unsupported sample rates fall back to 48000 and unsupported period
    /// sizes to 512. Channel counts and ring capacity are clamped to at
    /// least 1.
    #[must_use]
    pub fn validated(&self) -> Self {
        let mut config = self.clone();

        if !SUPPORTED_SAMPLE_RATES.contains(&config.sample_rate) {
            tracing::warn!(
                requested = config.sample_rate,
                fallback = DEFAULT_SAMPLE_RATE,
                "Unsupported sample rate"
            );
            config.sample_rate = DEFAULT_SAMPLE_RATE;
        }
        if !SUPPORTED_BUFFER_SIZES.contains(&config.buffer_size) {
            tracing::warn!(
                requested = config.buffer_size,
                fallback = DEFAULT_BUFFER_SIZE,
                "Unsupported buffer size"
            );
            config.buffer_size = DEFAULT_BUFFER_SIZE;
        }
        config.input_channels = config.input_channels.max(1);
        config.output_channels = config.output_channels.max(1);
        config.ring_buffer_capacity = config.ring_buffer_capacity.max(1);
        config
    }
}

/// Settings for the [`AvailabilityMonitor`](crate::AvailabilityMonitor).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// How often to probe while no sentinel is attached.
    ///
    /// Default: 1s
    #[serde(deserialize_with = "deserialize_duration")]
    pub probe_interval: Duration,

    /// Delay of the single re-probe scheduled after a server shutdown.
    ///
    /// Default: 250ms
    #[serde(deserialize_with = "deserialize_duration")]
    pub reprobe_delay: Duration,

    /// Client name of the long-lived sentinel connection.
    pub sentinel_name: String,

    /// Client name of the throwaway probe connection.
    pub probe_name: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(1),
            reprobe_delay: Duration::from_millis(250),
            sentinel_name: "audio-graph-link-monitor".to_string(),
            probe_name: "audio-graph-link-probe".to_string(),
        }
    }
}

/// Accepts `"250ms"`, `"2s"`, `"1.5s"` or a bare number of seconds.
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    let (number, scale) = if let Some(ms) = text.strip_suffix("ms") {
        (ms, 0.001)
    } else if let Some(s) = text.strip_suffix('s') {
        (s, 1.0)
    } else {
        (text, 1.0)
    };
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {text:?}"))?;
    Duration::try_from_secs_f64(value * scale)
        .map_err(|e| format!("invalid duration {text:?}: {e}"))
}
