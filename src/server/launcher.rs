//! External server lifecycle.
//!
//! The link does not spawn server processes itself. A [`ServerLauncher`]
//! is handed to the [`LinkContext`](crate::LinkContext), which calls it to
//! start, stop and restart the server and then tells the availability
//! monitor what happened.

use std::path::PathBuf;

use async_trait::async_trait;

use super::DummyServer;
use crate::{LinkConfig, LinkError};

/// Parameters for starting the external server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Period size in frames.
    pub buffer_size: u32,
    /// Backend driver name.
    pub driver: String,
    /// Server executable, if not found on `PATH`.
    pub executable: Option<PathBuf>,
}

impl LaunchRequest {
    /// Builds a request from the configured format, driver and executable.
    ///
    /// Without a configured driver the platform default is used.
    pub fn from_config(config: &LinkConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            buffer_size: config.buffer_size,
            driver: config
                .backend_driver
                .clone()
                .unwrap_or_else(|| default_driver().to_string()),
            executable: config.server_path.clone(),
        }
    }

    /// Same request with a different format.
    #[must_use]
    pub fn with_format(mut self, sample_rate: u32, buffer_size: u32) -> Self {
        self.sample_rate = sample_rate;
        self.buffer_size = buffer_size;
        self
    }
}

/// Default backend driver for the current platform.
pub fn default_driver() -> &'static str {
    if cfg!(target_os = "linux") {
        "alsa"
    } else if cfg!(target_os = "macos") {
        "coreaudio"
    } else if cfg!(target_os = "windows") {
        "portaudio"
    } else {
        "dummy"
    }
}

/// Starts and stops the external audio server.
///
/// # Example
///
/// ```
/// use audio_graph_link::server::{LaunchRequest, ServerLauncher};
/// use audio_graph_link::LinkError;
/// use async_trait::async_trait;
///
/// struct AlwaysRunning;
///
/// #[async_trait]
/// impl ServerLauncher for AlwaysRunning {
///     fn name(&self) -> &str {
///         "always-running"
///     }
///
///     async fn start(&self, _request: &LaunchRequest) -> Result<(), LinkError> {
///         Ok(())
///     }
///
///     async fn stop(&self) -> Result<(), LinkError> {
///         Err(LinkError::launcher("cannot stop"))
///     }
///
///     async fn is_running(&self) -> bool {
///         true
///     }
///
///     async fn running_config(&self) -> Option<(u32, u32)> {
///         Some((48000, 256))
///     }
/// }
/// ```
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Starts the server. Succeeds without restarting if already running.
    async fn start(&self, request: &LaunchRequest) -> Result<(), LinkError>;

    /// Stops the server. Succeeds if it was not running.
    async fn stop(&self) -> Result<(), LinkError>;

    /// Returns true if the server is running.
    async fn is_running(&self) -> bool;

    /// `(sample_rate, buffer_size)` of the running server.
    async fn running_config(&self) -> Option<(u32, u32)>;

    /// Server version string, if known.
    async fn version(&self) -> Option<String> {
        None
    }
}

/// Launcher that starts and stops a [`DummyServer`].
#[derive(Debug, Clone)]
pub struct DummyLauncher {
    server: DummyServer,
}

impl DummyLauncher {
    /// Creates a launcher controlling `server`.
    pub fn new(server: DummyServer) -> Self {
        Self { server }
    }

    /// The controlled server.
    pub fn server(&self) -> &DummyServer {
        &self.server
    }
}

#[async_trait]
impl ServerLauncher for DummyLauncher {
    fn name(&self) -> &str {
        "dummy"
    }

    async fn start(&self, request: &LaunchRequest) -> Result<(), LinkError> {
        if request.sample_rate == 0 || request.buffer_size == 0 {
            return Err(LinkError::launcher(format!(
                "invalid format {} Hz / {} frames",
                request.sample_rate, request.buffer_size
            )));
        }
        if !self
            .server
            .restart_with(request.sample_rate, request.buffer_size)
        {
            tracing::debug!("Dummy server already running");
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), LinkError> {
        self.server.shutdown();
        Ok(())
    }

    async fn is_running(&self) -> bool {
        self.server.is_running()
    }

    async fn running_config(&self) -> Option<(u32, u32)> {
        self.server
            .is_running()
            .then(|| (self.server.sample_rate(), self.server.buffer_size()))
    }

    async fn version(&self) -> Option<String> {
        Some(format!("dummy {}", env!("CARGO_PKG_VERSION")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_request_from_config() {
        let config = LinkConfig {
            sample_rate: 44100,
            buffer_size: 128,
            backend_driver: Some("dummy".to_string()),
            server_path: Some(PathBuf::from("/usr/bin/jackd")),
            ..Default::default()
        };

        let request = LaunchRequest::from_config(&config);
        assert_eq!(request.sample_rate, 44100);
        assert_eq!(request.buffer_size, 128);
        assert_eq!(request.driver, "dummy");
        assert_eq!(request.executable, Some(PathBuf::from("/usr/bin/jackd")));
    }

    #[test]
    fn test_launch_request_default_driver() {
        let request = LaunchRequest::from_config(&LinkConfig::default()).with_format(96000, 64);
        assert_eq!(request.driver, default_driver());
        assert_eq!((request.sample_rate, request.buffer_size), (96000, 64));
    }

    #[tokio::test]
    async fn test_dummy_launcher_lifecycle() {
        let server = DummyServer::new(48000, 512);
        let launcher = DummyLauncher::new(server.clone());

        launcher.stop().await.unwrap();
        assert!(!launcher.is_running().await);
        assert_eq!(launcher.running_config().await, None);

        let request = LaunchRequest::from_config(&LinkConfig::default()).with_format(44100, 256);
        launcher.start(&request).await.unwrap();
        assert!(launcher.is_running().await);
        assert_eq!(launcher.running_config().await, Some((44100, 256)));

        // already running: format unchanged
        launcher.start(&request.clone().with_format(96000, 64)).await.unwrap();
        assert_eq!(launcher.running_config().await, Some((44100, 256)));
        assert!(launcher.version().await.is_some());
    }

    #[tokio::test]
    async fn test_dummy_launcher_rejects_zero_format() {
        let launcher = DummyLauncher::new(DummyServer::default());
        launcher.stop().await.unwrap();

        let request = LaunchRequest::from_config(&LinkConfig::default()).with_format(0, 256);
        assert!(matches!(
            launcher.start(&request).await,
            Err(LinkError::Launcher(_))
        ));
        assert!(!launcher.is_running().await);
    }
}
