//! Availability monitor example.
//!
//! Starts, stops and restarts a dummy server through the launcher while the
//! availability monitor tracks it.
//!
//! Run with: cargo run --example monitor

use std::sync::Arc;
use std::time::Duration;

use audio_graph_link::{DummyLauncher, DummyServer, LinkConfig, LinkContext, MonitorConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let server = DummyServer::new(48000, 512);
    server.shutdown();

    let config = LinkConfig {
        kill_server_on_shutdown: true,
        monitor: MonitorConfig {
            probe_interval: Duration::from_millis(200),
            ..Default::default()
        },
        ..Default::default()
    };
    let context = LinkContext::new(
        Arc::new(server.clone()),
        config,
        tokio::runtime::Handle::current(),
    )
    .with_launcher(Arc::new(DummyLauncher::new(server.clone())));

    // auto_start_server launches it here
    context.start().await?;
    println!("After start:   {:?}", context.monitor().state());

    context.restart_server(96000, 128).await?;
    println!("After restart: {:?}", context.monitor().state());

    // Crash it behind the launcher's back and watch the probe recover
    server.shutdown();
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("After crash:   {:?}", context.monitor().state());

    server.restart();
    tokio::time::sleep(Duration::from_millis(500)).await;
    println!("After restart: {:?}", context.monitor().state());

    context.shutdown().await?;
    println!("Server running after shutdown: {}", server.is_running());
    Ok(())
}
