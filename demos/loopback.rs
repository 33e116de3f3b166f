//! Loopback example.
//!
//! Connects a client to an in-process dummy server, feeds a synthetic peer
//! into its inputs, and copies input 1 back to output 1 every period.
//!
//! Run with: cargo run --example loopback
//! Set RUST_LOG=audio_graph_link=debug for more detail.

use std::sync::Arc;
use std::time::Duration;

use audio_graph_link::server::{OpenOptions, PortDirection};
use audio_graph_link::{event_callback, AudioServer, DummyServer, LinkConfig, LinkContext};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let server = DummyServer::new(48000, 256).with_system_ports(2, 2);

    // A passive peer whose output we fill by hand
    let mut tone = server.open("tone", OpenOptions::default())?.connection;
    tone.register_port("out_1", PortDirection::Output)?;

    let context = LinkContext::new(
        Arc::new(server.clone()),
        LinkConfig {
            client_name: "loopback".to_string(),
            client_monitor_interval: Duration::from_millis(500),
            ..Default::default()
        },
        tokio::runtime::Handle::current(),
    );
    context.graph().on_event(event_callback(|event: audio_graph_link::LinkEvent| {
        println!("event: {event:?}");
    }));

    context.start().await?;
    context.connect_configured()?;

    let frames = server.buffer_size() as usize;
    for cycle in 0..20u32 {
        let amplitude = 0.05 * (cycle % 10) as f32;
        server.write_port("tone:out_1", &vec![amplitude; frames]);
        server.run_cycle();

        let block = context.graph().read_audio_buffer(0, frames);
        context.graph().write_audio_buffer(0, &block)?;
        println!(
            "cycle {cycle:2}: in_1 level {:.3}, out_1 last {:?}",
            context.graph().input_level(0),
            server
                .read_port("loopback:link_out_1")
                .and_then(|samples| samples.first().copied())
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    println!("Status: {:?}", context.status());
    context.shutdown().await?;
    Ok(())
}
