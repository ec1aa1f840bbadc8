//! Unity Bridge RPC Server - JSON-RPC front end for the editor bridge.
//!
//! Listens for the Unity editor plugin on one port and serves tool callers
//! over JSON-RPC 2.0 on another.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use unity_bridge::{Bridge, BridgeConfig, BridgeDefaults, EditorLinkServer};

#[derive(Parser, Debug)]
#[command(name = "unity-bridge-rpc")]
#[command(about = "JSON-RPC bridge to a live Unity editor")]
struct Args {
    /// RPC port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Port the editor plugin connects to (0 = auto-assign)
    #[arg(long, default_value = "6400")]
    editor_port: u16,

    /// Host to bind both listeners to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Milliseconds between heartbeat pings to the editor
    #[arg(long, default_value_t = BridgeDefaults::HEARTBEAT_INTERVAL.as_millis() as u64)]
    heartbeat_interval_ms: u64,

    /// Consecutive missed pings before the editor connection is dropped
    #[arg(long, default_value_t = BridgeDefaults::HEARTBEAT_MISS_THRESHOLD)]
    heartbeat_miss_threshold: u32,

    /// Requests allowed to wait for the editor at once
    #[arg(long, default_value_t = BridgeDefaults::QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// How long callers wait while the editor compiles or reloads
    #[arg(long, default_value_t = BridgeDefaults::COMPILE_GRACE.as_millis() as u64)]
    compile_grace_ms: u64,

    /// How long callers wait for the editor to reconnect
    #[arg(long, default_value_t = BridgeDefaults::RECONNECT_WAIT.as_millis() as u64)]
    reconnect_wait_ms: u64,

    /// Milliseconds a new editor socket has to send its hello
    #[arg(long, default_value_t = BridgeDefaults::HANDSHAKE_TIMEOUT.as_millis() as u64)]
    handshake_timeout_ms: u64,

    /// Default per-request timeout when the caller sets none
    #[arg(long, default_value_t = BridgeDefaults::REQUEST_TIMEOUT.as_millis() as u64)]
    request_timeout_ms: u64,
}

impl Args {
    fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig::new()
            .with_heartbeat_interval(Duration::from_millis(self.heartbeat_interval_ms))
            .with_heartbeat_miss_threshold(self.heartbeat_miss_threshold)
            .with_queue_capacity(self.queue_capacity)
            .with_compile_grace(Duration::from_millis(self.compile_grace_ms))
            .with_reconnect_wait(Duration::from_millis(self.reconnect_wait_ms))
            .with_handshake_timeout(Duration::from_millis(self.handshake_timeout_ms))
            .with_request_timeout(Duration::from_millis(self.request_timeout_ms))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Unity Bridge RPC Server");

    let bridge = Bridge::new(args.bridge_config())?;

    let editor_addr: SocketAddr = format!("{}:{}", args.host, args.editor_port).parse()?;
    let mut link = EditorLinkServer::start(bridge.clone(), editor_addr).await?;
    let addr = unity_bridge_rpc::start_server(bridge.clone(), &args.host, args.port).await?;

    // Intentional stdout: launchers read the bound ports from here
    println!("EDITOR_PORT={}", link.addr().port());
    println!("RPC_PORT={}", addr.port());

    info!("RPC server running on {}, editor link on {}", addr, link.addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    bridge.begin_shutdown();
    link.shutdown();
    bridge.mark_stopped();

    Ok(())
}
