//! skiff Node Agent
//!
//! Runs one agent on this host: loads flags from the environment,
//! starts the runtime against the in-process bus and the mock isolator,
//! and shuts down cleanly on SIGINT. A fatal recovery failure under
//! `strict` exits non-zero.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use skiff_agent::{AgentRuntime, Flags, MockIsolator, StandaloneDetector};
use skiff_messages::MessageBus;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting skiff node agent");

    let flags = Flags::from_env()?;
    info!(
        hostname = %flags.hostname,
        work_dir = %flags.work_dir.display(),
        checkpoint = flags.checkpoint,
        "Configuration loaded"
    );

    let bus = MessageBus::new();
    let isolator = Arc::new(MockIsolator::new());
    let detector = StandaloneDetector::new(
        std::env::var("SKIFF_MASTER")
            .ok()
            .map(skiff_messages::Endpoint::new),
    );

    let runtime = AgentRuntime::start(flags, bus, isolator, &detector);

    let handle = runtime.handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            let _ = handle.send(skiff_agent::AgentEvent::Shutdown);
        }
    });

    if let Err(e) = runtime.wait().await {
        anyhow::bail!("agent failed: {e}");
    }

    Ok(())
}
