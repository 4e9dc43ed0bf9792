use anyhow::Result;
use piccolo_core::{InMemoryBus, InMemoryLeadership, Module, ModuleOverrides, NodeConfig, Role};
use std::sync::Arc;
use tracing_subscriber::{self, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("piccolod {VERSION}");
        return Ok(());
    }
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("piccolod {VERSION}");
        println!("Piccolo persistence core daemon\n");
        println!("USAGE: piccolod [OPTIONS]\n");
        println!("OPTIONS:");
        println!("  -h, --help       Print help");
        println!("  -V, --version    Print version");
        println!("\nConfigured entirely via environment (PICCOLO_STATE_DIR,");
        println!("PICCOLO_UNMOUNT_BIN, PICCOLO_CRYPTFS_BIN); the command bus");
        println!("and key provider are wired in by the embedding process.");
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("piccolod v{VERSION} starting");

    // Single-node defaults: no cluster leadership feed and no key provider
    // wired in, matching the "stub/no-op implementations when no override
    // is given" default for a standalone node. A multi-node deployment
    // supplies its own `LeadershipRegistry` and `KeyProvider`.
    let config = NodeConfig::default();
    let leadership = Arc::new(InMemoryLeadership::new(Role::Leader));
    let event_bus = Arc::new(InMemoryBus::new());
    let module = Arc::new(Module::new(config, None, event_bus, leadership, ModuleOverrides::default()));

    module.start().await?;
    tracing::info!("piccolod running, locked state: {}", module.is_locked().await);

    tokio::signal::ctrl_c().await?;
    tracing::info!("piccolod shutting down");
    module.shutdown().await?;

    Ok(())
}
