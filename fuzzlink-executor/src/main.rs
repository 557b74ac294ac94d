//! fuzzlink executor entry point.
//!
//! ```text
//! fuzzlink-executor                      Connect using fuzzlink-executor.toml
//! fuzzlink-executor --host 10.0.0.1      Override the host address
//! fuzzlink-executor --gen-config         Write default config to stdout
//! ```

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fuzzlink_executor::{ExecutorConfig, ExecutorService};

#[derive(Parser, Debug)]
#[command(name = "fuzzlink-executor", about = "Runs fuzzing programs for a fuzzlink host")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "fuzzlink-executor.toml")]
    config: PathBuf,

    /// Override the host address.
    #[arg(long)]
    host: Option<String>,

    /// Override the host port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the executor name.
    #[arg(long)]
    name: Option<String>,

    /// Override the architecture.
    #[arg(long)]
    arch: Option<String>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        println!("{}", toml::to_string_pretty(&ExecutorConfig::default())?);
        return Ok(());
    }

    let mut config = ExecutorConfig::load(&cli.config);
    if let Some(host) = cli.host {
        config.network.host = host;
    }
    if let Some(port) = cli.port {
        config.network.port = port;
    }
    if let Some(name) = cli.name {
        config.executor.name = name;
    }
    if let Some(arch) = cli.arch {
        config.executor.arch = arch;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("fuzzlink-executor v{}", env!("CARGO_PKG_VERSION"));
    info!("executor {} ({})", config.executor.name, config.executor.arch);

    let service = ExecutorService::new(config);
    let stop = service.stop_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, Ordering::SeqCst);
    });

    let executed = service.run().await?;
    info!(executed, "done");
    Ok(())
}
