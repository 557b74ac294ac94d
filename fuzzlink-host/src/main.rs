//! fuzzlink host entry point.
//!
//! ```text
//! fuzzlink-host                     Serve with fuzzlink-host.toml or defaults
//! fuzzlink-host --config <path>     Load a custom config TOML
//! fuzzlink-host --corpus <dir>      Replay programs from <dir>
//! fuzzlink-host --gen-config        Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fuzzlink_host::{HostConfig, HostService};

#[derive(Parser, Debug)]
#[command(name = "fuzzlink-host", about = "Fuzzing host serving fuzzlink executors")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "fuzzlink-host.toml")]
    config: PathBuf,

    /// Override the listen port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the target architecture.
    #[arg(long)]
    arch: Option<String>,

    /// Directory of programs to replay.
    #[arg(long)]
    corpus: Option<PathBuf>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        println!("{}", toml::to_string_pretty(&HostConfig::default())?);
        return Ok(());
    }

    let mut config = HostConfig::load(&cli.config);
    if let Some(port) = cli.port {
        config.network.port = port;
    }
    if let Some(arch) = cli.arch {
        config.target.arch = arch;
    }
    if let Some(dir) = cli.corpus {
        config.corpus.dir = dir.display().to_string();
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("fuzzlink-host v{}", env!("CARGO_PKG_VERSION"));
    info!("target: {}", config.target.arch);
    info!("procs per executor: {}", config.session.procs);

    let service = HostService::new(config);
    let stop = service.stop_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await?;
    Ok(())
}
