//! fuzzlink-extract entry point.
//!
//! ```text
//! fuzzlink-extract --linux /src/linux --arch amd64 sys/linux/fs.txt
//! fuzzlink-extract --linux /src/linux --linuxbld /build --arch arm64 -v 1 sys/linux/fs.txt
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use fuzzlink_extract::{ARCHS, CcResolver, extract};

#[derive(Parser, Debug)]
#[command(
    name = "fuzzlink-extract",
    about = "Resolve description constants against kernel headers"
)]
struct Cli {
    /// Path to the kernel source checkout.
    #[arg(long)]
    linux: Option<PathBuf>,

    /// Path to the kernel build directory; defaults to the checkout.
    #[arg(long = "linuxbld")]
    linux_build: Option<PathBuf>,

    /// Architecture to generate constants for.
    #[arg(long)]
    arch: Option<String>,

    /// Verbosity.
    #[arg(short, default_value_t = 0)]
    v: u8,

    /// Description file, e.g. sys/linux/fs.txt.
    inputs: Vec<PathBuf>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
        Err(e) => e.exit(),
    };

    let level = match cli.v {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let linux = cli
        .linux
        .ok_or("provide path to the kernel checkout with --linux")?;
    let arch = cli.arch.ok_or_else(|| {
        let known: Vec<_> = ARCHS.iter().map(|a| a.name).collect();
        format!("--arch is required (one of {})", known.join(", "))
    })?;
    let [input] = cli.inputs.as_slice() else {
        return Err("usage: fuzzlink-extract --linux <checkout> --arch <arch> <input.txt>".into());
    };
    let resolver = CcResolver::new(linux, cli.linux_build);
    extract(input, &arch, &resolver)?;
    Ok(())
}
