#![deny(clippy::pedantic, clippy::all, clippy::nursery)]

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use sluice::controller::Sluice;

/// Locations tried, in order, when no configuration file is given
const SEARCH_PATH: [&str; 2] = ["./sluice.config.ron", "/etc/sluice/sluice.config.ron"];

/// Tiered, priority-aware message broker
#[derive(Parser, Debug)]
#[command(name = "sluice", version, about, long_about = None)]
struct Cli {
    /// Configuration file to run with
    #[arg(short, long, env = "SLUICE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let path = match cli.config {
        Some(path) => path,
        None => SEARCH_PATH
            .iter()
            .map(PathBuf::from)
            .find(|path| path.is_file())
            .with_context(|| {
                format!(
                    "No configuration file given and none found at {}",
                    SEARCH_PATH.join(", ")
                )
            })?,
    };

    Sluice::load(&path)?.run().await
}
