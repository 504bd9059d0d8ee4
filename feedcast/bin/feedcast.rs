#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::path::PathBuf;

use clap::Parser;
use feedcast::{NodeConfig, config::find_config_file, provisioning};

/// Store-and-forward feed distribution node
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Configuration file (overrides FEEDCAST_CONFIG and the default locations)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Validate the configuration and provisioning files, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = find_config_file(cli.config)?;
    let config = NodeConfig::load(&config_path)?;

    if cli.check {
        let snapshot = provisioning::load(&config.provisioning, &config.node)?;
        println!(
            "{}: node {} with {} destinations and {} routes",
            config_path.display(),
            config.node,
            snapshot.destinations().len(),
            snapshot.routes().len()
        );
        for error in snapshot.route_errors() {
            println!("  ignored route: {error}");
        }
        return Ok(());
    }

    feedcast::run(config).await
}
