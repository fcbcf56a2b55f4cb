//! Command-line interface and process bootstrap.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use crate::daemon::Daemon;
use crate::{config, telemetry};

/// Cloud service discovery daemon for HAProxy.
#[derive(Debug, Parser)]
#[command(name = "haproxy-cloud-discovery")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Run a single discovery cycle and exit.
    #[arg(long)]
    once: bool,

    /// Validate the configuration file and exit. No network I/O.
    #[arg(long)]
    validate: bool,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config = config::load(&self.config)?;
        telemetry::init(&config.logging);

        if self.validate {
            info!(config = %self.config.display(), "Configuration is valid");
            return Ok(());
        }

        let mut daemon = Daemon::new(config).await?;
        if self.once {
            info!("Running single discovery cycle");
            daemon.run_once().await?;
        } else {
            daemon.run().await?;
        }

        Ok(())
    }
}
