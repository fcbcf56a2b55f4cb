//! Entry point for the HAProxy cloud discovery daemon.

use clap::Parser;

use haproxy_cloud_discovery::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = cli.run().await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
