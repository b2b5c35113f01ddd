mod broadcast;
mod cli;
mod client;
mod config;
mod error;
mod events;
mod mux;
mod pty;
mod status;
mod web;

use anyhow::Result;
use clap::Parser;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let directive = if cli.verbose {
        "shellmux=debug"
    } else {
        "shellmux=info"
    };
    // stderr keeps logs out of an attached terminal's byte stream
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    cli::run(cli).await
}
