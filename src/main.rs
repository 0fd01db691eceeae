//! Shunt - TCP port forwarder with live reconfiguration

use anyhow::Result;
use clap::Parser;
use shunt_cli::{dispatch, init_logging, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    dispatch(cli).await
}
