//! Command-line front end for shunt
//!
//! `shunt run` hosts the forwarding daemon together with its admin listener;
//! `push`, `grove` and `keygen` are the tools around signed configuration.

pub mod admin;
pub mod cli;
pub mod logging;
pub mod run;
pub mod signals;
pub mod tools;

pub use cli::{Cli, Commands};
pub use logging::init_logging;
pub use run::{run, RunOptions};

use anyhow::Result;

/// Execute the parsed command line
pub async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run {
            config,
            keyring,
            admin_addr,
            zk_servers,
            zk_path,
            pull_url,
        } => {
            run(RunOptions {
                config,
                keyring,
                admin_addr: Some(admin_addr),
                zk_servers,
                zk_path,
                pull_url,
            })
            .await
        }
        Commands::Push { config, key, url } => tools::push_config(&config, &key, &url).await,
        Commands::Grove { config, key, addr } => tools::serve_grove(config, &key, addr).await,
        Commands::Keygen { out } => tools::keygen(&out).map(|_| ()),
    }
}
