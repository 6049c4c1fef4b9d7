//! CLI entry point: load and validate the configuration, print the
//! startup dashboard, then hand control to the reactor.

use std::path::PathBuf;

use anyhow::Context;
use webserv_core::config::AppConfig;
use webserv_core::Server;

fn main() -> anyhow::Result<()> {
    weblog::init_subscriber();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./config.yaml"));

    let config = AppConfig::load(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;
    config.display_config();

    let mut server = Server::new(config).context("starting server")?;
    server.run().context("running server")?;
    Ok(())
}
