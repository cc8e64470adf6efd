//! `threadline serve`: Start the HTTP API server.

use super::{CmdResult, load_config};
use std::path::Path;

pub async fn run(config_path: &Path, port_override: Option<u16>) -> CmdResult {
    let mut config = load_config(config_path)?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    println!("🧵 Threadline API");
    println!("   Listening: http://{}:{}", config.gateway.host, config.gateway.port);
    println!("   Database:  {}", config.database.resolved_url());
    println!("   Provider:  {} ({})", config.default_provider, config.default_model);

    threadline_gateway::start(config).await?;

    Ok(())
}
