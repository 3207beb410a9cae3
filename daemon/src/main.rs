use anyhow::Result;
use farfieldd::config::load_config;
use farfieldd::server::{get_socket_path, DaemonServer};
use farfieldd::state::DaemonState;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()))
        .init();

    info!("farfield satellite daemon (farfieldd) starting...");

    let config = load_config()?;
    let rate_limit = config.rate_limit.clone();

    let daemon_state = DaemonState::new(config);
    let state = Arc::new(Mutex::new(daemon_state));

    let server = DaemonServer::new(get_socket_path(), state, &rate_limit);
    server.run().await?;

    Ok(())
}
