use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use chat_relay::{cli::Cli, server::Server};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let server = Server::bind(cli.server_config()).await?;
    info!("tcp clients: {}", server.tcp_addr()?);
    info!("websocket clients: {}", server.ws_addr()?);
    info!("press ctrl-c to stop");

    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("server exited with error: {err:?}");
        return Err(err);
    }

    info!("shut down cleanly");
    Ok(())
}
