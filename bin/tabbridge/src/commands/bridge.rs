use std::path::Path;
use std::sync::Arc;
use tracing::info;

use tabbridge_bridge::{BridgeServer, ToolProvider, UpstreamClient};
use tabbridge_core::Config;

/// Run the bridge server until interrupted.
pub async fn run(config_path: &Path, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let mut config = Config::load_or_default(config_path)?;
    if let Some(host) = host {
        config.bridge.host = host;
    }
    if let Some(port) = port {
        config.bridge.port = port;
    }

    let upstream = Arc::new(UpstreamClient::new(
        &config.upstream.command,
        &config.upstream.args,
    ));
    upstream.connect().await?;
    info!(command = %config.upstream.command, "upstream tool provider connected");

    let server = BridgeServer::new(config.bridge, upstream)?;
    let addr = server.start().await?;
    info!(%addr, "bridge running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shutdown().await;
    Ok(())
}
