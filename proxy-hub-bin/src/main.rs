use clap::Parser;
use proxy_hub_common::config::HubConfig;
use proxy_hub_common::logger::Logger;
use proxy_hub_core::{ProxyHub, RestCloudApi, WsTransport};
use proxy_hub_error::HubResult;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "proxy-hub", version, about = "Device-linking and message-relay hub")]
struct Cli {
    /// Configuration file (TOML/JSON, extension optional).
    #[arg(short, long, env = "PROXY_HUB_CONFIG", default_value = "proxy-hub")]
    config: String,
}

#[tokio::main]
async fn main() -> HubResult<()> {
    let cli = Cli::parse();
    let config = HubConfig::load(&cli.config)?;

    let mut logger = Logger::from_config_level(&config.log_level);
    logger.initialize()?;

    info!(
        broker = %config.cloud.web_socket_url,
        data_dir = %config.data_dir.display(),
        "starting proxy hub"
    );

    let cloud_api = Arc::new(RestCloudApi::new(config.cloud.api_url.clone()));
    let hub = ProxyHub::start(&config, Arc::new(WsTransport), cloud_api).await;

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    hub.shutdown().await;
    Ok(())
}
