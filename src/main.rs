use std::sync::Arc;

use log::{error, info, warn};

use mumble_web_gateway::gateway::whitelist::Whitelist;
use mumble_web_gateway::gateway::{http, servers_config_path, GatewayConfig, GatewayContext};
use mumble_web_gateway::log_level;

#[tokio::main]
async fn main() {
    env_logger::Builder::new()
        .filter_level(log_level())
        .init();

    let config = GatewayConfig::from_env();
    let servers_path = servers_config_path();
    let whitelist = match Whitelist::load(&servers_path) {
        Ok(whitelist) => whitelist,
        Err(error) => {
            error!("cannot load {}: {error}", servers_path.display());
            std::process::exit(2);
        }
    };
    if whitelist.is_empty() {
        warn!("whitelist {} has no servers", servers_path.display());
    }

    info!(
        "listening on port {}, web root {}",
        config.port,
        config.web_root.display()
    );
    let port = config.port;
    let ctx = Arc::new(GatewayContext { whitelist, config });

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(error) => {
            error!("cannot bind port {port}: {error}");
            std::process::exit(1);
        }
    };
    if let Err(error) = axum::serve(listener, http::router(ctx)).await {
        error!("server error: {error}");
        std::process::exit(1);
    }
}
