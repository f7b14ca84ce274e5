#![forbid(unsafe_code)]

use std::net::SocketAddr;

use alumnet_server::{build_router, init_tracing, AppConfig};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let database_url = std::env::var("ALUMNET_DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("ALUMNET_DATABASE_URL is required for runtime"))?;
    let app_config = AppConfig {
        database_url: Some(database_url),
        ..AppConfig::default()
    };
    let app = build_router(&app_config)?;
    let addr = std::env::var("ALUMNET_BIND_ADDR")
        .unwrap_or_else(|_| String::from("0.0.0.0:3000"))
        .parse::<SocketAddr>()
        .map_err(|e| anyhow::anyhow!("invalid ALUMNET_BIND_ADDR: {e}"))?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "alumnet-server listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
