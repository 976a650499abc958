use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;

use assetbridge_api::app::{build_app, AppServices};
use assetbridge_infra::config::BridgeConfig;
use assetbridge_infra::external::{AssetApi, HttpAssetApi};
use assetbridge_infra::notify::{LogNotifier, Notifier, WebhookNotifier};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    assetbridge_observability::init();

    let config = BridgeConfig::from_env().context("invalid configuration")?;
    tokio::fs::create_dir_all(&config.out_dir)
        .await
        .with_context(|| format!("failed to create {}", config.out_dir.display()))?;

    let notifier: Arc<dyn Notifier> = match &config.webhook_url {
        Some(url) => Arc::new(
            WebhookNotifier::new(url.clone()).context("failed to build webhook HTTP client")?,
        ),
        None => {
            tracing::warn!("WEBHOOK_URL not set; notifications go to the log only");
            Arc::new(LogNotifier)
        }
    };
    if config.api.bearer_token.is_none() && config.api.api_key.is_none() {
        tracing::warn!("no API_BEARER_TOKEN or API_KEY set; submissions are unauthenticated");
    }
    let api: Arc<dyn AssetApi> = Arc::new(
        HttpAssetApi::new(config.api.clone()).context("failed to build assets API HTTP client")?,
    );

    let services = Arc::new(AppServices::from_config(&config, api, notifier));
    let worker = services.queue.spawn();
    let app = build_app(services);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    worker.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
