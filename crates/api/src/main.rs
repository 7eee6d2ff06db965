use anyhow::Context;

use bulwark_infra::{AppContext, BulwarkConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var_os("BULWARK_LOG_PRETTY").is_some() {
        bulwark_observability::init_pretty();
    } else {
        bulwark_observability::init();
    }

    let config = BulwarkConfig::from_env().context("invalid configuration")?;
    let bind_addr = config.bind_addr.clone();

    let ctx = if config.use_persistent_stores {
        AppContext::connect(config)
            .await
            .context("failed to connect persistent stores")?
    } else {
        tracing::warn!("USE_PERSISTENT_STORES not set; using in-memory stores");
        AppContext::in_memory(config)
    };

    let executor = ctx.executor().spawn();
    let scheduler = ctx.scheduler().spawn();

    let app = bulwark_api::app::build_app(ctx);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("http server stopped; draining workers");
    scheduler.shutdown().await;
    executor.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
