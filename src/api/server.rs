/// Router assembly and server startup
use axum::{routing::get, Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::context::AppContext;
use crate::error::PdsResult;
use crate::metrics;

/// Build the application router
pub fn build_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/xrpc/_health", get(health))
        .route("/metrics", get(metrics_handler))
        .route(
            "/xrpc/com.atproto.sync.subscribeRepos",
            get(crate::api::firehose::subscribe_repos),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

async fn health(
    axum::extract::State(ctx): axum::extract::State<AppContext>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "version": ctx.config.service.version }))
}

async fn metrics_handler() -> String {
    metrics::render()
}

/// Bind and serve until shutdown
pub async fn serve(ctx: AppContext) -> PdsResult<()> {
    let addr = format!(
        "{}:{}",
        ctx.config.service.hostname, ctx.config.service.port
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "server listening");
    axum::serve(listener, build_router(ctx))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
