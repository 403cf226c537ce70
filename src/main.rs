use tidehollow_pds::{api, config::ServerConfig, context::AppContext, jobs};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    let ctx = match AppContext::new(config).await {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    };

    let maintenance = jobs::spawn_maintenance(ctx.clone());

    if let Err(e) = api::server::serve(ctx).await {
        tracing::error!(error = %e, "server exited with error");
        maintenance.abort();
        std::process::exit(1);
    }
    maintenance.abort();
}
