use mimalloc::MiMalloc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use pgwarden::db::client::redact_url;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let cfg = &pgwarden::config::CONFIG;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.loglevel.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false),
        )
        .init();

    let policy = cfg
        .policy_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<none>".to_string());
    info!(
        direct_url = %redact_url(&cfg.direct_url),
        max_connections = cfg.max_connections,
        policy = %policy,
        loglevel = %cfg.loglevel
    );

    let db = pgwarden::db::client().await?;
    let enhanced = pgwarden::db::enhanced_client().await?;
    info!(
        policy_models = enhanced.policy().models.len(),
        anonymous = enhanced.context().is_anonymous(),
        "clients initialized"
    );

    let result = db.ping().await;
    match &result {
        Ok(()) => info!(pool_size = db.pool().size(), "database reachable"),
        Err(e) => warn!(error = %e, "database ping failed"),
    }

    pgwarden::db::shutdown().await;
    result?;
    Ok(())
}
