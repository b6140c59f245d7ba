use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};

use storefront_checkout as api;

use api::config::AppConfig;
use api::errors::ServiceError;
use api::payments::{GuardedProvider, PaymentProvider, SandboxProvider, StripeProvider};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config().context("failed to load configuration")?;
    api::config::init_tracing(&cfg.log_level, cfg.log_json);

    // Init DB
    let db = api::db::establish_connection(&api::db::DbConfig::from(&cfg))
        .await
        .context("database connection failed")?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db = Arc::new(db);

    // Init events
    let (event_sender, event_rx) = api::events::channel(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(api::events::process_events(event_rx));

    let checkout_cfg = Arc::new(cfg.checkout.clone());
    let provider = build_provider(&cfg).context("failed to build payment provider")?;
    let pipeline = api::services::CheckoutPipeline::new(
        api::repositories::Stores::sea_orm(db.clone()),
        provider,
        checkout_cfg.clone(),
        event_sender,
    );

    let app_state = api::AppState {
        pipeline,
        auth: api::auth::AuthConfig::from_app_config(&cfg),
        checkout: checkout_cfg,
        db: Some(db),
    };
    let app = api::router(app_state);

    // Bind and serve
    let addr = cfg.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(%addr, environment = %cfg.environment, "storefront-checkout listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("storefront-checkout stopped");
    Ok(())
}

fn build_provider(cfg: &AppConfig) -> Result<Arc<dyn PaymentProvider>, ServiceError> {
    let checkout = &cfg.checkout;
    let timeout = checkout.provider_timeout();

    if checkout.uses_sandbox() {
        warn!("Using the in-memory sandbox payment provider; sessions are never paid by a real processor");
        return Ok(Arc::new(GuardedProvider::new(SandboxProvider::new(), timeout)));
    }

    let secret = checkout.stripe_secret_key.clone().ok_or_else(|| {
        ServiceError::InternalError("stripe_secret_key is not configured".to_string())
    })?;
    let stripe = StripeProvider::new(secret, checkout.stripe_api_base.clone(), timeout)?;
    Ok(Arc::new(GuardedProvider::new(stripe, timeout)))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
