mod api;
mod clock;
mod config;
mod courier;
mod engine;
mod error;
mod models;
mod notify;
mod observability;
mod state;
mod store;

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::clock::{Clock, SystemClock};
use crate::courier::http::HttpCourierProvider;
use crate::courier::{CourierProvider, UnconfiguredCourier};
use crate::engine::lifecycle::EngineDeps;
use crate::engine::scheduler::RandomSelector;
use crate::notify::{LogNotifier, LogRefundGateway};
use crate::store::memory::MemoryStore;

#[tokio::main]
async fn main() -> Result<(), error::AppError> {
    let config = config::Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let settings = config.engine_settings();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let courier: Arc<dyn CourierProvider> = match (&config.courier_base_url, &config.courier_api_key) {
        (Some(base_url), Some(api_key)) => Arc::new(
            HttpCourierProvider::new(base_url.clone(), api_key.clone(), settings.courier_timeout)
                .map_err(|err| error::AppError::Internal(err.to_string()))?,
        ),
        _ => {
            tracing::warn!("courier provider not configured; courier orders will use the own fleet");
            Arc::new(UnconfiguredCourier)
        }
    };

    let deps = EngineDeps {
        store: Arc::new(MemoryStore::new(clock.clone())),
        courier,
        notifier: Arc::new(LogNotifier),
        refunds: Arc::new(LogRefundGateway),
        selector: Arc::new(RandomSelector),
        clock,
    };

    let app_state = state::AppState::new(
        deps,
        settings,
        config.event_buffer_size,
        config.courier_webhook_token.clone(),
    );
    let shared_state = Arc::new(app_state);

    let app = api::rest::router(shared_state.clone());

    tokio::spawn(engine::sweep::run_auto_assign_loop(
        shared_state.engine.clone(),
        Duration::from_secs(config.sweep_interval_secs.max(1)),
    ));

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| error::AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port = config.http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| error::AppError::Internal(format!("server error: {err}")))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
