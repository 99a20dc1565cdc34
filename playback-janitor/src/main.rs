use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use eyre::Result;
use health::{HealthHandle, HealthRegistry};
use playback_common::config::init_tracing;
use playback_common::metrics::{serve, setup_metrics_routes};
use playback_common::store::{PgEventStore, StoreLimits};
use playback_common::time::SystemTime;
use playback_janitor::{config::Config, janitor::Janitor};
use tracing::{error, info};

use playback_janitor::metrics_consts::SWEEP_ERRORS;

async fn cleanup_loop(janitor: Janitor, liveness: HealthHandle, period: Duration) -> Result<()> {
    let mut interval = tokio::time::interval(period);

    loop {
        interval.tick().await;

        if let Err(e) = janitor.run_once().await {
            // Expired rows are already invisible to readers, a missed sweep only costs space.
            error!("janitor failed cleanup with: {}", e);
            metrics::counter!(SWEEP_ERRORS, "reason" => e.reason_code()).increment(1);
        }
        liveness.report_healthy();
    }
}

pub fn app(liveness: HealthRegistry) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
}

pub async fn index() -> &'static str {
    "playback janitor"
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env().expect("failed to load configuration from env");
    init_tracing(config.log_json);

    let liveness = HealthRegistry::new("liveness");

    let store = PgEventStore::new(
        &config.database_url,
        config.max_pg_connections,
        Duration::from_secs(10),
        StoreLimits::default(),
    )
    .await?;

    let janitor = Janitor::new(
        Arc::new(store),
        Arc::new(SystemTime {}),
        config.sweep_batch_size,
    );

    let janitor_liveness = liveness.register(
        "janitor".to_string(),
        config.cleanup_interval() * 4,
    );

    info!(
        "Starting janitor, sweeping every {:?}",
        config.cleanup_interval()
    );
    let janitor_loop = tokio::spawn(cleanup_loop(
        janitor,
        janitor_liveness,
        config.cleanup_interval(),
    ));

    let app = setup_metrics_routes(app(liveness), "playback-janitor")?;
    let bind = config.bind();
    let http_server = tokio::spawn(async move { serve(app, &bind).await });

    tokio::select! {
        res = janitor_loop => {
            error!("janitor loop exited");
            if let Err(e) = res {
                error!("janitor failed with: {}", e)
            }
        }
        res = http_server => {
            error!("http server exited");
            if let Err(e) = res {
                error!("server failed with: {}", e)
            }
        }
    }

    info!("exiting");
    Ok(())
}
