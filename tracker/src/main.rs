use anyhow::Context;
use axum::{routing::get, Router};
use fleet_tracker::config::Settings;
use fleet_tracker::tracker::FleetTracker;
use fleet_tracker::{batching, db, metrics, mqtt, rest};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env().context("invalid configuration")?;

    info!("Starting fleet tracker");
    info!("MQTT broker: {}:{} ({})", settings.mqtt_broker, settings.mqtt_port, settings.mqtt_topic);
    info!("HTTP server: {}", settings.http_addr);
    info!(
        freshness_secs = settings.tracker.freshness_window.num_seconds(),
        history_capacity = settings.tracker.history_capacity,
        "Tracker configuration"
    );

    metrics::init_metrics();

    let mut tracker = FleetTracker::new(settings.tracker.clone());
    let mut archiver_handle = None;

    match settings.database_url.as_deref() {
        Some(database_url) => {
            info!("Database: {}", database_url.split('@').last().unwrap_or("***"));
            let pool = db::make_pool(database_url)
                .await
                .context("failed to connect to database")?;
            let devices = db::load_devices(&pool).await.context("failed to load devices")?;

            info!("Archive channel capacity: {}", settings.archive_channel_capacity);
            let (tx, rx) = mpsc::channel(settings.archive_channel_capacity);
            tracker = tracker.with_archive(tx);
            tracker.load(devices).await;

            let batch_size = settings.archive_batch_size;
            let batch_timeout_ms = settings.archive_batch_timeout_ms;
            archiver_handle = Some(tokio::spawn(async move {
                batching::run_archiver(rx, pool, batch_size, batch_timeout_ms).await;
            }));
        }
        None => warn!("DATABASE_URL not set, running without seeding or archival"),
    }

    let tracker = Arc::new(tracker);

    let client_id = format!("tracker-{}", uuid::Uuid::new_v4());
    let mqtt_tracker = tracker.clone();
    let (broker, port, topic) = (
        settings.mqtt_broker.clone(),
        settings.mqtt_port,
        settings.mqtt_topic.clone(),
    );
    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt::run_mqtt(broker, port, client_id, topic, mqtt_tracker).await {
            error!("MQTT task failed: {}", e);
        }
    });

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(tracker.clone()));

    let listener = tokio::net::TcpListener::bind(&settings.http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", settings.http_addr))?;

    info!("HTTP server listening on {}", settings.http_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    let archiver_done = async {
        match archiver_handle {
            Some(handle) => {
                let _ = handle.await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = mqtt_handle => {
            error!("MQTT task terminated");
        }
        _ = archiver_done => {
            error!("Archiver task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    tracker.hub().close_all();
    info!("Shutting down");
    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
