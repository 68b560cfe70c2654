//! Follow-scheduling service entrypoint: loads configuration, wires up the
//! progress store, starts the Prometheus metrics server, and runs the
//! scheduler until a shutdown signal arrives.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use follow_fleet::config::Config;
use follow_fleet::metrics::{start_metrics_server, SchedulerMetrics};
use follow_fleet::scheduler::Scheduler;
use follow_fleet::store::ProgressStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .init();

    info!(metrics_port = config.metrics_port, "starting follow-scheduling service");

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await?;

    let store = ProgressStore::new(pool);
    let metrics = Arc::new(SchedulerMetrics::new()?);

    let metrics_task = {
        let metrics = metrics.clone();
        let port = config.metrics_port;
        tokio::spawn(async move { start_metrics_server(port, metrics).await })
    };

    let scheduler = Scheduler::new(store, metrics);

    if let Err(e) = scheduler.start().await {
        error!(error = %e, "scheduler refused to start");
        return Err(Box::new(e));
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }

    if let Err(e) = scheduler.stop().await {
        error!(error = %e, "scheduler failed to stop cleanly");
    }

    metrics_task.abort();

    Ok(())
}
