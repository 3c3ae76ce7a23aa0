use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use catalog_reprocess::{
    app_state::AppState,
    config::AppConfig,
    db, routes,
    services::{
        cancellation::CancellationTokens,
        dispatcher::JobDispatcher,
        job_store::{JobStore, MemoryJobStore, PgJobStore},
        tenants::{PgTenantDirectory, StaticTenantDirectory, TenantDirectory},
        worker::CommandWorker,
    },
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing catalog-reprocess server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!(
        "reprocess_jobs_triggered_total",
        "Reprocess jobs accepted and dispatched"
    );
    metrics::describe_counter!(
        "reprocess_jobs_completed_total",
        "Reprocess jobs whose worker completed"
    );
    metrics::describe_counter!(
        "reprocess_jobs_failed_total",
        "Reprocess jobs whose worker failed or panicked"
    );
    metrics::describe_counter!(
        "reprocess_jobs_stopped_total",
        "Reprocess jobs that exited early after a stop request"
    );
    metrics::describe_counter!(
        "reprocess_jobs_rejected_total",
        "Triggers rejected because the tenant already had a running job"
    );
    metrics::describe_gauge!(
        "reprocess_jobs_active",
        "Jobs currently supervised by this process"
    );
    metrics::describe_histogram!(
        "reprocess_job_duration_seconds",
        "Wall time from dispatch to recorded outcome"
    );

    // Job store and tenant directory
    let jobs: Arc<dyn JobStore>;
    let tenants: Arc<dyn TenantDirectory>;
    let db_pool = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL database");
            let pool = db::init_pool(url)
                .await
                .expect("Failed to connect to database");

            tracing::info!("Running database migrations");
            db::run_migrations(&pool)
                .await
                .expect("Failed to run database migrations");

            jobs = Arc::new(PgJobStore::new(pool.clone()));
            tenants = Arc::new(PgTenantDirectory::new(pool.clone()));
            Some(pool)
        }
        None => {
            tracing::warn!(
                tenants = config.known_tenants.len(),
                "DATABASE_URL not set, job state is kept in memory only"
            );
            jobs = Arc::new(MemoryJobStore::new());
            tenants = Arc::new(StaticTenantDirectory::new(config.known_tenants.clone()));
            None
        }
    };

    // Cancellation tokens
    let tokens = Arc::new(CancellationTokens::new(&config.cancel_dir));
    tokens
        .ensure_dir()
        .await
        .expect("Failed to create cancellation token directory");
    tracing::info!(dir = %config.cancel_dir.display(), "Cancellation token directory ready");

    let worker = Arc::new(CommandWorker::new(
        config.worker_program.clone(),
        config.worker_args.clone(),
    ));
    let dispatcher = JobDispatcher::new(jobs.clone(), tenants, tokens.clone(), worker)
        .allow_overlapping(config.allow_overlapping_jobs);

    if config.recover_stale_jobs {
        match dispatcher.recover_stale_jobs().await {
            Ok(recovered) if !recovered.is_empty() => {
                tracing::warn!(count = recovered.len(), "Marked stale running jobs as failed");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Stale job recovery failed"),
        }
    }

    // Create shared application state
    let state = AppState::new(db_pool, jobs, tokens, dispatcher);
    let dispatcher = state.dispatcher.clone();

    let app = routes::api_router(state)
        // Prometheus metrics endpoint (separate state)
        .merge(
            Router::new()
                .route("/metrics", get(routes::metrics::prometheus_metrics))
                .with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(1024 * 1024)); // 1 MiB limit

    tracing::info!("Starting catalog-reprocess on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    tracing::info!(
        active = dispatcher.active_jobs().len(),
        "Server stopped, waiting for running jobs"
    );
    if dispatcher
        .shutdown(Duration::from_secs(config.shutdown_grace_secs))
        .await
    {
        tracing::info!("All jobs finished");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "Failed to listen for SIGTERM"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
