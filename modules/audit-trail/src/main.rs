use anyhow::Context;
use audit_trail_rs::{
    build_dispatch_table,
    config::{Config, LogFormat},
    db,
    metrics::{MeteredDispatcher, Metrics},
    migrations::{MigrationConfig, MigrationRunner},
    routes,
    secrets::{EnvSecretProvider, FallbackSecretProvider, FileSecretProvider, SecretProvider},
    services::{AuditService, AuditSink},
    transport::{self, ActiveTransport},
};
use axum::{routing::get, Router};
use event_bus::{ConsumerHandle, Dispatcher, NatsConnector, PullConsumer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,audit_trail_rs=debug,event_bus=info".into());
    match LogFormat::from_env() {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    let cfg = Config::from_env().context("invalid configuration")?;

    let secrets: Arc<dyn SecretProvider> = match &cfg.secrets_file {
        Some(path) => Arc::new(FallbackSecretProvider::new(FileSecretProvider::new(path))),
        None => Arc::new(EnvSecretProvider),
    };

    // DB + migrations (fail-fast)
    let pool = match std::env::var("DATABASE_URL") {
        Ok(url) => db::init_pool(&url).await,
        Err(_) => db::init_pool_with(secrets.database().await?.connect_options()).await,
    }
    .context("failed to connect to Postgres")?;

    let runner = MigrationRunner::new(
        pool.clone(),
        MigrationConfig::new(&cfg.migrations_dir).with_table_name(&cfg.migrations_table),
    )?;
    runner
        .run_migrations()
        .await
        .context("failed to apply migrations")?;
    // Drift is reported, never fatal
    match runner.validate_migrations().await {
        Ok(validation) if !validation.is_clean() => tracing::warn!(
            mismatches = validation.mismatches.len(),
            missing = validation.missing.len(),
            "Migration history does not match files on disk"
        ),
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "Migration validation failed"),
    }

    let metrics = Metrics::new()?;
    metrics.dep_up.with_label_values(&["db"]).set(1);

    let service = AuditService::new(pool);
    let sink: Arc<dyn AuditSink> = Arc::new(service.clone());
    let table = build_dispatch_table(sink);
    let topics = table.topics();
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(MeteredDispatcher::new(
        Arc::new(table),
        metrics.clone(),
        topics.clone(),
    ));

    let active = transport::resolve(
        cfg.transport,
        &cfg.push.sidecar_health_url,
        cfg.push.probe_timeout,
    )
    .await;
    tracing::info!(
        requested = cfg.transport.as_str(),
        active = active.as_str(),
        topics = topics.len(),
        "Transport selected"
    );

    let consumer: Option<Arc<ConsumerHandle>> = match active {
        ActiveTransport::Pull => {
            let broker = secrets.broker().await?;
            let connector = NatsConnector::new(&broker.url).with_client_name("audit-trail");
            let consumer_config = cfg.broker.consumer_config(&broker.queue, topics.clone());
            Some(Arc::new(
                PullConsumer::new(connector, dispatcher.clone(), consumer_config).start(),
            ))
        }
        ActiveTransport::Push => None,
    };

    // Health + Metrics states
    let health_state = Arc::new(routes::health::HealthState {
        service: service.clone(),
        transport: active,
        consumer: consumer.clone(),
        metrics: metrics.clone(),
    });

    let metrics_state = Arc::new(routes::metrics::MetricsState {
        metrics: metrics.clone(),
    });

    // Build routers separately then merge
    let health_router = Router::new()
        .route("/health/live", get(routes::health::health_live))
        .route("/health/ready", get(routes::health::health_ready))
        .with_state(health_state);

    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::metrics))
        .with_state(metrics_state);

    let query_router = Router::new()
        .route("/api/audit-logs", get(routes::audit_logs::get_audit_logs))
        .with_state(Arc::new(service));

    let mut app = Router::new()
        .merge(health_router)
        .merge(metrics_router)
        .merge(query_router);

    if active == ActiveTransport::Push {
        app = app.merge(routes::push::router(Arc::new(routes::push::PushState {
            dispatcher,
            pubsub_name: cfg.push.pubsub_name.clone(),
            topics,
        })));
    }

    let app = app.layer(
        CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
    );

    // Stop serving on a signal or when the consumer gives up
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        let consumer = consumer.clone();
        async move {
            tokio::select! {
                _ = shutdown_signal() => tracing::info!("Shutdown signal received"),
                phase = consumer_terminated(consumer) => {
                    tracing::error!(phase = ?phase, "Consumer terminated; shutting down");
                }
            }
            shutdown.cancel();
        }
    });

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    // Surfaces ReconnectExhausted as a non-zero exit
    if let Some(consumer) = consumer {
        consumer.stop().await?;
    }

    tracing::info!("Audit trail stopped");
    Ok(())
}

async fn consumer_terminated(consumer: Option<Arc<ConsumerHandle>>) -> event_bus::ConsumerPhase {
    match consumer {
        Some(consumer) => consumer.terminated().await,
        None => std::future::pending().await,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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
}
