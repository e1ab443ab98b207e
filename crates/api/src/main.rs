//! courierd: the HTTP API plus every background task of the notification
//! pipeline (outbox publisher, consumer runtime, one loop per scheduler rule).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use courier_broker::{BrokerClient, ConsumerConnector};
use courier_common::config::AppConfig;
use courier_common::db::{create_pool, run_migrations};
use courier_common::redis_pool::create_redis_pool;
use courier_common::shutdown::ShutdownController;
use courier_common::telemetry;
use courier_consumer::{Backoff, ConsumerRuntime, ConsumerStatus, DeliveryStore};
use courier_engine::{NotificationService, OutboxPublisher};
use courier_store::{EventStore, PgEventStore};

use courier_api::routes::create_router;
use courier_api::state::AppState;

/// How long background tasks get to finish after the server stopped.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    telemetry::init("courier=info,tower_http=info", &config.log_format);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting courierd...");

    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;
    let store: Arc<dyn EventStore> = Arc::new(PgEventStore::new(pool));

    let broker = BrokerClient::new(config.redis_url.clone(), config.broker.clone());
    let redis = create_redis_pool(&config.redis_url).await?;
    let producer = Arc::new(broker.producer(redis));

    let publisher = Arc::new(OutboxPublisher::new(
        store.clone(),
        producer,
        config.outbox.batch_size,
        config.outbox.interval,
    ));
    let service = Arc::new(NotificationService::new(
        store.clone(),
        publisher.clone(),
        config.broker.topic.clone(),
        config.outbox.immediate_publish,
    ));
    let deliveries = Arc::new(DeliveryStore::new(config.consumer.retention_per_recipient));

    let controller = Arc::new(ShutdownController::new());
    let mut tasks = JoinSet::new();

    {
        let publisher = publisher.clone();
        let shutdown = controller.subscribe();
        tasks.spawn(async move { publisher.run(shutdown).await });
    }

    let consumer_status = if config.consumer.enabled {
        let connector: Arc<dyn ConsumerConnector> = Arc::new(broker.consumer_connector()?);
        let backoff = Backoff::from_config(&config.consumer)?;
        let runtime = ConsumerRuntime::new(
            connector,
            deliveries.clone(),
            backoff,
            config.broker.auto_commit_interval,
        );
        let status = runtime.status();
        let shutdown = controller.subscribe();
        tasks.spawn(async move { runtime.run(shutdown).await });
        status
    } else {
        tracing::info!("Consumer runtime disabled");
        ConsumerStatus::new()
    };

    if config.scheduler.enabled {
        for trigger in courier_scheduler::build_loops(
            &config.scheduler,
            store.clone(),
            &config.broker.topic,
        ) {
            let shutdown = controller.subscribe();
            tasks.spawn(async move { trigger.run(shutdown).await });
        }
    } else {
        tracing::info!("Scheduler disabled");
    }

    let signals = {
        let controller = controller.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            controller.trigger();
        })
    };

    let state = AppState::new(
        store,
        service,
        publisher,
        deliveries,
        consumer_status,
        Arc::new(broker),
    );

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    let mut server_shutdown = controller.subscribe();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.wait().await })
        .await;

    // The server also stops on its own error; take the tasks down with it.
    controller.trigger();
    signals.abort();

    let drain = async {
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Background task panicked");
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        tracing::warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "Background tasks still running after grace period, aborting"
        );
        tasks.abort_all();
    }

    served?;
    tracing::info!("courierd stopped.");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM (Ctrl+C elsewhere).
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received Ctrl+C");
    }
}
