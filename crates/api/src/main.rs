//! Inventory service entry point.

use std::sync::Arc;

use api::config::{BrokerDriver, Config, LockBackend};
use inventory::{InventoryOrchestrator, OrchestratorSettings, RequestPool, build_dispatcher};
use lock::{InMemoryLockManager, LockManager, PostgresLeaseLockManager, RedisLockManager};
use messaging::{
    BrokerTransport, EventListener, InMemoryBroker, LoggingCallback, OutcomeQueues,
    SubscriptionDispatcher, TracingCallback, logging_notify,
};
use storage::PostgresStorage;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    let json = config.service.json_logs;
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

async fn build_lock_manager(config: &Config, storage: &PostgresStorage) -> Arc<dyn LockManager> {
    let settings = config.lock_settings();
    match config.lock.backend {
        LockBackend::Redis => Arc::new(
            RedisLockManager::connect(&config.lock.redis_urls, settings)
                .await
                .expect("failed to connect to redis lock nodes"),
        ),
        LockBackend::Postgres => Arc::new(PostgresLeaseLockManager::new(
            storage.pool().clone(),
            settings,
        )),
        LockBackend::Memory => {
            tracing::warn!("in-memory lock backend only excludes workers of this process");
            Arc::new(InMemoryLockManager::new(settings))
        }
    }
}

/// Producer side of the broker plus the matching consumer loop.
enum Broker {
    Memory(InMemoryBroker),
    #[cfg(feature = "kafka")]
    Kafka(Arc<messaging::KafkaTransport>),
}

impl Broker {
    fn connect(config: &Config) -> (Self, OutcomeQueues) {
        match config.broker.driver {
            BrokerDriver::Memory => {
                let (broker, queues) = InMemoryBroker::new(config.broker.channel_buffer_size);
                (Self::Memory(broker), queues)
            }
            #[cfg(feature = "kafka")]
            BrokerDriver::Kafka => {
                let (outcomes, queues) =
                    messaging::outcome_channel(config.broker.channel_buffer_size);
                let transport =
                    messaging::KafkaTransport::new(&config.broker.kafka_brokers, outcomes)
                        .expect("failed to create kafka producer");
                (Self::Kafka(Arc::new(transport)), queues)
            }
            #[cfg(not(feature = "kafka"))]
            BrokerDriver::Kafka => panic!("BROKER_DRIVER=kafka needs the `kafka` feature"),
        }
    }

    fn transport(&self) -> Arc<dyn BrokerTransport> {
        match self {
            Self::Memory(broker) => Arc::new(broker.clone()),
            #[cfg(feature = "kafka")]
            Self::Kafka(transport) => transport.clone(),
        }
    }

    /// Starts consuming every topic `dispatcher` routes.
    ///
    /// Unacknowledged messages come back after the dispatcher's redelivery
    /// delay: the in-process broker puts them back in the subscription, and
    /// Kafka rewinds the partition without storing the offset.
    #[cfg_attr(not(feature = "kafka"), allow(unused_variables))]
    async fn start_consumer(
        &self,
        config: &Config,
        dispatcher: Arc<SubscriptionDispatcher>,
        shutdown: &CancellationToken,
    ) -> JoinHandle<()> {
        match self {
            Self::Memory(broker) => {
                let (redeliver, inbox) = broker.subscribe_redeliverable(&dispatcher.topics()).await;
                tokio::spawn(dispatcher.run(inbox, Some(redeliver), shutdown.clone()))
            }
            #[cfg(feature = "kafka")]
            Self::Kafka(_) => messaging::run_kafka_consumer(
                &config.broker.kafka_brokers,
                dispatcher,
                shutdown.clone(),
            )
            .expect("failed to start kafka consumer"),
        }
    }
}

#[tokio::main]
async fn main() {
    // 1. Load configuration and initialize tracing
    let config = Config::from_env().expect("failed to load configuration");
    init_tracing(&config);
    if let Err(err) = config.validate() {
        tracing::error!(error = %err, "invalid configuration");
        std::process::exit(1);
    }

    // 2. Install Prometheus metrics recorder
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Connect storage and run migrations
    let storage = PostgresStorage::connect(&config.pool_settings())
        .await
        .expect("failed to connect to database");
    storage
        .run_migrations()
        .await
        .expect("failed to run migrations");

    // 4. Lock manager
    let locks = build_lock_manager(&config, &storage).await;

    // 5. Broker transport and event listener
    let (broker, queues) = Broker::connect(&config);
    let listener = Arc::new(
        EventListener::builder(broker.transport(), queues)
            .identity(config.identity())
            .callback(LoggingCallback::new(config.broker.publish_slow_threshold))
            .callback(TracingCallback)
            .build(),
    );
    for topic in &config.publisher_topics {
        listener.register(topic.as_str());
    }
    listener.start().await.expect("failed to start event listener");

    // 6. Orchestrator and subscription dispatcher
    let orchestrator = Arc::new(InventoryOrchestrator::new(
        storage.clone(),
        locks.clone(),
        listener.clone(),
        OrchestratorSettings {
            lock_ttl: config.lock.ttl,
            ..OrchestratorSettings::default()
        },
    ));
    let pool = Arc::new(RequestPool::default());
    let dispatcher = Arc::new(
        build_dispatcher(
            &config.broker.consumer_group,
            orchestrator.clone(),
            pool.clone(),
            config.retry_policy(),
            logging_notify(),
            listener.dead_letter_router(),
        )
        .slow_threshold(config.broker.subscribe_slow_threshold)
        .max_processing_time(config.broker.max_processing_time)
        .redelivery_delay(config.broker.redelivery_delay),
    );
    let consumer_shutdown = CancellationToken::new();
    let consumer_handle = broker
        .start_consumer(&config, dispatcher, &consumer_shutdown)
        .await;

    // 7. Build the application
    let state = api::AppState::new(orchestrator, locks.clone(), pool);
    let app = api::create_app(state, metrics_handle);

    // 8. Start server
    let addr = config.addr();
    tracing::info!(
        %addr,
        service = %config.service.name,
        version = %config.service.version,
        "starting inventory service"
    );

    let tcp_listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(tcp_listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 9. Stop consuming, flush publish outcomes, release backends
    consumer_shutdown.cancel();
    let _ = consumer_handle.await;
    listener.close().await;
    if let Err(err) = locks.close().await {
        tracing::warn!(error = %err, "lock manager close failed");
    }
    storage.close().await;

    tracing::info!("server shut down gracefully");
}
