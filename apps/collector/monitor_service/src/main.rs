use actix_web::{App, HttpServer, web};
use chrono::Utc;
use common::api::{self, ApiState};
use common::blued::BluedClient;
use common::chat_log::ChatLog;
use common::config::ServiceConfig;
use common::logger;
use common::queue::{JobQueue, LocalQueue, RabbitQueue, run_local_worker};
use common::recovery::RecoveryManager;
use common::session::{SessionManager, SettingsTokenSource};
use common::worker::IngestWorker;
use common::{HealthStatus, RedisKeys, ServiceError, ServiceStatus, SyncEngine};
use migration::{Migrator, MigratorTrait};
use redis::Client as RedisClient;
use sea_orm::{ConnectOptions, Database};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Heartbeat failures in a row before the service reports itself degraded.
const MAX_HEARTBEAT_FAILURES: u32 = 3;

/// Publishes the monitor's health to Redis.
struct MonitorService {
    engine: SyncEngine,
    redis_client: RedisClient,
    heartbeat_interval: Duration,
    service_status: RwLock<ServiceStatus>,
    heartbeat_failures: Mutex<u32>,
}

impl MonitorService {
    fn new(engine: SyncEngine, config: &ServiceConfig) -> Result<Self, ServiceError> {
        let redis_client = RedisClient::open(config.redis_url.as_str())?;

        Ok(Self {
            engine,
            redis_client,
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval.max(1)),
            service_status: RwLock::new(ServiceStatus::Starting),
            heartbeat_failures: Mutex::new(0),
        })
    }

    /// Register service heartbeat
    async fn register_heartbeat(&self) -> Result<(), ServiceError> {
        let health_status = HealthStatus {
            tracked_anchors: self.engine.list_anchors().await?.len(),
            running_tasks: self.engine.tasks().task_names().await,
            last_heartbeat: Utc::now(),
            status: self.service_status.read().await.clone(),
        };

        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;

        redis::cmd("SET")
            .arg(RedisKeys::HEARTBEAT_KEY)
            .arg(serde_json::to_string(&health_status)?)
            .arg("EX")
            .arg(self.heartbeat_interval.as_secs() * 3)
            .exec_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn run_heartbeat(&self, shutdown: CancellationToken) {
        let mut heartbeat_interval = tokio::time::interval(self.heartbeat_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = heartbeat_interval.tick() => {
                    match self.register_heartbeat().await {
                        Ok(()) => {
                            *self.heartbeat_failures.lock().await = 0;
                            let mut status = self.service_status.write().await;
                            if *status != ServiceStatus::ShuttingDown {
                                *status = ServiceStatus::Healthy;
                            }
                        }
                        Err(e) => {
                            error!("Failed to register heartbeat: {:?}", e);

                            let mut count = self.heartbeat_failures.lock().await;
                            *count += 1;

                            if *count > MAX_HEARTBEAT_FAILURES {
                                warn!("Multiple heartbeat failures: {}", count);
                                *self.service_status.write().await = ServiceStatus::Degraded;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Graceful shutdown
    async fn shutdown(&self) -> Result<(), ServiceError> {
        info!("Initiating graceful shutdown");

        *self.service_status.write().await = ServiceStatus::ShuttingDown;

        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        redis::cmd("DEL")
            .arg(RedisKeys::HEARTBEAT_KEY)
            .exec_async(&mut conn)
            .await?;

        info!("Cleanup completed, shutdown successful");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logger::init_tracing();

    let settings = ServiceConfig::new().expect("Failed to load configuration");
    info!("Starting monitor service");

    let db = Database::connect(
        ConnectOptions::new(&settings.database_url)
            .sqlx_logging(false)
            .to_owned(),
    )
    .await?;

    info!("Running database migrations...");
    Migrator::up(&db, None).await?;
    info!("Migrations completed successfully");

    let token_source = SettingsTokenSource::new(
        db.clone(),
        settings.blued_auth_key.clone(),
        settings.blued_auth_token.clone(),
    );
    let session = Arc::new(SessionManager::new(Arc::new(token_source)));

    let recovery_manager = RecoveryManager::new(
        settings.recovery_attempts.max(1),
        Duration::from_secs(1),  // base delay
        Duration::from_secs(30), // max delay
    );
    let client = BluedClient::new(
        settings.blued_api_url.clone(),
        Duration::from_secs(settings.request_timeout),
        session.clone(),
        recovery_manager,
    )?;
    info!("Blued client initialized");

    let queue: Arc<dyn JobQueue> = if settings.embedded_writer {
        info!("Running the ingest worker in-process");
        let (queue, jobs) = LocalQueue::new();
        let chat_log = ChatLog::new(logger::create_child_logger("chat"));
        let worker = IngestWorker::new(db.clone(), Arc::new(chat_log));
        tokio::spawn(run_local_worker(jobs, worker));
        Arc::new(queue)
    } else {
        Arc::new(RabbitQueue::connect(&settings.rabbitmq_url).await?)
    };

    let engine = SyncEngine::new(db, Arc::new(client), queue, settings.sync_settings());
    let service = Arc::new(MonitorService::new(engine.clone(), &settings)?);
    let shutdown = CancellationToken::new();

    let poller = tokio::spawn({
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        async move { engine.run_poller(shutdown).await }
    });
    let rotation = tokio::spawn({
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        let offset = settings.utc_offset_hours;
        async move { engine.run_name_rotation(offset, shutdown).await }
    });
    let heartbeat = tokio::spawn({
        let service = service.clone();
        let shutdown = shutdown.clone();
        async move { service.run_heartbeat(shutdown).await }
    });

    let state = web::Data::new(ApiState {
        engine,
        session,
        auth_key: settings.blued_auth_key.clone(),
    });
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(api::configure)
    })
    .bind(settings.http_bind.as_str())?
    .run();
    let server_handle = server.handle();

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("HTTP server error: {:?}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    shutdown.cancel();
    server_handle.stop(true).await;
    for (name, task) in [("poller", poller), ("rotation", rotation), ("heartbeat", heartbeat)] {
        if let Err(e) = task.await {
            error!("{} task failed: {:?}", name, e);
        }
    }

    if let Err(e) = service.shutdown().await {
        error!("Error during shutdown: {:?}", e);
    }

    Ok(())
}
