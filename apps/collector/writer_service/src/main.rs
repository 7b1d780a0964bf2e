use actix_web::{App, HttpServer, web};
use common::api::health_check;
use common::chat_log::ChatLog;
use common::config::ServiceConfig;
use common::logger;
use common::queue::{declare_topology, open_consumer, run_rabbit_consumer};
use common::worker::IngestWorker;
use common::ServiceError;
use lapin::{Channel, Connection, ConnectionProperties};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database};
use std::sync::Arc;
use tracing::{error, info};

struct WriterService {
    worker: IngestWorker,
    // Dropping the connection closes the channel.
    _rabbit_conn: Connection,
    rabbit_channel: Channel,
    num_consumers: u32,
}

impl WriterService {
    async fn new(config: &ServiceConfig) -> Result<Self, ServiceError> {
        let db = Database::connect(
            ConnectOptions::new(&config.database_url)
                .sqlx_logging(false)
                .to_owned(),
        )
        .await?;

        info!("Running database migrations...");
        Migrator::up(&db, None).await?;
        info!("Migrations completed successfully");

        let rabbit_conn =
            Connection::connect(&config.rabbitmq_url, ConnectionProperties::default()).await?;
        let rabbit_channel = rabbit_conn.create_channel().await?;

        info!("Declaring RabbitMQ exchanges and queues...");
        declare_topology(&rabbit_channel).await?;

        let chat_log = ChatLog::new(logger::create_child_logger("chat"));

        Ok(Self {
            worker: IngestWorker::new(db, Arc::new(chat_log)),
            _rabbit_conn: rabbit_conn,
            rabbit_channel,
            num_consumers: config.num_consumers.max(1),
        })
    }

    async fn start(&self) -> Result<(), ServiceError> {
        let mut handles = Vec::new();

        for i in 0..self.num_consumers {
            let channel = self.rabbit_channel.clone();
            let worker = self.worker.clone();

            let handle = tokio::spawn(async move {
                let consumer = open_consumer(&channel, &format!("writer_consumer_{}", i)).await?;
                info!("Consumer {} started", i);
                run_rabbit_consumer(consumer, worker).await
            });

            handles.push(handle);
        }

        // Wait for all consumers to complete (or error)
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => (),
                Ok(Err(e)) => error!("Consumer error: {:?}", e),
                Err(e) => error!("Join error: {:?}", e),
            }
        }

        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), ServiceError> {
    logger::init_tracing();

    let config = ServiceConfig::new().expect("Failed to load configuration");
    info!("Starting writer service");

    let service = WriterService::new(&config).await?;
    let service_handle = service.start();
    let health_server =
        HttpServer::new(|| App::new().route("/health", web::get().to(health_check)))
            .bind(config.http_bind.as_str())?
            .run();

    // Run both the main service and health check server
    tokio::select! {
        result = health_server => {
            if let Err(e) = result {
                error!("Health server error: {:?}", e);
            }
        }
        result = service_handle => {
            if let Err(e) = result {
                error!("Service error: {:?}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    Ok(())
}

