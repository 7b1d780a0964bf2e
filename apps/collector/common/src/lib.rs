pub mod api;
pub mod blued;
pub mod chat_log;
pub mod chat_sync;
pub mod consume_sync;
pub mod engine;
pub mod error;
pub mod poller;
pub mod queue;
pub mod recovery;
pub mod rename;
pub mod scheduler;
pub mod session;
pub mod subscription;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use engine::{SyncEngine, SyncSettings};
pub use error::SyncError;

/// Service health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub tracked_anchors: usize,
    pub running_tasks: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: ServiceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    Healthy,
    Degraded,
    Starting,
    ShuttingDown,
}

/// Infrastructure errors surfaced by the service binaries
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("RabbitMQ error: {0}")]
    RabbitMQ(#[from] lapin::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

impl From<::config::ConfigError> for ServiceError {
    fn from(e: ::config::ConfigError) -> Self {
        ServiceError::Config(e.to_string())
    }
}

/// Redis keys and prefixes
pub struct RedisKeys;

impl RedisKeys {
    pub const HEARTBEAT_KEY: &'static str = "monitor:heartbeat";
}

/// RabbitMQ exchanges and queues
pub struct RabbitMQConfig;

impl RabbitMQConfig {
    pub const INGEST_EXCHANGE: &'static str = "blued.ingest";
    pub const INGEST_QUEUE: &'static str = "blued.ingest.queue";
    pub const INGEST_ROUTING_KEY: &'static str = "ingest.job";
}

pub mod logger {
    use slog::{Drain, Logger, o};

    pub fn init_root_logger() -> Logger {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        let drain = slog_envlogger::new(drain).fuse();

        Logger::root(drain, o!("version" => env!("CARGO_PKG_VERSION")))
    }

    pub fn create_child_logger(module: &str) -> Logger {
        let parent = init_root_logger();
        parent.new(o!("module" => module.to_string()))
    }

    /// Initializes the `tracing` subscriber used for service logs.
    /// `RUST_LOG` overrides the default `info` level.
    pub fn init_tracing() {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

pub mod config {
    use crate::engine::SyncSettings;
    use config::{Config, ConfigError, Environment};
    use dotenv::dotenv;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Clone, Deserialize)]
    pub struct ServiceConfig {
        pub database_url: String,
        pub rabbitmq_url: String,
        pub redis_url: String,
        pub blued_api_url: String,
        /// `system_settings` key holding the platform auth token.
        pub blued_auth_key: String,
        pub blued_auth_token: Option<String>,
        pub request_timeout: u64,
        pub recovery_attempts: u32,
        pub poll_interval: u64,
        pub sync_interval: u64,
        pub heartbeat_interval: u64,
        pub max_consume_pages: u32,
        pub num_consumers: u32,
        pub http_bind: String,
        pub utc_offset_hours: i32,
        /// Run the ingestion worker inside monitor_service instead of
        /// publishing to RabbitMQ.
        pub embedded_writer: bool,
    }

    impl ServiceConfig {
        pub fn new() -> Result<Self, ConfigError> {
            // Load environment variables from .env file
            dotenv().ok();

            let mut s = Config::new();

            s.set_default("rabbitmq_url", "amqp://127.0.0.1:5672/%2f")?;
            s.set_default("redis_url", "redis://127.0.0.1/")?;
            s.set_default("blued_api_url", "https://app.blued.cn")?;
            s.set_default("blued_auth_key", "blued-auth")?;
            s.set_default("request_timeout", 10_i64)?;
            s.set_default("recovery_attempts", 3_i64)?;
            s.set_default("poll_interval", 60_i64)?;
            s.set_default("sync_interval", 30_i64)?;
            s.set_default("heartbeat_interval", 30_i64)?;
            s.set_default("max_consume_pages", 4_i64)?;
            s.set_default("num_consumers", 1_i64)?;
            s.set_default("http_bind", "0.0.0.0:8080")?;
            s.set_default("utc_offset_hours", 8_i64)?;
            s.set_default("embedded_writer", false)?;

            // Add in settings from the environment (with a prefix of APP)
            // Eg.. `APP_DATABASE_URL=postgres://... would set the `database_url` key
            s.merge(Environment::with_prefix("APP"))?;

            s.try_into()
        }

        pub fn sync_settings(&self) -> SyncSettings {
            SyncSettings {
                poll_interval: Duration::from_secs(self.poll_interval.max(1)),
                sync_interval: Duration::from_secs(self.sync_interval.max(1)),
                max_consume_pages: self.max_consume_pages.max(1),
            }
        }
    }
}
