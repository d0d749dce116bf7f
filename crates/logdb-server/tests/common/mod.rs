//! Common test utilities for LogDB integration tests
//!
//! PostgreSQL and RabbitMQ run in throwaway containers per test
//! (testcontainers), PostgreSQL with the workspace migrations applied. Tests
//! that need them are marked `#[ignore = "requires Docker"]`:
//!
//! ```bash
//! cargo test -p logdb-server -- --ignored --nocapture
//! ```

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use lapin::options::QueueDeclareOptions;
use lapin::types::FieldTable;
use logdb_server::broker::{
    Acknowledger, AmqpConnector, BrokerConnection, BrokerError, ConnectionMode, Consumer, Message, MessageSource,
};
use logdb_server::store::PgLogStore;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use testcontainers_modules::rabbitmq::RabbitMq;
use tracing::{debug, info};

/// PostgreSQL container with the `logs` schema migrated
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
    connection_string: String,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container.get_host().await.context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");
        debug!("PostgreSQL connection: {}", connection_string);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        PgLogStore::from_pool(pool.clone())
            .migrate()
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
            connection_string,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn store(&self) -> PgLogStore {
        PgLogStore::from_pool(self.pool.clone())
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

/// RabbitMQ container reachable through the default guest account
pub struct TestRabbit {
    _container: ContainerAsync<RabbitMq>,
    url: String,
}

impl TestRabbit {
    pub async fn start() -> Result<Self> {
        info!("Starting RabbitMQ test container...");

        let container = RabbitMq::default()
            .start()
            .await
            .context("Failed to start RabbitMQ container")?;

        let host = container.get_host().await.context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5672.tcp())
            .await
            .context("Failed to get container port")?;

        let url = format!("amqp://guest:guest@{host}:{port}/%2f");
        debug!("RabbitMQ connection: {}", url);

        Ok(Self {
            _container: container,
            url,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn connector(&self) -> AmqpConnector {
        AmqpConnector::new(&self.url)
    }

    /// A connection of its own, as a separate worker process would have
    pub async fn open(&self, confirm_delivery: bool) -> BrokerConnection {
        BrokerConnection::open(&ConnectionMode::Exclusive(self.connector()), confirm_delivery)
            .await
            .expect("Failed to open broker connection")
    }

    /// Messages waiting in `queue`, not counting unacknowledged deliveries
    pub async fn ready_messages(&self, queue: &str) -> u32 {
        let connection = self.open(false).await;
        let declared = connection
            .channel()
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .expect("Queue should exist");
        declared.message_count()
    }
}

/// Poll a consumer until a message arrives.
pub async fn next_message(consumer: &mut Consumer) -> Message {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(message) = consumer.try_next().expect("Consumer failed") {
            return message;
        }
        assert!(tokio::time::Instant::now() < deadline, "no message within 10s");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Broker stand-in: hands out queued messages and records acknowledgements.
#[derive(Clone, Default)]
pub struct FakeQueue {
    pending: Arc<Mutex<VecDeque<Message>>>,
    acked: Arc<Mutex<Vec<u64>>>,
    next_tag: Arc<Mutex<u64>>,
}

impl FakeQueue {
    pub fn push(&self, payload: &str) -> u64 {
        let mut next = self.next_tag.lock().unwrap();
        *next += 1;
        self.pending.lock().unwrap().push_back(Message::new(*next, payload.as_bytes().to_vec()));
        *next
    }

    pub fn acked(&self) -> Vec<u64> {
        self.acked.lock().unwrap().clone()
    }

    pub fn is_drained(&self) -> bool {
        self.pending.lock().unwrap().is_empty()
    }
}

impl MessageSource for FakeQueue {
    fn try_next(&mut self) -> Result<Option<Message>, BrokerError> {
        Ok(self.pending.lock().unwrap().pop_front())
    }
}

#[async_trait]
impl Acknowledger for FakeQueue {
    async fn ack(&self, tag: u64, multiple: bool) -> Result<(), BrokerError> {
        assert!(!multiple, "loader must never ack cumulatively");
        self.acked.lock().unwrap().push(tag);
        Ok(())
    }
}

pub fn log_line(device: &str, time: i64, text: &str) -> String {
    serde_json::json!({"type": "log", "id": device, "time": time, "text": text}).to_string()
}

pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,logdb_server=debug,sqlx=warn,lapin=warn,testcontainers=info")),
        )
        .with_test_writer()
        .try_init();
}
