//! Log loader worker: broker queue to PostgreSQL

use tracing::{debug, info};

use crate::broker::{AmqpConnector, BrokerConnection, ConnectionMode, Consumer, ConsumerOptions};
use crate::config::Config;
use crate::error::WorkerResult;
use crate::liveness::Liveness;
use crate::record::LogEvent;
use crate::store::{LogRow, PgLogStore};
use crate::worker::{BatchConfig, BatchingSink, Node, Transform, Validate};

/// Parses device log records and maps them onto `logs` rows.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogLoader;

impl Validate for LogLoader {
    type Record = LogEvent;

    fn validate(&self, raw: &[u8]) -> Option<LogEvent> {
        LogEvent::parse(raw)
            .map_err(|e| debug!(error = %e, "Rejected log record"))
            .ok()
    }
}

impl Transform<LogEvent> for LogLoader {
    type Output = LogRow;

    fn transform(&self, record: LogEvent) -> LogRow {
        LogRow::from(record)
    }
}

/// Run the loader until the broker or the database fails.
pub async fn run_loader<L: Liveness>(config: &Config, liveness: L) -> WorkerResult<()> {
    let store = PgLogStore::connect(&config.database).await?;
    store.migrate().await?;

    let exchange = config.broker.exchange_in(config.namespace);
    let queue = config.broker.loader_queue_in(config.namespace);

    let mode = ConnectionMode::Exclusive(AmqpConnector::new(&config.broker.url));
    let connection = BrokerConnection::open(&mode, false).await?;
    connection.declare_exchange_and_bind(&exchange, &[&queue]).await?;

    let consumer = Consumer::start(
        connection,
        queue.clone(),
        ConsumerOptions {
            auto_ack: false,
            capacity: config.broker.local_queue_capacity,
        },
    )
    .await?;

    let sink = BatchingSink::new(
        store,
        BatchConfig {
            max_batch: config.loader.max_batch,
            flush_timeout: config.loader.flush_timeout(),
        },
    );

    info!(
        queue = %queue,
        max_batch = config.loader.max_batch,
        flush_timeout_ms = config.loader.flush_timeout_ms,
        "Loader started"
    );

    Node::new(consumer, LogLoader, sink, liveness)
        .with_idle_poll(config.loader.idle_poll())
        .run()
        .await
}
