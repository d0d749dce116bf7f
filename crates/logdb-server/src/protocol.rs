//! Device listener worker
//!
//! Accepts device connections, splits each stream into newline-terminated
//! JSON records and publishes every valid log record to the fanout exchange.
//! Sessions get their own channel on one shared broker connection. A fatal
//! broker error in any session takes the whole process down.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

use crate::broker::{AmqpConnector, AmqpRegistry, BrokerConnection, BrokerError, ConnectionMode, Publish, Publisher};
use crate::config::Config;
use crate::error::WorkerResult;
use crate::liveness::Liveness;
use crate::record::{is_log_record, LogEvent};

/// Registry key of the connection all device sessions share
pub const SHARED_CONNECTION_NAME: &str = "protocol";

/// Pause after a failed accept. Descriptor exhaustion fails every call
/// immediately, so retrying at once would spin.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Source of device connections.
#[async_trait]
pub trait Accept: Send + Sync + 'static {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Accept for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Opens one publisher per device session.
#[async_trait]
pub trait PublisherFactory: Send + Sync + 'static {
    type Publisher: Publish + 'static;

    async fn open(&self) -> Result<Self::Publisher, BrokerError>;
}

/// Publishers on the shared `"protocol"` connection, one channel each.
pub struct SharedExchangePublishers {
    registry: Arc<AmqpRegistry>,
    exchange: String,
    confirm_delivery: bool,
}

impl SharedExchangePublishers {
    pub fn new(registry: Arc<AmqpRegistry>, exchange: impl Into<String>, confirm_delivery: bool) -> Self {
        Self {
            registry,
            exchange: exchange.into(),
            confirm_delivery,
        }
    }

    fn mode(&self) -> ConnectionMode {
        ConnectionMode::shared(Arc::clone(&self.registry), SHARED_CONNECTION_NAME)
    }

    /// Declare the exchange and bind the downstream queues to it.
    pub async fn declare_topology(&self, queues: &[&str]) -> Result<(), BrokerError> {
        let connection = BrokerConnection::open(&self.mode(), false).await?;
        connection.declare_exchange_and_bind(&self.exchange, queues).await
    }
}

#[async_trait]
impl PublisherFactory for SharedExchangePublishers {
    type Publisher = Publisher;

    async fn open(&self) -> Result<Publisher, BrokerError> {
        let connection = BrokerConnection::open(&self.mode(), self.confirm_delivery).await?;
        Ok(Publisher::new(connection, self.exchange.clone()))
    }
}

/// What the listener does with one device line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Publish,
    /// Well-formed, but not a log record
    Ignore,
    Invalid(String),
}

pub fn screen_line(line: &str) -> Verdict {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(_) => return Verdict::Invalid("unparseable packet".to_string()),
    };

    if !is_log_record(&value) {
        return Verdict::Ignore;
    }

    match LogEvent::from_value(&value) {
        Ok(_) => Verdict::Publish,
        Err(e) => Verdict::Invalid(e.to_string()),
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub lines: u64,
    pub published: u64,
}

/// Accept devices until a session reports a fatal broker failure.
pub async fn serve<A, F, L>(listener: A, factory: Arc<F>, liveness: Arc<L>, max_line_length: usize) -> WorkerResult<()>
where
    A: Accept,
    F: PublisherFactory,
    L: Liveness + 'static,
{
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<BrokerError>(1);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept device connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    },
                };

                let factory = Arc::clone(&factory);
                let liveness = Arc::clone(&liveness);
                let fatal_tx = fatal_tx.clone();
                tokio::spawn(async move {
                    match handle_device(stream, peer, factory.as_ref(), liveness.as_ref(), max_line_length).await {
                        Ok(stats) => info!(%peer, lines = stats.lines, published = stats.published, "Device disconnected"),
                        Err(e) if e.is_fatal() => {
                            error!(%peer, error = %e, "Broker failure in device session");
                            let _ = fatal_tx.try_send(e);
                        },
                        Err(e) => warn!(%peer, error = %e, "Device session ended"),
                    }
                });
            },
            Some(err) = fatal_rx.recv() => return Err(err.into()),
        }
    }
}

async fn handle_device<F, L>(
    stream: TcpStream,
    peer: SocketAddr,
    factory: &F,
    liveness: &L,
    max_line_length: usize,
) -> Result<SessionStats, BrokerError>
where
    F: PublisherFactory,
    L: Liveness,
{
    info!(%peer, "Device connected");
    let publisher = factory.open().await?;
    let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(max_line_length));
    let mut stats = SessionStats::default();

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!(%peer, max_line_length, "Device line too long, closing session");
                break;
            },
            Err(LinesCodecError::Io(e)) => {
                debug!(%peer, error = %e, "Device stream error");
                break;
            },
        };
        stats.lines += 1;

        match screen_line(&line) {
            Verdict::Publish => {
                publisher.publish(line.as_bytes()).await?;
                stats.published += 1;
            },
            Verdict::Ignore => {},
            Verdict::Invalid(reason) => warn!(%peer, %reason, "Dropping device packet"),
        }

        liveness.tick();
    }

    Ok(stats)
}

/// Bind the listener and serve until a fatal broker error.
pub async fn run_protocol<L: Liveness + 'static>(config: &Config, liveness: L) -> WorkerResult<()> {
    let registry = Arc::new(AmqpRegistry::new(AmqpConnector::new(&config.broker.url)));
    let exchange = config.broker.exchange_in(config.namespace);
    let queue = config.broker.loader_queue_in(config.namespace);

    let publishers = SharedExchangePublishers::new(registry, exchange.clone(), config.broker.confirm_delivery);
    publishers.declare_topology(&[&queue]).await?;

    let listener = TcpListener::bind((config.protocol.host.as_str(), config.protocol.port)).await?;
    info!(addr = %listener.local_addr()?, exchange = %exchange, "Serving device connections");

    serve(listener, Arc::new(publishers), Arc::new(liveness), config.protocol.max_line_length).await
}
