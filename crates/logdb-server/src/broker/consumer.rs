//! Consume role: background dispatch into a bounded local queue

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions};
use lapin::types::FieldTable;
use logdb_common::types::DeliveryTag;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{Acknowledger, BrokerConnection, BrokerError, Message, MessageSource};

/// Default capacity of the local buffer between dispatch and the worker.
pub const DEFAULT_LOCAL_QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy)]
pub struct ConsumerOptions {
    /// Acknowledge on receipt. Only for callers that cannot track tags.
    pub auto_ack: bool,
    pub capacity: usize,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            auto_ack: false,
            capacity: DEFAULT_LOCAL_QUEUE_CAPACITY,
        }
    }
}

/// Consumer registered on its own channel.
///
/// The dispatch task only moves deliveries from the broker into the local
/// queue; it never waits on the worker. Once it stops, for any reason, the
/// next [`MessageSource::try_next`] reports the consumer as disconnected.
pub struct Consumer {
    connection: BrokerConnection,
    queue: String,
    options: ConsumerOptions,
    local: mpsc::Receiver<Message>,
    failure: Arc<Mutex<Option<String>>>,
    dispatch: JoinHandle<()>,
}

impl Consumer {
    pub async fn start(
        connection: BrokerConnection,
        queue: impl Into<String>,
        options: ConsumerOptions,
    ) -> Result<Self, BrokerError> {
        let queue = queue.into();
        if options.capacity == 0 {
            return Err(BrokerError::Config("local queue capacity must be positive".to_string()));
        }

        connection.declare_queue(&queue).await?;

        if !options.auto_ack {
            // Unacked deliveries never outnumber local buffer slots
            let prefetch = u16::try_from(options.capacity).unwrap_or(u16::MAX);
            connection
                .channel()
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(BrokerError::channel("basic.qos"))?;
        }

        let stream = connection
            .channel()
            .basic_consume(
                &queue,
                &consumer_tag(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::channel("basic.consume"))?;

        let (sender, local) = mpsc::channel(options.capacity);
        let failure = Arc::new(Mutex::new(None));
        let dispatch = tokio::spawn(consume_loop(stream, sender, options.auto_ack, Arc::clone(&failure)));

        info!(queue = %queue, auto_ack = options.auto_ack, capacity = options.capacity, "Consumer started");

        Ok(Self {
            connection,
            queue,
            options,
            local,
            failure,
            dispatch,
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stop dispatch and close the channel. Deliveries that were not
    /// acknowledged are requeued by the broker.
    pub async fn close(self) -> Result<(), BrokerError> {
        self.dispatch.abort();
        self.connection.close().await?;
        info!(queue = %self.queue, "Consumer closed");
        Ok(())
    }

    fn failure_reason(&self) -> String {
        self.failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .unwrap_or_else(|| "consumer stream ended".to_string())
    }
}

async fn consume_loop(
    mut stream: lapin::Consumer,
    sender: mpsc::Sender<Message>,
    auto_ack: bool,
    failure: Arc<Mutex<Option<String>>>,
) {
    let reason = loop {
        let delivery = match stream.next().await {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => break format!("consumer error: {e}"),
            None => break "consumer stream ended".to_string(),
        };

        if auto_ack {
            if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
                break format!("auto-ack of delivery {} failed: {e}", delivery.delivery_tag);
            }
        }

        let message = Message::new(delivery.delivery_tag, delivery.data);
        if sender.send(message).await.is_err() {
            debug!("Local queue receiver dropped, stopping dispatch");
            return;
        }
    };

    error!(%reason, "Consumer dispatch stopped");
    *failure.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(reason);
}

impl MessageSource for Consumer {
    fn try_next(&mut self) -> Result<Option<Message>, BrokerError> {
        match self.local.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) if self.connection.is_open() => Ok(None),
            Err(TryRecvError::Empty) => Err(BrokerError::Disconnected(
                "connection or channel closed".to_string(),
            )),
            Err(TryRecvError::Disconnected) => Err(BrokerError::Disconnected(self.failure_reason())),
        }
    }
}

#[async_trait]
impl Acknowledger for Consumer {
    async fn ack(&self, tag: DeliveryTag, multiple: bool) -> Result<(), BrokerError> {
        if self.options.auto_ack {
            return Ok(());
        }

        self.connection
            .channel()
            .basic_ack(tag, BasicAckOptions { multiple })
            .await
            .map_err(|e| BrokerError::Ack {
                tag,
                reason: e.to_string(),
            })
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}

/// Unique per process start so the broker management UI can tell
/// restarted workers apart.
fn consumer_tag() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "logdb".to_string());
    format!("{host}-{}", uuid::Uuid::new_v4())
}
