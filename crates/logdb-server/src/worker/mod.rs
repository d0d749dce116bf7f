//! Generic worker driver
//!
//! A worker is assembled from small capabilities rather than subclassed:
//! [`Validate`] turns raw bytes into a record, [`Transform`] derives the value
//! to store, and a [`Sink`] takes it and says whether the message may be
//! acknowledged now or whether the sink acknowledges later itself.
//! [`Node`] runs the fetch, process, ack cycle over those pieces.

pub mod batching;

use async_trait::async_trait;
use logdb_common::types::DeliveryTag;
use std::time::Duration;
use tracing::{debug, warn};

use crate::broker::{Acknowledger, Message, MessageSource};
use crate::error::WorkerResult;
use crate::liveness::Liveness;

pub use batching::{BatchConfig, BatchStats, BatchWriter, BatchingSink, PendingBatch};

/// Default sleep between polls of an empty local queue
pub const DEFAULT_IDLE_POLL: Duration = Duration::from_millis(250);

/// Parses and checks a raw payload.
pub trait Validate: Send {
    type Record: Send;

    /// `None` rejects the whole message; nothing is partially accepted.
    fn validate(&self, raw: &[u8]) -> Option<Self::Record>;
}

/// Derives the stored value from a validated record.
pub trait Transform<R>: Send {
    type Output: Send;

    fn transform(&self, record: R) -> Self::Output;
}

/// Outcome of handing one item to a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The item is durable; the driver acknowledges its tag right away.
    AckNow,
    /// The sink owns the tag and acknowledges it after its own write.
    Deferred,
}

/// Destination of transformed items.
#[async_trait]
pub trait Sink<T>: Send {
    async fn put(&mut self, item: T, tag: DeliveryTag) -> WorkerResult<Disposition>;

    /// Called once per fetch cycle, including cycles that fetched nothing.
    async fn check_flush(&mut self, _acker: &dyn Acknowledger, _liveness: &dyn Liveness) -> WorkerResult<()> {
        Ok(())
    }
}

/// Result of a single driver cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing was buffered
    Idle,
    /// A message reached the sink
    Processed,
    /// A message failed validation and was acknowledged without storing
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub processed: u64,
    pub dropped: u64,
}

/// Runs fetch, validate, transform, put and ack in one sequential loop.
pub struct Node<S, P, K, L> {
    source: S,
    processor: P,
    sink: K,
    liveness: L,
    idle_poll: Duration,
    stats: NodeStats,
}

/// Item type a processor hands to its sink
pub type Derived<P> = <P as Transform<<P as Validate>::Record>>::Output;

impl<S, P, K, L> Node<S, P, K, L>
where
    S: MessageSource + Acknowledger,
    P: Validate + Transform<<P as Validate>::Record>,
    K: Sink<Derived<P>>,
    L: Liveness,
{
    pub fn new(source: S, processor: P, sink: K, liveness: L) -> Self {
        Self {
            source,
            processor,
            sink,
            liveness,
            idle_poll: DEFAULT_IDLE_POLL,
            stats: NodeStats::default(),
        }
    }

    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    pub fn stats(&self) -> NodeStats {
        self.stats
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// One cycle. Only cycles that moved a message forward tick liveness.
    pub async fn run_once(&mut self) -> WorkerResult<Step> {
        self.sink.check_flush(&self.source, &self.liveness).await?;

        let Some(Message { tag, payload }) = self.source.try_next()? else {
            return Ok(Step::Idle);
        };

        let Some(record) = self.processor.validate(&payload) else {
            warn!(tag, bytes = payload.len(), "Dropping invalid message");
            self.source.ack(tag, false).await?;
            self.liveness.tick();
            self.stats.dropped += 1;
            return Ok(Step::Dropped);
        };

        let item = self.processor.transform(record);
        match self.sink.put(item, tag).await? {
            Disposition::AckNow => self.source.ack(tag, false).await?,
            Disposition::Deferred => {},
        }

        self.liveness.tick();
        self.stats.processed += 1;
        Ok(Step::Processed)
    }

    /// Loop until an error. Every error is fatal for the process.
    pub async fn run(&mut self) -> WorkerResult<()> {
        debug!(idle_poll_ms = self.idle_poll.as_millis() as u64, "Worker loop started");
        loop {
            if self.run_once().await? == Step::Idle {
                tokio::time::sleep(self.idle_poll).await;
            }
        }
    }
}
