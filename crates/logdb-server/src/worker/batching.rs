//! Batching sink
//!
//! Records wait in a [`PendingBatch`] next to the delivery tags they came
//! from. A flush writes them in slices of at most `max_batch` and only then
//! acknowledges exactly the tags of the slice that was written, one by one.
//! Tags are not contiguous once invalid messages have been acked in
//! between, so a cumulative ack would confirm messages that were never
//! stored.

use async_trait::async_trait;
use logdb_common::types::DeliveryTag;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::{Disposition, Sink};
use crate::broker::Acknowledger;
use crate::error::{StoreError, WorkerResult};
use crate::liveness::Liveness;

pub const DEFAULT_MAX_BATCH: usize = 100;
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Records and their tags, index-aligned. Both sides only ever change
/// together.
#[derive(Debug)]
pub struct PendingBatch<R> {
    records: Vec<R>,
    tags: Vec<DeliveryTag>,
}

impl<R> Default for PendingBatch<R> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            tags: Vec::new(),
        }
    }
}

impl<R> PendingBatch<R> {
    pub fn push(&mut self, record: R, tag: DeliveryTag) {
        self.records.push(record);
        self.tags.push(tag);
    }

    pub fn len(&self) -> usize {
        debug_assert_eq!(self.records.len(), self.tags.len());
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The oldest `n` pairs, or all of them if fewer are pending
    pub fn front(&self, n: usize) -> (&[R], &[DeliveryTag]) {
        let n = n.min(self.len());
        (&self.records[..n], &self.tags[..n])
    }

    pub fn drain_front(&mut self, n: usize) {
        let n = n.min(self.len());
        self.records.drain(..n);
        self.tags.drain(..n);
    }
}

/// Bulk insert-or-ignore of one slice.
#[async_trait]
pub trait BatchWriter<R: Sync>: Send {
    /// Returns the number of rows actually inserted; duplicates are
    /// skipped silently.
    async fn write_batch(&mut self, records: &[R]) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub max_batch: usize,
    pub flush_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch: DEFAULT_MAX_BATCH,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub batches: u64,
    pub rows_written: u64,
    pub duplicates_ignored: u64,
}

pub struct BatchingSink<R, W> {
    pending: PendingBatch<R>,
    writer: W,
    config: BatchConfig,
    last_flush: Instant,
    stats: BatchStats,
}

impl<R, W> BatchingSink<R, W>
where
    R: Send + Sync,
    W: BatchWriter<R>,
{
    pub fn new(writer: W, config: BatchConfig) -> Self {
        Self {
            pending: PendingBatch::default(),
            writer,
            config: BatchConfig {
                max_batch: config.max_batch.max(1),
                ..config
            },
            last_flush: Instant::now(),
            stats: BatchStats::default(),
        }
    }

    pub fn pending(&self) -> &PendingBatch<R> {
        &self.pending
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn stats(&self) -> BatchStats {
        self.stats
    }

    fn should_flush(&self) -> bool {
        !self.pending.is_empty()
            && (self.last_flush.elapsed() > self.config.flush_timeout || self.pending.len() >= self.config.max_batch)
    }

    /// Write and acknowledge everything pending.
    ///
    /// A failed write leaves its slice and everything after it pending and
    /// unacknowledged, and the error is returned for the process to exit on.
    pub async fn flush(&mut self, acker: &dyn Acknowledger, liveness: &dyn Liveness) -> WorkerResult<()> {
        while !self.pending.is_empty() {
            let (records, tags) = self.pending.front(self.config.max_batch);
            let size = records.len();

            let inserted = self.writer.write_batch(records).await?;
            for &tag in tags {
                acker.ack(tag, false).await?;
            }
            self.pending.drain_front(size);

            self.stats.batches += 1;
            self.stats.rows_written += inserted;
            self.stats.duplicates_ignored += (size as u64).saturating_sub(inserted);
            debug!(
                size,
                inserted,
                remaining = self.pending.len(),
                total_batches = self.stats.batches,
                "Flushed batch"
            );

            liveness.tick();
        }

        self.last_flush = Instant::now();
        Ok(())
    }
}

#[async_trait]
impl<R, W> Sink<R> for BatchingSink<R, W>
where
    R: Send + Sync,
    W: BatchWriter<R>,
{
    async fn put(&mut self, item: R, tag: DeliveryTag) -> WorkerResult<Disposition> {
        self.pending.push(item, tag);
        Ok(Disposition::Deferred)
    }

    async fn check_flush(&mut self, acker: &dyn Acknowledger, liveness: &dyn Liveness) -> WorkerResult<()> {
        if self.should_flush() {
            self.flush(acker, liveness).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, Message};
    use crate::error::WorkerError;
    use crate::liveness::NoopLiveness;
    use crate::worker::testing::{AckLog, CountingLiveness, MemorySource};
    use crate::worker::{Node, Step, Transform, Validate};
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    /// Insert-or-ignore over a shared set, remembering every slice written
    #[derive(Clone, Default)]
    struct MemoryStore {
        rows: Arc<Mutex<HashSet<u32>>>,
        writes: Arc<Mutex<Vec<Vec<u32>>>>,
        fail: bool,
    }

    #[async_trait]
    impl BatchWriter<u32> for MemoryStore {
        async fn write_batch(&mut self, records: &[u32]) -> Result<u64, StoreError> {
            if self.fail {
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
            self.writes.lock().unwrap().push(records.to_vec());
            let mut rows = self.rows.lock().unwrap();
            Ok(records.iter().filter(|r| rows.insert(**r)).count() as u64)
        }
    }

    struct FailingAcker;

    #[async_trait]
    impl Acknowledger for FailingAcker {
        async fn ack(&self, tag: DeliveryTag, _multiple: bool) -> Result<(), BrokerError> {
            Err(BrokerError::Ack {
                tag,
                reason: "channel closed".into(),
            })
        }
    }

    /// Payload is a decimal record id
    struct Ids;

    impl Validate for Ids {
        type Record = u32;

        fn validate(&self, raw: &[u8]) -> Option<u32> {
            std::str::from_utf8(raw).ok()?.parse().ok()
        }
    }

    impl Transform<u32> for Ids {
        type Output = u32;

        fn transform(&self, record: u32) -> u32 {
            record
        }
    }

    fn source_of(ids: impl IntoIterator<Item = u32>) -> MemorySource {
        let mut source = MemorySource::new(&[]);
        for id in ids {
            source.pending.push_back(Message::new(u64::from(id) + 1000, id.to_string()));
        }
        source
    }

    #[test]
    fn test_pending_batch_keeps_pairs_aligned() {
        let mut batch = PendingBatch::default();
        for (record, tag) in [("a", 4), ("b", 9), ("c", 10)] {
            batch.push(record, tag);
        }

        let (records, tags) = batch.front(2);
        assert_eq!(records, ["a", "b"]);
        assert_eq!(tags, [4, 9]);

        batch.drain_front(2);
        assert_eq!(batch.front(10), (&["c"][..], &[10u64][..]));

        batch.drain_front(5);
        assert!(batch.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_defers_until_timeout() {
        let store = MemoryStore::default();
        let acks = AckLog::default();
        let mut sink = BatchingSink::new(store.clone(), BatchConfig::default());

        assert_eq!(sink.put(7, 1).await.unwrap(), Disposition::Deferred);
        sink.check_flush(&acks, &NoopLiveness).await.unwrap();
        assert!(store.writes.lock().unwrap().is_empty());

        tokio::time::advance(Duration::from_millis(1100)).await;
        sink.check_flush(&acks, &NoopLiveness).await.unwrap();

        assert_eq!(*store.writes.lock().unwrap(), vec![vec![7]]);
        assert_eq!(acks.entries(), vec![(1, false)]);
        assert!(sink.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_batch_never_flushes() {
        let store = MemoryStore::default();
        let mut sink = BatchingSink::new(store.clone(), BatchConfig::default());

        tokio::time::advance(Duration::from_secs(5)).await;
        sink.check_flush(&AckLog::default(), &NoopLiveness).await.unwrap();

        assert!(store.writes.lock().unwrap().is_empty());
        assert_eq!(sink.stats().batches, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_250_flushes_in_three_aligned_batches() {
        let store = MemoryStore::default();
        let source = source_of(0..250);
        let acks = source.acks.clone();
        let sink = BatchingSink::new(store.clone(), BatchConfig::default());
        let mut node = Node::new(source, Ids, sink, NoopLiveness);

        while node.run_once().await.unwrap() != Step::Idle {}
        tokio::time::advance(Duration::from_millis(1100)).await;
        node.run_once().await.unwrap();

        let writes = store.writes.lock().unwrap().clone();
        assert_eq!(writes.iter().map(Vec::len).collect::<Vec<_>>(), vec![100, 100, 50]);

        let acked = acks.entries();
        assert!(acked.iter().all(|(_, multiple)| !multiple));
        let expected: Vec<DeliveryTag> = writes.concat().iter().map(|id| u64::from(*id) + 1000).collect();
        assert_eq!(acks.tags(), expected);
        assert_eq!(node.sink().stats().rows_written, 250);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acks_follow_each_slice() {
        let store = MemoryStore::default();
        let acks = AckLog::default();
        let config = BatchConfig {
            max_batch: 2,
            ..BatchConfig::default()
        };
        let mut sink = BatchingSink::new(store.clone(), config);
        let liveness = CountingLiveness::default();

        for (record, tag) in [(1, 3), (2, 5), (3, 6)] {
            sink.put(record, tag).await.unwrap();
        }
        sink.flush(&acks, &liveness).await.unwrap();

        assert_eq!(*store.writes.lock().unwrap(), vec![vec![1, 2], vec![3]]);
        assert_eq!(acks.tags(), vec![3, 5, 6]);
        assert_eq!(liveness.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_acks_nothing_and_keeps_pending() {
        let store = MemoryStore {
            fail: true,
            ..MemoryStore::default()
        };
        let acks = AckLog::default();
        let mut sink = BatchingSink::new(store, BatchConfig::default());

        sink.put(1, 1).await.unwrap();
        sink.put(2, 2).await.unwrap();
        let err = sink.flush(&acks, &NoopLiveness).await.unwrap_err();

        assert!(matches!(err, WorkerError::Store(_)));
        assert!(acks.entries().is_empty());
        assert_eq!(sink.pending().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_after_crash_before_ack_is_absorbed() {
        let store = MemoryStore::default();

        // First process writes the batch, then dies acknowledging it.
        let mut first = BatchingSink::new(store.clone(), BatchConfig::default());
        for id in 0..10 {
            first.put(id, u64::from(id) + 1).await.unwrap();
        }
        assert!(first.flush(&FailingAcker, &NoopLiveness).await.is_err());
        assert_eq!(store.rows.lock().unwrap().len(), 10);

        // The broker redelivers everything to the replacement.
        let source = source_of(0..10);
        let acks = source.acks.clone();
        let second = BatchingSink::new(store.clone(), BatchConfig::default());
        let mut node = Node::new(source, Ids, second, NoopLiveness);

        while node.run_once().await.unwrap() != Step::Idle {}
        tokio::time::advance(Duration::from_millis(1100)).await;
        node.run_once().await.unwrap();

        assert_eq!(store.rows.lock().unwrap().len(), 10);
        assert_eq!(acks.tags().len(), 10);
        assert_eq!(node.sink().stats().duplicates_ignored, 10);
    }
}
