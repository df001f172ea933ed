//! Sharded ingress queue set
//!
//! A [`QueueSet`] is a fixed number of independent FIFO partitions for one
//! message type. Producers pick a partition by shard key; every partition has
//! exactly one consumer, a [`PartitionReader`], handed out once.
//!
//! ```text
//!                    ┌─► Partition 0 ──► reader 0 (decoder 0)
//! producers ─key % N─┼─► Partition 1 ──► reader 1 (decoder 1)
//!                    └─► Partition N-1 ► reader N-1
//! ```
//!
//! Items leave the queue set through the release hook: either the consumer
//! calls [`PartitionReader::release`] after processing, or the queue evicts
//! them (`drop-oldest`) or drains them on close.

use crate::error::{EnqueueError, StreamError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Callback invoked exactly once for every item that leaves the queue set
pub type ReleaseHook<T> = Arc<dyn Fn(T) + Send + Sync>;

/// What a producer experiences when its partition is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Wait until the consumer frees a slot
    Block,
    /// Evict the oldest queued item (released through the hook) and enqueue
    DropOldest,
    /// Fail the enqueue and hand the item back
    RejectNew,
}

impl FromStr for BackpressurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "block" => Ok(BackpressurePolicy::Block),
            "drop-oldest" | "drop_oldest" => Ok(BackpressurePolicy::DropOldest),
            "reject-new" | "reject_new" => Ok(BackpressurePolicy::RejectNew),
            other => Err(format!(
                "{other} (expected 'block', 'drop-oldest' or 'reject-new')"
            )),
        }
    }
}

impl fmt::Display for BackpressurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackpressurePolicy::Block => "block",
            BackpressurePolicy::DropOldest => "drop-oldest",
            BackpressurePolicy::RejectNew => "reject-new",
        })
    }
}

/// Construction parameters for a [`QueueSet`]
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Max items per partition
    pub capacity: usize,
    /// Number of partitions
    pub partition_count: usize,
    /// Number of producer slots
    pub producer_count: usize,
    /// A `Flush` is delivered to each reader at least this often
    pub flush_interval: Duration,
    /// Full-partition behavior
    pub backpressure: BackpressurePolicy,
}

/// One element delivered to a partition's consumer
#[derive(Debug)]
pub enum QueueItem<T> {
    /// A queued item, now owned by the consumer
    Item(T),
    /// Flush interval elapsed
    Flush,
    /// The queue set was closed and this partition is empty
    Closed,
}

/// Per-partition counters
#[derive(Default)]
pub struct PartitionMetrics {
    /// Items accepted
    pub enqueued: AtomicU64,
    /// Items handed to the consumer
    pub dequeued: AtomicU64,
    /// Items evicted under `drop-oldest`
    pub evicted: AtomicU64,
    /// Enqueues refused under `reject-new`
    pub rejected: AtomicU64,
}

struct Partition<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Notify,
    not_full: Notify,
    metrics: PartitionMetrics,
}

impl<T> Partition<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            metrics: PartitionMetrics::default(),
        }
    }
}

struct Shared<T> {
    name: String,
    options: QueueOptions,
    partitions: Vec<Partition<T>>,
    release: ReleaseHook<T>,
    closed: AtomicBool,
}

/// A named set of independent FIFO partitions
pub struct QueueSet<T> {
    shared: Arc<Shared<T>>,
    readers: Mutex<Vec<Option<PartitionReader<T>>>>,
}

impl<T: Send + 'static> QueueSet<T> {
    /// Create a queue set
    ///
    /// Fails if capacity, partition count or producer count is zero.
    pub fn new(
        name: impl Into<String>,
        options: QueueOptions,
        release: ReleaseHook<T>,
    ) -> Result<Self, StreamError> {
        let name = name.into();
        if options.capacity == 0 {
            return Err(StreamError::Config(format!("queue '{name}': capacity must be > 0")));
        }
        if options.partition_count == 0 {
            return Err(StreamError::Config(format!(
                "queue '{name}': partition count must be > 0"
            )));
        }
        if options.producer_count == 0 {
            return Err(StreamError::Config(format!(
                "queue '{name}': producer count must be > 0"
            )));
        }
        if options.flush_interval.is_zero() {
            return Err(StreamError::Config(format!(
                "queue '{name}': flush interval must be > 0"
            )));
        }

        let partitions = (0..options.partition_count)
            .map(|_| Partition::new(options.capacity))
            .collect();

        let shared = Arc::new(Shared {
            name,
            options,
            partitions,
            release,
            closed: AtomicBool::new(false),
        });

        let readers = (0..shared.options.partition_count)
            .map(|index| {
                Some(PartitionReader {
                    shared: Arc::clone(&shared),
                    index,
                    last_flush: Instant::now(),
                })
            })
            .collect();

        Ok(Self {
            shared,
            readers: Mutex::new(readers),
        })
    }

    /// Queue set name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Number of partitions
    pub fn partition_count(&self) -> usize {
        self.shared.partitions.len()
    }

    /// Number of producer slots
    pub fn producer_count(&self) -> usize {
        self.shared.options.producer_count
    }

    /// Per-partition capacity
    pub fn capacity(&self) -> usize {
        self.shared.options.capacity
    }

    /// Partition a shard key maps to; stable for the lifetime of the set
    pub fn partition_index(&self, key: u64) -> usize {
        (key % self.shared.partitions.len() as u64) as usize
    }

    /// Enqueue into the partition selected by `key`
    pub async fn enqueue(&self, key: u64, item: T) -> Result<(), EnqueueError<T>> {
        let index = self.partition_index(key);
        self.shared.put(index, item).await
    }

    /// Handle for producer slot `id`
    pub fn producer(&self, id: usize) -> Option<QueueProducer<T>> {
        (id < self.shared.options.producer_count).then(|| QueueProducer {
            shared: Arc::clone(&self.shared),
            id,
            sent: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Take the single consumer of partition `index`
    ///
    /// Returns `None` if the index is out of range or the reader was already taken.
    pub fn take_reader(&self, index: usize) -> Option<PartitionReader<T>> {
        self.readers.lock().get_mut(index).and_then(Option::take)
    }

    /// Items currently queued in partition `index`
    pub fn len(&self, index: usize) -> usize {
        self.shared
            .partitions
            .get(index)
            .map(|p| p.items.lock().len())
            .unwrap_or(0)
    }

    /// True if every partition is empty
    pub fn is_empty(&self) -> bool {
        self.shared.partitions.iter().all(|p| p.items.lock().is_empty())
    }

    /// Counters of partition `index`
    pub fn metrics(&self, index: usize) -> Option<&PartitionMetrics> {
        self.shared.partitions.get(index).map(|p| &p.metrics)
    }

    /// Refuse further enqueues and wake every waiter
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        for partition in &self.shared.partitions {
            partition.not_empty.notify_waiters();
            partition.not_full.notify_waiters();
        }
    }

    /// True once [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Snapshot of depth and counters per partition, for the debug endpoint
    pub fn dump(&self) -> serde_json::Value {
        let partitions: Vec<serde_json::Value> = self
            .shared
            .partitions
            .iter()
            .enumerate()
            .map(|(index, p)| {
                serde_json::json!({
                    "index": index,
                    "len": p.items.lock().len(),
                    "enqueued": p.metrics.enqueued.load(Ordering::Relaxed),
                    "dequeued": p.metrics.dequeued.load(Ordering::Relaxed),
                    "evicted": p.metrics.evicted.load(Ordering::Relaxed),
                    "rejected": p.metrics.rejected.load(Ordering::Relaxed),
                })
            })
            .collect();
        serde_json::json!({
            "name": self.shared.name,
            "capacity": self.shared.options.capacity,
            "producers": self.shared.options.producer_count,
            "backpressure": self.shared.options.backpressure.to_string(),
            "closed": self.is_closed(),
            "partitions": partitions,
        })
    }

    /// Release everything still queued through the hook
    ///
    /// Returns the number of items released.
    pub fn drain_release(&self) -> usize {
        let mut released = 0;
        for partition in &self.shared.partitions {
            let drained: Vec<T> = partition.items.lock().drain(..).collect();
            released += drained.len();
            for item in drained {
                (self.shared.release)(item);
            }
            partition.not_full.notify_waiters();
        }
        released
    }
}

impl<T> Shared<T> {
    async fn put(&self, index: usize, item: T) -> Result<(), EnqueueError<T>> {
        let partition = &self.partitions[index];

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(EnqueueError::Closed(item));
            }

            let notified = partition.not_full.notified();
            {
                let mut items = partition.items.lock();
                if items.len() < self.options.capacity {
                    items.push_back(item);
                    drop(items);
                    partition.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
                    partition.not_empty.notify_one();
                    return Ok(());
                }

                match self.options.backpressure {
                    BackpressurePolicy::Block => {}
                    BackpressurePolicy::DropOldest => {
                        let evicted = items.pop_front();
                        items.push_back(item);
                        drop(items);
                        partition.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
                        partition.not_empty.notify_one();
                        if let Some(evicted) = evicted {
                            partition.metrics.evicted.fetch_add(1, Ordering::Relaxed);
                            crate::metrics::try_record_queue_evicted(&self.name, index, 1);
                            (self.release)(evicted);
                        }
                        return Ok(());
                    }
                    BackpressurePolicy::RejectNew => {
                        drop(items);
                        partition.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                        return Err(EnqueueError::Full {
                            partition: index,
                            item,
                        });
                    }
                }
            }

            // still own the item; re-check capacity and the closed flag
            notified.await;
        }
    }
}

/// Producer handle bound to one producer slot
pub struct QueueProducer<T> {
    shared: Arc<Shared<T>>,
    id: usize,
    sent: Arc<AtomicU64>,
}

impl<T> Clone for QueueProducer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            id: self.id,
            sent: Arc::clone(&self.sent),
        }
    }
}

impl<T> QueueProducer<T> {
    /// Producer slot id
    pub fn id(&self) -> usize {
        self.id
    }

    /// Items this slot has enqueued
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Enqueue into the partition selected by `key`
    pub async fn enqueue(&self, key: u64, item: T) -> Result<(), EnqueueError<T>> {
        let index = (key % self.shared.partitions.len() as u64) as usize;
        self.shared.put(index, item).await?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// The single consumer of one partition
pub struct PartitionReader<T> {
    shared: Arc<Shared<T>>,
    index: usize,
    last_flush: Instant,
}

impl<T> PartitionReader<T> {
    /// Partition index this reader drains
    pub fn index(&self) -> usize {
        self.index
    }

    /// Name of the owning queue set
    pub fn queue_name(&self) -> &str {
        &self.shared.name
    }

    /// Wait for the next item, flush tick or close
    ///
    /// A `Flush` is returned whenever `flush_interval` has elapsed since the
    /// previous one, even when items are waiting. Cancel safe: nothing is
    /// dequeued across an await point.
    pub async fn recv(&mut self) -> QueueItem<T> {
        let partition = &self.shared.partitions[self.index];
        let interval = self.shared.options.flush_interval;

        loop {
            let deadline = self.last_flush + interval;
            if Instant::now() >= deadline {
                self.last_flush = Instant::now();
                return QueueItem::Flush;
            }

            let notified = partition.not_empty.notified();
            if let Some(item) = partition.items.lock().pop_front() {
                partition.metrics.dequeued.fetch_add(1, Ordering::Relaxed);
                partition.not_full.notify_one();
                return QueueItem::Item(item);
            }

            if self.shared.closed.load(Ordering::Acquire) {
                return QueueItem::Closed;
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv) for the item path only
    pub fn try_recv(&mut self) -> Option<T> {
        let partition = &self.shared.partitions[self.index];
        let item = partition.items.lock().pop_front()?;
        partition.metrics.dequeued.fetch_add(1, Ordering::Relaxed);
        partition.not_full.notify_one();
        Some(item)
    }

    /// Hand a consumed item to the release hook
    pub fn release(&self, item: T) {
        (self.shared.release)(item);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_hook() -> (ReleaseHook<u64>, Arc<Mutex<Vec<u64>>>) {
        let released = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&released);
        let hook: ReleaseHook<u64> = Arc::new(move |item| sink.lock().push(item));
        (hook, released)
    }

    fn options(capacity: usize, partitions: usize, policy: BackpressurePolicy) -> QueueOptions {
        QueueOptions {
            capacity,
            partition_count: partitions,
            producer_count: 2,
            flush_interval: Duration::from_secs(60),
            backpressure: policy,
        }
    }

    #[test]
    fn test_rejects_zero_partitions() {
        let (hook, _) = counting_hook();
        let result = QueueSet::new("q", options(4, 0, BackpressurePolicy::Block), hook);
        assert!(matches!(result, Err(StreamError::Config(_))));
    }

    #[test]
    fn test_partition_index_is_stable() {
        let (hook, _) = counting_hook();
        let queues = QueueSet::new("q", options(4, 4, BackpressurePolicy::Block), hook).unwrap();

        for key in [0u64, 1, 7, 12345, u64::MAX] {
            let first = queues.partition_index(key);
            for _ in 0..100 {
                assert_eq!(queues.partition_index(key), first);
            }
            assert!(first < 4);
        }
    }

    #[tokio::test]
    async fn test_fifo_within_partition() {
        let (hook, _) = counting_hook();
        let queues = QueueSet::new("q", options(16, 4, BackpressurePolicy::Block), hook).unwrap();

        for value in 0..5u64 {
            queues.enqueue(2, value).await.unwrap();
        }

        let mut reader = queues.take_reader(2).expect("reader");
        for expected in 0..5u64 {
            match reader.recv().await {
                QueueItem::Item(value) => assert_eq!(value, expected),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_reader_taken_once() {
        let (hook, _) = counting_hook();
        let queues = QueueSet::new("q", options(4, 2, BackpressurePolicy::Block), hook).unwrap();

        assert!(queues.take_reader(1).is_some());
        assert!(queues.take_reader(1).is_none());
        assert!(queues.take_reader(5).is_none());
    }

    #[tokio::test]
    async fn test_drop_oldest_releases_evicted() {
        let (hook, released) = counting_hook();
        let queues =
            QueueSet::new("q", options(2, 1, BackpressurePolicy::DropOldest), hook).unwrap();

        for value in 0..4u64 {
            queues.enqueue(0, value).await.unwrap();
        }

        assert_eq!(*released.lock(), vec![0, 1]);
        assert_eq!(queues.len(0), 2);
        assert_eq!(
            queues.metrics(0).unwrap().evicted.load(Ordering::Relaxed),
            2
        );
    }

    #[tokio::test]
    async fn test_reject_new_hands_item_back() {
        let (hook, released) = counting_hook();
        let queues =
            QueueSet::new("q", options(1, 1, BackpressurePolicy::RejectNew), hook).unwrap();

        queues.enqueue(0, 10).await.unwrap();
        let err = queues.enqueue(0, 11).await.unwrap_err();

        assert!(matches!(err, EnqueueError::Full { partition: 0, .. }));
        assert_eq!(err.into_inner(), 11);
        assert!(released.lock().is_empty());
    }

    #[tokio::test]
    async fn test_block_waits_for_consumer() {
        let (hook, _) = counting_hook();
        let queues = Arc::new(
            QueueSet::new("q", options(1, 1, BackpressurePolicy::Block), hook).unwrap(),
        );
        let mut reader = queues.take_reader(0).unwrap();

        queues.enqueue(0, 1).await.unwrap();

        let producer = {
            let queues = Arc::clone(&queues);
            tokio::spawn(async move { queues.enqueue(0, 2).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert!(matches!(reader.recv().await, QueueItem::Item(1)));
        producer.await.unwrap().unwrap();
        assert!(matches!(reader.recv().await, QueueItem::Item(2)));
    }

    #[tokio::test]
    async fn test_flush_emitted_on_idle_partition() {
        let (hook, _) = counting_hook();
        let mut opts = options(4, 1, BackpressurePolicy::Block);
        opts.flush_interval = Duration::from_millis(20);
        let queues = QueueSet::new("q", opts, hook).unwrap();
        let mut reader = queues.take_reader(0).unwrap();

        let item = tokio::time::timeout(Duration::from_secs(1), reader.recv())
            .await
            .expect("flush within interval");
        assert!(matches!(item, QueueItem::Flush));
    }

    #[tokio::test]
    async fn test_flush_emitted_under_load() {
        let (hook, _) = counting_hook();
        let mut opts = options(10_000, 1, BackpressurePolicy::Block);
        opts.flush_interval = Duration::from_millis(10);
        let queues = QueueSet::new("q", opts, hook).unwrap();
        for value in 0..5000u64 {
            queues.enqueue(0, value).await.unwrap();
        }
        let mut reader = queues.take_reader(0).unwrap();

        tokio::time::sleep(Duration::from_millis(15)).await;
        let mut saw_flush = false;
        for _ in 0..5001 {
            if matches!(reader.recv().await, QueueItem::Flush) {
                saw_flush = true;
                break;
            }
        }
        assert!(saw_flush);
    }

    #[tokio::test]
    async fn test_close_then_drain_releases_everything() {
        let (hook, released) = counting_hook();
        let queues = QueueSet::new("q", options(8, 2, BackpressurePolicy::Block), hook).unwrap();
        let mut reader = queues.take_reader(0).unwrap();

        queues.enqueue(0, 1).await.unwrap();
        queues.enqueue(1, 2).await.unwrap();
        queues.enqueue(0, 3).await.unwrap();
        queues.close();

        assert!(matches!(
            queues.enqueue(0, 4).await,
            Err(EnqueueError::Closed(4))
        ));
        assert_eq!(queues.drain_release(), 3);
        assert!(matches!(reader.recv().await, QueueItem::Closed));

        let mut released = released.lock().clone();
        released.sort_unstable();
        assert_eq!(released, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_dump_reports_partition_state() {
        let (hook, _) = counting_hook();
        let queues =
            QueueSet::new("q", options(1, 2, BackpressurePolicy::RejectNew), hook).unwrap();

        queues.enqueue(1, 7).await.unwrap();
        assert!(queues.enqueue(1, 8).await.is_err());

        let dump = queues.dump();
        assert_eq!(dump["name"], "q");
        assert_eq!(dump["closed"], false);
        assert_eq!(dump["partitions"][0]["len"], 0);
        assert_eq!(dump["partitions"][1]["len"], 1);
        assert_eq!(dump["partitions"][1]["rejected"], 1);

        queues.close();
        assert_eq!(queues.dump()["closed"], true);
    }

    #[tokio::test]
    async fn test_producer_slots() {
        let (hook, _) = counting_hook();
        let queues = QueueSet::new("q", options(8, 2, BackpressurePolicy::Block), hook).unwrap();

        let producer = queues.producer(1).expect("slot 1");
        assert!(queues.producer(2).is_none());

        producer.enqueue(3, 42).await.unwrap();
        assert_eq!(producer.sent(), 1);
        assert_eq!(queues.len(1), 1);
    }

    #[tokio::test]
    async fn test_concurrent_producers_single_consumer() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let hook: ReleaseHook<u64> = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        let queues = Arc::new(
            QueueSet::new("q", options(64, 1, BackpressurePolicy::Block), hook).unwrap(),
        );
        let mut reader = queues.take_reader(0).unwrap();

        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let queues = Arc::clone(&queues);
                tokio::spawn(async move {
                    for i in 0..250u64 {
                        queues.enqueue(0, p * 1000 + i).await.unwrap();
                    }
                })
            })
            .collect();

        let mut last_seen = [None::<u64>; 4];
        let mut received = 0;
        while received < 1000 {
            if let QueueItem::Item(value) = reader.recv().await {
                let producer = (value / 1000) as usize;
                if let Some(prev) = last_seen[producer] {
                    assert!(value > prev, "per-producer order violated");
                }
                last_seen[producer] = Some(value);
                reader.release(value);
                received += 1;
            }
        }

        for handle in producers {
            handle.await.unwrap();
        }
        assert_eq!(released.load(Ordering::Relaxed), 1000);
    }
}
