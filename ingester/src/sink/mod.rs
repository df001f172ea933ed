//! Write sinks
//!
//! Admitted records go to two independently wired writers:
//!
//! ```text
//!                         ┌─► FlowLogWriter ──batcher──► ColumnarWriter (flow_log.*)
//! decoder ──► WriteSink ──┤
//!                         └─► FlowTagWriter ──batcher──► TagValueWriter (flow_tag.*)
//! ```
//!
//! `FlowLogWriter` and `FlowTagWriter` only queue and batch. Durability,
//! retries and table layout belong to the collaborator behind the trait.

pub mod clickhouse;
pub mod stdout;

use crate::config::WriterConfig;
use crate::error::SinkError;
use crate::message::FlowLogId;
use crate::record::{DecodedRecord, FlowTag};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use clickhouse::ClickHouseWriter;
pub use stdout::{RowFormat, StdoutWriter};

/// Durable columnar store for decoded records
///
/// # Example
///
/// ```ignore
/// struct MyStore { client: MyClient }
///
/// #[async_trait]
/// impl ColumnarWriter for MyStore {
///     fn name(&self) -> &'static str { "my-store" }
///
///     async fn write(&self, table: FlowLogId, records: &[DecodedRecord]) -> Result<(), SinkError> {
///         self.client.insert(table.table(), records).await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ColumnarWriter: Send + Sync {
    /// Writer name for identification and logging
    fn name(&self) -> &'static str;

    /// Persist one batch of records for `table`
    async fn write(&self, table: FlowLogId, records: &[DecodedRecord]) -> Result<(), SinkError>;

    /// Flush buffers and close connections
    async fn shutdown(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Store for auxiliary tag-value (dictionary) rows
#[async_trait]
pub trait TagValueWriter: Send + Sync {
    /// Writer name for identification and logging
    fn name(&self) -> &'static str;

    /// Persist one batch of tag rows
    async fn write_tags(&self, tags: &[FlowTag]) -> Result<(), SinkError>;

    /// Flush buffers and close connections
    async fn shutdown(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Delivery counters of one writer
#[derive(Debug, Default)]
pub struct WriterStats {
    /// Rows handed to the collaborator successfully
    pub written: AtomicU64,
    /// Rows in batches the collaborator rejected
    pub failed: AtomicU64,
}

/// Batching front of the primary record store
pub struct FlowLogWriter {
    tx: mpsc::Sender<Vec<DecodedRecord>>,
    rx: Mutex<Option<mpsc::Receiver<Vec<DecodedRecord>>>>,
    writer: Arc<dyn ColumnarWriter>,
    batch_size: usize,
    flush_interval: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<WriterStats>,
}

impl FlowLogWriter {
    pub fn new(writer: Arc<dyn ColumnarWriter>, config: &WriterConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            writer,
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            stats: Arc::new(WriterStats::default()),
        }
    }

    /// Queue admitted records; waits only while the queue is full
    pub async fn write(&self, records: Vec<DecodedRecord>) -> Result<(), SinkError> {
        if records.is_empty() {
            return Ok(());
        }
        self.tx
            .send(records)
            .await
            .map_err(|_| SinkError::Closed(self.writer.name()))
    }

    /// Delivery counters
    pub fn stats(&self) -> Arc<WriterStats> {
        Arc::clone(&self.stats)
    }

    /// Spawn the batcher; later calls are no-ops
    pub fn start(&self) {
        let Some(rx) = self.rx.lock().take() else {
            return;
        };
        let batcher = RecordBatcher {
            writer: Arc::clone(&self.writer),
            batch_size: self.batch_size,
            stats: Arc::clone(&self.stats),
            pending: HashMap::new(),
        };
        let handle = tokio::spawn(batcher.run(rx, self.flush_interval, self.cancel.clone()));
        *self.task.lock() = Some(handle);
        info!(writer = self.writer.name(), batch_size = self.batch_size, "Flow log writer started");
    }

    /// Drain queued records, flush, and shut the collaborator down
    pub async fn close(&self) -> Result<(), SinkError> {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(writer = self.writer.name(), error = %e, "Flow log batcher failed");
            }
        }
        self.writer.shutdown().await
    }
}

struct RecordBatcher {
    writer: Arc<dyn ColumnarWriter>,
    batch_size: usize,
    stats: Arc<WriterStats>,
    pending: HashMap<FlowLogId, Vec<DecodedRecord>>,
}

impl RecordBatcher {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Vec<DecodedRecord>>,
        flush_interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(records) => self.push(records).await,
                    None => break,
                },
                _ = ticker.tick() => self.flush_all().await,
                _ = cancel.cancelled() => {
                    rx.close();
                    while let Some(records) = rx.recv().await {
                        self.push(records).await;
                    }
                    break;
                }
            }
        }

        self.flush_all().await;
        debug!(writer = self.writer.name(), "Flow log batcher stopped");
    }

    async fn push(&mut self, records: Vec<DecodedRecord>) {
        for record in records {
            let table = record.flow_log_id();
            let batch = self.pending.entry(table).or_default();
            batch.push(record);
            if batch.len() >= self.batch_size {
                let batch = std::mem::take(batch);
                self.flush(table, batch).await;
            }
        }
    }

    async fn flush_all(&mut self) {
        for table in FlowLogId::ALL {
            if let Some(batch) = self.pending.get_mut(&table) {
                if !batch.is_empty() {
                    let batch = std::mem::take(batch);
                    self.flush(table, batch).await;
                }
            }
        }
    }

    async fn flush(&self, table: FlowLogId, batch: Vec<DecodedRecord>) {
        let count = batch.len() as u64;
        match self.writer.write(table, &batch).await {
            Ok(()) => {
                self.stats.written.fetch_add(count, Ordering::Relaxed);
                crate::metrics::try_record_written(table.table(), count);
                debug!(writer = self.writer.name(), table = %table, count, "Batch written");
            }
            Err(e) => {
                self.stats.failed.fetch_add(count, Ordering::Relaxed);
                crate::metrics::try_record_sink_error(table.table(), count);
                error!(
                    writer = self.writer.name(),
                    table = %table,
                    count,
                    error = %e,
                    "Failed to write batch"
                );
            }
        }
    }
}

/// Batching front of the tag-value store
///
/// Identical tags inside one batch are written once.
pub struct FlowTagWriter {
    tx: mpsc::Sender<Vec<FlowTag>>,
    rx: Mutex<Option<mpsc::Receiver<Vec<FlowTag>>>>,
    writer: Arc<dyn TagValueWriter>,
    batch_size: usize,
    flush_interval: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<WriterStats>,
}

impl FlowTagWriter {
    pub fn new(writer: Arc<dyn TagValueWriter>, config: &WriterConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            writer,
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            stats: Arc::new(WriterStats::default()),
        }
    }

    /// Queue tag rows; waits only while the queue is full
    pub async fn write_tags(&self, tags: Vec<FlowTag>) -> Result<(), SinkError> {
        if tags.is_empty() {
            return Ok(());
        }
        self.tx
            .send(tags)
            .await
            .map_err(|_| SinkError::Closed(self.writer.name()))
    }

    /// Delivery counters
    pub fn stats(&self) -> Arc<WriterStats> {
        Arc::clone(&self.stats)
    }

    /// Spawn the batcher; later calls are no-ops
    pub fn start(&self) {
        let Some(mut rx) = self.rx.lock().take() else {
            return;
        };
        let writer = Arc::clone(&self.writer);
        let stats = Arc::clone(&self.stats);
        let batch_size = self.batch_size;
        let flush_interval = self.flush_interval;
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            let mut pending: Vec<FlowTag> = Vec::new();
            let mut seen: HashSet<FlowTag> = HashSet::new();
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                let done = tokio::select! {
                    received = rx.recv() => match received {
                        Some(tags) => {
                            for tag in tags {
                                if seen.insert(tag.clone()) {
                                    pending.push(tag);
                                }
                            }
                            if pending.len() < batch_size {
                                continue;
                            }
                            false
                        }
                        None => true,
                    },
                    _ = ticker.tick() => false,
                    _ = cancel.cancelled() => {
                        rx.close();
                        while let Some(tags) = rx.recv().await {
                            for tag in tags {
                                if seen.insert(tag.clone()) {
                                    pending.push(tag);
                                }
                            }
                        }
                        true
                    }
                };

                if !pending.is_empty() {
                    let count = pending.len() as u64;
                    match writer.write_tags(&pending).await {
                        Ok(()) => {
                            stats.written.fetch_add(count, Ordering::Relaxed);
                            crate::metrics::try_record_written("flow_tag", count);
                        }
                        Err(e) => {
                            stats.failed.fetch_add(count, Ordering::Relaxed);
                            crate::metrics::try_record_sink_error("flow_tag", count);
                            warn!(writer = writer.name(), count, error = %e, "Failed to write tags");
                        }
                    }
                    pending.clear();
                    seen.clear();
                }

                if done {
                    break;
                }
            }
            debug!(writer = writer.name(), "Flow tag batcher stopped");
        });
        *self.task.lock() = Some(handle);
        info!(writer = self.writer.name(), "Flow tag writer started");
    }

    /// Drain queued tags, flush, and shut the collaborator down
    pub async fn close(&self) -> Result<(), SinkError> {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(writer = self.writer.name(), error = %e, "Flow tag batcher failed");
            }
        }
        self.writer.shutdown().await
    }
}

/// What a decoder worker writes admitted records through
#[derive(Clone)]
pub struct WriteSink {
    flow_log: Arc<FlowLogWriter>,
    flow_tag: Option<Arc<FlowTagWriter>>,
}

impl WriteSink {
    pub fn new(flow_log: Arc<FlowLogWriter>, flow_tag: Option<Arc<FlowTagWriter>>) -> Self {
        Self { flow_log, flow_tag }
    }

    /// True if tag values are routed for this sink
    pub fn has_tag_writer(&self) -> bool {
        self.flow_tag.is_some()
    }

    /// Route a batch of admitted records, deriving tag rows where the kind has them
    ///
    /// Records are written first. A tag write failure is logged and does not
    /// fail the batch.
    pub async fn write(&self, records: Vec<DecodedRecord>) -> Result<(), SinkError> {
        let tags = self.flow_tag.as_ref().map(|flow_tag| {
            let now = chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32;
            let tags: Vec<FlowTag> = records.iter().flat_map(|r| r.tag_values(now)).collect();
            (flow_tag, tags)
        });

        self.flow_log.write(records).await?;

        if let Some((flow_tag, tags)) = tags {
            let count = tags.len();
            if let Err(e) = flow_tag.write_tags(tags).await {
                warn!(tags = count, error = %e, "Flow tag write failed, records kept");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::proto;
    use crate::record::{Enrichment, Record};

    #[derive(Default)]
    struct MemoryWriter {
        batches: Mutex<Vec<(FlowLogId, usize)>>,
        tags: Mutex<Vec<FlowTag>>,
        shutdowns: AtomicU64,
    }

    #[async_trait]
    impl ColumnarWriter for MemoryWriter {
        fn name(&self) -> &'static str {
            "memory"
        }

        async fn write(&self, table: FlowLogId, records: &[DecodedRecord]) -> Result<(), SinkError> {
            self.batches.lock().push((table, records.len()));
            Ok(())
        }

        async fn shutdown(&self) -> Result<(), SinkError> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl TagValueWriter for MemoryWriter {
        fn name(&self) -> &'static str {
            "memory"
        }

        async fn write_tags(&self, tags: &[FlowTag]) -> Result<(), SinkError> {
            self.tags.lock().extend_from_slice(tags);
            Ok(())
        }
    }

    struct FailingWriter;

    #[async_trait]
    impl ColumnarWriter for FailingWriter {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn write(&self, _: FlowLogId, _: &[DecodedRecord]) -> Result<(), SinkError> {
            Err(SinkError::Connection("down".into()))
        }
    }

    fn config(batch_size: usize) -> WriterConfig {
        WriterConfig {
            batch_size,
            queue_size: 16,
            flush_interval: Duration::from_millis(10),
        }
    }

    fn l7_record(key: &str) -> DecodedRecord {
        DecodedRecord {
            device_id: 1,
            enrichment: Enrichment::default(),
            record: Record::from(proto::ProtocolLog {
                attributes: vec![proto::KeyValue {
                    key: key.into(),
                    value: "v".into(),
                }],
                ..Default::default()
            }),
        }
    }

    fn packet_record() -> DecodedRecord {
        DecodedRecord {
            device_id: 1,
            enrichment: Enrichment::default(),
            record: Record::from(proto::PacketSequence::default()),
        }
    }

    #[tokio::test]
    async fn test_batches_grouped_by_table() {
        let memory = Arc::new(MemoryWriter::default());
        let writer = FlowLogWriter::new(memory.clone(), &config(2));
        writer.start();

        writer
            .write(vec![l7_record("a"), packet_record(), l7_record("b")])
            .await
            .unwrap();
        writer.close().await.unwrap();

        let batches = memory.batches.lock().clone();
        assert!(batches.contains(&(FlowLogId::L7Flow, 2)));
        assert!(batches.contains(&(FlowLogId::L4Packet, 1)));
        assert_eq!(writer.stats().written.load(Ordering::Relaxed), 3);
        assert_eq!(memory.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_interval_flushes_partial_batch() {
        let memory = Arc::new(MemoryWriter::default());
        let writer = FlowLogWriter::new(memory.clone(), &config(1000));
        writer.start();

        writer.write(vec![packet_record()]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(memory.batches.lock().clone(), vec![(FlowLogId::L4Packet, 1)]);
        writer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_batches_are_counted() {
        let writer = FlowLogWriter::new(Arc::new(FailingWriter), &config(1));
        writer.start();

        writer.write(vec![packet_record()]).await.unwrap();
        writer.close().await.unwrap();

        let stats = writer.stats();
        assert_eq!(stats.failed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.written.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_write_sink_routes_tags() {
        let memory = Arc::new(MemoryWriter::default());
        let flow_log = Arc::new(FlowLogWriter::new(memory.clone(), &config(100)));
        let flow_tag = Arc::new(FlowTagWriter::new(memory.clone(), &config(100)));
        flow_log.start();
        flow_tag.start();

        let sink = WriteSink::new(flow_log.clone(), Some(flow_tag.clone()));
        assert!(sink.has_tag_writer());
        sink.write(vec![l7_record("user"), l7_record("user"), packet_record()])
            .await
            .unwrap();

        flow_log.close().await.unwrap();
        flow_tag.close().await.unwrap();

        let tags = memory.tags.lock().clone();
        assert_eq!(tags.len(), 1, "duplicate tags in one batch are collapsed");
        assert_eq!(tags[0].field_name, "user");
        assert_eq!(flow_log.stats().written.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_write_sink_keeps_records_when_tags_fail() {
        let memory = Arc::new(MemoryWriter::default());
        let flow_log = Arc::new(FlowLogWriter::new(memory.clone(), &config(100)));
        let flow_tag = Arc::new(FlowTagWriter::new(memory.clone(), &config(100)));
        flow_log.start();
        flow_tag.start();
        flow_tag.close().await.unwrap();

        let sink = WriteSink::new(flow_log.clone(), Some(flow_tag));
        sink.write(vec![l7_record("user"), l7_record("peer")])
            .await
            .unwrap();
        flow_log.close().await.unwrap();

        assert!(memory.tags.lock().is_empty());
        assert_eq!(memory.batches.lock().clone(), vec![(FlowLogId::L7Flow, 2)]);
        assert_eq!(flow_log.stats().written.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let memory = Arc::new(MemoryWriter::default());
        let writer = FlowLogWriter::new(memory, &config(1));
        writer.start();
        writer.close().await.unwrap();

        assert!(matches!(
            writer.write(vec![packet_record()]).await,
            Err(SinkError::Closed("memory"))
        ));
    }
}
