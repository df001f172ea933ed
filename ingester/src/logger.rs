//! Per message type pipeline
//!
//! A [`Logger`] owns one queue set, one decoder worker per partition and,
//! for enriched types, one platform table per partition. Everything is built
//! in [`Logger::new`]; nothing runs until [`Logger::start`].

use crate::buffer::BufferPool;
use crate::config::Config;
use crate::decoder::{Decoder, DecoderStats};
use crate::error::{Result, StreamError};
use crate::message::{MessageType, RecvBuffer};
use crate::platform::{DeviceLookup, PlatformInfoTable, PlatformSource};
use crate::queue::QueueSet;
use crate::sink::WriteSink;
use crate::throttle::{ThrottleStats, Throttler};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long `close` lets workers drain their partitions before cancelling them
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Lifecycle of a [`Logger`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggerState {
    Constructed,
    Started,
    Closed,
}

/// Pipeline of one message type
pub struct Logger {
    msg_type: MessageType,
    queues: Arc<QueueSet<RecvBuffer>>,
    platform_tables: Vec<Arc<PlatformInfoTable>>,
    decoders: Mutex<Vec<Decoder>>,
    decoder_stats: Vec<Arc<DecoderStats>>,
    throttle_stats: Vec<Arc<ThrottleStats>>,
    state: Mutex<LoggerState>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Logger {
    /// Build the queue set, platform tables and decoders for `msg_type`
    ///
    /// `platform` is `None` for types that are not enriched. The throttle
    /// quota is resolved here, once.
    pub fn new(
        msg_type: MessageType,
        config: &Config,
        pool: Arc<BufferPool>,
        platform: Option<Arc<dyn PlatformSource>>,
        sink: WriteSink,
    ) -> Result<Self> {
        let name = msg_type.as_str();
        let queues = Arc::new(QueueSet::new(
            name,
            config.queue_options(),
            Arc::new(move |buffer: RecvBuffer| pool.release(buffer)),
        )?);

        let quota = config.partition_quota(msg_type);
        let partitions = queues.partition_count();
        let mut platform_tables = Vec::new();
        let mut decoders = Vec::with_capacity(partitions);
        let mut decoder_stats = Vec::with_capacity(partitions);
        let mut throttle_stats = Vec::with_capacity(partitions);

        for index in 0..partitions {
            let lookup: Option<Arc<dyn DeviceLookup>> = match &platform {
                Some(source) => {
                    let table = Arc::new(PlatformInfoTable::new(
                        format!("{name}-{index}"),
                        Arc::clone(source),
                        config.platform_refresh,
                    ));
                    platform_tables.push(Arc::clone(&table));
                    Some(table)
                }
                None => None,
            };

            let throttler = Throttler::new(msg_type, index, quota, config.throttle_window);
            throttle_stats.push(throttler.stats());

            let reader = queues.take_reader(index).ok_or_else(|| {
                StreamError::construction(
                    format!("{name} logger"),
                    format!("reader for partition {index} already taken"),
                )
            })?;

            let decoder = Decoder::new(msg_type, reader, lookup, throttler, sink.clone());
            decoder_stats.push(decoder.stats());
            decoders.push(decoder);
        }

        info!(
            msg_type = %msg_type,
            partitions,
            quota,
            enriched = platform.is_some(),
            tags = sink.has_tag_writer(),
            "Logger constructed"
        );

        Ok(Self {
            msg_type,
            queues,
            platform_tables,
            decoders: Mutex::new(decoders),
            decoder_stats,
            throttle_stats,
            state: Mutex::new(LoggerState::Constructed),
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Logger name, the message type's name
    pub fn name(&self) -> &'static str {
        self.msg_type.as_str()
    }

    /// Message type served
    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    /// Queue set the receiver attaches to
    pub fn queues(&self) -> &Arc<QueueSet<RecvBuffer>> {
        &self.queues
    }

    /// Platform tables, one per partition; empty if not enriched
    pub fn platform_tables(&self) -> &[Arc<PlatformInfoTable>] {
        &self.platform_tables
    }

    /// Admission counters, indexed by partition
    pub fn throttle_stats(&self) -> &[Arc<ThrottleStats>] {
        &self.throttle_stats
    }

    /// Decoder counters, indexed by partition
    pub fn decoder_stats(&self) -> &[Arc<DecoderStats>] {
        &self.decoder_stats
    }

    /// Current lifecycle state
    pub fn state(&self) -> LoggerState {
        *self.state.lock()
    }

    /// Start platform refresh and spawn one worker per partition
    ///
    /// # Errors
    /// `StreamError::AlreadyStarted` unless the logger is freshly constructed.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != LoggerState::Constructed {
                return Err(StreamError::AlreadyStarted(self.name().to_string()));
            }
            *state = LoggerState::Started;
        }

        for table in &self.platform_tables {
            table.start();
        }

        let decoders = std::mem::take(&mut *self.decoders.lock());
        let count = decoders.len();
        let mut workers = self.workers.lock();
        for decoder in decoders {
            workers.push(tokio::spawn(decoder.run(self.cancel.clone())));
        }

        crate::metrics::try_set_active_workers(self.name(), count);
        info!(msg_type = %self.msg_type, workers = count, "Logger started");
        Ok(())
    }

    /// Stop refresh, drain and join workers, release what is left queued
    ///
    /// Workers get [`SHUTDOWN_GRACE`] to finish their partitions before they
    /// are cancelled. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state == LoggerState::Closed {
                return Ok(());
            }
            *state = LoggerState::Closed;
        }

        for table in &self.platform_tables {
            table.close().await;
        }

        self.queues.close();

        let workers = std::mem::take(&mut *self.workers.lock());
        let joined = futures::future::join_all(workers);
        tokio::pin!(joined);
        let results = match tokio::time::timeout(SHUTDOWN_GRACE, joined.as_mut()).await {
            Ok(results) => results,
            Err(_) => {
                warn!(msg_type = %self.msg_type, "Workers did not drain in time, cancelling");
                self.cancel.cancel();
                joined.await
            }
        };
        self.cancel.cancel();

        // never-started decoders still hold their readers
        self.decoders.lock().clear();

        let released = self.queues.drain_release();
        crate::metrics::try_set_active_workers(self.name(), 0);

        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                error!(msg_type = %self.msg_type, error = %e, "Decoder worker failed");
                first_error.get_or_insert(StreamError::Join(e.to_string()));
            }
        }

        info!(msg_type = %self.msg_type, released, "Logger closed");
        first_error.map_or(Ok(()), Err)
    }
}
