//! Stream orchestrator
//!
//! Composes the five loggers and the two writer fronts:
//!
//! ```text
//!                   ┌─ l4_flow_log     (tables)          ─┐
//!                   ├─ l7_flow_log     (tables, tags)     │
//! HandlerRegistry ──┼─ otel            (tables, tags)     ├──► FlowLogWriter
//!                   ├─ otel_compressed (tables, tags)     │    FlowTagWriter
//!                   └─ l4_packet                         ─┘
//! ```
//!
//! Construction is all or nothing: collaborators and loggers are built
//! first, and queue sets are registered with the receiver only once every
//! piece exists.

use crate::backend::Backend;
use crate::config::Config;
use crate::error::{Result, StreamError};
use crate::logger::Logger;
use crate::message::MessageType;
use crate::registry::{CMD_PLATFORMDATA, CMD_QUEUE, DebugRegistry, DebugSource, HandlerRegistry};
use crate::sink::{FlowLogWriter, FlowTagWriter, WriteSink};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, info};

/// The full ingestion pipeline
pub struct Stream {
    loggers: Vec<Logger>,
    flow_log: Arc<FlowLogWriter>,
    flow_tag: Arc<FlowTagWriter>,
    started: Mutex<bool>,
}

impl Stream {
    /// Build every logger and attach their queue sets to `receiver`
    ///
    /// Nothing is spawned here. On error nothing has been registered with
    /// `receiver` or `debug`.
    pub fn new(
        config: &Config,
        receiver: &mut HandlerRegistry,
        debug: &DebugRegistry,
        backend: &dyn Backend,
    ) -> Result<Self> {
        config.validate()?;

        let flow_log = Arc::new(FlowLogWriter::new(
            backend.flow_log_writer(config)?,
            &config.writer,
        ));
        let flow_tag = Arc::new(FlowTagWriter::new(
            backend.flow_tag_writer(config)?,
            &config.writer,
        ));

        let mut loggers = Vec::with_capacity(MessageType::ALL.len());
        for msg_type in MessageType::ALL {
            let platform = match msg_type {
                MessageType::PacketSequence => None,
                _ => Some(backend.platform_source(msg_type.as_str(), config)?),
            };
            let tags = match msg_type {
                MessageType::TaggedFlow | MessageType::PacketSequence => None,
                _ => Some(Arc::clone(&flow_tag)),
            };
            let sink = WriteSink::new(Arc::clone(&flow_log), tags);

            loggers.push(Logger::new(
                msg_type,
                config,
                Arc::clone(receiver.buffer_pool()),
                platform,
                sink,
            )?);
        }

        for logger in &loggers {
            receiver.register_handler(logger.msg_type(), Arc::clone(logger.queues()));
            debug.register(CMD_QUEUE, logger.name(), logger.queues().clone() as Arc<dyn DebugSource>);
            if let Some(table) = logger.platform_tables().first() {
                debug.register(CMD_PLATFORMDATA, logger.name(), table.clone());
            }
        }

        info!(
            loggers = loggers.len(),
            partitions = config.decoder_queue_count,
            "Stream constructed"
        );

        Ok(Self {
            loggers,
            flow_log,
            flow_tag,
            started: Mutex::new(false),
        })
    }

    /// Logger serving `msg_type`
    pub fn logger(&self, msg_type: MessageType) -> Option<&Logger> {
        self.loggers.iter().find(|l| l.msg_type() == msg_type)
    }

    /// All loggers, in construction order
    pub fn loggers(&self) -> &[Logger] {
        &self.loggers
    }

    /// Start the writers, then every logger
    ///
    /// # Errors
    /// `StreamError::AlreadyStarted` on a second call.
    pub fn start(&self) -> Result<()> {
        {
            let mut started = self.started.lock();
            if *started {
                return Err(StreamError::AlreadyStarted("stream".to_string()));
            }
            *started = true;
        }

        self.flow_log.start();
        self.flow_tag.start();
        for logger in &self.loggers {
            logger.start()?;
        }
        info!("Stream started");
        Ok(())
    }

    /// Close every logger, then flush and shut down the writers
    ///
    /// Every component is closed even if an earlier one fails; the first
    /// error is returned.
    pub async fn close(&self) -> Result<()> {
        let mut first_error = None;

        for logger in &self.loggers {
            if let Err(e) = logger.close().await {
                error!(logger = logger.name(), error = %e, "Failed to close logger");
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = self.flow_log.close().await {
            error!(error = %e, "Failed to close flow log writer");
            first_error.get_or_insert(e.into());
        }
        if let Err(e) = self.flow_tag.close().await {
            error!(error = %e, "Failed to close flow tag writer");
            first_error.get_or_insert(e.into());
        }

        info!("Stream closed");
        first_error.map_or(Ok(()), Err)
    }
}
