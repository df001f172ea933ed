//! Handler and debug registries
//!
//! [`HandlerRegistry`] is where the receiver attaches: one queue set per
//! message type, keyed for O(1) lookup on every inbound buffer. Each receiver
//! thread dispatches through its own producer slot of that queue set.
//! [`DebugRegistry`] maps `(command, name)` to anything that can dump its
//! state for the debug endpoint.

use crate::buffer::BufferPool;
use crate::message::{MessageType, RecvBuffer};
use crate::platform::PlatformInfoTable;
use crate::queue::{QueueProducer, QueueSet};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Debug command for platform table dumps
pub const CMD_PLATFORMDATA: u16 = 34;

/// Debug command for queue set dumps
pub const CMD_QUEUE: u16 = 35;

struct Handler {
    queues: Arc<QueueSet<RecvBuffer>>,
    producers: Vec<QueueProducer<RecvBuffer>>,
}

/// Routes receive buffers to the queue set of their message type
pub struct HandlerRegistry {
    pool: Arc<BufferPool>,
    handlers: HashMap<MessageType, Handler>,
}

impl HandlerRegistry {
    /// Create a registry releasing undeliverable buffers to `pool`
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            handlers: HashMap::new(),
        }
    }

    /// Register the queue set serving `msg_type`
    ///
    /// A later registration for the same type replaces the earlier one.
    pub fn register_handler(&mut self, msg_type: MessageType, queues: Arc<QueueSet<RecvBuffer>>) {
        info!(
            msg_type = %msg_type,
            queue = queues.name(),
            partitions = queues.partition_count(),
            producers = queues.producer_count(),
            "Registered handler"
        );
        let producers = (0..queues.producer_count())
            .filter_map(|id| queues.producer(id))
            .collect();
        if self
            .handlers
            .insert(msg_type, Handler { queues, producers })
            .is_some()
        {
            warn!(msg_type = %msg_type, "Replaced existing handler");
        }
    }

    /// Check if a queue set is registered for `msg_type`
    pub fn has_handler(&self, msg_type: MessageType) -> bool {
        self.handlers.contains_key(&msg_type)
    }

    /// Get the number of registered handlers
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Queue set registered for `msg_type`
    pub fn handler(&self, msg_type: MessageType) -> Option<&Arc<QueueSet<RecvBuffer>>> {
        self.handlers.get(&msg_type).map(|h| &h.queues)
    }

    /// Buffers enqueued so far through each producer slot of `msg_type`
    pub fn producer_sent(&self, msg_type: MessageType) -> Vec<u64> {
        self.handlers
            .get(&msg_type)
            .map(|h| h.producers.iter().map(QueueProducer::sent).collect())
            .unwrap_or_default()
    }

    /// Pool buffers are acquired from and released to
    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Hand a buffer to the partition `shard_key` maps to, through producer slot 0
    ///
    /// Returns false if the buffer was not accepted. The buffer has been
    /// released in that case, so ownership is settled either way.
    pub async fn dispatch(&self, shard_key: u64, buffer: RecvBuffer) -> bool {
        self.dispatch_from(0, shard_key, buffer).await
    }

    /// Like [`dispatch`](Self::dispatch), through producer slot `producer`
    ///
    /// Slot ids wrap modulo the queue set's producer count.
    pub async fn dispatch_from(
        &self,
        producer: usize,
        shard_key: u64,
        buffer: RecvBuffer,
    ) -> bool {
        let msg_type = buffer.msg_type;
        let Some(handler) = self.handlers.get(&msg_type) else {
            debug!(msg_type = %msg_type, "No handler registered, releasing buffer");
            crate::metrics::try_record_rejected(msg_type.as_str(), "no_handler", 1);
            self.pool.release(buffer);
            return false;
        };

        let slot = producer % handler.producers.len().max(1);
        let result = match handler.producers.get(slot) {
            Some(producer) => producer.enqueue(shard_key, buffer).await,
            None => handler.queues.enqueue(shard_key, buffer).await,
        };

        match result {
            Ok(()) => {
                crate::metrics::try_record_received(msg_type.as_str(), 1);
                true
            }
            Err(e) => {
                debug!(msg_type = %msg_type, error = %e, "Buffer not enqueued, releasing");
                crate::metrics::try_record_rejected(msg_type.as_str(), "enqueue", 1);
                self.pool.release(e.into_inner());
                false
            }
        }
    }
}

/// Anything whose state can be dumped on demand
pub trait DebugSource: Send + Sync {
    fn dump(&self) -> serde_json::Value;
}

impl DebugSource for PlatformInfoTable {
    fn dump(&self) -> serde_json::Value {
        PlatformInfoTable::dump(self)
    }
}

impl<T: Send + 'static> DebugSource for QueueSet<T> {
    fn dump(&self) -> serde_json::Value {
        QueueSet::dump(self)
    }
}

/// Explicit registry of debug dump sources
#[derive(Default)]
pub struct DebugRegistry {
    sources: RwLock<HashMap<(u16, String), Arc<dyn DebugSource>>>,
}

impl DebugRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `source` under `cmd` and `name`
    pub fn register(&self, cmd: u16, name: impl Into<String>, source: Arc<dyn DebugSource>) {
        let name = name.into();
        debug!(cmd, name = %name, "Registered debug source");
        self.sources.write().insert((cmd, name), source);
    }

    /// Dump the source registered under `cmd` and `name`
    pub fn dump(&self, cmd: u16, name: &str) -> Option<serde_json::Value> {
        let source = self.sources.read().get(&(cmd, name.to_string())).cloned()?;
        Some(source.dump())
    }

    /// Names registered under `cmd`, sorted
    pub fn names(&self, cmd: u16) -> Vec<String> {
        let mut names: Vec<String> = self
            .sources
            .read()
            .keys()
            .filter(|(c, _)| *c == cmd)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Get the number of registered sources
    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    /// Check if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.sources.read().is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::queue::{BackpressurePolicy, QueueOptions};
    use std::time::Duration;

    fn queue_set(pool: &Arc<BufferPool>, capacity: usize) -> Arc<QueueSet<RecvBuffer>> {
        let release_pool = Arc::clone(pool);
        let options = QueueOptions {
            capacity,
            partition_count: 2,
            producer_count: 2,
            flush_interval: Duration::from_secs(1),
            backpressure: BackpressurePolicy::RejectNew,
        };
        Arc::new(
            QueueSet::new(
                "test",
                options,
                Arc::new(move |buf: RecvBuffer| release_pool.release(buf)),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_dispatch_to_registered_handler() {
        let pool = Arc::new(BufferPool::new(8, 64));
        let queues = queue_set(&pool, 4);
        let mut registry = HandlerRegistry::new(Arc::clone(&pool));
        registry.register_handler(MessageType::TaggedFlow, Arc::clone(&queues));

        assert!(registry.has_handler(MessageType::TaggedFlow));
        assert_eq!(registry.handler_count(), 1);

        let buf = pool.acquire(MessageType::TaggedFlow);
        assert!(registry.dispatch(5, buf).await);
        assert_eq!(queues.len(queues.partition_index(5)), 1);
        assert_eq!(pool.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_without_handler_releases() {
        let pool = Arc::new(BufferPool::new(8, 64));
        let registry = HandlerRegistry::new(Arc::clone(&pool));

        let buf = pool.acquire(MessageType::ProtocolLog);
        assert!(!registry.dispatch(0, buf).await);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_rejected_releases() {
        let pool = Arc::new(BufferPool::new(8, 64));
        let queues = queue_set(&pool, 1);
        let mut registry = HandlerRegistry::new(Arc::clone(&pool));
        registry.register_handler(MessageType::OpenTelemetry, queues);

        assert!(registry.dispatch(0, pool.acquire(MessageType::OpenTelemetry)).await);
        assert!(!registry.dispatch(0, pool.acquire(MessageType::OpenTelemetry)).await);
        assert_eq!(pool.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_counts_per_producer_slot() {
        let pool = Arc::new(BufferPool::new(8, 64));
        let queues = queue_set(&pool, 8);
        let mut registry = HandlerRegistry::new(Arc::clone(&pool));
        registry.register_handler(MessageType::ProtocolLog, Arc::clone(&queues));

        assert!(registry.dispatch(0, pool.acquire(MessageType::ProtocolLog)).await);
        assert!(registry.dispatch_from(1, 1, pool.acquire(MessageType::ProtocolLog)).await);
        assert!(registry.dispatch_from(3, 2, pool.acquire(MessageType::ProtocolLog)).await);

        assert_eq!(registry.producer_sent(MessageType::ProtocolLog), vec![1, 2]);
        assert!(registry.producer_sent(MessageType::TaggedFlow).is_empty());
        assert_eq!(queues.len(0) + queues.len(1), 3);
    }

    #[test]
    fn test_queue_set_as_debug_source() {
        let pool = Arc::new(BufferPool::new(8, 64));
        let debug = DebugRegistry::new();
        debug.register(CMD_QUEUE, "otel", queue_set(&pool, 4));

        let dump = debug.dump(CMD_QUEUE, "otel").unwrap();
        assert_eq!(dump["name"], "test");
        assert_eq!(dump["partitions"].as_array().unwrap().len(), 2);
        assert!(debug.dump(CMD_PLATFORMDATA, "otel").is_none());
    }

    struct Fixed(&'static str);

    impl DebugSource for Fixed {
        fn dump(&self) -> serde_json::Value {
            serde_json::json!({ "source": self.0 })
        }
    }

    #[test]
    fn test_debug_registry_lookup() {
        let debug = DebugRegistry::new();
        assert!(debug.is_empty());

        debug.register(CMD_PLATFORMDATA, "l7_flow_log", Arc::new(Fixed("l7")));
        debug.register(CMD_PLATFORMDATA, "l4_flow_log", Arc::new(Fixed("l4")));
        debug.register(1, "other", Arc::new(Fixed("other")));

        assert_eq!(debug.len(), 3);
        assert_eq!(
            debug.names(CMD_PLATFORMDATA),
            vec!["l4_flow_log".to_string(), "l7_flow_log".to_string()]
        );
        assert_eq!(
            debug.dump(CMD_PLATFORMDATA, "l7_flow_log").unwrap()["source"],
            "l7"
        );
        assert!(debug.dump(CMD_PLATFORMDATA, "other").is_none());
    }
}
