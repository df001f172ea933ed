//! Stream ingester - sharded telemetry ingestion pipeline
//!
//! Receives framed flow logs, protocol logs, OpenTelemetry spans and packet
//! sequences, enriches them with platform metadata, rate-limits them per
//! partition and writes them to a columnar store.
//!
//! # Architecture
//!
//! ```text
//! receiver ──► HandlerRegistry ──► QueueSet (N partitions per type)
//!                                       │
//!                                       ▼
//!                  Decoder (decode ──► enrich ──► throttle) per partition
//!                                       │
//!                                       ▼
//!                       FlowLogWriter / FlowTagWriter ──► store
//! ```
//!
//! The receiver, the columnar store and the platform data source are
//! collaborators behind traits.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod backend;
pub mod buffer;
pub mod config;
pub mod decoder;
pub mod error;
pub mod logger;
pub mod message;
pub mod metrics;
pub mod metrics_server;
pub mod platform;
pub mod proto;
pub mod queue;
pub mod record;
pub mod registry;
pub mod sink;
pub mod stream;
pub mod throttle;

pub use backend::Backend;
pub use buffer::BufferPool;
pub use config::Config;
pub use error::{Result, StreamError};
pub use message::{FlowLogId, MessageType, RecvBuffer};
pub use registry::{DebugRegistry, HandlerRegistry};
pub use stream::Stream;
