//! Decoder workers
//!
//! One [`Decoder`] per partition, bound to that partition for life:
//!
//! ```text
//! PartitionReader ──► decode frames ──► enrich ──► throttle ──► WriteSink
//!        ▲                  │
//!        └──── release ─────┘   (always, once per buffer)
//! ```
//!
//! Per-record failures never leave the worker: malformed frames are logged
//! and counted, lookup misses fall back to zero enrichment, and the loop
//! moves on to the next buffer.

use crate::error::DecodeError;
use crate::message::{MessageType, RecvBuffer};
use crate::platform::DeviceLookup;
use crate::proto;
use crate::queue::{PartitionReader, QueueItem};
use crate::record::{DecodedRecord, Enrichment, Record};
use crate::sink::WriteSink;
use crate::throttle::Throttler;
use bytes::Buf;
use flate2::read::ZlibDecoder;
use prost::Message;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Size of the frame length prefix
const FRAME_HEADER_LEN: usize = 4;

/// Admitted records held before handing them to the sink
const PENDING_BATCH: usize = 256;

/// Upper bound on one inflated span body
pub const MAX_INFLATED_LEN: usize = 4 * 1024 * 1024;

/// Result of decoding one receive buffer
#[derive(Debug, Default)]
pub struct DecodedFrames {
    /// Records of every well-formed frame before the first bad one, with the
    /// device id each was reported by
    pub records: Vec<(u32, Record)>,
    /// Why decoding stopped early, if it did
    pub error: Option<DecodeError>,
}

/// Decode every frame of a `[u32 LE length][body]...` payload
///
/// Stops at the first malformed frame; records decoded before it are kept.
pub fn decode_frames(msg_type: MessageType, payload: &[u8]) -> DecodedFrames {
    let mut frames = DecodedFrames::default();
    let mut buf = payload;

    while buf.has_remaining() {
        let offset = payload.len() - buf.remaining();
        if buf.remaining() < FRAME_HEADER_LEN {
            frames.error = Some(DecodeError::Truncated {
                offset,
                needed: FRAME_HEADER_LEN,
                available: buf.remaining(),
            });
            break;
        }

        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            frames.error = Some(DecodeError::Truncated {
                offset,
                needed: len,
                available: buf.remaining(),
            });
            break;
        }

        let start = payload.len() - buf.remaining();
        let body = &payload[start..start + len];
        buf.advance(len);

        match decode_body(msg_type, body) {
            Ok(record) => frames.records.push(record),
            Err(e) => {
                frames.error = Some(e);
                break;
            }
        }
    }

    frames
}

fn decode_body(msg_type: MessageType, body: &[u8]) -> Result<(u32, Record), DecodeError> {
    match msg_type {
        MessageType::TaggedFlow => {
            let log = proto::FlowLog::decode(body)?;
            Ok((log.device_id, Record::try_from(log)?))
        }
        MessageType::ProtocolLog => {
            let log = proto::ProtocolLog::decode(body)?;
            Ok((log.device_id, Record::from(log)))
        }
        MessageType::OpenTelemetry => {
            let span = proto::Span::decode(body)?;
            Ok((span.device_id, Record::try_from(span)?))
        }
        MessageType::OpenTelemetryCompressed => {
            let mut inflated = Vec::with_capacity((body.len() * 4).min(MAX_INFLATED_LEN));
            ZlibDecoder::new(body)
                .take(MAX_INFLATED_LEN as u64 + 1)
                .read_to_end(&mut inflated)
                .map_err(DecodeError::Decompress)?;
            if inflated.len() > MAX_INFLATED_LEN {
                return Err(DecodeError::Oversized {
                    limit: MAX_INFLATED_LEN,
                });
            }
            let span = proto::Span::decode(inflated.as_slice())?;
            Ok((span.device_id, Record::try_from(span)?))
        }
        MessageType::PacketSequence => {
            let seq = proto::PacketSequence::decode(body)?;
            Ok((seq.device_id, Record::from(seq)))
        }
    }
}

/// Shared counters of one decoder worker
#[derive(Debug, Default)]
pub struct DecoderStats {
    pub buffers: AtomicU64,
    pub records: AtomicU64,
    pub decode_errors: AtomicU64,
    pub enrichment_misses: AtomicU64,
}

impl DecoderStats {
    /// Receive buffers consumed
    pub fn buffers(&self) -> u64 {
        self.buffers.load(Ordering::Relaxed)
    }

    /// Records decoded
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    /// Buffers that contained a malformed frame
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    /// Records forwarded with zero enrichment after a lookup miss
    pub fn enrichment_misses(&self) -> u64 {
        self.enrichment_misses.load(Ordering::Relaxed)
    }
}

/// Worker draining one partition
pub struct Decoder {
    msg_type: MessageType,
    reader: PartitionReader<RecvBuffer>,
    platform: Option<Arc<dyn DeviceLookup>>,
    throttler: Throttler,
    sink: WriteSink,
    pending: Vec<DecodedRecord>,
    stats: Arc<DecoderStats>,
}

impl Decoder {
    pub fn new(
        msg_type: MessageType,
        reader: PartitionReader<RecvBuffer>,
        platform: Option<Arc<dyn DeviceLookup>>,
        throttler: Throttler,
        sink: WriteSink,
    ) -> Self {
        Self {
            msg_type,
            reader,
            platform,
            throttler,
            sink,
            pending: Vec::with_capacity(PENDING_BATCH),
            stats: Arc::new(DecoderStats::default()),
        }
    }

    /// Partition this worker drains
    pub fn partition(&self) -> usize {
        self.reader.index()
    }

    /// Handle to the shared counters
    pub fn stats(&self) -> Arc<DecoderStats> {
        Arc::clone(&self.stats)
    }

    /// Run until the queue set is closed and drained, or `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) {
        let partition = self.reader.index();
        info!(
            msg_type = %self.msg_type,
            partition,
            quota = ?self.throttler.quota(),
            "Decoder started"
        );

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = self.reader.recv() => item,
            };

            match item {
                QueueItem::Item(buffer) => self.handle(buffer).await,
                QueueItem::Flush => self.flush().await,
                QueueItem::Closed => break,
            }
        }

        self.flush().await;
        info!(
            msg_type = %self.msg_type,
            partition,
            buffers = self.stats.buffers(),
            records = self.stats.records(),
            decode_errors = self.stats.decode_errors(),
            "Decoder stopped"
        );
    }

    async fn handle(&mut self, buffer: RecvBuffer) {
        let started = Instant::now();
        let frames = decode_frames(self.msg_type, buffer.payload());
        let bytes = buffer.len();
        self.reader.release(buffer);

        self.stats.buffers.fetch_add(1, Ordering::Relaxed);
        crate::metrics::try_record_decode_latency(
            self.msg_type.as_str(),
            started.elapsed().as_secs_f64(),
        );

        if let Some(e) = &frames.error {
            self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
            crate::metrics::try_record_decode_error(self.msg_type.as_str(), self.reader.index());
            error!(
                msg_type = %self.msg_type,
                partition = self.reader.index(),
                bytes,
                decoded = frames.records.len(),
                error = %e,
                "Malformed payload"
            );
        }

        let count = frames.records.len() as u64;
        self.stats.records.fetch_add(count, Ordering::Relaxed);
        crate::metrics::try_record_decoded(self.msg_type.as_str(), count);

        for (device_id, record) in frames.records {
            let record = self.enrich(device_id, record);
            if self.throttler.admit(Instant::now()) {
                self.pending.push(record);
            }
        }

        if self.pending.len() >= PENDING_BATCH {
            self.flush().await;
        }
    }

    fn enrich(&self, device_id: u32, record: Record) -> DecodedRecord {
        let enrichment = match &self.platform {
            None => Enrichment::default(),
            Some(platform) => match platform.lookup(device_id) {
                Some(info) => Enrichment::from_device(device_id, &info),
                None => {
                    self.stats.enrichment_misses.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::try_record_enrichment_miss(self.msg_type.as_str());
                    debug!(
                        msg_type = %self.msg_type,
                        partition = self.reader.index(),
                        device_id,
                        "Platform lookup missed"
                    );
                    Enrichment::default()
                }
            },
        };

        DecodedRecord {
            device_id,
            enrichment,
            record,
        }
    }

    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::replace(&mut self.pending, Vec::with_capacity(PENDING_BATCH));
        let count = batch.len();
        if let Err(e) = self.sink.write(batch).await {
            error!(
                msg_type = %self.msg_type,
                partition = self.reader.index(),
                count,
                error = %e,
                "Failed to hand records to sink"
            );
        }
    }
}

/// Frame `bodies` the way the receiver delivers them
pub fn encode_frames<'a>(bodies: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    for body in bodies {
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(body);
    }
    out
}
