//! Message types and the receive buffer envelope
//!
//! A [`RecvBuffer`] is what the receiver hands to a queue partition. It owns
//! its bytes; moving it into the queue moves ownership, and giving it back to
//! the [`BufferPool`](crate::buffer::BufferPool) consumes it.
//!
//! ```text
//! Receiver ──acquire──► RecvBuffer ──enqueue──► Partition ──recv──► Decoder
//!    ▲                                                                │
//!    └──────────────────────────── release (exactly once) ◄───────────┘
//! ```

use bytes::BytesMut;
use std::fmt;
use std::str::FromStr;

/// Inbound telemetry message types handled by the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageType {
    /// TCP/UDP flow logs
    TaggedFlow,
    /// Application-protocol logs
    ProtocolLog,
    /// OpenTelemetry spans
    OpenTelemetry,
    /// OpenTelemetry spans with zlib-compressed frame bodies
    OpenTelemetryCompressed,
    /// Raw packet-sequence blocks
    PacketSequence,
}

impl MessageType {
    /// All message types, in the order the stream builds their loggers
    pub const ALL: [MessageType; 5] = [
        MessageType::TaggedFlow,
        MessageType::ProtocolLog,
        MessageType::OpenTelemetry,
        MessageType::OpenTelemetryCompressed,
        MessageType::PacketSequence,
    ];

    /// Stable name used for queue names, metric labels and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::TaggedFlow => "l4_flow_log",
            MessageType::ProtocolLog => "l7_flow_log",
            MessageType::OpenTelemetry => "otel",
            MessageType::OpenTelemetryCompressed => "otel_compressed",
            MessageType::PacketSequence => "l4_packet",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown message type '{s}'"))
    }
}

/// Destination table of a decoded record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowLogId {
    L4Flow,
    L7Flow,
    L4Packet,
}

impl FlowLogId {
    pub const ALL: [FlowLogId; 3] = [FlowLogId::L4Flow, FlowLogId::L7Flow, FlowLogId::L4Packet];

    /// Table name inside the flow log database
    pub fn table(&self) -> &'static str {
        match self {
            FlowLogId::L4Flow => "l4_flow_log",
            FlowLogId::L7Flow => "l7_flow_log",
            FlowLogId::L4Packet => "l4_packet",
        }
    }
}

impl fmt::Display for FlowLogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// An inbound buffer as received from the wire
///
/// Deliberately not `Clone`: there is exactly one owner at a time.
pub struct RecvBuffer {
    /// Message type the receiver framed this buffer as
    pub msg_type: MessageType,
    /// Raw frames
    pub(crate) data: BytesMut,
}

impl RecvBuffer {
    /// Wrap bytes that did not come from a pool (tests, replay tools)
    pub fn new(msg_type: MessageType, data: BytesMut) -> Self {
        Self { msg_type, data }
    }

    /// Raw payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access for the receiver to fill the buffer
    pub fn payload_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if the buffer carries no bytes
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn into_bytes(self) -> BytesMut {
        self.data
    }
}

impl fmt::Debug for RecvBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvBuffer")
            .field("msg_type", &self.msg_type)
            .field("len", &self.data.len())
            .finish()
    }
}
