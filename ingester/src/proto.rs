//! Wire shapes of inbound frames
//!
//! Every receive buffer is a run of frames, each `[u32 LE length][body]`.
//! Bodies are protobuf messages; only the fields the pipeline needs are
//! declared here.

/// One TCP/UDP flow summary
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FlowLog {
    #[prost(uint32, tag = "1")]
    pub agent_id: u32,
    #[prost(uint32, tag = "2")]
    pub device_id: u32,
    #[prost(uint64, tag = "3")]
    pub flow_id: u64,
    #[prost(uint64, tag = "4")]
    pub start_time_us: u64,
    #[prost(uint64, tag = "5")]
    pub end_time_us: u64,
    #[prost(bytes = "vec", tag = "6")]
    pub ip_src: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "7")]
    pub ip_dst: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint32, tag = "8")]
    pub port_src: u32,
    #[prost(uint32, tag = "9")]
    pub port_dst: u32,
    #[prost(uint32, tag = "10")]
    pub protocol: u32,
    #[prost(uint64, tag = "11")]
    pub byte_tx: u64,
    #[prost(uint64, tag = "12")]
    pub byte_rx: u64,
    #[prost(uint64, tag = "13")]
    pub packet_tx: u64,
    #[prost(uint64, tag = "14")]
    pub packet_rx: u64,
    #[prost(uint32, tag = "15")]
    pub close_type: u32,
}

/// Free-form string attribute
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyValue {
    #[prost(string, tag = "1")]
    pub key: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub value: ::prost::alloc::string::String,
}

/// One application-protocol request/response
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtocolLog {
    #[prost(uint32, tag = "1")]
    pub agent_id: u32,
    #[prost(uint32, tag = "2")]
    pub device_id: u32,
    #[prost(uint64, tag = "3")]
    pub flow_id: u64,
    #[prost(uint64, tag = "4")]
    pub start_time_us: u64,
    #[prost(uint64, tag = "5")]
    pub end_time_us: u64,
    #[prost(uint32, tag = "6")]
    pub l7_protocol: u32,
    #[prost(string, tag = "7")]
    pub request_type: ::prost::alloc::string::String,
    #[prost(string, tag = "8")]
    pub request_domain: ::prost::alloc::string::String,
    #[prost(string, tag = "9")]
    pub request_resource: ::prost::alloc::string::String,
    #[prost(int32, tag = "10")]
    pub response_code: i32,
    #[prost(uint32, tag = "11")]
    pub response_status: u32,
    #[prost(string, tag = "12")]
    pub trace_id: ::prost::alloc::string::String,
    #[prost(string, tag = "13")]
    pub span_id: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "14")]
    pub attributes: ::prost::alloc::vec::Vec<KeyValue>,
}

/// One OpenTelemetry span, flattened
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Span {
    #[prost(uint32, tag = "1")]
    pub agent_id: u32,
    #[prost(uint32, tag = "2")]
    pub device_id: u32,
    #[prost(string, tag = "3")]
    pub trace_id: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub span_id: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub parent_span_id: ::prost::alloc::string::String,
    #[prost(string, tag = "6")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "7")]
    pub service_name: ::prost::alloc::string::String,
    #[prost(uint64, tag = "8")]
    pub start_time_us: u64,
    #[prost(uint64, tag = "9")]
    pub end_time_us: u64,
    #[prost(int32, tag = "10")]
    pub status_code: i32,
    #[prost(message, repeated, tag = "11")]
    pub attributes: ::prost::alloc::vec::Vec<KeyValue>,
}

/// A block of packet headers for one flow
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PacketSequence {
    #[prost(uint32, tag = "1")]
    pub agent_id: u32,
    #[prost(uint32, tag = "2")]
    pub device_id: u32,
    #[prost(uint64, tag = "3")]
    pub flow_id: u64,
    #[prost(uint64, tag = "4")]
    pub start_time_us: u64,
    #[prost(uint64, tag = "5")]
    pub end_time_us: u64,
    #[prost(uint32, tag = "6")]
    pub packet_count: u32,
    #[prost(bytes = "vec", tag = "7")]
    pub batch: ::prost::alloc::vec::Vec<u8>,
}
