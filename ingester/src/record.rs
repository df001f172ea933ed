//! Decoded, enriched records
//!
//! [`Record`] is a closed set of kinds resolved once at decode time. The write
//! sink matches on it exhaustively to pick a table and to derive tag values.

use crate::error::DecodeError;
use crate::message::FlowLogId;
use crate::platform::DeviceInfo;
use crate::proto;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Topology metadata attached to a record; all zero when the lookup missed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Enrichment {
    pub device_id: u32,
    pub device_type: u8,
    pub vpc_id: i32,
    pub region_id: u16,
    pub az_id: u16,
}

impl Enrichment {
    /// Build from a cache hit
    pub fn from_device(device_id: u32, info: &DeviceInfo) -> Self {
        Self {
            device_id,
            device_type: info.device_type,
            vpc_id: info.vpc_id,
            region_id: info.region_id,
            az_id: info.az_id,
        }
    }

    /// True if no field was populated
    pub fn is_unknown(&self) -> bool {
        *self == Enrichment::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct L4FlowRow {
    pub agent_id: u32,
    pub flow_id: u64,
    pub start_time_us: u64,
    pub end_time_us: u64,
    pub ip_src: IpAddr,
    pub ip_dst: IpAddr,
    pub port_src: u16,
    pub port_dst: u16,
    pub protocol: u8,
    pub byte_tx: u64,
    pub byte_rx: u64,
    pub packet_tx: u64,
    pub packet_rx: u64,
    pub close_type: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct L7FlowRow {
    pub agent_id: u32,
    pub flow_id: u64,
    pub start_time_us: u64,
    pub end_time_us: u64,
    pub l7_protocol: u32,
    pub request_type: String,
    pub request_domain: String,
    pub request_resource: String,
    pub response_code: i32,
    pub response_status: u32,
    pub trace_id: String,
    pub span_id: String,
    pub attribute_names: Vec<String>,
    pub attribute_values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanRow {
    pub agent_id: u32,
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: String,
    pub name: String,
    pub service_name: String,
    pub start_time_us: u64,
    pub end_time_us: u64,
    pub status_code: i32,
    pub attribute_names: Vec<String>,
    pub attribute_values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PacketSequenceRow {
    pub agent_id: u32,
    pub flow_id: u64,
    pub start_time_us: u64,
    pub end_time_us: u64,
    pub packet_count: u32,
    pub packet_batch: Vec<u8>,
}

/// Kind-specific payload of a decoded record
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Record {
    L4Flow(L4FlowRow),
    L7Flow(L7FlowRow),
    OtelSpan(SpanRow),
    PacketSequence(PacketSequenceRow),
}

impl Record {
    /// Destination table
    pub fn flow_log_id(&self) -> FlowLogId {
        match self {
            Record::L4Flow(_) => FlowLogId::L4Flow,
            Record::L7Flow(_) | Record::OtelSpan(_) => FlowLogId::L7Flow,
            Record::PacketSequence(_) => FlowLogId::L4Packet,
        }
    }

    /// Record end time in microseconds
    pub fn end_time_us(&self) -> u64 {
        match self {
            Record::L4Flow(r) => r.end_time_us,
            Record::L7Flow(r) => r.end_time_us,
            Record::OtelSpan(r) => r.end_time_us,
            Record::PacketSequence(r) => r.end_time_us,
        }
    }

    /// Custom attributes carried by kinds with high-cardinality dimensions
    fn attributes(&self) -> Option<(&[String], &[String])> {
        match self {
            Record::L7Flow(r) => Some((&r.attribute_names, &r.attribute_values)),
            Record::OtelSpan(r) => Some((&r.attribute_names, &r.attribute_values)),
            Record::L4Flow(_) | Record::PacketSequence(_) => None,
        }
    }
}

/// A decoded record plus its enrichment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedRecord {
    /// Device the enrichment lookup was keyed on
    #[serde(skip)]
    pub device_id: u32,
    #[serde(flatten)]
    pub enrichment: Enrichment,
    #[serde(flatten)]
    pub record: Record,
}

impl DecodedRecord {
    /// Destination table
    pub fn flow_log_id(&self) -> FlowLogId {
        self.record.flow_log_id()
    }

    /// Tag-value rows for the dictionary tables
    ///
    /// Empty for kinds without custom attributes.
    pub fn tag_values(&self, time: u32) -> Vec<FlowTag> {
        let Some((names, values)) = self.record.attributes() else {
            return Vec::new();
        };
        let table = self.flow_log_id().table();
        names
            .iter()
            .zip(values)
            .map(|(name, value)| FlowTag {
                time,
                table,
                vpc_id: self.enrichment.vpc_id,
                field_name: name.clone(),
                field_value: value.clone(),
            })
            .collect()
    }
}

/// One row of the auxiliary tag-value store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FlowTag {
    pub time: u32,
    pub table: &'static str,
    pub vpc_id: i32,
    pub field_name: String,
    pub field_value: String,
}

fn parse_ip(field: &'static str, raw: &[u8]) -> Result<IpAddr, DecodeError> {
    match raw.len() {
        4 => {
            let octets: [u8; 4] = [raw[0], raw[1], raw[2], raw[3]];
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(raw);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        len => Err(DecodeError::InvalidField {
            field,
            reason: format!("expected 4 or 16 bytes, got {len}"),
        }),
    }
}

fn narrow<T: TryFrom<u32>>(field: &'static str, value: u32) -> Result<T, DecodeError> {
    T::try_from(value).map_err(|_| DecodeError::InvalidField {
        field,
        reason: format!("{value} out of range"),
    })
}

fn split_attributes(attributes: Vec<proto::KeyValue>) -> (Vec<String>, Vec<String>) {
    attributes.into_iter().map(|kv| (kv.key, kv.value)).unzip()
}

impl TryFrom<proto::FlowLog> for Record {
    type Error = DecodeError;

    fn try_from(log: proto::FlowLog) -> Result<Self, Self::Error> {
        Ok(Record::L4Flow(L4FlowRow {
            agent_id: log.agent_id,
            flow_id: log.flow_id,
            start_time_us: log.start_time_us,
            end_time_us: log.end_time_us,
            ip_src: parse_ip("ip_src", &log.ip_src)?,
            ip_dst: parse_ip("ip_dst", &log.ip_dst)?,
            port_src: narrow("port_src", log.port_src)?,
            port_dst: narrow("port_dst", log.port_dst)?,
            protocol: narrow("protocol", log.protocol)?,
            byte_tx: log.byte_tx,
            byte_rx: log.byte_rx,
            packet_tx: log.packet_tx,
            packet_rx: log.packet_rx,
            close_type: log.close_type,
        }))
    }
}

impl From<proto::ProtocolLog> for Record {
    fn from(log: proto::ProtocolLog) -> Self {
        let (attribute_names, attribute_values) = split_attributes(log.attributes);
        Record::L7Flow(L7FlowRow {
            agent_id: log.agent_id,
            flow_id: log.flow_id,
            start_time_us: log.start_time_us,
            end_time_us: log.end_time_us,
            l7_protocol: log.l7_protocol,
            request_type: log.request_type,
            request_domain: log.request_domain,
            request_resource: log.request_resource,
            response_code: log.response_code,
            response_status: log.response_status,
            trace_id: log.trace_id,
            span_id: log.span_id,
            attribute_names,
            attribute_values,
        })
    }
}

impl TryFrom<proto::Span> for Record {
    type Error = DecodeError;

    fn try_from(span: proto::Span) -> Result<Self, Self::Error> {
        if span.trace_id.is_empty() {
            return Err(DecodeError::InvalidField {
                field: "trace_id",
                reason: "empty".to_string(),
            });
        }
        let (attribute_names, attribute_values) = split_attributes(span.attributes);
        Ok(Record::OtelSpan(SpanRow {
            agent_id: span.agent_id,
            trace_id: span.trace_id,
            span_id: span.span_id,
            parent_span_id: span.parent_span_id,
            name: span.name,
            service_name: span.service_name,
            start_time_us: span.start_time_us,
            end_time_us: span.end_time_us,
            status_code: span.status_code,
            attribute_names,
            attribute_values,
        }))
    }
}

impl From<proto::PacketSequence> for Record {
    fn from(seq: proto::PacketSequence) -> Self {
        Record::PacketSequence(PacketSequenceRow {
            agent_id: seq.agent_id,
            flow_id: seq.flow_id,
            start_time_us: seq.start_time_us,
            end_time_us: seq.end_time_us,
            packet_count: seq.packet_count,
            packet_batch: seq.batch,
        })
    }
}
