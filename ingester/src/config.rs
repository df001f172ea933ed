//! Configuration for the stream ingester
//!
//! Everything is read from `STREAM_*` environment variables on top of
//! [`Config::default`]. Addresses, credentials, TTLs and storage policy are
//! passed through to the writers uninterpreted.

use crate::error::{Result, StreamError};
use crate::message::{FlowLogId, MessageType};
use crate::platform::PlatformOptions;
use crate::queue::{BackpressurePolicy, QueueOptions};
use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// Main configuration for the stream ingester
#[derive(Debug, Clone)]
pub struct Config {
    /// Metrics/debug server address
    pub metrics_addr: SocketAddr,

    /// Partitions per message type
    pub decoder_queue_count: usize,

    /// Capacity of each partition
    pub decoder_queue_size: usize,

    /// Receiver-side producer slots per queue set
    pub producer_count: usize,

    /// Max time an idle partition goes without a flush signal
    pub flush_interval: Duration,

    /// What producers experience when a partition is full
    pub backpressure: BackpressurePolicy,

    /// Global records-per-window budget, split across partitions
    pub throttle: u64,

    /// Flow log budget override, 0 = use `throttle`
    pub l4_throttle: u64,

    /// Protocol log budget override, 0 = use `throttle`
    pub l7_throttle: u64,

    /// Throttle window length
    pub throttle_window: Duration,

    /// Controller addresses serving platform data
    pub controller_ips: Vec<IpAddr>,

    /// Controller port
    pub controller_port: u16,

    /// Max accepted platform data response, in bytes
    pub grpc_buffer_size: usize,

    /// Platform table refresh cadence
    pub platform_refresh: Duration,

    /// Address this node reports to the controller
    pub node_ip: Option<IpAddr>,

    /// Which writer backend to use
    pub sink: SinkKind,

    /// Columnar store connection
    pub ckdb: CkdbConfig,

    /// Per-table retention
    pub ttl: FlowLogTtl,

    /// Writer batching
    pub writer: WriterConfig,

    /// Log level
    pub log_level: String,

    /// Log format (json or pretty)
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Writer backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    /// ClickHouse over its HTTP interface
    ClickHouse,
    /// Print a summary line per row to stdout
    Stdout,
    /// Print every row to stdout as JSON
    StdoutJson,
}

/// Columnar store connection settings
#[derive(Clone, PartialEq, Eq)]
pub struct CkdbConfig {
    /// `host:port` of the HTTP interface
    pub addr: String,
    pub username: String,
    pub password: String,
    pub cluster: String,
    pub storage_policy: String,
    pub cold_storages: Vec<String>,
}

impl std::fmt::Debug for CkdbConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CkdbConfig")
            .field("addr", &self.addr)
            .field("username", &self.username)
            .field("password", &"***")
            .field("cluster", &self.cluster)
            .field("storage_policy", &self.storage_policy)
            .field("cold_storages", &self.cold_storages)
            .finish()
    }
}

/// Retention in hours per flow log table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowLogTtl {
    pub l4_flow_log: u32,
    pub l7_flow_log: u32,
    pub l4_packet: u32,
}

impl FlowLogTtl {
    /// Retention for `table`, in hours
    pub fn hours(&self, table: FlowLogId) -> u32 {
        match table {
            FlowLogId::L4Flow => self.l4_flow_log,
            FlowLogId::L7Flow => self.l7_flow_log,
            FlowLogId::L4Packet => self.l4_packet,
        }
    }
}

/// Batching of a writer front
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterConfig {
    /// Rows per batch handed to the collaborator
    pub batch_size: usize,
    /// Pending batches before `write` waits
    pub queue_size: usize,
    /// Max age of a partial batch
    pub flush_interval: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            queue_size: 1024,
            flush_interval: Duration::from_secs(1),
        }
    }
}

impl Default for CkdbConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8123".to_string(),
            username: "default".to_string(),
            password: String::new(),
            cluster: "default".to_string(),
            storage_policy: "default".to_string(),
            cold_storages: Vec::new(),
        }
    }
}

impl Default for FlowLogTtl {
    fn default() -> Self {
        Self {
            l4_flow_log: 72,
            l7_flow_log: 72,
            l4_packet: 72,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metrics_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9090)),
            decoder_queue_count: 2,
            decoder_queue_size: 16_384,
            producer_count: 1,
            flush_interval: Duration::from_secs(3),
            backpressure: BackpressurePolicy::DropOldest,
            throttle: 50_000,
            l4_throttle: 0,
            l7_throttle: 0,
            throttle_window: Duration::from_secs(1),
            controller_ips: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            controller_port: 20035,
            grpc_buffer_size: 40 << 20,
            platform_refresh: Duration::from_secs(60),
            node_ip: None,
            sink: SinkKind::ClickHouse,
            ckdb: CkdbConfig::default(),
            ttl: FlowLogTtl::default(),
            writer: WriterConfig::default(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("STREAM_METRICS_ADDR") {
            config.metrics_addr = parse("STREAM_METRICS_ADDR", &v)?;
        }
        if let Some(v) = var("STREAM_DECODER_QUEUE_COUNT") {
            config.decoder_queue_count = parse("STREAM_DECODER_QUEUE_COUNT", &v)?;
        }
        if let Some(v) = var("STREAM_DECODER_QUEUE_SIZE") {
            config.decoder_queue_size = parse("STREAM_DECODER_QUEUE_SIZE", &v)?;
        }
        if let Some(v) = var("STREAM_PRODUCER_COUNT") {
            config.producer_count = parse("STREAM_PRODUCER_COUNT", &v)?;
        }
        if let Some(v) = var("STREAM_FLUSH_INTERVAL_MS") {
            config.flush_interval = Duration::from_millis(parse("STREAM_FLUSH_INTERVAL_MS", &v)?);
        }
        if let Some(v) = var("STREAM_BACKPRESSURE") {
            config.backpressure = v
                .parse()
                .map_err(|e| StreamError::Config(format!("invalid STREAM_BACKPRESSURE: {e}")))?;
        }
        if let Some(v) = var("STREAM_THROTTLE") {
            config.throttle = parse("STREAM_THROTTLE", &v)?;
        }
        if let Some(v) = var("STREAM_L4_THROTTLE") {
            config.l4_throttle = parse("STREAM_L4_THROTTLE", &v)?;
        }
        if let Some(v) = var("STREAM_L7_THROTTLE") {
            config.l7_throttle = parse("STREAM_L7_THROTTLE", &v)?;
        }
        if let Some(v) = var("STREAM_THROTTLE_WINDOW_MS") {
            config.throttle_window = Duration::from_millis(parse("STREAM_THROTTLE_WINDOW_MS", &v)?);
        }
        if let Some(v) = var("STREAM_CONTROLLER_IPS") {
            config.controller_ips = split_list(&v)
                .map(|ip| parse("STREAM_CONTROLLER_IPS", ip))
                .collect::<Result<_>>()?;
        }
        if let Some(v) = var("STREAM_CONTROLLER_PORT") {
            config.controller_port = parse("STREAM_CONTROLLER_PORT", &v)?;
        }
        if let Some(v) = var("STREAM_GRPC_BUFFER_SIZE") {
            config.grpc_buffer_size = parse("STREAM_GRPC_BUFFER_SIZE", &v)?;
        }
        if let Some(v) = var("STREAM_PLATFORM_REFRESH_SECS") {
            config.platform_refresh = Duration::from_secs(parse("STREAM_PLATFORM_REFRESH_SECS", &v)?);
        }
        if let Some(v) = var("STREAM_NODE_IP") {
            config.node_ip = Some(parse("STREAM_NODE_IP", &v)?);
        }
        if let Some(v) = var("STREAM_SINK") {
            config.sink = match v.to_lowercase().as_str() {
                "clickhouse" => SinkKind::ClickHouse,
                "stdout" => SinkKind::Stdout,
                "stdout-json" | "stdout_json" => SinkKind::StdoutJson,
                other => {
                    return Err(StreamError::Config(format!(
                        "invalid STREAM_SINK: {other} (expected 'clickhouse', 'stdout' or 'stdout-json')"
                    )));
                }
            };
        }

        if let Some(v) = var("STREAM_CKDB_ADDR") {
            config.ckdb.addr = v;
        }
        if let Some(v) = var("STREAM_CKDB_USERNAME") {
            config.ckdb.username = v;
        }
        if let Some(v) = lookup("STREAM_CKDB_PASSWORD") {
            config.ckdb.password = v;
        }
        if let Some(v) = var("STREAM_CKDB_CLUSTER") {
            config.ckdb.cluster = v;
        }
        if let Some(v) = var("STREAM_CKDB_STORAGE_POLICY") {
            config.ckdb.storage_policy = v;
        }
        if let Some(v) = var("STREAM_CKDB_COLD_STORAGES") {
            config.ckdb.cold_storages = split_list(&v).map(str::to_string).collect();
        }

        if let Some(v) = var("STREAM_FLOW_LOG_TTL_HOURS") {
            config.ttl = parse_ttl(&v)?;
        }
        if let Some(v) = var("STREAM_WRITER_BATCH_SIZE") {
            config.writer.batch_size = parse("STREAM_WRITER_BATCH_SIZE", &v)?;
        }
        if let Some(v) = var("STREAM_WRITER_QUEUE_SIZE") {
            config.writer.queue_size = parse("STREAM_WRITER_QUEUE_SIZE", &v)?;
        }
        if let Some(v) = var("STREAM_WRITER_FLUSH_MS") {
            config.writer.flush_interval = Duration::from_millis(parse("STREAM_WRITER_FLUSH_MS", &v)?);
        }

        if let Some(level) = var("STREAM_LOG_LEVEL") {
            config.log_level = level;
        }
        if let Some(format) = var("STREAM_LOG_FORMAT") {
            config.log_format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => {
                    return Err(StreamError::Config(format!(
                        "invalid STREAM_LOG_FORMAT: {other} (expected 'json' or 'pretty')"
                    )));
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings no pipeline can run with
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("decoder_queue_count", self.decoder_queue_count),
            ("decoder_queue_size", self.decoder_queue_size),
            ("producer_count", self.producer_count),
            ("writer.batch_size", self.writer.batch_size),
            ("writer.queue_size", self.writer.queue_size),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(StreamError::Config(format!("{name} must be greater than 0")));
            }
        }
        if self.flush_interval.is_zero() {
            return Err(StreamError::Config("flush_interval must be greater than 0".into()));
        }
        if self.writer.flush_interval.is_zero() {
            return Err(StreamError::Config(
                "writer.flush_interval must be greater than 0".into(),
            ));
        }
        if self.throttle_window.is_zero() {
            return Err(StreamError::Config("throttle_window must be greater than 0".into()));
        }
        if self.platform_refresh.is_zero() {
            return Err(StreamError::Config("platform_refresh must be greater than 0".into()));
        }
        Ok(())
    }

    /// Records each partition of `msg_type` may admit per throttle window
    ///
    /// The per-type override wins when non-zero; 0 means unlimited.
    pub fn partition_quota(&self, msg_type: MessageType) -> u64 {
        let budget = match msg_type {
            MessageType::TaggedFlow if self.l4_throttle > 0 => self.l4_throttle,
            MessageType::ProtocolLog if self.l7_throttle > 0 => self.l7_throttle,
            _ => self.throttle,
        };
        if budget == 0 {
            return 0;
        }
        // never round a configured budget down to "unlimited"
        (budget / self.decoder_queue_count.max(1) as u64).max(1)
    }

    /// Queue set parameters shared by every logger
    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            capacity: self.decoder_queue_size,
            partition_count: self.decoder_queue_count,
            producer_count: self.producer_count,
            flush_interval: self.flush_interval,
            backpressure: self.backpressure,
        }
    }

    /// Platform table source parameters
    pub fn platform_options(&self) -> PlatformOptions {
        PlatformOptions {
            controllers: self.controller_ips.clone(),
            port: self.controller_port,
            buffer_size: self.grpc_buffer_size,
            refresh_interval: self.platform_refresh,
            node_ip: self.node_ip,
        }
    }
}

fn parse<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| StreamError::Config(format!("invalid {name}: {e}")))
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// One value for every table, or `l4_flow_log=72,l7_flow_log=24,l4_packet=12`
fn parse_ttl(value: &str) -> Result<FlowLogTtl> {
    const NAME: &str = "STREAM_FLOW_LOG_TTL_HOURS";

    if !value.contains('=') {
        let hours = parse(NAME, value)?;
        return Ok(FlowLogTtl {
            l4_flow_log: hours,
            l7_flow_log: hours,
            l4_packet: hours,
        });
    }

    let mut ttl = FlowLogTtl::default();
    for pair in split_list(value) {
        let (table, hours) = pair
            .split_once('=')
            .ok_or_else(|| StreamError::Config(format!("invalid {NAME}: '{pair}'")))?;
        let hours = parse(NAME, hours)?;
        match table.trim() {
            "l4_flow_log" => ttl.l4_flow_log = hours,
            "l7_flow_log" => ttl.l7_flow_log = hours,
            "l4_packet" => ttl.l4_packet = hours,
            other => {
                return Err(StreamError::Config(format!(
                    "invalid {NAME}: unknown table '{other}'"
                )));
            }
        }
    }
    Ok(ttl)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_vars(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.decoder_queue_count, 2);
        assert_eq!(config.backpressure, BackpressurePolicy::DropOldest);
        assert_eq!(config.throttle_window, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_vars() {
        let config = from_vars(&[
            ("STREAM_DECODER_QUEUE_COUNT", "4"),
            ("STREAM_BACKPRESSURE", "reject-new"),
            ("STREAM_CONTROLLER_IPS", "10.0.0.1, 10.0.0.2"),
            ("STREAM_CKDB_COLD_STORAGES", "s3,hdd"),
            ("STREAM_LOG_FORMAT", "json"),
            ("STREAM_SINK", "stdout"),
        ])
        .unwrap();

        assert_eq!(config.decoder_queue_count, 4);
        assert_eq!(config.backpressure, BackpressurePolicy::RejectNew);
        assert_eq!(config.controller_ips.len(), 2);
        assert_eq!(config.ckdb.cold_storages, vec!["s3", "hdd"]);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.sink, SinkKind::Stdout);
    }

    #[test]
    fn test_stdout_json_sink() {
        let config = from_vars(&[("STREAM_SINK", "stdout-json")]).unwrap();
        assert_eq!(config.sink, SinkKind::StdoutJson);
        assert!(from_vars(&[("STREAM_SINK", "kafka")]).is_err());
    }

    #[test]
    fn test_invalid_value_names_variable() {
        let err = from_vars(&[("STREAM_THROTTLE", "lots")]).unwrap_err();
        assert!(err.to_string().contains("STREAM_THROTTLE"));

        let err = from_vars(&[("STREAM_CONTROLLER_IPS", "10.0.0.1,nope")]).unwrap_err();
        assert!(err.to_string().contains("STREAM_CONTROLLER_IPS"));
    }

    #[test]
    fn test_validate_rejects_zero_partitions() {
        let err = from_vars(&[("STREAM_DECODER_QUEUE_COUNT", "0")]).unwrap_err();
        assert!(err.to_string().contains("decoder_queue_count"));
    }

    #[test]
    fn test_partition_quota_resolution() {
        let config = Config {
            decoder_queue_count: 4,
            throttle: 400,
            l4_throttle: 800,
            l7_throttle: 0,
            ..Default::default()
        };

        assert_eq!(config.partition_quota(MessageType::TaggedFlow), 200);
        assert_eq!(config.partition_quota(MessageType::ProtocolLog), 100);
        assert_eq!(config.partition_quota(MessageType::OpenTelemetry), 100);

        let unlimited = Config {
            throttle: 0,
            ..config
        };
        assert_eq!(unlimited.partition_quota(MessageType::PacketSequence), 0);
    }

    #[test]
    fn test_ttl_forms() {
        assert_eq!(parse_ttl("24").unwrap().hours(FlowLogId::L4Packet), 24);

        let ttl = parse_ttl("l7_flow_log=12, l4_packet=6").unwrap();
        assert_eq!(ttl.l4_flow_log, 72);
        assert_eq!(ttl.l7_flow_log, 12);
        assert_eq!(ttl.l4_packet, 6);

        assert!(parse_ttl("metrics=1").is_err());
    }

    #[test]
    fn test_password_redacted_in_debug() {
        let ckdb = CkdbConfig {
            password: "hunter2".into(),
            ..Default::default()
        };
        assert!(!format!("{ckdb:?}").contains("hunter2"));
    }
}
