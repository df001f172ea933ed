//! ClickHouse writer
//!
//! Inserts rows through the HTTP interface as `JSONEachRow`:
//!
//! ```text
//! POST http://{addr}/?query=INSERT INTO flow_log.l7_flow_log FORMAT JSONEachRow
//! {"device_id":3,"vpc_id":10,...}
//! {"device_id":3,"vpc_id":10,...}
//! ```
//!
//! Storage policy, cluster, TTLs and cold storages are carried for table
//! management on the store side and are not interpreted here.

use crate::config::{CkdbConfig, FlowLogTtl};
use crate::error::{SinkError, StreamError};
use crate::message::FlowLogId;
use crate::record::{DecodedRecord, FlowTag};
use crate::sink::{ColumnarWriter, TagValueWriter};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info};

/// Database holding the flow log tables
pub const FLOW_LOG_DB: &str = "flow_log";
/// Database holding tag-value dictionaries
pub const FLOW_TAG_DB: &str = "flow_tag";

/// Default request timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Default connection timeout in seconds
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Writer for one ClickHouse database
pub struct ClickHouseWriter {
    client: Client,
    url: Url,
    database: &'static str,
    username: String,
    password: String,
    ttl: FlowLogTtl,
    storage_policy: String,
    cold_storages: Vec<String>,
}

impl ClickHouseWriter {
    /// Create a writer for `database`
    ///
    /// # Errors
    /// Returns `StreamError::Construction` if the address is not a valid
    /// `host:port` or the HTTP client cannot be created
    pub fn new(
        database: &'static str,
        ckdb: &CkdbConfig,
        ttl: FlowLogTtl,
    ) -> Result<Self, StreamError> {
        let component = format!("clickhouse writer '{database}'");
        let url = parse_addr(&ckdb.addr).map_err(|e| StreamError::construction(&component, e))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| StreamError::construction(&component, e))?;

        info!(
            database,
            url = %url,
            cluster = %ckdb.cluster,
            storage_policy = %ckdb.storage_policy,
            cold_storages = ?ckdb.cold_storages,
            "ClickHouse writer configured"
        );

        Ok(Self {
            client,
            url,
            database,
            username: ckdb.username.clone(),
            password: ckdb.password.clone(),
            ttl,
            storage_policy: ckdb.storage_policy.clone(),
            cold_storages: ckdb.cold_storages.clone(),
        })
    }

    /// Endpoint rows are posted to
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Retention for `table`, in hours
    pub fn ttl_hours(&self, table: FlowLogId) -> u32 {
        self.ttl.hours(table)
    }

    /// Storage policy and cold tiers the tables are expected to use
    pub fn storage(&self) -> (&str, &[String]) {
        (&self.storage_policy, &self.cold_storages)
    }

    async fn insert<R: Serialize>(&self, table: &str, rows: &[R]) -> Result<(), SinkError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut body = Vec::with_capacity(rows.len() * 256);
        for row in rows {
            serde_json::to_writer(&mut body, row)?;
            body.push(b'\n');
        }

        let query = format!("INSERT INTO {}.{} FORMAT JSONEachRow", self.database, table);
        let request = self
            .client
            .post(self.url.clone())
            .query(&[("query", query.as_str())])
            .basic_auth(&self.username, Some(&self.password))
            .body(body);

        match request.send().await {
            Ok(response) => {
                if response.status().is_success() {
                    debug!(
                        database = self.database,
                        table,
                        count = rows.len(),
                        "Rows inserted"
                    );
                    Ok(())
                } else {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    error!(
                        database = self.database,
                        table,
                        status = %status,
                        body = %body,
                        "Insert rejected"
                    );
                    Err(SinkError::Write(format!("ClickHouse returned {status}: {body}")))
                }
            }
            Err(e) => {
                error!(url = %self.url, error = %e, "ClickHouse connection failed");
                Err(SinkError::Connection(format!(
                    "Failed to connect to {}: {}",
                    self.url, e
                )))
            }
        }
    }
}

fn parse_addr(addr: &str) -> Result<Url, String> {
    let url = if addr.contains("://") {
        Url::parse(addr)
    } else {
        Url::parse(&format!("http://{addr}"))
    }
    .map_err(|e| format!("invalid address '{addr}': {e}"))?;

    if url.host_str().is_none_or(str::is_empty) {
        return Err(format!("invalid address '{addr}': missing host"));
    }
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("invalid address '{addr}': unsupported scheme"));
    }
    Ok(url)
}

#[async_trait]
impl ColumnarWriter for ClickHouseWriter {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    async fn write(&self, table: FlowLogId, records: &[DecodedRecord]) -> Result<(), SinkError> {
        self.insert(table.table(), records).await
    }
}

#[async_trait]
impl TagValueWriter for ClickHouseWriter {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    async fn write_tags(&self, tags: &[FlowTag]) -> Result<(), SinkError> {
        // one dictionary table per source table
        let mut start = 0;
        while start < tags.len() {
            let table = tags[start].table;
            let end = tags[start..]
                .iter()
                .position(|t| t.table != table)
                .map_or(tags.len(), |n| start + n);
            self.insert(&format!("{table}_custom_field_value"), &tags[start..end])
                .await?;
            start = end;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addr() {
        assert_eq!(parse_addr("10.1.2.3:8123").unwrap().as_str(), "http://10.1.2.3:8123/");
        assert_eq!(
            parse_addr("https://ck.example:8443").unwrap().as_str(),
            "https://ck.example:8443/"
        );
        assert!(parse_addr("not a host:port").is_err());
        assert!(parse_addr("127.0.0.1:99999").is_err());
        assert!(parse_addr("ftp://ck:21").is_err());
    }

    #[test]
    fn test_bad_address_is_construction_error() {
        let ckdb = CkdbConfig {
            addr: "ck db:8123".into(),
            ..Default::default()
        };
        let err = ClickHouseWriter::new(FLOW_LOG_DB, &ckdb, FlowLogTtl::default())
            .err()
            .unwrap();
        assert!(matches!(err, StreamError::Construction { .. }));
    }

    #[test]
    fn test_writer_carries_table_settings() {
        let ckdb = CkdbConfig {
            storage_policy: "tiered".into(),
            cold_storages: vec!["s3".into()],
            ..Default::default()
        };
        let ttl = FlowLogTtl {
            l4_flow_log: 1,
            l7_flow_log: 2,
            l4_packet: 3,
        };
        let writer = ClickHouseWriter::new(FLOW_LOG_DB, &ckdb, ttl).unwrap();

        assert_eq!(writer.ttl_hours(FlowLogId::L7Flow), 2);
        assert_eq!(writer.storage(), ("tiered", &["s3".to_string()][..]));
        assert_eq!(writer.url().port(), Some(8123));
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let writer =
            ClickHouseWriter::new(FLOW_LOG_DB, &CkdbConfig::default(), FlowLogTtl::default())
                .unwrap();
        assert!(ColumnarWriter::write(&writer, FlowLogId::L4Flow, &[]).await.is_ok());
    }
}
