//! Stdout writer for local runs
//!
//! Prints one line per admitted row, prefixed with its destination table, and
//! one line per tag value. Nothing is buffered or retried; a broken stdout
//! loses the lines but never fails the batch.

use crate::error::SinkError;
use crate::message::FlowLogId;
use crate::record::{DecodedRecord, FlowTag};
use crate::sink::{ColumnarWriter, TagValueWriter};
use async_trait::async_trait;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// How a row is rendered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RowFormat {
    /// Device, VPC and end time only
    #[default]
    Summary,
    /// The full row as the JSON object the columnar store would receive
    Json,
}

/// Row and tag printer standing in for the columnar store
#[derive(Default)]
pub struct StdoutWriter {
    format: RowFormat,
    rows: AtomicU64,
    tags: AtomicU64,
}

impl StdoutWriter {
    pub fn new(format: RowFormat) -> Self {
        Self {
            format,
            ..Default::default()
        }
    }

    /// Rows printed so far
    pub fn rows_written(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }

    /// Tag values printed so far
    pub fn tags_written(&self) -> u64 {
        self.tags.load(Ordering::Relaxed)
    }

    /// Render one row without its table prefix
    pub fn render_row(&self, record: &DecodedRecord) -> Result<String, SinkError> {
        Ok(match self.format {
            RowFormat::Json => serde_json::to_string(record)?,
            RowFormat::Summary => format!(
                "device={} vpc={} end_time_us={}",
                record.device_id,
                record.enrichment.vpc_id,
                record.record.end_time_us()
            ),
        })
    }
}

#[async_trait]
impl ColumnarWriter for StdoutWriter {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn write(&self, table: FlowLogId, records: &[DecodedRecord]) -> Result<(), SinkError> {
        let lines = records
            .iter()
            .map(|record| self.render_row(record))
            .collect::<Result<Vec<_>, _>>()?;

        let mut stdout = std::io::stdout().lock();
        for line in &lines {
            writeln!(stdout, "[{table}] {line}").ok();
        }

        self.rows.fetch_add(lines.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl TagValueWriter for StdoutWriter {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn write_tags(&self, tags: &[FlowTag]) -> Result<(), SinkError> {
        let mut stdout = std::io::stdout().lock();
        for tag in tags {
            writeln!(
                stdout,
                "[{}_custom_field_value] {}={} (vpc {})",
                tag.table, tag.field_name, tag.field_value, tag.vpc_id
            )
            .ok();
        }

        self.tags.fetch_add(tags.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}
