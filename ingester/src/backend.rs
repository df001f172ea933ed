//! Collaborator construction
//!
//! A [`Backend`] builds the external collaborators a stream needs. Any
//! failure here aborts stream construction before anything is registered.

use crate::config::{Config, SinkKind};
use crate::error::Result;
use crate::platform::{HttpPlatformSource, PlatformSource, StaticPlatformSource};
use crate::sink::clickhouse::{FLOW_LOG_DB, FLOW_TAG_DB};
use crate::sink::{ClickHouseWriter, ColumnarWriter, RowFormat, StdoutWriter, TagValueWriter};
use std::sync::Arc;

/// Factory for writers and platform sources
pub trait Backend: Send + Sync {
    /// Primary record store
    fn flow_log_writer(&self, config: &Config) -> Result<Arc<dyn ColumnarWriter>>;

    /// Tag-value store
    fn flow_tag_writer(&self, config: &Config) -> Result<Arc<dyn TagValueWriter>>;

    /// Platform data source for the logger called `name`
    fn platform_source(&self, name: &str, config: &Config) -> Result<Arc<dyn PlatformSource>>;
}

/// ClickHouse writers and controller-backed platform data
pub struct ClickHouseBackend;

impl Backend for ClickHouseBackend {
    fn flow_log_writer(&self, config: &Config) -> Result<Arc<dyn ColumnarWriter>> {
        Ok(Arc::new(ClickHouseWriter::new(
            FLOW_LOG_DB,
            &config.ckdb,
            config.ttl,
        )?))
    }

    fn flow_tag_writer(&self, config: &Config) -> Result<Arc<dyn TagValueWriter>> {
        Ok(Arc::new(ClickHouseWriter::new(
            FLOW_TAG_DB,
            &config.ckdb,
            config.ttl,
        )?))
    }

    fn platform_source(&self, name: &str, config: &Config) -> Result<Arc<dyn PlatformSource>> {
        Ok(Arc::new(HttpPlatformSource::new(
            name,
            &config.platform_options(),
        )?))
    }
}

/// Stdout writers and an empty platform table, for local runs
pub struct StdoutBackend {
    format: RowFormat,
}

impl StdoutBackend {
    pub fn new(format: RowFormat) -> Self {
        Self { format }
    }

    fn writer(&self) -> Arc<StdoutWriter> {
        Arc::new(StdoutWriter::new(self.format))
    }
}

impl Backend for StdoutBackend {
    fn flow_log_writer(&self, _config: &Config) -> Result<Arc<dyn ColumnarWriter>> {
        Ok(self.writer())
    }

    fn flow_tag_writer(&self, _config: &Config) -> Result<Arc<dyn TagValueWriter>> {
        Ok(self.writer())
    }

    fn platform_source(&self, _name: &str, _config: &Config) -> Result<Arc<dyn PlatformSource>> {
        Ok(Arc::new(StaticPlatformSource::new(Vec::new())))
    }
}

/// Backend selected by `config.sink`
pub fn from_config(config: &Config) -> Box<dyn Backend> {
    match config.sink {
        SinkKind::ClickHouse => Box::new(ClickHouseBackend),
        SinkKind::Stdout => Box::new(StdoutBackend::new(RowFormat::Summary)),
        SinkKind::StdoutJson => Box::new(StdoutBackend::new(RowFormat::Json)),
    }
}
