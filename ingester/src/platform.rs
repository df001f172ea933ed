//! Platform metadata cache
//!
//! Resolves device ids to topology (VPC, region, availability zone). Each
//! [`PlatformInfoTable`] is filled by a single background refresh task that
//! polls a [`PlatformSource`]; decoder workers only ever read it.
//!
//! ```text
//! PlatformSource ──fetch (every refresh_interval)──► refresh task
//!                                                         │ write
//!                                                         ▼
//!                              decoder ──lookup──► RwLock<HashMap<device, info>>
//! ```

use crate::error::{PlatformError, StreamError};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Topology of one device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_type: u8,
    pub vpc_id: i32,
    pub region_id: u16,
    pub az_id: u16,
}

/// One entry of a platform data snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub device_id: u32,
    #[serde(flatten)]
    pub info: DeviceInfo,
}

/// Where platform snapshots come from
#[async_trait]
pub trait PlatformSource: Send + Sync {
    /// Source name for logs
    fn name(&self) -> &str;

    /// Fetch a full snapshot
    async fn fetch(&self) -> Result<Vec<DeviceEntry>, PlatformError>;

    /// Release connections; called once from `close()`
    async fn close(&self) {}
}

/// Read-only device lookup used on the hot path
pub trait DeviceLookup: Send + Sync {
    fn lookup(&self, device_id: u32) -> Option<DeviceInfo>;
}

/// Construction parameters shared by every table of a logger
#[derive(Debug, Clone)]
pub struct PlatformOptions {
    /// Control-plane addresses, tried in order
    pub controllers: Vec<IpAddr>,
    /// Control-plane port
    pub port: u16,
    /// Max accepted snapshot size in bytes
    pub buffer_size: usize,
    /// Refresh cadence
    pub refresh_interval: Duration,
    /// This node's address, sent to the control plane
    pub node_ip: Option<IpAddr>,
}

/// Device metadata table with a background refresh task
pub struct PlatformInfoTable {
    name: String,
    devices: RwLock<HashMap<u32, DeviceInfo>>,
    source: Arc<dyn PlatformSource>,
    refresh_interval: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    version: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PlatformInfoTable {
    /// Create an empty table; nothing is fetched until [`start`](Self::start)
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn PlatformSource>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            devices: RwLock::new(HashMap::new()),
            source,
            refresh_interval,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            version: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Table name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the whole snapshot
    pub fn update(&self, entries: Vec<DeviceEntry>) {
        let devices: HashMap<u32, DeviceInfo> =
            entries.into_iter().map(|e| (e.device_id, e.info)).collect();
        let count = devices.len();
        *self.devices.write() = devices;
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(table = %self.name, devices = count, version, "Platform data updated");
    }

    /// Fetch once and apply
    pub async fn refresh(&self) -> Result<usize, PlatformError> {
        let entries = self.source.fetch().await?;
        let count = entries.len();
        self.update(entries);
        Ok(count)
    }

    /// Spawn the refresh loop
    ///
    /// The first refresh happens immediately. Subsequent calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() || self.cancel.is_cancelled() {
            return;
        }

        let table = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(table.refresh_interval);
            loop {
                tokio::select! {
                    _ = table.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        // an in-flight fetch must not hold up close()
                        let result = tokio::select! {
                            _ = table.cancel.cancelled() => None,
                            result = table.refresh() => Some(result),
                        };
                        let Some(result) = result else { break };
                        if let Err(e) = result {
                            warn!(
                                table = %table.name,
                                source = table.source.name(),
                                error = %e,
                                "Platform data refresh failed"
                            );
                        }
                    }
                }
            }
            debug!(table = %table.name, "Platform refresh stopped");
        }));
        info!(table = %self.name, source = self.source.name(), "Platform refresh started");
    }

    /// Stop the refresh loop and close the source
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(table = %self.name, error = %e, "Platform refresh task failed");
            }
        }
        self.source.close().await;
    }

    /// Number of snapshots applied so far
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Devices in the current snapshot
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// True if no snapshot has any devices
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Human-readable dump for the debug registry
    pub fn dump(&self) -> serde_json::Value {
        let devices = self.devices.read();
        let mut entries: Vec<DeviceEntry> = devices
            .iter()
            .map(|(&device_id, &info)| DeviceEntry { device_id, info })
            .collect();
        entries.sort_unstable_by_key(|e| e.device_id);
        serde_json::json!({
            "name": self.name,
            "version": self.version(),
            "hits": self.hits.load(Ordering::Relaxed),
            "misses": self.misses.load(Ordering::Relaxed),
            "devices": entries,
        })
    }
}

impl DeviceLookup for PlatformInfoTable {
    fn lookup(&self, device_id: u32) -> Option<DeviceInfo> {
        let found = self.devices.read().get(&device_id).copied();
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }
}

/// Fixed snapshot source, for tests and for nodes without a control plane
pub struct StaticPlatformSource {
    entries: Vec<DeviceEntry>,
}

impl StaticPlatformSource {
    pub fn new(entries: Vec<DeviceEntry>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl PlatformSource for StaticPlatformSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch(&self) -> Result<Vec<DeviceEntry>, PlatformError> {
        Ok(self.entries.clone())
    }
}

/// Default request timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Default connection timeout in seconds
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Pulls snapshots from the control plane over HTTP, failing over across addresses
pub struct HttpPlatformSource {
    client: Client,
    name: String,
    urls: Vec<String>,
    buffer_size: usize,
}

impl HttpPlatformSource {
    /// Build a source for `options.controllers`
    ///
    /// # Errors
    /// `StreamError::Construction` if there are no controllers or the client
    /// cannot be built.
    pub fn new(name: impl Into<String>, options: &PlatformOptions) -> Result<Self, StreamError> {
        let name = name.into();
        if options.controllers.is_empty() {
            return Err(StreamError::construction(
                format!("platform source '{name}'"),
                "no controller addresses",
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| StreamError::construction(format!("platform source '{name}'"), e))?;

        let node = options
            .node_ip
            .map(|ip| format!("?node_ip={ip}"))
            .unwrap_or_default();
        let urls = options
            .controllers
            .iter()
            .map(|ip| match ip {
                IpAddr::V4(v4) => format!("http://{v4}:{}/v1/platform-data{node}", options.port),
                IpAddr::V6(v6) => format!("http://[{v6}]:{}/v1/platform-data{node}", options.port),
            })
            .collect();

        Ok(Self {
            client,
            name,
            urls,
            buffer_size: options.buffer_size,
        })
    }

    async fn fetch_from(&self, url: &str) -> Result<Vec<DeviceEntry>, PlatformError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PlatformError::Unreachable(format!("{url}: {e}")))?;

        if !response.status().is_success() {
            return Err(PlatformError::Unreachable(format!(
                "{url}: status {}",
                response.status()
            )));
        }

        if let Some(len) = response.content_length() {
            if len as usize > self.buffer_size {
                return Err(PlatformError::TooLarge {
                    size: len as usize,
                    limit: self.buffer_size,
                });
            }
        }

        // chunked bodies carry no length up front
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| PlatformError::Unreachable(format!("{url}: {e}")))?
        {
            let size = body.len() + chunk.len();
            if size > self.buffer_size {
                return Err(PlatformError::TooLarge {
                    size,
                    limit: self.buffer_size,
                });
            }
            body.extend_from_slice(&chunk);
        }

        serde_json::from_slice(&body).map_err(|e| PlatformError::Invalid(e.to_string()))
    }
}

#[async_trait]
impl PlatformSource for HttpPlatformSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Vec<DeviceEntry>, PlatformError> {
        let mut last_error = None;
        for url in &self.urls {
            match self.fetch_from(url).await {
                Ok(entries) => return Ok(entries),
                Err(e @ PlatformError::Unreachable(_)) => {
                    debug!(source = %self.name, error = %e, "Controller unreachable, trying next");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| PlatformError::Unreachable("no controllers".into())))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn entry(device_id: u32, vpc_id: i32) -> DeviceEntry {
        DeviceEntry {
            device_id,
            info: DeviceInfo {
                device_type: 1,
                vpc_id,
                region_id: 2,
                az_id: 3,
            },
        }
    }

    struct CountingSource {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl PlatformSource for CountingSource {
        fn name(&self) -> &str {
            "counting"
        }

        async fn fetch(&self) -> Result<Vec<DeviceEntry>, PlatformError> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst) as u32;
            Ok(vec![entry(n, n as i32)])
        }
    }

    #[test]
    fn test_lookup_hit_and_miss() {
        let table = PlatformInfoTable::new(
            "t",
            Arc::new(StaticPlatformSource::new(vec![])),
            Duration::from_secs(60),
        );
        table.update(vec![entry(7, 42)]);

        assert_eq!(table.lookup(7).map(|i| i.vpc_id), Some(42));
        assert!(table.lookup(8).is_none());
        assert_eq!(table.version(), 1);

        let dump = table.dump();
        assert_eq!(dump["hits"], 1);
        assert_eq!(dump["misses"], 1);
        assert_eq!(dump["devices"][0]["device_id"], 7);
    }

    #[tokio::test]
    async fn test_refresh_loop_until_close() {
        let source = Arc::new(CountingSource {
            fetches: AtomicUsize::new(0),
        });
        let table = Arc::new(PlatformInfoTable::new(
            "t",
            source.clone(),
            Duration::from_millis(10),
        ));

        table.start();
        table.start();
        tokio::time::sleep(Duration::from_millis(55)).await;
        table.close().await;

        let fetched = source.fetches.load(Ordering::SeqCst);
        assert!(fetched >= 2, "expected several refreshes, got {fetched}");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), fetched);
        assert_eq!(table.version() as usize, fetched);
    }

    struct StalledSource;

    #[async_trait]
    impl PlatformSource for StalledSource {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn fetch(&self) -> Result<Vec<DeviceEntry>, PlatformError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_close_interrupts_inflight_refresh() {
        let table = Arc::new(PlatformInfoTable::new(
            "t",
            Arc::new(StalledSource),
            Duration::from_secs(60),
        ));
        table.start();
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(1), table.close())
            .await
            .expect("close waited on a stalled fetch");
        assert_eq!(table.version(), 0);
    }

    async fn serve_chunked(chunks: usize, chunk_len: usize) -> u16 {
        use axum::body::Body;
        use axum::routing::get;

        let app = axum::Router::new().route(
            "/v1/platform-data",
            get(move || async move {
                let parts = (0..chunks)
                    .map(move |_| Ok::<_, std::io::Error>(bytes::Bytes::from(vec![b' '; chunk_len])));
                Body::from_stream(futures::stream::iter(parts))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_http_source_limits_chunked_body() {
        let port = serve_chunked(16, 1024).await;
        let options = PlatformOptions {
            controllers: vec!["127.0.0.1".parse().unwrap()],
            port,
            buffer_size: 4096,
            refresh_interval: Duration::from_secs(60),
            node_ip: None,
        };
        let source = HttpPlatformSource::new("p", &options).unwrap();

        match source.fetch().await {
            Err(PlatformError::TooLarge { size, limit }) => {
                assert_eq!(limit, 4096);
                assert!(size > limit);
            }
            other => panic!("expected TooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_http_source_requires_controllers() {
        let options = PlatformOptions {
            controllers: vec![],
            port: 20035,
            buffer_size: 1024,
            refresh_interval: Duration::from_secs(60),
            node_ip: None,
        };
        assert!(matches!(
            HttpPlatformSource::new("p", &options),
            Err(StreamError::Construction { .. })
        ));
    }

    #[test]
    fn test_http_source_urls() {
        let options = PlatformOptions {
            controllers: vec!["10.1.1.1".parse().unwrap(), "::1".parse().unwrap()],
            port: 20035,
            buffer_size: 1024,
            refresh_interval: Duration::from_secs(60),
            node_ip: Some("10.2.2.2".parse().unwrap()),
        };
        let source = HttpPlatformSource::new("p", &options).unwrap();
        assert_eq!(
            source.urls,
            vec![
                "http://10.1.1.1:20035/v1/platform-data?node_ip=10.2.2.2".to_string(),
                "http://[::1]:20035/v1/platform-data?node_ip=10.2.2.2".to_string(),
            ]
        );
    }
}
