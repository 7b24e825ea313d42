//! Byte transports
//!
//! A `Transport` fetches byte ranges of a resource addressed by URL.
//! `DefaultTransport` routes `http`/`https` to reqwest and `file` URLs to
//! tokio's filesystem API. `MemoryTransport` serves registered objects from
//! memory and can inject failures and latency.

use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use reqwest::{
    header::{CONTENT_LENGTH, RANGE},
    Client, StatusCode,
};
use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, instrument};
use url::{Position, Url};

/// Parse a source uri; bare filesystem paths become `file` URLs
pub fn parse_uri(uri: &str) -> Result<Url> {
    if uri.trim().is_empty() {
        return Err(Error::InvalidUri("empty uri".into()));
    }
    match Url::parse(uri) {
        Ok(url) => match url.scheme() {
            "http" | "https" | "file" => Ok(url),
            other => Err(Error::InvalidUri(format!("unsupported scheme '{}' in {}", other, uri))),
        },
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let path = PathBuf::from(uri);
            let path = if path.is_absolute() {
                path
            } else {
                std::env::current_dir()?.join(path)
            };
            Url::from_file_path(&path).map_err(|_| Error::InvalidUri(uri.to_string()))
        }
        Err(e) => Err(Error::InvalidUri(format!("{}: {}", uri, e))),
    }
}

/// Source of byte ranges
#[async_trait]
pub trait Transport: Send + Sync {
    /// Total length of the resource, `None` when unbounded or unknown
    async fn content_length(&self, url: &Url) -> Result<Option<u64>>;

    /// Up to `len` bytes starting at `offset`; empty past the end
    async fn read_range(&self, url: &Url, offset: u64, len: usize) -> Result<Bytes>;

    /// The whole resource
    async fn fetch(&self, url: &Url) -> Result<Bytes>;
}

/// HTTP(S) transport using ranged GET requests
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client })
    }

    fn check_status(url: &Url, status: StatusCode) -> Result<()> {
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(Error::SourceUnreachable(format!("{} returned {}", url, status)));
        }
        if !status.is_success() {
            return Err(Error::transport(url.as_str(), format!("HTTP {}", status)));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn content_length(&self, url: &Url) -> Result<Option<u64>> {
        let response = self
            .client
            .head(url.clone())
            .send()
            .await
            .map_err(|e| Error::SourceUnreachable(format!("{}: {}", url, e)))?;
        Self::check_status(url, response.status())?;

        Ok(response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok()))
    }

    #[instrument(skip(self), fields(url = %url))]
    async fn read_range(&self, url: &Url, offset: u64, len: usize) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let last = offset + len as u64 - 1;
        let response = self
            .client
            .get(url.clone())
            .header(RANGE, format!("bytes={}-{}", offset, last))
            .send()
            .await
            .map_err(|e| Error::transport(url.as_str(), e))?;

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(Bytes::new());
        }
        Self::check_status(url, status)?;

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::transport(url.as_str(), e))?;

        if status == StatusCode::PARTIAL_CONTENT {
            return Ok(body);
        }
        // Server ignored the range header and sent the whole object
        let start = (offset as usize).min(body.len());
        let end = (start + len).min(body.len());
        debug!(status = %status, "Range ignored by server");
        Ok(body.slice(start..end))
    }

    async fn fetch(&self, url: &Url) -> Result<Bytes> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::SourceUnreachable(format!("{}: {}", url, e)))?;
        Self::check_status(url, response.status())?;
        response.bytes().await.map_err(|e| Error::transport(url.as_str(), e))
    }
}

/// Local filesystem transport for `file` URLs
#[derive(Debug, Default, Clone)]
pub struct FileTransport;

impl FileTransport {
    fn path(url: &Url) -> Result<PathBuf> {
        url.to_file_path()
            .map_err(|_| Error::InvalidUri(url.to_string()))
    }

    fn map_io(url: &Url, e: std::io::Error) -> Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::SourceUnreachable(format!("{}: {}", url, e))
        } else {
            Error::transport(url.as_str(), e)
        }
    }
}

#[async_trait]
impl Transport for FileTransport {
    async fn content_length(&self, url: &Url) -> Result<Option<u64>> {
        let meta = tokio::fs::metadata(Self::path(url)?)
            .await
            .map_err(|e| Self::map_io(url, e))?;
        Ok(Some(meta.len()))
    }

    async fn read_range(&self, url: &Url, offset: u64, len: usize) -> Result<Bytes> {
        let mut file = tokio::fs::File::open(Self::path(url)?)
            .await
            .map_err(|e| Self::map_io(url, e))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Self::map_io(url, e))?;

        let mut buf = Vec::with_capacity(len);
        file.take(len as u64)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| Self::map_io(url, e))?;
        Ok(Bytes::from(buf))
    }

    async fn fetch(&self, url: &Url) -> Result<Bytes> {
        tokio::fs::read(Self::path(url)?)
            .await
            .map(Bytes::from)
            .map_err(|e| Self::map_io(url, e))
    }
}

/// Routes requests by URL scheme
pub struct DefaultTransport {
    http: HttpTransport,
    file: FileTransport,
}

impl DefaultTransport {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: HttpTransport::new(request_timeout)?,
            file: FileTransport,
        })
    }

    fn route(&self, url: &Url) -> Result<&dyn Transport> {
        match url.scheme() {
            "http" | "https" => Ok(&self.http),
            "file" => Ok(&self.file),
            other => Err(Error::InvalidUri(format!("unsupported scheme '{}'", other))),
        }
    }
}

#[async_trait]
impl Transport for DefaultTransport {
    async fn content_length(&self, url: &Url) -> Result<Option<u64>> {
        self.route(url)?.content_length(url).await
    }

    async fn read_range(&self, url: &Url, offset: u64, len: usize) -> Result<Bytes> {
        self.route(url)?.read_range(url, offset, len).await
    }

    async fn fetch(&self, url: &Url) -> Result<Bytes> {
        self.route(url)?.fetch(url).await
    }
}

/// In-memory transport with failure and latency injection
#[derive(Default)]
pub struct MemoryTransport {
    objects: RwLock<HashMap<String, Bytes>>,
    unbounded: RwLock<HashSet<String>>,
    failing_hosts: RwLock<HashSet<String>>,
    latency: RwLock<Duration>,
    requests: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(url: &Url) -> String {
        url[..Position::AfterPath].to_string()
    }

    fn key_of(uri: &str) -> String {
        match Url::parse(uri) {
            Ok(url) => Self::key(&url),
            Err(_) => uri.to_string(),
        }
    }

    /// Serve `data` at `uri`
    pub fn insert(&self, uri: &str, data: impl Into<Bytes>) {
        self.objects.write().insert(Self::key_of(uri), data.into());
    }

    /// Serve `data` at `uri` without reporting a length, as a live stream would
    pub fn insert_unbounded(&self, uri: &str, data: impl Into<Bytes>) {
        self.insert(uri, data);
        self.unbounded.write().insert(Self::key_of(uri));
    }

    /// Fail every request to `host` until `heal_host` is called
    pub fn fail_host(&self, host: &str) {
        self.failing_hosts.write().insert(host.to_string());
    }

    pub fn heal_host(&self, host: &str) {
        self.failing_hosts.write().remove(host);
    }

    /// Delay applied to every request
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Number of requests served or refused so far
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    async fn lookup(&self, url: &Url) -> Result<Bytes> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let host = url.host_str().unwrap_or_default().to_string();
        if self.failing_hosts.read().contains(&host) {
            return Err(Error::transport(url.as_str(), "connection refused"));
        }

        self.objects
            .read()
            .get(&Self::key(url))
            .cloned()
            .ok_or_else(|| Error::SourceUnreachable(format!("{} not found", url)))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn content_length(&self, url: &Url) -> Result<Option<u64>> {
        let data = self.lookup(url).await?;
        let unbounded = self.unbounded.read().contains(&Self::key(url));
        Ok((!unbounded).then_some(data.len() as u64))
    }

    async fn read_range(&self, url: &Url, offset: u64, len: usize) -> Result<Bytes> {
        let data = self.lookup(url).await?;
        let start = (offset as usize).min(data.len());
        let end = (start + len).min(data.len());
        Ok(data.slice(start..end))
    }

    async fn fetch(&self, url: &Url) -> Result<Bytes> {
        self.lookup(url).await
    }
}
