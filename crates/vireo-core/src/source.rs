//! Source resolution
//!
//! Turns a [`MediaSource`] into a seekable [`ResolvedSource`]:
//! - cacheable sources already held by the disk cache are served from it
//! - network and file sources are read in ranged chunks over the current
//!   CDN line, failing over when auto-switch is armed
//! - custom sources are pulled through their [`CustomSource`] capability on
//!   blocking worker threads
//!
//! Fully downloaded cacheable objects are written back to the cache.

use crate::{
    cache::CacheManager,
    cdn::CdnLineManager,
    config::PlayerConfig,
    media::MediaLayout,
    transport::{parse_uri, Transport},
    types::{MediaSource, StreamInfo},
    Error, Result,
};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Bytes read from the start of a source to identify its container
const PROBE_LEN: usize = 64 * 1024;

/// Caller-supplied byte source for custom streams.
///
/// Methods are only ever invoked on blocking worker threads, so
/// implementations may block.
pub trait CustomSource: Send {
    /// Copy up to `buf.len()` bytes into `buf`; 0 means end of stream
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Move to absolute byte `offset`; returns the offset reached
    fn seek(&mut self, offset: u64) -> std::io::Result<u64>;

    /// Total length in bytes, `None` for live streams
    fn total_len(&self) -> Option<u64> {
        None
    }
}

impl<T: AsRef<[u8]> + Send> CustomSource for Cursor<T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Read::read(self, buf)
    }

    fn seek(&mut self, offset: u64) -> std::io::Result<u64> {
        Seek::seek(self, SeekFrom::Start(offset))
    }

    fn total_len(&self) -> Option<u64> {
        Some(self.get_ref().as_ref().len() as u64)
    }
}

/// An automatic line change made while reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineFailover {
    pub from: usize,
    pub to: usize,
}

/// Contiguous prefix of a download, kept until the whole object is present
struct Assembly {
    uri: String,
    total_len: u64,
    data: Vec<u8>,
}

impl Assembly {
    fn push(&mut self, offset: u64, bytes: &[u8]) {
        let have = self.data.len() as u64;
        if offset > have {
            return;
        }
        let skip = (have - offset) as usize;
        if skip < bytes.len() {
            self.data.extend_from_slice(&bytes[skip..]);
        }
    }

    fn is_complete(&self) -> bool {
        self.data.len() as u64 >= self.total_len
    }
}

struct RemoteReader {
    transport: Arc<dyn Transport>,
    lines: Arc<Mutex<CdnLineManager>>,
    chunk_size: usize,
    ahead: Bytes,
    ahead_offset: u64,
    failovers: Vec<LineFailover>,
    cache: Option<Arc<CacheManager>>,
    assembly: Option<Assembly>,
}

impl RemoteReader {
    fn buffered(&self, pos: u64, want: usize) -> Option<Bytes> {
        let end = self.ahead_offset + self.ahead.len() as u64;
        if pos < self.ahead_offset || pos >= end {
            return None;
        }
        let start = (pos - self.ahead_offset) as usize;
        let stop = (start + want).min(self.ahead.len());
        Some(self.ahead.slice(start..stop))
    }

    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(len);
        let mut pos = offset;

        while out.len() < len {
            let want = len - out.len();
            if let Some(slice) = self.buffered(pos, want) {
                pos += slice.len() as u64;
                out.extend_from_slice(&slice);
                continue;
            }
            let chunk = fetch_with_failover(
                self.transport.as_ref(),
                &self.lines,
                &mut self.failovers,
                pos,
                want.max(self.chunk_size),
            )
            .await?;
            if chunk.is_empty() {
                break;
            }
            self.remember(pos, chunk).await;
        }

        Ok(out.freeze())
    }

    async fn remember(&mut self, offset: u64, chunk: Bytes) {
        if let Some(assembly) = self.assembly.as_mut() {
            assembly.push(offset, &chunk);
        }
        self.ahead = chunk;
        self.ahead_offset = offset;

        let complete = self.assembly.as_ref().is_some_and(Assembly::is_complete);
        if complete {
            if let (Some(assembly), Some(cache)) = (self.assembly.take(), self.cache.as_ref()) {
                match cache.store(&assembly.uri, &assembly.data).await {
                    Ok(entry) => info!(uri = %entry.uri, bytes = entry.byte_size, "Source cached"),
                    Err(e) => warn!(uri = %assembly.uri, error = %e, "Failed to cache source"),
                }
            }
        }
    }
}

struct CustomReader {
    source: Arc<Mutex<Box<dyn CustomSource>>>,
    position: u64,
}

impl CustomReader {
    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Bytes> {
        let source = self.source.clone();
        let position = self.position;

        let (data, reached) = tokio::task::spawn_blocking(move || -> std::io::Result<(Vec<u8>, u64)> {
            let mut source = source.lock();
            if position != offset {
                let landed = source.seek(offset)?;
                if landed != offset {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("seek to {} landed at {}", offset, landed),
                    ));
                }
            }
            let mut buf = vec![0u8; len];
            let mut filled = 0;
            while filled < len {
                let n = source.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            Ok((buf, offset + filled as u64))
        })
        .await
        .map_err(|e| Error::Internal(format!("custom source task failed: {}", e)))?
        .map_err(|e| Error::transport("custom://stream", e))?;

        self.position = reached;
        Ok(Bytes::from(data))
    }
}

enum Reader {
    Memory(Bytes),
    Remote(Box<RemoteReader>),
    Custom(CustomReader),
}

impl Reader {
    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Bytes> {
        match self {
            Reader::Memory(data) => {
                let start = (offset as usize).min(data.len());
                let end = (start + len).min(data.len());
                Ok(data.slice(start..end))
            }
            Reader::Remote(remote) => remote.read_at(offset, len).await,
            Reader::Custom(custom) => custom.read_at(offset, len).await,
        }
    }
}

/// A resolved, seekable source
pub struct ResolvedSource {
    source: MediaSource,
    layout: MediaLayout,
    streams: Vec<StreamInfo>,
    reader: Reader,
    cursor: u64,
    from_cache: bool,
}

impl std::fmt::Debug for ResolvedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSource")
            .field("uri", &self.source.uri)
            .field("layout", &self.layout)
            .field("cursor", &self.cursor)
            .field("from_cache", &self.from_cache)
            .finish()
    }
}

impl ResolvedSource {
    fn new(source: MediaSource, layout: MediaLayout, reader: Reader, from_cache: bool) -> Self {
        let cursor = layout.offset_for_position(source.start_position_ms);
        let streams = layout.streams();
        Self {
            source,
            layout,
            streams,
            reader,
            cursor,
            from_cache,
        }
    }

    pub fn source(&self) -> &MediaSource {
        &self.source
    }

    pub fn uri(&self) -> &str {
        &self.source.uri
    }

    pub fn layout(&self) -> &MediaLayout {
        &self.layout
    }

    pub fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.layout.duration_ms()
    }

    pub fn is_live(&self) -> bool {
        self.layout.is_live()
    }

    /// Whether reads are served from the disk cache
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    /// Presentation time of the next unit
    pub fn position_ms(&self) -> f64 {
        self.layout.position_for_offset(self.cursor)
    }

    /// Move the read cursor; returns the position actually reached
    pub fn seek(&mut self, position_ms: i64) -> f64 {
        self.cursor = self.layout.offset_for_position(position_ms);
        self.position_ms()
    }

    /// Read the next delivery unit and its presentation time; `None` at the end
    pub async fn next_unit(&mut self, audio_frame_ms: u32) -> Result<Option<(f64, Bytes)>> {
        let mut len = self.layout.unit_len(audio_frame_ms);
        if let Some(end) = self.layout.data_end() {
            len = len.min(end.saturating_sub(self.cursor) as usize);
        }
        if len == 0 {
            return Ok(None);
        }

        let pts = self.position_ms();
        let unit = self.reader.read_at(self.cursor, len).await?;
        if unit.is_empty() {
            return Ok(None);
        }
        self.cursor += unit.len() as u64;
        Ok(Some((pts, unit)))
    }

    /// Buffer up to `len` bytes ahead of the cursor
    pub async fn prefetch(&mut self, len: usize) -> Result<()> {
        if let Reader::Remote(remote) = &mut self.reader {
            let len = match self.layout.data_end() {
                Some(end) => len.min(end.saturating_sub(self.cursor) as usize),
                None => len,
            };
            if len > 0 {
                remote.read_at(self.cursor, len).await?;
            }
        }
        Ok(())
    }

    fn with_failovers(mut self, mut earlier: Vec<LineFailover>) -> Self {
        if let Reader::Remote(remote) = &mut self.reader {
            earlier.append(&mut remote.failovers);
            remote.failovers = earlier;
        }
        self
    }

    /// Line changes made by failover since the last call
    pub fn take_failovers(&mut self) -> Vec<LineFailover> {
        match &mut self.reader {
            Reader::Remote(remote) => std::mem::take(&mut remote.failovers),
            _ => Vec::new(),
        }
    }
}

/// Resolves media sources for one player
pub struct SourceResolver {
    transport: Arc<dyn Transport>,
    cache: Option<Arc<CacheManager>>,
    config: PlayerConfig,
}

impl SourceResolver {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Option<Arc<CacheManager>>,
        config: PlayerConfig,
    ) -> Self {
        Self {
            transport,
            cache,
            config,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Resolve `source`, bounded by the resolve timeout and `cancel`
    ///
    /// Line changes made on the way are handed back through
    /// [`ResolvedSource::take_failovers`].
    pub async fn resolve(
        &self,
        source: MediaSource,
        lines: Arc<Mutex<CdnLineManager>>,
        cancel: &CancellationToken,
    ) -> Result<ResolvedSource> {
        let mut failovers = Vec::new();
        let resolved = self.resolve_tracked(source, lines, cancel, &mut failovers).await?;
        Ok(resolved.with_failovers(failovers))
    }

    /// Like [`resolve`](Self::resolve), but line changes are appended to
    /// `failovers` as they happen, so they survive a failed resolution
    #[instrument(skip_all, fields(uri = %source.uri))]
    pub async fn resolve_tracked(
        &self,
        source: MediaSource,
        lines: Arc<Mutex<CdnLineManager>>,
        cancel: &CancellationToken,
        failovers: &mut Vec<LineFailover>,
    ) -> Result<ResolvedSource> {
        let timeout = Duration::from_millis(self.config.resolve_timeout_ms);
        let work = tokio::time::timeout(timeout, self.resolve_inner(source, lines, failovers));

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = work => match result {
                Ok(resolved) => resolved,
                Err(_) => Err(Error::SourceUnreachable(format!(
                    "resolution timed out after {} ms",
                    self.config.resolve_timeout_ms
                ))),
            },
        }
    }

    async fn resolve_inner(
        &self,
        source: MediaSource,
        lines: Arc<Mutex<CdnLineManager>>,
        failovers: &mut Vec<LineFailover>,
    ) -> Result<ResolvedSource> {
        if let Some(custom) = source.custom.clone() {
            return self.resolve_custom(source, custom).await;
        }

        {
            let lines = lines.lock();
            if lines.line_count() == 0 {
                return Err(Error::InvalidUri("source has no uri".into()));
            }
            for line in lines.lines() {
                parse_uri(&line.endpoint)?;
            }
        }

        if let Some(resolved) = self.resolve_cached(&source).await? {
            return Ok(resolved);
        }

        let total_len = content_length_with_failover(self.transport.as_ref(), &lines, failovers)
            .await
            .map_err(unreachable)?;
        let head = fetch_with_failover(self.transport.as_ref(), &lines, failovers, 0, PROBE_LEN)
            .await
            .map_err(unreachable)?;
        if head.is_empty() {
            return Err(Error::UnsupportedFormat("empty source".into()));
        }
        let layout = MediaLayout::probe(&head, total_len)?;

        let assembly = match (&self.cache, total_len) {
            (Some(cache), Some(total_len)) if source.cacheable => {
                let fits = cache.cache_dir().await.is_some()
                    && total_len <= cache.max_cache_file_size().await;
                fits.then(|| Assembly {
                    uri: source.uri.clone(),
                    total_len,
                    data: Vec::with_capacity(total_len as usize),
                })
            }
            _ => None,
        };

        let mut remote = RemoteReader {
            transport: self.transport.clone(),
            lines,
            chunk_size: self.config.chunk_size,
            ahead: Bytes::new(),
            ahead_offset: 0,
            failovers: Vec::new(),
            cache: self.cache.clone(),
            assembly,
        };
        remote.remember(0, head).await;

        info!(
            streams = layout.streams().len(),
            duration_ms = ?layout.duration_ms(),
            "Source resolved"
        );
        Ok(ResolvedSource::new(source, layout, Reader::Remote(Box::new(remote)), false))
    }

    async fn resolve_cached(&self, source: &MediaSource) -> Result<Option<ResolvedSource>> {
        let Some(cache) = self.cache.as_ref().filter(|_| source.cacheable) else {
            return Ok(None);
        };
        let data = match cache.read(&source.uri).await {
            Ok(Some(data)) => data,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(error = %e, "Cache lookup failed, reading from network");
                return Ok(None);
            }
        };

        let layout = MediaLayout::probe(&data, Some(data.len() as u64))?;
        debug!(bytes = data.len(), "Serving source from cache");
        Ok(Some(ResolvedSource::new(
            source.clone(),
            layout,
            Reader::Memory(data),
            true,
        )))
    }

    async fn resolve_custom(
        &self,
        source: MediaSource,
        custom: Arc<Mutex<Box<dyn CustomSource>>>,
    ) -> Result<ResolvedSource> {
        let total_len = {
            let guard = custom.lock();
            guard.total_len()
        };
        let mut reader = CustomReader {
            source: custom,
            // Force an initial seek to the start
            position: u64::MAX,
        };
        let head = reader.read_at(0, PROBE_LEN).await?;
        if head.is_empty() {
            return Err(Error::UnsupportedFormat("empty custom stream".into()));
        }
        let layout = MediaLayout::probe(&head, total_len)?;
        Ok(ResolvedSource::new(source, layout, Reader::Custom(reader), false))
    }
}

/// Resolution reports unreachable sources rather than raw transport errors
fn unreachable(e: Error) -> Error {
    match e {
        Error::TransportFailure { endpoint, reason } => {
            Error::SourceUnreachable(format!("{}: {}", endpoint, reason))
        }
        Error::Network(e) => Error::SourceUnreachable(e.to_string()),
        other => other,
    }
}

/// Snapshot the current line and its request URL
fn current_request(lines: &Mutex<CdnLineManager>) -> Result<(usize, url::Url)> {
    let lines = lines.lock();
    let line = lines
        .current_line()
        .ok_or_else(|| Error::InvalidUri("source has no uri".into()))?;
    Ok((line.index, line.request_url()?))
}

/// Record a failure on `index`; true when the caller should retry on another line
fn fail_over(
    lines: &Mutex<CdnLineManager>,
    failovers: &mut Vec<LineFailover>,
    index: usize,
) -> bool {
    let mut lines = lines.lock();
    match lines.report_failure(index) {
        Some(to) => {
            failovers.push(LineFailover { from: index, to });
            true
        }
        // Someone else already moved off the failed line
        None => lines.current_index() != Some(index),
    }
}

async fn fetch_with_failover(
    transport: &dyn Transport,
    lines: &Mutex<CdnLineManager>,
    failovers: &mut Vec<LineFailover>,
    offset: u64,
    len: usize,
) -> Result<Bytes> {
    let attempts = lines.lock().line_count().max(1);
    let mut attempt = 0;
    loop {
        let (index, url) = current_request(lines)?;
        match transport.read_range(&url, offset, len).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) if e.is_recoverable() => {
                attempt += 1;
                warn!(line = index, offset, error = %e, "Read failed");
                // Every failure is reported, the last one included
                let moved = fail_over(lines, failovers, index);
                if attempt >= attempts || !moved {
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

async fn content_length_with_failover(
    transport: &dyn Transport,
    lines: &Mutex<CdnLineManager>,
    failovers: &mut Vec<LineFailover>,
) -> Result<Option<u64>> {
    let attempts = lines.lock().line_count().max(1);
    let mut attempt = 0;
    loop {
        let (index, url) = current_request(lines)?;
        match transport.content_length(&url).await {
            Ok(len) => return Ok(len),
            Err(e) if e.is_recoverable() => {
                attempt += 1;
                warn!(line = index, error = %e, "Probe failed");
                let moved = fail_over(lines, failovers, index);
                if attempt >= attempts || !moved {
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::media::encode_wav_pcm16;
    use crate::transport::MemoryTransport;

    fn tone(ms: u32) -> Vec<u8> {
        let samples: Vec<i16> = (0..8 * ms).map(|i| (i as i16).wrapping_mul(97)).collect();
        encode_wav_pcm16(8000, 1, &samples)
    }

    fn lines_for(source: &MediaSource, auto: bool) -> Arc<Mutex<CdnLineManager>> {
        Arc::new(Mutex::new(CdnLineManager::new(source.endpoints(), auto)))
    }

    fn resolver(transport: Arc<MemoryTransport>, cache: Option<Arc<CacheManager>>) -> SourceResolver {
        SourceResolver::new(transport, cache, PlayerConfig::default())
    }

    #[tokio::test]
    async fn test_resolve_and_read_remote() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("https://a.example.com/t.wav", tone(100));
        let source = MediaSource::url("https://a.example.com/t.wav");

        let mut resolved = resolver(transport, None)
            .resolve(source.clone(), lines_for(&source, false), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(resolved.duration_ms(), Some(100));
        assert_eq!(resolved.streams().len(), 1);

        let mut units = 0;
        while let Some((pts, unit)) = resolved.next_unit(20).await.unwrap() {
            assert_eq!(pts, units as f64 * 20.0);
            assert_eq!(unit.len(), 320);
            units += 1;
        }
        assert_eq!(units, 5);
    }

    #[tokio::test]
    async fn test_invalid_uri_and_unreachable() {
        let transport = Arc::new(MemoryTransport::new());
        let resolver = resolver(transport, None);
        let cancel = CancellationToken::new();

        let bad = MediaSource::url("ftp://a.example.com/t.wav");
        let err = resolver.resolve(bad.clone(), lines_for(&bad, false), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::InvalidUri(_)));

        let missing = MediaSource::url("https://a.example.com/missing.wav");
        let err = resolver
            .resolve(missing.clone(), lines_for(&missing, false), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SourceUnreachable(_)));
    }

    #[tokio::test]
    async fn test_unsupported_container() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("https://a.example.com/x.mp4", b"\0\0\0\x18ftypisom".to_vec());
        let source = MediaSource::url("https://a.example.com/x.mp4");

        let err = resolver(transport, None)
            .resolve(source.clone(), lines_for(&source, false), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(ref f) if f == "mp4"));
    }

    #[tokio::test]
    async fn test_resolve_fails_over_between_lines() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("https://cdn0.example.com/t.wav", tone(40));
        transport.insert("https://cdn1.example.com/t.wav", tone(40));
        transport.fail_host("cdn0.example.com");

        let source = MediaSource::cdn(vec![
            "https://cdn0.example.com/t.wav".into(),
            "https://cdn1.example.com/t.wav".into(),
        ]);
        let lines = lines_for(&source, true);
        let mut resolved = resolver(transport, None)
            .resolve(source, lines.clone(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(lines.lock().current_index(), Some(1));
        assert_eq!(resolved.take_failovers(), vec![LineFailover { from: 0, to: 1 }]);
        assert!(resolved.take_failovers().is_empty());
    }

    #[tokio::test]
    async fn test_all_lines_failing_wraps_to_first_line() {
        let transport = Arc::new(MemoryTransport::new());
        let endpoints: Vec<String> = (0..3)
            .map(|i| format!("https://cdn{}.example.com/t.wav", i))
            .collect();
        for (i, endpoint) in endpoints.iter().enumerate() {
            transport.insert(endpoint, tone(40));
            transport.fail_host(&format!("cdn{}.example.com", i));
        }

        let source = MediaSource::cdn(endpoints);
        let lines = lines_for(&source, true);
        let mut failovers = Vec::new();
        let err = resolver(transport, None)
            .resolve_tracked(source, lines.clone(), &CancellationToken::new(), &mut failovers)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::SourceUnreachable(_)));
        assert_eq!(
            failovers,
            vec![
                LineFailover { from: 0, to: 1 },
                LineFailover { from: 1, to: 2 },
                LineFailover { from: 2, to: 0 },
            ]
        );
        let lines = lines.lock();
        assert_eq!(lines.current_index(), Some(0));
        assert!((0..3).all(|i| !lines.is_unreachable(i)));
    }

    #[tokio::test]
    async fn test_read_failover_after_resolve() {
        let transport = Arc::new(MemoryTransport::new());
        // Longer than the header read so later units hit the network
        transport.insert("https://cdn0.example.com/t.wav", tone(5000));
        transport.insert("https://cdn1.example.com/t.wav", tone(5000));
        transport.fail_host("cdn0.example.com");

        let source = MediaSource::cdn(vec![
            "https://cdn0.example.com/t.wav".into(),
            "https://cdn1.example.com/t.wav".into(),
        ]);
        let lines = lines_for(&source, true);
        let mut resolved = resolver(transport.clone(), None)
            .resolve(source, lines.clone(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resolved.take_failovers(), vec![LineFailover { from: 0, to: 1 }]);

        transport.heal_host("cdn0.example.com");
        transport.fail_host("cdn1.example.com");
        resolved.seek(4500);
        assert!(resolved.next_unit(20).await.unwrap().is_some());
        assert_eq!(resolved.take_failovers(), vec![LineFailover { from: 1, to: 0 }]);
        assert_eq!(lines.lock().current_index(), Some(0));
    }

    #[tokio::test]
    async fn test_resolve_without_failover_reports_unreachable() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("https://cdn0.example.com/t.wav", tone(40));
        transport.fail_host("cdn0.example.com");
        let source = MediaSource::cdn(vec![
            "https://cdn0.example.com/t.wav".into(),
            "https://cdn1.example.com/t.wav".into(),
        ]);

        let err = resolver(transport, None)
            .resolve(source.clone(), lines_for(&source, false), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SourceUnreachable(_)));
    }

    #[tokio::test]
    async fn test_resolve_timeout_and_cancel() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("https://a.example.com/t.wav", tone(40));
        transport.set_latency(Duration::from_millis(500));
        let source = MediaSource::url("https://a.example.com/t.wav");

        let config = PlayerConfig {
            resolve_timeout_ms: 50,
            ..Default::default()
        };
        let resolver = SourceResolver::new(transport, None, config);
        let err = resolver
            .resolve(source.clone(), lines_for(&source, false), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SourceUnreachable(_)));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = resolver
            .resolve(source.clone(), lines_for(&source, false), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_download_is_cached_then_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(CacheManager::open(dir.path(), CacheConfig::default()).await.unwrap());
        let transport = Arc::new(MemoryTransport::new());
        let data = tone(60);
        transport.insert("https://a.example.com/t.wav", data.clone());

        let source = MediaSource::url("https://a.example.com/t.wav").with_cacheable(true);
        let resolver = resolver(transport.clone(), Some(cache.clone()));
        let cancel = CancellationToken::new();

        let mut resolved = resolver.resolve(source.clone(), lines_for(&source, false), &cancel).await.unwrap();
        assert!(!resolved.from_cache());
        while resolved.next_unit(20).await.unwrap().is_some() {}
        assert!(cache.contains(&source.uri).await);

        let requests = transport.request_count();
        let resolved = resolver.resolve(source.clone(), lines_for(&source, false), &cancel).await.unwrap();
        assert!(resolved.from_cache());
        assert_eq!(transport.request_count(), requests);
        assert_eq!(cache.read(&source.uri).await.unwrap().unwrap().len(), data.len());
    }

    #[tokio::test]
    async fn test_custom_source_seek_and_read() {
        let data = tone(100);
        let source = MediaSource::custom(Box::new(Cursor::new(data)));
        let lines = lines_for(&source, false);

        let transport = Arc::new(MemoryTransport::new());
        let mut resolved = resolver(transport, None)
            .resolve(source, lines, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resolved.duration_ms(), Some(100));

        assert_eq!(resolved.seek(60), 60.0);
        let (pts, unit) = resolved.next_unit(20).await.unwrap().unwrap();
        assert_eq!(pts, 60.0);
        assert_eq!(unit.len(), 320);
    }

    #[tokio::test]
    async fn test_start_position() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("https://a.example.com/t.wav", tone(100));
        let source = MediaSource::url("https://a.example.com/t.wav").with_start_position(40);

        let resolved = resolver(transport, None)
            .resolve(source.clone(), lines_for(&source, false), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resolved.position_ms(), 40.0);
    }
}
