//! Image content in transit
//!
//! A [`Blob`] is an immutable value describing some image bytes and how to
//! reach them. The bytes either live in memory or behind a file handle opened
//! when the blob was built; every access mode
//! (full materialization, forward-only stream, seekable stream) reads the same
//! logical content, and every stream request opens a fresh, independently
//! positioned reader.
//!
//! Content-type detection works on a prefix of at most [`SNIFF_LEN`] bytes
//! captured at construction time, so sniffing never forces a large blob to be
//! materialized.

use crate::error::{Result, RelayError};
use bytes::{Buf, Bytes};
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::HeaderMap;
use std::future::Future;
use std::io::{self, Cursor, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};
use tokio::task::JoinHandle;
use tracing::debug;

/// Maximum number of leading bytes used for content-type sniffing
pub const SNIFF_LEN: usize = 512;

/// Fallback type for content that matches no known signature
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Forward-only reader over a blob's content
pub type BlobStream = Box<dyn AsyncRead + Send + Unpin>;

/// Reader supporting both reads and seeks
pub trait SeekableRead: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> SeekableRead for T {}

/// Seekable reader over a blob's content
pub type SeekableStream = Box<dyn SeekableRead>;

#[derive(Debug, Clone)]
enum Source {
    Memory(Bytes),
    /// Handle opened at construction; later renames or rewrites of the path
    /// do not reach it
    File {
        file: Arc<std::fs::File>,
        path: PathBuf,
    },
}

/// Immutable content holder with byte, stream and seekable-stream access
#[derive(Debug, Clone)]
pub struct Blob {
    source: Source,
    size: u64,
    sniff: Bytes,
    declared_content_type: Option<String>,
    headers: HeaderMap,
}

impl Blob {
    /// Build a blob over in-memory bytes. Never performs I/O.
    pub fn from_bytes(data: impl Into<Bytes>, content_type: Option<&str>) -> Self {
        let data: Bytes = data.into();
        let sniff = data.slice(..data.len().min(SNIFF_LEN));
        let size = data.len() as u64;

        Blob {
            source: Source::Memory(data),
            size,
            sniff,
            declared_content_type: None,
            headers: HeaderMap::new(),
        }
        .with_declared(content_type)
    }

    /// An empty blob
    pub fn empty() -> Self {
        Self::from_bytes(Bytes::new(), None)
    }

    /// Build a blob backed by a file on disk
    ///
    /// The file is opened once and the handle is kept, so the blob keeps
    /// reading the content it was built over even if the path is replaced.
    pub async fn from_file(path: impl AsRef<Path>, content_type: Option<&str>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = fs::File::open(&path).await?;
        Self::from_open_file(file, path, content_type).await
    }

    /// Build a blob over an already opened file
    pub(crate) async fn from_open_file(
        file: fs::File,
        path: PathBuf,
        content_type: Option<&str>,
    ) -> Result<Self> {
        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(RelayError::NotFound(format!("{} is not a file", path.display())));
        }

        let size = meta.len();
        let file = Arc::new(file.into_std().await);
        let sniff_len = size.min(SNIFF_LEN as u64) as usize;
        let prefix = read_range(Arc::clone(&file), 0, sniff_len)
            .await
            .map_err(|e| RelayError::IoError(format!("read {}: {}", path.display(), e)))?;

        debug!("Opened file blob: path={}, size={}", path.display(), size);

        Ok(Blob {
            source: Source::File { file, path },
            size,
            sniff: Bytes::from(prefix),
            declared_content_type: None,
            headers: HeaderMap::new(),
        }
        .with_declared(content_type))
    }

    fn with_declared(self, content_type: Option<&str>) -> Self {
        match content_type {
            Some(ct) if !ct.is_empty() => self.with_content_type(ct),
            _ => self,
        }
    }

    /// Replace the declared content type
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            self.headers.insert(CONTENT_TYPE, value);
        }
        self.declared_content_type = Some(content_type.to_string());
        self
    }

    /// Attach a protocol-level header
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Size of the content in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// First `min(size, 512)` bytes of the content
    pub fn sniff_prefix(&self) -> &[u8] {
        &self.sniff
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn declared_content_type(&self) -> Option<&str> {
        self.declared_content_type.as_deref()
    }

    /// Declared content type, or the type sniffed from the prefix
    pub fn content_type(&self) -> &str {
        match &self.declared_content_type {
            Some(ct) => ct,
            None => sniff_content_type(&self.sniff),
        }
    }

    /// Materialize the full content
    pub async fn as_bytes(&self) -> Result<Bytes> {
        match &self.source {
            Source::Memory(data) => Ok(data.clone()),
            Source::File { file, path } => read_range(Arc::clone(file), 0, self.size as usize)
                .await
                .map(Bytes::from)
                .map_err(|e| RelayError::IoError(format!("read {}: {}", path.display(), e))),
        }
    }

    /// Open a fresh forward-only reader
    pub async fn new_stream(&self) -> Result<(BlobStream, u64)> {
        let reader: BlobStream = match &self.source {
            Source::Memory(data) => Box::new(Cursor::new(data.clone())),
            Source::File { file, .. } => Box::new(FileRangeReader::new(Arc::clone(file), self.size)),
        };
        Ok((reader, self.size))
    }

    /// Open a fresh seekable reader
    ///
    /// Each reader tracks its own position. Dropping one releases nothing the
    /// blob still needs.
    pub async fn new_seekable_stream(&self) -> Result<(SeekableStream, u64)> {
        let reader: SeekableStream = match &self.source {
            Source::Memory(data) => Box::new(Cursor::new(data.clone())),
            Source::File { file, .. } => Box::new(FileRangeReader::new(Arc::clone(file), self.size)),
        };
        Ok((reader, self.size))
    }
}

const READ_CHUNK: usize = 64 * 1024;

/// Reader over a shared file handle that positions every read itself
///
/// Reads run on the blocking pool with positional I/O, so any number of
/// readers can share one handle without disturbing each other.
struct FileRangeReader {
    file: Arc<std::fs::File>,
    pos: u64,
    end: u64,
    buffered: Bytes,
    pending: Option<JoinHandle<io::Result<Vec<u8>>>>,
}

impl FileRangeReader {
    fn new(file: Arc<std::fs::File>, end: u64) -> Self {
        FileRangeReader {
            file,
            pos: 0,
            end,
            buffered: Bytes::new(),
            pending: None,
        }
    }
}

impl AsyncRead for FileRangeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.buffered.is_empty() {
                let n = this.buffered.len().min(buf.remaining());
                buf.put_slice(&this.buffered[..n]);
                this.buffered.advance(n);
                this.pos += n as u64;
                return Poll::Ready(Ok(()));
            }
            if this.pos >= this.end || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            let mut handle = match this.pending.take() {
                Some(handle) => handle,
                None => {
                    let file = Arc::clone(&this.file);
                    let offset = this.pos;
                    let len = (this.end - this.pos).min(READ_CHUNK as u64) as usize;
                    tokio::task::spawn_blocking(move || read_chunk_at(&file, offset, len))
                }
            };

            match Pin::new(&mut handle).poll(cx) {
                Poll::Pending => {
                    this.pending = Some(handle);
                    return Poll::Pending;
                }
                Poll::Ready(Err(join)) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, join)))
                }
                Poll::Ready(Ok(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(Ok(data))) => this.buffered = Bytes::from(data),
            }
        }
    }
}

impl AsyncSeek for FileRangeReader {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let target = match position {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(delta) => self.end.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of blob")
        })?;

        self.pos = target;
        self.buffered = Bytes::new();
        self.pending = None;
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.pos))
    }
}

async fn read_range(file: Arc<std::fs::File>, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let chunk = read_chunk_at(&file, offset + filled as u64, len - filled)?;
            buf[filled..filled + chunk.len()].copy_from_slice(&chunk);
            filled += chunk.len();
        }
        Ok(buf)
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

/// One positional read of at most `len` bytes; end of file is an error
fn read_chunk_at(file: &std::fs::File, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    loop {
        match read_at(file, &mut buf, offset) {
            Ok(0) if len > 0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("file truncated at offset {}", offset),
                ))
            }
            Ok(n) => {
                buf.truncate(n);
                return Ok(buf);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

#[cfg(unix)]
fn read_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

/// Detect a content type from leading bytes
///
/// Pure function over the prefix; recognizes the common web image formats and
/// falls back to `text/plain` for text-like data and
/// `application/octet-stream` otherwise.
pub fn sniff_content_type(prefix: &[u8]) -> &'static str {
    if prefix.is_empty() {
        return OCTET_STREAM;
    }
    if prefix.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return "image/jpeg";
    }
    if prefix.starts_with(b"\x89PNG\r\n\x1a\n") {
        return "image/png";
    }
    if prefix.starts_with(b"GIF87a") || prefix.starts_with(b"GIF89a") {
        return "image/gif";
    }
    if prefix.len() >= 12 && &prefix[0..4] == b"RIFF" && &prefix[8..12] == b"WEBP" {
        return "image/webp";
    }
    if prefix.len() >= 12 && &prefix[4..8] == b"ftyp" {
        match &prefix[8..12] {
            b"avif" | b"avis" => return "image/avif",
            b"heic" | b"heix" | b"mif1" | b"msf1" => return "image/heif",
            _ => {}
        }
    }
    if prefix.starts_with(b"II*\0") || prefix.starts_with(b"MM\0*") {
        return "image/tiff";
    }
    if prefix.starts_with(b"BM") {
        return "image/bmp";
    }
    if prefix.starts_with(b"%PDF-") {
        return "application/pdf";
    }

    let text = trim_leading_whitespace(prefix);
    if text.starts_with(b"<svg") || (text.starts_with(b"<?xml") && contains(text, b"<svg")) {
        return "image/svg+xml";
    }
    if prefix.iter().any(|b| is_binary_byte(*b)) {
        return OCTET_STREAM;
    }
    "text/plain; charset=utf-8"
}

fn trim_leading_whitespace(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    &data[start..]
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn is_binary_byte(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F)
}
