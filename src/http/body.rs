//! Lazy body streams: request bodies too large to buffer, and file ranges
//! served as response bodies.
//!
//! Both are consumed in bounded chunks of at most [`CHUNK_SIZE`] bytes so that
//! arbitrarily large payloads never have to sit in memory at once.

use std::io;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;

use super::HttpError;

/// Upper bound on the size of a single body chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Sending half of a channel-backed [`BodyStream`].
pub type BodySender = mpsc::Sender<io::Result<Bytes>>;

/// A read-once stream of request body chunks.
#[derive(Debug)]
pub struct BodyStream {
    inner: StreamInner,
}

#[derive(Debug)]
enum StreamInner {
    // Chunks pumped from a live connection by the backend.
    Channel(mpsc::Receiver<io::Result<Bytes>>),
    // A body the backend already holds in memory, handed out in slices.
    Buffered { data: Bytes, chunk: usize },
}

impl BodyStream {
    /// Creates a stream fed by a bounded channel; the backend keeps the sender.
    pub fn channel(capacity: usize) -> (BodySender, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            tx,
            Self {
                inner: StreamInner::Channel(rx),
            },
        )
    }

    /// Creates a stream that yields `data` in slices of `chunk` bytes.
    pub fn buffered(data: Bytes, chunk: usize) -> Self {
        Self {
            inner: StreamInner::Buffered {
                data,
                chunk: chunk.max(1),
            },
        }
    }

    /// Returns the next chunk, or `None` once the body is exhausted.
    pub async fn chunk(&mut self) -> Option<io::Result<Bytes>> {
        match &mut self.inner {
            StreamInner::Channel(rx) => rx.recv().await,
            StreamInner::Buffered { data, chunk } => {
                if data.is_empty() {
                    None
                } else {
                    let n = (*chunk).min(data.len());
                    Some(Ok(data.split_to(n)))
                }
            }
        }
    }

    /// Drains the remaining chunks into a single buffer.
    pub async fn collect(mut self) -> io::Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.chunk().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }
}

/// A byte range within a file: `offset` from the start, `length` bytes or
/// everything up to the end of the file when `length` is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteRange {
    pub offset: u64,
    pub length: Option<u64>,
}

impl ByteRange {
    /// The whole file.
    pub const FULL: ByteRange = ByteRange {
        offset: 0,
        length: None,
    };

    pub fn new(offset: u64, length: Option<u64>) -> Self {
        Self { offset, length }
    }

    /// Resolves the range against a file of `size` bytes, returning the number
    /// of bytes to send.
    ///
    /// # Errors
    ///
    /// [`HttpError::RangeNotSatisfiable`] when the range starts or ends past
    /// the end of the file.
    pub fn resolve(self, size: u64) -> Result<u64, HttpError> {
        let unsatisfiable = || HttpError::RangeNotSatisfiable {
            offset: self.offset,
            length: self.length,
            size,
        };
        if self.offset > size {
            return Err(unsatisfiable());
        }
        match self.length {
            None => Ok(size - self.offset),
            Some(len) if self.offset.checked_add(len).is_some_and(|end| end <= size) => Ok(len),
            Some(_) => Err(unsatisfiable()),
        }
    }
}

/// A validated file range used as a response body.
///
/// The file is opened only when the body is emitted; [`FileBody::resolve`]
/// checks existence and bounds up front so that errors surface where the
/// response is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBody {
    path: PathBuf,
    offset: u64,
    len: u64,
}

impl FileBody {
    /// Checks that `path` is a regular file and that `range` fits inside it.
    ///
    /// # Errors
    ///
    /// - [`HttpError::FileNotFound`] when the path does not name a regular file.
    /// - [`HttpError::RangeNotSatisfiable`] when the range exceeds the file.
    pub async fn resolve(path: impl AsRef<Path>, range: ByteRange) -> Result<Self, HttpError> {
        let path = path.as_ref();
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta,
            _ => {
                return Err(HttpError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
        };
        let len = range.resolve(meta.len())?;
        Ok(Self {
            path: path.to_path_buf(),
            offset: range.offset,
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of bytes this body will emit.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Opens the file and positions it at the start of the range.
    pub async fn open(&self) -> io::Result<FileChunks> {
        let mut file = File::open(&self.path).await?;
        if self.offset > 0 {
            file.seek(io::SeekFrom::Start(self.offset)).await?;
        }
        Ok(FileChunks {
            file,
            remaining: self.len,
        })
    }
}

/// Sequential reader over an open [`FileBody`].
#[derive(Debug)]
pub struct FileChunks {
    file: File,
    remaining: u64,
}

impl FileChunks {
    /// Reads the next chunk of at most [`CHUNK_SIZE`] bytes.
    ///
    /// A file that shrank since the body was resolved yields
    /// [`io::ErrorKind::UnexpectedEof`] rather than a short body.
    pub async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let want = self.remaining.min(CHUNK_SIZE as u64) as usize;
        let mut buf = vec![0u8; want];
        self.file.read_exact(&mut buf).await?;
        self.remaining -= want as u64;
        Ok(Some(Bytes::from(buf)))
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}
