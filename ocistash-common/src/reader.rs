//! Readers handed to `Backend::save`.
//!
//! The total length must be known before the upload starts, and a reader
//! can be rewound so a save may be repeated from the beginning.

use std::io::SeekFrom;
use std::path::Path;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// A byte source with a known length that can restart from the beginning.
#[async_trait]
pub trait RewindReader: Send {
    /// Total number of bytes the reader yields from the start.
    fn length(&self) -> u64;

    async fn rewind(&mut self) -> std::io::Result<()>;

    /// Read up to `max` bytes. An empty result signals end of data.
    async fn read_chunk(&mut self, max: usize) -> std::io::Result<Bytes>;

    /// Read until `max` bytes are collected or the data ends.
    async fn read_full(&mut self, max: usize) -> std::io::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(max.min(self.length() as usize));
        while buf.len() < max {
            let chunk = self.read_chunk(max - buf.len()).await?;
            if chunk.is_empty() {
                break;
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

/// Reader over an in-memory buffer.
#[derive(Debug, Clone)]
pub struct ByteReader {
    data: Bytes,
    pos: usize,
}

impl ByteReader {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into(), pos: 0 }
    }
}

#[async_trait]
impl RewindReader for ByteReader {
    fn length(&self) -> u64 {
        self.data.len() as u64
    }

    async fn rewind(&mut self) -> std::io::Result<()> {
        self.pos = 0;
        Ok(())
    }

    async fn read_chunk(&mut self, max: usize) -> std::io::Result<Bytes> {
        let end = (self.pos + max).min(self.data.len());
        let chunk = self.data.slice(self.pos..end);
        self.pos = end;
        Ok(chunk)
    }
}

/// Reader over a local file whose size is taken when it is opened.
pub struct FileReader {
    file: tokio::fs::File,
    length: u64,
}

impl FileReader {
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let length = file.metadata().await?.len();
        Ok(Self { file, length })
    }
}

#[async_trait]
impl RewindReader for FileReader {
    fn length(&self) -> u64 {
        self.length
    }

    async fn rewind(&mut self) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(0)).await?;
        Ok(())
    }

    async fn read_chunk(&mut self, max: usize) -> std::io::Result<Bytes> {
        let mut buf = vec![0u8; max.min(1 << 20)];
        let n = self.file.read(&mut buf).await?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }
}
