//! Byte-stream layering primitives.
//!
//! Every layer of the connection pipeline exposes the same two halves: a
//! `ChunkRead` producing arbitrary-sized byte chunks and a `ChunkWrite`
//! accepting them. A `Stream` pairs the halves and adds the buffered framing
//! helpers the negotiation code needs (exact reads, varints). Re-wrapping a
//! layer's halves into a new `Stream` is how the stack composes: TCP carries
//! secio, secio carries yamux, a yamux channel carries a protocol.

use super::NetError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

/// How much to pull off a raw socket per read.
const TCP_READ_CHUNK: usize = 64 * 1024;

/// Varints longer than this are malformed.
const MAX_VARINT_BYTES: usize = 10;

/// Largest length-delimited protocol message we will buffer.
const MAX_FRAMED_MESSAGE: usize = 4 * 1024 * 1024;

/// Readable half of a layered stream.
#[async_trait]
pub trait ChunkRead: Send {
    /// Next chunk of bytes, at least one. A closed stream returns
    /// `Err(NetError::Closed)`, never an empty chunk.
    async fn read_chunk(&mut self) -> Result<Vec<u8>, NetError>;
}

/// Writable half of a layered stream.
#[async_trait]
pub trait ChunkWrite: Send {
    async fn write_chunk(&mut self, buf: &[u8]) -> Result<(), NetError>;

    async fn close(&mut self) -> Result<(), NetError>;
}

/// Buffered reader over a `ChunkRead`, providing exact-length and varint
/// reads across chunk boundaries.
pub struct FrameReader {
    inner: Box<dyn ChunkRead>,
    buf: VecDeque<u8>,
}

impl FrameReader {
    pub fn new(inner: Box<dyn ChunkRead>) -> Self {
        Self { inner, buf: VecDeque::new() }
    }

    async fn fill(&mut self) -> Result<(), NetError> {
        let chunk = self.inner.read_chunk().await?;
        self.buf.extend(chunk);
        Ok(())
    }

    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, NetError> {
        while self.buf.len() < n {
            self.fill().await?;
        }
        Ok(self.buf.drain(..n).collect())
    }

    pub async fn read_byte(&mut self) -> Result<u8, NetError> {
        while self.buf.is_empty() {
            self.fill().await?;
        }
        Ok(self.buf.pop_front().unwrap_or_default())
    }

    /// LEB128 varint, one byte at a time so partial arrivals are fine.
    pub async fn read_uvarint(&mut self) -> Result<u64, NetError> {
        let mut value = 0u64;
        let mut shift = 0u32;
        for i in 0..MAX_VARINT_BYTES {
            let byte = self.read_byte().await?;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if i == MAX_VARINT_BYTES - 1 {
                break;
            }
        }
        Err(NetError::Protocol("varint overflow".into()))
    }

    /// Whatever is available: buffered bytes first, else one fresh chunk.
    pub async fn read_any(&mut self) -> Result<Vec<u8>, NetError> {
        if !self.buf.is_empty() {
            return Ok(self.buf.drain(..).collect());
        }
        self.inner.read_chunk().await
    }
}

/// A duplex byte stream at some layer of the pipeline.
pub struct Stream {
    reader: FrameReader,
    writer: Box<dyn ChunkWrite>,
}

impl Stream {
    pub fn new(reader: Box<dyn ChunkRead>, writer: Box<dyn ChunkWrite>) -> Self {
        Self { reader: FrameReader::new(reader), writer }
    }

    /// Wrap a raw TCP socket as the bottom of the stack.
    pub fn tcp(stream: TcpStream) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self::new(Box::new(TcpChunkReader(r)), Box::new(TcpChunkWriter(w)))
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<(), NetError> {
        self.writer.write_chunk(buf).await
    }

    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, NetError> {
        self.reader.read_exact(n).await
    }

    pub async fn read_uvarint(&mut self) -> Result<u64, NetError> {
        self.reader.read_uvarint().await
    }

    pub async fn read_any(&mut self) -> Result<Vec<u8>, NetError> {
        self.reader.read_any().await
    }

    /// Write one varint-length-delimited message.
    pub async fn write_framed(&mut self, msg: &[u8]) -> Result<(), NetError> {
        let mut buf = Vec::with_capacity(msg.len() + 5);
        crate::wire::put_uvarint(&mut buf, msg.len() as u64);
        buf.extend_from_slice(msg);
        self.writer.write_chunk(&buf).await
    }

    /// Read one varint-length-delimited message.
    pub async fn read_framed(&mut self) -> Result<Vec<u8>, NetError> {
        let len = self.reader.read_uvarint().await? as usize;
        if len > MAX_FRAMED_MESSAGE {
            return Err(NetError::TooLarge(len));
        }
        self.reader.read_exact(len).await
    }

    pub async fn close(&mut self) -> Result<(), NetError> {
        self.writer.close().await
    }

    /// Tear the stream into halves, e.g. to hand the reader to a session task.
    pub fn into_parts(self) -> (FrameReader, Box<dyn ChunkWrite>) {
        (self.reader, self.writer)
    }
}

/// Run `fut` under a deadline of `secs` seconds.
pub async fn with_deadline<T, F>(secs: u64, fut: F) -> Result<T, NetError>
where
    F: Future<Output = Result<T, NetError>>,
{
    tokio::time::timeout(Duration::from_secs(secs), fut)
        .await
        .map_err(|_| NetError::Timeout)?
}

pub struct TcpChunkReader(ReadHalf<TcpStream>);

#[async_trait]
impl ChunkRead for TcpChunkReader {
    async fn read_chunk(&mut self) -> Result<Vec<u8>, NetError> {
        let mut buf = vec![0u8; TCP_READ_CHUNK];
        let n = self.0.read(&mut buf).await?;
        if n == 0 {
            return Err(NetError::Closed);
        }
        buf.truncate(n);
        Ok(buf)
    }
}

pub struct TcpChunkWriter(WriteHalf<TcpStream>);

#[async_trait]
impl ChunkWrite for TcpChunkWriter {
    async fn write_chunk(&mut self, buf: &[u8]) -> Result<(), NetError> {
        self.0.write_all(buf).await?;
        self.0.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), NetError> {
        self.0.shutdown().await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::pair;
    use super::*;

    #[tokio::test]
    async fn exact_reads_cross_chunk_boundaries() {
        let (mut a, mut b) = pair();
        a.write(b"hel").await.unwrap();
        a.write(b"lo world").await.unwrap();
        let got = b.read_exact(11).await.unwrap();
        assert_eq!(got, b"hello world");
    }

    #[tokio::test]
    async fn varint_split_across_writes() {
        let (mut a, mut b) = pair();
        // 300 = 0xAC 0x02, written one byte at a time
        a.write(&[0xac]).await.unwrap();
        a.write(&[0x02]).await.unwrap();
        assert_eq!(b.read_uvarint().await.unwrap(), 300);
    }

    #[tokio::test]
    async fn closed_stream_reports_closed() {
        let (mut a, mut b) = pair();
        a.close().await.unwrap();
        assert!(matches!(b.read_exact(1).await, Err(NetError::Closed) | Err(NetError::Io(_))));
    }

    #[tokio::test]
    async fn deadline_fires() {
        let (_a, mut b) = pair();
        let res = with_deadline(1, async { b.read_exact(1).await }).await;
        assert!(matches!(res, Err(NetError::Timeout)));
    }
}
