//! Length-delimited framing over the client socket: a magic byte, a
//! little-endian `u32` length, then a `bincode`-serialized body.

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAGIC: u8 = b'W';
pub const HEADER_LEN: usize = 5;
pub const MAX_BODY_LEN: u32 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("bad magic byte: expected 'W' (0x57), got {0:#x}")]
    BadMagic(u8),
    #[error("frame body too large: {0} bytes (max {max})", max = MAX_BODY_LEN)]
    TooLarge(u32),
    #[error("connection closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("deserialization error: {0}")]
    Decode(#[from] bincode::Error),
}

/// Reassembles frames from stream bytes.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(HEADER_LEN + 4096),
        }
    }

    async fn fill(&mut self, at_least: usize) -> Result<(), FrameError> {
        while self.buf.len() < at_least {
            let mut chunk = [0u8; 8192];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return Err(FrameError::Closed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    /// Reads one frame body and decodes it as `T`.
    pub async fn read_frame<T: DeserializeOwned>(&mut self) -> Result<T, FrameError> {
        self.fill(HEADER_LEN).await?;
        let magic = self.buf[0];
        if magic != MAGIC {
            return Err(FrameError::BadMagic(magic));
        }
        let len = u32::from_le_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        if len > MAX_BODY_LEN {
            return Err(FrameError::TooLarge(len));
        }
        self.fill(HEADER_LEN + len as usize).await?;
        self.buf.advance(HEADER_LEN);
        let body = self.buf.split_to(len as usize);
        let value = bincode::deserialize(&body)?;
        Ok(value)
    }
}

/// Serializes frames onto the socket.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_frame<T: Serialize>(&mut self, value: &T) -> Result<(), FrameError> {
        let body = bincode::serialize(value)?;
        if body.len() > MAX_BODY_LEN as usize {
            return Err(FrameError::TooLarge(body.len() as u32));
        }

        let mut header = BytesMut::with_capacity(HEADER_LEN);
        header.put_u8(MAGIC);
        header.put_u32_le(body.len() as u32);

        self.inner.write_all(&header).await?;
        self.inner.write_all(&body).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping(u32);

    #[tokio::test]
    async fn round_trips_a_frame() {
        let (client, server) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(client);
        let mut writer = FrameWriter::new(write_half);
        let mut reader = FrameReader::new(server);

        writer.write_frame(&Ping(7)).await.unwrap();
        drop(read_half);

        let decoded: Ping = reader.read_frame().await.unwrap();
        assert_eq!(decoded, Ping(7));
    }

    #[tokio::test]
    async fn rejects_bad_magic() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = FrameReader::<_>::new(server);

        client.write_all(&[b'X', 0, 0, 0, 0]).await.unwrap();

        let err = reader.read_frame::<Ping>().await.unwrap_err();
        assert!(matches!(err, FrameError::BadMagic(b'X')));
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = FrameReader::<_>::new(server);

        let mut header = BytesMut::new();
        header.put_u8(MAGIC);
        header.put_u32_le(MAX_BODY_LEN + 1);
        client.write_all(&header).await.unwrap();

        let err = reader.read_frame::<Ping>().await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
    }
}
