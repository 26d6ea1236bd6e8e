//! One duplex byte connection with serialized access per direction.
//!
//! Every logical write holds the writer lock for the duration of a single
//! `write_all` + `flush`, and every logical read holds the reader lock until
//! a whole frame has been consumed. Bytes of two logical operations in the
//! same direction therefore never interleave. The two directions use
//! separate locks so a pending read never blocks an outbound event.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::codec::{CodecError, PacketWriter};
use super::frame::{read_frame, Frame, FrameLimits};

pub struct SyncStream<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
    limits: FrameLimits,
}

pub type TcpSyncStream = SyncStream<OwnedReadHalf, OwnedWriteHalf>;

impl SyncStream<OwnedReadHalf, OwnedWriteHalf> {
    pub fn from_tcp(stream: TcpStream, limits: FrameLimits) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self::new(read_half, write_half, limits)
    }
}

impl<R, W> SyncStream<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, limits: FrameLimits) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            limits,
        }
    }

    pub fn limits(&self) -> FrameLimits {
        self.limits
    }

    pub async fn read_frame(&self) -> Result<Frame, CodecError> {
        let mut reader = self.reader.lock().await;
        read_frame(&mut *reader, self.limits).await
    }

    pub async fn write_frame(&self, frame: &Frame) -> Result<(), CodecError> {
        let encoded = frame.encode()?;
        self.write_encoded(&encoded).await
    }

    /// Writes a composite packet built field by field as one logical write.
    pub async fn write_packet(&self, packet: PacketWriter) -> Result<(), CodecError> {
        self.write_encoded(&packet.into_bytes()).await
    }

    pub async fn write_encoded(&self, bytes: &Bytes) -> Result<(), CodecError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Flushes and closes the write direction. Waits for any in-flight
    /// write to finish first.
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("[stream] [shutdown] error={}", e);
        }
    }
}
