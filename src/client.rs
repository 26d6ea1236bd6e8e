//! Client side of the wire protocol.
//!
//! Used by presentation layers and by the integration tests. One call is in
//! flight at a time; events that arrive meanwhile are queued separately and
//! read with [`Client::next_event`].

use std::net::SocketAddr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::events::EventEnvelope;
use crate::network::{read_frame, CodecError, ErrorBody, Frame, FrameKind, FrameLimits};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Remote error {}: {}", .0.code, .0.message)]
    Remote(ErrorBody),

    #[error("Unexpected response shape: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Connection closed")]
    Closed,

    #[error("Timed out")]
    Timeout,
}

impl ClientError {
    /// The server's error body, if this is a remote error.
    pub fn remote(&self) -> Option<&ErrorBody> {
        match self {
            ClientError::Remote(body) => Some(body),
            _ => None,
        }
    }
}

pub struct Client {
    writer: Mutex<OwnedWriteHalf>,
    responses: Mutex<mpsc::UnboundedReceiver<Frame>>,
    events: Mutex<mpsc::UnboundedReceiver<Frame>>,
    reader: JoinHandle<()>,
    timeout: Duration,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (mut read_half, write_half) = stream.into_split();

        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            let limits = FrameLimits { max_body_len: u32::MAX as usize, ..FrameLimits::default() };
            loop {
                let frame = match read_frame(&mut read_half, limits).await {
                    Ok(frame) => frame,
                    Err(e) if e.is_transport() => break,
                    Err(e) => {
                        tracing::warn!("[client] [bad_frame] error={}", e);
                        continue;
                    }
                };
                let target = if frame.kind == FrameKind::Event { &event_tx } else { &resp_tx };
                if target.send(frame).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            writer: Mutex::new(write_half),
            responses: Mutex::new(resp_rx),
            events: Mutex::new(event_rx),
            reader,
            timeout: Duration::from_secs(10),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends one request and waits for its response body.
    pub async fn call<T: Serialize + ?Sized>(&self, tag: &str, body: &T) -> Result<Value, ClientError> {
        let request = Frame::request(tag, body)?.encode()?;
        let response = self.exchange(&request).await?;
        match response.kind {
            FrameKind::Error => Err(ClientError::Remote(response.json()?)),
            _ => Ok(response.json()?),
        }
    }

    pub async fn call_as<T, R>(&self, tag: &str, body: &T) -> Result<R, ClientError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let value = self.call(tag, body).await?;
        serde_json::from_value(value).map_err(ClientError::Decode)
    }

    /// Writes arbitrary bytes and returns whatever frame answers them.
    pub async fn call_raw(&self, bytes: &[u8]) -> Result<Frame, ClientError> {
        self.exchange(bytes).await
    }

    async fn exchange(&self, bytes: &[u8]) -> Result<Frame, ClientError> {
        let mut responses = self.responses.lock().await;
        {
            let mut writer = self.writer.lock().await;
            writer.write_all(bytes).await?;
            writer.flush().await?;
        }
        match tokio::time::timeout(self.timeout, responses.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Waits up to `timeout` for the next pushed event.
    pub async fn next_event(&self, timeout: Duration) -> Result<EventEnvelope, ClientError> {
        let mut events = self.events.lock().await;
        match tokio::time::timeout(timeout, events.recv()).await {
            Ok(Some(frame)) => Ok(frame.json()?),
            Ok(None) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    pub async fn close(&self) -> Result<(), ClientError> {
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
