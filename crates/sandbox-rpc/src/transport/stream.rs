//! Byte-stream transport.
//!
//! Carries JSON messages over any `AsyncRead + AsyncWrite` stream (TCP in
//! practice) using the length-prefixed framing from [`crate::protocol`].
//!
//! # Thread Safety
//!
//! Writes are serialized through a tokio `Mutex` so whole frames never
//! interleave. A background task owns the read half and feeds every decoded
//! frame into the local [`Mailbox`]; it ends on EOF or the first read error.

use super::{Mailbox, Subscription, Transport};
use crate::protocol::{read_frame, write_frame};
use crate::Result;
use serde_json::Value;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Transport endpoint over a framed byte stream.
pub struct StreamTransport {
    writer: Mutex<BoxedWriter>,
    mailbox: Mailbox,
    reader_task: JoinHandle<()>,
    closed: watch::Receiver<bool>,
}

impl StreamTransport {
    /// Wrap an already-connected stream. Must be called inside a tokio runtime.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mailbox = Mailbox::new();
        let mailbox_for_reader = mailbox.clone();
        let (closed_tx, closed) = watch::channel(false);
        let reader_task = tokio::spawn(async move {
            Self::read_loop(reader, mailbox_for_reader).await;
            closed_tx.send_replace(true);
        });

        Self {
            writer: Mutex::new(Box::new(writer)),
            mailbox,
            reader_task,
            closed,
        }
    }

    /// Connect to a peer over TCP.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!("Stream transport connected to {}", addr);
        Ok(Self::new(stream))
    }

    /// True once the peer closed the stream or a read failed.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.reader_task.is_finished()
    }

    /// Resolve once the read side has ended.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        // An error means the reader task is gone, which is closed as well.
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Flush and shut down the write half.
    pub async fn shutdown(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }

    async fn read_loop<R>(mut reader: R, mailbox: Mailbox)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("Stream transport closed by peer");
                    return;
                }
                Err(e) => {
                    warn!("Stream transport read failed: {}", e);
                    return;
                }
            };

            match serde_json::from_slice::<Value>(&frame) {
                Ok(value) => {
                    mailbox.deliver(value);
                }
                Err(e) => warn!("Dropping undecodable frame ({} bytes): {}", frame.len(), e),
            }
        }
    }
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("mailbox", &self.mailbox)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[async_trait::async_trait]
impl Transport for StreamTransport {
    async fn post(&self, message: Value) -> Result<()> {
        let payload = serde_json::to_vec(&message)?;
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &payload).await
    }

    fn subscribe(&self) -> Subscription {
        self.mailbox.subscribe()
    }
}
