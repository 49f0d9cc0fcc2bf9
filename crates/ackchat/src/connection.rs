use crate::protocol::{MAX_LINE_BYTES, Pdu};
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Default depth of a connection's outbound queue.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no message received within {0:?}")]
    Timeout(Duration),

    #[error("connection closed by peer")]
    EndOfStream,

    #[error("transport error: {0}")]
    Codec(#[from] LinesCodecError),

    #[error("malformed pdu: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("connection closed")]
    Closed,

    #[error("outbound queue full")]
    QueueFull,
}

impl TransportError {
    /// Whether the connection is still usable after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_) | TransportError::Malformed(_) | TransportError::QueueFull
        )
    }
}

/// Cheap, cloneable sending side of a [`Connection`].
///
/// This is the opaque handle the server registry stores per session. Sends are
/// queued without waiting; a dedicated writer task owns the socket.
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<Pdu>,
    closed: CancellationToken,
    peer: Arc<str>,
}

impl ConnectionHandle {
    /// Queue a PDU for delivery. Never blocks.
    pub fn send(&self, pdu: Pdu) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.tx.try_send(pdu).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::QueueFull,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Stop the writer once the queued PDUs are flushed. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Peer label used in logs (remote address or a test name).
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// A line-framed PDU connection: the read half is owned by whoever drives the
/// conversation, the write half by a background task fed through a
/// [`ConnectionHandle`].
pub struct Connection {
    reader: FramedRead<BoxedReader, LinesCodec>,
    handle: ConnectionHandle,
    writer_task: Option<JoinHandle<()>>,
}

impl Connection {
    /// Wrap any byte stream. Must be called inside a tokio runtime.
    pub fn new<S>(stream: S, peer: impl Into<String>, outbound_queue: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        let reader: BoxedReader = Box::new(r);
        let reader = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

        let (tx, rx) = mpsc::channel(outbound_queue.max(1));
        let closed = CancellationToken::new();
        let peer: Arc<str> = Arc::from(peer.into());

        let writer_task = tokio::spawn(write_loop(writer, rx, closed.clone(), peer.clone()));

        Self {
            reader,
            handle: ConnectionHandle { tx, closed, peer },
            writer_task: Some(writer_task),
        }
    }

    /// Wrap an accepted or connected TCP stream, labelled with its remote address.
    pub fn from_tcp(stream: TcpStream, outbound_queue: usize) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        stream.set_nodelay(true).ok();
        Self::new(stream, peer, outbound_queue)
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn peer(&self) -> &str {
        self.handle.peer()
    }

    pub fn send(&self, pdu: Pdu) -> Result<(), TransportError> {
        self.handle.send(pdu)
    }

    /// Wait for the next PDU, giving up after `timeout`.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Pdu, TransportError> {
        match tokio::time::timeout(timeout, self.receive_next()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    /// Wait for the next PDU without a deadline.
    pub async fn receive_next(&mut self) -> Result<Pdu, TransportError> {
        let Some(line) = self.reader.next().await else {
            return Err(TransportError::EndOfStream);
        };
        let line = line?;
        trace!(peer = %self.handle.peer, %line, "received line");
        Ok(Pdu::from_line(&line)?)
    }

    /// Flush queued PDUs and shut the write side down. Never fails observably.
    pub async fn close(&mut self) {
        self.handle.close();
        if let Some(task) = self.writer_task.take() {
            task.await.ok();
        }
    }
}

async fn write_loop<W>(
    mut writer: FramedWrite<W, LinesCodec>,
    mut rx: mpsc::Receiver<Pdu>,
    closed: CancellationToken,
    peer: Arc<str>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            pdu = rx.recv() => {
                let Some(pdu) = pdu else { break };
                if let Err(e) = write_pdu(&mut writer, &pdu).await {
                    debug!(peer = %peer, err = %e, "write failed, closing connection");
                    break;
                }
            }
            _ = closed.cancelled() => {
                while let Ok(pdu) = rx.try_recv() {
                    if write_pdu(&mut writer, &pdu).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    // Later sends fail fast instead of filling a queue nobody drains.
    closed.cancel();
    SinkExt::<String>::close(&mut writer).await.ok();
}

async fn write_pdu<W>(writer: &mut FramedWrite<W, LinesCodec>, pdu: &Pdu) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let line = pdu.to_line()?;
    writer.send(line).await?;
    Ok(())
}
