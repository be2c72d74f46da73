//! Stream-backed transport over any `AsyncRead`/`AsyncWrite` pair.
//!
//! The read half is wrapped in a [`BufReader`] and read line by line. The
//! write half is owned by a background writer task fed through an
//! unbounded channel, so [`Transport::write_line`] is a plain channel
//! send that never suspends.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, trace};

use super::{Transport, TransportError};

/// Transport over a split duplex byte stream.
///
/// Works with anything that splits into an `AsyncRead` and an
/// `AsyncWrite` half, e.g. `tokio::net::UnixStream::into_split()` or a
/// child process's stdio pair.
pub struct StreamTransport<R> {
    reader: BufReader<R>,
    writer_tx: Option<mpsc::UnboundedSender<String>>,
    connected: bool,
}

impl<R> StreamTransport<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Create a transport from the two halves of a duplex stream.
    ///
    /// Spawns the writer task; must be called from within a tokio runtime.
    pub fn new<W>(read: R, write: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::writer_task(write, writer_rx));

        Self {
            reader: BufReader::new(read),
            writer_tx: Some(writer_tx),
            connected: true,
        }
    }

    /// Drains queued lines to the write half until the channel closes or
    /// a write fails.
    async fn writer_task<W>(mut write: W, mut writer_rx: mpsc::UnboundedReceiver<String>)
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(line) = writer_rx.recv().await {
            trace!(line = line.trim_end(), "writing line");

            if let Err(e) = write.write_all(line.as_bytes()).await {
                error!("failed to write line: {e}");
                break;
            }
            if let Err(e) = write.flush().await {
                error!("failed to flush: {e}");
                break;
            }
        }

        trace!("writer task finished");
    }
}

#[async_trait]
impl<R> Transport for StreamTransport<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_line(&mut self) -> Result<Option<String>, TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }

        let mut line = String::new();
        match self.reader.read_line(&mut line).await {
            Ok(0) => {
                trace!("reader reached end of stream");
                Ok(None)
            }
            Ok(_) => {
                trace!(line = line.trim_end(), "line read");
                Ok(Some(line))
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let writer_tx = self
            .writer_tx
            .as_ref()
            .ok_or(TransportError::Disconnected)?;

        writer_tx
            .send(line.to_string())
            .map_err(|_| TransportError::Disconnected)
    }

    fn close(&mut self) {
        // dropping the sender terminates the writer task
        self.connected = false;
        self.writer_tx.take();
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
