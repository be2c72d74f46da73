//! Transport layer — byte-stream adapters for line-delimited exchange.
//!
//! The endpoint talks to its peer through the [`Transport`] trait: a
//! cancellable asynchronous line read plus an ordered, non-blocking line
//! write. Establishing the underlying stream (socket, pipe, TLS) is the
//! embedding application's job; [`StreamTransport`] adapts any
//! `AsyncRead`/`AsyncWrite` pair, and [`MockTransport`] scripts traffic
//! for tests.

use async_trait::async_trait;
use std::io;
use thiserror::Error;

pub mod mock;
pub mod stream;

pub use mock::{MockHandle, MockTransport};
pub use stream::StreamTransport;

/// Errors surfaced by transport implementations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("transport is disconnected")]
    Disconnected,
}

/// Duplex line transport owned by an endpoint.
///
/// Reads are the endpoint's only suspension point. Writes are ordered and
/// never block the caller; implementations buffer or queue as needed.
#[async_trait]
pub trait Transport: Send {
    /// Read the next line, including its terminator.
    ///
    /// `Ok(None)` signals end of stream (the peer closed its write side).
    async fn read_line(&mut self) -> Result<Option<String>, TransportError>;

    /// Queue one already-terminated line for writing.
    fn write_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Release the transport. Idempotent; no traffic flows afterwards.
    fn close(&mut self);

    /// Whether the transport can still carry traffic.
    fn is_connected(&self) -> bool;
}
