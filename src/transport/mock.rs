//! Mock transport for tests — scripted inbound lines, recorded writes.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{Transport, TransportError};

/// Scriptable transport that records everything written through it.
///
/// Inbound lines are served from a fixed script; once the script is
/// exhausted, reads report end of stream. Written lines and close calls
/// are observable through a [`MockHandle`], which stays valid after an
/// endpoint takes ownership of the transport.
pub struct MockTransport {
    script: VecDeque<String>,
    sent: Arc<Mutex<Vec<String>>>,
    close_count: Arc<AtomicUsize>,
    connected: bool,
}

impl MockTransport {
    /// A transport with no scripted input: the first read sees EOF.
    pub fn new() -> Self {
        Self::with_lines(Vec::<String>::new())
    }

    /// A transport that serves the given lines, then EOF.
    pub fn with_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: lines.into_iter().map(Into::into).collect(),
            sent: Arc::default(),
            close_count: Arc::default(),
            connected: true,
        }
    }

    /// Inspection handle sharing this transport's recorded state.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            sent: Arc::clone(&self.sent),
            close_count: Arc::clone(&self.close_count),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared view of a [`MockTransport`]'s recorded traffic.
#[derive(Clone)]
pub struct MockHandle {
    sent: Arc<Mutex<Vec<String>>>,
    close_count: Arc<AtomicUsize>,
}

impl MockHandle {
    /// All lines written so far, in order.
    pub fn sent_lines(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// How many times the transport was closed.
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn read_line(&mut self) -> Result<Option<String>, TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }
        Ok(self.script.pop_front())
    }

    fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }
        self.sent.lock().unwrap().push(line.to_string());
        Ok(())
    }

    fn close(&mut self) {
        self.connected = false;
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
