//! In-memory transport over `tokio::io::duplex`
//!
//! Lets a serial driver run against a scripted peer: each [`PipeTransport::pipe`]
//! call queues one session end and hands back the device end.

use super::serial::StreamSession;
use super::{Framing, Transport};
use async_trait::async_trait;
use eol_core::{EolError, Result};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::DuplexStream;

const PIPE_BUFFER: usize = 1024;

pub struct PipeTransport {
    label: String,
    framing: Framing,
    pending: Mutex<VecDeque<DuplexStream>>,
}

impl PipeTransport {
    pub fn new(label: &str, framing: Framing) -> Self {
        Self {
            label: label.to_string(),
            framing,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a session for the next `open` and return the device end
    pub fn pipe(&self) -> DuplexStream {
        let (session, device) = tokio::io::duplex(PIPE_BUFFER);
        if let Ok(mut pending) = self.pending.lock() {
            pending.push_back(session);
        }
        device
    }
}

#[async_trait]
impl Transport for PipeTransport {
    type Session = StreamSession<DuplexStream>;

    fn target(&self) -> String {
        format!("pipe:{}", self.label)
    }

    async fn open(&self) -> Result<Self::Session> {
        let stream = self
            .pending
            .lock()
            .map_err(|_| EolError::Other("pipe queue poisoned".to_string()))?
            .pop_front()
            .ok_or_else(|| EolError::Serial(format!("no device attached to {}", self.target())))?;
        Ok(StreamSession::new(stream, self.framing.clone(), &self.target())
            .with_write_timeout(Duration::from_millis(500)))
    }
}
