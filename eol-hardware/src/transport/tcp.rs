//! TCP command transport for SCPI instruments
//!
//! Newline-terminated ASCII commands and queries. The session issues the
//! remote-lock command once at connect and, after each command batch,
//! drains the instrument error queue into a fault log instead of raising
//! per entry.
//!
//! Instruments answer queries in order, so a reply that arrives after its
//! query timed out (or after the caller gave up on it) is recognized and
//! dropped by the next query instead of being paired with it.

use super::serial::StreamSession;
use super::{Framing, Session, Transport};
use async_trait::async_trait;
use eol_core::{EolError, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

/// Upper bound on error-queue reads per batch
pub const MAX_ERROR_QUEUE_READS: usize = 10;

/// Late replies tolerated before the session is declared out of sync
pub const MAX_UNANSWERED_QUERIES: usize = 4;

/// Instrument-specific session behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpiOptions {
    /// Sent once right after connect
    pub remote_lock: Option<String>,
    /// Query returning one error-queue entry
    pub error_query: Option<String>,
    /// Cap on error-queue reads per batch
    pub max_error_reads: usize,
}

impl Default for ScpiOptions {
    fn default() -> Self {
        Self {
            remote_lock: None,
            error_query: Some("SYST:ERR?".to_string()),
            max_error_reads: MAX_ERROR_QUEUE_READS,
        }
    }
}

/// TCP connection parameters for one instrument
#[derive(Debug, Clone)]
pub struct TcpCommandTransport {
    host: String,
    port: u16,
    connect_timeout: Duration,
    io_timeout: Duration,
    options: ScpiOptions,
}

impl TcpCommandTransport {
    pub fn new(host: &str, port: u16, options: ScpiOptions) -> Self {
        Self {
            host: host.to_string(),
            port,
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(3),
            options,
        }
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }
}

#[async_trait]
impl Transport for TcpCommandTransport {
    type Session = CommandSession<TcpStream>;

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn open(&self) -> Result<Self::Session> {
        let target = self.target();
        debug!("Connecting to {}", target);

        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| EolError::Timeout(format!("connect to {} timed out", target)))?
        .map_err(|e| {
            error!("Failed to connect to {}: {}", target, e);
            EolError::Network(format!("connect to {} failed: {}", target, e))
        })?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY on {}: {}", target, e);
        }

        let inner = StreamSession::new(stream, Framing::Terminator(b"\n".to_vec()), &target)
            .with_write_timeout(self.io_timeout)
            .with_stale_discard(false);
        let mut session = CommandSession::new(inner, self.options.clone(), self.io_timeout);
        session.lock_remote().await?;
        Ok(session)
    }
}

/// Line-oriented SCPI session with a fault log
pub struct CommandSession<S> {
    inner: StreamSession<S>,
    options: ScpiOptions,
    io_timeout: Duration,
    faults: Vec<String>,
    locked: bool,
    // queries sent whose reply has not been read yet
    unanswered: usize,
}

impl<S> CommandSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(inner: StreamSession<S>, options: ScpiOptions, io_timeout: Duration) -> Self {
        Self {
            inner,
            options,
            io_timeout,
            faults: Vec::new(),
            locked: false,
            unanswered: 0,
        }
    }

    /// Issue the remote-lock command; only the first call sends anything
    pub async fn lock_remote(&mut self) -> Result<()> {
        if self.locked {
            return Ok(());
        }
        if let Some(cmd) = self.options.remote_lock.clone() {
            info!("Locking {} to remote control", self.inner.label());
            self.write(&cmd).await?;
        }
        self.locked = true;
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Send one command line
    pub async fn write(&mut self, command: &str) -> Result<()> {
        let mut line = command.trim_end().to_string();
        line.push('\n');
        self.inner.send(line.as_bytes()).await
    }

    /// Send a query and return the trimmed response line.
    ///
    /// Replies still owed to earlier queries are read and dropped first,
    /// all within one `io_timeout`.
    pub async fn query(&mut self, command: &str) -> Result<String> {
        if self.unanswered >= MAX_UNANSWERED_QUERIES {
            error!(
                "{} owes {} replies, session out of sync",
                self.inner.label(),
                self.unanswered
            );
            return Err(EolError::DeviceDisconnected(format!(
                "{} stopped answering queries",
                self.inner.label()
            )));
        }

        self.write(command).await?;
        self.unanswered += 1;

        let deadline = Instant::now() + self.io_timeout;
        let frame = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = self.inner.receive(remaining).await?;
            self.unanswered = self.unanswered.saturating_sub(1);
            if self.unanswered == 0 {
                break frame;
            }
            debug!(
                "Dropping late reply on {}: {}",
                self.inner.label(),
                String::from_utf8_lossy(&frame).trim()
            );
        };
        let text = String::from_utf8(frame).map_err(|_| {
            EolError::Protocol(format!(
                "non-ASCII response from {} to '{}'",
                self.inner.label(),
                command
            ))
        })?;
        Ok(text.trim().to_string())
    }

    /// Drain the instrument error queue after a command batch.
    ///
    /// Reads at most `max_error_reads` entries, stops at the first
    /// "no error" entry, and appends every other entry to the fault log.
    /// Returns the number of faults found.
    pub async fn end_batch(&mut self) -> Result<usize> {
        let Some(query) = self.options.error_query.clone() else {
            return Ok(0);
        };

        let mut found = 0;
        for _ in 0..self.options.max_error_reads {
            let entry = self.query(&query).await?;
            if is_no_error(&entry) {
                break;
            }
            warn!("{} reported: {}", self.inner.label(), entry);
            self.faults.push(entry);
            found += 1;
        }
        Ok(found)
    }

    /// Faults collected so far
    pub fn faults(&self) -> &[String] {
        &self.faults
    }

    pub fn take_faults(&mut self) -> Vec<String> {
        std::mem::take(&mut self.faults)
    }

    /// Replies owed to queries that timed out or were abandoned
    pub fn unanswered(&self) -> usize {
        self.unanswered
    }
}

fn is_no_error(entry: &str) -> bool {
    let code = entry.split(',').next().unwrap_or("").trim();
    code.trim_start_matches('+') == "0" || entry.is_empty()
}

#[async_trait]
impl<S> Session for CommandSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.send(bytes).await
    }

    async fn receive(&mut self, deadline: Duration) -> Result<Vec<u8>> {
        self.inner.receive(deadline).await
    }

    async fn close(&mut self) {
        self.inner.close().await;
        self.locked = false;
        self.unanswered = 0;
    }
}
