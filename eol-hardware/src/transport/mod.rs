//! Transport adapters
//!
//! Three transport families share one contract: open a session (with
//! bounded exponential backoff on connect), send bytes, receive one frame
//! under a timeout, close. Adapters never retry anything but the connect;
//! command retry belongs to the device drivers.
//!
//! - [`serial`]: framed byte exchange over a serial port
//! - [`tcp`]: newline-terminated SCPI sessions with error-queue drain
//! - [`native`]: vendor dynamic library calls (AXL motion/DIO)
//! - [`pipe`]: in-memory byte pipe for driving serial drivers in software

pub mod native;
pub mod pipe;
pub mod serial;
pub mod tcp;

use async_trait::async_trait;
use eol_core::{EolError, Result, RetryConfig};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub use native::AxlLibrary;
pub use pipe::PipeTransport;
pub use serial::{SerialTransport, StreamSession};
pub use tcp::{CommandSession, ScpiOptions, TcpCommandTransport};

/// Something that can open sessions to one device
#[async_trait]
pub trait Transport: Send + Sync {
    type Session: Session;

    /// Human readable target (port, host:port) for logs and errors
    fn target(&self) -> String;

    /// Single connect attempt, including any handshake
    async fn open(&self) -> Result<Self::Session>;
}

/// An open byte session
#[async_trait]
pub trait Session: Send {
    /// Write a complete frame
    async fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Wait for the next complete frame. Exceeding `timeout` yields
    /// `EolError::Timeout`.
    async fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>>;

    /// Release the underlying resource. Never fails.
    async fn close(&mut self);
}

/// Bounded exponential backoff for connect attempts
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Backoff {
    /// One attempt, no delay
    pub fn none() -> Self {
        Self {
            attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay before the attempt following `attempt` (1-based). Saturates
    /// at `max_delay` for any multiplier, including non-finite ones.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let cap = self.max_delay.max(self.initial_delay);
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(self.initial_delay.as_secs_f64() * factor)
            .map_or(cap, |delay| delay.min(cap))
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Self {
            attempts: config.connect_attempts.max(1),
            initial_delay: Duration::from_millis(config.connect_initial_delay_ms),
            max_delay: Duration::from_millis(config.connect_max_delay_ms),
            multiplier: config.backoff_multiplier,
        }
    }
}

/// Open a session through `transport`, retrying with backoff
pub async fn connect<T: Transport>(transport: &T, backoff: &Backoff) -> Result<T::Session> {
    let target = transport.target();
    retry_connect(&target, backoff, || transport.open()).await
}

/// Run `open` until it succeeds or the backoff budget is spent
pub async fn retry_connect<T, F, Fut>(target: &str, backoff: &Backoff, mut open: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = backoff.attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        debug!("Connecting to {} (attempt {}/{})", target, attempt, attempts);
        match open().await {
            Ok(session) => {
                if attempt > 1 {
                    info!("Connected to {} after {} attempts", target, attempt);
                }
                return Ok(session);
            }
            Err(e) => {
                warn!(
                    "Connect attempt {}/{} to {} failed: {}",
                    attempt, attempts, target, e
                );
                last_error = e.to_string();
                if attempt < attempts {
                    sleep(backoff.delay_after(attempt)).await;
                }
            }
        }
    }

    Err(EolError::ConnectionFailed {
        target: target.to_string(),
        attempts,
        reason: last_error,
    })
}

/// How a byte stream is cut into frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// Frame ends with the terminator (inclusive)
    Terminator(Vec<u8>),
    /// Frame starts with `start`, carries a payload length byte at
    /// `length_offset` and ends `trailer_len` bytes after the payload.
    /// Bytes before `start` are discarded.
    LengthPrefixed {
        start: Vec<u8>,
        length_offset: usize,
        trailer_len: usize,
    },
}

impl Framing {
    /// Remove and return the first complete frame in `buffer`, if any
    pub fn extract(&self, buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
        match self {
            Framing::Terminator(terminator) => {
                let end = find(buffer, terminator)? + terminator.len();
                Some(buffer.drain(..end).collect())
            }
            Framing::LengthPrefixed {
                start,
                length_offset,
                trailer_len,
            } => {
                match find(buffer, start) {
                    Some(0) => {}
                    Some(skip) => {
                        debug!("Discarding {} bytes before frame start", skip);
                        buffer.drain(..skip);
                    }
                    None => {
                        // keep a possible partial start marker
                        let keep = start.len().saturating_sub(1).min(buffer.len());
                        let drop = buffer.len() - keep;
                        buffer.drain(..drop);
                        return None;
                    }
                }
                let len = *buffer.get(*length_offset)? as usize;
                let total = length_offset + 1 + len + trailer_len;
                if buffer.len() < total {
                    return None;
                }
                Some(buffer.drain(..total).collect())
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
