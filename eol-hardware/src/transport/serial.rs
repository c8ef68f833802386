//! Serial transport for framed byte exchange
//!
//! The session type is generic over the byte stream so drivers can be
//! exercised against in-memory pipes; on hardware it wraps a
//! `tokio_serial::SerialStream`.

use super::{Framing, Session, Transport};
use async_trait::async_trait;
use eol_core::{EolError, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, warn};

/// Serial port parameters and framing for one device
#[derive(Debug, Clone)]
pub struct SerialTransport {
    port: String,
    baud_rate: u32,
    framing: Framing,
    write_timeout: Duration,
    clear_on_send: bool,
}

impl SerialTransport {
    /// 8N1, no flow control
    pub fn new(port: &str, baud_rate: u32, framing: Framing) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            framing,
            write_timeout: Duration::from_secs(1),
            clear_on_send: false,
        }
    }

    /// Drop stale buffered input before every send
    pub fn clear_on_send(mut self, clear: bool) -> Self {
        self.clear_on_send = clear;
        self
    }

    pub fn write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }
}

#[async_trait]
impl Transport for SerialTransport {
    type Session = StreamSession<SerialStream>;

    fn target(&self) -> String {
        format!("{}@{}", self.port, self.baud_rate)
    }

    async fn open(&self) -> Result<Self::Session> {
        debug!("Opening serial port: {}", self.port);

        let stream = tokio_serial::new(&self.port, self.baud_rate)
            .timeout(self.write_timeout)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                error!("Failed to open serial port {}: {}", self.port, e);
                EolError::Serial(format!("Failed to open serial port {}: {}", self.port, e))
            })?;

        debug!("Serial port {} opened", self.port);

        Ok(StreamSession::new(stream, self.framing.clone(), &self.port)
            .with_write_timeout(self.write_timeout)
            .with_clear_on_send(self.clear_on_send))
    }
}

/// Framed session over any async byte stream
pub struct StreamSession<S> {
    stream: Option<S>,
    framing: Framing,
    buffer: Vec<u8>,
    label: String,
    write_timeout: Duration,
    clear_on_send: bool,
    discard_stale: bool,
    // set while a receive is outstanding; still set if it timed out or was dropped
    awaiting: bool,
}

impl<S> StreamSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, framing: Framing, label: &str) -> Self {
        Self {
            stream: Some(stream),
            framing,
            buffer: Vec::new(),
            label: label.to_string(),
            write_timeout: Duration::from_secs(1),
            clear_on_send: false,
            discard_stale: true,
            awaiting: false,
        }
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn with_clear_on_send(mut self, clear: bool) -> Self {
        self.clear_on_send = clear;
        self
    }

    /// Whether a send after an unfinished receive drops whatever the device
    /// has sent meanwhile. Sessions that pair replies themselves turn it off.
    pub fn with_stale_discard(mut self, discard: bool) -> Self {
        self.discard_stale = discard;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Drop buffered input and any bytes already readable from the stream
    async fn discard_pending(&mut self) {
        let mut dropped = self.buffer.len();
        self.buffer.clear();
        if let Some(stream) = self.stream.as_mut() {
            let mut chunk = [0u8; 256];
            // a zero timeout still polls the read once
            while let Ok(Ok(n)) = timeout(Duration::ZERO, stream.read(&mut chunk)).await {
                if n == 0 {
                    break;
                }
                dropped += n;
            }
        }
        if dropped > 0 {
            debug!("Dropping {} stale bytes on {}", dropped, self.label);
        }
    }

    fn stream(&mut self) -> Result<&mut S> {
        self.stream
            .as_mut()
            .ok_or_else(|| EolError::NotConnected(self.label.clone()))
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut chunk = [0u8; 256];
        loop {
            if let Some(frame) = self.framing.extract(&mut self.buffer) {
                debug!("RX {}: {:02X?}", self.label, frame);
                return Ok(frame);
            }
            let label = self.label.clone();
            let n = self.stream()?.read(&mut chunk).await.map_err(|e| {
                error!("Read error on {}: {}", label, e);
                EolError::Serial(format!("Read error on {}: {}", label, e))
            })?;
            if n == 0 {
                warn!("{} returned EOF - device may have been disconnected", label);
                return Err(EolError::DeviceDisconnected(format!(
                    "{} returned EOF",
                    label
                )));
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

#[async_trait]
impl<S> Session for StreamSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if self.awaiting && self.discard_stale {
            debug!("Previous receive on {} did not finish", self.label);
            self.discard_pending().await;
        } else if self.clear_on_send && !self.buffer.is_empty() {
            debug!("Dropping {} stale bytes on {}", self.buffer.len(), self.label);
            self.buffer.clear();
        }
        self.awaiting = false;
        debug!("TX {}: {:02X?}", self.label, bytes);

        let label = self.label.clone();
        let write_timeout = self.write_timeout;
        let stream = self.stream()?;

        timeout(write_timeout, async {
            stream.write_all(bytes).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| {
            error!("Write timeout on {}", label);
            EolError::Timeout(format!("write to {} timed out", label))
        })?
        .map_err(|e| {
            error!("Write failed on {}: {}", label, e);
            EolError::Serial(format!("Write to {} failed: {}", label, e))
        })
    }

    async fn receive(&mut self, deadline: Duration) -> Result<Vec<u8>> {
        self.awaiting = true;
        match timeout(deadline, self.read_frame()).await {
            Ok(Ok(frame)) => {
                self.awaiting = false;
                Ok(frame)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!("Read timeout on {} after {:?}", self.label, deadline);
                Err(EolError::Timeout(format!(
                    "no response from {} within {} ms",
                    self.label,
                    deadline.as_millis()
                )))
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Ignoring shutdown error on {}: {}", self.label, e);
            }
            debug!("Closed {}", self.label);
        }
        self.buffer.clear();
        self.awaiting = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn session(stream: tokio::io::DuplexStream) -> StreamSession<tokio::io::DuplexStream> {
        StreamSession::new(stream, Framing::Terminator(vec![0x03]), "test")
    }

    #[tokio::test]
    async fn test_send_and_receive_frame() {
        let (near, mut far) = duplex(64);
        let mut s = session(near);

        s.send(&[0x31, b'R']).await.unwrap();
        let mut got = [0u8; 2];
        far.read_exact(&mut got).await.unwrap();
        assert_eq!(got, [0x31, b'R']);

        far.write_all(&[0x02, b'1', b'+', 0x03]).await.unwrap();
        let frame = s.receive(Duration::from_millis(200)).await.unwrap();
        assert_eq!(frame, vec![0x02, b'1', b'+', 0x03]);
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let (near, mut far) = duplex(64);
        let mut s = session(near);

        let writer = tokio::spawn(async move {
            far.write_all(&[0x02, b'1']).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            far.write_all(&[b'+', 0x03]).await.unwrap();
            far
        });

        let frame = s.receive(Duration::from_millis(500)).await.unwrap();
        assert_eq!(frame.len(), 4);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let (near, _far) = duplex(64);
        let mut s = session(near);

        let err = s.receive(Duration::from_millis(5)).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_late_reply_is_dropped_before_next_command() {
        let (near, mut far) = duplex(64);
        let mut s = session(near);

        s.send(b"1R").await.unwrap();
        assert!(s.receive(Duration::from_millis(5)).await.is_err());
        far.write_all(&[0x02, b'o', b'l', b'd', 0x03]).await.unwrap();

        s.send(b"2R").await.unwrap();
        far.write_all(&[0x02, b'n', b'e', b'w', 0x03]).await.unwrap();
        let frame = s.receive(Duration::from_millis(200)).await.unwrap();
        assert_eq!(frame, vec![0x02, b'n', b'e', b'w', 0x03]);
    }

    #[tokio::test]
    async fn test_dropped_receive_counts_as_unfinished() {
        let (near, mut far) = duplex(64);
        let mut s = session(near);

        s.send(b"1R").await.unwrap();
        let cut = tokio::time::timeout(Duration::from_millis(5), s.receive(Duration::from_secs(5)));
        assert!(cut.await.is_err());
        far.write_all(&[0x02, b'o', b'l', b'd', 0x03]).await.unwrap();

        s.send(b"2R").await.unwrap();
        far.write_all(&[0x02, b'n', b'e', b'w', 0x03]).await.unwrap();
        let frame = s.receive(Duration::from_millis(200)).await.unwrap();
        assert_eq!(frame, vec![0x02, b'n', b'e', b'w', 0x03]);
    }

    #[tokio::test]
    async fn test_stale_discard_can_be_disabled() {
        let (near, mut far) = duplex(64);
        let mut s = session(near).with_stale_discard(false);

        assert!(s.receive(Duration::from_millis(5)).await.is_err());
        far.write_all(&[0x02, b'o', b'l', b'd', 0x03]).await.unwrap();

        s.send(b"2R").await.unwrap();
        let frame = s.receive(Duration::from_millis(200)).await.unwrap();
        assert_eq!(frame, vec![0x02, b'o', b'l', b'd', 0x03]);
    }

    #[tokio::test]
    async fn test_eof_is_disconnect() {
        let (near, far) = duplex(64);
        let mut s = session(near);
        drop(far);

        let err = s.receive(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, EolError::DeviceDisconnected(_)));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (near, _far) = duplex(64);
        let mut s = session(near);
        s.close().await;
        s.close().await;

        let err = s.send(b"x").await.unwrap_err();
        assert!(matches!(err, EolError::NotConnected(_)));
    }
}
