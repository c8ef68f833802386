//! Protocol codecs
//!
//! Pure, hardware-free encode/decode per device family. Decoders classify
//! every malformed frame as a Protocol error and never retry.

pub mod axl;
pub mod bs205;
pub mod lma;
pub mod scpi;

use std::fmt;

/// Bytes to put on the wire for one command
#[derive(Clone, PartialEq, Eq)]
pub struct CommandFrame(Vec<u8>);

impl CommandFrame {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for CommandFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandFrame({:02X?})", self.0)
    }
}

/// Bytes received for one exchange
#[derive(Clone, PartialEq, Eq)]
pub struct ResponseFrame(Vec<u8>);

impl ResponseFrame {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Response as trimmed ASCII text
    pub fn text(&self) -> eol_core::Result<&str> {
        std::str::from_utf8(&self.0)
            .map(str::trim)
            .map_err(|_| eol_core::EolError::Protocol(format!("non-ASCII response {:02X?}", self.0)))
    }
}

impl From<Vec<u8>> for ResponseFrame {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for ResponseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResponseFrame({:02X?})", self.0)
    }
}
