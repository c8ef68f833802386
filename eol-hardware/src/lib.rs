//! eol-hardware
//!
//! Everything between the execution engine and the wire. Transport adapters
//! open sessions, codecs build and parse frames, and device drivers combine
//! the two behind the [`Instrument`] capability interface. Every driver has
//! a mock twin so the engine runs unchanged without hardware.
//
//! Public API:
//! - `driver::build_driver`: resolve a `DeviceConfig` into a boxed driver
//! - `driver::Instrument`: capability interface every driver implements
//! - `driver::EmergencyStop`: out-of-band stopper used by the engine
//! - `transport::*`: serial, TCP-command, native and in-memory transports

pub mod codec;
pub mod driver;
pub mod transport;

pub use codec::{CommandFrame, ResponseFrame};
pub use driver::{build_driver, EmergencyStop, Instrument, MockProbe};
pub use transport::{PipeTransport, SerialTransport, Session, TcpCommandTransport, Transport};
