//! # Serbus - Modbus RTU for Asynchronous Serial Lines
//!
//! A Modbus implementation centered on the hard part of the protocol:
//! receiving RTU frames from a half-duplex multi-drop bus without
//! relying on silent-interval framing, and composing that receiver with
//! a deadline-capable transmitter into correct master (client) and
//! slave (server) drivers. Modbus TCP framing and a zero-copy gateway
//! buffer are included as thin collaborators.
//!
//! ## Features
//!
//! - **Content-directed framing**: frame boundaries are derived from the
//!   function code and length fields, not from 3.5-character silences
//!   that commodity UART hardware cannot observe reliably
//! - **Absolute deadlines everywhere**: every byte-stream operation is
//!   bounded by a [`tokio::time::Instant`], so timeout composition
//!   across layers stays deterministic
//! - **Master and slave roles** over the same receiver, with
//!   retransmission, bus resynchronization and diagnostic counters
//! - **Structured codec**: request/response sum types with pack/unpack
//!   for the common function codes, validated against the Modbus
//!   Application Protocol v1.1b
//! - **Zero-copy gateway buffer** converting between serial and TCP
//!   framings without moving the PDU
//!
//! RTU is the only serial encoding implemented; the ASCII encoding is an
//! extension point.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serbus::{Request, SerMaster, SerMasterConfig, TimedStream};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> serbus::ModbusResult<()> {
//!     let port = TimedStream::open_serial("/dev/ttyUSB0", 9600)?;
//!     let mut master = SerMaster::new(port, SerMasterConfig::new().with_retrans(1));
//!
//!     let res = master
//!         .call(0x01, &Request::read_holding_registers(0x0000, 10))
//!         .await?;
//!     println!("registers: {:?}", res);
//!     Ok(())
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Protocol constants and timing defaults
pub mod constants;

/// ADU/PDU wire layout and CRC-16/MODBUS
pub mod frame;

/// Request and response values with their wire encodings
pub mod packers;

/// Content-directed frame sizing
mod sizer;

/// Deadline-capable byte streams
pub mod stream;

/// RTU frame receiver and bus synchronization
pub mod receiver;

/// RTU frame transmitter
pub mod transmitter;

/// Master (client) driver
pub mod master;

/// Slave (server) driver
pub mod slave;

/// Slave diagnostic counters
pub mod counters;

/// Dual-framing ADU buffer for gateway compositions
pub mod xdu;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use serbus::tokio) ===
pub use tokio;

// === Error handling ===
pub use error::{ModbusError, ModbusResult};

// === Wire layout ===
pub use frame::{crc16, ExCode, FnCode, SerAdu, TcpAdu, EXC_FLAG};

// === Codec ===
pub use packers::{ser_pack, tcp_pack, Packable, Request, Response};

// === Byte streams ===
pub use stream::{DeadlineRead, DeadlineWrite, TimedStream};

// === Frame transfer ===
pub use receiver::SerReceiverRtu;
pub use transmitter::SerTransmitterRtu;

// === Drivers ===
pub use master::{SerMaster, SerMasterConfig};
pub use slave::{SerHandler, SerRawHandler, SerSlave, SerSlaveConfig};

// === Diagnostics ===
pub use counters::{Counter, DiagCounters, COUNTER_COUNT};

// === Gateway buffer ===
pub use xdu::Xdu;

// === Protocol limits (commonly needed constants) ===
pub use constants::{BROADCAST_ADDR, MAX_NODE_ADDR, MAX_PDU_SIZE, MAX_SER_ADU, MAX_TCP_ADU};
