//! Protocol constants based on the official Modbus specification
//!
//! Frame size limits are inherited from the RS485 ADU limit of 256 bytes;
//! the timing defaults are conservative values suitable for commodity
//! USB-serial adapters at common baud rates.

use std::time::Duration;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Maximum ADU size across both framings (the TCP ADU is the larger one)
pub const MAX_ADU: usize = 260;

/// Maximum serial ADU size: address (1) + PDU (253) + CRC (2)
pub const MAX_SER_ADU: usize = 256;

/// Minimum serial ADU size: address (1) + function code (1) + CRC (2)
pub const MIN_SER_ADU: usize = 4;

/// Maximum Modbus TCP ADU size: MBAP header (7) + PDU (253)
pub const MAX_TCP_ADU: usize = 260;

/// Maximum PDU (Protocol Data Unit) size per Modbus specification
pub const MAX_PDU_SIZE: usize = 253;

/// Serial ADU header length (the node address byte)
pub const SER_HEAD_LEN: usize = 1;

/// Serial ADU trailer length (CRC-16, low byte first)
pub const SER_CRC_LEN: usize = 2;

/// MBAP header length for TCP
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2) + Unit ID(1)
pub const TCP_HEAD_LEN: usize = 7;

// ============================================================================
// Node Addressing
// ============================================================================

/// Broadcast node address. Requests only; slaves never respond to it.
pub const BROADCAST_ADDR: u8 = 0;

/// Highest valid individual node address (248..=255 are reserved)
pub const MAX_NODE_ADDR: u8 = 247;

// ============================================================================
// Serial Timing Defaults
// ============================================================================
//
// Conservative default values. All of them can be overridden through the
// master and slave configuration structures.

/// Master response timeout, counted from the end of request transmission
/// until the first response byte arrives.
pub const DEFAULT_MASTER_TIMEOUT: Duration = Duration::from_millis(150);

/// Master intra-frame timeout (maximum silence once reception has begun)
pub const DEFAULT_MASTER_FRAME_TIMEOUT: Duration = Duration::from_millis(60);

/// Master sync delay (idle time that declares the bus clean)
pub const DEFAULT_MASTER_SYNC_DELAY: Duration = DEFAULT_MASTER_FRAME_TIMEOUT;

/// Slave response timeout, used when monitoring exchanges between the
/// master and other slaves on the bus.
pub const DEFAULT_SLAVE_TIMEOUT: Duration = Duration::from_millis(100);

/// Slave intra-frame timeout
pub const DEFAULT_SLAVE_FRAME_TIMEOUT: Duration = Duration::from_millis(40);

/// Slave sync delay. Must exceed the worst-case in-frame gap while staying
/// below the master's response timeout.
pub const DEFAULT_SLAVE_SYNC_DELAY: Duration = DEFAULT_SLAVE_TIMEOUT;

/// Delay between the end of a received frame and the next transmission
pub const DEFAULT_DELAY: Duration = Duration::from_millis(10);

/// Upper bound on a synchronization attempt
pub const DEFAULT_SYNC_WAIT_MAX: Duration = Duration::from_secs(10);

/// Default serial bitrate used for transmission-time calculations
pub const DEFAULT_BAUDRATE: u32 = 9600;

/// Wire bits per transmitted character: start + 8 data + stop
pub const DEFAULT_BITS_PER_CHAR: u32 = 10;

/// Floor for the transmit write deadline. Short frames would otherwise get
/// deadlines far below the granularity cheap serial hardware can honor.
pub const MIN_WRITE_TIMEOUT: Duration = Duration::from_millis(50);
