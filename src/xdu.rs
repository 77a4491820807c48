//! Dual-framing ADU buffer for gateway compositions
//!
//! An [`Xdu`] owns one fixed region large enough for any serial or TCP
//! ADU, and exposes the current ADU as an offset and length into it. The
//! serial view is placed so that the PDU body sits at the same absolute
//! position it would occupy in a TCP ADU:
//!
//! ```text
//! |<---------------- Modbus TCP ADU ----------------->|
//! |             +--- unit / node id                   |
//! |             v                                     |
//! +-----------+---+-----------------------------------+
//! | MBAP Header   |            Modbus PDU             |
//! +-----------+---+-----------------------------------+
//!             +---+-----------------------------------+---+---+
//!             |   |            Modbus PDU             |  CRC  |
//!             +---+-----------------------------------+---+---+
//!             |<------------ Modbus serial ADU ---------->|
//! ```
//!
//! Converting between the framings therefore only rewrites header and
//! trailer bytes; the PDU payload never moves.

use crate::constants::{MAX_ADU, MIN_SER_ADU, SER_CRC_LEN, SER_HEAD_LEN, TCP_HEAD_LEN};
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{crc16, SerAdu, TcpAdu, TcpAduMut};

/// Offset of the serial view inside the buffer
const SER_OFF: usize = TCP_HEAD_LEN - SER_HEAD_LEN;

/// A buffer that can hold any serial or TCP ADU and convert one framing
/// to the other without copying the PDU.
///
/// Initialize with [`reset_ser_adu`](Self::reset_ser_adu) or
/// [`reset_tcp_adu`](Self::reset_tcp_adu), then append the ADU bytes
/// with [`extend_from_slice`](Self::extend_from_slice).
#[derive(Debug)]
pub struct Xdu {
    buf: [u8; MAX_ADU + SER_CRC_LEN],
    off: usize,
    len: usize,
}

impl Xdu {
    /// New buffer positioned for a serial ADU
    pub fn new() -> Self {
        Self {
            buf: [0; MAX_ADU + SER_CRC_LEN],
            off: SER_OFF,
            len: 0,
        }
    }

    /// Position the buffer for serial ADU data, discarding any contents
    pub fn reset_ser_adu(&mut self) {
        self.off = SER_OFF;
        self.len = 0;
    }

    /// Position the buffer for TCP ADU data, discarding any contents
    pub fn reset_tcp_adu(&mut self) {
        self.off = 0;
        self.len = 0;
    }

    /// The current ADU bytes
    pub fn data(&self) -> &[u8] {
        &self.buf[self.off..self.off + self.len]
    }

    /// The current ADU bytes, mutably
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.off..self.off + self.len]
    }

    /// Append bytes to the current ADU
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> ModbusResult<()> {
        let end = self.off + self.len;
        if end + bytes.len() > self.buf.len() {
            return Err(ModbusError::pack("ADU exceeds buffer capacity"));
        }
        self.buf[end..end + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    /// View the contents as a serial ADU
    pub fn ser_adu(&self) -> SerAdu<'_> {
        SerAdu::new(self.data())
    }

    /// View the contents as a TCP ADU
    pub fn tcp_adu(&self) -> TcpAdu<'_> {
        TcpAdu::new(self.data())
    }

    /// Convert the held serial ADU into a TCP ADU with the given
    /// transaction identifier. The MBAP header is written in front of
    /// the PDU, the unit byte is taken from the serial address already
    /// in place, and the CRC is dropped.
    pub fn ser_to_tcp_adu(&mut self, trans: u16) -> ModbusResult<()> {
        if self.off != SER_OFF || self.len < MIN_SER_ADU {
            return Err(ModbusError::pack("buffer does not hold a serial ADU"));
        }
        let ser_len = self.len;
        self.off = 0;
        self.len = ser_len + SER_OFF - SER_CRC_LEN;
        let mut header = TcpAduMut::new(&mut self.buf);
        header.set_trans(trans);
        header.set_proto(0);
        header.set_len_field((ser_len - SER_CRC_LEN) as u16);
        Ok(())
    }

    /// Convert the held TCP ADU into a serial ADU. The view slides to
    /// cover the unit byte and the PDU, and a CRC is appended.
    pub fn tcp_to_ser_adu(&mut self) -> ModbusResult<()> {
        if self.off != 0 || self.len < TCP_HEAD_LEN + 1 {
            return Err(ModbusError::pack("buffer does not hold a TCP ADU"));
        }
        let end = self.len;
        if end + SER_CRC_LEN > self.buf.len() {
            return Err(ModbusError::pack("ADU exceeds buffer capacity"));
        }
        self.off = SER_OFF;
        self.len = end - SER_OFF;
        let crc = crc16(&self.buf[SER_OFF..end]);
        self.buf[end..end + SER_CRC_LEN].copy_from_slice(&crc.to_le_bytes());
        self.len += SER_CRC_LEN;
        Ok(())
    }
}

impl Default for Xdu {
    fn default() -> Self {
        Self::new()
    }
}
