//! ADU and PDU wire layout
//!
//! Byte-slice views over the two on-wire framings, plus the CRC-16/MODBUS
//! computation used by the serial framing:
//!
//! ```text
//! Serial ADU:  | addr(1) | PDU (1..253) | CRC(2, low byte first) |
//! TCP ADU:     | trans(2) | proto=0(2) | length(2) | unit(1) | PDU |
//! ```
//!
//! A PDU starts with the function code; bit 7 of that byte is the
//! exception flag. All multi-byte integer fields are big-endian, except
//! the serial CRC which is appended low byte first.

use std::fmt;

use crc::{Crc, CRC_16_MODBUS};

use crate::constants::{SER_CRC_LEN, SER_HEAD_LEN, TCP_HEAD_LEN};

/// Exception flag. Set on the function code byte of an error response.
pub const EXC_FLAG: u8 = 1 << 7;

/// CRC-16/MODBUS: reflected polynomial 0xA001, init 0xFFFF, no final XOR
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Compute the CRC-16/MODBUS checksum of `data`
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Append a CRC-16/MODBUS over the current contents of `buf`, low byte
/// first, turning it into a complete serial ADU.
pub fn append_crc(buf: &mut Vec<u8>) {
    let crc = crc16(buf);
    buf.extend_from_slice(&crc.to_le_bytes());
}

// ============================================================================
// Function and Exception Codes
// ============================================================================

/// Modbus function codes (request and response)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FnCode {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Read Exception Status (0x07)
    ReadExceptionStatus = 0x07,
    /// Diagnostic (0x08)
    Diagnostic = 0x08,
    /// Get Comm Event Counter (0x0B)
    GetCommCounters = 0x0B,
    /// Get Comm Event Log (0x0C)
    GetCommLog = 0x0C,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
    /// Report Slave ID (0x11)
    ReportSlaveId = 0x11,
    /// Read File Record (0x14)
    ReadFileRecord = 0x14,
    /// Write File Record (0x15)
    WriteFileRecord = 0x15,
    /// Mask Write Register (0x16)
    MaskWriteRegister = 0x16,
    /// Read/Write Multiple Registers (0x17)
    ReadWriteRegisters = 0x17,
    /// Read FIFO Queue (0x18)
    ReadFifo = 0x18,
    /// Read Device Identification (0x2B)
    ReadDeviceId = 0x2B,
}

impl FnCode {
    /// Convert a raw byte to a function code. The exception flag must
    /// already be masked off; flagged bytes are not function codes.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(FnCode::ReadCoils),
            0x02 => Some(FnCode::ReadDiscreteInputs),
            0x03 => Some(FnCode::ReadHoldingRegisters),
            0x04 => Some(FnCode::ReadInputRegisters),
            0x05 => Some(FnCode::WriteSingleCoil),
            0x06 => Some(FnCode::WriteSingleRegister),
            0x07 => Some(FnCode::ReadExceptionStatus),
            0x08 => Some(FnCode::Diagnostic),
            0x0B => Some(FnCode::GetCommCounters),
            0x0C => Some(FnCode::GetCommLog),
            0x0F => Some(FnCode::WriteMultipleCoils),
            0x10 => Some(FnCode::WriteMultipleRegisters),
            0x11 => Some(FnCode::ReportSlaveId),
            0x14 => Some(FnCode::ReadFileRecord),
            0x15 => Some(FnCode::WriteFileRecord),
            0x16 => Some(FnCode::MaskWriteRegister),
            0x17 => Some(FnCode::ReadWriteRegisters),
            0x18 => Some(FnCode::ReadFifo),
            0x2B => Some(FnCode::ReadDeviceId),
            _ => None,
        }
    }

    /// Convert a wire byte to a function code, masking the exception flag
    #[inline]
    pub fn from_wire(value: u8) -> Option<Self> {
        Self::from_u8(value & !EXC_FLAG)
    }

    /// Convert to the raw byte value
    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for FnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FnCode::ReadCoils => "Read Coils",
            FnCode::ReadDiscreteInputs => "Read Discrete Inputs",
            FnCode::ReadHoldingRegisters => "Read Holding Registers",
            FnCode::ReadInputRegisters => "Read Input Registers",
            FnCode::WriteSingleCoil => "Write Single Coil",
            FnCode::WriteSingleRegister => "Write Single Register",
            FnCode::ReadExceptionStatus => "Read Exception Status",
            FnCode::Diagnostic => "Diagnostic",
            FnCode::GetCommCounters => "Get Comm Event Counter",
            FnCode::GetCommLog => "Get Comm Event Log",
            FnCode::WriteMultipleCoils => "Write Multiple Coils",
            FnCode::WriteMultipleRegisters => "Write Multiple Registers",
            FnCode::ReportSlaveId => "Report Slave ID",
            FnCode::ReadFileRecord => "Read File Record",
            FnCode::WriteFileRecord => "Write File Record",
            FnCode::MaskWriteRegister => "Mask Write Register",
            FnCode::ReadWriteRegisters => "Read/Write Multiple Registers",
            FnCode::ReadFifo => "Read FIFO Queue",
            FnCode::ReadDeviceId => "Read Device Identification",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes, carried as the second byte of an exception
/// response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerFailure = 0x04,
    Acknowledge = 0x05,
    ServerBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetFailed = 0x0B,
}

impl ExCode {
    /// Convert a raw byte to an exception code
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ExCode::IllegalFunction),
            0x02 => Some(ExCode::IllegalDataAddress),
            0x03 => Some(ExCode::IllegalDataValue),
            0x04 => Some(ExCode::ServerFailure),
            0x05 => Some(ExCode::Acknowledge),
            0x06 => Some(ExCode::ServerBusy),
            0x08 => Some(ExCode::MemoryParityError),
            0x0A => Some(ExCode::GatewayPathUnavailable),
            0x0B => Some(ExCode::GatewayTargetFailed),
            _ => None,
        }
    }

    /// Convert to the raw byte value
    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ExCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExCode::IllegalFunction => "Illegal Function",
            ExCode::IllegalDataAddress => "Illegal Data Address",
            ExCode::IllegalDataValue => "Illegal Data Value",
            ExCode::ServerFailure => "Server Device Failure",
            ExCode::Acknowledge => "Acknowledge",
            ExCode::ServerBusy => "Server Device Busy",
            ExCode::MemoryParityError => "Memory Parity Error",
            ExCode::GatewayPathUnavailable => "Gateway Path Unavailable",
            ExCode::GatewayTargetFailed => "Gateway Target Failed",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

// ============================================================================
// Serial ADU view
// ============================================================================

/// Read-only view over a byte slice holding a serial ADU.
///
/// The accessors index into the slice directly; the view is meant for
/// frames that already satisfy the minimum ADU length, as produced by the
/// receiver or by [`ser_pack`](crate::packers::ser_pack).
#[derive(Debug, Clone, Copy)]
pub struct SerAdu<'a> {
    bytes: &'a [u8],
}

impl<'a> SerAdu<'a> {
    /// Wrap a byte slice as a serial ADU view
    #[inline]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// The raw bytes of the ADU
    #[inline]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Node (unit) address
    #[inline]
    pub fn node(&self) -> u8 {
        self.bytes[0]
    }

    /// True if the exception flag is set on the function code byte
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.bytes[SER_HEAD_LEN] & EXC_FLAG != 0
    }

    /// Function code, with the exception flag masked off
    #[inline]
    pub fn fn_code(&self) -> Option<FnCode> {
        FnCode::from_wire(self.bytes[SER_HEAD_LEN])
    }

    /// Exception code of an exception response
    #[inline]
    pub fn ex_code(&self) -> Option<ExCode> {
        ExCode::from_u8(self.bytes[SER_HEAD_LEN + 1])
    }

    /// The PDU: everything between the address byte and the CRC
    #[inline]
    pub fn pdu(&self) -> &'a [u8] {
        &self.bytes[SER_HEAD_LEN..self.bytes.len() - SER_CRC_LEN]
    }

    /// The CRC stored in the ADU trailer, low byte first on the wire
    #[inline]
    pub fn crc(&self) -> u16 {
        let l = self.bytes.len();
        u16::from_le_bytes([self.bytes[l - 2], self.bytes[l - 1]])
    }

    /// Check the stored CRC against one recomputed over the ADU body
    pub fn check_crc(&self) -> bool {
        if self.bytes.len() < SER_HEAD_LEN + 1 + SER_CRC_LEN {
            return false;
        }
        crc16(&self.bytes[..self.bytes.len() - SER_CRC_LEN]) == self.crc()
    }
}

// ============================================================================
// TCP ADU views
// ============================================================================

/// Read-only view over a byte slice holding a Modbus TCP ADU
#[derive(Debug, Clone, Copy)]
pub struct TcpAdu<'a> {
    bytes: &'a [u8],
}

impl<'a> TcpAdu<'a> {
    /// Wrap a byte slice as a TCP ADU view
    #[inline]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// The raw bytes of the ADU
    #[inline]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// MBAP transaction identifier
    #[inline]
    pub fn trans(&self) -> u16 {
        u16::from_be_bytes([self.bytes[0], self.bytes[1]])
    }

    /// MBAP protocol identifier (0 for Modbus)
    #[inline]
    pub fn proto(&self) -> u16 {
        u16::from_be_bytes([self.bytes[2], self.bytes[3]])
    }

    /// MBAP length field: unit identifier plus PDU byte count
    #[inline]
    pub fn len_field(&self) -> u16 {
        u16::from_be_bytes([self.bytes[4], self.bytes[5]])
    }

    /// Unit (node) identifier
    #[inline]
    pub fn unit(&self) -> u8 {
        self.bytes[6]
    }

    /// True if the exception flag is set on the function code byte
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.bytes[TCP_HEAD_LEN] & EXC_FLAG != 0
    }

    /// Function code, with the exception flag masked off
    #[inline]
    pub fn fn_code(&self) -> Option<FnCode> {
        FnCode::from_wire(self.bytes[TCP_HEAD_LEN])
    }

    /// Exception code of an exception response
    #[inline]
    pub fn ex_code(&self) -> Option<ExCode> {
        ExCode::from_u8(self.bytes[TCP_HEAD_LEN + 1])
    }

    /// The PDU following the MBAP header
    #[inline]
    pub fn pdu(&self) -> &'a [u8] {
        &self.bytes[TCP_HEAD_LEN..]
    }
}

/// Mutable view used to rewrite MBAP header fields in place
#[derive(Debug)]
pub struct TcpAduMut<'a> {
    bytes: &'a mut [u8],
}

impl<'a> TcpAduMut<'a> {
    /// Wrap a mutable byte slice as a TCP ADU view
    #[inline]
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    /// Set the MBAP transaction identifier
    #[inline]
    pub fn set_trans(&mut self, trans: u16) {
        self.bytes[0..2].copy_from_slice(&trans.to_be_bytes());
    }

    /// Set the MBAP protocol identifier
    #[inline]
    pub fn set_proto(&mut self, proto: u16) {
        self.bytes[2..4].copy_from_slice(&proto.to_be_bytes());
    }

    /// Set the MBAP length field
    #[inline]
    pub fn set_len_field(&mut self, len: u16) {
        self.bytes[4..6].copy_from_slice(&len.to_be_bytes());
    }

    /// Set the unit (node) identifier
    #[inline]
    pub fn set_unit(&mut self, unit: u8) {
        self.bytes[6] = unit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_known_vectors() {
        assert_eq!(crc16(&[0x01, 0x03, 0x08, 0x2B, 0x00, 0x02]), 0x63B6);
        assert_eq!(crc16(&[0x01, 0x03, 0x04, 0x00, 0x20, 0x00, 0x00]), 0xF9FB);
    }

    #[test]
    fn crc_round_trip() {
        let mut adu = vec![0x01, 0x03, 0x00, 0x6B, 0x00, 0x03];
        append_crc(&mut adu);
        assert_eq!(adu.len(), 8);
        assert!(SerAdu::new(&adu).check_crc());

        // Flip a payload bit and the check must fail
        adu[3] ^= 0x01;
        assert!(!SerAdu::new(&adu).check_crc());
    }

    #[test]
    fn crc_wire_order_low_byte_first() {
        let body = [0x01, 0x03, 0x08, 0x2B, 0x00, 0x02];
        let mut adu = body.to_vec();
        append_crc(&mut adu);
        let crc = crc16(&body);
        assert_eq!(adu[6], (crc & 0xFF) as u8);
        assert_eq!(adu[7], (crc >> 8) as u8);
        assert_eq!(SerAdu::new(&adu).crc(), crc);
    }

    #[test]
    fn ser_adu_accessors() {
        let mut adu = vec![0x11, 0x03, 0x02, 0x12, 0x34];
        append_crc(&mut adu);
        let view = SerAdu::new(&adu);
        assert_eq!(view.node(), 0x11);
        assert_eq!(view.fn_code(), Some(FnCode::ReadHoldingRegisters));
        assert!(!view.is_exception());
        assert_eq!(view.pdu(), &[0x03, 0x02, 0x12, 0x34]);
    }

    #[test]
    fn ser_adu_exception() {
        let mut adu = vec![0x01, 0x81, 0x01];
        append_crc(&mut adu);
        let view = SerAdu::new(&adu);
        assert!(view.is_exception());
        assert_eq!(view.fn_code(), Some(FnCode::ReadCoils));
        assert_eq!(view.ex_code(), Some(ExCode::IllegalFunction));
    }

    #[test]
    fn fn_code_round_trip() {
        for raw in 0u8..=0xFF {
            if let Some(fc) = FnCode::from_u8(raw) {
                assert_eq!(fc.to_u8(), raw);
            }
        }
        assert_eq!(FnCode::from_u8(0x81), None);
        assert_eq!(FnCode::from_wire(0x81), Some(FnCode::ReadCoils));
    }

    #[test]
    fn tcp_adu_views() {
        let mut buf = vec![0u8; TCP_HEAD_LEN];
        {
            let mut adu = TcpAduMut::new(&mut buf);
            adu.set_trans(0x1234);
            adu.set_proto(0);
            adu.set_len_field(3);
            adu.set_unit(0x11);
        }
        buf.extend_from_slice(&[0x05, 0x00]);
        let view = TcpAdu::new(&buf);
        assert_eq!(view.trans(), 0x1234);
        assert_eq!(view.proto(), 0);
        assert_eq!(view.len_field(), 3);
        assert_eq!(view.unit(), 0x11);
        assert_eq!(view.fn_code(), Some(FnCode::WriteSingleCoil));
        assert_eq!(view.pdu(), &[0x05, 0x00]);
    }
}
