//! Request and response values with their wire encodings
//!
//! Every supported function code pairs with a structured payload. Requests
//! and responses are tagged sum types with a common operation set: a
//! function code, a pack-into-buffer operation, and an unpack-from-buffer
//! operation that dispatches on the function code byte itself.
//!
//! # Supported Function Codes
//!
//! | Code | Function | Request | Response |
//! |------|----------|---------|----------|
//! | 0x01 | Read Coils | ✅ | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ | ✅ |
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x04 | Read Input Registers | ✅ | ✅ |
//! | 0x05 | Write Single Coil | ✅ | ✅ |
//! | 0x06 | Write Single Register | ✅ | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//! | 0x80+ | Exception | — | ✅ |
//!
//! The remaining codes of the closed [`FnCode`] enumeration are
//! recognized by the frame sizer (their frames can be received and
//! skipped over) but have no structured payload here; unpacking them
//! yields [`ModbusError::UnsupportedFunction`].

use crate::constants::{MAX_NODE_ADDR, TCP_HEAD_LEN};
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{crc16, ExCode, FnCode, EXC_FLAG};

/// Coil ON wire value for Write Single Coil
const COIL_ON: u16 = 0xFF00;
/// Coil OFF wire value for Write Single Coil
const COIL_OFF: u16 = 0x0000;

#[inline]
fn get_u16(b: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([b[off], b[off + 1]])
}

/// A value with a Modbus wire encoding: either a [`Request`] or a
/// [`Response`]. This is the seam the serial and TCP packers work
/// against.
pub trait Packable {
    /// The function code of this value
    fn fn_code(&self) -> FnCode;

    /// Pack (marshal) the value, appending its PDU bytes to `out`.
    /// On error `out` is left unaffected.
    fn pack_into(&self, out: &mut Vec<u8>) -> ModbusResult<()>;
}

// ============================================================================
// Requests
// ============================================================================

/// A structured Modbus request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Read Coils (0x01, `coils == true`) or Read Discrete Inputs (0x02)
    ReadBits { coils: bool, addr: u16, count: u16 },
    /// Read Holding Registers (0x03, `holding == true`) or Read Input
    /// Registers (0x04)
    ReadRegs {
        holding: bool,
        addr: u16,
        count: u16,
    },
    /// Write Single Coil (0x05)
    WriteCoil { addr: u16, on: bool },
    /// Write Single Register (0x06)
    WriteReg { addr: u16, value: u16 },
    /// Write Multiple Coils (0x0F). `bits` holds the coil statuses packed
    /// eight per byte, least significant bit first; `count` is the number
    /// of coils.
    WriteCoils {
        addr: u16,
        count: u16,
        bits: Vec<u8>,
    },
    /// Write Multiple Registers (0x10)
    WriteRegs { addr: u16, values: Vec<u16> },
}

impl Request {
    /// Read Coils request (0x01)
    pub fn read_coils(addr: u16, count: u16) -> Self {
        Request::ReadBits {
            coils: true,
            addr,
            count,
        }
    }

    /// Read Discrete Inputs request (0x02)
    pub fn read_discrete_inputs(addr: u16, count: u16) -> Self {
        Request::ReadBits {
            coils: false,
            addr,
            count,
        }
    }

    /// Read Holding Registers request (0x03)
    pub fn read_holding_registers(addr: u16, count: u16) -> Self {
        Request::ReadRegs {
            holding: true,
            addr,
            count,
        }
    }

    /// Read Input Registers request (0x04)
    pub fn read_input_registers(addr: u16, count: u16) -> Self {
        Request::ReadRegs {
            holding: false,
            addr,
            count,
        }
    }

    /// Write Single Coil request (0x05)
    pub fn write_coil(addr: u16, on: bool) -> Self {
        Request::WriteCoil { addr, on }
    }

    /// Write Single Register request (0x06)
    pub fn write_register(addr: u16, value: u16) -> Self {
        Request::WriteReg { addr, value }
    }

    /// Write Multiple Coils request (0x0F), packing the coil statuses
    /// eight per byte, least significant bit first.
    pub fn write_coils(addr: u16, values: &[bool]) -> Self {
        let mut bits = vec![0u8; values.len().div_ceil(8)];
        for (i, &on) in values.iter().enumerate() {
            if on {
                bits[i / 8] |= 1 << (i % 8);
            }
        }
        Request::WriteCoils {
            addr,
            count: values.len() as u16,
            bits,
        }
    }

    /// Write Multiple Registers request (0x10)
    pub fn write_registers(addr: u16, values: &[u16]) -> Self {
        Request::WriteRegs {
            addr,
            values: values.to_vec(),
        }
    }

    /// The function code of this request
    pub fn fn_code(&self) -> FnCode {
        match self {
            Request::ReadBits { coils: true, .. } => FnCode::ReadCoils,
            Request::ReadBits { coils: false, .. } => FnCode::ReadDiscreteInputs,
            Request::ReadRegs { holding: true, .. } => FnCode::ReadHoldingRegisters,
            Request::ReadRegs { holding: false, .. } => FnCode::ReadInputRegisters,
            Request::WriteCoil { .. } => FnCode::WriteSingleCoil,
            Request::WriteReg { .. } => FnCode::WriteSingleRegister,
            Request::WriteCoils { .. } => FnCode::WriteMultipleCoils,
            Request::WriteRegs { .. } => FnCode::WriteMultipleRegisters,
        }
    }

    /// Pack the request PDU, appending it to `out`. On error `out` is
    /// left unaffected.
    pub fn pack_into(&self, out: &mut Vec<u8>) -> ModbusResult<()> {
        match self {
            Request::ReadBits { addr, count, .. } => {
                if !(1..=2000).contains(count) {
                    return Err(ModbusError::pack("bit count out of range 1..=2000"));
                }
                out.push(self.fn_code().to_u8());
                out.extend_from_slice(&addr.to_be_bytes());
                out.extend_from_slice(&count.to_be_bytes());
            }
            Request::ReadRegs { addr, count, .. } => {
                if !(1..=125).contains(count) {
                    return Err(ModbusError::pack("register count out of range 1..=125"));
                }
                out.push(self.fn_code().to_u8());
                out.extend_from_slice(&addr.to_be_bytes());
                out.extend_from_slice(&count.to_be_bytes());
            }
            Request::WriteCoil { addr, on } => {
                out.push(FnCode::WriteSingleCoil.to_u8());
                out.extend_from_slice(&addr.to_be_bytes());
                let v = if *on { COIL_ON } else { COIL_OFF };
                out.extend_from_slice(&v.to_be_bytes());
            }
            Request::WriteReg { addr, value } => {
                out.push(FnCode::WriteSingleRegister.to_u8());
                out.extend_from_slice(&addr.to_be_bytes());
                out.extend_from_slice(&value.to_be_bytes());
            }
            Request::WriteCoils { addr, count, bits } => {
                if !(1..=1968).contains(count) {
                    return Err(ModbusError::pack("coil count out of range 1..=1968"));
                }
                if bits.len() != (*count as usize).div_ceil(8) {
                    return Err(ModbusError::pack("coil byte count inconsistent with count"));
                }
                out.push(FnCode::WriteMultipleCoils.to_u8());
                out.extend_from_slice(&addr.to_be_bytes());
                out.extend_from_slice(&count.to_be_bytes());
                out.push(bits.len() as u8);
                out.extend_from_slice(bits);
            }
            Request::WriteRegs { addr, values } => {
                if !(1..=123).contains(&values.len()) {
                    return Err(ModbusError::pack("register count out of range 1..=123"));
                }
                out.push(FnCode::WriteMultipleRegisters.to_u8());
                out.extend_from_slice(&addr.to_be_bytes());
                out.extend_from_slice(&(values.len() as u16).to_be_bytes());
                out.push((values.len() * 2) as u8);
                for v in values {
                    out.extend_from_slice(&v.to_be_bytes());
                }
            }
        }
        Ok(())
    }

    /// Unpack (unmarshal) a request from the start of `b`, dispatching on
    /// the function code byte. Returns the request and the remainder of
    /// `b` after the last byte consumed.
    pub fn unpack(b: &[u8]) -> ModbusResult<(Self, &[u8])> {
        if b.is_empty() {
            return Err(ModbusError::unpack("empty request"));
        }
        let function = FnCode::from_u8(b[0])
            .ok_or(ModbusError::InvalidFunction { code: b[0] })?;
        match function {
            FnCode::ReadCoils | FnCode::ReadDiscreteInputs => {
                if b.len() < 5 {
                    return Err(ModbusError::unpack("short read-bits request"));
                }
                let req = Request::ReadBits {
                    coils: function == FnCode::ReadCoils,
                    addr: get_u16(b, 1),
                    count: get_u16(b, 3),
                };
                Ok((req, &b[5..]))
            }
            FnCode::ReadHoldingRegisters | FnCode::ReadInputRegisters => {
                if b.len() < 5 {
                    return Err(ModbusError::unpack("short read-registers request"));
                }
                let req = Request::ReadRegs {
                    holding: function == FnCode::ReadHoldingRegisters,
                    addr: get_u16(b, 1),
                    count: get_u16(b, 3),
                };
                Ok((req, &b[5..]))
            }
            FnCode::WriteSingleCoil => {
                if b.len() < 5 {
                    return Err(ModbusError::unpack("short write-coil request"));
                }
                let on = match get_u16(b, 3) {
                    COIL_ON => true,
                    COIL_OFF => false,
                    _ => return Err(ModbusError::unpack("bad coil value")),
                };
                let req = Request::WriteCoil {
                    addr: get_u16(b, 1),
                    on,
                };
                Ok((req, &b[5..]))
            }
            FnCode::WriteSingleRegister => {
                if b.len() < 5 {
                    return Err(ModbusError::unpack("short write-register request"));
                }
                let req = Request::WriteReg {
                    addr: get_u16(b, 1),
                    value: get_u16(b, 3),
                };
                Ok((req, &b[5..]))
            }
            FnCode::WriteMultipleCoils => {
                if b.len() < 6 {
                    return Err(ModbusError::unpack("short write-coils request"));
                }
                let count = get_u16(b, 3);
                let nbytes = b[5] as usize;
                if !(1..=1968).contains(&count) {
                    return Err(ModbusError::unpack("coil count out of range"));
                }
                if nbytes != (count as usize).div_ceil(8) {
                    return Err(ModbusError::unpack(
                        "coil byte count inconsistent with count",
                    ));
                }
                if b.len() < 6 + nbytes {
                    return Err(ModbusError::unpack("short write-coils payload"));
                }
                let req = Request::WriteCoils {
                    addr: get_u16(b, 1),
                    count,
                    bits: b[6..6 + nbytes].to_vec(),
                };
                Ok((req, &b[6 + nbytes..]))
            }
            FnCode::WriteMultipleRegisters => {
                if b.len() < 6 {
                    return Err(ModbusError::unpack("short write-registers request"));
                }
                let count = get_u16(b, 3) as usize;
                let nbytes = b[5] as usize;
                if !(1..=123).contains(&count) {
                    return Err(ModbusError::unpack("register count out of range"));
                }
                if nbytes != count * 2 {
                    return Err(ModbusError::unpack(
                        "register byte count inconsistent with count",
                    ));
                }
                if b.len() < 6 + nbytes {
                    return Err(ModbusError::unpack("short write-registers payload"));
                }
                let values = b[6..6 + nbytes]
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                let req = Request::WriteRegs {
                    addr: get_u16(b, 1),
                    values,
                };
                Ok((req, &b[6 + nbytes..]))
            }
            _ => Err(ModbusError::UnsupportedFunction { function }),
        }
    }
}

impl Packable for Request {
    fn fn_code(&self) -> FnCode {
        Request::fn_code(self)
    }

    fn pack_into(&self, out: &mut Vec<u8>) -> ModbusResult<()> {
        Request::pack_into(self, out)
    }
}

// ============================================================================
// Responses
// ============================================================================

/// A structured Modbus response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Read Coils (0x01) or Read Discrete Inputs (0x02) response.
    /// `status` carries the bit statuses packed eight per byte, least
    /// significant bit first.
    ReadBits { coils: bool, status: Vec<u8> },
    /// Read Holding Registers (0x03) or Read Input Registers (0x04)
    /// response
    ReadRegs { holding: bool, values: Vec<u16> },
    /// Write Single Coil (0x05) response, echoing the request
    WriteCoil { addr: u16, on: bool },
    /// Write Single Register (0x06) response, echoing the request
    WriteReg { addr: u16, value: u16 },
    /// Write Multiple Coils (0x0F) response
    WriteCoils { addr: u16, count: u16 },
    /// Write Multiple Registers (0x10) response
    WriteRegs { addr: u16, count: u16 },
    /// Exception response: the request's function code with the exception
    /// flag set, plus one exception code byte.
    Exception { function: FnCode, code: ExCode },
}

impl Response {
    /// The function code of this response (exception flag not included)
    pub fn fn_code(&self) -> FnCode {
        match self {
            Response::ReadBits { coils: true, .. } => FnCode::ReadCoils,
            Response::ReadBits { coils: false, .. } => FnCode::ReadDiscreteInputs,
            Response::ReadRegs { holding: true, .. } => FnCode::ReadHoldingRegisters,
            Response::ReadRegs { holding: false, .. } => FnCode::ReadInputRegisters,
            Response::WriteCoil { .. } => FnCode::WriteSingleCoil,
            Response::WriteReg { .. } => FnCode::WriteSingleRegister,
            Response::WriteCoils { .. } => FnCode::WriteMultipleCoils,
            Response::WriteRegs { .. } => FnCode::WriteMultipleRegisters,
            Response::Exception { function, .. } => *function,
        }
    }

    /// Bit status `n` of a read-bits response, or `None` if this is not a
    /// read-bits response or `n` is beyond the payload.
    pub fn bit(&self, n: usize) -> Option<bool> {
        match self {
            Response::ReadBits { status, .. } => status
                .get(n >> 3)
                .map(|byte| byte & (1 << (n & 7)) != 0),
            _ => None,
        }
    }

    /// Pack the response PDU, appending it to `out`. On error `out` is
    /// left unaffected.
    pub fn pack_into(&self, out: &mut Vec<u8>) -> ModbusResult<()> {
        match self {
            Response::ReadBits { status, .. } => {
                if !(1..=250).contains(&status.len()) {
                    return Err(ModbusError::pack("status byte count out of range 1..=250"));
                }
                out.push(self.fn_code().to_u8());
                out.push(status.len() as u8);
                out.extend_from_slice(status);
            }
            Response::ReadRegs { values, .. } => {
                if !(1..=125).contains(&values.len()) {
                    return Err(ModbusError::pack("register count out of range 1..=125"));
                }
                out.push(self.fn_code().to_u8());
                out.push((values.len() * 2) as u8);
                for v in values {
                    out.extend_from_slice(&v.to_be_bytes());
                }
            }
            Response::WriteCoil { addr, on } => {
                out.push(FnCode::WriteSingleCoil.to_u8());
                out.extend_from_slice(&addr.to_be_bytes());
                let v = if *on { COIL_ON } else { COIL_OFF };
                out.extend_from_slice(&v.to_be_bytes());
            }
            Response::WriteReg { addr, value } => {
                out.push(FnCode::WriteSingleRegister.to_u8());
                out.extend_from_slice(&addr.to_be_bytes());
                out.extend_from_slice(&value.to_be_bytes());
            }
            Response::WriteCoils { addr, count } => {
                if !(1..=1968).contains(count) {
                    return Err(ModbusError::pack("coil count out of range 1..=1968"));
                }
                out.push(FnCode::WriteMultipleCoils.to_u8());
                out.extend_from_slice(&addr.to_be_bytes());
                out.extend_from_slice(&count.to_be_bytes());
            }
            Response::WriteRegs { addr, count } => {
                if !(1..=123).contains(count) {
                    return Err(ModbusError::pack("register count out of range 1..=123"));
                }
                out.push(FnCode::WriteMultipleRegisters.to_u8());
                out.extend_from_slice(&addr.to_be_bytes());
                out.extend_from_slice(&count.to_be_bytes());
            }
            Response::Exception { function, code } => {
                out.push(function.to_u8() | EXC_FLAG);
                out.push(code.to_u8());
            }
        }
        Ok(())
    }

    /// Unpack (unmarshal) a response from the start of `b`, dispatching
    /// on the function code byte and the exception flag. Returns the
    /// response and the remainder of `b` after the last byte consumed.
    pub fn unpack(b: &[u8]) -> ModbusResult<(Self, &[u8])> {
        if b.is_empty() {
            return Err(ModbusError::unpack("empty response"));
        }
        if b[0] & EXC_FLAG != 0 {
            if b.len() < 2 {
                return Err(ModbusError::unpack("short exception response"));
            }
            let function = FnCode::from_wire(b[0])
                .ok_or(ModbusError::InvalidFunction { code: b[0] & !EXC_FLAG })?;
            let code = ExCode::from_u8(b[1])
                .ok_or_else(|| ModbusError::unpack("unknown exception code"))?;
            return Ok((Response::Exception { function, code }, &b[2..]));
        }
        let function = FnCode::from_u8(b[0])
            .ok_or(ModbusError::InvalidFunction { code: b[0] })?;
        match function {
            FnCode::ReadCoils | FnCode::ReadDiscreteInputs => {
                if b.len() < 2 {
                    return Err(ModbusError::unpack("short read-bits response"));
                }
                let n = b[1] as usize;
                if !(1..=250).contains(&n) {
                    return Err(ModbusError::unpack("status byte count out of range"));
                }
                if b.len() < 2 + n {
                    return Err(ModbusError::unpack("short read-bits payload"));
                }
                let res = Response::ReadBits {
                    coils: function == FnCode::ReadCoils,
                    status: b[2..2 + n].to_vec(),
                };
                Ok((res, &b[2 + n..]))
            }
            FnCode::ReadHoldingRegisters | FnCode::ReadInputRegisters => {
                if b.len() < 2 {
                    return Err(ModbusError::unpack("short read-registers response"));
                }
                let n = b[1] as usize;
                if n % 2 != 0 || !(1..=125).contains(&(n / 2)) {
                    return Err(ModbusError::unpack("register byte count out of range"));
                }
                if b.len() < 2 + n {
                    return Err(ModbusError::unpack("short read-registers payload"));
                }
                let values = b[2..2 + n]
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                let res = Response::ReadRegs {
                    holding: function == FnCode::ReadHoldingRegisters,
                    values,
                };
                Ok((res, &b[2 + n..]))
            }
            FnCode::WriteSingleCoil => {
                if b.len() < 5 {
                    return Err(ModbusError::unpack("short write-coil response"));
                }
                let on = match get_u16(b, 3) {
                    COIL_ON => true,
                    COIL_OFF => false,
                    _ => return Err(ModbusError::unpack("bad coil value")),
                };
                let res = Response::WriteCoil {
                    addr: get_u16(b, 1),
                    on,
                };
                Ok((res, &b[5..]))
            }
            FnCode::WriteSingleRegister => {
                if b.len() < 5 {
                    return Err(ModbusError::unpack("short write-register response"));
                }
                let res = Response::WriteReg {
                    addr: get_u16(b, 1),
                    value: get_u16(b, 3),
                };
                Ok((res, &b[5..]))
            }
            FnCode::WriteMultipleCoils => {
                if b.len() < 5 {
                    return Err(ModbusError::unpack("short write-coils response"));
                }
                let res = Response::WriteCoils {
                    addr: get_u16(b, 1),
                    count: get_u16(b, 3),
                };
                Ok((res, &b[5..]))
            }
            FnCode::WriteMultipleRegisters => {
                if b.len() < 5 {
                    return Err(ModbusError::unpack("short write-registers response"));
                }
                let res = Response::WriteRegs {
                    addr: get_u16(b, 1),
                    count: get_u16(b, 3),
                };
                Ok((res, &b[5..]))
            }
            _ => Err(ModbusError::UnsupportedFunction { function }),
        }
    }
}

impl Packable for Response {
    fn fn_code(&self) -> FnCode {
        Response::fn_code(self)
    }

    fn pack_into(&self, out: &mut Vec<u8>) -> ModbusResult<()> {
        Response::pack_into(self, out)
    }
}

// ============================================================================
// ADU packers
// ============================================================================

/// Pack a serial ADU: node address, PDU, CRC-16 appended low byte first.
/// The ADU is appended to `out`; on error `out` is left unaffected.
pub fn ser_pack(out: &mut Vec<u8>, node: u8, body: &impl Packable) -> ModbusResult<()> {
    if node > MAX_NODE_ADDR {
        return Err(ModbusError::pack("node address beyond 247"));
    }
    let start = out.len();
    out.push(node);
    if let Err(e) = body.pack_into(out) {
        out.truncate(start);
        return Err(e);
    }
    let crc = crc16(&out[start..]);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(())
}

/// Pack a Modbus TCP ADU: MBAP header followed by the PDU. The length
/// field covers the unit identifier plus the PDU. The ADU is appended to
/// `out`; on error `out` is left unaffected.
pub fn tcp_pack(out: &mut Vec<u8>, trans: u16, unit: u8, body: &impl Packable) -> ModbusResult<()> {
    let start = out.len();
    out.extend_from_slice(&trans.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&[0, 0]);
    out.push(unit);
    if let Err(e) = body.pack_into(out) {
        out.truncate(start);
        return Err(e);
    }
    let len = (out.len() - start - (TCP_HEAD_LEN - 1)) as u16;
    out[start + 4..start + 6].copy_from_slice(&len.to_be_bytes());
    Ok(())
}
