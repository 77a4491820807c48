//! Content-directed frame sizing
//!
//! Maps a byte prefix of a serial ADU to the number of bytes still
//! missing, by decoding the function code and the length-bearing header
//! fields. Request and response frames need separate disciplines because
//! the two layouts differ for the same function code, and a receiver can
//! only tell them apart by its role, never by content.
//!
//! Once a total size has been determined it is memoized for the remaining
//! reads on the same frame. A sizer instance covers exactly one frame.

use crate::constants::SER_CRC_LEN;
use crate::frame::{FnCode, EXC_FLAG};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Discipline {
    Request,
    Response,
}

/// Incremental size calculator for one serial ADU
#[derive(Debug)]
pub(crate) struct FrameSizer {
    discipline: Discipline,
    total: Option<usize>,
}

impl FrameSizer {
    /// Sizer for request-shaped frames
    pub(crate) fn request() -> Self {
        Self {
            discipline: Discipline::Request,
            total: None,
        }
    }

    /// Sizer for response-shaped frames
    pub(crate) fn response() -> Self {
        Self {
            discipline: Discipline::Response,
            total: None,
        }
    }

    /// The number of bytes still needed to complete the frame whose
    /// prefix is `frame`. Returns `Some(0)` when the frame is complete
    /// and `None` when the prefix cannot belong to a supported frame.
    pub(crate) fn remaining(&mut self, frame: &[u8]) -> Option<usize> {
        if let Some(total) = self.total {
            return Some(total.saturating_sub(frame.len()));
        }
        let total = match self.discipline {
            Discipline::Request => self.request_total(frame)?,
            Discipline::Response => self.response_total(frame)?,
        };
        match total {
            Total::Fixed(t) => {
                self.total = Some(t);
                Some(t.saturating_sub(frame.len()))
            }
            Total::NeedPrefix(k) => Some(k - frame.len()),
        }
    }

    fn response_total(&self, b: &[u8]) -> Option<Total> {
        // The decision point for every response layout lies within the
        // first five bytes, which also cover the shortest full frame
        // (the exception response).
        if b.len() < 5 {
            return Some(Total::NeedPrefix(5));
        }
        if b[1] & EXC_FLAG != 0 {
            return Some(Total::Fixed(3 + SER_CRC_LEN));
        }
        let total = match FnCode::from_u8(b[1])? {
            FnCode::ReadCoils
            | FnCode::ReadDiscreteInputs
            | FnCode::ReadHoldingRegisters
            | FnCode::ReadInputRegisters
            | FnCode::ReadWriteRegisters
            | FnCode::ReadFileRecord
            | FnCode::WriteFileRecord
            | FnCode::GetCommLog
            | FnCode::ReportSlaveId => b[2] as usize + 3 + SER_CRC_LEN,
            FnCode::WriteSingleCoil
            | FnCode::WriteSingleRegister
            | FnCode::WriteMultipleCoils
            | FnCode::WriteMultipleRegisters
            | FnCode::GetCommCounters => 6 + SER_CRC_LEN,
            FnCode::MaskWriteRegister => 8 + SER_CRC_LEN,
            FnCode::ReadExceptionStatus => 3 + SER_CRC_LEN,
            FnCode::ReadFifo => ((b[2] as usize) << 8 | b[3] as usize) + 3 + SER_CRC_LEN,
            _ => return None,
        };
        Some(Total::Fixed(total))
    }

    fn request_total(&self, b: &[u8]) -> Option<Total> {
        if b.len() < 2 {
            return Some(Total::NeedPrefix(2));
        }
        let total = match FnCode::from_u8(b[1])? {
            FnCode::ReadCoils
            | FnCode::ReadDiscreteInputs
            | FnCode::ReadHoldingRegisters
            | FnCode::ReadInputRegisters
            | FnCode::WriteSingleCoil
            | FnCode::WriteSingleRegister => 6 + SER_CRC_LEN,
            FnCode::ReadExceptionStatus
            | FnCode::GetCommCounters
            | FnCode::GetCommLog
            | FnCode::ReportSlaveId => 2 + SER_CRC_LEN,
            FnCode::WriteMultipleCoils | FnCode::WriteMultipleRegisters => {
                if b.len() < 7 {
                    return Some(Total::NeedPrefix(7));
                }
                b[6] as usize + 7 + SER_CRC_LEN
            }
            FnCode::ReadFileRecord | FnCode::WriteFileRecord => {
                if b.len() < 3 {
                    return Some(Total::NeedPrefix(3));
                }
                b[2] as usize + 3 + SER_CRC_LEN
            }
            FnCode::MaskWriteRegister => 8 + SER_CRC_LEN,
            FnCode::ReadWriteRegisters => {
                if b.len() < 11 {
                    return Some(Total::NeedPrefix(11));
                }
                b[10] as usize + 11 + SER_CRC_LEN
            }
            FnCode::ReadFifo => 4 + SER_CRC_LEN,
            FnCode::ReadDeviceId => 5 + SER_CRC_LEN,
            _ => return None,
        };
        Some(Total::Fixed(total))
    }
}

enum Total {
    /// The final frame size is known
    Fixed(usize),
    /// Undecidable yet; at least this many prefix bytes are required
    NeedPrefix(usize),
}
