//! RTU frame receiver and bus synchronization
//!
//! The Modbus-over-serial line discipline delineates RTU frames with
//! silent intervals of at least 3.5 character times. Commodity UART
//! hardware buffers characters in FIFOs with interrupt coalescing, which
//! makes silent-interval detection unreliable at the usual bitrates.
//! This receiver therefore infers frame boundaries from content instead:
//! it reads the header bytes of a frame and derives the expected total
//! length from the function code, using the request or response sizing
//! discipline that matches the caller's role on the bus.
//!
//! Content-directed sizing cannot tell a request from a response, so the
//! receiver pairs it with a coarse resynchronization protocol built from
//! line-idle detection: after [`SerReceiverRtu::sync_delay`] of
//! continuous bus silence the next byte is assumed to start a frame.
//!
//! # Receiver states
//!
//! ```text
//! Unsynced --sync() ok--------------------> Synced
//! Synced   --receive first byte-----------> InFrame
//! InFrame  --full frame, CRC ok-----------> Synced
//! InFrame  --Frame or Crc error-----------> Unsynced (caller re-syncs)
//! any      --I/O error--------------------> terminal
//! ```
//!
//! A master knows the line should be idle before it transmits, so one
//! `sync_delay` of silence is enough to declare the bus clean, and every
//! response is then parsed by content. A slave cannot distinguish a
//! neighbor's in-flight response from a request by bytes alone; it must
//! monitor all traffic and fall back to idle-detection after any decode
//! failure. Configure `sync_delay` above the worst-case in-frame gap but
//! below the master's response timeout, or the slave can re-enter the
//! bus in the middle of an exchange.

use std::io;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::constants::{
    DEFAULT_MASTER_FRAME_TIMEOUT, DEFAULT_MASTER_SYNC_DELAY, DEFAULT_SYNC_WAIT_MAX, MAX_SER_ADU,
};
use crate::error::{ModbusError, ModbusResult};
use crate::frame::SerAdu;
use crate::sizer::FrameSizer;
use crate::stream::{is_timeout, DeadlineRead};

/// Frame receiver for RTU-encoded serial ADUs.
///
/// Owns a scratch buffer sized for one maximum ADU; a validated frame is
/// appended to the caller's output buffer only after its CRC checks out.
#[derive(Debug)]
pub struct SerReceiverRtu {
    /// Intra-frame timeout. Armed when the first frame byte arrives and
    /// refreshed by every subsequent chunk.
    pub frame_timeout: Duration,
    /// Duration the line must stay idle for the receiver to consider
    /// itself synchronized.
    pub sync_delay: Duration,
    /// Upper bound on one synchronization attempt
    pub sync_wait_max: Duration,
    scratch: [u8; MAX_SER_ADU],
}

impl SerReceiverRtu {
    /// New receiver with the conservative master-side defaults
    pub fn new() -> Self {
        Self {
            frame_timeout: DEFAULT_MASTER_FRAME_TIMEOUT,
            sync_delay: DEFAULT_MASTER_SYNC_DELAY,
            sync_wait_max: DEFAULT_SYNC_WAIT_MAX,
            scratch: [0; MAX_SER_ADU],
        }
    }

    /// Receive one request-shaped ADU and append it to `out`.
    ///
    /// The receiver must be synchronized to the start of a frame. The
    /// first byte must arrive before `deadline` (`None` waits without
    /// bound). On [`ModbusError::Frame`] or [`ModbusError::Crc`] the
    /// caller must re-synchronize through [`sync`](Self::sync) before
    /// the next receive; `out` is unaffected by failures.
    pub async fn receive_req<R: DeadlineRead>(
        &mut self,
        stream: &mut R,
        out: &mut Vec<u8>,
        deadline: Option<Instant>,
    ) -> ModbusResult<()> {
        self.receive(stream, out, deadline, FrameSizer::request())
            .await
    }

    /// Receive one response-shaped ADU and append it to `out`.
    ///
    /// Same contract as [`receive_req`](Self::receive_req) with the
    /// response sizing discipline.
    pub async fn receive_res<R: DeadlineRead>(
        &mut self,
        stream: &mut R,
        out: &mut Vec<u8>,
        deadline: Option<Instant>,
    ) -> ModbusResult<()> {
        self.receive(stream, out, deadline, FrameSizer::response())
            .await
    }

    async fn receive<R: DeadlineRead>(
        &mut self,
        stream: &mut R,
        out: &mut Vec<u8>,
        deadline: Option<Instant>,
        mut sizer: FrameSizer,
    ) -> ModbusResult<()> {
        stream.set_read_deadline(deadline);

        let mut len = 0usize;
        let mut needed = match sizer.remaining(&self.scratch[..0]) {
            Some(n) => n,
            None => return Err(ModbusError::Frame),
        };
        loop {
            if len + needed > MAX_SER_ADU {
                // The declared size cannot fit a serial ADU
                return Err(ModbusError::Frame);
            }
            let res = stream.read(&mut self.scratch[len..len + needed]).await;
            if let Ok(n) = &res {
                len += n;
            }
            needed = match sizer.remaining(&self.scratch[..len]) {
                Some(n) => n,
                None => return Err(ModbusError::Frame),
            };
            if needed == 0 {
                break;
            }
            match res {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(_) => {}
                Err(e) if is_timeout(&e) => return Err(ModbusError::Timeout),
                Err(e) => return Err(e.into()),
            }
            stream.set_read_deadline(Some(Instant::now() + self.frame_timeout));
        }

        let adu = &self.scratch[..len];
        if !SerAdu::new(adu).check_crc() {
            return Err(ModbusError::Crc);
        }
        trace!(len, node = adu[0], "received frame");
        out.extend_from_slice(adu);
        Ok(())
    }

    /// Synchronize to the bus by waiting for
    /// [`sync_delay`](Self::sync_delay) of continuous line idleness.
    ///
    /// Must be called before the first frame is received, and again after
    /// every [`ModbusError::Frame`] or [`ModbusError::Crc`] failure.
    /// Returns [`ModbusError::Sync`] if the line would not go idle within
    /// [`sync_wait_max`](Self::sync_wait_max).
    pub async fn sync<R: DeadlineRead>(&mut self, stream: &mut R) -> ModbusResult<()> {
        let mut probe = [0u8; 16];
        let end = Instant::now() + self.sync_wait_max;
        loop {
            stream.set_read_deadline(Some(Instant::now() + self.sync_delay));
            match stream.read(&mut probe).await {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(n) => {
                    trace!(n, "bus still busy while syncing");
                    if Instant::now() >= end {
                        debug!("bus would not go idle, giving up sync");
                        return Err(ModbusError::Sync);
                    }
                }
                // The line stayed idle for a full sync_delay
                Err(e) if is_timeout(&e) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Default for SerReceiverRtu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ExCode, FnCode};
    use crate::packers::{ser_pack, Response};
    use crate::stream::TimedStream;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    fn rcv() -> SerReceiverRtu {
        SerReceiverRtu::new()
    }

    fn pipe() -> (TimedStream<DuplexStream>, DuplexStream) {
        let (a, b) = duplex(1024);
        (TimedStream::new(a), b)
    }

    fn sample_response_adu() -> Vec<u8> {
        let mut adu = Vec::new();
        ser_pack(
            &mut adu,
            0x01,
            &Response::ReadRegs {
                holding: true,
                values: vec![0x022B, 0x0000, 0x0064],
            },
        )
        .unwrap();
        adu
    }

    #[tokio::test(start_paused = true)]
    async fn receives_whole_response_frame() {
        let (mut stream, mut wire) = pipe();
        let adu = sample_response_adu();
        wire.write_all(&adu).await.unwrap();

        let mut out = Vec::new();
        rcv()
            .receive_res(&mut stream, &mut out, None)
            .await
            .unwrap();
        assert_eq!(out, adu);
    }

    #[tokio::test(start_paused = true)]
    async fn reassembles_dribbled_bytes() {
        let (mut stream, mut wire) = pipe();
        let adu = sample_response_adu();

        let feeder = tokio::spawn(async move {
            for chunk in adu.chunks(2) {
                wire.write_all(chunk).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            wire
        });

        let mut out = Vec::new();
        rcv()
            .receive_res(&mut stream, &mut out, None)
            .await
            .unwrap();
        assert_eq!(out, sample_response_adu());
        let _wire = feeder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn receives_exception_response() {
        let (mut stream, mut wire) = pipe();
        let mut adu = Vec::new();
        ser_pack(
            &mut adu,
            0x01,
            &Response::Exception {
                function: FnCode::ReadCoils,
                code: ExCode::IllegalFunction,
            },
        )
        .unwrap();
        wire.write_all(&adu).await.unwrap();

        let mut out = Vec::new();
        rcv()
            .receive_res(&mut stream, &mut out, None)
            .await
            .unwrap();
        let view = SerAdu::new(&out);
        assert!(view.is_exception());
        assert_eq!(view.ex_code(), Some(ExCode::IllegalFunction));
    }

    #[tokio::test(start_paused = true)]
    async fn bad_crc_is_reported() {
        let (mut stream, mut wire) = pipe();
        let mut adu = sample_response_adu();
        let last = adu.len() - 1;
        adu[last] ^= 0xFF;
        wire.write_all(&adu).await.unwrap();

        let mut out = Vec::new();
        let err = rcv()
            .receive_res(&mut stream, &mut out, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Crc));
        assert!(out.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_function_is_a_frame_error() {
        let (mut stream, mut wire) = pipe();
        wire.write_all(&[0x01, 0x41, 0x00, 0x00, 0x00]).await.unwrap();

        let mut out = Vec::new();
        let err = rcv()
            .receive_res(&mut stream, &mut out, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Frame));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_fifo_length_is_a_frame_error() {
        let (mut stream, mut wire) = pipe();
        // A FIFO response declaring a byte count beyond any serial ADU
        wire.write_all(&[0x01, 0x18, 0x40, 0x00, 0x00]).await.unwrap();

        let mut out = Vec::new();
        let err = rcv()
            .receive_res(&mut stream, &mut out, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Frame));
    }

    #[tokio::test(start_paused = true)]
    async fn first_byte_deadline_times_out() {
        let (mut stream, _wire) = pipe();
        let mut out = Vec::new();
        let deadline = Instant::now() + Duration::from_millis(150);
        let err = rcv()
            .receive_res(&mut stream, &mut out, Some(deadline))
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_frame_times_out() {
        let (mut stream, mut wire) = pipe();
        let adu = sample_response_adu();
        // Only the first half of the frame ever shows up
        wire.write_all(&adu[..5]).await.unwrap();

        let mut out = Vec::new();
        let err = rcv()
            .receive_res(&mut stream, &mut out, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Timeout));
        assert!(out.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_stream_is_an_io_error() {
        let (mut stream, wire) = pipe();
        drop(wire);
        let mut out = Vec::new();
        let err = rcv()
            .receive_res(&mut stream, &mut out, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Io(_)));

        let err = rcv().sync(&mut stream).await.unwrap_err();
        assert!(matches!(err, ModbusError::Io(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn sync_succeeds_on_idle_line() {
        let (mut stream, _wire) = pipe();
        rcv().sync(&mut stream).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sync_gives_up_on_busy_line() {
        let (mut stream, mut wire) = pipe();
        let mut receiver = rcv();
        receiver.sync_wait_max = Duration::from_millis(500);

        // Noise that never pauses long enough to look idle
        let noise = tokio::spawn(async move {
            loop {
                if wire.write_all(&[0x55]).await.is_err() {
                    break;
                }
                tokio::time::sleep(receiver_noise_period()).await;
            }
        });

        let err = receiver.sync(&mut stream).await.unwrap_err();
        assert!(matches!(err, ModbusError::Sync));
        noise.abort();
    }

    fn receiver_noise_period() -> Duration {
        DEFAULT_MASTER_SYNC_DELAY / 2
    }

    #[tokio::test(start_paused = true)]
    async fn sync_recovers_after_bus_noise_stops() {
        let (mut stream, mut wire) = pipe();
        wire.write_all(&[0x55, 0xAA]).await.unwrap();
        // The noise already sits in the pipe; one probe drains it and the
        // next one sees an idle line.
        rcv().sync(&mut stream).await.unwrap();
    }
}
