//! Modbus-over-serial master (client) driver
//!
//! Orchestrates one request/response exchange at a time over a
//! half-duplex bus: synchronize if needed, transmit, then receive the
//! response under a deadline chained from the transmission completion
//! instant. Frame-level failures are retried by retransmission; I/O and
//! synchronization failures abort the exchange.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use serbus::{Request, SerMaster, SerMasterConfig, TimedStream};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> serbus::ModbusResult<()> {
//!     let port = TimedStream::open_serial("/dev/ttyUSB0", 19_200)?;
//!     let mut master = SerMaster::new(port, SerMasterConfig::new().with_baudrate(19_200));
//!
//!     match master.call(0x01, &Request::read_holding_registers(0x006B, 3)).await? {
//!         Some(res) => println!("response: {:?}", res),
//!         None => println!("broadcast, no response expected"),
//!     }
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::constants::{
    BROADCAST_ADDR, DEFAULT_BAUDRATE, DEFAULT_DELAY, DEFAULT_MASTER_FRAME_TIMEOUT,
    DEFAULT_MASTER_SYNC_DELAY, DEFAULT_MASTER_TIMEOUT, DEFAULT_SYNC_WAIT_MAX, MAX_SER_ADU,
};
use crate::error::{ModbusError, ModbusResult};
use crate::frame::SerAdu;
use crate::packers::{ser_pack, Request, Response};
use crate::receiver::SerReceiverRtu;
use crate::stream::{DeadlineRead, DeadlineWrite};
use crate::transmitter::SerTransmitterRtu;

/// Configuration for [`SerMaster`]. Every field has a conservative
/// default; override what the installation needs.
#[derive(Debug, Clone)]
pub struct SerMasterConfig {
    /// Serial bus bitrate, used for transmission time calculations
    pub baudrate: u32,
    /// Response timeout, counted from the end of request transmission
    /// until the first response byte.
    pub timeout: Duration,
    /// Maximum silence allowed once response reception has started
    pub frame_timeout: Duration,
    /// Gap between the end of a received response and the next request
    pub delay: Duration,
    /// Number of retransmissions when no valid response arrives. Total
    /// attempts are `retrans + 1`.
    pub retrans: u32,
    /// Idle time that declares the bus clean before the first request
    /// and after a frame error.
    pub sync_delay: Duration,
    /// Upper bound on a synchronization attempt
    pub sync_wait_max: Duration,
}

impl SerMasterConfig {
    /// Configuration with the default timing parameters
    pub fn new() -> Self {
        Self {
            baudrate: DEFAULT_BAUDRATE,
            timeout: DEFAULT_MASTER_TIMEOUT,
            frame_timeout: DEFAULT_MASTER_FRAME_TIMEOUT,
            delay: DEFAULT_DELAY,
            retrans: 0,
            sync_delay: DEFAULT_MASTER_SYNC_DELAY,
            sync_wait_max: DEFAULT_SYNC_WAIT_MAX,
        }
    }

    /// Set the bus bitrate
    pub fn with_baudrate(mut self, baudrate: u32) -> Self {
        self.baudrate = baudrate;
        self
    }

    /// Set the response timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the number of retransmissions
    pub fn with_retrans(mut self, retrans: u32) -> Self {
        self.retrans = retrans;
        self
    }
}

impl Default for SerMasterConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Modbus-over-serial master (client)
#[derive(Debug)]
pub struct SerMaster<S> {
    stream: S,
    rcv: SerReceiverRtu,
    trx: SerTransmitterRtu,
    timeout: Duration,
    retrans: u32,
    synced: bool,
}

impl<S: DeadlineRead + DeadlineWrite> SerMaster<S> {
    /// New master exchanging frames on `stream`, configured by `cfg`
    pub fn new(stream: S, cfg: SerMasterConfig) -> Self {
        let mut rcv = SerReceiverRtu::new();
        rcv.frame_timeout = cfg.frame_timeout;
        rcv.sync_delay = cfg.sync_delay;
        rcv.sync_wait_max = cfg.sync_wait_max;
        let mut trx = SerTransmitterRtu::new();
        trx.baudrate = cfg.baudrate;
        trx.delay = cfg.delay;
        Self {
            stream,
            rcv,
            trx,
            timeout: cfg.timeout,
            retrans: cfg.retrans,
            synced: false,
        }
    }

    /// True once the master considers itself synchronized to the bus
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// A mutable reference to the underlying byte stream
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Unwrap, returning the underlying byte stream
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Transmit the request ADU and receive the response ADU, which is
    /// appended to `res`. Returns `Ok(true)` when a response was
    /// received and `Ok(false)` for broadcast requests, which produce no
    /// response. On error `res` is unaffected.
    ///
    /// Frame-level failures ([`ModbusError::Frame`], [`ModbusError::Crc`],
    /// [`ModbusError::Timeout`]) consume a retry; after a frame or CRC
    /// error the bus is re-synchronized first. [`ModbusError::Io`] and
    /// [`ModbusError::Sync`] abort immediately and should be considered
    /// fatal. Exception responses from the slave are not errors here.
    pub async fn send_recv(&mut self, req: &[u8], res: &mut Vec<u8>) -> ModbusResult<bool> {
        let mut last = ModbusError::Timeout;
        for attempt in 0..=self.retrans {
            if !self.synced {
                self.rcv.sync(&mut self.stream).await?;
                self.synced = true;
            }

            let tx_done = match self.trx.transmit(&mut self.stream, req).await {
                Ok(t) => t,
                Err(e) => {
                    self.synced = false;
                    return Err(e);
                }
            };

            if SerAdu::new(req).node() == BROADCAST_ADDR {
                return Ok(false);
            }

            let deadline = tx_done + self.timeout;
            match self
                .rcv
                .receive_res(&mut self.stream, res, Some(deadline))
                .await
            {
                Ok(()) => {
                    self.trx.note_received(Instant::now());
                    return Ok(true);
                }
                Err(e @ (ModbusError::Frame | ModbusError::Crc)) => {
                    debug!(attempt, error = %e, "response unusable, resyncing");
                    self.synced = false;
                    last = e;
                }
                Err(ModbusError::Timeout) => {
                    debug!(attempt, "response timed out");
                    last = ModbusError::Timeout;
                }
                Err(e) => {
                    self.synced = false;
                    return Err(e);
                }
            }
        }
        Err(last)
    }

    /// Pack and transmit `req` for node `node`, receive the response and
    /// unpack it. Returns `Ok(None)` for broadcast requests. Exception
    /// responses from the slave are surfaced as
    /// [`ModbusError::Exception`].
    pub async fn call(&mut self, node: u8, req: &Request) -> ModbusResult<Option<Response>> {
        let mut req_adu = Vec::with_capacity(MAX_SER_ADU);
        ser_pack(&mut req_adu, node, req)?;

        let mut res_adu = Vec::with_capacity(MAX_SER_ADU);
        if !self.send_recv(&req_adu, &mut res_adu).await? {
            return Ok(None);
        }

        let adu = SerAdu::new(&res_adu);
        if adu.node() != node {
            return Err(ModbusError::response("response from a different node"));
        }
        if adu.is_exception() {
            let function = adu
                .fn_code()
                .ok_or_else(|| ModbusError::response("unknown function code in exception"))?;
            let exception = adu
                .ex_code()
                .ok_or_else(|| ModbusError::response("unknown exception code"))?;
            return Err(ModbusError::Exception {
                function,
                exception,
            });
        }

        let (res, rest) = Response::unpack(adu.pdu())?;
        if !rest.is_empty() {
            return Err(ModbusError::response("trailing bytes after response"));
        }
        if res.fn_code() != req.fn_code() {
            return Err(ModbusError::response(
                "response function code does not match request",
            ));
        }
        Ok(Some(res))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ExCode, FnCode};
    use std::collections::VecDeque;
    use std::io;

    /// Scripted byte stream. Each receiver read pops one script entry;
    /// an empty script reads as an expired deadline, which is how an
    /// idle bus looks to the sync probe.
    struct MockStream {
        script: VecDeque<io::Result<Vec<u8>>>,
        writes: Vec<Vec<u8>>,
        reads: usize,
    }

    impl MockStream {
        fn new() -> Self {
            Self {
                script: VecDeque::new(),
                writes: Vec::new(),
                reads: 0,
            }
        }

        fn push_idle(&mut self) {
            self.script
                .push_back(Err(io::Error::new(io::ErrorKind::TimedOut, "idle")));
        }

        fn push_bytes(&mut self, bytes: &[u8]) {
            self.script.push_back(Ok(bytes.to_vec()));
        }
    }

    impl DeadlineRead for MockStream {
        fn set_read_deadline(&mut self, _deadline: Option<Instant>) {}

        async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads += 1;
            match self.script.pop_front() {
                Some(Ok(mut bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    // Anything the caller could not take stays queued
                    if n < bytes.len() {
                        bytes.drain(..n);
                        self.script.push_front(Ok(bytes));
                    }
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Err(io::Error::new(io::ErrorKind::TimedOut, "idle")),
            }
        }
    }

    impl DeadlineWrite for MockStream {
        fn set_write_deadline(&mut self, _deadline: Option<Instant>) {}

        async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            self.writes.push(buf.to_vec());
            Ok(())
        }
    }

    fn sample_request() -> Request {
        Request::read_holding_registers(0x006B, 3)
    }

    fn sample_request_adu(node: u8) -> Vec<u8> {
        let mut adu = Vec::new();
        ser_pack(&mut adu, node, &sample_request()).unwrap();
        adu
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

    fn master(stream: MockStream, retrans: u32) -> SerMaster<MockStream> {
        SerMaster::new(stream, SerMasterConfig::new().with_retrans(retrans))
    }

    #[tokio::test(start_paused = true)]
    async fn exchange_succeeds() {
        let mut stream = MockStream::new();
        stream.push_idle(); // sync probe
        stream.push_bytes(&sample_response_adu());

        let mut m = master(stream, 0);
        let mut res = Vec::new();
        assert!(m.send_recv(&sample_request_adu(0x01), &mut res).await.unwrap());
        assert_eq!(res, sample_response_adu());
        assert!(m.is_synced());
        assert_eq!(m.stream_mut().writes.len(), 1);
        assert_eq!(m.stream_mut().writes[0], sample_request_adu(0x01));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_consumes_one_retry() {
        let mut stream = MockStream::new();
        stream.push_idle(); // sync probe
        stream.push_idle(); // first response never arrives
        stream.push_bytes(&sample_response_adu());

        let mut m = master(stream, 1);
        let mut res = Vec::new();
        assert!(m.send_recv(&sample_request_adu(0x01), &mut res).await.unwrap());
        assert_eq!(res, sample_response_adu());
        // Two transmissions were observed
        assert_eq!(m.stream_mut().writes.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn frame_error_triggers_resync_then_retry() {
        let mut stream = MockStream::new();
        stream.push_idle(); // initial sync probe
        stream.push_bytes(&[0x01, 0x41, 0x00, 0x00, 0x00]); // undecodable response
        stream.push_idle(); // re-sync probe
        stream.push_bytes(&sample_response_adu());

        let mut m = master(stream, 1);
        let mut res = Vec::new();
        assert!(m.send_recv(&sample_request_adu(0x01), &mut res).await.unwrap());
        assert_eq!(res, sample_response_adu());
        assert_eq!(m.stream_mut().writes.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhausted_returns_last_error() {
        let mut stream = MockStream::new();
        stream.push_idle(); // sync probe

        let mut m = master(stream, 1);
        let mut res = Vec::new();
        let err = m
            .send_recv(&sample_request_adu(0x01), &mut res)
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Timeout));
        assert!(res.is_empty());
        assert_eq!(m.stream_mut().writes.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_expects_no_response() {
        let mut stream = MockStream::new();
        stream.push_idle(); // sync probe

        let mut m = master(stream, 0);
        let mut res = Vec::new();
        assert!(!m.send_recv(&sample_request_adu(0x00), &mut res).await.unwrap());
        assert!(res.is_empty());

        // A second broadcast on the synced master must not touch the
        // read side at all.
        let reads_before = m.stream_mut().reads;
        assert!(!m.send_recv(&sample_request_adu(0x00), &mut res).await.unwrap());
        assert_eq!(m.stream_mut().reads, reads_before);
    }

    #[tokio::test(start_paused = true)]
    async fn io_error_aborts_without_retry() {
        let mut stream = MockStream::new();
        stream.push_idle(); // sync probe
        stream
            .script
            .push_back(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")));

        let mut m = master(stream, 3);
        let mut res = Vec::new();
        let err = m
            .send_recv(&sample_request_adu(0x01), &mut res)
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Io(_)));
        assert!(!m.is_synced());
        assert_eq!(m.stream_mut().writes.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn call_unpacks_matching_response() {
        let mut stream = MockStream::new();
        stream.push_idle();
        stream.push_bytes(&sample_response_adu());

        let mut m = master(stream, 0);
        let res = m.call(0x01, &sample_request()).await.unwrap();
        assert_eq!(
            res,
            Some(Response::ReadRegs {
                holding: true,
                values: vec![0x022B, 0x0000, 0x0064],
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn call_surfaces_exception_as_error() {
        let mut exc_adu = Vec::new();
        ser_pack(
            &mut exc_adu,
            0x01,
            &Response::Exception {
                function: FnCode::ReadHoldingRegisters,
                code: ExCode::IllegalDataAddress,
            },
        )
        .unwrap();

        let mut stream = MockStream::new();
        stream.push_idle();
        stream.push_bytes(&exc_adu);

        let mut m = master(stream, 0);
        let err = m.call(0x01, &sample_request()).await.unwrap_err();
        assert!(matches!(
            err,
            ModbusError::Exception {
                function: FnCode::ReadHoldingRegisters,
                exception: ExCode::IllegalDataAddress,
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn call_broadcast_returns_none() {
        let mut stream = MockStream::new();
        stream.push_idle();
        let mut m = master(stream, 0);
        let res = m
            .call(BROADCAST_ADDR, &Request::write_coil(0x00AC, true))
            .await
            .unwrap();
        assert_eq!(res, None);
    }

    #[tokio::test(start_paused = true)]
    async fn call_rejects_mismatched_function() {
        let mut wrong = Vec::new();
        ser_pack(
            &mut wrong,
            0x01,
            &Response::WriteReg {
                addr: 0x00AC,
                value: 1,
            },
        )
        .unwrap();

        let mut stream = MockStream::new();
        stream.push_idle();
        stream.push_bytes(&wrong);

        let mut m = master(stream, 0);
        let err = m.call(0x01, &sample_request()).await.unwrap_err();
        assert!(matches!(err, ModbusError::Response { .. }));
    }
}
