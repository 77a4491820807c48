//! Modbus-over-serial slave (server) driver
//!
//! Runs an indefinite receive-classify-respond loop. The slave handles
//! requests addressed to its node (or every node when configured
//! promiscuously), and keeps watching the traffic of its neighbors: a
//! slave that stopped parsing foreign exchanges would mistake the next
//! response on the bus for a request. Frame-level failures bump the
//! diagnostic counters, force a resynchronization and keep the loop
//! going; only byte-stream failures terminate it.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use serbus::{Request, Response, SerHandler, SerSlave, SerSlaveConfig, TimedStream};
//!
//! struct Registers([u16; 16]);
//!
//! impl SerHandler for Registers {
//!     fn handle(&mut self, _node: u8, req: &Request) -> Option<Response> {
//!         match *req {
//!             Request::ReadRegs { holding: true, addr, count } => Some(Response::ReadRegs {
//!                 holding: true,
//!                 values: self.0[addr as usize..(addr + count) as usize].to_vec(),
//!             }),
//!             _ => Some(Response::Exception {
//!                 function: req.fn_code(),
//!                 code: serbus::ExCode::IllegalFunction,
//!             }),
//!         }
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> serbus::ModbusResult<()> {
//!     let port = TimedStream::open_serial("/dev/ttyUSB0", 19_200)?;
//!     let mut slave = SerSlave::new(port, SerSlaveConfig::new().with_node_id(0x01))
//!         .with_handler(Registers([0; 16]));
//!     slave.run().await
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::constants::{
    BROADCAST_ADDR, DEFAULT_BAUDRATE, DEFAULT_DELAY, DEFAULT_SLAVE_FRAME_TIMEOUT,
    DEFAULT_SLAVE_SYNC_DELAY, DEFAULT_SLAVE_TIMEOUT, DEFAULT_SYNC_WAIT_MAX, MAX_SER_ADU,
};
use crate::counters::{Counter, DiagCounters};
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{ExCode, SerAdu};
use crate::packers::{ser_pack, Request, Response};
use crate::receiver::SerReceiverRtu;
use crate::stream::{DeadlineRead, DeadlineWrite};
use crate::transmitter::SerTransmitterRtu;

/// Structured request handler.
///
/// Returning `None` declines to respond, which is the correct reply to a
/// request that is not really ours (promiscuous configurations) and the
/// only possible reply to a broadcast. Error replies are ordinary
/// [`Response::Exception`] values.
pub trait SerHandler: Send {
    /// Handle one decoded request addressed to `node`
    fn handle(&mut self, node: u8, req: &Request) -> Option<Response>;
}

/// Raw request handler, used when the structured decoding is not wanted.
///
/// Receives the whole request ADU and a response buffer to fill with a
/// complete response ADU, CRC included. Returning `false` declines to
/// respond.
pub trait SerRawHandler: Send {
    /// Handle one raw request ADU
    fn handle_raw(&mut self, req: &[u8], res: &mut Vec<u8>) -> bool;
}

/// Configuration for [`SerSlave`]
#[derive(Debug, Clone)]
pub struct SerSlaveConfig {
    /// Node address this slave answers to. Zero means promiscuous: every
    /// request reaches the handler, which decides what is ours.
    pub node_id: u8,
    /// Serial bus bitrate, used for transmission time calculations
    pub baudrate: u32,
    /// Response timeout used while monitoring foreign exchanges
    pub timeout: Duration,
    /// Maximum silence allowed once frame reception has started
    pub frame_timeout: Duration,
    /// Gap between the end of a received request and the response
    pub delay: Duration,
    /// Idle time that declares the bus clean
    pub sync_delay: Duration,
    /// Upper bound on a synchronization attempt
    pub sync_wait_max: Duration,
}

impl SerSlaveConfig {
    /// Configuration with the default timing parameters
    pub fn new() -> Self {
        Self {
            node_id: 0,
            baudrate: DEFAULT_BAUDRATE,
            timeout: DEFAULT_SLAVE_TIMEOUT,
            frame_timeout: DEFAULT_SLAVE_FRAME_TIMEOUT,
            delay: DEFAULT_DELAY,
            sync_delay: DEFAULT_SLAVE_SYNC_DELAY,
            sync_wait_max: DEFAULT_SYNC_WAIT_MAX,
        }
    }

    /// Set the node address
    pub fn with_node_id(mut self, node_id: u8) -> Self {
        self.node_id = node_id;
        self
    }

    /// Set the bus bitrate
    pub fn with_baudrate(mut self, baudrate: u32) -> Self {
        self.baudrate = baudrate;
        self
    }
}

impl Default for SerSlaveConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Modbus-over-serial slave (server)
pub struct SerSlave<S> {
    stream: S,
    node_id: u8,
    handler: Option<Box<dyn SerHandler>>,
    raw_handler: Option<Box<dyn SerRawHandler>>,
    timeout: Duration,
    rcv: SerReceiverRtu,
    trx: SerTransmitterRtu,
    synced: bool,
    counters: Arc<DiagCounters>,
    req_buf: Vec<u8>,
    res_buf: Vec<u8>,
}

impl<S: DeadlineRead + DeadlineWrite> SerSlave<S> {
    /// New slave exchanging frames on `stream`, configured by `cfg`.
    ///
    /// Without a handler the slave only monitors the bus; it never
    /// responds to anything.
    pub fn new(stream: S, cfg: SerSlaveConfig) -> Self {
        let mut rcv = SerReceiverRtu::new();
        rcv.frame_timeout = cfg.frame_timeout;
        rcv.sync_delay = cfg.sync_delay;
        rcv.sync_wait_max = cfg.sync_wait_max;
        let mut trx = SerTransmitterRtu::new();
        trx.baudrate = cfg.baudrate;
        trx.delay = cfg.delay;
        Self {
            stream,
            node_id: cfg.node_id,
            handler: None,
            raw_handler: None,
            timeout: cfg.timeout,
            rcv,
            trx,
            synced: false,
            counters: Arc::new(DiagCounters::new()),
            req_buf: Vec::with_capacity(MAX_SER_ADU),
            res_buf: Vec::with_capacity(MAX_SER_ADU),
        }
    }

    /// Install the structured handler. When both handlers are installed
    /// the structured one wins.
    pub fn with_handler(mut self, handler: impl SerHandler + 'static) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Install the raw handler
    pub fn with_raw_handler(mut self, handler: impl SerRawHandler + 'static) -> Self {
        self.raw_handler = Some(Box::new(handler));
        self
    }

    /// A shared handle to the diagnostic counters. Snapshots may be
    /// taken while the slave is running.
    pub fn counters(&self) -> Arc<DiagCounters> {
        Arc::clone(&self.counters)
    }

    /// Read one diagnostic counter
    pub fn counter(&self, counter: Counter) -> u64 {
        self.counters.get(counter)
    }

    /// Run the receive-classify-respond loop until the byte stream
    /// fails. Closing the stream from elsewhere is the way to stop a
    /// running slave; the loop then returns the resulting I/O error.
    pub async fn run(&mut self) -> ModbusResult<()> {
        loop {
            if !self.synced {
                self.rcv.sync(&mut self.stream).await?;
                self.synced = true;
                debug!("synchronized to bus");
            }

            self.req_buf.clear();
            match self
                .rcv
                .receive_req(&mut self.stream, &mut self.req_buf, None)
                .await
            {
                Ok(()) => {}
                Err(e @ (ModbusError::Frame | ModbusError::Crc)) => {
                    self.synced = false;
                    self.counters.inc(Counter::CrcError);
                    debug!(error = %e, "dropped request frame");
                    continue;
                }
                Err(ModbusError::Timeout) => continue,
                Err(e) => return Err(e),
            }
            self.counters.inc(Counter::BusMessage);
            self.trx.note_received(Instant::now());

            let node = SerAdu::new(&self.req_buf).node();
            if node == BROADCAST_ADDR {
                self.counters.inc(Counter::SlaveMessage);
                self.counters.inc(Counter::SlaveNoResponse);
                self.res_buf.clear();
                let _ = dispatch(
                    &mut self.handler,
                    &mut self.raw_handler,
                    &self.counters,
                    &self.req_buf,
                    &mut self.res_buf,
                );
                continue;
            }

            if self.node_id == 0 || self.node_id == node {
                self.counters.inc(Counter::SlaveMessage);
                self.res_buf.clear();
                let responded = dispatch(
                    &mut self.handler,
                    &mut self.raw_handler,
                    &self.counters,
                    &self.req_buf,
                    &mut self.res_buf,
                );
                if responded {
                    self.trx.transmit(&mut self.stream, &self.res_buf).await?;
                    continue;
                }
                self.counters.inc(Counter::SlaveNoResponse);
            }

            // Not ours. Consume the peer's response so the next byte we
            // parse is again the start of a request.
            self.res_buf.clear();
            let deadline = Instant::now() + self.timeout;
            match self
                .rcv
                .receive_res(&mut self.stream, &mut self.res_buf, Some(deadline))
                .await
            {
                Ok(()) => {
                    self.counters.inc(Counter::BusMessage);
                    self.trx.note_received(Instant::now());
                    trace!(node, "monitored foreign exchange");
                }
                Err(e @ (ModbusError::Frame | ModbusError::Crc)) => {
                    self.synced = false;
                    self.counters.inc(Counter::CrcError);
                    debug!(error = %e, "dropped monitored response frame");
                }
                Err(ModbusError::Timeout) => {}
                Err(e) => return Err(e),
            }
        }
    }
}

/// Build the response ADU for one request. Returns `false` when the
/// slave declines to respond.
fn dispatch(
    handler: &mut Option<Box<dyn SerHandler>>,
    raw_handler: &mut Option<Box<dyn SerRawHandler>>,
    counters: &DiagCounters,
    req_adu: &[u8],
    res: &mut Vec<u8>,
) -> bool {
    let adu = SerAdu::new(req_adu);
    let node = adu.node();

    let Some(h) = handler.as_deref_mut() else {
        if let Some(rh) = raw_handler.as_deref_mut() {
            return rh.handle_raw(req_adu, res);
        }
        return false;
    };

    // The sizer only lets known function codes through, so the code byte
    // always names a member of the closed enumeration.
    let Some(function) = adu.fn_code() else {
        return false;
    };
    let reply = match Request::unpack(adu.pdu()) {
        Ok((req, _)) => match h.handle(node, &req) {
            Some(reply) => reply,
            None => return false,
        },
        Err(ModbusError::InvalidFunction { .. } | ModbusError::UnsupportedFunction { .. }) => {
            Response::Exception {
                function,
                code: ExCode::IllegalFunction,
            }
        }
        Err(_) => Response::Exception {
            function,
            code: ExCode::IllegalDataValue,
        },
    };

    if let Response::Exception { code, .. } = &reply {
        counters.inc(Counter::Exception);
        if *code == ExCode::ServerBusy {
            counters.inc(Counter::SlaveBusy);
        }
    }

    if ser_pack(res, node, &reply).is_err() {
        // The handler produced something unpackable; answer with a
        // server failure instead of staying silent.
        warn!(node, function = %function, "handler response failed to pack");
        res.clear();
        counters.inc(Counter::Exception);
        let fallback = Response::Exception {
            function,
            code: ExCode::ServerFailure,
        };
        if ser_pack(res, node, &fallback).is_err() {
            res.clear();
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::crc16;
    use crate::master::{SerMaster, SerMasterConfig};
    use crate::stream::TimedStream;
    use tokio::io::{duplex, DuplexStream};

    struct Echo;

    impl SerHandler for Echo {
        fn handle(&mut self, _node: u8, req: &Request) -> Option<Response> {
            match *req {
                Request::WriteReg { addr, value } => Some(Response::WriteReg { addr, value }),
                Request::ReadRegs {
                    holding: true,
                    count,
                    ..
                } => Some(Response::ReadRegs {
                    holding: true,
                    values: vec![0xBEEF; count as usize],
                }),
                _ => Some(Response::Exception {
                    function: req.fn_code(),
                    code: ExCode::IllegalFunction,
                }),
            }
        }
    }

    fn bus() -> (TimedStream<DuplexStream>, TimedStream<DuplexStream>) {
        let (a, b) = duplex(1024);
        (TimedStream::new(a), TimedStream::new(b))
    }

    fn slave_config() -> SerSlaveConfig {
        SerSlaveConfig::new().with_node_id(0x01)
    }

    /// Let a freshly spawned slave finish its initial synchronization,
    /// so that its idle probe cannot swallow the first frame.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn answers_request_for_own_node() {
        let (master_side, slave_side) = bus();
        let mut slave = SerSlave::new(slave_side, slave_config()).with_handler(Echo);
        let counters = slave.counters();
        let slave_task = tokio::spawn(async move { slave.run().await });
        settle().await;

        let mut master = SerMaster::new(master_side, SerMasterConfig::new());
        let res = master
            .call(0x01, &Request::write_register(0x00AC, 0xDEAD))
            .await
            .unwrap();
        assert_eq!(
            res,
            Some(Response::WriteReg {
                addr: 0x00AC,
                value: 0xDEAD
            })
        );
        assert_eq!(counters.get(Counter::BusMessage), 1);
        assert_eq!(counters.get(Counter::SlaveMessage), 1);
        assert_eq!(counters.get(Counter::SlaveNoResponse), 0);

        // Closing the master side terminates the slave loop
        drop(master);
        let err = slave_task.await.unwrap().unwrap_err();
        assert!(matches!(err, ModbusError::Io(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_undecodable_payload_with_exception() {
        let (master_side, slave_side) = bus();
        let mut slave = SerSlave::new(slave_side, slave_config()).with_handler(Echo);
        let counters = slave.counters();
        let slave_task = tokio::spawn(async move { slave.run().await });
        settle().await;

        let mut master = SerMaster::new(master_side, SerMasterConfig::new());
        // A write-single-coil with a value that is neither ON nor OFF:
        // well-framed, but its payload does not decode.
        let mut raw = vec![0x01, 0x05, 0x00, 0xAC, 0x12, 0x34];
        let crc = crc16(&raw);
        raw.extend_from_slice(&crc.to_le_bytes());

        let mut res = Vec::new();
        assert!(master.send_recv(&raw, &mut res).await.unwrap());
        let view = SerAdu::new(&res);
        assert!(view.is_exception());
        assert_eq!(view.ex_code(), Some(ExCode::IllegalDataValue));
        assert_eq!(counters.get(Counter::Exception), 1);

        drop(master);
        let _ = slave_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_reaches_handler_but_gets_no_reply() {
        let (master_side, slave_side) = bus();
        let mut slave = SerSlave::new(slave_side, slave_config()).with_handler(Echo);
        let counters = slave.counters();
        let slave_task = tokio::spawn(async move { slave.run().await });
        settle().await;

        let mut master = SerMaster::new(master_side, SerMasterConfig::new());
        let res = master
            .call(BROADCAST_ADDR, &Request::write_register(0x0001, 0x0007))
            .await
            .unwrap();
        assert_eq!(res, None);

        // Give the slave loop a chance to consume the broadcast
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(counters.get(Counter::BusMessage), 1);
        assert_eq!(counters.get(Counter::SlaveMessage), 1);
        assert_eq!(counters.get(Counter::SlaveNoResponse), 1);

        drop(master);
        let _ = slave_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn monitors_foreign_exchange() {
        let (mut far_side, slave_side) = bus();
        let cfg = slave_config();
        let monitor_timeout = cfg.timeout;
        let mut slave = SerSlave::new(slave_side, cfg).with_handler(Echo);
        let counters = slave.counters();
        let slave_task = tokio::spawn(async move { slave.run().await });

        // Another master/slave pair talking on the same bus: a request
        // for node 2 followed by node 2's response.
        let mut req = Vec::new();
        ser_pack(&mut req, 0x02, &Request::read_holding_registers(0, 1)).unwrap();
        let mut res = Vec::new();
        ser_pack(
            &mut res,
            0x02,
            &Response::ReadRegs {
                holding: true,
                values: vec![0x1234],
            },
        )
        .unwrap();

        settle().await;
        far_side.write_all(&req).await.unwrap();
        tokio::time::sleep(monitor_timeout / 4).await;
        far_side.write_all(&res).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        // Both frames counted, nothing transmitted back, no errors
        assert_eq!(counters.get(Counter::BusMessage), 2);
        assert_eq!(counters.get(Counter::SlaveMessage), 0);
        assert_eq!(counters.get(Counter::CrcError), 0);

        drop(far_side);
        let err = slave_task.await.unwrap().unwrap_err();
        assert!(matches!(err, ModbusError::Io(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_frame_bumps_counter_and_resyncs() {
        let (mut far_side, slave_side) = bus();
        let mut slave = SerSlave::new(slave_side, slave_config()).with_handler(Echo);
        let counters = slave.counters();
        let slave_task = tokio::spawn(async move { slave.run().await });

        let mut req = Vec::new();
        ser_pack(&mut req, 0x01, &Request::write_register(0x0001, 0x0002)).unwrap();
        let last = req.len() - 1;
        req[last] ^= 0xFF; // break the CRC

        settle().await;
        far_side.write_all(&req).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(counters.get(Counter::CrcError), 1);
        assert_eq!(counters.get(Counter::SlaveMessage), 0);

        // After the idle gap the slave is synced again and serves the
        // intact retransmission.
        let mut good = Vec::new();
        ser_pack(&mut good, 0x01, &Request::write_register(0x0001, 0x0002)).unwrap();
        far_side.write_all(&good).await.unwrap();

        let mut reply = Vec::new();
        let mut rcv = SerReceiverRtu::new();
        rcv.receive_res(&mut far_side, &mut reply, None)
            .await
            .unwrap();
        assert!(SerAdu::new(&reply).check_crc());
        assert_eq!(counters.get(Counter::SlaveMessage), 1);

        drop(far_side);
        let _ = slave_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn raw_handler_owns_the_wire_format() {
        struct RawEcho;
        impl SerRawHandler for RawEcho {
            fn handle_raw(&mut self, req: &[u8], res: &mut Vec<u8>) -> bool {
                // Echo the request ADU back verbatim
                res.extend_from_slice(req);
                true
            }
        }

        let (master_side, slave_side) = bus();
        let mut slave = SerSlave::new(slave_side, slave_config()).with_raw_handler(RawEcho);
        let slave_task = tokio::spawn(async move { slave.run().await });
        settle().await;

        let mut master = SerMaster::new(master_side, SerMasterConfig::new());
        let mut req = Vec::new();
        ser_pack(&mut req, 0x01, &Request::write_register(0x00AC, 0x0102)).unwrap();
        let mut res = Vec::new();
        assert!(master.send_recv(&req, &mut res).await.unwrap());
        assert_eq!(res, req);

        drop(master);
        let _ = slave_task.await.unwrap();
    }
}
