//! Deadline-capable byte streams
//!
//! The receiver, transmitter and drivers depend on a single system-call
//! surface: a byte stream with independent absolute deadlines per
//! direction. Deadlines are [`tokio::time::Instant`]s so that composition
//! across layers stays deterministic; durations never cross a boundary.
//!
//! [`TimedStream`] adapts any tokio byte stream (a
//! [`tokio_serial::SerialStream`], a `TcpStream`, an in-memory duplex
//! pipe) to that contract. A read or write that outlives its deadline
//! fails with [`std::io::ErrorKind::TimedOut`], which is how the
//! receiver tells silence from stream failure.

use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};
use tokio_serial::SerialStream;

use crate::error::{ModbusError, ModbusResult};

/// A byte source with an absolute read deadline
pub trait DeadlineRead: Send {
    /// Bound all subsequent reads by `deadline`. `None` removes the
    /// bound.
    fn set_read_deadline(&mut self, deadline: Option<Instant>);

    /// Read up to `buf.len()` bytes. A read that is still pending at the
    /// deadline fails with [`io::ErrorKind::TimedOut`].
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;
}

/// A byte sink with an absolute write deadline
pub trait DeadlineWrite: Send {
    /// Bound all subsequent writes by `deadline`. `None` removes the
    /// bound.
    fn set_write_deadline(&mut self, deadline: Option<Instant>);

    /// Write the whole of `buf` and flush it. A write that is still
    /// pending at the deadline fails with [`io::ErrorKind::TimedOut`].
    fn write_all(&mut self, buf: &[u8]) -> impl Future<Output = io::Result<()>> + Send;
}

/// True if the error reports an expired deadline
#[inline]
pub fn is_timeout(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::TimedOut
}

fn deadline_exceeded() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")
}

/// Deadline adapter over a tokio byte stream
#[derive(Debug)]
pub struct TimedStream<S> {
    inner: S,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
}

impl<S> TimedStream<S> {
    /// Wrap a tokio byte stream
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            read_deadline: None,
            write_deadline: None,
        }
    }

    /// A reference to the wrapped stream
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// A mutable reference to the wrapped stream
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Unwrap, returning the inner stream
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl TimedStream<SerialStream> {
    /// Open a serial port with 8N1 framing at the given bitrate
    pub fn open_serial(port: &str, baudrate: u32) -> ModbusResult<Self> {
        let builder = tokio_serial::new(port, baudrate);
        let stream = SerialStream::open(&builder)
            .map_err(|e| ModbusError::Io(io::Error::other(e)))?;
        Ok(Self::new(stream))
    }

    /// Open a serial port with full line configuration
    pub fn open_serial_with_config(
        port: &str,
        baudrate: u32,
        data_bits: tokio_serial::DataBits,
        stop_bits: tokio_serial::StopBits,
        parity: tokio_serial::Parity,
    ) -> ModbusResult<Self> {
        let builder = tokio_serial::new(port, baudrate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity);
        let stream = SerialStream::open(&builder)
            .map_err(|e| ModbusError::Io(io::Error::other(e)))?;
        Ok(Self::new(stream))
    }
}

impl<S: AsyncRead + Unpin + Send> DeadlineRead for TimedStream<S> {
    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.read_deadline {
            Some(deadline) => timeout_at(deadline, self.inner.read(buf))
                .await
                .unwrap_or_else(|_| Err(deadline_exceeded())),
            None => self.inner.read(buf).await,
        }
    }
}

impl<S: AsyncWrite + Unpin + Send> DeadlineWrite for TimedStream<S> {
    fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let inner = &mut self.inner;
        let io = async move {
            inner.write_all(buf).await?;
            inner.flush().await
        };
        match self.write_deadline {
            Some(deadline) => timeout_at(deadline, io)
                .await
                .unwrap_or_else(|_| Err(deadline_exceeded())),
            None => io.await,
        }
    }
}
