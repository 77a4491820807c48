//! RTU frame transmitter
//!
//! Emits fully formed ADUs with a write deadline derived from the
//! configured bitrate, and enforces the inter-frame turnaround delay
//! other devices on the bus may still expect between the end of one
//! frame and the start of the next.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::trace;

use crate::constants::{
    DEFAULT_BAUDRATE, DEFAULT_BITS_PER_CHAR, DEFAULT_DELAY, MIN_WRITE_TIMEOUT,
};
use crate::error::ModbusResult;
use crate::stream::DeadlineWrite;

/// Frame transmitter for RTU-encoded serial ADUs
#[derive(Debug)]
pub struct SerTransmitterRtu {
    /// Serial bitrate used to bound the transmission time
    pub baudrate: u32,
    /// Wire bits per character (start + data + parity + stop)
    pub bits_per_char: u32,
    /// Minimum gap between the end of the previous received frame and
    /// the start of the next transmission.
    pub delay: Duration,
    last_rx: Option<Instant>,
}

impl SerTransmitterRtu {
    /// New transmitter with the default line parameters
    pub fn new() -> Self {
        Self {
            baudrate: DEFAULT_BAUDRATE,
            bits_per_char: DEFAULT_BITS_PER_CHAR,
            delay: DEFAULT_DELAY,
            last_rx: None,
        }
    }

    /// Time needed to clock `len` bytes onto the wire at the configured
    /// bitrate.
    pub fn frame_duration(&self, len: usize) -> Duration {
        let bits = len as u64 * u64::from(self.bits_per_char);
        Duration::from_nanos(bits * 1_000_000_000 / u64::from(self.baudrate.max(1)))
    }

    /// Record the completion instant of a received frame. The next
    /// [`transmit`](Self::transmit) holds off until
    /// [`delay`](Self::delay) has elapsed from this point.
    pub fn note_received(&mut self, at: Instant) {
        self.last_rx = Some(at);
    }

    /// Transmit one ADU.
    ///
    /// Sleeps out the remainder of the inter-frame delay, writes the
    /// frame under a deadline sufficient for its length (with a floor of
    /// [`MIN_WRITE_TIMEOUT`]), and returns the absolute instant at which
    /// the transmission logically completes. Callers chain their
    /// response deadlines from that instant.
    pub async fn transmit<W: DeadlineWrite>(
        &mut self,
        stream: &mut W,
        adu: &[u8],
    ) -> ModbusResult<Instant> {
        if let Some(last) = self.last_rx {
            let since = Instant::now().duration_since(last);
            if since < self.delay {
                sleep(self.delay - since).await;
            }
        }
        let duration = self.frame_duration(adu.len());
        stream.set_write_deadline(Some(Instant::now() + duration.max(MIN_WRITE_TIMEOUT)));
        stream.write_all(adu).await?;
        trace!(len = adu.len(), "transmitted frame");
        Ok(Instant::now() + duration)
    }
}

impl Default for SerTransmitterRtu {
    fn default() -> Self {
        Self::new()
    }
}
