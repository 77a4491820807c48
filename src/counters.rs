//! Slave diagnostic counters
//!
//! A fixed bank of event counters maintained by the slave loop and
//! readable concurrently through a shared handle.

use std::sync::Mutex;

/// Number of counter slots in a bank
pub const COUNTER_COUNT: usize = 8;

/// Diagnostic counter selectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// Valid frames observed on the bus, whatever their address
    BusMessage = 0,
    /// Frames dropped for CRC or framing failures
    CrcError = 1,
    /// Exception responses sent by this slave
    Exception = 2,
    /// Requests addressed to this slave (broadcasts included)
    SlaveMessage = 3,
    /// Requests addressed to this slave that produced no response
    SlaveNoResponse = 4,
    /// Negative-acknowledge exception responses sent by this slave
    SlaveNak = 5,
    /// Busy exception responses sent by this slave
    SlaveBusy = 6,
    /// Characters lost to receiver overrun
    Overrun = 7,
}

/// A bank of diagnostic counters. The slave loop writes while any number
/// of readers take snapshots through [`get`](DiagCounters::get) and
/// [`get_all`](DiagCounters::get_all).
#[derive(Debug, Default)]
pub struct DiagCounters {
    slots: Mutex<[u64; COUNTER_COUNT]>,
}

impl DiagCounters {
    /// New bank with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    fn with_slots<T>(&self, f: impl FnOnce(&mut [u64; COUNTER_COUNT]) -> T) -> T {
        let mut guard = match self.slots.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Increment one counter
    pub fn inc(&self, counter: Counter) {
        self.with_slots(|s| s[counter as usize] += 1);
    }

    /// Read one counter
    pub fn get(&self, counter: Counter) -> u64 {
        self.with_slots(|s| s[counter as usize])
    }

    /// Snapshot all counters at once
    pub fn get_all(&self) -> [u64; COUNTER_COUNT] {
        self.with_slots(|s| *s)
    }

    /// Reset one counter to zero
    pub fn reset(&self, counter: Counter) {
        self.with_slots(|s| s[counter as usize] = 0);
    }

    /// Reset every counter to zero
    pub fn reset_all(&self) {
        self.with_slots(|s| *s = [0; COUNTER_COUNT]);
    }
}
