//! Exclusive access to the shared control bus.
//!
//! The PMU, the ADC and the instrumentation amplifiers hang off one SPI bus.
//! A register transaction is a multi-step sequence (assert the chip select,
//! shift the frame, possibly toggle the select mid-word, poll the busy line)
//! and must not interleave with another device's sequence, so the bus is
//! owned here and handed out for one whole transaction at a time.

use spin::Mutex;

/// Serialized owner of the control SPI bus.
///
/// Drivers borrow the bus with [`ControlBus::with`]; the closure runs with
/// the bus locked end to end and the lock is released on every exit path.
pub struct ControlBus<B> {
    spi: Mutex<B>,
}

impl<B> ControlBus<B> {
    pub const fn new(spi: B) -> Self {
        Self {
            spi: Mutex::new(spi),
        }
    }

    /// Run one bus transaction with exclusive access.
    pub fn with<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        f(&mut self.spi.lock())
    }

    /// Tear down the wrapper and return the SPI peripheral.
    pub fn into_inner(self) -> B {
        self.spi.into_inner()
    }
}
