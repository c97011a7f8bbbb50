//! Error types shared by the front-end drivers.

use embedded_hal::{digital, spi};
use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// Failure modes of the control core.
///
/// Nothing here is fatal: every operation leaves the drivers usable and the
/// caller decides whether to retry. There is no built-in retry anywhere; the
/// bounded busy poll in the PMU driver is the only wait.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Input rejected before any bus traffic.
    #[error("invalid argument")]
    InvalidArgument,
    /// The busy/ready line did not settle within the poll bound.
    #[error("device busy")]
    Busy,
    /// A register readback did not match what was written.
    #[error("write verification failed")]
    VerifyFailed,
    /// The amplifier identity register held an unexpected value.
    #[error("unexpected device id {0:#04x}")]
    IdentityMismatch(u8),
    /// SPI transfer failure.
    #[error("bus error: {0:?}")]
    Bus(spi::ErrorKind),
    /// GPIO failure on a select, reset or ready line.
    #[error("pin error: {0:?}")]
    Pin(digital::ErrorKind),
}

impl<E: spi::Error> From<E> for Error {
    fn from(value: E) -> Self {
        Error::Bus(value.kind())
    }
}

impl Error {
    /// Capture a GPIO error, losing the concrete pin type.
    pub(crate) fn pin<E: digital::Error>(value: E) -> Self {
        Error::Pin(value.kind())
    }
}
