//! Control core for the analog front end of a four-channel source-measure
//! unit.
//!
//! Three devices share one SPI control bus:
//! * an AD5522 per-pin parametric measurement unit, which forces the
//!   programmed voltage or current and clamps the complementary quantity,
//! * an AD7177-2 delta-sigma ADC streaming the measured channel voltage and
//!   current back through an interrupt-driven pipeline,
//! * an ADA4254 programmable-gain instrumentation amplifier scaling the
//!   channel voltage into the converter span.
//!
//! [`smu::Smu`] sits on top: it owns the per-channel logical state, converts
//! physical units to and from DAC/ADC codes with safety clamping, and
//! sequences the drivers so mode and range transitions never command an
//! out-of-bounds or discontinuous output at the device under test.
//!
//! All hardware access goes through `embedded-hal` 1.0 traits, so the whole
//! crate runs against mock implementations on a host.

#![cfg_attr(feature = "no-std", no_std)]

pub mod ad5522;
pub mod ad7177;
pub mod ada4254;
pub mod bus;
pub mod convert;
pub mod error;
pub mod publish;
pub mod smu;

#[cfg(test)]
mod mock_bus;

pub use ad5522::{Channel, ForceMode};
pub use ad7177::Snapshot;
pub use bus::ControlBus;
pub use convert::{CurrentRange, DacRole};
pub use error::{Error, Result};
pub use publish::UpdateSink;
pub use smu::{OutputState, SenseMode, Smu};
