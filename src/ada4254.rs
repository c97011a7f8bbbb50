//! Driver for the ADA4254 programmable-gain instrumentation amplifier.
//!
//! One amplifier sits in front of the ADC voltage channel and scales the
//! forced span into the converter window. Traffic is a command byte
//! `[R/W:1][ADDR:7]` followed by one data byte.
//!
//! Configuration updates are staged: the local copy only changes once the
//! corresponding hardware write verifies, and on failure the previous
//! values are restored, so the committed state never disagrees with the
//! part. The output-gain selector is split across two registers (its low
//! bit lives in the gain mux, its high bit in the test mux), which is why a
//! gain change writes both as one logical update.

use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

use crate::bus::ControlBus;
use crate::error::{Error, Result};

mod reg {
    pub const GAIN_MUX: u8 = 0x00;
    pub const INPUT_MUX: u8 = 0x06;
    pub const GPIO_DIR: u8 = 0x08;
    pub const SF_CFG: u8 = 0x0C;
    pub const TEST_MUX: u8 = 0x0E;
    pub const DIE_REV_ID: u8 = 0x2F;
}

/// Expected identity register value.
const DEVICE_ID: u8 = 0x30;

/// Input-stage gains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InputGain {
    X0p0625 = 0x0,
    X0p125 = 0x1,
    X0p25 = 0x2,
    X0p5 = 0x3,
    X1 = 0x4,
    X2 = 0x5,
    X4 = 0x6,
    X8 = 0x7,
    X16 = 0x8,
    X32 = 0x9,
    X64 = 0xA,
    X128 = 0xB,
}

impl InputGain {
    pub fn multiplier(self) -> f32 {
        match self {
            InputGain::X0p0625 => 0.0625,
            InputGain::X0p125 => 0.125,
            InputGain::X0p25 => 0.25,
            InputGain::X0p5 => 0.5,
            InputGain::X1 => 1.0,
            InputGain::X2 => 2.0,
            InputGain::X4 => 4.0,
            InputGain::X8 => 8.0,
            InputGain::X16 => 16.0,
            InputGain::X32 => 32.0,
            InputGain::X64 => 64.0,
            InputGain::X128 => 128.0,
        }
    }
}

/// Output-stage gains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OutputGain {
    X1 = 0x0,
    X1p25 = 0x2,
    X1p375 = 0x3,
}

impl OutputGain {
    pub fn multiplier(self) -> f32 {
        match self {
            OutputGain::X1 => 1.0,
            OutputGain::X1p25 => 1.25,
            OutputGain::X1p375 => 1.375,
        }
    }
}

/// Input routing. The encodings are the switch positions used to build the
/// one-hot input-mux patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InputSwitch {
    In1 = 5,
    In2 = 3,
    TestMux = 1,
    /// Short the internal amplifier inputs. Only legal for the whole pair.
    Short = 0,
}

/// Test multiplexer reference taps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TestMuxTap {
    Avss = 0x0,
    Dvss = 0x1,
    Pos20mV = 0x2,
    Neg20mV = 0x3,
}

/// Which registers one logical configuration update touches.
enum UpdateSet {
    Gain,
    Switch,
    TestMux,
}

/// Amplifier driver instance holding the committed configuration.
pub struct Ada4254<'b, B, P> {
    bus: &'b ControlBus<B>,
    cs: P,
    gain_in: InputGain,
    gain_out: OutputGain,
    gain: f32,
    switch_pos: InputSwitch,
    switch_neg: InputSwitch,
    tmux_pos: TestMuxTap,
    tmux_neg: TestMuxTap,
}

impl<'b, B, P> Ada4254<'b, B, P>
where
    B: SpiBus<u8>,
    P: OutputPin,
{
    pub fn new(bus: &'b ControlBus<B>, cs: P) -> Self {
        Self {
            bus,
            cs,
            gain_in: InputGain::X1,
            gain_out: OutputGain::X1,
            gain: 1.0,
            switch_pos: InputSwitch::In1,
            switch_neg: InputSwitch::In1,
            tmux_pos: TestMuxTap::Avss,
            tmux_neg: TestMuxTap::Avss,
        }
    }

    fn transaction(&mut self, read: bool, addr: u8, data: u8) -> Result<u8> {
        let Self { bus, cs, .. } = self;
        bus.with(|spi| {
            cs.set_low().map_err(Error::pin)?;
            let result: Result<u8> = (|| {
                spi.write(&[addr | (u8::from(read) << 7)])?;
                let mut rx = [0u8];
                spi.transfer(&mut rx, &[data])?;
                Ok(rx[0])
            })();
            cs.set_high().map_err(Error::pin)?;
            let value = result?;
            log::trace!("pgia xfer: read={read} addr={addr:#04x} data={data:#04x} -> {value:#04x}");
            Ok(value)
        })
    }

    fn write(&mut self, addr: u8, data: u8) -> Result<()> {
        self.transaction(false, addr, data).map(|_| ())
    }

    fn read(&mut self, addr: u8) -> Result<u8> {
        self.transaction(true, addr, 0x00)
    }

    fn write_verified(&mut self, addr: u8, data: u8) -> Result<()> {
        self.write(addr, data)?;
        if self.read(addr)? != data {
            log::warn!("pgia register {addr:#04x} verify failed");
            return Err(Error::VerifyFailed);
        }
        Ok(())
    }

    /// Check the part identity, then configure GPIO3 as the fault output
    /// and route the fault interrupt to it. Fails before any configuration
    /// write if the identity register disagrees.
    pub fn init(&mut self) -> Result<()> {
        self.cs.set_high().map_err(Error::pin)?;
        let id = self.read(reg::DIE_REV_ID)?;
        if id != DEVICE_ID {
            return Err(Error::IdentityMismatch(id));
        }
        self.write(reg::GPIO_DIR, 1 << 3)?;
        self.write(reg::SF_CFG, 1 << 3)?;
        log::info!("pgia initialized");
        Ok(())
    }

    /// Program the input and output gain stages and return the combined
    /// linear gain. On failure the previous (input, output, gain) triple is
    /// restored before the error propagates.
    pub fn set_gain(&mut self, input: InputGain, output: OutputGain) -> Result<f32> {
        let previous = (self.gain_in, self.gain_out, self.gain);
        self.gain_in = input;
        self.gain_out = output;
        self.gain = input.multiplier() * output.multiplier();
        if let Err(e) = self.update(UpdateSet::Gain) {
            (self.gain_in, self.gain_out, self.gain) = previous;
            return Err(e);
        }
        Ok(self.gain)
    }

    /// Route the amplifier inputs. Shorting is all-or-nothing: requesting
    /// it for one side only is rejected before any bus traffic.
    pub fn set_switch(&mut self, pos: InputSwitch, neg: InputSwitch) -> Result<()> {
        if (pos == InputSwitch::Short) != (neg == InputSwitch::Short) {
            return Err(Error::InvalidArgument);
        }
        let previous = (self.switch_pos, self.switch_neg);
        self.switch_pos = pos;
        self.switch_neg = neg;
        if let Err(e) = self.update(UpdateSet::Switch) {
            (self.switch_pos, self.switch_neg) = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Select the reference taps driven onto the test multiplexer.
    pub fn set_test_mux(&mut self, pos: TestMuxTap, neg: TestMuxTap) -> Result<()> {
        let previous = (self.tmux_pos, self.tmux_neg);
        self.tmux_pos = pos;
        self.tmux_neg = neg;
        if let Err(e) = self.update(UpdateSet::TestMux) {
            (self.tmux_pos, self.tmux_neg) = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Committed linear gain.
    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Push one logical update to the part. Gain updates write the gain mux
    /// and the test mux together because the output-gain field spans both.
    fn update(&mut self, set: UpdateSet) -> Result<()> {
        let (gain_mux, input_mux, test_mux) = match set {
            UpdateSet::Gain => (true, false, true),
            UpdateSet::Switch => (false, true, false),
            UpdateSet::TestMux => (false, false, true),
        };
        if gain_mux {
            let data = ((self.gain_in as u8 & 0xF) << 3) | ((self.gain_out as u8 & 0x1) << 7);
            self.write_verified(reg::GAIN_MUX, data)?;
        }
        if input_mux {
            let data = if self.switch_pos == InputSwitch::Short {
                0x01
            } else {
                (1 << (self.switch_pos as u8 + 1)) | (1 << self.switch_neg as u8)
            };
            self.write_verified(reg::INPUT_MUX, data)?;
        }
        if test_mux {
            let data = (self.tmux_pos as u8 & 0x3)
                | ((self.tmux_neg as u8 & 0x3) << 2)
                | ((self.gain_out as u8 & 0x2) << 6);
            self.write_verified(reg::TEST_MUX, data)?;
        }
        Ok(())
    }
}
