//! Driver for the AD5522 quad per-pin parametric measurement unit.
//!
//! The PMU is the force side of the instrument: each channel sources a
//! programmed voltage or current, clamps the complementary quantity, and
//! routes the selected measurement to its MEASOUT pin. Control traffic is a
//! 29-bit frame `[R/W:1][CH:4][MODE:2][DATA:22]` shifted MSB first across
//! four bytes; the chip select toggles high between the command frame and
//! the readback frame, and an active-low busy line gates every transaction.
//!
//! The driver keeps a local image of the system register and of each
//! channel register. Every register write is followed by a readback compare
//! and the image is only committed once the compare passes, so the images
//! always reflect verified hardware state.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::SpiBus;
use modular_bitfield::prelude::*;

use crate::bus::ControlBus;
use crate::error::{Error, Result};

/// Bound on the busy wait, in 1 ms polls.
const BUSY_POLL_MS: u8 = 5;

/// Frame mode bits. `0b01`/`0b10` address the offset and gain calibration
/// DACs, which this driver does not program.
const MODE_REG: u8 = 0b00;
const MODE_DAC: u8 = 0b11;

/// Readback masks: the system word echoes all 24 bits, the channel word
/// carries live alarm status in its low bits, DAC reads return the code in
/// the low 16 bits.
const SYSCTRL_VERIFY_MASK: u32 = 0xFF_FFFF;
const PMUCTRL_VERIFY_MASK: u32 = 0xFF_FF80;

/// Physical PMU channels. The frame addresses channels one-hot, so several
/// can be written at once; this driver always addresses exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Channel {
    Ch0 = 0,
    Ch1 = 1,
    Ch2 = 2,
    Ch3 = 3,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Ch0, Channel::Ch1, Channel::Ch2, Channel::Ch3];

    pub fn index(self) -> usize {
        self as usize
    }

    fn mask(self) -> u8 {
        1 << self as u8
    }
}

impl TryFrom<u8> for Channel {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Channel::Ch0),
            1 => Ok(Channel::Ch1),
            2 => Ok(Channel::Ch2),
            3 => Ok(Channel::Ch3),
            _ => Err(Error::InvalidArgument),
        }
    }
}

/// Force regulation modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceMode {
    /// Regulate the output voltage; current floats inside the clamps.
    Voltage,
    /// Regulate the output current; voltage floats inside the clamps.
    Current,
}

/// Channel output states accepted by [`Ad5522::set_channel_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Channel powered down and high impedance.
    Disabled,
    /// Force amplifier detached from the pin; channel stays powered.
    HiZ,
    /// Channel powered and forcing.
    Enabled,
}

/// Range-select encodings for the channel register (bits 17:15).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PmuRange {
    I5ua = 0,
    I20ua = 1,
    I200ua = 2,
    I2ma = 3,
    /// External output stage; the EXTFORCE pin carries the current.
    External = 4,
    /// Reserved encoding, rejected by [`Ad5522::set_range`].
    ExtAlwaysOff = 5,
    /// Reserved encoding, rejected by [`Ad5522::set_range`].
    ExtAlwaysOn = 6,
}

/// DAC sub-addresses. One force-current DAC exists per range so a range
/// change can be staged without rewriting the active code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PmuDac {
    Fi5ua = 0x08,
    Fi20ua = 0x09,
    Fi200ua = 0x0A,
    Fi2ma = 0x0B,
    FiExt = 0x0C,
    Fv = 0x0D,
    Clli = 0x14,
    Cllv = 0x15,
    Clhi = 0x1C,
    Clhv = 0x1D,
}

/// Measurement-output gain select (system register bits 7:6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MeasOutGain {
    Full = 0,
    /// 0.2x attenuation, keeping the full force span inside the converter.
    Attenuated = 2,
}

/// Measurement-output source select (channel register bits 14:13).
#[derive(BitfieldSpecifier, Debug, Clone, Copy, PartialEq, Eq)]
#[bits = 2]
pub enum MeasOut {
    CurrentSense = 0,
    VoltageSense = 1,
    Thermal = 2,
    HighZ = 3,
}

/// System control register image, written as one atomic 24-bit word.
///
/// The per-channel clamp and comparator-output enables live in this word
/// even though they are channel properties; [`Ad5522::write_system_control`]
/// gathers them from the channel images.
#[bitfield(bits = 24)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemControl {
    #[skip]
    __: B2,
    pub alarm_latch_en: bool,
    pub tsd_threshold: B2,
    pub tsd_en: bool,
    pub meas_gain: B2,
    pub guard_en: bool,
    pub int_sense_en: bool,
    pub clamp_alarm_en: bool,
    pub guard_alarm_en: bool,
    pub dutgnd_en: bool,
    pub cmp_en: bool,
    pub cmp_out_en: B4,
    pub clamp_en: B4,
    #[skip]
    __: B2,
}

/// Per-channel control register image.
///
/// Bit 6 clears the latched alarm on write and reads back as the latched
/// alarm flag; bit 5 reads back as the unlatched flag. Verification masks
/// the low seven bits out.
#[bitfield(bits = 24)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelControl {
    #[skip]
    __: B5,
    pub alarm_unlatched: bool,
    pub alarm_clear: bool,
    pub cmp_fv_en: bool,
    pub cmp_out_en: bool,
    pub clamp_en: bool,
    pub sys_sense_en: bool,
    pub sys_force_en: bool,
    pub dac_en: bool,
    pub meas_out: MeasOut,
    pub range: B3,
    #[skip]
    __: B1,
    pub force_current: bool,
    pub hiz_en: bool,
    pub ch_en: bool,
    #[skip]
    __: B2,
}

impl SystemControl {
    fn word(self) -> u32 {
        let b = self.into_bytes();
        u32::from_le_bytes([b[0], b[1], b[2], 0])
    }
}

impl ChannelControl {
    fn word(self) -> u32 {
        let b = self.into_bytes();
        u32::from_le_bytes([b[0], b[1], b[2], 0])
    }
}

/// PMU driver instance. Owns the register images, the select/reset pins and
/// the busy line; borrows the shared control bus for transactions.
pub struct Ad5522<'b, B, P, I, D> {
    bus: &'b ControlBus<B>,
    cs: P,
    reset: P,
    busy: I,
    delay: D,
    sysctrl: SystemControl,
    chctrl: [ChannelControl; 4],
}

impl<'b, B, P, I, D> Ad5522<'b, B, P, I, D>
where
    B: SpiBus<u8>,
    P: OutputPin,
    I: InputPin,
    D: DelayNs,
{
    /// Wrap the bus handle and pins. Register images start zeroed; call
    /// [`Ad5522::init`] to reset the part and load the defaults.
    pub fn new(bus: &'b ControlBus<B>, cs: P, reset: P, busy: I, delay: D) -> Self {
        Self {
            bus,
            cs,
            reset,
            busy,
            delay,
            sysctrl: SystemControl::new(),
            chctrl: [ChannelControl::new(); 4],
        }
    }

    /// One full bus transaction: shift the frame out, toggle the select to
    /// latch the direction, optionally shift the 24-bit readback in, then
    /// wait for busy to return high.
    ///
    /// Fails with [`Error::Busy`] if the line does not settle within the
    /// poll bound; the caller decides whether to retry. The select is
    /// released on every exit path.
    pub fn transact(&mut self, read: bool, ch_mask: u8, mode: u8, data: u32) -> Result<u32> {
        let Self {
            bus,
            cs,
            busy,
            delay,
            ..
        } = self;
        bus.with(|spi| {
            let word = (u32::from(read) << 28)
                | (u32::from(ch_mask & 0xF) << 24)
                | (u32::from(mode & 0x3) << 22)
                | (data & 0x3F_FFFF);
            cs.set_low().map_err(Error::pin)?;
            let result: Result<u32> = (|| {
                spi.write(&word.to_be_bytes())?;
                cs.set_high().map_err(Error::pin)?;
                delay.delay_us(1);
                cs.set_low().map_err(Error::pin)?;
                let mut value = 0;
                if read {
                    let mut rx = [0u8; 3];
                    spi.read(&mut rx)?;
                    value = u32::from_be_bytes([0, rx[0], rx[1], rx[2]]);
                }
                let mut settled = false;
                for _ in 0..BUSY_POLL_MS {
                    if busy.is_high().map_err(Error::pin)? {
                        settled = true;
                        break;
                    }
                    delay.delay_ms(1);
                }
                if !settled {
                    return Err(Error::Busy);
                }
                Ok(value)
            })();
            cs.set_high().map_err(Error::pin)?;
            let value = result?;
            log::trace!(
                "pmu frame: read={read} ch={ch_mask:#03x} mode={mode} data={data:#08x} -> {value:#08x}"
            );
            Ok(value)
        })
    }

    fn write_frame(&mut self, ch_mask: u8, mode: u8, addr: u8, data: u32) -> Result<()> {
        let data = if mode == MODE_REG {
            data
        } else {
            (u32::from(addr & 0x3F) << 16) | (data & 0xFFFF)
        };
        self.transact(false, ch_mask, mode, data)?;
        Ok(())
    }

    fn read_frame(&mut self, ch_mask: u8, mode: u8, addr: u8) -> Result<u32> {
        let data = if mode == MODE_REG {
            0
        } else {
            u32::from(addr & 0x3F) << 16
        };
        self.transact(true, ch_mask, mode, data)
    }

    /// Wait for the busy line to return high, outside any bus transaction.
    fn wait_ready(&mut self) -> Result<()> {
        for _ in 0..BUSY_POLL_MS {
            if self.busy.is_high().map_err(Error::pin)? {
                return Ok(());
            }
            self.delay.delay_ms(1);
        }
        Err(Error::Busy)
    }

    /// Write a candidate system image and commit it once the readback
    /// matches. The per-channel clamp/comparator enables are gathered from
    /// the channel images at write time.
    fn apply_system_control(&mut self, image: SystemControl) -> Result<()> {
        let mut clamp = 0u8;
        let mut cmp = 0u8;
        for (i, ch) in self.chctrl.iter().enumerate() {
            clamp |= (ch.clamp_en() as u8) << i;
            cmp |= (ch.cmp_out_en() as u8) << i;
        }
        let image = image.with_clamp_en(clamp).with_cmp_out_en(cmp);
        let word = image.word();
        self.write_frame(0, MODE_REG, 0, word)?;
        let read = self.read_frame(0, MODE_REG, 0)?;
        if (read ^ word) & SYSCTRL_VERIFY_MASK != 0 {
            log::warn!("pmu sysctrl verify failed: wrote {word:#08x}, read {read:#08x}");
            return Err(Error::VerifyFailed);
        }
        self.sysctrl = image;
        Ok(())
    }

    fn apply_pmu_control(&mut self, ch: Channel, image: ChannelControl) -> Result<()> {
        let word = image.word();
        self.write_frame(ch.mask(), MODE_REG, 0, word)?;
        let read = self.read_frame(ch.mask(), MODE_REG, 0)?;
        if (read ^ word) & PMUCTRL_VERIFY_MASK != 0 {
            log::warn!(
                "pmu ch{} verify failed: wrote {word:#08x}, read {read:#08x}",
                ch.index()
            );
            return Err(Error::VerifyFailed);
        }
        self.chctrl[ch.index()] = image;
        Ok(())
    }

    /// Rewrite the system register from the current images.
    pub fn write_system_control(&mut self) -> Result<()> {
        self.apply_system_control(self.sysctrl)
    }

    /// Rewrite a channel register from its current image.
    pub fn write_pmu_control(&mut self, ch: Channel) -> Result<()> {
        self.apply_pmu_control(ch, self.chctrl[ch.index()])
    }

    /// Reset the part and bring both register classes to their defaults:
    /// measurement output attenuated, thermal shutdown on, every channel
    /// hi-Z in force-voltage on the 2 mA range with DAC and clamp enabled.
    pub fn init(&mut self) -> Result<()> {
        self.reset.set_low().map_err(Error::pin)?;
        self.delay.delay_us(10);
        self.reset.set_high().map_err(Error::pin)?;
        self.cs.set_high().map_err(Error::pin)?;

        // Busy rises once the power-on reset completes.
        self.wait_ready()?;

        self.sysctrl = SystemControl::new();
        self.chctrl = [ChannelControl::new(); 4];
        let sys = SystemControl::new()
            .with_meas_gain(MeasOutGain::Attenuated as u8)
            .with_tsd_en(true);
        self.apply_system_control(sys)?;

        for ch in Channel::ALL {
            let image = ChannelControl::new()
                .with_hiz_en(true)
                .with_range(PmuRange::I2ma as u8)
                .with_meas_out(MeasOut::CurrentSense)
                .with_dac_en(true)
                .with_clamp_en(true);
            self.apply_pmu_control(ch, image)?;
        }
        log::info!("pmu initialized");
        Ok(())
    }

    /// Set a channel's output state.
    pub fn set_channel_state(&mut self, ch: Channel, state: ChannelState) -> Result<()> {
        let mut image = self.chctrl[ch.index()];
        match state {
            ChannelState::Disabled => {
                image.set_ch_en(false);
                image.set_hiz_en(true);
            }
            ChannelState::HiZ => image.set_hiz_en(true),
            ChannelState::Enabled => {
                image.set_ch_en(true);
                image.set_hiz_en(false);
            }
        }
        self.apply_pmu_control(ch, image)
    }

    /// Select force-voltage or force-current regulation.
    pub fn set_mode(&mut self, ch: Channel, mode: ForceMode) -> Result<()> {
        let mut image = self.chctrl[ch.index()];
        image.set_force_current(matches!(mode, ForceMode::Current));
        self.apply_pmu_control(ch, image)
    }

    /// Select the current range. The reserved always-off/always-on
    /// encodings are rejected before any bus traffic.
    pub fn set_range(&mut self, ch: Channel, range: PmuRange) -> Result<()> {
        if matches!(range, PmuRange::ExtAlwaysOff | PmuRange::ExtAlwaysOn) {
            return Err(Error::InvalidArgument);
        }
        let mut image = self.chctrl[ch.index()];
        image.set_range(range as u8);
        self.apply_pmu_control(ch, image)
    }

    /// Load one of the channel's DACs and verify the code stuck.
    pub fn set_dac(&mut self, ch: Channel, dac: PmuDac, code: u16) -> Result<()> {
        self.write_frame(ch.mask(), MODE_DAC, dac as u8, code.into())?;
        let read = self.read_frame(ch.mask(), MODE_DAC, dac as u8)?;
        if read & 0xFFFF != u32::from(code) {
            log::warn!(
                "pmu ch{} dac {dac:?} verify failed: wrote {code:#06x}, read {read:#08x}",
                ch.index()
            );
            return Err(Error::VerifyFailed);
        }
        Ok(())
    }

    /// Latching a channel into the always-on external range needs the
    /// dedicated enable sequence from the datasheet, which is not wired up.
    /// Always fails until it is.
    // TODO: implement the EXTFORCE always-on enable sequence once an output
    // board routes the EXTMEASIH/IL pins.
    pub fn external_range_always_on(&mut self, _ch: Channel) -> Result<()> {
        Err(Error::InvalidArgument)
    }
}
