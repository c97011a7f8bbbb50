//! Channel control layer.
//!
//! [`Smu`] owns the logical state of every channel (targets, clamps, range,
//! mode, measured values) and is the only writer of the PMU and amplifier
//! drivers. Setters convert physical units into DAC codes with safety
//! clamping, push them to hardware, and only then commit the logical state,
//! so a failed write never silently diverges the two.
//!
//! Range and mode changes are multi-step sequences whose write order bounds
//! the transient seen by the device under test; see [`Smu::set_range`] and
//! [`Smu::set_mode`]. A failure mid-sequence leaves the earlier verified
//! sub-writes committed.
//!
//! Every mutation marks its field in a per-channel dirty bitmap, drained at
//! a fixed tick by [`Smu::process`] into JSON updates for the attached sink.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::SpiBus;
use fugit::Duration;
use strum_macros::EnumIter;

use crate::ad5522::{Ad5522, Channel, ChannelState, ForceMode, PmuDac};
use crate::ad7177::{Ad7177, AdcInput, ReadyLine, Snapshot};
use crate::ada4254::{Ada4254, InputGain, OutputGain};
use crate::convert::{self, CurrentRange, DacRole, MeasChannel, VoltageClamps};
use crate::error::{Error, Result};
use crate::publish::{self, UpdateSink};

/// Number of populated logical channels. The hardware carries four PMU
/// channels; one is wired through the measurement chain today.
pub const SMU_CHANNELS: usize = 1;

/// Publish tick period.
pub const PUBLISH_INTERVAL: Duration<u32, 1, 1000> = Duration::<u32, 1, 1000>::millis(500);

/// Millisecond instants used to gate publishing.
pub type TickInstant = fugit::Instant<u32, 1, 1000>;

/// Nominal measurement-amplifier gain, also the fallback when the amplifier
/// cannot be programmed.
const DEFAULT_MV_GAIN: f32 = 0.5;

/// Logical channel output states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputState {
    #[default]
    Disabled,
    /// Powered but detached from the pin.
    Standby,
    Enabled,
}

/// Sense topology: regulate at the force pin or at the sense pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SenseMode {
    #[default]
    Local,
    Remote,
}

/// Published channel fields, one dirty bit each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
#[repr(u16)]
pub enum Field {
    ForcedVoltage = 0,
    ForcedCurrent = 1,
    MeasuredVoltage = 2,
    MeasuredCurrent = 3,
    ClampLowCurrent = 4,
    ClampHighCurrent = 5,
    ClampLowVoltage = 6,
    ClampHighVoltage = 7,
    Range = 8,
    State = 9,
    Mode = 10,
    Sense = 11,
}

impl Field {
    pub const ALL_MASK: u16 = 0x0FFF;

    pub fn mask(self) -> u16 {
        1 << self as u16
    }
}

/// Logical state of one channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelControlState {
    /// Forced voltage target, volts.
    pub fv: f32,
    /// Forced current target, amps.
    pub fi: f32,
    /// Measured voltage, volts.
    pub mv: f32,
    /// Measured current, amps.
    pub mi: f32,
    pub clli: f32,
    pub clhi: f32,
    pub cllv: f32,
    pub clhv: f32,
    pub range: CurrentRange,
    pub state: OutputState,
    pub mode: ForceMode,
    pub sense: SenseMode,
    /// Gain correction dividing the measured voltage (the amplifier's
    /// committed gain).
    pub mv_gain: f32,
    /// Display multiplier applied to measured current when publishing.
    pub mi_mult: f32,
}

impl Default for ChannelControlState {
    fn default() -> Self {
        Self {
            fv: 0.0,
            fi: 0.0,
            mv: 0.0,
            mi: 0.0,
            clli: -2.25e-3,
            clhi: 2.25e-3,
            cllv: -11.25,
            clhv: 11.25,
            range: CurrentRange::I2ma,
            state: OutputState::Disabled,
            mode: ForceMode::Voltage,
            sense: SenseMode::Local,
            mv_gain: DEFAULT_MV_GAIN,
            mi_mult: 1e3,
        }
    }
}

/// The control layer: logical channel state plus the force-side drivers.
pub struct Smu<'b, B, P, I, D> {
    pmu: Ad5522<'b, B, P, I, D>,
    amps: [Ada4254<'b, B, P>; SMU_CHANNELS],
    channels: [ChannelControlState; SMU_CHANNELS],
    dirty: [u16; SMU_CHANNELS],
    last_publish: TickInstant,
    publish_due: bool,
}

impl<'b, B, P, I, D> Smu<'b, B, P, I, D>
where
    B: SpiBus<u8>,
    P: OutputPin,
    I: InputPin,
    D: DelayNs,
{
    pub fn new(pmu: Ad5522<'b, B, P, I, D>, amps: [Ada4254<'b, B, P>; SMU_CHANNELS]) -> Self {
        Self {
            pmu,
            amps,
            channels: [ChannelControlState::default(); SMU_CHANNELS],
            dirty: [Field::ALL_MASK; SMU_CHANNELS],
            last_publish: TickInstant::from_ticks(0),
            publish_due: false,
        }
    }

    fn index(ch: Channel) -> Result<usize> {
        let idx = ch.index();
        if idx < SMU_CHANNELS {
            Ok(idx)
        } else {
            Err(Error::InvalidArgument)
        }
    }

    /// Bring up the force and measure paths with safe defaults and mark
    /// everything for publication.
    ///
    /// A PMU failure aborts; an amplifier failure only costs the gain
    /// correction, which falls back to its nominal value.
    pub fn init(&mut self, now: TickInstant) -> Result<()> {
        self.last_publish = now;
        self.publish_due = false;
        for (state, dirty) in self.channels.iter_mut().zip(&mut self.dirty) {
            *state = ChannelControlState::default();
            *dirty = Field::ALL_MASK;
        }

        self.pmu.init()?;

        for (amp, state) in self.amps.iter_mut().zip(&mut self.channels) {
            // Half gain keeps the clamped force span inside the converter.
            state.mv_gain = match amp
                .init()
                .and_then(|()| amp.set_gain(InputGain::X0p5, OutputGain::X1))
            {
                Ok(gain) => gain,
                Err(e) => {
                    log::warn!("measurement amplifier setup failed: {e}");
                    DEFAULT_MV_GAIN
                }
            };
        }
        Ok(())
    }

    /// Current logical state of a channel.
    pub fn channel(&self, ch: Channel) -> Option<&ChannelControlState> {
        self.channels.get(ch.index())
    }

    /// Set the channel output state.
    pub fn set_state(&mut self, ch: Channel, state: OutputState) -> Result<()> {
        let idx = Self::index(ch)?;
        let hw = match state {
            OutputState::Disabled => ChannelState::Disabled,
            OutputState::Standby => ChannelState::HiZ,
            OutputState::Enabled => ChannelState::Enabled,
        };
        self.pmu.set_channel_state(ch, hw)?;
        self.channels[idx].state = state;
        self.dirty[idx] |= Field::State.mask();
        Ok(())
    }

    /// Switch the force mode.
    ///
    /// No-op when unchanged. Otherwise the stored force target and the
    /// clamp pair protecting the *new* mode are pushed to hardware before
    /// the mode-select write, so the part never runs the new mode with
    /// stale levels.
    pub fn set_mode(&mut self, ch: Channel, mode: ForceMode) -> Result<()> {
        let idx = Self::index(ch)?;
        if self.channels[idx].mode == mode {
            return Ok(());
        }
        match mode {
            ForceMode::Voltage => {
                self.set_dac(ch, DacRole::ForceVoltage, self.channels[idx].fv)?;
                self.set_dac(ch, DacRole::ClampLowCurrent, self.channels[idx].clli)?;
                self.set_dac(ch, DacRole::ClampHighCurrent, self.channels[idx].clhi)?;
            }
            ForceMode::Current => {
                self.set_dac(ch, DacRole::ForceCurrent, self.channels[idx].fi)?;
                self.set_dac(ch, DacRole::ClampLowVoltage, self.channels[idx].cllv)?;
                self.set_dac(ch, DacRole::ClampHighVoltage, self.channels[idx].clhv)?;
            }
        }
        self.pmu.set_mode(ch, mode)?;
        self.channels[idx].mode = mode;
        self.dirty[idx] |= Field::Mode.mask();
        Ok(())
    }

    /// Change the current range.
    ///
    /// A given DAC code stands for more current in a larger range, so the
    /// write order bounds the transient:
    /// * force-voltage, growing: both current clamps are reprogrammed for
    ///   the new range *before* the range select;
    /// * force-voltage, shrinking: the clamps follow *after* the select;
    /// * force-current: the force DAC is recomputed for the new range ahead
    ///   of the select; when both ranges are external the code is staged at
    ///   the most conservative external scale first and the true code lands
    ///   after the select.
    pub fn set_range(&mut self, ch: Channel, range: CurrentRange) -> Result<()> {
        let idx = Self::index(ch)?;
        let from = self.channels[idx].range;
        let mode = self.channels[idx].mode;

        if mode == ForceMode::Voltage && range > from {
            self.program_clamp(ch, DacRole::ClampLowCurrent, range)?;
            self.program_clamp(ch, DacRole::ClampHighCurrent, range)?;
        }

        let mut deferred_code = None;
        if mode == ForceMode::Current {
            let state = self.channels[idx];
            let vclamps = VoltageClamps {
                low: state.cllv,
                high: state.clhv,
            };
            let setting = convert::value_to_code(DacRole::ForceCurrent, range, vclamps, state.fi);
            if range.is_external() && from.is_external() {
                let staged = convert::value_to_code(
                    DacRole::ForceCurrent,
                    CurrentRange::I200ma,
                    vclamps,
                    setting.value,
                );
                self.pmu.set_dac(ch, range.fi_dac(), staged.code)?;
                deferred_code = Some(setting.code);
            } else {
                self.pmu.set_dac(ch, range.fi_dac(), setting.code)?;
            }
            self.channels[idx].fi = setting.value;
            self.dirty[idx] |= Field::ForcedCurrent.mask();
        }

        self.pmu.set_range(ch, range.pmu_range())?;
        if range.is_external() {
            // Extension point: the external-stage relay selection belongs
            // here once the output board defines it.
        }

        if mode == ForceMode::Voltage && range < from {
            self.program_clamp(ch, DacRole::ClampLowCurrent, range)?;
            self.program_clamp(ch, DacRole::ClampHighCurrent, range)?;
        }

        if let Some(code) = deferred_code {
            self.pmu.set_dac(ch, range.fi_dac(), code)?;
        }

        self.channels[idx].range = range;
        self.channels[idx].mi_mult = range.display_multiplier();
        self.dirty[idx] |= Field::Range.mask();
        Ok(())
    }

    /// Reprogram a current clamp for a new range and commit the level it
    /// lands on.
    fn program_clamp(&mut self, ch: Channel, role: DacRole, range: CurrentRange) -> Result<()> {
        let idx = ch.index();
        let state = self.channels[idx];
        let requested = if role == DacRole::ClampLowCurrent {
            state.clli
        } else {
            state.clhi
        };
        let setting = convert::value_to_code(
            role,
            range,
            VoltageClamps {
                low: state.cllv,
                high: state.clhv,
            },
            requested,
        );
        if role == DacRole::ClampLowCurrent {
            self.pmu.set_dac(ch, PmuDac::Clli, setting.code)?;
            self.channels[idx].clli = setting.value;
            self.dirty[idx] |= Field::ClampLowCurrent.mask();
        } else {
            self.pmu.set_dac(ch, PmuDac::Clhi, setting.code)?;
            self.channels[idx].clhi = setting.value;
            self.dirty[idx] |= Field::ClampHighCurrent.mask();
        }
        Ok(())
    }

    /// Program one of the channel's DAC roles in physical units.
    ///
    /// The value committed (and later published) is the one the conversion
    /// actually programmed after guard and window clamping.
    pub fn set_dac(&mut self, ch: Channel, role: DacRole, value: f32) -> Result<()> {
        let idx = Self::index(ch)?;
        let state = self.channels[idx];
        let setting = convert::value_to_code(
            role,
            state.range,
            VoltageClamps {
                low: state.cllv,
                high: state.clhv,
            },
            value,
        );
        let dac = match role {
            DacRole::ForceCurrent => state.range.fi_dac(),
            DacRole::ForceVoltage => PmuDac::Fv,
            DacRole::ClampLowVoltage => PmuDac::Cllv,
            DacRole::ClampHighVoltage => PmuDac::Clhv,
            DacRole::ClampLowCurrent => PmuDac::Clli,
            DacRole::ClampHighCurrent => PmuDac::Clhi,
        };
        self.pmu.set_dac(ch, dac, setting.code)?;

        let state = &mut self.channels[idx];
        let field = match role {
            DacRole::ForceCurrent => {
                state.fi = setting.value;
                Field::ForcedCurrent
            }
            DacRole::ForceVoltage => {
                state.fv = setting.value;
                Field::ForcedVoltage
            }
            DacRole::ClampLowVoltage => {
                state.cllv = setting.value;
                Field::ClampLowVoltage
            }
            DacRole::ClampHighVoltage => {
                state.clhv = setting.value;
                Field::ClampHighVoltage
            }
            DacRole::ClampLowCurrent => {
                state.clli = setting.value;
                Field::ClampLowCurrent
            }
            DacRole::ClampHighCurrent => {
                state.clhi = setting.value;
                Field::ClampHighCurrent
            }
        };
        self.dirty[idx] |= field.mask();
        Ok(())
    }

    /// Select the sense topology. Logical state only: nothing in the force
    /// path is driven by it.
    pub fn set_sense(&mut self, ch: Channel, sense: SenseMode) -> Result<()> {
        let idx = Self::index(ch)?;
        self.channels[idx].sense = sense;
        self.dirty[idx] |= Field::Sense.mask();
        Ok(())
    }

    /// Fold a completed acquisition group into the measured fields. Even
    /// converter channels carry a channel's voltage, odd ones its current.
    pub fn ingest(&mut self, snapshot: &Snapshot) {
        for k in 0..SMU_CHANNELS * 2 {
            if snapshot.valid & (1 << k) == 0 {
                continue;
            }
            let idx = k / 2;
            let state = &mut self.channels[idx];
            let code = snapshot.samples[k];
            if k % 2 == 0 {
                state.mv =
                    convert::code_to_value(MeasChannel::Voltage, state.range, code) / state.mv_gain;
                self.dirty[idx] |= Field::MeasuredVoltage.mask();
            } else {
                state.mi = convert::code_to_value(MeasChannel::Current, state.range, code);
                self.dirty[idx] |= Field::MeasuredCurrent.mask();
            }
        }
    }

    /// Mark every field of every channel dirty and let the next
    /// [`Smu::process`] call publish immediately. Used when a new observer
    /// attaches.
    pub fn queue_full_update(&mut self) {
        for dirty in &mut self.dirty {
            *dirty = Field::ALL_MASK;
        }
        self.publish_due = true;
    }

    /// Time-gated publish: at most once per [`PUBLISH_INTERVAL`], serialize
    /// each channel's dirty fields to the sink and clear its bitmap.
    pub fn process<S: UpdateSink>(&mut self, now: TickInstant, sink: &mut S) {
        let due = self.publish_due
            || now
                .checked_duration_since(self.last_publish)
                .is_some_and(|elapsed| elapsed > PUBLISH_INTERVAL);
        if !due {
            return;
        }
        self.publish_due = false;
        self.last_publish = now;

        for idx in 0..SMU_CHANNELS {
            if self.dirty[idx] == 0 {
                continue;
            }
            publish::publish_channel(idx as u8, self.dirty[idx], &self.channels[idx], sink);
            self.dirty[idx] = 0;
        }
    }
}

/// Wire the converter inputs for the measurement chain: channel 0 reads the
/// amplified channel voltage, channel 1 the current-sense output.
pub fn configure_measurement<B: SpiBus<u8>, L: ReadyLine>(
    adc: &mut Ad7177<'_, B, L>,
) -> Result<()> {
    adc.configure_channel(0, AdcInput::Ain0, AdcInput::Ain1, true)?;
    adc.configure_channel(1, AdcInput::Ain2, AdcInput::Ain3, true)?;
    Ok(())
}
