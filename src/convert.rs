//! Unit-to-code and code-to-unit conversion for the force and measure
//! paths.
//!
//! Everything here is pure math over the range tables: no hardware access,
//! so the clamping and scaling rules are testable on their own. The force
//! DACs are 16-bit; measured values come back as 24-bit converter codes.

use num_traits::float::FloatCore;
use strum_macros::EnumIter;

use crate::ad5522::{PmuDac, PmuRange};
use crate::error::{Error, Result};

/// DAC output span in volts (4.5 x the 5 V reference).
const DAC_SPAN: f32 = 4.5 * 5.0;
const DAC_STEPS: f32 = 65536.0;
/// Factory-trimmed mid-scale offset code of the voltage channel.
const VDAC_OFFSET_CODE: f32 = 42130.0;

/// Converter reference and full-scale code.
const ADC_REF: f32 = 5.0;
const ADC_STEPS: f32 = ((1u32 << 24) - 1) as f32;

/// Voltage force/clamp window.
const V_SPAN: f32 = 10.0;
/// A current clamp may not sit within this sense voltage of zero.
const CLAMP_I_GUARD: f32 = 0.25;
/// Voltage clamps keep at least this separation.
const CLAMP_V_GUARD: f32 = 0.5;

/// Current ranges, smallest to largest. The first four are native PMU
/// ranges; the top two run through the external output stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, EnumIter)]
#[repr(u8)]
pub enum CurrentRange {
    I5ua,
    I20ua,
    I200ua,
    I2ma,
    I20ma,
    I200ma,
}

impl CurrentRange {
    /// Full-scale current bound, in amps.
    pub fn full_scale(self) -> f32 {
        match self {
            CurrentRange::I5ua => 5e-6,
            CurrentRange::I20ua => 20e-6,
            CurrentRange::I200ua => 200e-6,
            CurrentRange::I2ma => 2e-3,
            CurrentRange::I20ma => 20e-3,
            CurrentRange::I200ma => 200e-3,
        }
    }

    /// Sense resistance converting the channel current into a measurable
    /// voltage, in ohms.
    pub fn sense_resistance(self) -> f32 {
        match self {
            CurrentRange::I5ua => 200e3,
            CurrentRange::I20ua => 50e3,
            CurrentRange::I200ua => 5e3,
            CurrentRange::I2ma => 500.0,
            CurrentRange::I20ma => 50.0,
            CurrentRange::I200ma => 5.0,
        }
    }

    /// Whether the range runs through the external output stage.
    pub fn is_external(self) -> bool {
        self >= CurrentRange::I20ma
    }

    /// Display multiplier applied to measured current before publishing.
    pub fn display_multiplier(self) -> f32 {
        if self <= CurrentRange::I200ua { 1e6 } else { 1e3 }
    }

    /// Range-select encoding for the PMU channel register.
    pub fn pmu_range(self) -> PmuRange {
        match self {
            CurrentRange::I5ua => PmuRange::I5ua,
            CurrentRange::I20ua => PmuRange::I20ua,
            CurrentRange::I200ua => PmuRange::I200ua,
            CurrentRange::I2ma => PmuRange::I2ma,
            CurrentRange::I20ma | CurrentRange::I200ma => PmuRange::External,
        }
    }

    /// The force-current DAC serving this range.
    pub fn fi_dac(self) -> PmuDac {
        match self {
            CurrentRange::I5ua => PmuDac::Fi5ua,
            CurrentRange::I20ua => PmuDac::Fi20ua,
            CurrentRange::I200ua => PmuDac::Fi200ua,
            CurrentRange::I2ma => PmuDac::Fi2ma,
            CurrentRange::I20ma | CurrentRange::I200ma => PmuDac::FiExt,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CurrentRange::I5ua => "5UA",
            CurrentRange::I20ua => "20UA",
            CurrentRange::I200ua => "200UA",
            CurrentRange::I2ma => "2MA",
            CurrentRange::I20ma => "20MA",
            CurrentRange::I200ma => "200MA",
        }
    }

    pub fn unit_label(self) -> &'static str {
        if self <= CurrentRange::I200ua { "uA" } else { "mA" }
    }
}

impl TryFrom<u8> for CurrentRange {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CurrentRange::I5ua),
            1 => Ok(CurrentRange::I20ua),
            2 => Ok(CurrentRange::I200ua),
            3 => Ok(CurrentRange::I2ma),
            4 => Ok(CurrentRange::I20ma),
            5 => Ok(CurrentRange::I200ma),
            _ => Err(Error::InvalidArgument),
        }
    }
}

/// The six per-channel DAC roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum DacRole {
    ForceCurrent,
    ForceVoltage,
    ClampLowVoltage,
    ClampHighVoltage,
    ClampLowCurrent,
    ClampHighCurrent,
}

impl DacRole {
    pub fn is_current(self) -> bool {
        matches!(
            self,
            DacRole::ForceCurrent | DacRole::ClampLowCurrent | DacRole::ClampHighCurrent
        )
    }

    fn is_clamp(self) -> bool {
        matches!(
            self,
            DacRole::ClampLowVoltage
                | DacRole::ClampHighVoltage
                | DacRole::ClampLowCurrent
                | DacRole::ClampHighCurrent
        )
    }
}

/// Which quantity an ADC channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasChannel {
    Voltage,
    Current,
}

/// The channel's programmed voltage-clamp pair, needed for the separation
/// rule when reprogramming either clamp.
#[derive(Debug, Clone, Copy)]
pub struct VoltageClamps {
    pub low: f32,
    pub high: f32,
}

/// Result of a value-to-code conversion: the level actually programmed
/// (after guard and window clamping) and its DAC code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DacSetting {
    pub value: f32,
    pub code: u16,
}

/// Map a requested level onto a 16-bit DAC code.
///
/// The request is first pulled inside the role's guard rules (current
/// clamps keep off the zero crossing, voltage clamps keep their minimum
/// separation), then clamped into the range window widened by the role's
/// over-range allowance, and finally quantized with round-to-nearest and
/// saturation. Violations are clamped to the nearest legal level, never
/// rejected.
pub fn value_to_code(
    role: DacRole,
    range: CurrentRange,
    vclamps: VoltageClamps,
    value: f32,
) -> DacSetting {
    let rsense = range.sense_resistance();
    let (mut lo, mut hi) = if role.is_current() {
        (-range.full_scale(), range.full_scale())
    } else {
        (-V_SPAN, V_SPAN)
    };

    let mut value = value;
    match role {
        DacRole::ClampLowCurrent if value * rsense + CLAMP_I_GUARD > 0.0 => {
            value = -CLAMP_I_GUARD / rsense;
        }
        DacRole::ClampHighCurrent if value * rsense - CLAMP_I_GUARD < 0.0 => {
            value = CLAMP_I_GUARD / rsense;
        }
        DacRole::ClampLowVoltage if vclamps.high - value < CLAMP_V_GUARD => {
            value = vclamps.high - CLAMP_V_GUARD;
        }
        DacRole::ClampHighVoltage if value - vclamps.low < CLAMP_V_GUARD => {
            value = vclamps.low + CLAMP_V_GUARD;
        }
        _ => {}
    }

    // Clamp DACs may run 12.5% past the window, force DACs 5%.
    let over = if role.is_clamp() {
        (hi - lo) * 1.125 / 2.0
    } else {
        (hi - lo) * 1.05 / 2.0
    };
    lo -= over;
    hi += over;
    let value = value.clamp(lo, hi);

    let calibrated = calibrate(value);
    let code = if role.is_current() {
        calibrated * rsense * 10.0 / DAC_SPAN * DAC_STEPS + 32768.0
    } else {
        (calibrated + 3.5 * 5.0 * VDAC_OFFSET_CODE / DAC_STEPS) / DAC_SPAN * DAC_STEPS
    };
    DacSetting {
        value,
        code: FloatCore::round(code).clamp(0.0, DAC_STEPS - 1.0) as u16,
    }
}

/// Per-code calibration hook, applied between clamping and quantization.
// TODO: fold in measured DAC gain/offset corrections once a calibration
// procedure produces them.
fn calibrate(value: f32) -> f32 {
    value
}

/// Decode a 24-bit converter code into volts, or amps on a current
/// channel.
pub fn code_to_value(meas: MeasChannel, range: CurrentRange, code: u32) -> f32 {
    let v = 2.0 * ADC_REF * (code as f32 / ADC_STEPS - 0.5);
    match meas {
        MeasChannel::Voltage => v,
        MeasChannel::Current => (v - 0.45 * 5.0) / (0.2 * 10.0 * range.sense_resistance()),
    }
}
