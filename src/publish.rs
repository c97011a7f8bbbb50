//! Outbound state-change notifications.
//!
//! Changed channel fields are batched into one JSON object per channel and
//! handed to the integrator's sink (the surrounding system forwards them to
//! its UI push channel). Only fields whose dirty bit is set appear in the
//! payload; enum-valued fields go out as their display strings.

use serde::Serialize;

use crate::ad5522::ForceMode;
use crate::smu::{ChannelControlState, Field, OutputState, SenseMode};

/// Destination for serialized channel updates.
pub trait UpdateSink {
    fn send(&mut self, payload: &str);
}

/// Payload buffer bound; a full 13-field update fits comfortably.
const PAYLOAD_CAPACITY: usize = 512;

#[derive(Serialize)]
struct ChannelUpdate {
    #[serde(rename = "type")]
    kind: &'static str,
    ch: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    fv: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fi: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mv: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mi: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    clli: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    clhi: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cllv: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    clhv: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    range: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sense: Option<&'static str>,
}

fn state_label(state: OutputState) -> &'static str {
    match state {
        OutputState::Disabled => "DISABLE",
        OutputState::Standby => "STANDBY",
        OutputState::Enabled => "ENABLE",
    }
}

fn mode_label(mode: ForceMode) -> &'static str {
    match mode {
        ForceMode::Voltage => "FV",
        ForceMode::Current => "FI",
    }
}

fn sense_label(sense: SenseMode) -> &'static str {
    match sense {
        SenseMode::Local => "LOCAL",
        SenseMode::Remote => "REMOTE",
    }
}

/// Serialize one channel's dirty fields and hand them to the sink.
///
/// Measured current goes out scaled by the channel's display multiplier;
/// every other value is published in base units.
pub(crate) fn publish_channel<S: UpdateSink>(
    ch: u8,
    dirty: u16,
    state: &ChannelControlState,
    sink: &mut S,
) {
    let set = |field: Field| dirty & field.mask() != 0;
    let update = ChannelUpdate {
        kind: "smu",
        ch,
        fv: set(Field::ForcedVoltage).then_some(state.fv),
        fi: set(Field::ForcedCurrent).then_some(state.fi),
        mv: set(Field::MeasuredVoltage).then_some(state.mv),
        mi: set(Field::MeasuredCurrent).then_some(state.mi * state.mi_mult),
        clli: set(Field::ClampLowCurrent).then_some(state.clli),
        clhi: set(Field::ClampHighCurrent).then_some(state.clhi),
        cllv: set(Field::ClampLowVoltage).then_some(state.cllv),
        clhv: set(Field::ClampHighVoltage).then_some(state.clhv),
        range: set(Field::Range).then_some(state.range.label()),
        unit: set(Field::Range).then_some(state.range.unit_label()),
        state: set(Field::State).then_some(state_label(state.state)),
        mode: set(Field::Mode).then_some(mode_label(state.mode)),
        sense: set(Field::Sense).then_some(sense_label(state.sense)),
    };
    match serde_json_core::to_string::<_, PAYLOAD_CAPACITY>(&update) {
        Ok(payload) => sink.send(&payload),
        Err(_) => log::warn!("channel {ch} update does not fit the payload buffer"),
    }
}
