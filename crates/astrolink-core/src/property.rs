//! Host-facing property model
//!
//! Drivers report state to the host framework as property updates: a named
//! vector of numbers, switches or texts plus a state light. The host's own
//! property machinery (definitions, GUI, show/hide) is outside this crate; a
//! [`PropertySink`] is all a driver sees of it.

use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::exposure::Frame;

/// State light attached to every property update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyState {
    Idle,
    Ok,
    Busy,
    Alert,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Number(Vec<f64>),
    Switch(Vec<bool>),
    Text(Vec<String>),
}

impl PropertyValue {
    pub fn number(value: f64) -> Self {
        PropertyValue::Number(vec![value])
    }

    pub fn text(value: impl Into<String>) -> Self {
        PropertyValue::Text(vec![value.into()])
    }

    /// First numeric element, if this is a number vector
    pub fn first_number(&self) -> Option<f64> {
        match self {
            PropertyValue::Number(v) => v.first().copied(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyUpdate {
    pub device: String,
    pub name: String,
    pub value: Option<PropertyValue>,
    pub state: PropertyState,
    pub message: Option<String>,
}

/// Where a driver publishes property state and captured frames
pub trait PropertySink: Send {
    fn publish(&mut self, update: PropertyUpdate);

    fn deliver_frame(&mut self, device: &str, frame: Frame);
}

/// Keeps everything it is given; handles share the same log
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    updates: Arc<Mutex<Vec<PropertyUpdate>>>,
    frames: Arc<Mutex<Vec<(String, Frame)>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<PropertyUpdate> {
        self.updates.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Updates for one property, oldest first
    pub fn updates_for(&self, name: &str) -> Vec<PropertyUpdate> {
        self.updates()
            .into_iter()
            .filter(|u| u.name == name)
            .collect()
    }

    pub fn last(&self, name: &str) -> Option<PropertyUpdate> {
        self.updates_for(name).pop()
    }

    /// States published for one property, oldest first
    pub fn states_for(&self, name: &str) -> Vec<PropertyState> {
        self.updates_for(name).into_iter().map(|u| u.state).collect()
    }

    pub fn frames(&self) -> Vec<(String, Frame)> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.updates.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl PropertySink for RecordingSink {
    fn publish(&mut self, update: PropertyUpdate) {
        self.updates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(update);
    }

    fn deliver_frame(&mut self, device: &str, frame: Frame) {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((device.to_string(), frame));
    }
}

/// Writes updates to the tracing log (standalone host without a GUI)
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl PropertySink for LogSink {
    fn publish(&mut self, update: PropertyUpdate) {
        match update.state {
            PropertyState::Alert => tracing::warn!(
                device = %update.device,
                property = %update.name,
                value = ?update.value,
                "{}",
                update.message.as_deref().unwrap_or("alert")
            ),
            state => tracing::info!(
                device = %update.device,
                property = %update.name,
                value = ?update.value,
                ?state,
                "{}",
                update.message.as_deref().unwrap_or("")
            ),
        }
    }

    fn deliver_frame(&mut self, device: &str, frame: Frame) {
        tracing::info!(
            "{}: frame {}x{} {}-bit {} channel(s), {} bytes",
            device,
            frame.width,
            frame.height,
            frame.bits,
            frame.channels,
            frame.data.len()
        );
    }
}

bitflags! {
    /// Optional operations a driver instance supports, fixed at construction
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        const ABS_MOVE       = 1 << 0;
        const REL_MOVE       = 1 << 1;
        const ABORT          = 1 << 2;
        const SYNC           = 1 << 3;
        const REVERSE        = 1 << 4;
        const VARIABLE_SPEED = 1 << 5;
        const TIMED_MOVE     = 1 << 6;
        const GUIDING        = 1 << 7;
        const COOLING        = 1 << 8;
        const STREAMING      = 1 << 9;
        const TEMPERATURE    = 1 << 10;
    }
}

/// Property names, in the INDI vocabulary
pub mod names {
    pub const CONNECTION: &str = "CONNECTION";
    pub const DRIVER_INFO: &str = "DRIVER_INFO";

    pub const ABS_FOCUS_POSITION: &str = "ABS_FOCUS_POSITION";
    pub const REL_FOCUS_POSITION: &str = "REL_FOCUS_POSITION";
    pub const FOCUS_MOTION: &str = "FOCUS_MOTION";
    pub const FOCUS_TIMER: &str = "FOCUS_TIMER";
    pub const FOCUS_ABORT_MOTION: &str = "FOCUS_ABORT_MOTION";
    pub const FOCUS_SYNC: &str = "FOCUS_SYNC";
    pub const FOCUS_SPEED: &str = "FOCUS_SPEED";
    pub const FOCUS_REVERSE_MOTION: &str = "FOCUS_REVERSE_MOTION";
    pub const FOCUS_MAX: &str = "FOCUS_MAX";
    pub const FOCUS_TEMPERATURE: &str = "FOCUS_TEMPERATURE";
    pub const FOCUS_TEMP_COMPENSATION: &str = "FOCUS_TEMP_COMPENSATION";
    pub const FOCUS_TEMP_COEFFICIENT: &str = "FOCUS_TEMP_COEFFICIENT";
    pub const FOCUS_TEMP_CALIBRATION: &str = "FOCUS_TEMP_CALIBRATION";
    pub const FOCUS_MOTOR_SPEED: &str = "FOCUS_MOTOR_SPEED";

    pub const EQUATORIAL_EOD_COORD: &str = "EQUATORIAL_EOD_COORD";
    pub const ON_COORD_SET: &str = "ON_COORD_SET";
    pub const TELESCOPE_ABORT_MOTION: &str = "TELESCOPE_ABORT_MOTION";
    pub const TELESCOPE_MOTION_NS: &str = "TELESCOPE_MOTION_NS";
    pub const TELESCOPE_MOTION_WE: &str = "TELESCOPE_MOTION_WE";
    pub const TELESCOPE_SLEW_RATE: &str = "TELESCOPE_SLEW_RATE";
    pub const TELESCOPE_TIMED_GUIDE_NS: &str = "TELESCOPE_TIMED_GUIDE_NS";
    pub const TELESCOPE_TIMED_GUIDE_WE: &str = "TELESCOPE_TIMED_GUIDE_WE";
    pub const GUIDE_RATE: &str = "GUIDE_RATE";
    pub const USE_PULSE_CMD: &str = "USE_PULSE_CMD";
    pub const TIME_UTC: &str = "TIME_UTC";
    pub const GEOGRAPHIC_COORD: &str = "GEOGRAPHIC_COORD";
    pub const MOUNT_FIRMWARE_INFO: &str = "MOUNT_FIRMWARE_INFO";

    pub const CCD_EXPOSURE: &str = "CCD_EXPOSURE";
    pub const CCD_ABORT_EXPOSURE: &str = "CCD_ABORT_EXPOSURE";
    pub const CCD_TEMPERATURE: &str = "CCD_TEMPERATURE";
    pub const CCD_COOLER: &str = "CCD_COOLER";
    pub const CCD_FRAME: &str = "CCD_FRAME";
    pub const CCD_BINNING: &str = "CCD_BINNING";
    pub const CCD_VIDEO_STREAM: &str = "CCD_VIDEO_STREAM";
    pub const CCD_VIDEO_FORMAT: &str = "CCD_VIDEO_FORMAT";
    pub const CCD_CONTROLS: &str = "CCD_CONTROLS";
    pub const CCD_INFO: &str = "CCD_INFO";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_handles_share_log() {
        let sink = RecordingSink::new();
        let mut writer = sink.clone();
        writer.publish(PropertyUpdate {
            device: "focuser".into(),
            name: names::ABS_FOCUS_POSITION.into(),
            value: Some(PropertyValue::number(1000.0)),
            state: PropertyState::Busy,
            message: None,
        });
        writer.publish(PropertyUpdate {
            device: "focuser".into(),
            name: names::ABS_FOCUS_POSITION.into(),
            value: Some(PropertyValue::number(5000.0)),
            state: PropertyState::Ok,
            message: None,
        });

        assert_eq!(
            sink.states_for(names::ABS_FOCUS_POSITION),
            vec![PropertyState::Busy, PropertyState::Ok]
        );
        let last = sink.last(names::ABS_FOCUS_POSITION).unwrap();
        assert_eq!(last.value.and_then(|v| v.first_number()), Some(5000.0));
    }

    #[test]
    fn test_capabilities_contains() {
        let caps = Capabilities::ABS_MOVE | Capabilities::REL_MOVE | Capabilities::ABORT;
        assert!(caps.contains(Capabilities::ABS_MOVE));
        assert!(!caps.contains(Capabilities::GUIDING));
    }
}
