//! Host-facing driver interface
//!
//! The host framework drives every device through the same entry points:
//! lifecycle (`connect`, `disconnect`), a periodic `timer_tick`, one-shot
//! timer dispatch, and property updates. Each returns `bool`; errors are
//! logged once and published as an Alert, never propagated to the host.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::exposure::Frame;
use crate::property::{Capabilities, PropertySink, PropertyState, PropertyUpdate, PropertyValue};

/// Connection lifecycle, changed only by `connect` and `disconnect`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Connected,
}

pub trait Driver: Send {
    fn name(&self) -> &str;

    /// Declared once at construction
    fn capabilities(&self) -> Capabilities;

    fn connection_state(&self) -> ConnectionState;

    /// Cadence of `timer_tick`
    fn poll_interval(&self) -> Duration;

    fn connect(&mut self) -> bool;

    /// Cancels every pending timer, stops motion on a best-effort basis and
    /// releases the transport. Always succeeds.
    fn disconnect(&mut self) -> bool;

    /// Periodic poll
    fn timer_tick(&mut self) -> bool;

    /// Handle every one-shot timer that is due
    fn run_timers(&mut self) -> bool;

    /// Earliest pending one-shot deadline
    fn next_deadline(&self) -> Option<Instant>;

    fn update_number(&mut self, name: &str, values: &[f64]) -> bool;

    fn update_switch(&mut self, name: &str, states: &[bool]) -> bool;

    fn update_text(&mut self, name: &str, values: &[String]) -> bool;
}

/// A driver's handle on its property sink, stamped with the device name
pub struct Publisher {
    device: String,
    sink: Box<dyn PropertySink>,
}

impl Publisher {
    pub fn new(device: impl Into<String>, sink: Box<dyn PropertySink>) -> Self {
        Self {
            device: device.into(),
            sink,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn set(&mut self, name: &str, value: PropertyValue, state: PropertyState) {
        self.sink.publish(PropertyUpdate {
            device: self.device.clone(),
            name: name.to_string(),
            value: Some(value),
            state,
            message: None,
        });
    }

    /// Change only the state light of a property
    pub fn state(&mut self, name: &str, state: PropertyState) {
        self.sink.publish(PropertyUpdate {
            device: self.device.clone(),
            name: name.to_string(),
            value: None,
            state,
            message: None,
        });
    }

    /// Log one diagnostic line, publish Alert and return `false`
    pub fn alert(&mut self, name: &str, error: &dyn fmt::Display) -> bool {
        tracing::error!("{}: {} failed: {}", self.device, name, error);
        self.sink.publish(PropertyUpdate {
            device: self.device.clone(),
            name: name.to_string(),
            value: None,
            state: PropertyState::Alert,
            message: Some(error.to_string()),
        });
        false
    }

    pub fn frame(&mut self, frame: Frame) {
        self.sink.deliver_frame(&self.device, frame);
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// Earliest of several optional deadlines
pub fn earliest(deadlines: impl IntoIterator<Item = Option<Instant>>) -> Option<Instant> {
    deadlines.into_iter().flatten().min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::RecordingSink;

    #[test]
    fn test_alert_publishes_message() {
        let sink = RecordingSink::new();
        let mut publisher = Publisher::new("Microtouch", Box::new(sink.clone()));
        let ok = publisher.alert("ABS_FOCUS_POSITION", &"reply timed out");
        assert!(!ok);

        let update = sink.last("ABS_FOCUS_POSITION").unwrap();
        assert_eq!(update.device, "Microtouch");
        assert_eq!(update.state, PropertyState::Alert);
        assert_eq!(update.message.as_deref(), Some("reply timed out"));
    }

    #[test]
    fn test_earliest() {
        let now = Instant::now();
        let later = now + Duration::from_millis(5);
        assert_eq!(earliest([None, Some(later), Some(now)]), Some(now));
        assert_eq!(earliest([None, None]), None);
    }
}
