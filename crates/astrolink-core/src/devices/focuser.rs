//! Focuser property handling shared by the AUX1 and Microtouch focusers
//!
//! [`FocuserCore`] maps the standard focuser properties onto a
//! [`MotionController`] and a [`PositionDevice`], publishing results. Device
//! specific properties (speed tables, temperature) stay in the drivers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::driver::Publisher;
use crate::error::DriverError;
use crate::motion::{
    FocusDirection, Limits, MotionController, MotionState, PollOutcome, PositionDevice, TimedMove,
};
use crate::property::{names, Capabilities, PropertySink, PropertyState, PropertyValue};
use crate::timer::Clock;

pub struct FocuserCore {
    publisher: Publisher,
    motion: MotionController,
    capabilities: Capabilities,
    direction: FocusDirection,
    last_published: Option<(i64, PropertyState)>,
}

impl FocuserCore {
    pub fn new(
        name: &str,
        capabilities: Capabilities,
        limits: Limits,
        sink: Box<dyn PropertySink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            publisher: Publisher::new(name, sink),
            motion: MotionController::new(limits, clock),
            capabilities,
            direction: FocusDirection::Outward,
            last_published: None,
        }
    }

    pub fn name(&self) -> &str {
        self.publisher.device()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn publisher(&mut self) -> &mut Publisher {
        &mut self.publisher
    }

    pub fn motion(&self) -> &MotionController {
        &self.motion
    }

    pub fn motion_mut(&mut self) -> &mut MotionController {
        &mut self.motion
    }

    /// Publish Alert and refuse when `capability` was not declared
    pub fn require(&mut self, capability: Capabilities, property: &str) -> bool {
        if self.capabilities.contains(capability) {
            return true;
        }
        self.publisher
            .alert(property, &DriverError::Unsupported("capability not declared"))
    }

    /// Read the position once after connecting
    pub fn initialize(&mut self, device: &mut dyn PositionDevice) -> Result<i64, DriverError> {
        self.motion.reset();
        self.last_published = None;
        let sample = device.poll()?;
        self.motion.set_position(sample.position);
        self.publish_position(sample.position, PropertyState::Ok);
        let limits = self.motion.limits();
        self.publisher.set(
            names::FOCUS_MAX,
            PropertyValue::number(limits.max as f64),
            PropertyState::Ok,
        );
        Ok(sample.position)
    }

    fn publish_position(&mut self, position: i64, state: PropertyState) {
        if self.last_published == Some((position, state)) {
            return;
        }
        self.last_published = Some((position, state));
        self.publisher.set(
            names::ABS_FOCUS_POSITION,
            PropertyValue::number(position as f64),
            state,
        );
    }

    /// Periodic poll
    pub fn poll(&mut self, device: &mut dyn PositionDevice) -> bool {
        match self.motion.poll(device) {
            Ok(PollOutcome::Moving { position }) => {
                self.publish_position(position, PropertyState::Busy);
                true
            }
            Ok(PollOutcome::Arrived { position }) => {
                self.publish_position(position, PropertyState::Ok);
                self.publisher.state(names::REL_FOCUS_POSITION, PropertyState::Ok);
                true
            }
            Ok(PollOutcome::Stationary { position }) => {
                let state = match self.motion.state() {
                    MotionState::Alert => PropertyState::Alert,
                    _ => PropertyState::Ok,
                };
                self.publish_position(position, state);
                true
            }
            Err(e) => {
                self.last_published = None;
                self.publisher.alert(names::ABS_FOCUS_POSITION, &e)
            }
        }
    }

    /// Stop an expired timed move
    pub fn fire_due(&mut self, device: &mut dyn PositionDevice, now: Instant) -> bool {
        match self.motion.fire_due(device, now) {
            Ok(true) => {
                self.publisher.state(names::FOCUS_TIMER, PropertyState::Ok);
                true
            }
            Ok(false) => true,
            Err(e) => self.publisher.alert(names::FOCUS_TIMER, &e),
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.motion.next_deadline()
    }

    /// `value` rounded to a step count; NaN, infinities and out-of-range
    /// values publish a range alert on `property`
    fn step_count(&mut self, property: &str, value: f64) -> Option<i64> {
        let rounded = value.round();
        if (i64::MIN as f64..=i64::MAX as f64).contains(&rounded) {
            return Some(rounded as i64);
        }
        let limits = self.motion.limits();
        self.publisher.alert(
            property,
            &DriverError::range(value, limits.min as f64, limits.max as f64),
        );
        None
    }

    pub fn move_absolute(&mut self, device: &mut dyn PositionDevice, target: i64) -> bool {
        if !self.require(Capabilities::ABS_MOVE, names::ABS_FOCUS_POSITION) {
            return false;
        }
        match self.motion.move_absolute(device, target) {
            Ok(()) => {
                self.last_published = None;
                self.publisher.set(
                    names::ABS_FOCUS_POSITION,
                    PropertyValue::number(self.motion.position() as f64),
                    PropertyState::Busy,
                );
                true
            }
            Err(e) => self.publisher.alert(names::ABS_FOCUS_POSITION, &e),
        }
    }

    pub fn move_relative(&mut self, device: &mut dyn PositionDevice, ticks: f64) -> bool {
        if !self.require(Capabilities::REL_MOVE, names::REL_FOCUS_POSITION) {
            return false;
        }
        if !(0.0..=u32::MAX as f64).contains(&ticks) {
            return self.publisher.alert(
                names::REL_FOCUS_POSITION,
                &DriverError::range(ticks, 0.0, u32::MAX as f64),
            );
        }
        match self.motion.move_relative(device, self.direction, ticks as u32) {
            Ok(_) => {
                self.last_published = None;
                self.publisher.set(
                    names::REL_FOCUS_POSITION,
                    PropertyValue::number(ticks),
                    PropertyState::Busy,
                );
                true
            }
            Err(e) => self.publisher.alert(names::REL_FOCUS_POSITION, &e),
        }
    }

    pub fn move_timed(
        &mut self,
        device: &mut dyn PositionDevice,
        millis: f64,
        poll_interval: Duration,
    ) -> bool {
        if !self.require(Capabilities::TIMED_MOVE, names::FOCUS_TIMER) {
            return false;
        }
        if !(0.0..=u32::MAX as f64).contains(&millis) {
            return self.publisher.alert(
                names::FOCUS_TIMER,
                &DriverError::range(millis, 0.0, u32::MAX as f64),
            );
        }
        let duration = Duration::from_millis(millis as u64);
        match self
            .motion
            .move_timed(device, self.direction, duration, poll_interval)
        {
            Ok(TimedMove::Finished) => {
                self.publisher.set(
                    names::FOCUS_TIMER,
                    PropertyValue::number(millis),
                    PropertyState::Ok,
                );
                true
            }
            Ok(TimedMove::Until(_)) => {
                self.last_published = None;
                self.publisher.set(
                    names::FOCUS_TIMER,
                    PropertyValue::number(millis),
                    PropertyState::Busy,
                );
                true
            }
            Err(e) => self.publisher.alert(names::FOCUS_TIMER, &e),
        }
    }

    pub fn abort(&mut self, device: &mut dyn PositionDevice) -> bool {
        if !self.require(Capabilities::ABORT, names::FOCUS_ABORT_MOTION) {
            return false;
        }
        let result = self.motion.abort(device);
        // Waiting properties are released whatever the halt did
        self.last_published = None;
        self.publisher
            .state(names::ABS_FOCUS_POSITION, PropertyState::Idle);
        self.publisher
            .state(names::REL_FOCUS_POSITION, PropertyState::Idle);
        self.publisher.state(names::FOCUS_TIMER, PropertyState::Idle);
        match result {
            Ok(()) => {
                self.publisher
                    .state(names::FOCUS_ABORT_MOTION, PropertyState::Ok);
                true
            }
            Err(e) => self.publisher.alert(names::FOCUS_ABORT_MOTION, &e),
        }
    }

    pub fn sync(&mut self, device: &mut dyn PositionDevice, position: f64) -> bool {
        if !self.require(Capabilities::SYNC, names::FOCUS_SYNC) {
            return false;
        }
        let Some(steps) = self.step_count(names::FOCUS_SYNC, position) else {
            return false;
        };
        match self.motion.sync(device, steps) {
            Ok(()) => {
                self.publisher.set(
                    names::FOCUS_SYNC,
                    PropertyValue::number(position),
                    PropertyState::Ok,
                );
                self.publish_position(self.motion.position(), PropertyState::Ok);
                true
            }
            Err(e) => self.publisher.alert(names::FOCUS_SYNC, &e),
        }
    }

    pub fn set_direction(&mut self, direction: FocusDirection) {
        self.direction = direction;
        let states = match direction {
            FocusDirection::Inward => vec![true, false],
            FocusDirection::Outward => vec![false, true],
        };
        self.publisher.set(
            names::FOCUS_MOTION,
            PropertyValue::Switch(states),
            PropertyState::Ok,
        );
    }

    pub fn set_reversed(&mut self, reversed: bool) -> bool {
        if !self.require(Capabilities::REVERSE, names::FOCUS_REVERSE_MOTION) {
            return false;
        }
        self.motion.set_reversed(reversed);
        self.publisher.set(
            names::FOCUS_REVERSE_MOTION,
            PropertyValue::Switch(vec![reversed, !reversed]),
            PropertyState::Ok,
        );
        true
    }

    pub fn set_max(&mut self, max: f64) -> bool {
        let limits = self.motion.limits();
        if !(limits.min as f64..=i64::MAX as f64).contains(&max) {
            return self.publisher.alert(
                names::FOCUS_MAX,
                &DriverError::range(max, limits.min as f64, i64::MAX as f64),
            );
        }
        self.motion.set_limits(Limits::new(limits.min, max as i64));
        self.publisher
            .set(names::FOCUS_MAX, PropertyValue::number(max), PropertyState::Ok);
        true
    }

    /// Generic numeric focuser properties; `None` when `name` is not one of them
    pub fn update_number(
        &mut self,
        device: &mut dyn PositionDevice,
        name: &str,
        values: &[f64],
        poll_interval: Duration,
    ) -> Option<bool> {
        let value = values.first().copied();
        let handled = match (name, value) {
            (names::ABS_FOCUS_POSITION, Some(v)) => match self.step_count(name, v) {
                Some(target) => self.move_absolute(device, target),
                None => false,
            },
            (names::REL_FOCUS_POSITION, Some(v)) => self.move_relative(device, v),
            (names::FOCUS_TIMER, Some(v)) => self.move_timed(device, v, poll_interval),
            (names::FOCUS_SYNC, Some(v)) => self.sync(device, v),
            (names::FOCUS_MAX, Some(v)) => self.set_max(v),
            (
                names::ABS_FOCUS_POSITION
                | names::REL_FOCUS_POSITION
                | names::FOCUS_TIMER
                | names::FOCUS_SYNC
                | names::FOCUS_MAX,
                None,
            ) => self.publisher.alert(
                name,
                &DriverError::InvalidArgument("empty number vector".into()),
            ),
            _ => return None,
        };
        Some(handled)
    }

    /// Generic switch focuser properties; `None` when `name` is not one of them
    pub fn update_switch(
        &mut self,
        device: &mut dyn PositionDevice,
        name: &str,
        states: &[bool],
    ) -> Option<bool> {
        let handled = match name {
            names::FOCUS_MOTION => {
                let direction = if states.first().copied().unwrap_or(false) {
                    FocusDirection::Inward
                } else {
                    FocusDirection::Outward
                };
                self.set_direction(direction);
                true
            }
            names::FOCUS_ABORT_MOTION => self.abort(device),
            names::FOCUS_REVERSE_MOTION => {
                self.set_reversed(states.first().copied().unwrap_or(false))
            }
            _ => return None,
        };
        Some(handled)
    }

    /// Best-effort halt of an outstanding move, then forget all motion state
    pub fn disconnect(&mut self, device: Option<&mut dyn PositionDevice>) {
        if let Some(device) = device {
            if self.motion.request().is_some() {
                if let Err(e) = device.halt() {
                    tracing::warn!("{}: halt on disconnect failed: {}", self.name(), e);
                }
            }
        }
        self.motion.reset();
        self.last_published = None;
    }
}
