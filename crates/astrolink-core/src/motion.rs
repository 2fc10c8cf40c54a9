//! Position/motion state machine
//!
//! [`MotionController`] reconciles a requested target with what the device
//! reports on each poll:
//!
//! ```text
//!   Idle --move accepted--> Moving --"not moving" / two equal polls--> Idle
//!                              \--poll failed--> Alert
//! ```
//!
//! Devices with a moving flag complete as soon as the flag clears. Devices
//! without one complete when two consecutive polls after the move report the
//! same position. That rule cannot tell an arrived focuser from a stalled
//! one; a stall is reported as arrival at the stalled position.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::DriverError;
use crate::timer::{Clock, TimerQueue};

/// Travel bounds, inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub min: i64,
    pub max: i64,
}

impl Limits {
    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, position: i64) -> bool {
        (self.min..=self.max).contains(&position)
    }

    pub fn check(&self, position: i64) -> Result<i64, DriverError> {
        if self.contains(position) {
            Ok(position)
        } else {
            Err(DriverError::range(
                position as f64,
                self.min as f64,
                self.max as f64,
            ))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionState {
    Idle,
    Moving,
    Alert,
}

/// Outstanding move, cleared when completion is observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionRequest {
    pub target: i64,
    pub speed: Option<u32>,
    pub issued_at: Instant,
}

/// What one poll of the device returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionSample {
    pub position: i64,
    /// `None` when the protocol has no moving flag
    pub moving: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FocusDirection {
    Inward,
    Outward,
}

impl FocusDirection {
    pub fn reversed(self) -> Self {
        match self {
            FocusDirection::Inward => FocusDirection::Outward,
            FocusDirection::Outward => FocusDirection::Inward,
        }
    }

    fn sign(self) -> i64 {
        match self {
            FocusDirection::Inward => -1,
            FocusDirection::Outward => 1,
        }
    }
}

/// Device side of the motion state machine
pub trait PositionDevice {
    fn move_to(&mut self, target: i64) -> Result<(), DriverError>;

    fn poll(&mut self) -> Result<MotionSample, DriverError>;

    fn halt(&mut self) -> Result<(), DriverError>;

    fn sync_to(&mut self, position: i64) -> Result<(), DriverError>;
}

/// Result of a poll, for the driver to publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// No move outstanding
    Stationary { position: i64 },
    Moving { position: i64 },
    /// The outstanding move completed on this poll
    Arrived { position: i64 },
}

impl PollOutcome {
    pub fn position(&self) -> i64 {
        match *self {
            PollOutcome::Stationary { position }
            | PollOutcome::Moving { position }
            | PollOutcome::Arrived { position } => position,
        }
    }
}

/// A timed move either finished while the caller waited or runs until a deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedMove {
    Finished,
    Until(Instant),
}

#[derive(Debug)]
struct TimedStop;

pub struct MotionController {
    limits: Limits,
    position: i64,
    state: MotionState,
    request: Option<MotionRequest>,
    /// Position seen by the previous poll since the move was issued
    last_polled: Option<i64>,
    reversed: bool,
    timers: TimerQueue<TimedStop>,
    clock: Arc<dyn Clock>,
}

impl MotionController {
    pub fn new(limits: Limits, clock: Arc<dyn Clock>) -> Self {
        Self {
            limits,
            position: 0,
            state: MotionState::Idle,
            request: None,
            last_polled: None,
            reversed: false,
            timers: TimerQueue::new(),
            clock,
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn set_limits(&mut self, limits: Limits) {
        self.limits = limits;
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    pub fn request(&self) -> Option<MotionRequest> {
        self.request
    }

    pub fn is_reversed(&self) -> bool {
        self.reversed
    }

    pub fn set_reversed(&mut self, reversed: bool) {
        self.reversed = reversed;
    }

    /// Record a position read outside a poll (e.g. during connect)
    pub fn set_position(&mut self, position: i64) {
        self.position = position;
    }

    /// Issue a move to `target`; nothing is sent if it is outside the limits
    pub fn move_absolute(
        &mut self,
        device: &mut dyn PositionDevice,
        target: i64,
    ) -> Result<(), DriverError> {
        self.move_with_speed(device, target, None)
    }

    pub fn move_with_speed(
        &mut self,
        device: &mut dyn PositionDevice,
        target: i64,
        speed: Option<u32>,
    ) -> Result<(), DriverError> {
        let target = self.limits.check(target)?;

        device.move_to(target)?;

        tracing::info!("move {} -> {} issued", self.position, target);
        self.request = Some(MotionRequest {
            target,
            speed,
            issued_at: self.clock.now(),
        });
        self.last_polled = None;
        self.state = MotionState::Moving;
        Ok(())
    }

    /// Move `delta` ticks from the cached position; returns the absolute target
    pub fn move_relative(
        &mut self,
        device: &mut dyn PositionDevice,
        direction: FocusDirection,
        delta: u32,
    ) -> Result<i64, DriverError> {
        let direction = if self.reversed {
            direction.reversed()
        } else {
            direction
        };
        let target = self.position + direction.sign() * delta as i64;
        self.move_absolute(device, target)?;
        Ok(target)
    }

    /// Drive toward the travel limit in `direction` for `duration`.
    ///
    /// Durations within one poll interval block on the clock and halt before
    /// returning; longer ones arm a stop timer handled by [`Self::fire_due`].
    pub fn move_timed(
        &mut self,
        device: &mut dyn PositionDevice,
        direction: FocusDirection,
        duration: Duration,
        poll_interval: Duration,
    ) -> Result<TimedMove, DriverError> {
        let direction = if self.reversed {
            direction.reversed()
        } else {
            direction
        };
        let target = match direction {
            FocusDirection::Inward => self.limits.min,
            FocusDirection::Outward => self.limits.max,
        };

        self.timers.cancel_all();
        self.move_absolute(device, target)?;

        if duration <= poll_interval {
            self.clock.sleep(duration);
            self.stop(device)?;
            return Ok(TimedMove::Finished);
        }

        let deadline = self.clock.now() + duration;
        self.timers.schedule(deadline, TimedStop);
        Ok(TimedMove::Until(deadline))
    }

    /// Stop an expired timed move. Returns true if one was due.
    pub fn fire_due(
        &mut self,
        device: &mut dyn PositionDevice,
        now: Instant,
    ) -> Result<bool, DriverError> {
        if self.timers.pop_due(now).is_none() {
            return Ok(false);
        }
        self.stop(device)?;
        Ok(true)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    fn stop(&mut self, device: &mut dyn PositionDevice) -> Result<(), DriverError> {
        let result = device.halt();
        self.request = None;
        self.last_polled = None;
        match result {
            Ok(()) => {
                self.state = MotionState::Idle;
                Ok(())
            }
            Err(e) => {
                self.state = MotionState::Alert;
                Err(e)
            }
        }
    }

    /// Reconcile one poll with the outstanding request
    pub fn poll(&mut self, device: &mut dyn PositionDevice) -> Result<PollOutcome, DriverError> {
        let sample = match device.poll() {
            Ok(sample) => sample,
            Err(e) => {
                if self.request.take().is_some() {
                    tracing::warn!("poll failed during move, motion state -> Alert: {}", e);
                    self.state = MotionState::Alert;
                    self.last_polled = None;
                    self.timers.cancel_all();
                }
                return Err(e);
            }
        };

        self.position = sample.position;

        if self.request.is_none() {
            return Ok(PollOutcome::Stationary {
                position: sample.position,
            });
        }

        let arrived = match sample.moving {
            Some(moving) => !moving,
            None => self.last_polled == Some(sample.position),
        };
        self.last_polled = Some(sample.position);

        // A timed move is only finished by its stop timer
        if arrived && self.timers.is_empty() {
            tracing::info!("move complete at {}", sample.position);
            self.request = None;
            self.last_polled = None;
            self.state = MotionState::Idle;
            Ok(PollOutcome::Arrived {
                position: sample.position,
            })
        } else {
            Ok(PollOutcome::Moving {
                position: sample.position,
            })
        }
    }

    /// Halt and forget the outstanding move. The controller is Idle afterwards
    /// even if the halt command failed; that failure is returned for logging.
    pub fn abort(&mut self, device: &mut dyn PositionDevice) -> Result<(), DriverError> {
        self.timers.cancel_all();
        self.request = None;
        self.last_polled = None;
        self.state = MotionState::Idle;
        device.halt().map_err(|e| {
            tracing::warn!("halt failed: {}", e);
            e
        })
    }

    /// Tell the device its current position is `position`
    pub fn sync(
        &mut self,
        device: &mut dyn PositionDevice,
        position: i64,
    ) -> Result<(), DriverError> {
        let position = self.limits.check(position)?;
        device.sync_to(position)?;
        self.position = position;
        Ok(())
    }

    /// Forget all motion state without touching the device
    pub fn reset(&mut self) {
        self.timers.cancel_all();
        self.request = None;
        self.last_polled = None;
        self.state = MotionState::Idle;
    }
}

/// Suppresses temperature republishing for noise-level changes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureTracker {
    delta: f64,
    last_published: Option<f64>,
}

impl TemperatureTracker {
    pub fn new(delta: f64) -> Self {
        Self {
            delta,
            last_published: None,
        }
    }

    /// Returns the reading when it should be published
    pub fn observe(&mut self, reading: f64) -> Option<f64> {
        match self.last_published {
            Some(last) if (reading - last).abs() < self.delta => None,
            _ => {
                self.last_published = Some(reading);
                Some(reading)
            }
        }
    }

    pub fn last_published(&self) -> Option<f64> {
        self.last_published
    }

    pub fn reset(&mut self) {
        self.last_published = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolError;
    use crate::timer::ManualClock;

    /// Focuser model that reports a scripted sequence of samples
    #[derive(Default)]
    struct FakeFocuser {
        moves: Vec<i64>,
        halts: usize,
        samples: Vec<Result<MotionSample, ()>>,
        fail_halt: bool,
    }

    impl PositionDevice for FakeFocuser {
        fn move_to(&mut self, target: i64) -> Result<(), DriverError> {
            self.moves.push(target);
            Ok(())
        }

        fn poll(&mut self) -> Result<MotionSample, DriverError> {
            match self.samples.remove(0) {
                Ok(sample) => Ok(sample),
                Err(()) => Err(ProtocolError::Timeout {
                    expected: "3 bytes".into(),
                    received: 0,
                    waited_ms: 2000,
                }
                .into()),
            }
        }

        fn halt(&mut self) -> Result<(), DriverError> {
            self.halts += 1;
            if self.fail_halt {
                Err(ProtocolError::NotConnected.into())
            } else {
                Ok(())
            }
        }

        fn sync_to(&mut self, _position: i64) -> Result<(), DriverError> {
            Ok(())
        }
    }

    fn at(position: i64) -> Result<MotionSample, ()> {
        Ok(MotionSample {
            position,
            moving: None,
        })
    }

    fn controller() -> (MotionController, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let mut ctl = MotionController::new(Limits::new(0, 60000), clock.clone());
        ctl.set_position(1000);
        (ctl, clock)
    }

    #[test]
    fn test_out_of_range_sends_nothing() {
        let (mut ctl, _) = controller();
        let mut dev = FakeFocuser::default();
        let err = ctl.move_absolute(&mut dev, 60001).unwrap_err();
        assert!(matches!(err, DriverError::Range { .. }));
        assert!(dev.moves.is_empty());
        assert_eq!(ctl.state(), MotionState::Idle);
    }

    #[test]
    fn test_two_equal_polls_complete_move() {
        let (mut ctl, _) = controller();
        let mut dev = FakeFocuser {
            samples: vec![at(3000), at(5000), at(5000)],
            ..Default::default()
        };
        ctl.move_absolute(&mut dev, 5000).unwrap();
        assert_eq!(ctl.state(), MotionState::Moving);

        assert_eq!(ctl.poll(&mut dev).unwrap(), PollOutcome::Moving { position: 3000 });
        assert_eq!(ctl.poll(&mut dev).unwrap(), PollOutcome::Moving { position: 5000 });
        assert_eq!(ctl.poll(&mut dev).unwrap(), PollOutcome::Arrived { position: 5000 });
        assert_eq!(ctl.state(), MotionState::Idle);
        assert!(ctl.request().is_none());
    }

    #[test]
    fn test_moving_flag_completes_immediately() {
        let (mut ctl, _) = controller();
        let mut dev = FakeFocuser {
            samples: vec![Ok(MotionSample {
                position: 2000,
                moving: Some(false),
            })],
            ..Default::default()
        };
        ctl.move_absolute(&mut dev, 2000).unwrap();
        assert_eq!(ctl.poll(&mut dev).unwrap(), PollOutcome::Arrived { position: 2000 });
    }

    #[test]
    fn test_failed_poll_while_moving_is_alert() {
        let (mut ctl, _) = controller();
        let mut dev = FakeFocuser {
            samples: vec![Err(())],
            ..Default::default()
        };
        ctl.move_absolute(&mut dev, 2000).unwrap();
        assert!(ctl.poll(&mut dev).is_err());
        assert_eq!(ctl.state(), MotionState::Alert);
        assert!(ctl.request().is_none());
    }

    #[test]
    fn test_relative_move_honours_reverse() {
        let (mut ctl, _) = controller();
        let mut dev = FakeFocuser::default();
        assert_eq!(ctl.move_relative(&mut dev, FocusDirection::Outward, 500).unwrap(), 1500);
        ctl.set_reversed(true);
        assert_eq!(ctl.move_relative(&mut dev, FocusDirection::Outward, 500).unwrap(), 500);
        assert!(ctl.move_relative(&mut dev, FocusDirection::Outward, 5000).is_err());
        assert_eq!(dev.moves, vec![1500, 500]);
    }

    #[test]
    fn test_short_timed_move_blocks_and_halts() {
        let (mut ctl, clock) = controller();
        let mut dev = FakeFocuser::default();
        let result = ctl
            .move_timed(
                &mut dev,
                FocusDirection::Inward,
                Duration::from_millis(300),
                Duration::from_millis(500),
            )
            .unwrap();
        assert_eq!(result, TimedMove::Finished);
        assert_eq!(dev.moves, vec![0]);
        assert_eq!(dev.halts, 1);
        assert_eq!(clock.elapsed(), Duration::from_millis(300));
        assert_eq!(ctl.state(), MotionState::Idle);
    }

    #[test]
    fn test_long_timed_move_stops_on_timer() {
        let (mut ctl, clock) = controller();
        let mut dev = FakeFocuser {
            samples: vec![at(40000), at(40000)],
            ..Default::default()
        };
        let result = ctl
            .move_timed(
                &mut dev,
                FocusDirection::Outward,
                Duration::from_secs(2),
                Duration::from_millis(500),
            )
            .unwrap();
        assert_eq!(result, TimedMove::Until(clock.at(Duration::from_secs(2))));
        assert_eq!(dev.moves, vec![60000]);

        // Equal polls do not end a timed move early
        ctl.poll(&mut dev).unwrap();
        assert_eq!(ctl.poll(&mut dev).unwrap(), PollOutcome::Moving { position: 40000 });

        assert!(!ctl.fire_due(&mut dev, clock.now()).unwrap());
        clock.advance(Duration::from_secs(2));
        assert!(ctl.fire_due(&mut dev, clock.now()).unwrap());
        assert_eq!(dev.halts, 1);
        assert_eq!(ctl.state(), MotionState::Idle);
    }

    #[test]
    fn test_abort_clears_even_when_halt_fails() {
        let (mut ctl, _) = controller();
        let mut dev = FakeFocuser {
            fail_halt: true,
            ..Default::default()
        };
        ctl.move_absolute(&mut dev, 2000).unwrap();
        assert!(ctl.abort(&mut dev).is_err());
        assert_eq!(ctl.state(), MotionState::Idle);
        assert!(ctl.request().is_none());
    }

    #[test]
    fn test_temperature_tracker_suppresses_noise() {
        let mut t = TemperatureTracker::new(0.01);
        assert_eq!(t.observe(12.5), Some(12.5));
        assert_eq!(t.observe(12.505), None);
        assert_eq!(t.observe(12.52), Some(12.52));
    }
}
