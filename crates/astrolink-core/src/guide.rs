//! Guide-pulse scheduler
//!
//! One logical pulse per axis. A new pulse on a busy axis first
//! force-completes the old one (its notification fires before the new
//! command goes out). Pulses shorter than the threshold are timed by
//! sleeping on the dispatch thread and report `Ok`; longer ones arm a
//! one-shot timer and report `Busy` straight away.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::DriverError;
use crate::property::PropertyState;
use crate::timer::{Clock, TimerHandle, TimerQueue};

/// Pulses shorter than this block instead of arming a timer
pub const DEFAULT_SYNC_THRESHOLD: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuideDirection {
    North,
    South,
    East,
    West,
}

impl GuideDirection {
    pub fn axis(self) -> GuideAxis {
        match self {
            GuideDirection::North | GuideDirection::South => GuideAxis::Declination,
            GuideDirection::East | GuideDirection::West => GuideAxis::RightAscension,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuideAxis {
    Declination,
    RightAscension,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuidePulse {
    pub direction: GuideDirection,
    pub duration: Duration,
    pub started_at: Instant,
    pub ends_at: Instant,
}

/// Device side of guiding
pub trait PulseGuider {
    fn start_pulse(&mut self, direction: GuideDirection, duration: Duration)
        -> Result<(), DriverError>;

    /// Called when a pulse ends; move-and-stop guiding sends its stop here
    fn finish_pulse(&mut self, _direction: GuideDirection) -> Result<(), DriverError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// Ran for its full duration
    Elapsed,
    /// Replaced by a newer pulse on the same axis
    Superseded,
    /// Abort or disconnect
    Cancelled,
}

/// Notification that an axis is free again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuideCompletion {
    pub pulse: GuidePulse,
    pub reason: CompletionReason,
    /// `Alert` when the end-of-pulse command failed
    pub state: PropertyState,
}

#[derive(Debug)]
struct ActivePulse {
    pulse: GuidePulse,
    timer: TimerHandle,
}

pub struct GuideController {
    threshold: Duration,
    declination: Option<ActivePulse>,
    right_ascension: Option<ActivePulse>,
    timers: TimerQueue<GuideAxis>,
    clock: Arc<dyn Clock>,
}

impl GuideController {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_threshold(clock, DEFAULT_SYNC_THRESHOLD)
    }

    pub fn with_threshold(clock: Arc<dyn Clock>, threshold: Duration) -> Self {
        Self {
            threshold,
            declination: None,
            right_ascension: None,
            timers: TimerQueue::new(),
            clock,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    fn slot(&mut self, axis: GuideAxis) -> &mut Option<ActivePulse> {
        match axis {
            GuideAxis::Declination => &mut self.declination,
            GuideAxis::RightAscension => &mut self.right_ascension,
        }
    }

    /// The pulse currently running on `axis`
    pub fn active(&self, axis: GuideAxis) -> Option<GuidePulse> {
        match axis {
            GuideAxis::Declination => self.declination.as_ref().map(|a| a.pulse),
            GuideAxis::RightAscension => self.right_ascension.as_ref().map(|a| a.pulse),
        }
    }

    /// Issue a pulse. `notify` receives completions, including the forced
    /// completion of a pulse this one supersedes.
    pub fn pulse(
        &mut self,
        device: &mut dyn PulseGuider,
        direction: GuideDirection,
        duration: Duration,
        notify: &mut dyn FnMut(GuideCompletion),
    ) -> PropertyState {
        let axis = direction.axis();
        if let Some(previous) = self.slot(axis).take() {
            self.timers.cancel(&previous.timer);
            let state = finish(device, previous.pulse.direction);
            notify(GuideCompletion {
                pulse: previous.pulse,
                reason: CompletionReason::Superseded,
                state,
            });
        }

        let started_at = self.clock.now();
        let pulse = GuidePulse {
            direction,
            duration,
            started_at,
            ends_at: started_at + duration,
        };

        if let Err(e) = device.start_pulse(direction, duration) {
            tracing::error!("guide {:?} {}ms failed: {}", direction, duration.as_millis(), e);
            return PropertyState::Alert;
        }

        if duration < self.threshold {
            self.clock.sleep(duration);
            return finish(device, direction);
        }

        let timer = self.timers.schedule(pulse.ends_at, axis);
        *self.slot(axis) = Some(ActivePulse { pulse, timer });
        tracing::debug!("guide {:?} {}ms armed", direction, duration.as_millis());
        PropertyState::Busy
    }

    /// Complete every pulse whose end time has passed
    pub fn fire_due(
        &mut self,
        device: &mut dyn PulseGuider,
        now: Instant,
        notify: &mut dyn FnMut(GuideCompletion),
    ) -> usize {
        let mut fired = 0;
        while let Some(axis) = self.timers.pop_due(now) {
            if let Some(active) = self.slot(axis).take() {
                let state = finish(device, active.pulse.direction);
                notify(GuideCompletion {
                    pulse: active.pulse,
                    reason: CompletionReason::Elapsed,
                    state,
                });
                fired += 1;
            }
        }
        fired
    }

    /// Cancel all timers and synthesize completions for the pending pulses.
    /// With a device at hand each pending pulse is ended on it first; a
    /// failure there is logged and does not stop the others.
    pub fn cancel_all(
        &mut self,
        mut device: Option<&mut dyn PulseGuider>,
        notify: &mut dyn FnMut(GuideCompletion),
    ) {
        self.timers.cancel_all();
        for axis in [GuideAxis::Declination, GuideAxis::RightAscension] {
            if let Some(active) = self.slot(axis).take() {
                if let Some(device) = device.as_deref_mut() {
                    finish(device, active.pulse.direction);
                }
                notify(GuideCompletion {
                    pulse: active.pulse,
                    reason: CompletionReason::Cancelled,
                    state: PropertyState::Idle,
                });
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }
}

fn finish(device: &mut dyn PulseGuider, direction: GuideDirection) -> PropertyState {
    match device.finish_pulse(direction) {
        Ok(()) => PropertyState::Ok,
        Err(e) => {
            tracing::error!("ending guide pulse {:?} failed: {}", direction, e);
            PropertyState::Alert
        }
    }
}
