//! Exposure/capture sequencer
//!
//! Starts a timed exposure on a [`CaptureDevice`], keeps the countdown, and
//! arms a one-shot timer for the completion point once it falls within one
//! poll interval, so completion is not held back until the next poll. The
//! frame itself arrives through the device's image-ready event.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DriverError;
use crate::timer::{Clock, TimerQueue};

/// The completion point sits this far ahead of the nominal end
pub const COMPLETION_LEAD: Duration = Duration::from_millis(50);

/// Sample layout the device is asked to deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelLayout {
    pub bits_per_sample: u8,
    /// 1 for mono/raw, 3 for packed RGB
    pub channels: u8,
}

impl PixelLayout {
    pub const MONO8: PixelLayout = PixelLayout {
        bits_per_sample: 8,
        channels: 1,
    };
    pub const RGB24: PixelLayout = PixelLayout {
        bits_per_sample: 8,
        channels: 3,
    };

    pub fn bytes_per_sample(&self) -> usize {
        (self.bits_per_sample as usize).div_ceil(8)
    }

    pub fn frame_bytes(&self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.channels as usize * self.bytes_per_sample()
    }
}

/// Buffer as the device returns it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Opaque capture device (vendor SDK handle)
pub trait CaptureDevice {
    fn set_exposure_time(&mut self, duration: Duration) -> Result<(), DriverError>;

    /// Put the sensor in software-trigger mode
    fn arm_software_trigger(&mut self) -> Result<(), DriverError>;

    fn trigger(&mut self) -> Result<(), DriverError>;

    fn cancel_trigger(&mut self) -> Result<(), DriverError>;

    fn pull_image(&mut self, layout: PixelLayout) -> Result<RawImage, DriverError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureRequest {
    pub duration: Duration,
    pub started_at: Instant,
    pub expected_end: Instant,
}

impl ExposureRequest {
    /// When the driver stops counting down and starts waiting for the image
    pub fn completion_point(&self) -> Instant {
        if self.duration > COMPLETION_LEAD {
            self.expected_end - COMPLETION_LEAD
        } else {
            self.expected_end
        }
    }
}

/// A delivered image; colour frames are planar (all R, then G, then B)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub bits: u8,
    pub channels: u8,
    pub data: Vec<u8>,
    pub exposure: Duration,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug)]
struct CompletionDue;

pub struct ExposureSequencer {
    active: Option<ExposureRequest>,
    timers: TimerQueue<CompletionDue>,
    completion_armed: bool,
    clock: Arc<dyn Clock>,
}

impl ExposureSequencer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            active: None,
            timers: TimerQueue::new(),
            completion_armed: false,
            clock,
        }
    }

    pub fn active(&self) -> Option<ExposureRequest> {
        self.active
    }

    pub fn is_exposing(&self) -> bool {
        self.active.is_some()
    }

    /// Program and trigger an exposure
    pub fn start(
        &mut self,
        device: &mut dyn CaptureDevice,
        duration: Duration,
        poll_interval: Duration,
    ) -> Result<ExposureRequest, DriverError> {
        if self.active.is_some() {
            return Err(DriverError::InvalidArgument(
                "an exposure is already in progress".into(),
            ));
        }

        device.set_exposure_time(duration)?;
        device.arm_software_trigger()?;
        device.trigger()?;

        let started_at = self.clock.now();
        let request = ExposureRequest {
            duration,
            started_at,
            expected_end: started_at + duration,
        };
        self.active = Some(request);
        self.completion_armed = false;
        tracing::info!("exposure of {:.3}s started", duration.as_secs_f64());

        self.arm_if_near(started_at, poll_interval);
        Ok(request)
    }

    fn arm_if_near(&mut self, now: Instant, poll_interval: Duration) {
        let Some(request) = self.active else {
            return;
        };
        if self.completion_armed {
            return;
        }
        let point = request.completion_point();
        if point.saturating_duration_since(now) <= poll_interval {
            self.timers.schedule(point, CompletionDue);
            self.completion_armed = true;
            tracing::debug!(
                "completion timer armed {}ms ahead",
                point.saturating_duration_since(now).as_millis()
            );
        }
    }

    /// Periodic countdown. Returns the time left, or `None` when idle.
    pub fn on_tick(&mut self, now: Instant, poll_interval: Duration) -> Option<Duration> {
        let request = self.active?;
        self.arm_if_near(now, poll_interval);
        Some(request.expected_end.saturating_duration_since(now))
    }

    /// True when the completion point of the active exposure has been reached
    pub fn fire_due(&mut self, now: Instant) -> bool {
        self.timers.pop_due(now).is_some() && self.active.is_some()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Handle the device's image-ready event.
    ///
    /// With an exposure active the buffer becomes the returned [`Frame`]. With
    /// none, the buffer is pulled to drain the device and dropped. A failed
    /// pull fails the active exposure.
    pub fn on_image_ready(
        &mut self,
        device: &mut dyn CaptureDevice,
        layout: PixelLayout,
    ) -> Result<Option<Frame>, DriverError> {
        let pulled = device.pull_image(layout);

        let Some(request) = self.active.take() else {
            if let Err(e) = pulled {
                tracing::debug!("draining unsolicited image failed: {}", e);
            }
            return Ok(None);
        };
        self.timers.cancel_all();
        self.completion_armed = false;

        let raw = pulled.map_err(|e| {
            tracing::error!("exposure failed, image pull error: {}", e);
            e
        })?;

        let expected = layout.frame_bytes(raw.width, raw.height);
        if raw.data.len() < expected {
            return Err(DriverError::InvalidArgument(format!(
                "image buffer holds {} bytes, {}x{} needs {}",
                raw.data.len(),
                raw.width,
                raw.height,
                expected
            )));
        }

        let data = if layout.channels == 3 {
            deinterleave_rgb(&raw.data[..expected], layout.bytes_per_sample())
        } else {
            raw.data[..expected].to_vec()
        };

        Ok(Some(Frame {
            width: raw.width,
            height: raw.height,
            bits: layout.bits_per_sample,
            channels: layout.channels,
            data,
            exposure: request.duration,
            captured_at: Utc::now(),
        }))
    }

    /// Cancel the hardware trigger and stop waiting for the frame
    pub fn abort(&mut self, device: &mut dyn CaptureDevice) -> Result<(), DriverError> {
        self.timers.cancel_all();
        self.completion_armed = false;
        if self.active.take().is_some() {
            tracing::info!("exposure aborted");
        }
        device.cancel_trigger()
    }

    /// Forget local state without touching the device
    pub fn reset(&mut self) {
        self.timers.cancel_all();
        self.completion_armed = false;
        self.active = None;
    }
}

/// Split packed `RGBRGB...` samples into three consecutive planes
pub fn deinterleave_rgb(packed: &[u8], bytes_per_sample: usize) -> Vec<u8> {
    let pixel = bytes_per_sample * 3;
    let pixels = packed.len() / pixel;
    let plane = pixels * bytes_per_sample;
    let mut planar = vec![0u8; plane * 3];

    for (i, chunk) in packed.chunks_exact(pixel).enumerate() {
        for channel in 0..3 {
            let src = &chunk[channel * bytes_per_sample..(channel + 1) * bytes_per_sample];
            let dst = channel * plane + i * bytes_per_sample;
            planar[dst..dst + bytes_per_sample].copy_from_slice(src);
        }
    }
    planar
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ManualClock;

    #[derive(Default)]
    struct FakeSensor {
        calls: Vec<&'static str>,
        image: Option<RawImage>,
    }

    impl CaptureDevice for FakeSensor {
        fn set_exposure_time(&mut self, _duration: Duration) -> Result<(), DriverError> {
            self.calls.push("expo");
            Ok(())
        }

        fn arm_software_trigger(&mut self) -> Result<(), DriverError> {
            self.calls.push("arm");
            Ok(())
        }

        fn trigger(&mut self) -> Result<(), DriverError> {
            self.calls.push("trigger");
            Ok(())
        }

        fn cancel_trigger(&mut self) -> Result<(), DriverError> {
            self.calls.push("cancel");
            Ok(())
        }

        fn pull_image(&mut self, _layout: PixelLayout) -> Result<RawImage, DriverError> {
            self.calls.push("pull");
            self.image.take().ok_or(DriverError::Sdk {
                code: -1,
                operation: "PullImage",
            })
        }
    }

    const POLL: Duration = Duration::from_millis(1000);

    #[test]
    fn test_long_exposure_arms_timer_on_tick_near_end() {
        let clock = Arc::new(ManualClock::new());
        let mut seq = ExposureSequencer::new(clock.clone());
        let mut cam = FakeSensor::default();

        seq.start(&mut cam, Duration::from_millis(2000), POLL).unwrap();
        assert_eq!(cam.calls, vec!["expo", "arm", "trigger"]);
        assert_eq!(seq.next_deadline(), None);

        clock.advance(POLL);
        assert_eq!(seq.on_tick(clock.now(), POLL), Some(Duration::from_millis(1000)));
        let deadline = seq.next_deadline().unwrap();
        assert_eq!(deadline, clock.at(Duration::from_millis(1950)));

        clock.advance(Duration::from_millis(950));
        assert!(seq.fire_due(clock.now()));
    }

    #[test]
    fn test_short_exposure_arms_timer_at_start() {
        let clock = Arc::new(ManualClock::new());
        let mut seq = ExposureSequencer::new(clock.clone());
        let mut cam = FakeSensor::default();
        seq.start(&mut cam, Duration::from_millis(500), POLL).unwrap();
        assert_eq!(seq.next_deadline(), Some(clock.at(Duration::from_millis(450))));

        seq.start(&mut cam, Duration::from_millis(20), POLL).unwrap_err();
    }

    #[test]
    fn test_rgb_frame_is_planar() {
        let clock = Arc::new(ManualClock::new());
        let mut seq = ExposureSequencer::new(clock.clone());
        let mut cam = FakeSensor {
            image: Some(RawImage {
                width: 2,
                height: 1,
                data: vec![1, 2, 3, 4, 5, 6],
            }),
            ..Default::default()
        };
        seq.start(&mut cam, Duration::from_millis(10), POLL).unwrap();
        let frame = seq
            .on_image_ready(&mut cam, PixelLayout::RGB24)
            .unwrap()
            .unwrap();
        assert_eq!(frame.data, vec![1, 4, 2, 5, 3, 6]);
        assert!(!seq.is_exposing());
        assert_eq!(seq.next_deadline(), None);
    }

    #[test]
    fn test_deinterleave_16_bit() {
        // Two pixels, little-endian u16 samples
        let packed = [0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x04, 0x00, 0x05, 0x00, 0x06, 0x00];
        assert_eq!(
            deinterleave_rgb(&packed, 2),
            vec![0x01, 0x00, 0x04, 0x00, 0x02, 0x00, 0x05, 0x00, 0x03, 0x00, 0x06, 0x00]
        );
    }

    #[test]
    fn test_pull_failure_fails_exposure() {
        let clock = Arc::new(ManualClock::new());
        let mut seq = ExposureSequencer::new(clock.clone());
        let mut cam = FakeSensor::default();
        seq.start(&mut cam, Duration::from_millis(10), POLL).unwrap();
        assert!(seq.on_image_ready(&mut cam, PixelLayout::MONO8).is_err());
        assert!(!seq.is_exposing());
        // Only one pull: no retry
        assert_eq!(cam.calls.iter().filter(|c| **c == "pull").count(), 1);
    }

    #[test]
    fn test_unsolicited_image_is_drained() {
        let clock = Arc::new(ManualClock::new());
        let mut seq = ExposureSequencer::new(clock);
        let mut cam = FakeSensor {
            image: Some(RawImage {
                width: 1,
                height: 1,
                data: vec![9],
            }),
            ..Default::default()
        };
        assert_eq!(seq.on_image_ready(&mut cam, PixelLayout::MONO8).unwrap(), None);
        assert_eq!(cam.calls, vec!["pull"]);
    }

    #[test]
    fn test_abort_cancels_trigger_and_timer() {
        let clock = Arc::new(ManualClock::new());
        let mut seq = ExposureSequencer::new(clock.clone());
        let mut cam = FakeSensor::default();
        seq.start(&mut cam, Duration::from_millis(300), POLL).unwrap();
        seq.abort(&mut cam).unwrap();
        assert_eq!(cam.calls.last(), Some(&"cancel"));
        clock.advance(POLL);
        assert!(!seq.fire_due(clock.now()));
        assert_eq!(seq.on_tick(clock.now(), POLL), None);
    }
}
