//! ToupTek cameras
//!
//! The vendor SDK is opaque: [`CameraSdk`] enumerates and opens cameras,
//! [`CameraHandle`] is one open camera. [`CameraRegistry`] is built once from
//! an enumeration and routes host requests to the [`ToupCamera`] drivers by
//! device name.
//!
//! SDK callbacks arrive as [`CameraEvent`]s, either pushed by the host through
//! [`ToupCamera::on_camera_event`] or drained from the handle on every tick.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::ConfigStore;
use crate::driver::{earliest, ConnectionState, Driver, Publisher};
use crate::error::DriverError;
use crate::exposure::{CaptureDevice, ExposureSequencer, Frame, PixelLayout, RawImage};
use crate::guide::{GuideAxis, GuideCompletion, GuideController, GuideDirection, PulseGuider};
use crate::property::{names, Capabilities, PropertySink, PropertyState, PropertyValue};
use crate::timer::Clock;

/// Cooling is reported settled within this many degrees of the setpoint
pub const TEMP_THRESHOLD: f64 = 0.25;

/// The SDK takes exposure times as a 32-bit microsecond count
pub const MAX_EXPOSURE: Duration = Duration::from_micros(u32::MAX as u64);

/// Interpret an SDK status code; negative values are failures
pub fn sdk_check(code: i32, operation: &'static str) -> Result<i32, DriverError> {
    if code < 0 {
        Err(DriverError::Sdk { code, operation })
    } else {
        Ok(code)
    }
}

bitflags! {
    /// Model feature flags reported by the enumeration
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ModelFlags: u32 {
        const MONO = 1 << 0;
        const RAW = 1 << 1;
        const ROI_HARDWARE = 1 << 2;
        const TEC_ONOFF = 1 << 3;
        const ST4 = 1 << 4;
        const GET_TEMPERATURE = 1 << 5;
        const BINSKIP = 1 << 6;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraModel {
    pub name: String,
    pub flags: ModelFlags,
    pub max_width: u32,
    pub max_height: u32,
    /// 8 or 16
    pub max_bit_depth: u8,
    /// Bits per sample in RAW mode
    pub raw_bits: u8,
    pub pixel_size_um: f64,
}

/// One enumerated camera
#[derive(Debug, Clone, PartialEq)]
pub struct CameraInstance {
    pub id: String,
    pub display_name: String,
    pub model: CameraModel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoFormat {
    Mono8,
    Mono16,
    Rgb,
    Raw,
}

impl VideoFormat {
    /// Order of the `CCD_VIDEO_FORMAT` switches
    pub const ALL: [VideoFormat; 4] = [
        VideoFormat::Mono8,
        VideoFormat::Mono16,
        VideoFormat::Rgb,
        VideoFormat::Raw,
    ];

    pub fn layout(self, model: &CameraModel) -> PixelLayout {
        match self {
            VideoFormat::Mono8 => PixelLayout::MONO8,
            VideoFormat::Mono16 => PixelLayout {
                bits_per_sample: 16,
                channels: 1,
            },
            VideoFormat::Rgb => PixelLayout::RGB24,
            VideoFormat::Raw => PixelLayout {
                bits_per_sample: model.raw_bits,
                channels: 1,
            },
        }
    }

    fn switches(self) -> Vec<bool> {
        Self::ALL.iter().map(|f| *f == self).collect()
    }
}

/// Image controls, in `CCD_CONTROLS` order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Control {
    Gain,
    Contrast,
    Hue,
    Saturation,
    Brightness,
    Gamma,
}

impl Control {
    pub const ALL: [Control; 6] = [
        Control::Gain,
        Control::Contrast,
        Control::Hue,
        Control::Saturation,
        Control::Brightness,
        Control::Gamma,
    ];
}

/// Region of interest in unbinned sensor pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn full(model: &CameraModel) -> Self {
        Self {
            x: 0,
            y: 0,
            width: model.max_width,
            height: model.max_height,
        }
    }

    /// Round every edge down to even and check it fits the sensor
    pub fn normalized(self, model: &CameraModel) -> Result<Self, DriverError> {
        let roi = Self {
            x: self.x & !1,
            y: self.y & !1,
            width: self.width & !1,
            height: self.height & !1,
        };
        let right = roi.x.saturating_add(roi.width);
        let bottom = roi.y.saturating_add(roi.height);
        if roi.width == 0 || right > model.max_width {
            return Err(DriverError::range(
                right as f64,
                2.0,
                model.max_width as f64,
            ));
        }
        if roi.height == 0 || bottom > model.max_height {
            return Err(DriverError::range(
                bottom as f64,
                2.0,
                model.max_height as f64,
            ));
        }
        Ok(roi)
    }
}

/// SDK callback events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraEvent {
    Image,
    Exposure,
    TriggerFailed,
    Error,
    Disconnected,
    Other(u32),
}

/// Camera discovery and opening
pub trait CameraSdk: Send + Sync {
    fn enumerate(&self) -> Vec<CameraInstance>;

    fn open(&self, id: &str) -> Result<Box<dyn CameraHandle>, DriverError>;
}

/// An open camera
pub trait CameraHandle: CaptureDevice + Send {
    fn st4_guide(&mut self, direction: GuideDirection, duration: Duration)
        -> Result<(), DriverError>;

    /// Sensor temperature in tenths of a degree
    fn temperature(&mut self) -> Result<i16, DriverError>;

    fn set_temperature(&mut self, tenths: i16) -> Result<(), DriverError>;

    fn set_cooler(&mut self, on: bool) -> Result<(), DriverError>;

    fn set_roi(&mut self, roi: Roi) -> Result<(), DriverError>;

    fn set_binning(&mut self, bin: u32) -> Result<(), DriverError>;

    /// `true` for software trigger (single frames), `false` for free-running video
    fn set_trigger_mode(&mut self, software: bool) -> Result<(), DriverError>;

    fn set_video_format(&mut self, format: VideoFormat) -> Result<(), DriverError>;

    fn set_control(&mut self, control: Control, value: i32) -> Result<(), DriverError>;

    /// Events queued since the last call
    fn drain_events(&mut self) -> Vec<CameraEvent> {
        Vec::new()
    }

    fn close(&mut self) -> Result<(), DriverError>;
}

/// The open handle seen as capture device and ST4 guider
struct Sensor<'a>(&'a mut dyn CameraHandle);

impl CaptureDevice for Sensor<'_> {
    fn set_exposure_time(&mut self, duration: Duration) -> Result<(), DriverError> {
        self.0.set_exposure_time(duration)
    }

    fn arm_software_trigger(&mut self) -> Result<(), DriverError> {
        self.0.arm_software_trigger()
    }

    fn trigger(&mut self) -> Result<(), DriverError> {
        self.0.trigger()
    }

    fn cancel_trigger(&mut self) -> Result<(), DriverError> {
        self.0.cancel_trigger()
    }

    fn pull_image(&mut self, layout: PixelLayout) -> Result<RawImage, DriverError> {
        self.0.pull_image(layout)
    }
}

impl PulseGuider for Sensor<'_> {
    fn start_pulse(
        &mut self,
        direction: GuideDirection,
        duration: Duration,
    ) -> Result<(), DriverError> {
        self.0.st4_guide(direction, duration)
    }
}

fn guide_property(axis: GuideAxis) -> &'static str {
    match axis {
        GuideAxis::Declination => names::TELESCOPE_TIMED_GUIDE_NS,
        GuideAxis::RightAscension => names::TELESCOPE_TIMED_GUIDE_WE,
    }
}

fn publish_completion(publisher: &mut Publisher, completion: GuideCompletion) {
    publisher.set(
        guide_property(completion.pulse.direction.axis()),
        PropertyValue::Number(vec![0.0, 0.0]),
        completion.state,
    );
}

/// Cooler setpoint tracking
#[derive(Debug, Clone, Copy, PartialEq)]
struct Cooling {
    current: Option<f64>,
    setpoint: Option<f64>,
    state: PropertyState,
}

pub struct ToupCamera {
    name: String,
    instance: CameraInstance,
    sdk: Arc<dyn CameraSdk>,
    publisher: Publisher,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    capabilities: Capabilities,
    handle: Option<Box<dyn CameraHandle>>,
    state: ConnectionState,
    sequencer: ExposureSequencer,
    guide: GuideController,
    cooling: Cooling,
    cooler_on: bool,
    format: VideoFormat,
    roi: Roi,
    binning: u32,
    streaming: bool,
    controls: BTreeMap<Control, f64>,
}

impl ToupCamera {
    pub fn new(
        name: impl Into<String>,
        instance: CameraInstance,
        sdk: Arc<dyn CameraSdk>,
        sink: Box<dyn PropertySink>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
    ) -> Self {
        let name = name.into();
        let flags = instance.model.flags;
        let mut capabilities = Capabilities::ABORT | Capabilities::STREAMING;
        if flags.contains(ModelFlags::TEC_ONOFF) {
            capabilities |= Capabilities::COOLING;
        }
        if flags.contains(ModelFlags::ST4) {
            capabilities |= Capabilities::GUIDING;
        }
        if flags.contains(ModelFlags::GET_TEMPERATURE) {
            capabilities |= Capabilities::TEMPERATURE;
        }
        let format = if flags.contains(ModelFlags::MONO) {
            VideoFormat::Mono8
        } else {
            VideoFormat::Rgb
        };
        Self {
            publisher: Publisher::new(name.clone(), sink),
            name,
            roi: Roi::full(&instance.model),
            instance,
            sdk,
            sequencer: ExposureSequencer::new(clock.clone()),
            guide: GuideController::new(clock.clone()),
            clock,
            poll_interval,
            capabilities,
            handle: None,
            state: ConnectionState::Disconnected,
            cooling: Cooling {
                current: None,
                setpoint: None,
                state: PropertyState::Idle,
            },
            cooler_on: false,
            format,
            binning: 1,
            streaming: false,
            controls: BTreeMap::new(),
        }
    }

    pub fn instance(&self) -> &CameraInstance {
        &self.instance
    }

    pub fn video_format(&self) -> VideoFormat {
        self.format
    }

    pub fn roi(&self) -> Roi {
        self.roi
    }

    pub fn binning(&self) -> u32 {
        self.binning
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn is_exposing(&self) -> bool {
        self.sequencer.is_exposing()
    }

    pub fn temperature(&self) -> Option<f64> {
        self.cooling.current
    }

    fn layout(&self) -> PixelLayout {
        self.format.layout(&self.instance.model)
    }

    fn require(&mut self, capability: Capabilities, property: &str) -> bool {
        if self.capabilities.contains(capability) {
            return true;
        }
        self.publisher
            .alert(property, &DriverError::Unsupported("camera lacks this feature"))
    }

    /// Run `op` on the open handle, publishing Alert on `property` on failure
    fn with_handle<R>(
        &mut self,
        property: &str,
        op: impl FnOnce(&mut dyn CameraHandle) -> Result<R, DriverError>,
    ) -> Option<R> {
        let result = match self.handle.as_mut() {
            Some(handle) => op(handle.as_mut()),
            None => Err(DriverError::NotConnected),
        };
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.publisher.alert(property, &e);
                None
            }
        }
    }

    fn open(&mut self) -> Result<(), DriverError> {
        // Held in `self.handle` from here on so a failed setup still gets closed
        let handle = self.handle.insert(self.sdk.open(&self.instance.id)?);
        handle.set_trigger_mode(true)?;
        handle.set_video_format(self.format)?;
        handle.set_binning(self.binning)?;
        handle.set_roi(self.roi)?;

        let model = &self.instance.model;
        self.publisher.set(
            names::CCD_INFO,
            PropertyValue::Number(vec![
                model.max_width as f64,
                model.max_height as f64,
                model.pixel_size_um,
                self.layout().bits_per_sample as f64,
            ]),
            PropertyState::Ok,
        );
        self.publisher.set(
            names::CCD_VIDEO_FORMAT,
            PropertyValue::Switch(self.format.switches()),
            PropertyState::Ok,
        );
        tracing::info!("{}: online ({})", self.name, model.name);
        Ok(())
    }

    // --- exposure ---

    fn start_exposure(&mut self, seconds: f64) -> bool {
        let duration = match Duration::try_from_secs_f64(seconds) {
            Ok(duration) if duration <= MAX_EXPOSURE => duration,
            _ => {
                return self.publisher.alert(
                    names::CCD_EXPOSURE,
                    &DriverError::range(seconds, 0.0, MAX_EXPOSURE.as_secs_f64()),
                );
            }
        };
        if self.streaming {
            return self.publisher.alert(
                names::CCD_EXPOSURE,
                &DriverError::InvalidArgument("camera is streaming".into()),
            );
        }
        let poll = self.poll_interval;
        let Self {
            handle, sequencer, ..
        } = self;
        let result = match handle.as_mut() {
            Some(handle) => sequencer.start(&mut Sensor(handle.as_mut()), duration, poll),
            None => Err(DriverError::NotConnected),
        };
        match result {
            Ok(_) => {
                self.publisher.set(
                    names::CCD_EXPOSURE,
                    PropertyValue::number(seconds),
                    PropertyState::Busy,
                );
                true
            }
            Err(e) => self.publisher.alert(names::CCD_EXPOSURE, &e),
        }
    }

    fn abort_exposure(&mut self) -> bool {
        let Self {
            handle, sequencer, ..
        } = self;
        let result = match handle.as_mut() {
            Some(handle) => sequencer.abort(&mut Sensor(handle.as_mut())),
            None => {
                sequencer.reset();
                Ok(())
            }
        };
        self.publisher.state(names::CCD_EXPOSURE, PropertyState::Idle);
        match result {
            Ok(()) => {
                self.publisher
                    .state(names::CCD_ABORT_EXPOSURE, PropertyState::Ok);
                true
            }
            Err(e) => self.publisher.alert(names::CCD_ABORT_EXPOSURE, &e),
        }
    }

    /// Handle one SDK event
    pub fn on_camera_event(&mut self, event: CameraEvent) -> bool {
        tracing::debug!("{}: event {:?}", self.name, event);
        match event {
            CameraEvent::Image => self.on_image(),
            CameraEvent::Disconnected => {
                tracing::warn!("{}: camera timed out", self.name);
                self.publisher
                    .alert(names::CONNECTION, &DriverError::NotConnected)
            }
            CameraEvent::TriggerFailed if self.sequencer.is_exposing() => {
                self.sequencer.reset();
                self.publisher.alert(
                    names::CCD_EXPOSURE,
                    &DriverError::Sdk {
                        code: -1,
                        operation: "trigger",
                    },
                )
            }
            _ => true,
        }
    }

    fn on_image(&mut self) -> bool {
        let layout = self.layout();
        let Some(handle) = self.handle.as_mut() else {
            return false;
        };

        if self.streaming {
            return match handle.pull_image(layout) {
                Ok(raw) => {
                    let frame = Frame {
                        width: raw.width,
                        height: raw.height,
                        bits: layout.bits_per_sample,
                        channels: layout.channels,
                        data: raw.data,
                        exposure: Duration::ZERO,
                        captured_at: Utc::now(),
                    };
                    self.publisher.frame(frame);
                    true
                }
                Err(e) => {
                    tracing::error!("{}: failed to pull video frame: {}", self.name, e);
                    false
                }
            };
        }

        match self
            .sequencer
            .on_image_ready(&mut Sensor(handle.as_mut()), layout)
        {
            Ok(Some(frame)) => {
                tracing::info!(
                    "{}: {}x{} frame received",
                    self.name,
                    frame.width,
                    frame.height
                );
                self.publisher.frame(frame);
                self.publisher.set(
                    names::CCD_EXPOSURE,
                    PropertyValue::number(0.0),
                    PropertyState::Ok,
                );
                true
            }
            Ok(None) => true,
            Err(e) => self.publisher.alert(names::CCD_EXPOSURE, &e),
        }
    }

    fn drain_events(&mut self) -> bool {
        let events = match self.handle.as_mut() {
            Some(handle) => handle.drain_events(),
            None => return true,
        };
        events
            .into_iter()
            .fold(true, |ok, event| self.on_camera_event(event) && ok)
    }

    // --- cooling ---

    fn activate_cooler(&mut self, on: bool) -> bool {
        if !self.require(Capabilities::COOLING, names::CCD_COOLER) {
            return false;
        }
        if self
            .with_handle(names::CCD_COOLER, |h| h.set_cooler(on))
            .is_none()
        {
            // Switch falls back to the state it had
            let was = self.cooler_on;
            self.publisher.set(
                names::CCD_COOLER,
                PropertyValue::Switch(vec![was, !was]),
                PropertyState::Alert,
            );
            return false;
        }
        self.cooler_on = on;
        self.publisher.set(
            names::CCD_COOLER,
            PropertyValue::Switch(vec![on, !on]),
            PropertyState::Ok,
        );
        true
    }

    fn set_temperature(&mut self, celsius: f64) -> bool {
        if !self.require(Capabilities::COOLING, names::CCD_TEMPERATURE) {
            return false;
        }
        if !(-50.0..=50.0).contains(&celsius) {
            return self
                .publisher
                .alert(names::CCD_TEMPERATURE, &DriverError::range(celsius, -50.0, 50.0));
        }
        if let Some(current) = self.cooling.current {
            if (celsius - current).abs() < TEMP_THRESHOLD {
                self.cooling.setpoint = Some(celsius);
                self.cooling.state = PropertyState::Ok;
                self.publisher.set(
                    names::CCD_TEMPERATURE,
                    PropertyValue::number(current),
                    PropertyState::Ok,
                );
                return true;
            }
        }
        if !self.activate_cooler(true) {
            return self.publisher.alert(
                names::CCD_TEMPERATURE,
                &DriverError::Unsupported("cooler did not switch on"),
            );
        }
        let tenths = (celsius * 10.0).round() as i16;
        if self
            .with_handle(names::CCD_TEMPERATURE, |h| h.set_temperature(tenths))
            .is_none()
        {
            self.cooling.state = PropertyState::Alert;
            return false;
        }
        tracing::info!("{}: cooling to {:+06.2} C", self.name, celsius);
        self.cooling.setpoint = Some(celsius);
        self.cooling.state = PropertyState::Busy;
        self.publisher.set(
            names::CCD_TEMPERATURE,
            PropertyValue::number(self.cooling.current.unwrap_or(celsius)),
            PropertyState::Busy,
        );
        true
    }

    fn poll_temperature(&mut self) -> bool {
        if !self.capabilities.contains(Capabilities::TEMPERATURE) {
            return true;
        }
        let Some(handle) = self.handle.as_mut() else {
            return false;
        };
        let reading = match handle.temperature() {
            Ok(tenths) => tenths as f64 / 10.0,
            Err(e) => {
                self.cooling.state = PropertyState::Alert;
                return self.publisher.alert(names::CCD_TEMPERATURE, &e);
            }
        };
        let previous = self.cooling.current.replace(reading);

        match self.cooling.state {
            PropertyState::Busy => {
                let settled = self
                    .cooling
                    .setpoint
                    .map_or(true, |target| (target - reading).abs() <= TEMP_THRESHOLD);
                if settled {
                    self.cooling.state = PropertyState::Ok;
                }
                self.publisher.set(
                    names::CCD_TEMPERATURE,
                    PropertyValue::number(reading),
                    self.cooling.state,
                );
            }
            // A good reading after a failed one clears the alert
            PropertyState::Alert => {
                self.cooling.state = PropertyState::Ok;
                self.publisher.set(
                    names::CCD_TEMPERATURE,
                    PropertyValue::number(reading),
                    PropertyState::Ok,
                );
            }
            PropertyState::Idle | PropertyState::Ok => {
                let changed =
                    previous.map_or(true, |p| (p - reading).abs() > TEMP_THRESHOLD / 10.0);
                if changed {
                    self.publisher.set(
                        names::CCD_TEMPERATURE,
                        PropertyValue::number(reading),
                        self.cooling.state,
                    );
                }
            }
        }
        true
    }

    // --- frame geometry ---

    fn set_frame(&mut self, values: &[f64]) -> bool {
        let [x, y, w, h] = match values {
            [x, y, w, h, ..] => [*x, *y, *w, *h],
            _ => {
                return self.publisher.alert(
                    names::CCD_FRAME,
                    &DriverError::InvalidArgument("expected [x, y, width, height]".into()),
                )
            }
        };
        if [x, y, w, h].iter().any(|v| !(v.is_finite() && *v >= 0.0)) {
            return self.publisher.alert(
                names::CCD_FRAME,
                &DriverError::InvalidArgument("frame values must be non-negative".into()),
            );
        }
        let requested = Roi {
            x: x as u32,
            y: y as u32,
            width: w as u32,
            height: h as u32,
        };
        self.apply_roi(requested)
    }

    fn apply_roi(&mut self, requested: Roi) -> bool {
        let roi = match requested.normalized(&self.instance.model) {
            Ok(roi) => roi,
            Err(e) => return self.publisher.alert(names::CCD_FRAME, &e),
        };
        if self
            .with_handle(names::CCD_FRAME, |h| h.set_roi(roi))
            .is_none()
        {
            return false;
        }
        self.roi = roi;
        tracing::debug!(
            "{}: ROI {}x{} at ({}, {}), bin {}",
            self.name,
            roi.width,
            roi.height,
            roi.x,
            roi.y,
            self.binning
        );
        self.publisher.set(
            names::CCD_FRAME,
            PropertyValue::Number(vec![
                roi.x as f64,
                roi.y as f64,
                roi.width as f64,
                roi.height as f64,
            ]),
            PropertyState::Ok,
        );
        true
    }

    fn set_binning(&mut self, values: &[f64]) -> bool {
        let bin = values.first().copied().unwrap_or(1.0);
        if !(1.0..=8.0).contains(&bin) {
            return self
                .publisher
                .alert(names::CCD_BINNING, &DriverError::range(bin, 1.0, 8.0));
        }
        let bin = bin as u32;
        if self
            .with_handle(names::CCD_BINNING, |h| h.set_binning(bin))
            .is_none()
        {
            return false;
        }
        self.binning = bin;
        self.publisher.set(
            names::CCD_BINNING,
            PropertyValue::Number(vec![bin as f64, bin as f64]),
            PropertyState::Ok,
        );
        let roi = self.roi;
        self.apply_roi(roi)
    }

    // --- video ---

    fn set_streaming(&mut self, on: bool) -> bool {
        if !self.require(Capabilities::STREAMING, names::CCD_VIDEO_STREAM) {
            return false;
        }
        if on && self.sequencer.is_exposing() {
            return self.publisher.alert(
                names::CCD_VIDEO_STREAM,
                &DriverError::InvalidArgument("exposure in progress".into()),
            );
        }
        // Video runs free; single frames need the software trigger back
        if self
            .with_handle(names::CCD_VIDEO_STREAM, |h| h.set_trigger_mode(!on))
            .is_none()
        {
            return false;
        }
        self.streaming = on;
        self.publisher.set(
            names::CCD_VIDEO_STREAM,
            PropertyValue::Switch(vec![on, !on]),
            if on {
                PropertyState::Busy
            } else {
                PropertyState::Idle
            },
        );
        true
    }

    fn set_video_format(&mut self, states: &[bool]) -> bool {
        let Some(format) = states
            .iter()
            .position(|s| *s)
            .and_then(|i| VideoFormat::ALL.get(i).copied())
        else {
            return self.publisher.alert(
                names::CCD_VIDEO_FORMAT,
                &DriverError::InvalidArgument("unknown video format".into()),
            );
        };
        let model = &self.instance.model;
        let refusal = if self.streaming {
            Some("cannot change format while streaming")
        } else if format == VideoFormat::Mono16 && model.max_bit_depth <= 8 {
            Some("only 8-bit formats are supported")
        } else if format == VideoFormat::Raw && !model.flags.contains(ModelFlags::RAW) {
            Some("RAW format is not supported")
        } else if format == VideoFormat::Rgb && model.flags.contains(ModelFlags::MONO) {
            Some("monochrome sensor has no RGB mode")
        } else {
            None
        };
        if let Some(reason) = refusal {
            return self.publisher.alert(
                names::CCD_VIDEO_FORMAT,
                &DriverError::InvalidArgument(reason.into()),
            );
        }

        if self
            .with_handle(names::CCD_VIDEO_FORMAT, |h| h.set_video_format(format))
            .is_none()
        {
            return false;
        }
        self.format = format;
        self.publisher.set(
            names::CCD_VIDEO_FORMAT,
            PropertyValue::Switch(format.switches()),
            PropertyState::Ok,
        );
        true
    }

    fn set_controls(&mut self, values: &[f64]) -> bool {
        let changed: Vec<(Control, f64)> = Control::ALL
            .iter()
            .zip(values)
            .filter(|(control, value)| {
                self.controls
                    .get(*control)
                    .map_or(true, |old| (*old - **value).abs() >= 0.0001)
            })
            .map(|(control, value)| (*control, *value))
            .collect();

        for (control, value) in changed {
            if self
                .with_handle(names::CCD_CONTROLS, |h| h.set_control(control, value as i32))
                .is_none()
            {
                return false;
            }
            self.controls.insert(control, value);
        }
        let current = Control::ALL
            .iter()
            .map(|c| self.controls.get(c).copied().unwrap_or(0.0))
            .collect();
        self.publisher.set(
            names::CCD_CONTROLS,
            PropertyValue::Number(current),
            PropertyState::Ok,
        );
        true
    }

    // --- guiding ---

    fn guide(&mut self, property: &str, values: &[f64]) -> bool {
        if !self.require(Capabilities::GUIDING, property) {
            return false;
        }
        let (first, second) = if property == names::TELESCOPE_TIMED_GUIDE_NS {
            (GuideDirection::North, GuideDirection::South)
        } else {
            (GuideDirection::West, GuideDirection::East)
        };
        let a = values.first().copied().unwrap_or(0.0);
        let b = values.get(1).copied().unwrap_or(0.0);
        let (direction, millis) = if a > 0.0 { (first, a) } else { (second, b) };
        if millis.is_nan() || millis <= 0.0 {
            self.publisher.state(property, PropertyState::Ok);
            return true;
        }

        let Self {
            handle,
            guide,
            publisher,
            ..
        } = self;
        let Some(handle) = handle.as_mut() else {
            return publisher.alert(property, &DriverError::NotConnected);
        };
        let state = guide.pulse(
            &mut Sensor(handle.as_mut()),
            direction,
            Duration::from_millis(millis as u64),
            &mut |c| publish_completion(publisher, c),
        );
        match state {
            PropertyState::Alert => publisher.alert(
                property,
                &format!("{:?} pulse guiding failed", direction),
            ),
            state => {
                publisher.set(property, PropertyValue::Number(values.to_vec()), state);
                true
            }
        }
    }

    /// Persist the choices worth restoring next session
    pub fn save_config(&self, store: &mut dyn ConfigStore) -> Result<(), DriverError> {
        store.save_item(
            &self.name,
            names::CCD_VIDEO_FORMAT,
            &PropertyValue::Switch(self.format.switches()),
        )?;
        if self.capabilities.contains(Capabilities::COOLING) {
            store.save_item(
                &self.name,
                names::CCD_COOLER,
                &PropertyValue::Switch(vec![self.cooler_on, !self.cooler_on]),
            )?;
        }
        if !self.controls.is_empty() {
            let values = Control::ALL
                .iter()
                .map(|c| self.controls.get(c).copied().unwrap_or(0.0))
                .collect();
            store.save_item(&self.name, names::CCD_CONTROLS, &PropertyValue::Number(values))?;
        }
        store.flush()
    }
}

impl Driver for ToupCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn connection_state(&self) -> ConnectionState {
        self.state
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn connect(&mut self) -> bool {
        if self.state == ConnectionState::Connected {
            return true;
        }
        self.state = ConnectionState::Handshaking;
        match self.open() {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                self.publisher.set(
                    names::CONNECTION,
                    PropertyValue::Switch(vec![true, false]),
                    PropertyState::Ok,
                );
                true
            }
            Err(e) => {
                if let Some(mut handle) = self.handle.take() {
                    if let Err(close_err) = handle.close() {
                        tracing::warn!("{}: close after failed setup: {}", self.name, close_err);
                    }
                }
                self.state = ConnectionState::Disconnected;
                self.publisher.alert(names::CONNECTION, &e)
            }
        }
    }

    fn disconnect(&mut self) -> bool {
        let Self {
            guide,
            publisher,
            handle,
            sequencer,
            name,
            ..
        } = self;
        match handle.as_mut() {
            Some(handle) => {
                guide.cancel_all(Some(&mut Sensor(handle.as_mut())), &mut |c| {
                    publish_completion(publisher, c)
                });
                if sequencer.is_exposing() {
                    if let Err(e) = sequencer.abort(&mut Sensor(handle.as_mut())) {
                        tracing::warn!("{}: cancelling exposure on disconnect failed: {}", name, e);
                    }
                }
            }
            None => guide.cancel_all(None, &mut |c| publish_completion(publisher, c)),
        }
        self.sequencer.reset();

        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = handle.close() {
                tracing::warn!("{}: close failed: {}", self.name, e);
            }
        }
        self.streaming = false;
        self.cooling.current = None;
        self.cooling.state = PropertyState::Idle;
        self.state = ConnectionState::Disconnected;
        self.publisher.set(
            names::CONNECTION,
            PropertyValue::Switch(vec![false, true]),
            PropertyState::Idle,
        );
        tracing::info!("{}: offline", self.name);
        true
    }

    fn timer_tick(&mut self) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        let now = self.clock.now();
        if let Some(left) = self.sequencer.on_tick(now, self.poll_interval) {
            self.publisher.set(
                names::CCD_EXPOSURE,
                PropertyValue::number(left.as_secs_f64()),
                PropertyState::Busy,
            );
        }
        let temperature_ok = self.poll_temperature();
        let events_ok = self.drain_events();
        temperature_ok && events_ok
    }

    fn run_timers(&mut self) -> bool {
        let now = self.clock.now();
        if self.sequencer.fire_due(now) {
            tracing::debug!("{}: exposure reached its completion point", self.name);
            self.publisher.set(
                names::CCD_EXPOSURE,
                PropertyValue::number(0.0),
                PropertyState::Busy,
            );
        }

        let Self {
            handle,
            guide,
            publisher,
            ..
        } = self;
        if let Some(handle) = handle.as_mut() {
            guide.fire_due(&mut Sensor(handle.as_mut()), now, &mut |c| {
                publish_completion(publisher, c)
            });
        }
        self.drain_events()
    }

    fn next_deadline(&self) -> Option<Instant> {
        earliest([self.sequencer.next_deadline(), self.guide.next_deadline()])
    }

    fn update_number(&mut self, name: &str, values: &[f64]) -> bool {
        let first = values.first().copied();
        match (name, first) {
            (names::CCD_EXPOSURE, Some(seconds)) => self.start_exposure(seconds),
            (names::CCD_TEMPERATURE, Some(celsius)) => self.set_temperature(celsius),
            (names::CCD_FRAME, _) => self.set_frame(values),
            (names::CCD_BINNING, _) => self.set_binning(values),
            (names::CCD_CONTROLS, _) => self.set_controls(values),
            (names::TELESCOPE_TIMED_GUIDE_NS | names::TELESCOPE_TIMED_GUIDE_WE, _) => {
                self.guide(name, values)
            }
            _ => false,
        }
    }

    fn update_switch(&mut self, name: &str, states: &[bool]) -> bool {
        let on = states.first().copied().unwrap_or(false);
        match name {
            names::CONNECTION => {
                if on {
                    self.connect()
                } else {
                    self.disconnect()
                }
            }
            names::CCD_ABORT_EXPOSURE => self.abort_exposure(),
            names::CCD_COOLER => self.activate_cooler(on),
            names::CCD_VIDEO_STREAM => self.set_streaming(on),
            names::CCD_VIDEO_FORMAT => self.set_video_format(states),
            _ => false,
        }
    }

    fn update_text(&mut self, _name: &str, _values: &[String]) -> bool {
        false
    }
}

/// Every camera found at startup, addressed by device name
pub struct CameraRegistry {
    cameras: Vec<ToupCamera>,
}

impl CameraRegistry {
    /// Enumerate once and build a driver per camera. Duplicate display
    /// names get a numeric suffix.
    pub fn discover(
        sdk: Arc<dyn CameraSdk>,
        mut sink_for: impl FnMut(&str) -> Box<dyn PropertySink>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
    ) -> Self {
        let instances = sdk.enumerate();
        if instances.is_empty() {
            tracing::warn!("no ToupTek camera detected, powered on?");
        }
        let mut seen: BTreeMap<String, usize> = BTreeMap::new();
        let cameras = instances
            .into_iter()
            .map(|instance| {
                let base = format!("ToupCam {}", instance.display_name);
                let count = seen.entry(base.clone()).or_insert(0);
                *count += 1;
                let name = if *count == 1 {
                    base
                } else {
                    format!("{} {}", base, count)
                };
                let sink = sink_for(&name);
                ToupCamera::new(
                    name,
                    instance,
                    sdk.clone(),
                    sink,
                    clock.clone(),
                    poll_interval,
                )
            })
            .collect();
        Self { cameras }
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.cameras.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&ToupCamera> {
        self.cameras.iter().find(|c| c.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ToupCamera> {
        self.cameras.iter_mut().find(|c| c.name == name)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ToupCamera> {
        self.cameras.iter_mut()
    }

    pub fn into_drivers(self) -> Vec<ToupCamera> {
        self.cameras
    }

    /// Apply `op` to the named camera, or to all of them for `None`.
    /// False when no camera matched or any call returned false.
    pub fn route(
        &mut self,
        device: Option<&str>,
        mut op: impl FnMut(&mut ToupCamera) -> bool,
    ) -> bool {
        let mut matched = false;
        let mut ok = true;
        for camera in self
            .cameras
            .iter_mut()
            .filter(|c| device.map_or(true, |d| c.name == d))
        {
            matched = true;
            ok &= op(camera);
        }
        matched && ok
    }

    pub fn update_number(&mut self, device: Option<&str>, name: &str, values: &[f64]) -> bool {
        self.route(device, |c| c.update_number(name, values))
    }

    pub fn update_switch(&mut self, device: Option<&str>, name: &str, states: &[bool]) -> bool {
        self.route(device, |c| c.update_switch(name, states))
    }

    pub fn on_camera_event(&mut self, device: &str, event: CameraEvent) -> bool {
        self.route(Some(device), |c| c.on_camera_event(event))
    }
}
