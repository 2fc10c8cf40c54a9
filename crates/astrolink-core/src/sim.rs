//! Simulation mode - in-process device models
//!
//! [`MicrotouchSimulator`] answers the binary protocol the way the controller
//! does, so the driver (and the host with `"simulate": true`) can run without
//! hardware. The motor steps toward its target at a fixed rate measured on
//! the driver's [`Clock`]; the sensor reports a slow drift with a little noise.
//!
//! [`SimulatedCameraSdk`] stands in for the ToupTek SDK with one cooled,
//! guide-port equipped sensor.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::devices::microtouch::{opcode, MotorSpeed};
use crate::devices::toupcam::{
    sdk_check, CameraEvent, CameraHandle, CameraInstance, CameraModel, CameraSdk, Control,
    ModelFlags, Roi, VideoFormat,
};
use crate::error::DriverError;
use crate::exposure::{CaptureDevice, PixelLayout, RawImage};
use crate::guide::GuideDirection;
use crate::protocol::binary::decode_digits;
use crate::protocol::{ProtocolError, Transport};
use crate::timer::Clock;

/// Steps per second at normal motor speed
const NORMAL_STEP_RATE: f64 = 2000.0;

struct SimState {
    clock: Arc<dyn Clock>,
    last_update: Instant,
    started: Instant,
    position: f64,
    target: i64,
    motor_speed: MotorSpeed,
    compensation: bool,
    /// Sixteenths of a degree
    calibration: i16,
    /// 1/128 units
    coefficient: i32,
    ambient: f64,
    rng: StdRng,
    pending: VecDeque<u8>,
}

impl SimState {
    fn step_rate(&self) -> f64 {
        match self.motor_speed {
            MotorSpeed::Normal => NORMAL_STEP_RATE,
            MotorSpeed::Fast => NORMAL_STEP_RATE * 2.0,
        }
    }

    fn advance(&mut self) {
        let now = self.clock.now();
        let dt = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.last_update = now;

        let remaining = self.target as f64 - self.position;
        let max_step = self.step_rate() * dt;
        self.position += remaining.clamp(-max_step, max_step);
    }

    fn moving(&self) -> bool {
        (self.target as f64 - self.position).abs() >= 0.5
    }

    /// Sensor reading in sixteenths, without calibration
    fn sensor(&mut self) -> i16 {
        let t = self.clock.now().saturating_duration_since(self.started).as_secs_f64();
        // Cools a couple of degrees over the first hour
        let drift = -2.0 * (1.0 - (-t / 3600.0).exp());
        let noise = self.rng.gen_range(-0.05..0.05);
        ((self.ambient + drift + noise) * 16.0).round() as i16
    }

    fn reply(&mut self, bytes: &[u8]) {
        self.pending.extend(bytes);
    }

    fn execute(&mut self, request: &[u8]) -> Result<(), ProtocolError> {
        let (&op, payload) = request
            .split_first()
            .ok_or_else(|| ProtocolError::malformed("empty request"))?;
        self.advance();

        match op {
            opcode::GET_POSITION => {
                let mut reply = [op, 0, 0];
                LittleEndian::write_u16(&mut reply[1..], self.position.round() as u16);
                self.reply(&reply);
            }
            opcode::IS_MOVING => {
                let moving = self.moving() as u8;
                self.reply(&[op, moving]);
            }
            opcode::GET_TEMPERATURE => {
                let mut reply = [op, 0, 0, 0, 0, 0];
                let sensor = self.sensor();
                BigEndian::write_i16(&mut reply[1..3], sensor);
                LittleEndian::write_i16(&mut reply[4..6], self.calibration);
                self.reply(&reply);
            }
            opcode::GET_COEFF => {
                let mut reply = [op, 0, 0, 0, 0];
                LittleEndian::write_i32(&mut reply[1..], self.coefficient);
                self.reply(&reply);
            }
            opcode::GET_MOTOR_SPEED => {
                let byte = self.motor_speed.wire();
                self.reply(&[op, byte]);
            }
            opcode::UPDATE_POSITION => {
                self.target = decode_digits(payload)? as i64;
            }
            opcode::RESET_POSITION => {
                let position = decode_digits(payload)? as i64;
                self.position = position as f64;
                self.target = position;
            }
            opcode::HALT => {
                self.position = self.position.round();
                self.target = self.position as i64;
            }
            opcode::TEMPCOMP_ON => self.compensation = true,
            opcode::TEMPCOMP_OFF => self.compensation = false,
            opcode::SET_COEFF => {
                self.coefficient = payload
                    .get(..4)
                    .map(LittleEndian::read_i32)
                    .ok_or_else(|| ProtocolError::malformed("short coefficient payload"))?;
            }
            opcode::SET_TEMP_OFFSET => {
                self.calibration = payload
                    .get(..2)
                    .map(LittleEndian::read_i16)
                    .ok_or_else(|| ProtocolError::malformed("short calibration payload"))?;
            }
            opcode::SET_MOTOR_SPEED => {
                let byte = payload.first().copied().unwrap_or(0);
                self.motor_speed = MotorSpeed::from_wire(byte)
                    .ok_or_else(|| ProtocolError::malformed(format!("motor speed {}", byte)))?;
            }
            other => {
                tracing::debug!("simulator: ignoring opcode 0x{:02x}", other);
            }
        }
        Ok(())
    }
}

/// Microtouch firmware model; clones share one device
#[derive(Clone)]
pub struct MicrotouchSimulator {
    state: Arc<Mutex<SimState>>,
}

impl MicrotouchSimulator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_rng(clock, StdRng::from_entropy())
    }

    /// Deterministic noise for tests
    pub fn seeded(clock: Arc<dyn Clock>, seed: u64) -> Self {
        Self::with_rng(clock, StdRng::seed_from_u64(seed))
    }

    fn with_rng(clock: Arc<dyn Clock>, mut rng: StdRng) -> Self {
        let now = clock.now();
        let position = rng.gen_range(10_000..30_000);
        Self {
            state: Arc::new(Mutex::new(SimState {
                clock,
                last_update: now,
                started: now,
                position: position as f64,
                target: position,
                motor_speed: MotorSpeed::Normal,
                compensation: false,
                calibration: 0,
                coefficient: 0,
                ambient: rng.gen_range(5.0..15.0),
                rng,
                pending: VecDeque::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // The state stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn position(&self) -> i64 {
        let mut state = self.lock();
        state.advance();
        state.position.round() as i64
    }

    pub fn target(&self) -> i64 {
        self.lock().target
    }

    pub fn compensation(&self) -> bool {
        self.lock().compensation
    }
}

impl Transport for MicrotouchSimulator {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.lock().execute(bytes)
    }

    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        let mut state = self.lock();
        match state.pending.iter().position(|&b| b == terminator) {
            Some(end) => {
                let mut reply: Vec<u8> = state.pending.drain(..=end).collect();
                reply.pop();
                Ok(reply)
            }
            None => Err(ProtocolError::Timeout {
                expected: format!("terminator {:?}", terminator as char),
                received: state.pending.len(),
                waited_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        let mut state = self.lock();
        if state.pending.len() < len {
            let received = state.pending.len();
            state.pending.clear();
            return Err(ProtocolError::Timeout {
                expected: format!("{} bytes", len),
                received,
                waited_ms: timeout.as_millis() as u64,
            });
        }
        Ok(state.pending.drain(..len).collect())
    }

    fn discard_input(&mut self) -> Result<(), ProtocolError> {
        self.lock().pending.clear();
        Ok(())
    }
}

/// Sensor temperature with the cooler off, in tenths
const AMBIENT_TENTHS: f64 = 200.0;
/// Cooler slew, tenths per second
const COOLING_RATE: f64 = 10.0;

const S_OK: i32 = 0;
const E_UNEXPECTED: i32 = 0x8000_ffff_u32 as i32;
const E_INVALIDARG: i32 = 0x8007_0057_u32 as i32;

struct CameraState {
    model: CameraModel,
    open: bool,
    last_update: Instant,
    exposure: Duration,
    software_trigger: bool,
    exposing_until: Option<Instant>,
    temperature: f64,
    setpoint: Option<i16>,
    cooler: bool,
    roi: Roi,
    binning: u32,
    format: VideoFormat,
    controls: BTreeMap<Control, i32>,
    control_writes: usize,
    pulses: Vec<(GuideDirection, Duration)>,
    events: VecDeque<CameraEvent>,
    trigger_cancels: usize,
    /// SDK call names answered with `E_INVALIDARG`
    refused: Vec<&'static str>,
}

impl CameraState {
    /// Status code for `operation`, as the SDK would return it
    fn status(&self, operation: &'static str) -> Result<(), DriverError> {
        let code = if self.refused.contains(&operation) {
            E_INVALIDARG
        } else {
            S_OK
        };
        sdk_check(code, operation).map(|_| ())
    }

    fn advance(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.last_update = now;

        let target = match (self.cooler, self.setpoint) {
            (true, Some(setpoint)) => setpoint as f64,
            _ => AMBIENT_TENTHS,
        };
        let step = COOLING_RATE * dt;
        self.temperature += (target - self.temperature).clamp(-step, step);

        if self.exposing_until.is_some_and(|end| end <= now) {
            self.exposing_until = None;
            self.events.push_back(CameraEvent::Image);
        }
    }
}

/// One simulated camera; clones share the device
#[derive(Clone)]
pub struct SimulatedCamera {
    state: Arc<Mutex<CameraState>>,
    clock: Arc<dyn Clock>,
}

impl SimulatedCamera {
    fn lock(&self) -> MutexGuard<'_, CameraState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn advanced(&self) -> MutexGuard<'_, CameraState> {
        let now = self.clock.now();
        let mut state = self.lock();
        state.advance(now);
        state
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    pub fn is_software_trigger(&self) -> bool {
        self.lock().software_trigger
    }

    pub fn is_exposing(&self) -> bool {
        self.lock().exposing_until.is_some()
    }

    pub fn roi(&self) -> Roi {
        self.lock().roi
    }

    pub fn binning(&self) -> u32 {
        self.lock().binning
    }

    pub fn cooler(&self) -> bool {
        self.lock().cooler
    }

    pub fn setpoint(&self) -> Option<i16> {
        self.lock().setpoint
    }

    pub fn video_format(&self) -> VideoFormat {
        self.lock().format
    }

    pub fn control(&self, control: Control) -> Option<i32> {
        self.lock().controls.get(&control).copied()
    }

    /// Number of `set_control` calls that reached the camera
    pub fn control_writes(&self) -> usize {
        self.lock().control_writes
    }

    pub fn guide_pulses(&self) -> Vec<(GuideDirection, Duration)> {
        self.lock().pulses.clone()
    }

    /// Queue an event as if the SDK callback had fired
    pub fn inject(&self, event: CameraEvent) {
        self.lock().events.push_back(event);
    }

    /// Number of `cancel_trigger` calls
    pub fn trigger_cancels(&self) -> usize {
        self.lock().trigger_cancels
    }

    /// Make the SDK call `operation` (e.g. `"put_Roi"`) fail from now on
    pub fn refuse(&self, operation: &'static str) {
        self.lock().refused.push(operation);
    }

    /// Undo every [`refuse`](Self::refuse)
    pub fn accept_all(&self) {
        self.lock().refused.clear();
    }
}

impl CaptureDevice for SimulatedCamera {
    fn set_exposure_time(&mut self, duration: Duration) -> Result<(), DriverError> {
        self.lock().exposure = duration;
        Ok(())
    }

    fn arm_software_trigger(&mut self) -> Result<(), DriverError> {
        self.lock().software_trigger = true;
        Ok(())
    }

    fn trigger(&mut self) -> Result<(), DriverError> {
        let now = self.clock.now();
        let mut state = self.lock();
        let code = if state.software_trigger { S_OK } else { E_UNEXPECTED };
        sdk_check(code, "Trigger")?;
        state.last_update = now;
        state.exposing_until = Some(now + state.exposure);
        Ok(())
    }

    fn cancel_trigger(&mut self) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.exposing_until = None;
        state.trigger_cancels += 1;
        Ok(())
    }

    fn pull_image(&mut self, layout: PixelLayout) -> Result<RawImage, DriverError> {
        let state = self.lock();
        let bin = state.binning.max(1);
        let width = state.roi.width / bin;
        let height = state.roi.height / bin;
        let len = layout.frame_bytes(width, height);
        let data = (0..len).map(|i| (i % 251) as u8).collect();
        Ok(RawImage {
            width,
            height,
            data,
        })
    }
}

impl CameraHandle for SimulatedCamera {
    fn st4_guide(
        &mut self,
        direction: GuideDirection,
        duration: Duration,
    ) -> Result<(), DriverError> {
        self.lock().pulses.push((direction, duration));
        Ok(())
    }

    fn temperature(&mut self) -> Result<i16, DriverError> {
        Ok(self.advanced().temperature.round() as i16)
    }

    fn set_temperature(&mut self, tenths: i16) -> Result<(), DriverError> {
        self.advanced().setpoint = Some(tenths);
        Ok(())
    }

    fn set_cooler(&mut self, on: bool) -> Result<(), DriverError> {
        self.advanced().cooler = on;
        Ok(())
    }

    fn set_roi(&mut self, roi: Roi) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.status("put_Roi")?;
        state.roi = roi;
        Ok(())
    }

    fn set_binning(&mut self, bin: u32) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.status("put_Option(BINNING)")?;
        state.binning = bin;
        Ok(())
    }

    fn set_trigger_mode(&mut self, software: bool) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.status("put_Option(TRIGGER)")?;
        state.software_trigger = software;
        Ok(())
    }

    fn set_video_format(&mut self, format: VideoFormat) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.status("put_Option(RAW)")?;
        state.format = format;
        Ok(())
    }

    fn set_control(&mut self, control: Control, value: i32) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.controls.insert(control, value);
        state.control_writes += 1;
        Ok(())
    }

    fn drain_events(&mut self) -> Vec<CameraEvent> {
        let mut state = self.advanced();
        // Free-running video delivers one frame per drain
        if !state.software_trigger && state.open {
            state.events.push_back(CameraEvent::Image);
        }
        state.events.drain(..).collect()
    }

    fn close(&mut self) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.open = false;
        state.exposing_until = None;
        Ok(())
    }
}

/// SDK stand-in holding a fixed set of simulated cameras
pub struct SimulatedCameraSdk {
    cameras: Vec<(CameraInstance, SimulatedCamera)>,
}

impl SimulatedCameraSdk {
    /// One 1280x1024 cooled sensor with RAW16 and an ST4 port
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_models(clock, vec![Self::default_model()])
    }

    pub fn default_model() -> CameraModel {
        CameraModel {
            name: "Simulation".into(),
            flags: ModelFlags::RAW
                | ModelFlags::BINSKIP
                | ModelFlags::ROI_HARDWARE
                | ModelFlags::TEC_ONOFF
                | ModelFlags::ST4
                | ModelFlags::GET_TEMPERATURE,
            max_width: 1280,
            max_height: 1024,
            max_bit_depth: 16,
            raw_bits: 16,
            pixel_size_um: 5.4,
        }
    }

    pub fn with_models(clock: Arc<dyn Clock>, models: Vec<CameraModel>) -> Self {
        let now = clock.now();
        let cameras = models
            .into_iter()
            .enumerate()
            .map(|(i, model)| {
                let instance = CameraInstance {
                    id: format!("sim-{}", i),
                    display_name: model.name.clone(),
                    model: model.clone(),
                };
                let camera = SimulatedCamera {
                    state: Arc::new(Mutex::new(CameraState {
                        roi: Roi::full(&model),
                        model,
                        open: false,
                        last_update: now,
                        exposure: Duration::ZERO,
                        software_trigger: true,
                        exposing_until: None,
                        temperature: AMBIENT_TENTHS,
                        setpoint: None,
                        cooler: false,
                        binning: 1,
                        format: VideoFormat::Rgb,
                        controls: BTreeMap::new(),
                        control_writes: 0,
                        pulses: Vec::new(),
                        events: VecDeque::new(),
                        trigger_cancels: 0,
                        refused: Vec::new(),
                    })),
                    clock: clock.clone(),
                };
                (instance, camera)
            })
            .collect();
        Self { cameras }
    }

    /// The shared device behind `id`, for inspection
    pub fn camera(&self, id: &str) -> Option<SimulatedCamera> {
        self.cameras
            .iter()
            .find(|(instance, _)| instance.id == id)
            .map(|(_, camera)| camera.clone())
    }
}

impl CameraSdk for SimulatedCameraSdk {
    fn enumerate(&self) -> Vec<CameraInstance> {
        self.cameras.iter().map(|(instance, _)| instance.clone()).collect()
    }

    fn open(&self, id: &str) -> Result<Box<dyn CameraHandle>, DriverError> {
        let camera = self.camera(id).ok_or(DriverError::Sdk {
            code: E_INVALIDARG,
            operation: "Open",
        })?;
        {
            let mut state = camera.lock();
            let code = if state.open { E_UNEXPECTED } else { S_OK };
            sdk_check(code, "Open")?;
            state.open = true;
            tracing::debug!("simulator: opened {}", state.model.name);
        }
        Ok(Box::new(camera))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BinaryCommand, QueryEngine};
    use crate::timer::ManualClock;

    #[test]
    fn test_moves_at_step_rate() {
        let clock = Arc::new(ManualClock::new());
        let sim = MicrotouchSimulator::seeded(clock.clone(), 7);
        let mut engine = QueryEngine::new(sim.clone());

        engine
            .send(&BinaryCommand::with_digits(opcode::RESET_POSITION, 1000).unwrap().to_bytes())
            .unwrap();
        engine
            .send(&BinaryCommand::with_digits(opcode::UPDATE_POSITION, 5000).unwrap().to_bytes())
            .unwrap();

        clock.advance(Duration::from_secs(1));
        assert_eq!(sim.position(), 3000);
        clock.advance(Duration::from_secs(1));
        assert_eq!(sim.position(), 5000);

        let moving = engine
            .request_binary(&BinaryCommand::new(opcode::IS_MOVING), 2)
            .unwrap();
        assert_eq!(moving.byte(1).unwrap(), 0);
    }

    #[test]
    fn test_temperature_stays_near_ambient() {
        let clock = Arc::new(ManualClock::new());
        let sim = MicrotouchSimulator::seeded(clock.clone(), 3);
        let mut engine = QueryEngine::new(sim);
        for _ in 0..20 {
            clock.advance(Duration::from_secs(30));
            let reply = engine
                .request_binary(&BinaryCommand::new(opcode::GET_TEMPERATURE), 6)
                .unwrap();
            let celsius = reply.i16_be(1).unwrap() as f64 / 16.0;
            assert!((2.0..16.0).contains(&celsius), "{} out of range", celsius);
        }
    }

    #[test]
    fn test_halt_freezes_position() {
        let clock = Arc::new(ManualClock::new());
        let sim = MicrotouchSimulator::seeded(clock.clone(), 11);
        let mut engine = QueryEngine::new(sim.clone());
        let start = sim.position();
        engine
            .send(&BinaryCommand::with_digits(opcode::UPDATE_POSITION, (start + 4000) as u32).unwrap().to_bytes())
            .unwrap();
        clock.advance(Duration::from_millis(500));
        engine.send(&[opcode::HALT]).unwrap();
        clock.advance(Duration::from_secs(5));
        assert_eq!(sim.position(), start + 1000);
        assert_eq!(sim.target(), start + 1000);
    }
}
