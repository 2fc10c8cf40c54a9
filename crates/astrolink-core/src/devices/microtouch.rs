//! Microtouch focuser
//!
//! Binary protocol at 19200 baud. Every command is one opcode byte with an
//! optional little-endian or digit payload; queries answer with a fixed
//! number of bytes whose first byte echoes the opcode. Commands without a
//! reply are fire-and-forget.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::focuser::FocuserCore;
use super::{open_engine, Engine, TransportFactory};
use crate::config::MicrotouchConfig;
use crate::driver::{ConnectionState, Driver};
use crate::error::DriverError;
use crate::motion::{Limits, MotionSample, PositionDevice, TemperatureTracker};
use crate::property::{names, Capabilities, PropertySink, PropertyState, PropertyValue};
use crate::protocol::binary::MAX_DIGIT_VALUE;
use crate::protocol::{BinaryCommand, ProtocolError, QueryEngine, Transport};
use crate::timer::Clock;

pub mod opcode {
    pub const IS_MOVING: u8 = 0x82;
    pub const RESET_POSITION: u8 = 0x83;
    pub const GET_TEMPERATURE: u8 = 0x84;
    pub const TEMPCOMP_ON: u8 = 0x86;
    pub const TEMPCOMP_OFF: u8 = 0x87;
    pub const GET_COEFF: u8 = 0x88;
    pub const SET_COEFF: u8 = 0x89;
    pub const SET_TEMP_OFFSET: u8 = 0x8A;
    pub const GET_MOTOR_SPEED: u8 = 0x8B;
    pub const UPDATE_POSITION: u8 = 0x8C;
    pub const GET_POSITION: u8 = 0x8D;
    pub const HALT: u8 = 0x8E;
    pub const SET_MOTOR_SPEED: u8 = 0x8F;
}

/// Motor speed byte values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorSpeed {
    Normal,
    Fast,
}

impl MotorSpeed {
    pub fn wire(self) -> u8 {
        match self {
            MotorSpeed::Normal => 8,
            MotorSpeed::Fast => 4,
        }
    }

    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            8 => Some(MotorSpeed::Normal),
            4 => Some(MotorSpeed::Fast),
            _ => None,
        }
    }
}

/// One temperature reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureReading {
    /// Sensor value plus calibration offset, Celsius
    pub celsius: f64,
    pub calibration: f64,
}

pub struct MicrotouchPort<'a, T: Transport> {
    engine: &'a mut QueryEngine<T>,
}

impl<'a, T: Transport> MicrotouchPort<'a, T> {
    pub fn new(engine: &'a mut QueryEngine<T>) -> Self {
        Self { engine }
    }

    fn command(&mut self, command: BinaryCommand) -> Result<(), DriverError> {
        self.engine.query_binary(&command, 0)?;
        Ok(())
    }

    pub fn position(&mut self) -> Result<i64, DriverError> {
        let reply = self
            .engine
            .request_binary(&BinaryCommand::new(opcode::GET_POSITION), 3)?;
        Ok(reply.u16_le(1)? as i64)
    }

    pub fn is_moving(&mut self) -> Result<bool, DriverError> {
        let reply = self
            .engine
            .request_binary(&BinaryCommand::new(opcode::IS_MOVING), 2)?;
        Ok(reply.byte(1)? != 0)
    }

    pub fn temperature(&mut self) -> Result<TemperatureReading, DriverError> {
        let reply = self
            .engine
            .request_binary(&BinaryCommand::new(opcode::GET_TEMPERATURE), 6)?;
        let raw = reply.i16_be(1)? as f64 / 16.0;
        let calibration = reply.i16_le(4)? as f64 / 16.0;
        Ok(TemperatureReading {
            celsius: raw + calibration,
            calibration,
        })
    }

    pub fn coefficient(&mut self) -> Result<f64, DriverError> {
        let reply = self
            .engine
            .request_binary(&BinaryCommand::new(opcode::GET_COEFF), 5)?;
        Ok(reply.i32_le(1)? as f64 / 128.0)
    }

    pub fn motor_speed(&mut self) -> Result<MotorSpeed, DriverError> {
        let reply = self
            .engine
            .request_binary(&BinaryCommand::new(opcode::GET_MOTOR_SPEED), 2)?;
        let byte = reply.byte(1)?;
        MotorSpeed::from_wire(byte).ok_or_else(|| {
            ProtocolError::malformed(format!("motor speed byte {}", byte)).into()
        })
    }

    pub fn set_motor_speed(&mut self, speed: MotorSpeed) -> Result<(), DriverError> {
        self.command(BinaryCommand::with_byte(opcode::SET_MOTOR_SPEED, speed.wire()))
    }

    pub fn set_temperature_compensation(&mut self, enabled: bool) -> Result<(), DriverError> {
        let op = if enabled {
            opcode::TEMPCOMP_ON
        } else {
            opcode::TEMPCOMP_OFF
        };
        self.command(BinaryCommand::new(op))
    }

    /// Calibration offset in Celsius, sent in 1/16 steps
    pub fn set_calibration(&mut self, celsius: f64) -> Result<(), DriverError> {
        let scaled = (celsius * 16.0).round();
        if !(i16::MIN as f64..=i16::MAX as f64).contains(&scaled) {
            return Err(DriverError::range(
                celsius,
                i16::MIN as f64 / 16.0,
                i16::MAX as f64 / 16.0,
            ));
        }
        self.command(BinaryCommand::with_i16_le(
            opcode::SET_TEMP_OFFSET,
            scaled as i16,
        ))
    }

    /// Compensation coefficient, sent in 1/128 steps
    pub fn set_coefficient(&mut self, coefficient: f64) -> Result<(), DriverError> {
        let scaled = (coefficient * 128.0).round();
        if !(i32::MIN as f64..=i32::MAX as f64).contains(&scaled) {
            return Err(DriverError::range(
                coefficient,
                i32::MIN as f64 / 128.0,
                i32::MAX as f64 / 128.0,
            ));
        }
        self.command(BinaryCommand::with_i32_le(opcode::SET_COEFF, scaled as i32))
    }

    fn digits(op: u8, position: i64) -> Result<BinaryCommand, DriverError> {
        let value = u32::try_from(position)
            .map_err(|_| DriverError::range(position as f64, 0.0, MAX_DIGIT_VALUE as f64))?;
        Ok(BinaryCommand::with_digits(op, value)?)
    }
}

impl<T: Transport> PositionDevice for MicrotouchPort<'_, T> {
    fn move_to(&mut self, target: i64) -> Result<(), DriverError> {
        let command = Self::digits(opcode::UPDATE_POSITION, target)?;
        self.command(command)
    }

    fn poll(&mut self) -> Result<MotionSample, DriverError> {
        let position = self.position()?;
        let moving = self.is_moving()?;
        Ok(MotionSample {
            position,
            moving: Some(moving),
        })
    }

    fn halt(&mut self) -> Result<(), DriverError> {
        self.command(BinaryCommand::new(opcode::HALT))
    }

    fn sync_to(&mut self, position: i64) -> Result<(), DriverError> {
        let command = Self::digits(opcode::RESET_POSITION, position)?;
        self.command(command)
    }
}

pub struct Microtouch {
    config: MicrotouchConfig,
    core: FocuserCore,
    clock: Arc<dyn Clock>,
    factory: TransportFactory,
    engine: Option<Engine>,
    state: ConnectionState,
    temperature: TemperatureTracker,
    motor_speed: Option<MotorSpeed>,
    compensation: bool,
}

impl Microtouch {
    pub const CAPABILITIES: Capabilities = Capabilities::ABS_MOVE
        .union(Capabilities::REL_MOVE)
        .union(Capabilities::ABORT)
        .union(Capabilities::SYNC)
        .union(Capabilities::TEMPERATURE);

    pub fn new(
        config: MicrotouchConfig,
        factory: TransportFactory,
        sink: Box<dyn PropertySink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let max = config.max_position.min(MAX_DIGIT_VALUE as i64);
        Self {
            core: FocuserCore::new(
                &config.name,
                Self::CAPABILITIES,
                Limits::new(0, max),
                sink,
                clock.clone(),
            ),
            temperature: TemperatureTracker::new(config.temperature_delta),
            config,
            clock,
            factory,
            engine: None,
            state: ConnectionState::Disconnected,
            motor_speed: None,
            compensation: false,
        }
    }

    pub fn position(&self) -> i64 {
        self.core.motion().position()
    }

    pub fn motor_speed(&self) -> Option<MotorSpeed> {
        self.motor_speed
    }

    pub fn temperature_compensation(&self) -> bool {
        self.compensation
    }

    fn handshake(&mut self) -> Result<(), DriverError> {
        let mut engine = open_engine(
            &mut self.factory,
            Duration::from_millis(self.config.serial.timeout_ms),
        )?;
        let position = self.core.initialize(&mut MicrotouchPort::new(&mut engine))?;
        tracing::info!("{}: online at {}", self.config.name, position);

        self.temperature.reset();
        self.engine = Some(engine);
        self.refresh_temperature(true);
        self.refresh_motor_speed();
        Ok(())
    }

    fn refresh_motor_speed(&mut self) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        match MicrotouchPort::new(engine).motor_speed() {
            Ok(speed) => {
                self.motor_speed = Some(speed);
                self.core.publisher().set(
                    names::FOCUS_MOTOR_SPEED,
                    PropertyValue::Switch(vec![
                        speed == MotorSpeed::Normal,
                        speed == MotorSpeed::Fast,
                    ]),
                    PropertyState::Ok,
                );
            }
            Err(e) => tracing::warn!("{}: motor speed unavailable: {}", self.config.name, e),
        }
    }

    /// Read temperature (and the compensation settings when `settings`)
    fn refresh_temperature(&mut self, settings: bool) -> bool {
        let Some(engine) = self.engine.as_mut() else {
            return false;
        };
        let mut port = MicrotouchPort::new(engine);
        let reading = match port.temperature() {
            Ok(reading) => reading,
            Err(e) => return self.core.publisher().alert(names::FOCUS_TEMPERATURE, &e),
        };
        let coefficient = if settings { port.coefficient().ok() } else { None };

        if let Some(celsius) = self.temperature.observe(reading.celsius) {
            self.core.publisher().set(
                names::FOCUS_TEMPERATURE,
                PropertyValue::number(celsius),
                PropertyState::Ok,
            );
        }
        if settings {
            self.core.publisher().set(
                names::FOCUS_TEMP_CALIBRATION,
                PropertyValue::number(reading.calibration),
                PropertyState::Ok,
            );
            if let Some(coefficient) = coefficient {
                self.core.publisher().set(
                    names::FOCUS_TEMP_COEFFICIENT,
                    PropertyValue::number(coefficient),
                    PropertyState::Ok,
                );
            }
        }
        true
    }

    fn with_port<R>(
        &mut self,
        property: &str,
        op: impl FnOnce(&mut MicrotouchPort<'_, Box<dyn Transport>>) -> Result<R, DriverError>,
    ) -> Option<R> {
        let result = match self.engine.as_mut() {
            Some(engine) => op(&mut MicrotouchPort::new(engine)),
            None => Err(DriverError::NotConnected),
        };
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.core.publisher().alert(property, &e);
                None
            }
        }
    }

    fn set_number(&mut self, name: &str, value: f64) -> bool {
        self.core
            .publisher()
            .set(name, PropertyValue::number(value), PropertyState::Ok);
        true
    }
}

impl Driver for Microtouch {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn capabilities(&self) -> Capabilities {
        Self::CAPABILITIES
    }

    fn connection_state(&self) -> ConnectionState {
        self.state
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }

    fn connect(&mut self) -> bool {
        if self.state == ConnectionState::Connected {
            return true;
        }
        self.state = ConnectionState::Handshaking;
        match self.handshake() {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                self.core.publisher().set(
                    names::CONNECTION,
                    PropertyValue::Switch(vec![true, false]),
                    PropertyState::Ok,
                );
                true
            }
            Err(e) => {
                self.engine = None;
                self.state = ConnectionState::Disconnected;
                tracing::error!(
                    "{}: no answer, check power and port {:?}",
                    self.config.name,
                    self.config.serial.port
                );
                self.core.publisher().alert(names::CONNECTION, &e)
            }
        }
    }

    fn disconnect(&mut self) -> bool {
        match self.engine.as_mut() {
            Some(engine) => self.core.disconnect(Some(&mut MicrotouchPort::new(engine))),
            None => self.core.disconnect(None),
        }
        self.engine = None;
        self.temperature.reset();
        self.state = ConnectionState::Disconnected;
        self.core.publisher().set(
            names::CONNECTION,
            PropertyValue::Switch(vec![false, true]),
            PropertyState::Idle,
        );
        tracing::info!("{}: disconnected", self.config.name);
        true
    }

    fn timer_tick(&mut self) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        let Some(engine) = self.engine.as_mut() else {
            return false;
        };
        let position_ok = self.core.poll(&mut MicrotouchPort::new(engine));
        let temperature_ok = self.refresh_temperature(false);
        position_ok && temperature_ok
    }

    fn run_timers(&mut self) -> bool {
        let now = self.clock.now();
        match self.engine.as_mut() {
            Some(engine) => self.core.fire_due(&mut MicrotouchPort::new(engine), now),
            None => false,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.core.next_deadline()
    }

    fn update_number(&mut self, name: &str, values: &[f64]) -> bool {
        let value = values.first().copied();
        match (name, value) {
            (names::FOCUS_TEMP_CALIBRATION, Some(v)) => self
                .with_port(name, |port| port.set_calibration(v))
                .map_or(false, |_| self.set_number(name, v)),
            (names::FOCUS_TEMP_COEFFICIENT, Some(v)) => self
                .with_port(name, |port| port.set_coefficient(v))
                .map_or(false, |_| self.set_number(name, v)),
            _ => {
                let poll_interval = self.poll_interval();
                match self.engine.as_mut() {
                    Some(engine) => self
                        .core
                        .update_number(&mut MicrotouchPort::new(engine), name, values, poll_interval)
                        .unwrap_or(false),
                    None if is_focus_property(name) => self
                        .core
                        .publisher()
                        .alert(name, &DriverError::NotConnected),
                    None => false,
                }
            }
        }
    }

    fn update_switch(&mut self, name: &str, states: &[bool]) -> bool {
        let first = states.first().copied().unwrap_or(false);
        match name {
            names::CONNECTION => {
                if first {
                    self.connect()
                } else {
                    self.disconnect()
                }
            }
            names::FOCUS_MOTOR_SPEED => {
                // [normal, fast]
                let speed = if first {
                    MotorSpeed::Normal
                } else {
                    MotorSpeed::Fast
                };
                if self.motor_speed == Some(speed) {
                    self.core.publisher().state(name, PropertyState::Ok);
                    return true;
                }
                if self
                    .with_port(name, |port| port.set_motor_speed(speed))
                    .is_none()
                {
                    return false;
                }
                self.motor_speed = Some(speed);
                self.core.publisher().set(
                    name,
                    PropertyValue::Switch(vec![
                        speed == MotorSpeed::Normal,
                        speed == MotorSpeed::Fast,
                    ]),
                    PropertyState::Ok,
                );
                true
            }
            names::FOCUS_TEMP_COMPENSATION => {
                // [enable, disable]
                if self
                    .with_port(name, |port| port.set_temperature_compensation(first))
                    .is_none()
                {
                    return false;
                }
                self.compensation = first;
                self.core.publisher().set(
                    name,
                    PropertyValue::Switch(vec![first, !first]),
                    PropertyState::Ok,
                );
                true
            }
            _ => match self.engine.as_mut() {
                Some(engine) => self
                    .core
                    .update_switch(&mut MicrotouchPort::new(engine), name, states)
                    .unwrap_or(false),
                None if is_focus_property(name) => self
                    .core
                    .publisher()
                    .alert(name, &DriverError::NotConnected),
                None => false,
            },
        }
    }

    fn update_text(&mut self, _name: &str, _values: &[String]) -> bool {
        false
    }
}

fn is_focus_property(name: &str) -> bool {
    name.starts_with("FOCUS") || name.ends_with("FOCUS_POSITION")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MockTransport;

    #[test]
    fn test_temperature_layout() {
        let mock = MockTransport::new();
        // raw 0x0150 (21.0 C) big-endian, calibration 0x0008 (0.5 C) little-endian
        mock.expect(vec![0x84], vec![0x84, 0x01, 0x50, 0x00, 0x08, 0x00]);
        let mut engine = QueryEngine::new(mock);
        let reading = MicrotouchPort::new(&mut engine).temperature().unwrap();
        assert_eq!(reading.celsius, 21.5);
        assert_eq!(reading.calibration, 0.5);
    }

    #[test]
    fn test_coefficient_and_settings() {
        let mock = MockTransport::new();
        mock.expect(vec![0x88], vec![0x88, 0x40, 0x01, 0x00, 0x00])
            .expect_silent(vec![0x89, 0x80, 0xfe, 0xff, 0xff])
            .expect_silent(vec![0x8a, 0xf8, 0xff]);
        let mut engine = QueryEngine::new(mock.clone());
        let mut port = MicrotouchPort::new(&mut engine);

        assert_eq!(port.coefficient().unwrap(), 2.5);
        port.set_coefficient(-3.0).unwrap();
        port.set_calibration(-0.5).unwrap();
        assert_eq!(mock.remaining(), 0);
    }

    #[test]
    fn test_motor_speed_bytes() {
        let mock = MockTransport::new();
        mock.expect(vec![0x8b], vec![0x8b, 4])
            .expect(vec![0x8b], vec![0x8b, 7]);
        let mut engine = QueryEngine::new(mock);
        let mut port = MicrotouchPort::new(&mut engine);
        assert_eq!(port.motor_speed().unwrap(), MotorSpeed::Fast);
        assert!(port.motor_speed().is_err());
    }

    #[test]
    fn test_poll_reads_position_and_moving_flag() {
        let mock = MockTransport::new();
        mock.expect(vec![0x8d], vec![0x8d, 0x88, 0x13])
            .expect(vec![0x82], vec![0x82, 0x01]);
        let mut engine = QueryEngine::new(mock);
        let sample = MicrotouchPort::new(&mut engine).poll().unwrap();
        assert_eq!(sample.position, 5000);
        assert_eq!(sample.moving, Some(true));
    }

    #[test]
    fn test_negative_target_is_range_error() {
        let mock = MockTransport::new();
        let mut engine = QueryEngine::new(mock.clone());
        let err = MicrotouchPort::new(&mut engine).move_to(-1).unwrap_err();
        assert!(matches!(err, DriverError::Range { .. }));
        assert!(mock.written().is_empty());
    }
}
