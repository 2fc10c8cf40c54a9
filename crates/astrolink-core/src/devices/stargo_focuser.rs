//! Avalon StarGo AUX1 focuser
//!
//! The focuser hangs off the mount's AUX1 port and shares the mount's serial
//! link, so it has no transport of its own: every operation borrows the
//! mount's [`QueryEngine`].
//!
//! Wire grammar:
//! - goto `:X16pppppp#`, sync `:X0Cpppppp#`, stop `:X0AAUX1ST#` (no replies)
//! - position `:X0BAUX1AS#` -> `AX1=ppppppp#`
//! - speed `:X1Caaaa*bb#` -> `0#`
//!
//! Positions carry a fixed offset of 500000 on the wire. The port has no
//! moving flag; a move is complete when two polls agree.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::focuser::FocuserCore;
use crate::config::StarGoFocuserConfig;
use crate::error::DriverError;
use crate::motion::{Limits, MotionSample, PositionDevice};
use crate::property::{names, Capabilities, PropertySink, PropertyState, PropertyValue};
use crate::protocol::ascii::scan_fixed_field;
use crate::protocol::{AsciiCommand, ProtocolError, QueryEngine, ReplyShape, Transport};
use crate::timer::Clock;

pub const POSITION_OFFSET: i64 = 500_000;

/// `(aaaa, bb)` arguments of `:X1C` for speeds 1..=10, slowest first
pub const SPEED_TABLE: [(i64, i64); 10] = [
    (9000, 1),
    (6000, 1),
    (4000, 1),
    (2500, 1),
    (1000, 5),
    (750, 10),
    (500, 20),
    (250, 30),
    (100, 40),
    (60, 50),
];

/// Build the speed command, refusing speeds outside 1..=10
pub fn speed_command(speed: u32) -> Result<AsciiCommand, DriverError> {
    let index = (speed as usize)
        .checked_sub(1)
        .filter(|i| *i < SPEED_TABLE.len())
        .ok_or_else(|| DriverError::range(speed as f64, 1.0, SPEED_TABLE.len() as f64))?;
    let (a, b) = SPEED_TABLE[index];
    Ok(AsciiCommand::new("X1C").digits(a, 4)?.text("*").digits(b, 2)?)
}

/// The AUX1 port seen through the mount's query engine
pub struct AuxPort<'a, T: Transport> {
    engine: &'a mut QueryEngine<T>,
}

impl<'a, T: Transport> AuxPort<'a, T> {
    pub fn new(engine: &'a mut QueryEngine<T>) -> Self {
        Self { engine }
    }

    fn positioned(mnemonic: &str, position: i64) -> Result<AsciiCommand, DriverError> {
        Ok(AsciiCommand::new(mnemonic).digits(position + POSITION_OFFSET, 6)?)
    }

    pub fn read_position(&mut self) -> Result<i64, DriverError> {
        let reply = self
            .engine
            .query_ascii(&AsciiCommand::new("X0BAUX1AS"), ReplyShape::HASH)?;
        if !reply.starts_with(b"AX1=") {
            return Err(ProtocolError::malformed(format!(
                "AUX1 position reply {:?}",
                String::from_utf8_lossy(&reply)
            ))
            .into());
        }
        Ok(scan_fixed_field(&reply, 4, 7)? - POSITION_OFFSET)
    }

    pub fn set_speed(&mut self, speed: u32) -> Result<(), DriverError> {
        let command = speed_command(speed)?;
        let reply = self.engine.query_ascii(&command, ReplyShape::HASH)?;
        if reply != b"0" {
            return Err(ProtocolError::malformed(format!(
                "speed reply {:?}",
                String::from_utf8_lossy(&reply)
            ))
            .into());
        }
        Ok(())
    }
}

impl<T: Transport> PositionDevice for AuxPort<'_, T> {
    fn move_to(&mut self, target: i64) -> Result<(), DriverError> {
        let command = Self::positioned("X16", target)?;
        self.engine.send(&command.to_bytes())?;
        Ok(())
    }

    fn poll(&mut self) -> Result<MotionSample, DriverError> {
        Ok(MotionSample {
            position: self.read_position()?,
            moving: None,
        })
    }

    fn halt(&mut self) -> Result<(), DriverError> {
        self.engine
            .send(&AsciiCommand::new("X0AAUX1ST").to_bytes())?;
        Ok(())
    }

    fn sync_to(&mut self, position: i64) -> Result<(), DriverError> {
        let command = Self::positioned("X0C", position)?;
        self.engine.send(&command.to_bytes())?;
        Ok(())
    }
}

/// Focuser sub-component of the StarGo mount driver
pub struct StarGoFocuser {
    core: FocuserCore,
    speed: u32,
}

impl StarGoFocuser {
    pub const CAPABILITIES: Capabilities = Capabilities::ABS_MOVE
        .union(Capabilities::REL_MOVE)
        .union(Capabilities::ABORT)
        .union(Capabilities::SYNC)
        .union(Capabilities::REVERSE)
        .union(Capabilities::VARIABLE_SPEED)
        .union(Capabilities::TIMED_MOVE);

    pub fn new(
        config: &StarGoFocuserConfig,
        sink: Box<dyn PropertySink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut core = FocuserCore::new(
            &config.name,
            Self::CAPABILITIES,
            Limits::new(0, config.max_position),
            sink,
            clock,
        );
        core.motion_mut().set_reversed(config.reversed);
        Self {
            core,
            speed: config.speed,
        }
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.core.capabilities()
    }

    pub fn position(&self) -> i64 {
        self.core.motion().position()
    }

    pub fn speed(&self) -> u32 {
        self.speed
    }

    /// True for properties this sub-component answers
    pub fn handles(name: &str) -> bool {
        name.starts_with("FOCUS") || name.ends_with("FOCUS_POSITION")
    }

    pub fn on_connect<T: Transport>(&mut self, engine: &mut QueryEngine<T>) -> Result<(), DriverError> {
        let mut port = AuxPort::new(engine);
        let position = self.core.initialize(&mut port)?;
        if let Err(e) = port.set_speed(self.speed) {
            // The focuser still works at whatever speed the mount kept
            tracing::warn!("{}: restoring speed {} failed: {}", self.core.name(), self.speed, e);
        }
        tracing::info!("{}: AUX1 focuser at {}", self.core.name(), position);
        Ok(())
    }

    pub fn poll<T: Transport>(&mut self, engine: &mut QueryEngine<T>) -> bool {
        self.core.poll(&mut AuxPort::new(engine))
    }

    pub fn run_timers<T: Transport>(&mut self, engine: &mut QueryEngine<T>, now: Instant) -> bool {
        self.core.fire_due(&mut AuxPort::new(engine), now)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.core.next_deadline()
    }

    /// Apply a speed from 1 (slowest) to 10 (fastest)
    pub fn set_speed<T: Transport>(&mut self, engine: &mut QueryEngine<T>, speed: u32) -> Result<(), DriverError> {
        AuxPort::new(engine).set_speed(speed)?;
        self.speed = speed;
        Ok(())
    }

    pub fn update_number<T: Transport>(
        &mut self,
        engine: &mut QueryEngine<T>,
        name: &str,
        values: &[f64],
        poll_interval: Duration,
    ) -> bool {
        if name == names::FOCUS_SPEED {
            if !self
                .core
                .require(Capabilities::VARIABLE_SPEED, names::FOCUS_SPEED)
            {
                return false;
            }
            let requested = values.first().copied().unwrap_or(f64::NAN);
            if !(1.0..=SPEED_TABLE.len() as f64).contains(&requested) {
                return self.core.publisher().alert(
                    names::FOCUS_SPEED,
                    &DriverError::range(requested, 1.0, SPEED_TABLE.len() as f64),
                );
            }
            return match self.set_speed(engine, requested as u32) {
                Ok(()) => {
                    self.core.publisher().set(
                        names::FOCUS_SPEED,
                        PropertyValue::number(self.speed as f64),
                        PropertyState::Ok,
                    );
                    true
                }
                Err(e) => self.core.publisher().alert(names::FOCUS_SPEED, &e),
            };
        }

        let mut port = AuxPort::new(engine);
        self.core
            .update_number(&mut port, name, values, poll_interval)
            .unwrap_or(false)
    }

    pub fn update_switch<T: Transport>(
        &mut self,
        engine: &mut QueryEngine<T>,
        name: &str,
        states: &[bool],
    ) -> bool {
        self.core
            .update_switch(&mut AuxPort::new(engine), name, states)
            .unwrap_or(false)
    }

    pub fn abort<T: Transport>(&mut self, engine: &mut QueryEngine<T>) -> bool {
        self.core.abort(&mut AuxPort::new(engine))
    }

    pub fn disconnect<T: Transport>(&mut self, engine: Option<&mut QueryEngine<T>>) {
        match engine {
            Some(engine) => self.core.disconnect(Some(&mut AuxPort::new(engine))),
            None => self.core.disconnect(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MockTransport;

    #[test]
    fn test_speed_table_bounds() {
        assert_eq!(speed_command(1).unwrap().to_string(), ":X1C9000*01#");
        assert_eq!(speed_command(6).unwrap().to_string(), ":X1C0750*10#");
        assert_eq!(speed_command(10).unwrap().to_string(), ":X1C0060*50#");
        assert!(matches!(speed_command(0), Err(DriverError::Range { .. })));
        assert!(matches!(speed_command(11), Err(DriverError::Range { .. })));
    }

    #[test]
    fn test_position_offset_on_the_wire() {
        let mock = MockTransport::new();
        mock.expect_silent(":X16501000#")
            .expect_silent(":X0C500000#")
            .expect(":X0BAUX1AS#", "AX1=0499990#");
        let mut engine = QueryEngine::new(mock.clone());
        let mut port = AuxPort::new(&mut engine);

        port.move_to(1000).unwrap();
        port.sync_to(0).unwrap();
        assert_eq!(port.poll().unwrap().position, -10);
        assert_eq!(mock.remaining(), 0);
    }

    #[test]
    fn test_garbled_position_reply_is_malformed() {
        let mock = MockTransport::new();
        mock.expect(":X0BAUX1AS#", "AX2=0500000#");
        let mut engine = QueryEngine::new(mock);
        let err = AuxPort::new(&mut engine).read_position().unwrap_err();
        assert!(matches!(
            err,
            DriverError::Protocol(ProtocolError::Malformed(_))
        ));
    }
}
