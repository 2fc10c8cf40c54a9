//! Avalon StarGo mount
//!
//! LX200-style ASCII protocol over serial. The driver composes a slew
//! tracker, a [`GuideController`] and the AUX1 [`StarGoFocuser`], all
//! sharing one [`QueryEngine`].
//!
//! | Operation        | Request                | Reply              |
//! |------------------|------------------------|--------------------|
//! | product          | `:GVP#`                | `Avalon StarGo#`   |
//! | firmware         | `:GVN#`                | `<version>#`       |
//! | RA / Dec         | `:GR#` / `:GD#`        | `HH:MM:SS#` / `sDD*MM:SS#` |
//! | target RA / Dec  | `:SrHH:MM:SS#` / `:SdsDD*MM:SS#` | `1`      |
//! | goto             | `:MS#`                 | `0`, or `1<reason>#` |
//! | sync             | `:CM#`                 | `<text>#`          |
//! | abort            | `:Q#`                  | none               |
//! | move / stop      | `:Mn#` .. / `:Qn#` ..  | none               |
//! | slew rate        | `:RG#` `:RC#` `:RM#` `:RS#` | none          |
//! | pulse guide      | `:Mg<d><dddd>#`        | none               |
//! | guide speeds     | `:X20rrdd#`            | none               |
//! | time / site      | `:SL` `:SC` `:SG` `:St` `:Sg` | `1`          |

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, Timelike, Utc};

use super::stargo_focuser::StarGoFocuser;
use super::{open_engine, Engine, TransportFactory};
use crate::config::StarGoConfig;
use crate::driver::{earliest, ConnectionState, Driver, Publisher};
use crate::error::DriverError;
use crate::guide::{GuideAxis, GuideCompletion, GuideController, GuideDirection, PulseGuider};
use crate::property::{names, Capabilities, PropertySink, PropertyState, PropertyValue};
use crate::protocol::ascii::{format_dms, format_hms, parse_dms, parse_hms};
use crate::protocol::{AsciiCommand, ProtocolError, QueryEngine, ReplyShape, Transport};
use crate::timer::Clock;

/// Longest pulse the 4-digit `:Mg` field can carry
pub const MAX_PULSE_MS: u64 = 9999;

const ACK: ReplyShape = ReplyShape::Fixed(1);

/// Mount slew rates, slowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlewRate {
    Guide,
    Centering,
    Find,
    Max,
}

impl SlewRate {
    const ALL: [SlewRate; 4] = [
        SlewRate::Guide,
        SlewRate::Centering,
        SlewRate::Find,
        SlewRate::Max,
    ];

    fn mnemonic(self) -> &'static str {
        match self {
            SlewRate::Guide => "RG",
            SlewRate::Centering => "RC",
            SlewRate::Find => "RM",
            SlewRate::Max => "RS",
        }
    }
}

fn direction_char(direction: GuideDirection) -> char {
    match direction {
        GuideDirection::North => 'n',
        GuideDirection::South => 's',
        GuideDirection::East => 'e',
        GuideDirection::West => 'w',
    }
}

fn expect_ack(reply: &[u8], what: &str) -> Result<(), DriverError> {
    if reply == b"1" {
        Ok(())
    } else {
        Err(ProtocolError::malformed(format!(
            "{} rejected: {:?}",
            what,
            String::from_utf8_lossy(reply)
        ))
        .into())
    }
}

/// Tracks a goto until the coordinates stop changing
#[derive(Debug, Clone, Copy, PartialEq)]
enum Slew {
    Idle,
    Slewing { last: Option<(f64, f64)> },
}

/// Mount commands on a query engine
pub struct MountLink<'a, T: Transport> {
    engine: &'a mut QueryEngine<T>,
    use_pulse_commands: bool,
}

impl<'a, T: Transport> MountLink<'a, T> {
    pub fn new(engine: &'a mut QueryEngine<T>, use_pulse_commands: bool) -> Self {
        Self {
            engine,
            use_pulse_commands,
        }
    }

    fn text_query(&mut self, mnemonic: &str) -> Result<String, DriverError> {
        let reply = self
            .engine
            .query_ascii(&AsciiCommand::new(mnemonic), ReplyShape::HASH)?;
        Ok(String::from_utf8_lossy(&reply).trim().to_string())
    }

    fn send(&mut self, command: &AsciiCommand) -> Result<(), DriverError> {
        self.engine.send(&command.to_bytes())?;
        Ok(())
    }

    fn acknowledged(&mut self, command: &AsciiCommand, what: &str) -> Result<(), DriverError> {
        let reply = self.engine.query_ascii(command, ACK)?;
        expect_ack(&reply, what)
    }

    pub fn product(&mut self) -> Result<String, DriverError> {
        let product = self.text_query("GVP")?;
        let lower = product.to_ascii_lowercase();
        if !lower.contains("stargo") && !lower.contains("avalon") {
            return Err(ProtocolError::malformed(format!("unexpected product {:?}", product)).into());
        }
        Ok(product)
    }

    pub fn firmware(&mut self) -> Result<String, DriverError> {
        self.text_query("GVN")
    }

    /// Current (RA hours, Dec degrees)
    pub fn coordinates(&mut self) -> Result<(f64, f64), DriverError> {
        let ra = self
            .engine
            .query_ascii(&AsciiCommand::new("GR"), ReplyShape::HASH)?;
        let dec = self
            .engine
            .query_ascii(&AsciiCommand::new("GD"), ReplyShape::HASH)?;
        Ok((parse_hms(&ra)?, parse_dms(&dec)?))
    }

    fn set_target(&mut self, ra: f64, dec: f64) -> Result<(), DriverError> {
        self.acknowledged(&AsciiCommand::new("Sr").text(&format_hms(ra)), "target RA")?;
        self.acknowledged(&AsciiCommand::new("Sd").text(&format_dms(dec)), "target Dec")
    }

    pub fn goto(&mut self, ra: f64, dec: f64) -> Result<(), DriverError> {
        self.set_target(ra, dec)?;
        let reply = self.engine.query_ascii(&AsciiCommand::new("MS"), ACK)?;
        match reply.as_slice() {
            b"0" => Ok(()),
            b"1" => {
                let reason = self
                    .engine
                    .read_more(ReplyShape::HASH)
                    .map(|r| String::from_utf8_lossy(&r).trim().to_string())
                    .unwrap_or_default();
                Err(DriverError::InvalidArgument(format!(
                    "mount refused goto: {}",
                    reason
                )))
            }
            other => Err(ProtocolError::malformed(format!(
                "goto reply {:?}",
                String::from_utf8_lossy(other)
            ))
            .into()),
        }
    }

    pub fn sync(&mut self, ra: f64, dec: f64) -> Result<(), DriverError> {
        self.set_target(ra, dec)?;
        self.engine
            .query_ascii(&AsciiCommand::new("CM"), ReplyShape::HASH)?;
        Ok(())
    }

    pub fn abort(&mut self) -> Result<(), DriverError> {
        self.send(&AsciiCommand::new("Q"))
    }

    pub fn start_motion(&mut self, direction: GuideDirection) -> Result<(), DriverError> {
        self.send(&AsciiCommand::new(&format!("M{}", direction_char(direction))))
    }

    pub fn stop_motion(&mut self, direction: GuideDirection) -> Result<(), DriverError> {
        self.send(&AsciiCommand::new(&format!("Q{}", direction_char(direction))))
    }

    pub fn set_slew_rate(&mut self, rate: SlewRate) -> Result<(), DriverError> {
        self.send(&AsciiCommand::new(rate.mnemonic()))
    }

    /// Guide speeds in percent of sidereal (10..=90)
    pub fn set_guide_speeds(&mut self, ra: u32, dec: u32) -> Result<(), DriverError> {
        for speed in [ra, dec] {
            if !(10..=90).contains(&speed) {
                return Err(DriverError::range(speed as f64, 10.0, 90.0));
            }
        }
        let command = AsciiCommand::new("X20")
            .digits(ra as i64, 2)?
            .digits(dec as i64, 2)?;
        self.send(&command)
    }

    /// Send UTC date/time (offset 0) and the site location
    pub fn sync_time_and_site(
        &mut self,
        now: DateTime<Utc>,
        latitude: f64,
        longitude: f64,
    ) -> Result<(), DriverError> {
        let time = format!("{:02}:{:02}:{:02}", now.hour(), now.minute(), now.second());
        self.acknowledged(&AsciiCommand::new("SL").text(&time), "local time")?;

        let date = format!("{:02}/{:02}/{:02}", now.month(), now.day(), now.year() % 100);
        self.acknowledged(&AsciiCommand::new("SC").text(&date), "date")?;

        self.acknowledged(&AsciiCommand::new("SG").signed(0, 2)?, "UTC offset")?;

        if !(-90.0..=90.0).contains(&latitude) {
            return Err(DriverError::range(latitude, -90.0, 90.0));
        }
        let lat_minutes = (latitude.abs() * 60.0).round() as i64;
        let sign = if latitude < 0.0 { '-' } else { '+' };
        let lat = AsciiCommand::new("St").text(&format!(
            "{}{:02}*{:02}",
            sign,
            lat_minutes / 60,
            lat_minutes % 60
        ));
        self.acknowledged(&lat, "latitude")?;

        // LX200 longitudes are measured westward, 0..360
        let west = (360.0 - longitude).rem_euclid(360.0);
        let lon_minutes = (west * 60.0).round() as i64 % (360 * 60);
        let lon = AsciiCommand::new("Sg")
            .digits(lon_minutes / 60, 3)?
            .text(&format!("*{:02}", lon_minutes % 60));
        self.acknowledged(&lon, "longitude")
    }
}

impl<T: Transport> PulseGuider for MountLink<'_, T> {
    fn start_pulse(
        &mut self,
        direction: GuideDirection,
        duration: Duration,
    ) -> Result<(), DriverError> {
        if self.use_pulse_commands {
            let millis = duration.as_millis() as u64;
            if millis > MAX_PULSE_MS {
                return Err(DriverError::range(millis as f64, 0.0, MAX_PULSE_MS as f64));
            }
            let command = AsciiCommand::new("Mg")
                .text(&direction_char(direction).to_string())
                .digits(millis as i64, 4)?;
            self.send(&command)
        } else {
            self.set_slew_rate(SlewRate::Guide)?;
            self.start_motion(direction)
        }
    }

    fn finish_pulse(&mut self, direction: GuideDirection) -> Result<(), DriverError> {
        if self.use_pulse_commands {
            Ok(())
        } else {
            self.stop_motion(direction)
        }
    }
}

fn guide_property(axis: GuideAxis) -> &'static str {
    match axis {
        GuideAxis::Declination => names::TELESCOPE_TIMED_GUIDE_NS,
        GuideAxis::RightAscension => names::TELESCOPE_TIMED_GUIDE_WE,
    }
}

/// Cancel pending pulses, ending each on the mount when it is reachable
fn stop_guiding(
    guide: &mut GuideController,
    publisher: &mut Publisher,
    engine: Option<&mut Engine>,
    use_pulse_commands: bool,
) {
    let notify = &mut |c: GuideCompletion| publish_completion(publisher, c);
    match engine {
        Some(engine) => {
            let mut link = MountLink::new(engine, use_pulse_commands);
            guide.cancel_all(Some(&mut link), notify);
        }
        None => guide.cancel_all(None, notify),
    }
}

fn publish_completion(publisher: &mut Publisher, completion: GuideCompletion) {
    tracing::debug!(
        "guide {:?} complete ({:?})",
        completion.pulse.direction,
        completion.reason
    );
    publisher.set(
        guide_property(completion.pulse.direction.axis()),
        PropertyValue::Number(vec![0.0, 0.0]),
        completion.state,
    );
}

pub struct StarGoMount {
    config: StarGoConfig,
    publisher: Publisher,
    clock: Arc<dyn Clock>,
    factory: TransportFactory,
    engine: Option<Engine>,
    state: ConnectionState,
    guide: GuideController,
    focuser: Option<StarGoFocuser>,
    slew: Slew,
    coordinates: Option<(f64, f64)>,
    /// Directions with a manual move running
    manual: Vec<GuideDirection>,
    /// Goto (false) or sync (true) for the next coordinate update
    sync_on_coord_set: bool,
}

impl StarGoMount {
    pub const CAPABILITIES: Capabilities = Capabilities::ABORT
        .union(Capabilities::SYNC)
        .union(Capabilities::GUIDING)
        .union(Capabilities::VARIABLE_SPEED);

    /// `focuser_sink` receives the AUX1 focuser's properties
    pub fn new(
        config: StarGoConfig,
        factory: TransportFactory,
        sink: Box<dyn PropertySink>,
        focuser_sink: Box<dyn PropertySink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let focuser = config
            .focuser
            .enabled
            .then(|| StarGoFocuser::new(&config.focuser, focuser_sink, clock.clone()));
        let guide = GuideController::with_threshold(
            clock.clone(),
            Duration::from_millis(config.guide_threshold_ms),
        );
        Self {
            publisher: Publisher::new(config.name.clone(), sink),
            config,
            clock,
            factory,
            engine: None,
            state: ConnectionState::Disconnected,
            guide,
            focuser,
            slew: Slew::Idle,
            coordinates: None,
            manual: Vec::new(),
            sync_on_coord_set: false,
        }
    }

    pub fn focuser(&self) -> Option<&StarGoFocuser> {
        self.focuser.as_ref()
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        self.coordinates
    }

    pub fn is_slewing(&self) -> bool {
        matches!(self.slew, Slew::Slewing { .. })
    }

    fn handshake(&mut self) -> Result<(), DriverError> {
        let mut engine = open_engine(
            &mut self.factory,
            Duration::from_millis(self.config.serial.timeout_ms),
        )?;
        let mut link = MountLink::new(&mut engine, self.config.use_pulse_commands);

        let product = link.product()?;
        let firmware = link.firmware()?;
        tracing::info!("{}: {} firmware {}", self.config.name, product, firmware);
        self.publisher.set(
            names::MOUNT_FIRMWARE_INFO,
            PropertyValue::Text(vec![product, firmware]),
            PropertyState::Ok,
        );

        link.set_guide_speeds(self.config.guide_speed_ra, self.config.guide_speed_dec)?;
        if self.config.sync_time_on_connect {
            link.sync_time_and_site(Utc::now(), self.config.latitude, self.config.longitude)?;
        }

        if let Some(focuser) = self.focuser.as_mut() {
            if let Err(e) = focuser.on_connect(&mut engine) {
                // The mount stays usable without its focuser
                tracing::warn!("{}: AUX1 focuser not answering: {}", focuser.name(), e);
            }
        }

        self.engine = Some(engine);
        Ok(())
    }

    fn goto(&mut self, ra: f64, dec: f64) -> bool {
        let Some(engine) = self.engine.as_mut() else {
            return self
                .publisher
                .alert(names::EQUATORIAL_EOD_COORD, &DriverError::NotConnected);
        };
        if !(0.0..24.0).contains(&ra) || !(-90.0..=90.0).contains(&dec) {
            let err = if (0.0..24.0).contains(&ra) {
                DriverError::range(dec, -90.0, 90.0)
            } else {
                DriverError::range(ra, 0.0, 24.0)
            };
            return self.publisher.alert(names::EQUATORIAL_EOD_COORD, &err);
        }

        let mut link = MountLink::new(engine, self.config.use_pulse_commands);
        let result = if self.sync_on_coord_set {
            link.sync(ra, dec)
        } else {
            link.goto(ra, dec)
        };
        match result {
            Ok(()) if self.sync_on_coord_set => {
                self.coordinates = Some((ra, dec));
                self.publisher.set(
                    names::EQUATORIAL_EOD_COORD,
                    PropertyValue::Number(vec![ra, dec]),
                    PropertyState::Ok,
                );
                true
            }
            Ok(()) => {
                tracing::info!("{}: slewing to {} {}", self.config.name, format_hms(ra), format_dms(dec));
                self.slew = Slew::Slewing { last: None };
                self.publisher.set(
                    names::EQUATORIAL_EOD_COORD,
                    PropertyValue::Number(vec![ra, dec]),
                    PropertyState::Busy,
                );
                true
            }
            Err(e) => self.publisher.alert(names::EQUATORIAL_EOD_COORD, &e),
        }
    }

    fn abort(&mut self) -> bool {
        let Self {
            guide,
            publisher,
            engine,
            focuser,
            config,
            ..
        } = self;
        stop_guiding(guide, publisher, engine.as_mut(), config.use_pulse_commands);
        self.slew = Slew::Idle;
        self.manual.clear();

        let Some(engine) = engine.as_mut() else {
            return publisher.alert(names::TELESCOPE_ABORT_MOTION, &DriverError::NotConnected);
        };
        if let Some(focuser) = focuser.as_mut() {
            focuser.abort(&mut *engine);
        }
        match MountLink::new(engine, self.config.use_pulse_commands).abort() {
            Ok(()) => {
                publisher.state(names::EQUATORIAL_EOD_COORD, PropertyState::Idle);
                publisher.state(names::TELESCOPE_ABORT_MOTION, PropertyState::Ok);
                true
            }
            Err(e) => publisher.alert(names::TELESCOPE_ABORT_MOTION, &e),
        }
    }

    fn guide(&mut self, property: &str, values: &[f64]) -> bool {
        // NS is [north, south], WE is [west, east]
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
            guide,
            publisher,
            engine,
            config,
            ..
        } = self;
        let Some(engine) = engine.as_mut() else {
            return publisher.alert(property, &DriverError::NotConnected);
        };
        let mut link = MountLink::new(engine, config.use_pulse_commands);
        let state = guide.pulse(
            &mut link,
            direction,
            Duration::from_millis(millis as u64),
            &mut |c| publish_completion(publisher, c),
        );

        match state {
            PropertyState::Alert => publisher.alert(
                property,
                &format!("guide pulse {:?} {}ms failed", direction, millis),
            ),
            state => {
                publisher.set(property, PropertyValue::Number(values.to_vec()), state);
                true
            }
        }
    }

    fn manual_motion(&mut self, property: &str, states: &[bool]) -> bool {
        let (first, second) = if property == names::TELESCOPE_MOTION_NS {
            (GuideDirection::North, GuideDirection::South)
        } else {
            (GuideDirection::West, GuideDirection::East)
        };
        let Some(engine) = self.engine.as_mut() else {
            return self.publisher.alert(property, &DriverError::NotConnected);
        };
        let mut link = MountLink::new(engine, self.config.use_pulse_commands);

        let mut result = Ok(());
        for (direction, on) in [
            (first, states.first().copied().unwrap_or(false)),
            (second, states.get(1).copied().unwrap_or(false)),
        ] {
            let running = self.manual.contains(&direction);
            if on && !running {
                result = result.and(link.start_motion(direction));
                self.manual.push(direction);
            } else if !on && running {
                result = result.and(link.stop_motion(direction));
                self.manual.retain(|d| *d != direction);
            }
        }

        match result {
            Ok(()) => {
                let state = if states.iter().any(|s| *s) {
                    PropertyState::Busy
                } else {
                    PropertyState::Idle
                };
                self.publisher
                    .set(property, PropertyValue::Switch(states.to_vec()), state);
                true
            }
            Err(e) => self.publisher.alert(property, &e),
        }
    }

    fn slew_rate(&mut self, states: &[bool]) -> bool {
        let Some(index) = states.iter().position(|s| *s) else {
            return self.publisher.alert(
                names::TELESCOPE_SLEW_RATE,
                &DriverError::InvalidArgument("no slew rate selected".into()),
            );
        };
        let Some(rate) = SlewRate::ALL.get(index).copied() else {
            return self.publisher.alert(
                names::TELESCOPE_SLEW_RATE,
                &DriverError::range(index as f64, 0.0, (SlewRate::ALL.len() - 1) as f64),
            );
        };
        let Some(engine) = self.engine.as_mut() else {
            return self
                .publisher
                .alert(names::TELESCOPE_SLEW_RATE, &DriverError::NotConnected);
        };
        match MountLink::new(engine, self.config.use_pulse_commands).set_slew_rate(rate) {
            Ok(()) => {
                self.publisher.set(
                    names::TELESCOPE_SLEW_RATE,
                    PropertyValue::Switch(states.to_vec()),
                    PropertyState::Ok,
                );
                true
            }
            Err(e) => self.publisher.alert(names::TELESCOPE_SLEW_RATE, &e),
        }
    }

    fn poll_mount(&mut self) -> bool {
        let Some(engine) = self.engine.as_mut() else {
            return false;
        };
        let (ra, dec) = match MountLink::new(engine, self.config.use_pulse_commands).coordinates() {
            Ok(coordinates) => coordinates,
            Err(e) => {
                if self.is_slewing() {
                    tracing::warn!("{}: poll failed during slew", self.config.name);
                    self.slew = Slew::Idle;
                }
                return self.publisher.alert(names::EQUATORIAL_EOD_COORD, &e);
            }
        };
        self.coordinates = Some((ra, dec));

        let state = match self.slew {
            Slew::Idle => PropertyState::Ok,
            Slew::Slewing { last } if last == Some((ra, dec)) => {
                tracing::info!("{}: slew complete", self.config.name);
                self.slew = Slew::Idle;
                PropertyState::Ok
            }
            Slew::Slewing { .. } => {
                self.slew = Slew::Slewing {
                    last: Some((ra, dec)),
                };
                PropertyState::Busy
            }
        };
        self.publisher.set(
            names::EQUATORIAL_EOD_COORD,
            PropertyValue::Number(vec![ra, dec]),
            state,
        );
        true
    }
}

impl Driver for StarGoMount {
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
                self.publisher.set(
                    names::CONNECTION,
                    PropertyValue::Switch(vec![true, false]),
                    PropertyState::Ok,
                );
                true
            }
            Err(e) => {
                self.engine = None;
                self.state = ConnectionState::Disconnected;
                self.publisher.alert(names::CONNECTION, &e)
            }
        }
    }

    fn disconnect(&mut self) -> bool {
        let Self {
            guide,
            publisher,
            engine,
            focuser,
            config,
            ..
        } = self;
        stop_guiding(guide, publisher, engine.as_mut(), config.use_pulse_commands);

        if let Some(focuser) = focuser.as_mut() {
            focuser.disconnect(engine.as_mut());
        }
        if let Some(engine) = engine.as_mut() {
            if matches!(self.slew, Slew::Slewing { .. }) || !self.manual.is_empty() {
                if let Err(e) = MountLink::new(engine, config.use_pulse_commands).abort() {
                    tracing::warn!("{}: stop on disconnect failed: {}", config.name, e);
                }
            }
        }

        self.engine = None;
        self.slew = Slew::Idle;
        self.manual.clear();
        self.state = ConnectionState::Disconnected;
        self.publisher.set(
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
        let mount_ok = self.poll_mount();
        let focuser_ok = match (self.focuser.as_mut(), self.engine.as_mut()) {
            (Some(focuser), Some(engine)) => focuser.poll(engine),
            _ => true,
        };
        mount_ok && focuser_ok
    }

    fn run_timers(&mut self) -> bool {
        let now = self.clock.now();
        let Self {
            guide,
            publisher,
            engine,
            focuser,
            config,
            ..
        } = self;
        let Some(engine) = engine.as_mut() else {
            return false;
        };
        guide.fire_due(
            &mut MountLink::new(&mut *engine, config.use_pulse_commands),
            now,
            &mut |c| publish_completion(publisher, c),
        );
        match focuser.as_mut() {
            Some(focuser) => focuser.run_timers(engine, now),
            None => true,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        earliest([
            self.guide.next_deadline(),
            self.focuser.as_ref().and_then(|f| f.next_deadline()),
        ])
    }

    fn update_number(&mut self, name: &str, values: &[f64]) -> bool {
        if StarGoFocuser::handles(name) {
            let poll_interval = self.poll_interval();
            return match (self.focuser.as_mut(), self.engine.as_mut()) {
                (Some(focuser), Some(engine)) => {
                    focuser.update_number(engine, name, values, poll_interval)
                }
                (None, _) => self
                    .publisher
                    .alert(name, &DriverError::Unsupported("AUX1 focuser disabled")),
                (Some(_), None) => self.publisher.alert(name, &DriverError::NotConnected),
            };
        }

        match name {
            names::EQUATORIAL_EOD_COORD => match values {
                [ra, dec, ..] => self.goto(*ra, *dec),
                _ => self.publisher.alert(
                    name,
                    &DriverError::InvalidArgument("expected [ra, dec]".into()),
                ),
            },
            names::TELESCOPE_TIMED_GUIDE_NS | names::TELESCOPE_TIMED_GUIDE_WE => {
                self.guide(name, values)
            }
            names::GUIDE_RATE => {
                let ra = values.first().copied().unwrap_or(0.0);
                let dec = values.get(1).copied().unwrap_or(ra);
                let Some(engine) = self.engine.as_mut() else {
                    return self.publisher.alert(name, &DriverError::NotConnected);
                };
                let result = MountLink::new(engine, self.config.use_pulse_commands)
                    .set_guide_speeds(ra.round() as u32, dec.round() as u32);
                match result {
                    Ok(()) => {
                        self.config.guide_speed_ra = ra.round() as u32;
                        self.config.guide_speed_dec = dec.round() as u32;
                        self.publisher
                            .set(name, PropertyValue::Number(vec![ra, dec]), PropertyState::Ok);
                        true
                    }
                    Err(e) => self.publisher.alert(name, &e),
                }
            }
            _ => false,
        }
    }

    fn update_switch(&mut self, name: &str, states: &[bool]) -> bool {
        if StarGoFocuser::handles(name) {
            return match (self.focuser.as_mut(), self.engine.as_mut()) {
                (Some(focuser), Some(engine)) => focuser.update_switch(engine, name, states),
                (None, _) => self
                    .publisher
                    .alert(name, &DriverError::Unsupported("AUX1 focuser disabled")),
                (Some(_), None) => self.publisher.alert(name, &DriverError::NotConnected),
            };
        }

        let on = states.first().copied().unwrap_or(false);
        match name {
            names::CONNECTION => {
                if on {
                    self.connect()
                } else {
                    self.disconnect()
                }
            }
            names::TELESCOPE_ABORT_MOTION => self.abort(),
            names::ON_COORD_SET => {
                // [slew, sync]
                self.sync_on_coord_set = states.get(1).copied().unwrap_or(false);
                self.publisher
                    .set(name, PropertyValue::Switch(states.to_vec()), PropertyState::Ok);
                true
            }
            names::TELESCOPE_MOTION_NS | names::TELESCOPE_MOTION_WE => {
                self.manual_motion(name, states)
            }
            names::TELESCOPE_SLEW_RATE => self.slew_rate(states),
            names::USE_PULSE_CMD => {
                self.config.use_pulse_commands = on;
                self.publisher
                    .set(name, PropertyValue::Switch(states.to_vec()), PropertyState::Ok);
                true
            }
            _ => false,
        }
    }

    fn update_text(&mut self, name: &str, values: &[String]) -> bool {
        match name {
            names::TIME_UTC => {
                let parsed = values
                    .first()
                    .ok_or_else(|| DriverError::InvalidArgument("missing UTC time".into()))
                    .and_then(|s| {
                        DateTime::parse_from_rfc3339(s)
                            .map(|t| t.with_timezone(&Utc))
                            .map_err(|e| DriverError::InvalidArgument(e.to_string()))
                    });
                let Some(engine) = self.engine.as_mut() else {
                    return self.publisher.alert(name, &DriverError::NotConnected);
                };
                let result = parsed.and_then(|utc| {
                    MountLink::new(engine, self.config.use_pulse_commands).sync_time_and_site(
                        utc,
                        self.config.latitude,
                        self.config.longitude,
                    )
                });
                match result {
                    Ok(()) => {
                        self.publisher
                            .set(name, PropertyValue::Text(values.to_vec()), PropertyState::Ok);
                        true
                    }
                    Err(e) => self.publisher.alert(name, &e),
                }
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MockTransport;
    use chrono::TimeZone;

    #[test]
    fn test_goto_refusal_reads_reason() {
        let mock = MockTransport::new();
        mock.expect(":Sr12:30:00#", "1")
            .expect(":Sd+45*00:00#", "1")
            .expect(":MS#", "1Object below horizon#");
        let mut engine = QueryEngine::new(mock);
        let err = MountLink::new(&mut engine, true).goto(12.5, 45.0).unwrap_err();
        assert!(err.to_string().contains("below horizon"));
    }

    #[test]
    fn test_pulse_command_grammar() {
        let mock = MockTransport::new();
        mock.expect_silent(":Mgn0500#").expect_silent(":Mgw0075#");
        let mut engine = QueryEngine::new(mock.clone());
        let mut link = MountLink::new(&mut engine, true);
        link.start_pulse(GuideDirection::North, Duration::from_millis(500))
            .unwrap();
        link.start_pulse(GuideDirection::West, Duration::from_millis(75))
            .unwrap();
        assert!(link
            .start_pulse(GuideDirection::East, Duration::from_millis(10_000))
            .is_err());
        assert_eq!(mock.remaining(), 0);
        assert_eq!(mock.written().len(), 2);
    }

    #[test]
    fn test_move_and_stop_guiding() {
        let mock = MockTransport::new();
        let mut engine = QueryEngine::new(mock.clone());
        let mut link = MountLink::new(&mut engine, false);
        link.start_pulse(GuideDirection::South, Duration::from_millis(200))
            .unwrap();
        link.finish_pulse(GuideDirection::South).unwrap();
        assert_eq!(mock.written_text(), vec![":RG#", ":Ms#", ":Qs#"]);
    }

    #[test]
    fn test_time_and_site_commands() {
        let mock = MockTransport::new();
        for request in [
            ":SL21:05:09#",
            ":SC03/07/24#",
            ":SG+00#",
            ":St+48*30#",
            ":Sg348*00#",
        ] {
            mock.expect(request, "1");
        }
        let mut engine = QueryEngine::new(mock.clone());
        let now = Utc.with_ymd_and_hms(2024, 3, 7, 21, 5, 9).unwrap();
        MountLink::new(&mut engine, true)
            .sync_time_and_site(now, 48.5, 12.0)
            .unwrap();
        assert_eq!(mock.remaining(), 0);
        assert!(mock.unexpected().is_empty());
    }

    #[test]
    fn test_guide_speed_range() {
        let mock = MockTransport::new();
        mock.expect_silent(":X203050#");
        let mut engine = QueryEngine::new(mock.clone());
        let mut link = MountLink::new(&mut engine, true);
        link.set_guide_speeds(30, 50).unwrap();
        assert!(matches!(
            link.set_guide_speeds(95, 50),
            Err(DriverError::Range { .. })
        ));
        assert_eq!(mock.written().len(), 1);
    }
}
