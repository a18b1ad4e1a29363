use std::io::{ErrorKind, Read, Write};

use log::{debug, trace, warn};
use snafu::{ResultExt, Snafu};

use crate::eeprom::{SettingsField, SettingsShadow};
use crate::link::{Deframer, LinkError, LinkHealth};
use crate::telemetry::RUDDER_SCALE;
use crate::{Command, Report, StatusFlags, Telemetry, TelemetryUpdates, FRAME_LEN, RX_BUF_LEN};

/// A failed poll ends the session; the caller reopens the channel and
/// builds a fresh one.
#[derive(Debug, Snafu)]
pub enum PollError {
    #[snafu(display("servo link failed: {source}"))]
    Link { source: LinkError },
    #[snafu(display("servo channel read failed: {source}"))]
    Io { source: std::io::Error },
}

/// The full parameter set, in physical units. All fields are clamped to
/// their admissible ranges by [`ServoSession::params`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ServoParams {
    /// Hard current ceiling, amps. Not persisted on the device.
    pub raw_max_current: f64,
    /// Rudder travel limits, normalized turns. Not persisted.
    pub rudder_min: f64,
    pub rudder_max: f64,
    /// Working current limit, amps.
    pub max_current: f64,
    pub max_controller_temp: f64,
    pub max_motor_temp: f64,
    /// Rudder travel, degrees.
    pub rudder_range: f64,
    pub rudder_offset: f64,
    pub rudder_scale: f64,
    pub rudder_nonlinearity: f64,
    /// Slew limits, percent of full speed per period.
    pub max_slew_speed: f64,
    pub max_slew_slow: f64,
    /// Sense calibration factors and offsets.
    pub current_factor: f64,
    pub current_offset: f64,
    pub voltage_factor: f64,
    pub voltage_offset: f64,
    /// Drive speed bounds, percent.
    pub min_speed: f64,
    pub max_speed: f64,
    pub gain: f64,
    pub rudder_brake: f64,
}

impl Default for ServoParams {
    fn default() -> Self {
        Self {
            raw_max_current: 60.0,
            rudder_min: -0.5,
            rudder_max: 0.5,
            max_current: 7.0,
            max_controller_temp: 70.0,
            max_motor_temp: 70.0,
            rudder_range: 45.0,
            rudder_offset: 0.0,
            rudder_scale: 100.0,
            rudder_nonlinearity: 0.0,
            max_slew_speed: 50.0,
            max_slew_slow: 75.0,
            current_factor: 1.0,
            current_offset: 0.0,
            voltage_factor: 1.0,
            voltage_offset: 0.0,
            min_speed: 10.0,
            max_speed: 100.0,
            gain: 1.0,
            rudder_brake: 10.0,
        }
    }
}

/// Fallback for records written before `rudder_brake` existed.
const DEFAULT_RUDDER_BRAKE: f64 = 10.0;

/// Auxiliary frame accompanying a command at a given schedule step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scheduled {
    MaxCurrent,
    MaxControllerTemp,
    MaxMotorTemp,
    RudderMin,
    RudderMax,
    MaxSlew,
    EepromRead,
    EepromWrite,
}

const SCHEDULE_PERIOD: usize = 23;

/// Round-robin transmit schedule. The current limit repeats three times
/// per cycle so a safety-relevant value survives frame loss quickly; the
/// one-shot sends and the two EEPROM slots each get a distinct step.
#[rustfmt::skip]
const SCHEDULE: [Option<Scheduled>; SCHEDULE_PERIOD] = [
    /*  0 */ Some(Scheduled::MaxCurrent),
    /*  1 */ None,
    /*  2 */ None,
    /*  3 */ None,
    /*  4 */ Some(Scheduled::MaxControllerTemp),
    /*  5 */ None,
    /*  6 */ Some(Scheduled::MaxMotorTemp),
    /*  7 */ None,
    /*  8 */ Some(Scheduled::MaxCurrent),
    /*  9 */ None,
    /* 10 */ None,
    /* 11 */ None,
    /* 12 */ Some(Scheduled::RudderMin),
    /* 13 */ None,
    /* 14 */ Some(Scheduled::RudderMax),
    /* 15 */ None,
    /* 16 */ Some(Scheduled::MaxCurrent),
    /* 17 */ None,
    /* 18 */ Some(Scheduled::MaxSlew),
    /* 19 */ None,
    /* 20 */ Some(Scheduled::EepromRead),
    /* 21 */ None,
    /* 22 */ Some(Scheduled::EepromWrite),
];

/// Schedule steps an EEPROM read request stays suppressed after each
/// received EEPROM report, so reads never pile up behind slow replies.
const EEPROM_READ_HOLDOFF: u8 = 4;

/// One point-to-point session with the servo over a byte channel.
///
/// The caller owns the pacing: one `poll` per period for the receive side,
/// and `command`/`angle`/`disengage` for the transmit side, each of which
/// also advances the parameter schedule by one step.
pub struct ServoSession<C: Read + Write> {
    channel: C,
    deframer: Deframer,
    health: LinkHealth,
    shadow: SettingsShadow,
    telemetry: Telemetry,
    params: ServoParams,
    params_set: bool,
    out_sync: usize,
    eeprom_holdoff: u8,
}

impl<C: Read + Write> ServoSession<C> {
    /// Wraps an opened channel. Knocks the device out of frame sync with a
    /// deliberately invalid frame and discards any stale input, so both
    /// ends start the handshake from scratch.
    pub fn new(channel: C) -> Self {
        let mut session = Self {
            channel,
            deframer: Deframer::new(),
            health: LinkHealth::new(),
            shadow: SettingsShadow::new(),
            telemetry: Telemetry::default(),
            params: ServoParams::default(),
            params_set: false,
            out_sync: 0,
            eeprom_holdoff: 0,
        };
        session.write_frame([0xFF; FRAME_LEN]);
        session.drain_input();
        session
    }

    /// Latest telemetry snapshot.
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Currently effective (clamped) parameters.
    pub fn settings(&self) -> &ServoParams {
        &self.params
    }

    /// Device-reported overcurrent condition.
    pub fn fault(&self) -> bool {
        self.telemetry.flags.contains(StatusFlags::OVERCURRENT_FAULT)
    }

    /// Sets drive power, -1..1 (clamped), plus one schedule step.
    pub fn command(&mut self, command: f64) {
        let command = command.clamp(-1.0, 1.0);
        self.raw_command(((command + 1.0) * 1000.0) as u16);
    }

    /// Sets the desired rudder angle in normalized turns, plus one
    /// schedule step.
    pub fn angle(&mut self, angle: f64) {
        self.send_scheduled();
        self.send_value(Command::Angle, ((angle + 0.5) * RUDDER_SCALE) as u16);
    }

    /// Releases the drive, plus one schedule step.
    pub fn disengage(&mut self) {
        self.send_scheduled();
        self.send_value(Command::Disengage, 0);
    }

    /// Out-of-band device reset; bypasses the schedule.
    pub fn reset(&mut self) {
        self.send_value(Command::Reset, 0);
    }

    /// Drops the device into its bootloader; bypasses the schedule.
    pub fn reprogram(&mut self) {
        self.send_value(Command::Reprogram, 0);
    }

    /// Validates and installs the full parameter set. Each field is
    /// clamped to its admissible range; the result lands both in the live
    /// settings and in the desired copy of the device record. No parameter
    /// traffic is scheduled until this has run at least once.
    pub fn params(&mut self, requested: &ServoParams) {
        let mut p = *requested;
        p.raw_max_current = p.raw_max_current.clamp(0.0, 60.0);
        p.rudder_min = p.rudder_min.clamp(-0.5, 0.5);
        p.rudder_max = p.rudder_max.clamp(-0.5, 0.5);
        p.max_current = p.max_current.clamp(0.0, 60.0);
        p.max_controller_temp = p.max_controller_temp.clamp(30.0, 100.0);
        p.max_motor_temp = p.max_motor_temp.clamp(30.0, 100.0);
        p.rudder_range = p.rudder_range.clamp(0.0, 120.0);
        p.rudder_offset = p.rudder_offset.clamp(-500.0, 500.0);
        p.rudder_scale = p.rudder_scale.clamp(-4000.0, 4000.0);
        p.rudder_nonlinearity = p.rudder_nonlinearity.clamp(-4000.0, 4000.0);
        p.max_slew_speed = p.max_slew_speed.clamp(0.0, 100.0);
        p.max_slew_slow = p.max_slew_slow.clamp(0.0, 100.0);
        p.current_factor = p.current_factor.clamp(0.8, 1.2);
        p.current_offset = p.current_offset.clamp(-1.2, 1.2);
        p.voltage_factor = p.voltage_factor.clamp(0.8, 1.2);
        p.voltage_offset = p.voltage_offset.clamp(-1.2, 1.2);
        p.min_speed = p.min_speed.clamp(0.0, 100.0);
        p.max_speed = p.max_speed.clamp(0.0, 100.0);
        // The firmware interprets gain only away from zero; the range
        // clamp runs first, then the minimum magnitude. Keep this order.
        p.gain = p.gain.clamp(-10.0, 10.0);
        p.gain = if p.gain < 0.0 {
            p.gain.min(-0.5)
        } else {
            p.gain.max(0.5)
        };
        p.rudder_brake = p.rudder_brake.clamp(1.0, 100.0);

        self.shadow.set(SettingsField::MaxCurrent, p.max_current);
        self.shadow
            .set(SettingsField::MaxControllerTemp, p.max_controller_temp);
        self.shadow.set(SettingsField::MaxMotorTemp, p.max_motor_temp);
        self.shadow.set(SettingsField::RudderRange, p.rudder_range);
        self.shadow.set(SettingsField::RudderOffset, p.rudder_offset);
        self.shadow.set(SettingsField::RudderScale, p.rudder_scale);
        self.shadow
            .set(SettingsField::RudderNonlinearity, p.rudder_nonlinearity);
        self.shadow.set(SettingsField::MaxSlewSpeed, p.max_slew_speed);
        self.shadow.set(SettingsField::MaxSlewSlow, p.max_slew_slow);
        self.shadow.set(SettingsField::CurrentFactor, p.current_factor);
        self.shadow.set(SettingsField::CurrentOffset, p.current_offset);
        self.shadow.set(SettingsField::VoltageFactor, p.voltage_factor);
        self.shadow.set(SettingsField::VoltageOffset, p.voltage_offset);
        self.shadow.set(SettingsField::MinSpeed, p.min_speed);
        self.shadow.set(SettingsField::MaxSpeed, p.max_speed);
        self.shadow.set(SettingsField::Gain, p.gain);
        self.shadow.set(SettingsField::RudderBrake, p.rudder_brake);

        self.params = p;
        self.params_set = true;
    }

    /// One receive cycle. Returns which telemetry fields changed; while
    /// the device has not yet confirmed sync, decoded data only feeds the
    /// health tracking and the caller sees an empty set.
    pub fn poll(&mut self) -> Result<TelemetryUpdates, PollError> {
        let synced = self.telemetry.flags.contains(StatusFlags::SYNC);
        if !synced {
            // Keep neutral command frames flowing so the device can lock
            // onto our framing; this also carries the limits schedule.
            self.raw_command(1000);
        }
        self.health.tick(synced).context(LinkSnafu)?;

        if self.deframer.pending() < FRAME_LEN {
            self.fill()?;
            if self.deframer.pending() < FRAME_LEN {
                return Ok(TelemetryUpdates::empty());
            }
        }

        let mut updates = TelemetryUpdates::empty();
        while let Some((code, value)) = self.deframer.next_frame() {
            updates |= self.process_frame(code, value);
        }

        // The device may have confirmed sync within this very cycle.
        if self.telemetry.flags.contains(StatusFlags::SYNC) {
            Ok(updates)
        } else {
            if !updates.is_empty() {
                self.health.observe_data();
            }
            Ok(TelemetryUpdates::empty())
        }
    }

    /// Refills the working buffer from the channel without blocking. A
    /// buffer that fills to capacity without a frame is corrupt and gets
    /// reinitialized before reading on.
    fn fill(&mut self) -> Result<(), PollError> {
        let mut scratch = [0u8; RX_BUF_LEN];
        loop {
            let free = RX_BUF_LEN - self.deframer.pending();
            let n = match self.channel.read(&mut scratch[..free]) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => 0,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context(IoSnafu),
            };
            self.deframer.push_bytes(&scratch[..n]);
            if n < free {
                return Ok(());
            }
            self.deframer.reinitialize();
        }
    }

    fn process_frame(&mut self, code: u8, value: u16) -> TelemetryUpdates {
        let Ok(report) = Report::try_from(code) else {
            // Unknown codes come from newer firmware; skip them.
            return TelemetryUpdates::empty();
        };
        if report == Report::EepromValue {
            self.eeprom_holdoff = EEPROM_READ_HOLDOFF;
            let [addr, val] = value.to_le_bytes();
            self.shadow.record_byte(addr, val);
            if self.shadow.initial() {
                self.publish_settings();
                return TelemetryUpdates::EEPROM;
            }
            return TelemetryUpdates::empty();
        }
        self.telemetry.update(report, value)
    }

    /// Runs once, when the whole device record has been read for the first
    /// time: adopt the device's persisted settings as our own, revalidated
    /// through the usual clamps.
    fn publish_settings(&mut self) {
        debug!("device settings record fully read, publishing");
        let rudder_brake = if self.shadow.signature_current() {
            self.shadow.get(SettingsField::RudderBrake)
        } else {
            DEFAULT_RUDDER_BRAKE
        };
        let restored = ServoParams {
            raw_max_current: 60.0,
            rudder_min: 0.0,
            rudder_max: 1.0,
            max_current: self.shadow.get(SettingsField::MaxCurrent),
            max_controller_temp: self.shadow.get(SettingsField::MaxControllerTemp),
            max_motor_temp: self.shadow.get(SettingsField::MaxMotorTemp),
            rudder_range: self.shadow.get(SettingsField::RudderRange),
            rudder_offset: self.shadow.get(SettingsField::RudderOffset),
            rudder_scale: self.shadow.get(SettingsField::RudderScale),
            rudder_nonlinearity: self.shadow.get(SettingsField::RudderNonlinearity),
            max_slew_speed: self.shadow.get(SettingsField::MaxSlewSpeed),
            max_slew_slow: self.shadow.get(SettingsField::MaxSlewSlow),
            current_factor: self.shadow.get(SettingsField::CurrentFactor),
            current_offset: self.shadow.get(SettingsField::CurrentOffset),
            voltage_factor: self.shadow.get(SettingsField::VoltageFactor),
            voltage_offset: self.shadow.get(SettingsField::VoltageOffset),
            min_speed: self.shadow.get(SettingsField::MinSpeed),
            max_speed: self.shadow.get(SettingsField::MaxSpeed),
            gain: self.shadow.get(SettingsField::Gain),
            rudder_brake,
        };
        self.params(&restored);
    }

    fn raw_command(&mut self, value: u16) {
        self.send_scheduled();
        self.send_value(Command::Drive, value);
    }

    /// Advances the transmit schedule one step, sending at most one
    /// auxiliary frame. Silent until `params` has initialized the limits.
    fn send_scheduled(&mut self) {
        if !self.params_set {
            return;
        }
        match SCHEDULE[self.out_sync] {
            Some(Scheduled::MaxCurrent) => {
                let raw = self.shadow.local_word(SettingsField::MaxCurrent.offset());
                self.send_value(Command::MaxCurrent, raw);
            }
            Some(Scheduled::MaxControllerTemp) => {
                let raw = self
                    .shadow
                    .local_word(SettingsField::MaxControllerTemp.offset());
                self.send_value(Command::MaxControllerTemp, raw);
            }
            Some(Scheduled::MaxMotorTemp) => {
                let raw = self.shadow.local_word(SettingsField::MaxMotorTemp.offset());
                self.send_value(Command::MaxMotorTemp, raw);
            }
            Some(Scheduled::RudderMin) => {
                let raw = ((self.params.rudder_min + 0.5) * RUDDER_SCALE).round() as u16;
                self.send_value(Command::RudderMin, raw);
            }
            Some(Scheduled::RudderMax) => {
                let raw = ((self.params.rudder_max + 0.5) * RUDDER_SCALE).round() as u16;
                self.send_value(Command::RudderMax, raw);
            }
            Some(Scheduled::MaxSlew) => {
                let speed = self.shadow.local_byte(SettingsField::MaxSlewSpeed.offset());
                let slow = self.shadow.local_byte(SettingsField::MaxSlewSlow.offset());
                self.send_value(Command::MaxSlew, (slow as u16) << 8 | speed as u16);
            }
            Some(Scheduled::EepromRead) => {
                if self.eeprom_holdoff == 0 {
                    if let Some((addr, end)) = self.shadow.need_read() {
                        debug!("requesting settings bytes {addr}..{end}");
                        self.send_value(Command::EepromRead, addr as u16 | (end as u16) << 8);
                    }
                } else {
                    self.eeprom_holdoff -= 1;
                }
            }
            Some(Scheduled::EepromWrite) => {
                if let Some(addr) = self.shadow.need_write() {
                    // Both bytes of the word, back to back, so no field is
                    // ever observed half-updated.
                    let lo = self.shadow.local_byte(addr as usize);
                    let hi = self.shadow.local_byte(addr as usize + 1);
                    debug!("writing settings word at {addr}");
                    self.send_value(Command::EepromWrite, addr as u16 | (lo as u16) << 8);
                    self.send_value(Command::EepromWrite, (addr as u16 + 1) | (hi as u16) << 8);
                }
            }
            None => {}
        }
        self.out_sync = (self.out_sync + 1) % SCHEDULE_PERIOD;
    }

    fn send_value(&mut self, command: Command, value: u16) {
        trace!("send {command:?} value {value}");
        self.write_frame(crate::frame::encode(command as u8, value));
    }

    // Outbound traffic is best-effort; a dropped frame is resent by the
    // schedule or the next command, while read failures end the session.
    fn write_frame(&mut self, frame: [u8; FRAME_LEN]) {
        if let Err(e) = self.channel.write_all(&frame) {
            warn!("servo write failed: {e}");
        }
    }

    fn drain_input(&mut self) {
        let mut scratch = [0u8; RX_BUF_LEN];
        loop {
            match self.channel.read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;

    use super::*;
    use crate::frame::encode;

    #[derive(Default)]
    struct MockChannel {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.rx.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.rx.len());
            for slot in &mut buf[..n] {
                *slot = self.rx.pop_front().expect("rx byte");
            }
            Ok(n)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.tx.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn session() -> ServoSession<MockChannel> {
        let mut session = ServoSession::new(MockChannel::default());
        session.channel.tx.clear(); // drop the desync preamble
        session
    }

    /// Splits captured output into frames; panics on framing damage.
    fn sent_frames(session: &ServoSession<MockChannel>) -> Vec<(u8, u16)> {
        session
            .channel
            .tx
            .chunks(FRAME_LEN)
            .map(|chunk| {
                let window: &[u8; FRAME_LEN] = chunk.try_into().expect("whole frame");
                crate::frame::decode(window).expect("valid frame")
            })
            .collect()
    }

    /// Queues a report frame enough times for the resync debounce to pass
    /// it through on the next poll.
    fn queue_trusted(session: &mut ServoSession<MockChannel>, code: u8, value: u16) {
        for _ in 0..3 {
            session.channel.rx.extend(encode(code, value));
        }
    }

    #[test]
    fn test_command_scaling() {
        let mut servo = session();
        servo.command(0.0);
        servo.command(1.0);
        servo.command(-1.0);
        servo.command(7.5); // clamped
        let drive = Command::Drive as u8;
        assert_eq!(
            sent_frames(&servo),
            vec![(drive, 1000), (drive, 2000), (drive, 0), (drive, 2000)]
        );
    }

    #[test]
    fn test_angle_scaling() {
        let mut servo = session();
        servo.angle(0.0);
        assert_eq!(sent_frames(&servo), vec![(Command::Angle as u8, 32736)]);
    }

    #[test]
    fn test_out_of_band_frames_skip_schedule() {
        let mut servo = session();
        servo.params(&ServoParams::default());
        servo.reset();
        servo.reprogram();
        assert_eq!(
            sent_frames(&servo),
            vec![(Command::Reset as u8, 0), (Command::Reprogram as u8, 0)]
        );
    }

    #[test]
    fn test_no_scheduled_frames_before_params() {
        let mut servo = session();
        for _ in 0..SCHEDULE_PERIOD {
            servo.command(0.0);
        }
        assert!(sent_frames(&servo)
            .iter()
            .all(|&(code, _)| code == Command::Drive as u8));
    }

    #[test]
    fn test_schedule_cycle() {
        let mut servo = session();
        servo.params(&ServoParams::default());
        servo.channel.tx.clear();
        for _ in 0..SCHEDULE_PERIOD {
            servo.command(0.0);
        }
        let frames = sent_frames(&servo);
        let count = |code: Command| {
            frames
                .iter()
                .filter(|&&(c, _)| c == code as u8)
                .count()
        };
        assert_eq!(count(Command::Drive), SCHEDULE_PERIOD);
        assert_eq!(count(Command::MaxCurrent), 3);
        assert_eq!(count(Command::MaxControllerTemp), 1);
        assert_eq!(count(Command::MaxMotorTemp), 1);
        assert_eq!(count(Command::RudderMin), 1);
        assert_eq!(count(Command::RudderMax), 1);
        assert_eq!(count(Command::MaxSlew), 1);
        assert_eq!(count(Command::EepromRead), 1);
        // Nothing verified yet, so no write can be scheduled.
        assert_eq!(count(Command::EepromWrite), 0);

        // Raw values on the wire: 7 amps -> 700, slew packed slow|speed,
        // read request covers the first unverified chunk.
        let value = |code: Command| {
            frames
                .iter()
                .find(|&&(c, _)| c == code as u8)
                .map(|&(_, v)| v)
                .expect("frame present")
        };
        assert_eq!(value(Command::MaxCurrent), 700);
        assert_eq!(value(Command::MaxSlew), 75 << 8 | 50);
        assert_eq!(value(Command::EepromRead), 16 << 8);
        assert_eq!(value(Command::RudderMin), 0);
        assert_eq!(value(Command::RudderMax), 65472);
    }

    #[test]
    fn test_eeprom_write_sends_word_pair() {
        let mut servo = session();
        queue_trusted(&mut servo, Report::Flags as u8, StatusFlags::SYNC.bits());
        servo.poll().expect("poll");

        // The device confirms word 0 as zero; both bytes arrive in order.
        // Report payloads carry addr in the low byte, data in the high.
        for addr in [0u16, 1] {
            servo
                .channel
                .rx
                .extend(encode(Report::EepromValue as u8, addr));
        }
        servo.poll().expect("poll");

        // 7 amps -> raw 700 in word 0, disagreeing with the confirmed zero.
        let mut p = ServoParams::default();
        p.max_current = 7.0;
        servo.params(&p);
        servo.channel.tx.clear();
        for _ in 0..SCHEDULE_PERIOD {
            servo.command(0.0);
        }

        let frames = sent_frames(&servo);
        let writes: Vec<usize> = frames
            .iter()
            .enumerate()
            .filter(|&(_, &(c, _))| c == Command::EepromWrite as u8)
            .map(|(i, _)| i)
            .collect();
        // One word per cycle, both bytes back to back so the field is never
        // observed half-updated.
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1], writes[0] + 1);
        let lo = (700u16 & 0xFF) << 8;
        let hi = (700u16 >> 8) << 8 | 1;
        assert_eq!(frames[writes[0]], (Command::EepromWrite as u8, lo));
        assert_eq!(frames[writes[1]], (Command::EepromWrite as u8, hi));
    }

    #[test]
    fn test_param_clamps() {
        let mut servo = session();
        let mut p = ServoParams::default();
        p.max_current = 9999.0;
        p.gain = 0.0;
        p.max_controller_temp = 5.0;
        p.rudder_offset = -1000.0;
        servo.params(&p);
        let s = servo.settings();
        assert_eq!(s.max_current, 60.0);
        assert_eq!(s.gain, 0.5);
        assert_eq!(s.max_controller_temp, 30.0);
        assert_eq!(s.rudder_offset, -500.0);

        let mut p = ServoParams::default();
        p.gain = -0.1;
        servo.params(&p);
        assert_eq!(servo.settings().gain, -0.5);
        p.gain = 3.0;
        servo.params(&p);
        assert_eq!(servo.settings().gain, 3.0);
    }

    #[test]
    fn test_poll_surfaces_telemetry_once_synced() {
        let mut servo = session();
        queue_trusted(&mut servo, Report::Flags as u8, StatusFlags::SYNC.bits());
        // The sync confirmation arrives within this poll, so its update is
        // already surfaced.
        let updates = servo.poll().expect("poll");
        assert_eq!(updates, TelemetryUpdates::FLAGS);

        queue_trusted(&mut servo, Report::RudderSense as u8, 32736);
        let updates = servo.poll().expect("poll");
        assert!(updates.contains(TelemetryUpdates::RUDDER));
        assert_eq!(servo.telemetry().rudder, 0.0);

        queue_trusted(&mut servo, Report::RudderSense as u8, 65535);
        servo.poll().expect("poll");
        assert!(servo.telemetry().rudder.is_nan());
    }

    #[test]
    fn test_unsynced_telemetry_is_hidden() {
        let mut servo = session();
        queue_trusted(&mut servo, Report::Current as u8, 300);
        let updates = servo.poll().expect("poll");
        assert!(updates.is_empty());
        // The snapshot still tracks it; only the update bit is withheld.
        assert_eq!(servo.telemetry().current, 3.0);
    }

    #[test]
    fn test_unknown_report_code_is_ignored() {
        let mut servo = session();
        queue_trusted(&mut servo, Report::Flags as u8, StatusFlags::SYNC.bits());
        servo.poll().expect("poll");
        queue_trusted(&mut servo, 0x21, 0xBEEF);
        let updates = servo.poll().expect("poll");
        assert!(updates.is_empty());
    }

    #[test]
    fn test_fail_no_data_at_400th_poll() {
        let mut servo = session();
        for _ in 0..399 {
            servo.poll().expect("poll below threshold");
        }
        let err = servo.poll().expect_err("400th poll must fail");
        assert!(matches!(
            err,
            PollError::Link {
                source: LinkError::NoData { polls: 400 }
            }
        ));
    }

    #[test]
    fn test_fail_sync_at_1000th_poll_when_data_seen() {
        let mut servo = session();
        queue_trusted(&mut servo, Report::Current as u8, 300);
        for _ in 0..999 {
            servo.poll().expect("poll below threshold");
        }
        let err = servo.poll().expect_err("1000th poll must fail");
        assert!(matches!(
            err,
            PollError::Link {
                source: LinkError::SyncFailed { polls: 1000 }
            }
        ));
    }

    #[test]
    fn test_read_error_is_fatal() {
        struct BrokenChannel;
        impl io::Read for BrokenChannel {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::ErrorKind::BrokenPipe.into())
            }
        }
        impl io::Write for BrokenChannel {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let mut servo = ServoSession::new(BrokenChannel);
        assert!(matches!(servo.poll(), Err(PollError::Io { .. })));
    }

    #[test]
    fn test_eeprom_initial_publishes_settings() {
        let mut servo = session();
        queue_trusted(&mut servo, Report::Flags as u8, StatusFlags::SYNC.bits());
        servo.poll().expect("poll");

        // Device streams its whole record: 7A limit, gain 2, current
        // signature. Byte pairs arrive as addr|value<<8 reports.
        let mut record = [0u8; 32];
        record[0..2].copy_from_slice(&700u16.to_le_bytes());
        record[2..4].copy_from_slice(&8000u16.to_le_bytes());
        record[4..6].copy_from_slice(&8000u16.to_le_bytes());
        record[21..23].copy_from_slice(&2000i16.to_le_bytes());
        record[25..31].copy_from_slice(b"cysv03");
        let mut updates = TelemetryUpdates::empty();
        for addr in (0..32u16).step_by(2) {
            for offset in 0..2 {
                let value = (addr + offset) | (record[(addr + offset) as usize] as u16) << 8;
                servo
                    .channel
                    .rx
                    .extend(encode(Report::EepromValue as u8, value));
            }
            updates |= servo.poll().expect("poll");
        }
        assert!(updates.contains(TelemetryUpdates::EEPROM));
        let s = servo.settings();
        assert_eq!(s.max_current, 7.0);
        assert_eq!(s.max_controller_temp, 80.0);
        assert_eq!(s.gain, 2.0);
        // Restored limits go through the same validation as caller input.
        assert_eq!(s.rudder_max, 0.5);
        assert_eq!(s.raw_max_current, 60.0);
        // Converged: desired equals confirmed everywhere except fields the
        // device had at defaults below their clamp floor.
        assert!(servo.params_set);
    }

    #[test]
    fn test_eeprom_old_signature_defaults_new_fields() {
        let mut servo = session();
        queue_trusted(&mut servo, Report::Flags as u8, StatusFlags::SYNC.bits());
        servo.poll().expect("poll");

        let mut record = [0u8; 32];
        record[25..31].copy_from_slice(b"cysv01");
        for addr in (0..32u16).step_by(2) {
            for offset in 0..2 {
                let value = (addr + offset) | (record[(addr + offset) as usize] as u16) << 8;
                servo
                    .channel
                    .rx
                    .extend(encode(Report::EepromValue as u8, value));
            }
            servo.poll().expect("poll");
        }
        assert_eq!(servo.settings().rudder_brake, DEFAULT_RUDDER_BRAKE);
    }

    #[test]
    fn test_poll_keepalive_while_unsynced() {
        let mut servo = session();
        servo.poll().expect("poll");
        assert_eq!(sent_frames(&servo), vec![(Command::Drive as u8, 1000)]);

        // Once synced, poll itself goes quiet.
        queue_trusted(&mut servo, Report::Flags as u8, StatusFlags::SYNC.bits());
        servo.poll().expect("poll");
        servo.channel.tx.clear();
        servo.poll().expect("poll");
        assert!(servo.channel.tx.is_empty());
    }

    #[test]
    fn test_fault_flag() {
        let mut servo = session();
        assert!(!servo.fault());
        queue_trusted(
            &mut servo,
            Report::Flags as u8,
            (StatusFlags::SYNC | StatusFlags::OVERCURRENT_FAULT).bits(),
        );
        servo.poll().expect("poll");
        assert!(servo.fault());
    }
}
