use log::warn;

use crate::Report;

bitflags::bitflags! {
    /// Status word the device reports about itself. SYNC here is the
    /// device confirming it decodes *our* frames; it is independent of the
    /// local resync state.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct StatusFlags: u16 {
        const SYNC = 0x01;
        const OVERTEMP_FAULT = 0x02;
        const OVERCURRENT_FAULT = 0x04;
        const ENGAGED = 0x08;
        /// Device-side self-diagnostic: it received a frame that failed
        /// its own checksum. Not related to local frame validation.
        const INVALID = 0x10;
        const PORT_PIN_FAULT = 0x20;
        const STARBOARD_PIN_FAULT = 0x40;
    }
}

bitflags::bitflags! {
    /// Which telemetry fields a poll updated.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TelemetryUpdates: u16 {
        const FLAGS = 1;
        const CURRENT = 2;
        const VOLTAGE = 4;
        const CONTROLLER_TEMP = 32;
        const MOTOR_TEMP = 64;
        const RUDDER = 128;
        const EEPROM = 256;
        const VERSION = 512;
    }
}

/// Raw rudder value meaning "no sensor fitted".
const RUDDER_INVALID: u16 = 65535;

/// Full-scale divisor for the rudder sense, shared with the angle command
/// encoding.
pub(crate) const RUDDER_SCALE: f64 = 65472.0;

/// Latest values reported by the device. Every field is overwritten in
/// place when its report arrives; no history is kept.
#[derive(Clone, Debug)]
pub struct Telemetry {
    /// Motor current, amps.
    pub current: f64,
    /// Supply voltage, volts.
    pub voltage: f64,
    /// Controller temperature, degrees C.
    pub controller_temp: f64,
    /// Motor temperature, degrees C.
    pub motor_temp: f64,
    /// Rudder position in normalized turns, -0.5..0.5, NaN without a sensor.
    pub rudder: f64,
    /// Firmware version, major*100 + minor.
    pub version: u16,
    pub flags: StatusFlags,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            current: 0.0,
            voltage: 0.0,
            controller_temp: 0.0,
            motor_temp: 0.0,
            rudder: f64::NAN,
            version: 0,
            flags: StatusFlags::empty(),
        }
    }
}

impl Telemetry {
    /// Applies one report, returning which field changed. EEPROM reports
    /// belong to the settings shadow and unknown codes are ignored for
    /// forward compatibility; both yield an empty update.
    pub(crate) fn update(&mut self, report: Report, value: u16) -> TelemetryUpdates {
        match report {
            Report::Current => {
                self.current = value as f64 / 100.0;
                TelemetryUpdates::CURRENT
            }
            Report::Voltage => {
                self.voltage = value as f64 / 100.0;
                TelemetryUpdates::VOLTAGE
            }
            Report::ControllerTemp => {
                self.controller_temp = value as i16 as f64 / 100.0;
                TelemetryUpdates::CONTROLLER_TEMP
            }
            Report::MotorTemp => {
                self.motor_temp = value as i16 as f64 / 100.0;
                TelemetryUpdates::MOTOR_TEMP
            }
            Report::RudderSense => {
                self.rudder = if value == RUDDER_INVALID {
                    f64::NAN
                } else {
                    value as f64 / RUDDER_SCALE - 0.5
                };
                TelemetryUpdates::RUDDER
            }
            Report::Flags => {
                self.flags = StatusFlags::from_bits_retain(value);
                if self.flags.contains(StatusFlags::INVALID) {
                    warn!("device rejected a frame as invalid (check serial connection)");
                }
                TelemetryUpdates::FLAGS
            }
            Report::Version => {
                self.version = (value >> 8) * 100 + (value & 0xFF);
                TelemetryUpdates::VERSION
            }
            Report::EepromValue => TelemetryUpdates::empty(),
        }
    }
}
