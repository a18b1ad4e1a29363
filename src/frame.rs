use num_enum::TryFromPrimitive;

use crate::{CRC8, FRAME_LEN};

/// Command codes sent to the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Desired rudder angle, `(angle + 0.5) * 65472` in normalized turns.
    Angle = 0xC9,
    /// Drive power, `(command + 1) * 1000` for a command in -1..1.
    Drive = 0xC7,
    Reset = 0xE7,
    MaxCurrent = 0x1E,
    MaxControllerTemp = 0xA4,
    MaxMotorTemp = 0x5A,
    RudderMin = 0x2B,
    RudderMax = 0x4D,
    Reprogram = 0x19,
    Disengage = 0x68,
    /// Slew limits packed as `slow << 8 | speed`.
    MaxSlew = 0x71,
    /// Request a settings range, `start | end << 8` (end exclusive).
    EepromRead = 0x91,
    /// Write one settings byte, `addr | value << 8`.
    EepromWrite = 0x53,
}

/// Report codes received from the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Report {
    Current = 0x1C,
    Voltage = 0xB3,
    ControllerTemp = 0xF9,
    MotorTemp = 0x48,
    RudderSense = 0xA7,
    Flags = 0x8F,
    EepromValue = 0x9A,
    Version = 0x88,
}

/// Encodes a code/value pair into a wire frame: code, value low byte,
/// value high byte, checksum over the first three.
pub fn encode(code: u8, value: u16) -> [u8; FRAME_LEN] {
    let [lo, hi] = value.to_le_bytes();
    let mut frame = [code, lo, hi, 0];
    frame[3] = CRC8.checksum(&frame[..3]);
    frame
}

/// Decodes a candidate 4-byte window, returning the code/value pair only
/// if the trailing checksum matches.
pub fn decode(window: &[u8; FRAME_LEN]) -> Option<(u8, u16)> {
    if CRC8.checksum(&window[..3]) != window[3] {
        return None;
    }
    Some((window[0], u16::from_le_bytes([window[1], window[2]])))
}
