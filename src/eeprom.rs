//! Host-side mirror of the device's persistent settings record.
//!
//! The record is a fixed-layout block of scalar fields the device keeps in
//! EEPROM. Two copies live here: `local` holds the desired values, and
//! `arduino` the values last confirmed read back from the device, with a
//! per-byte `verified` bitmap. Convergence is driven entirely by the
//! session's transmit schedule issuing reads for unverified ranges and
//! whole-word writes where the copies disagree.

/// Size of the settings record, signature and trailing pad included.
pub(crate) const RECORD_LEN: usize = 32;

/// Longest contiguous range requested in one read.
const READ_CHUNK: usize = 16;

/// Format tag terminating the record. Bumped whenever a field is added or
/// resized; it sits at the top of the record so the ascending write
/// protocol updates it last.
pub(crate) const SIGNATURE: &[u8; 6] = b"cysv03";
const SIGNATURE_OFFSET: usize = 25;

#[derive(Clone, Copy)]
enum Encoding {
    U8,
    I8,
    U16,
    I16,
}

#[derive(Clone, Copy)]
struct FieldSpec {
    offset: usize,
    encoding: Encoding,
    scale: f64,
}

/// Scalar fields of the settings record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SettingsField {
    MaxCurrent,
    MaxControllerTemp,
    MaxMotorTemp,
    RudderRange,
    RudderOffset,
    RudderScale,
    RudderNonlinearity,
    MaxSlewSpeed,
    MaxSlewSlow,
    CurrentFactor,
    VoltageFactor,
    CurrentOffset,
    VoltageOffset,
    MinSpeed,
    MaxSpeed,
    Gain,
    RudderBrake,
}

impl SettingsField {
    const fn spec(self) -> FieldSpec {
        use Encoding::*;
        let (offset, encoding, scale) = match self {
            Self::MaxCurrent => (0, U16, 100.0),
            Self::MaxControllerTemp => (2, U16, 100.0),
            Self::MaxMotorTemp => (4, U16, 100.0),
            Self::RudderRange => (6, U8, 2.0),
            Self::RudderOffset => (7, I16, 16.0),
            Self::RudderScale => (9, I16, 8.0),
            Self::RudderNonlinearity => (11, I16, 8.0),
            Self::MaxSlewSpeed => (13, U8, 1.0),
            Self::MaxSlewSlow => (14, U8, 1.0),
            Self::CurrentFactor => (15, U8, 100.0),
            Self::VoltageFactor => (16, U8, 100.0),
            Self::CurrentOffset => (17, I8, 100.0),
            Self::VoltageOffset => (18, I8, 100.0),
            Self::MinSpeed => (19, U8, 1.0),
            Self::MaxSpeed => (20, U8, 1.0),
            Self::Gain => (21, I16, 1000.0),
            Self::RudderBrake => (23, U16, 100.0),
        };
        FieldSpec {
            offset,
            encoding,
            scale,
        }
    }

    /// Byte offset of the field in the record.
    pub(crate) fn offset(self) -> usize {
        self.spec().offset
    }
}

pub(crate) struct SettingsShadow {
    /// Desired record contents.
    local: [u8; RECORD_LEN],
    /// Contents last confirmed read from the device.
    arduino: [u8; RECORD_LEN],
    /// Per byte: `arduino` is known correct and fresh.
    verified: [bool; RECORD_LEN],
    /// Even-offset byte held until its odd partner arrives. Words commit
    /// atomically; a lone even byte whose partner never follows is
    /// discarded.
    pending: Option<(u8, u8)>,
    initial_done: bool,
}

impl Default for SettingsShadow {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsShadow {
    pub fn new() -> Self {
        let mut local = [0u8; RECORD_LEN];
        local[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE.len()].copy_from_slice(SIGNATURE);
        Self {
            local,
            arduino: [0; RECORD_LEN],
            verified: [false; RECORD_LEN],
            pending: None,
            initial_done: false,
        }
    }

    /// Accepts one EEPROM byte report from the device. Bytes arrive in
    /// even/odd pairs forming little-endian words; the pair commits only
    /// when the odd byte immediately follows its own even partner.
    pub fn record_byte(&mut self, addr: u8, val: u8) {
        if addr as usize >= RECORD_LEN {
            return;
        }
        if addr & 1 == 1 {
            if let Some((even, held)) = self.pending.take() {
                if addr == even + 1 {
                    self.commit(even, held);
                    self.commit(addr, val);
                }
            }
        } else {
            self.pending = Some((addr, val));
        }
    }

    fn commit(&mut self, addr: u8, val: u8) {
        self.arduino[addr as usize] = val;
        self.verified[addr as usize] = true;
    }

    /// True exactly once: the first time every byte of the record has been
    /// verified.
    pub fn initial(&mut self) -> bool {
        if self.initial_done || !self.verified.iter().all(|&v| v) {
            return false;
        }
        self.initial_done = true;
        true
    }

    /// Lowest unverified offset and the exclusive end of the contiguous
    /// unverified run starting there, capped to one request's worth.
    pub fn need_read(&self) -> Option<(u8, u8)> {
        let start = self.verified.iter().position(|&v| !v)?;
        let mut end = start;
        while end < RECORD_LEN && !self.verified[end] && end - start < READ_CHUNK {
            end += 1;
        }
        Some((start as u8, end as u8))
    }

    /// Lowest even offset whose word is verified but disagrees between the
    /// desired and confirmed copies. Unread words are never written; they
    /// must be fetched first.
    pub fn need_write(&self) -> Option<u8> {
        (0..RECORD_LEN)
            .step_by(2)
            .find(|&a| {
                self.verified[a]
                    && self.verified[a + 1]
                    && (self.local[a] != self.arduino[a] || self.local[a + 1] != self.arduino[a + 1])
            })
            .map(|a| a as u8)
    }

    /// Whether the device record carries the current format signature.
    pub fn signature_current(&self) -> bool {
        &self.arduino[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE.len()] == SIGNATURE
    }

    /// Reads a field from the confirmed device copy, in physical units.
    pub fn get(&self, field: SettingsField) -> f64 {
        let spec = field.spec();
        let o = spec.offset;
        let raw = match spec.encoding {
            Encoding::U8 => self.arduino[o] as i32,
            Encoding::I8 => self.arduino[o] as i8 as i32,
            Encoding::U16 => u16::from_le_bytes([self.arduino[o], self.arduino[o + 1]]) as i32,
            Encoding::I16 => i16::from_le_bytes([self.arduino[o], self.arduino[o + 1]]) as i32,
        };
        raw as f64 / spec.scale
    }

    /// Stores a field into the desired copy, in physical units. The caller
    /// clamps; values overflowing the field width wrap like the firmware's.
    pub fn set(&mut self, field: SettingsField, value: f64) {
        let spec = field.spec();
        let o = spec.offset;
        let raw = (value * spec.scale).round() as i32;
        match spec.encoding {
            Encoding::U8 => self.local[o] = raw as u8,
            Encoding::I8 => self.local[o] = raw as i8 as u8,
            Encoding::U16 => self.local[o..o + 2].copy_from_slice(&(raw as u16).to_le_bytes()),
            Encoding::I16 => {
                self.local[o..o + 2].copy_from_slice(&(raw as i16).to_le_bytes());
            }
        }
    }

    /// Raw desired byte, as transmitted by the write protocol.
    pub fn local_byte(&self, addr: usize) -> u8 {
        self.local[addr]
    }

    /// Raw desired word at an even offset, little-endian.
    pub fn local_word(&self, addr: usize) -> u16 {
        u16::from_le_bytes([self.local[addr], self.local[addr + 1]])
    }
}
