//! Host-side driver for the motorized rudder actuator ("servo") of a marine
//! autopilot, spoken to over a half-duplex serial link.
//!
//! The device exchanges fixed 4-byte checksummed frames carrying a code byte
//! and a 16-bit value. This crate provides the framing/resync engine, the
//! telemetry decode, and an eventually-consistent mirror of the device's
//! persistent settings record, all driven from a single poll loop.
//!
//! # Usage
//! ```rust
//! use std::io::Cursor;
//! use servo_link::{ServoParams, ServoSession};
//!
//! // Any `Read + Write` byte channel works; a real deployment hands in an
//! // opened serial port.
//! let channel = Cursor::new(Vec::new());
//! let mut servo = ServoSession::new(channel);
//!
//! // Limits and calibration must be set once before any parameter traffic
//! // is scheduled.
//! servo.params(&ServoParams::default());
//!
//! servo.command(0.0); // stop
//! let updates = servo.poll().unwrap();
//! assert!(updates.is_empty()); // nothing on the wire yet
//! ```

mod frame;
pub use frame::*;

mod link;
pub use link::*;

mod telemetry;
pub use telemetry::*;

mod eeprom;

mod servo;
pub use servo::*;

/// Every exchange in either direction is exactly this many bytes.
pub const FRAME_LEN: usize = 4;

/// Capacity of the receive working buffer.
pub const RX_BUF_LEN: usize = 1024;

/// Checksum used by the device firmware: table-driven, polynomial 0x31,
/// initial value 0xFF, no reflection. This is the catalog CRC-8/NRSC-5
/// algorithm; interoperability depends on it bit-for-bit.
pub(crate) const CRC8: crc::Crc<u8> = crc::Crc::<u8>::new(&crc::CRC_8_NRSC_5);
