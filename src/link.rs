use log::warn;
use snafu::Snafu;

use crate::{frame, FRAME_LEN, RX_BUF_LEN};

/// Consecutive valid frames required after a desync before frames are
/// trusted again. A lone checksum match on shifted garbage is a 1-in-256
/// coincidence; two in a row at frame stride is not.
const TRUST_STREAK: u8 = 2;

/// Polls without device sync before giving up when nothing was ever decoded
/// (wrong port or dead wiring).
const NO_DATA_POLLS: u32 = 400;

/// Polls without device sync before giving up regardless (persistent noise
/// or protocol mismatch).
const SYNC_FAIL_POLLS: u32 = 1000;

/// Fatal link-health conditions. Either one ends the session; the caller
/// must reopen the channel and start over.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum LinkError {
    #[snafu(display("no data received in {polls} polls without sync (check port and wiring)"))]
    NoData { polls: u32 },
    #[snafu(display("sync not achieved within {polls} polls"))]
    SyncFailed { polls: u32 },
}

/// Extracts valid frames from an arbitrary byte stream.
///
/// The working buffer is a sliding window over a fixed array: invalid data
/// is skipped a byte at a time (guaranteeing resync within one frame
/// length) and the window is compacted before each refill instead of
/// shifting the whole buffer on every discard.
pub struct Deframer {
    buf: [u8; RX_BUF_LEN],
    start: usize,
    end: usize,
    valid_streak: u8,
    reinit_count: u32,
}

impl Default for Deframer {
    fn default() -> Self {
        Self::new()
    }
}

impl Deframer {
    pub const fn new() -> Self {
        Self {
            buf: [0; RX_BUF_LEN],
            start: 0,
            end: 0,
            valid_streak: 0,
            reinit_count: 0,
        }
    }

    /// Bytes buffered but not yet consumed.
    pub fn pending(&self) -> usize {
        self.end - self.start
    }

    /// How often the working buffer was declared corrupt and thrown away.
    /// Diagnostic only; a healthy link never increments this.
    pub fn reinit_count(&self) -> u32 {
        self.reinit_count
    }

    /// Discards the buffer contents. Used when the buffer fills to
    /// capacity without producing a frame.
    pub fn reinitialize(&mut self) {
        warn!("receive buffer full without a frame, reinitializing");
        self.reinit_count += 1;
        self.start = 0;
        self.end = 0;
    }

    /// Appends received bytes. If they would overflow the buffer, the old
    /// contents are corrupt beyond recovery; they are dropped and only the
    /// newest bytes kept.
    pub fn push_bytes(&mut self, data: &[u8]) {
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        if self.end + data.len() > RX_BUF_LEN {
            self.reinitialize();
            let keep = data.len().min(RX_BUF_LEN);
            self.buf[..keep].copy_from_slice(&data[data.len() - keep..]);
            self.end = keep;
            return;
        }
        self.buf[self.end..self.end + data.len()].copy_from_slice(data);
        self.end += data.len();
    }

    /// Extracts the next trusted frame, resynchronizing as needed.
    ///
    /// After any invalid window the first `TRUST_STREAK` valid frames are
    /// consumed silently as debounce; only subsequent frames are returned.
    pub fn next_frame(&mut self) -> Option<(u8, u16)> {
        while self.pending() >= FRAME_LEN {
            let Ok(window) = self.buf[self.start..self.start + FRAME_LEN].try_into() else {
                return None;
            };
            match frame::decode(window) {
                Some(decoded) => {
                    let trusted = self.valid_streak >= TRUST_STREAK;
                    if !trusted {
                        self.valid_streak += 1;
                    }
                    self.start += FRAME_LEN;
                    if trusted {
                        return Some(decoded);
                    }
                }
                None => {
                    self.valid_streak = 0;
                    self.start += 1;
                }
            }
        }
        None
    }
}

/// Escalating failure detection for the bootstrap phase, driven by the
/// caller's poll cadence rather than wall time.
#[derive(Default)]
pub struct LinkHealth {
    nosync_count: u32,
    nosync_data: bool,
}

impl LinkHealth {
    pub const fn new() -> Self {
        Self {
            nosync_count: 0,
            nosync_data: false,
        }
    }

    /// Accounts one poll. While the device reports sync both counters stay
    /// at rest; without it, failure is reported at exactly the
    /// `NO_DATA_POLLS`th poll if nothing was ever decoded, and at the
    /// `SYNC_FAIL_POLLS`th regardless.
    pub fn tick(&mut self, device_synced: bool) -> Result<(), LinkError> {
        if device_synced {
            self.nosync_count = 0;
            self.nosync_data = false;
            return Ok(());
        }
        self.nosync_count += 1;
        if self.nosync_count >= NO_DATA_POLLS && !self.nosync_data {
            return NoDataSnafu {
                polls: self.nosync_count,
            }
            .fail();
        }
        if self.nosync_count >= SYNC_FAIL_POLLS {
            return SyncFailedSnafu {
                polls: self.nosync_count,
            }
            .fail();
        }
        Ok(())
    }

    /// Marks that frames were decoded while unsynced, disarming the
    /// no-data escalation.
    pub fn observe_data(&mut self) {
        self.nosync_data = true;
    }
}
