//! Epoch clock
//!
//! Pure mapping from Unix time to week and epoch boundaries. Weeks and
//! epochs are both anchored at the Unix epoch, and an epoch is a whole
//! number of weeks, so every epoch boundary is also a week boundary.
//!
//! ```text
//!   week:   |  w0  |  w1  |  w2  |  w3  |  w4  |  w5  |
//!   epoch:  |     e0      |     e1      |     e2      |
//! ```

use crate::constants::{EPOCH_DURATION, WEEK};

/// Start of the week containing `timestamp`
pub fn week_start(timestamp: u64) -> u64 {
    timestamp - timestamp % WEEK
}

/// Whether `timestamp` falls exactly on a week boundary
pub fn is_week_aligned(timestamp: u64) -> bool {
    timestamp % WEEK == 0
}

/// Epoch number containing `timestamp`
pub fn epoch_at(timestamp: u64) -> u64 {
    timestamp / EPOCH_DURATION
}

/// First second of `epoch`
pub fn epoch_start(epoch: u64) -> u64 {
    epoch * EPOCH_DURATION
}

/// Exclusive end of `epoch`, equal to the start of the next one
pub fn epoch_end(epoch: u64) -> u64 {
    (epoch + 1) * EPOCH_DURATION
}

/// Whether `epoch` has fully elapsed at `timestamp`
pub fn epoch_has_ended(epoch: u64, timestamp: u64) -> bool {
    timestamp >= epoch_end(epoch)
}

/// Summary of the clock at one instant
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockReading {
    pub timestamp: u64,
    pub week_start: u64,
    pub epoch: u64,
    pub epoch_start: u64,
    pub epoch_end: u64,
}

impl ClockReading {
    pub fn at(timestamp: u64) -> Self {
        let epoch = epoch_at(timestamp);
        Self {
            timestamp,
            week_start: week_start(timestamp),
            epoch,
            epoch_start: epoch_start(epoch),
            epoch_end: epoch_end(epoch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_week_alignment() {
        assert_eq!(week_start(0), 0);
        assert_eq!(week_start(WEEK - 1), 0);
        assert_eq!(week_start(WEEK), WEEK);
        assert!(is_week_aligned(3 * WEEK));
        assert!(!is_week_aligned(3 * WEEK + 1));
    }

    #[test]
    fn test_epoch_boundaries() {
        assert_eq!(epoch_at(0), 0);
        assert_eq!(epoch_at(EPOCH_DURATION - 1), 0);
        assert_eq!(epoch_at(EPOCH_DURATION), 1);
        assert_eq!(epoch_end(0), epoch_start(1));
        assert!(is_week_aligned(epoch_end(41)));
    }

    #[test]
    fn test_epoch_has_ended() {
        assert!(!epoch_has_ended(2, epoch_end(2) - 1));
        assert!(epoch_has_ended(2, epoch_end(2)));
    }

    #[test]
    fn test_clock_reading() {
        let ts = epoch_start(10) + WEEK + 5;
        let reading = ClockReading::at(ts);
        assert_eq!(reading.epoch, 10);
        assert_eq!(reading.week_start, epoch_start(10) + WEEK);
        assert_eq!(reading.epoch_end, epoch_start(11));
    }
}
