//! Per-channel status bits and the bounded error log.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::ErrorKind;

bitflags::bitflags! {
    /// Condition bits attached to each channel/port on every emitted chunk.
    ///
    /// These are OR-able: a chunk can simultaneously have overflowed and be missing a white
    /// rabbit timestamp, so this is a bitfield rather than an enum.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChannelStatus: u32 {
        /// The ADC input railed during this chunk.
        const OVERFLOW = 0x01;
        /// The realignment stage could not confidently realign this chunk's trigger tag.
        const REALIGNMENT_ERROR = 0x02;
        /// One or more chunks were dropped before this one because the pool ran dry.
        const BUFFERS_LOST = 0x04;
        /// No matching white rabbit timing event arrived within the configured buffer window.
        const WR_TIMEOUT = 0x08;
    }
}

/// A single entry in the bounded error log.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    /// Monotonic nanosecond timestamp of when the error was recorded.
    pub timestamp_ns: u64,
    /// What went wrong.
    pub kind: ErrorRecordKind,
}

/// A lightweight, cloneable summary of an [`ErrorKind`] suitable for retention in the log.
///
/// `ErrorKind` itself isn't `Clone` (it can carry a driver-supplied `String`), so the log stores
/// this instead, matching the original's `error_info_t`, which records a numeric code rather
/// than the full error object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorRecordKind {
    Stopped,
    Interrupted,
    Watchdog,
    DriverError(String),
    InvalidConfig(String),
    InvalidState(String),
    OutOfRange(String),
    BuffersLost(u32),
}

impl From<&ErrorKind> for ErrorRecordKind {
    fn from(e: &ErrorKind) -> Self {
        match e {
            ErrorKind::Stopped => ErrorRecordKind::Stopped,
            ErrorKind::Interrupted => ErrorRecordKind::Interrupted,
            ErrorKind::Watchdog => ErrorRecordKind::Watchdog,
            ErrorKind::DriverError { message } => ErrorRecordKind::DriverError(message.clone()),
            ErrorKind::InvalidConfig { message } => ErrorRecordKind::InvalidConfig(message.clone()),
            ErrorKind::InvalidState { message } => ErrorRecordKind::InvalidState(message.clone()),
            ErrorKind::OutOfRange { message } => ErrorRecordKind::OutOfRange(message.clone()),
            ErrorKind::BuffersLost { count } => ErrorRecordKind::BuffersLost(*count),
        }
    }
}

const ERROR_LOG_CAPACITY: usize = 128;

/// A bounded, thread-safe log of recent errors, overwriting the oldest entry once full.
pub struct ErrorLog {
    records: Mutex<VecDeque<ErrorRecord>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(ERROR_LOG_CAPACITY)),
        }
    }

    /// Appends an error, evicting the oldest record if the log is full.
    pub fn push(&self, timestamp: Duration, kind: &ErrorKind) {
        let mut records = self.records.lock().unwrap();
        if records.len() == ERROR_LOG_CAPACITY {
            records.pop_front();
        }
        records.push_back(ErrorRecord {
            timestamp_ns: timestamp.as_nanos() as u64,
            kind: kind.into(),
        });
    }

    /// Returns a snapshot of the log, oldest first, and clears it.
    pub fn drain(&self) -> Vec<ErrorRecord> {
        let mut records = self.records.lock().unwrap();
        records.drain(..).collect()
    }

    /// Returns the current number of retained records.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn status_bits_match_original_driver_values() {
        assert_eq!(ChannelStatus::OVERFLOW.bits(), 0x01);
        assert_eq!(ChannelStatus::REALIGNMENT_ERROR.bits(), 0x02);
        assert_eq!(ChannelStatus::BUFFERS_LOST.bits(), 0x04);
        assert_eq!(ChannelStatus::WR_TIMEOUT.bits(), 0x08);
    }

    #[test]
    fn status_bits_are_combinable() {
        let s = ChannelStatus::OVERFLOW | ChannelStatus::WR_TIMEOUT;
        assert!(s.contains(ChannelStatus::OVERFLOW));
        assert!(s.contains(ChannelStatus::WR_TIMEOUT));
        assert!(!s.contains(ChannelStatus::REALIGNMENT_ERROR));
    }

    #[test]
    fn error_log_evicts_oldest_once_full() {
        let log = ErrorLog::new();
        for i in 0..ERROR_LOG_CAPACITY + 10 {
            log.push(Duration::from_nanos(i as u64), &ErrorKind::Watchdog);
        }
        assert_eq!(log.len(), ERROR_LOG_CAPACITY);
        let drained = log.drain();
        assert_eq!(drained.first().unwrap().timestamp_ns, 10);
        assert!(log.is_empty());
    }
}
