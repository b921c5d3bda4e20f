//! Matches trigger tags against out-of-band white-rabbit timing events to replace each trigger's
//! local clock timestamp with the timing system's.
//!
//! Translated from the original's `time_realignment_cpu::fill_wr_stamp`. Timing events arrive in
//! FIFO order relative to the trigger tags they belong to, but not necessarily promptly, so a
//! small ring buffers events that have arrived ahead of their trigger and tracks how long a
//! trigger has been waiting for one that hasn't.

use std::sync::Mutex;

use arc_swap::ArcSwap;

use crate::status::ChannelStatus;
use crate::tags::{TimingEvent, TriggerTag};

/// Capacity of the pending-event ring, matching the original's fixed 10-event buffer.
const WR_RING_CAPACITY: usize = 10;

struct EventRing {
    buf: [Option<TimingEvent>; WR_RING_CAPACITY],
    write_iter: usize,
    read_iter: usize,
    not_found_since_ns: Option<i64>,
}

impl EventRing {
    fn new() -> Self {
        const NONE: Option<TimingEvent> = None;
        Self {
            buf: [NONE; WR_RING_CAPACITY],
            write_iter: 0,
            read_iter: 0,
            not_found_since_ns: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.write_iter == self.read_iter
    }
}

/// Realigns trigger timestamps against white-rabbit timing events.
///
/// `matching_tolerance_ns`/`max_buffer_time_ns` are live-tunable via
/// [`RealignmentStage::set_matching_tolerance_ns`]/[`RealignmentStage::set_max_buffer_time_ns`],
/// mirroring the original block's `on_parameter_change`-settable parameters.
pub struct RealignmentStage {
    matching_tolerance_ns: ArcSwap<i64>,
    max_buffer_time_ns: ArcSwap<i64>,
    ring: Mutex<EventRing>,
}

impl RealignmentStage {
    pub fn new(matching_tolerance_ns: i64, max_buffer_time_ns: i64) -> Self {
        Self {
            matching_tolerance_ns: ArcSwap::from_pointee(matching_tolerance_ns),
            max_buffer_time_ns: ArcSwap::from_pointee(max_buffer_time_ns),
            ring: Mutex::new(EventRing::new()),
        }
    }

    pub fn set_matching_tolerance_ns(&self, value: i64) {
        self.matching_tolerance_ns.store(std::sync::Arc::new(value));
    }

    pub fn set_max_buffer_time_ns(&self, value: i64) {
        self.max_buffer_time_ns.store(std::sync::Arc::new(value));
    }

    /// Records a timing event that arrived ahead of its matching trigger tag. Returns `false`
    /// (and logs) if the ring is full, meaning triggers are arriving too slowly relative to
    /// timing events to keep up.
    pub fn add_timing_event(&self, event: TimingEvent) -> bool {
        let mut ring = self.ring.lock().unwrap();
        let idx = ring.write_iter;
        ring.buf[idx] = Some(event);
        ring.write_iter = (ring.write_iter + 1) % WR_RING_CAPACITY;
        if ring.write_iter == ring.read_iter {
            log::error!("timing event ring full: too few trigger tags arriving to drain it");
            return false;
        }
        true
    }

    /// Attempts to realign `trigger`'s timestamp using a buffered timing event.
    ///
    /// Returns `true` if the trigger tag should be forwarded now (either realigned, or timed
    /// out waiting and forwarded with [`ChannelStatus::WR_TIMEOUT`] set); returns `false` if the
    /// trigger should be held and retried once more timing events have arrived.
    pub fn fill_wr_stamp(&self, trigger: &mut TriggerTag, now_ns: i64) -> bool {
        let tolerance_ns = **self.matching_tolerance_ns.load();
        let max_buffer_time_ns = **self.max_buffer_time_ns.load();
        let mut ring = self.ring.lock().unwrap();

        if ring.is_empty() {
            if ring.not_found_since_ns.is_none() {
                ring.not_found_since_ns = Some(now_ns);
            }
            let since = ring.not_found_since_ns.unwrap();
            if (now_ns - since).abs() > max_buffer_time_ns {
                ring.not_found_since_ns = None;
                log::error!("no white-rabbit event found for trigger tag within the buffer window; forwarding unaligned");
                trigger.status |= ChannelStatus::WR_TIMEOUT;
                return true;
            }
            return false;
        }

        loop {
            let event = ring.buf[ring.read_iter].as_ref().expect("non-empty ring slot must hold an event");
            let delta_t = (trigger.timestamp_ns - event.wr_trigger_stamp_utc).abs();
            if delta_t > tolerance_ns {
                log::warn!("white-rabbit timestamp out of matching tolerance by {delta_t}ns, ignoring");
                trigger.status |= ChannelStatus::WR_TIMEOUT;
                ring.read_iter = (ring.read_iter + 1) % WR_RING_CAPACITY;
                if ring.is_empty() {
                    return true;
                }
            } else {
                ring.not_found_since_ns = None;
                trigger.timestamp_ns = event.wr_trigger_stamp;
                ring.read_iter = (ring.read_iter + 1) % WR_RING_CAPACITY;
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn trigger(ts: i64) -> TriggerTag {
        TriggerTag {
            name: "A".into(),
            timestamp_ns: ts,
            offset_ns: 0,
            stream_offset: 0,
            status: ChannelStatus::empty(),
            pre_samples: 0,
            post_samples: 0,
        }
    }

    #[test]
    fn matches_within_tolerance_and_replaces_timestamp() {
        let stage = RealignmentStage::new(1_000_000, 1_000_000_000);
        stage.add_timing_event(TimingEvent {
            event_id: "a".into(),
            wr_trigger_stamp: 555,
            wr_trigger_stamp_utc: 1_000_000_000,
        });
        let mut tag = trigger(1_000_000_500);
        assert!(stage.fill_wr_stamp(&mut tag, 2_000_000_000));
        assert_eq!(tag.timestamp_ns, 555);
        assert!(!tag.status.contains(ChannelStatus::WR_TIMEOUT));
    }

    #[test]
    fn out_of_tolerance_event_is_discarded_and_flagged() {
        let stage = RealignmentStage::new(1_000, 1_000_000_000);
        stage.add_timing_event(TimingEvent {
            event_id: "a".into(),
            wr_trigger_stamp: 1,
            wr_trigger_stamp_utc: 0,
        });
        let mut tag = trigger(10_000_000);
        assert!(stage.fill_wr_stamp(&mut tag, 2_000_000_000));
        assert!(tag.status.contains(ChannelStatus::WR_TIMEOUT));
        // ran out of events trying to match, so the original timestamp is untouched
        assert_eq!(tag.timestamp_ns, 10_000_000);
    }

    #[test]
    fn no_event_yet_holds_the_trigger_until_timeout() {
        let stage = RealignmentStage::new(1_000, 500);
        let mut tag = trigger(0);
        assert!(!stage.fill_wr_stamp(&mut tag, 0));
        assert!(!stage.fill_wr_stamp(&mut tag, 100));
        assert!(stage.fill_wr_stamp(&mut tag, 1000));
        assert!(tag.status.contains(ChannelStatus::WR_TIMEOUT));
    }

    #[test]
    fn tolerance_is_live_tunable() {
        let stage = RealignmentStage::new(10, 1_000_000_000);
        stage.set_matching_tolerance_ns(1_000_000);
        stage.add_timing_event(TimingEvent {
            event_id: "a".into(),
            wr_trigger_stamp: 1,
            wr_trigger_stamp_utc: 0,
        });
        let mut tag = trigger(500_000);
        assert!(stage.fill_wr_stamp(&mut tag, 1_000_000));
        assert_eq!(tag.timestamp_ns, 1);
    }

    #[test]
    fn ring_reports_full_once_all_slots_are_unread() {
        let stage = RealignmentStage::new(1_000, 1_000_000_000);
        for i in 0..WR_RING_CAPACITY {
            let ok = stage.add_timing_event(TimingEvent {
                event_id: format!("e{i}"),
                wr_trigger_stamp: i as i64,
                wr_trigger_stamp_utc: i as i64,
            });
            if i < WR_RING_CAPACITY - 1 {
                assert!(ok);
            } else {
                assert!(!ok);
            }
        }
    }
}
