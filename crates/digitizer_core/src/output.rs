//! The contract the engine needs from whatever dataflow runtime schedules it.
//!
//! Modeled as a trait rather than a concrete type so the engine doesn't need to know whether
//! it's embedded in a graph scheduler, driven directly by a test harness, or something else
//! entirely, the same way the teacher's audio engine doesn't hardcode who drives its worker
//! pool.

use crate::tags::{AcqInfoTag, TimebaseInfoTag, TriggerTag};

/// A tag emitted alongside produced samples.
#[derive(Debug, Clone, PartialEq)]
pub enum Tag {
    Trigger(TriggerTag),
    AcqInfo(AcqInfoTag),
    TimebaseInfo(TimebaseInfoTag),
}

/// The two operations the engine needs performed on its behalf once it has produced data.
pub trait SchedulerOutput {
    /// Declares that `n` items were produced on every output port this work step touched.
    fn produce_each(&mut self, n: usize);

    /// Attaches `tag` to the next-to-be-produced item on `port`.
    fn add_tag(&mut self, port: usize, tag: Tag);
}

/// A [`SchedulerOutput`] that records calls instead of acting on them, for tests and examples.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecordingOutput {
    pub produced: Vec<usize>,
    pub tags: Vec<(usize, Tag)>,
}

impl SchedulerOutput for RecordingOutput {
    fn produce_each(&mut self, n: usize) {
        self.produced.push(n);
    }

    fn add_tag(&mut self, port: usize, tag: Tag) {
        self.tags.push((port, tag));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::ChannelStatus;
    use pretty_assertions::assert_eq;

    #[test]
    fn recording_output_captures_calls_in_order() {
        let mut out = RecordingOutput::default();
        out.add_tag(
            0,
            Tag::Trigger(TriggerTag {
                name: "A".into(),
                timestamp_ns: 5,
                offset_ns: 0,
                stream_offset: 0,
                status: ChannelStatus::empty(),
                pre_samples: 0,
                post_samples: 0,
            }),
        );
        out.produce_each(128);
        assert_eq!(out.produced, vec![128]);
        assert_eq!(out.tags.len(), 1);
    }
}
