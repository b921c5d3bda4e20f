//! The tag types attached to output samples, and the white-rabbit timing events they are
//! realigned against.

use crate::status::ChannelStatus;

/// A trigger tag, attached to the sample at which a trigger fired (or, in rapid block mode, to
/// the first sample of the pre-trigger region).
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerTag {
    /// Name of the trigger source this tag originated from (e.g. the channel id, `"DI"`, or a
    /// name supplied by an upstream timing message).
    pub name: String,
    /// UTC nanosecond timestamp of the trigger, realigned against a white rabbit event if one
    /// was available within tolerance.
    pub timestamp_ns: i64,
    /// Nanosecond offset from `timestamp_ns` to the start of the capture window this tag
    /// describes (e.g. the pre-trigger duration in rapid block mode).
    pub offset_ns: i64,
    /// Absolute sample position, counted from the start of the run, this tag is attached to.
    pub stream_offset: u64,
    pub status: ChannelStatus,
    /// Pre-trigger sample count after downsampling.
    pub pre_samples: u32,
    /// Post-trigger sample count after downsampling.
    pub post_samples: u32,
}

/// Per-channel/port acquisition metadata attached once per emitted chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcqInfoTag {
    /// Local timestamp of the chunk (or waveform) this tag describes.
    pub timestamp_ns: i64,
    /// Seconds per sample after downsampling.
    pub timebase_s: f64,
    /// Requested inter-trigger delay, in seconds (driver-specific; `0.0` when not applicable).
    pub user_delay_s: f64,
    /// Delay actually achieved by the driver, in seconds.
    pub actual_delay_s: f64,
    pub status: ChannelStatus,
}

/// A one-time tag describing the sample period in effect for the stream, published before the
/// first data tag on every output port.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimebaseInfoTag {
    /// Seconds per output sample, after downsampling.
    pub seconds_per_sample: f64,
}

/// A white-rabbit timing event, supplied out-of-band (e.g. by a timing receiver block) and
/// matched against trigger tags by the realignment stage.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingEvent {
    pub event_id: String,
    /// The timing-domain trigger timestamp, in the precision terms of the timing system.
    pub wr_trigger_stamp: i64,
    /// The same event's UTC nanosecond timestamp, used to match it against a trigger tag's
    /// (unrealigned) timestamp.
    pub wr_trigger_stamp_utc: i64,
}

/// An inline timing message, delivered through the engine's timing input port (see
/// [`crate::timing_queue`]) and consumed directly by the rapid-block and streaming engines to
/// stamp the trigger they're about to emit, ahead of any realignment-stage correction.
///
/// Mirrors the message shape of §6: a map of `trigger_name`/`trigger_time`/`trigger_offset`,
/// with `trigger_offset` already converted from seconds to nanoseconds at ingestion.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingMessage {
    pub name: String,
    pub trigger_time_ns: i64,
    pub trigger_offset_ns: i64,
}
