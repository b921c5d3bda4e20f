//! The capability set a concrete digitizer driver must implement.
//!
//! Talking to an actual vendor SDK (PicoScope or otherwise) is out of scope for this crate; what
//! lives here is the trait boundary that lets the rapid-block and streaming engines stay driver
//! agnostic, plus (test-only) an in-memory driver that implements it.

pub mod sim;

use crate::config::DigitizerConfig;
use crate::error::Result;
use crate::status::ChannelStatus;

/// One block of samples pulled from the driver for rapid-block acquisition.
pub struct RapidBlockData {
    /// `ai_values[channel][sample]`.
    pub ai_values: Vec<Vec<f32>>,
    /// `ai_errors[channel][sample]`.
    pub ai_errors: Vec<Vec<f32>>,
    /// `port_words[port][sample]`.
    pub port_words: Vec<Vec<u8>>,
    /// One status bitfield per enabled analog channel, reported by the driver for this waveform.
    pub status: Vec<ChannelStatus>,
}

/// One poll's worth of samples pulled from the driver for streaming acquisition.
pub struct StreamingData {
    pub ai_values: Vec<Vec<f32>>,
    pub ai_errors: Vec<Vec<f32>>,
    pub port_words: Vec<Vec<u8>>,
    /// Whether each enabled analog channel overflowed during this poll.
    pub overflow: Vec<bool>,
    /// UTC nanosecond timestamp of the first sample in this poll.
    pub local_timestamp_ns: i64,
    /// Number of buffers the driver reports as dropped since the previous poll.
    pub lost_count: u32,
}

/// The interface a hardware (or simulated) digitizer driver exposes to the acquisition engine.
///
/// Every method here corresponds 1:1 to a driver entry point the original C++ block calls
/// directly (`driver_initialize`, `driver_configure`, `driver_arm`, `driver_disarm`,
/// `driver_close`, `driver_poll`, `get_driver_version`, `get_hardware_version`, ...).
pub trait Driver: Send {
    /// Human-readable driver (SDK) version string. Never fails, even before `initialize`.
    fn driver_version(&self) -> String;

    /// Human-readable hardware version string. May be empty before `initialize`.
    fn hardware_version(&self) -> String {
        String::new()
    }

    /// Channel id strings the hardware exposes, e.g. `["A", "B", "C", "D"]`.
    fn ai_channel_ids(&self) -> Vec<String>;

    /// Full-scale input ranges the hardware supports, in volts.
    fn ai_ranges(&self) -> Vec<f64>;

    /// Opens the device and applies a validated configuration. Idempotent after a first success
    /// (§4.B: "may only be called after `initialize` and before `arm`").
    fn initialize(&mut self, config: &DigitizerConfig) -> Result<()>;

    /// Applies channel/trigger configuration to the already-opened device. Called after
    /// `initialize` and before `arm`; distinct from `initialize` because re-`configure`ing
    /// (without reopening the device) is how the original driver applies a changed channel or
    /// trigger setup to hardware that's already open.
    fn configure(&mut self) -> Result<()>;

    /// Arms the driver for the next capture (rapid block) or starts continuous sampling
    /// (streaming).
    fn arm(&mut self) -> Result<()>;

    /// Disarms the driver; safe to call even if not currently armed.
    fn disarm(&mut self) -> Result<()>;

    /// Releases the device. Must tolerate being called more than once or on a never-initialized
    /// driver (§4.F: `close()` is the terminal step of every lifecycle, reachable from any
    /// state).
    fn close(&mut self) -> Result<()>;

    /// Blocking rapid-block only: prepares the driver to transfer the next captured block.
    fn prefetch_block(&mut self, capture_index: usize) -> Result<()>;

    /// Blocking rapid-block only: reads one captured block's worth of samples.
    fn read_rapid_block(&mut self, capture_index: usize) -> Result<RapidBlockData>;

    /// Streaming only: called from the poll loop; returns new samples if any are ready.
    fn poll(&mut self) -> Result<Option<StreamingData>>;
}
